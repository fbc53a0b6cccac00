use super::{Ciphertext, HomomorphicCrypto, Plaintext, PublicParameters};
use super::{PLAINTEXT_BITS, RLWE_PREFIX, SUPPORTED_MODULUS_BITS};
use crate::errors::{PirError, Result};
use crate::utils::format::{bytes_to_coeffs, coeffs_to_bytes};
use crate::utils::ring::*;
use crate::utils::sampling::*;

/// Secret-key Ring-LWE over `Z_{2^64}[X] / (X^N + 1)`.
///
/// A ciphertext is the pair `(a, b = a*s + e + delta*m)` stored as `a`
/// followed by `b`, with `s` and `e` ternary and `delta = 2^(64 - 16)`.
/// Multiplying by a plaintext polynomial and summing keeps the noise
/// bounded by `n * N * 2^16`, far below `delta / 2` for every degree we
/// accept.
#[derive(Clone)]
pub struct RingLwe {
  poly_degree: usize,
  secret: Option<Vec<u64>>,
}

impl std::fmt::Debug for RingLwe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RingLwe")
      .field("poly_degree", &self.poly_degree)
      .field("has_secret", &self.secret.is_some())
      .finish()
  }
}

impl RingLwe {
  pub fn generate_keys(poly_degree: usize) -> Self {
    Self {
      poly_degree,
      secret: Some(random_ternary_vector(poly_degree)),
    }
  }

  pub fn keyless(poly_degree: usize) -> Self {
    Self {
      poly_degree,
      secret: None,
    }
  }

  fn secret(&self, operation: &'static str) -> Result<&[u64]> {
    self
      .secret
      .as_deref()
      .ok_or(PirError::MissingSecretKey(operation))
  }

  fn check_len(&self, ciphertext: &Ciphertext) -> Result<()> {
    let expected = 2 * self.poly_degree;
    if ciphertext.0.len() != expected {
      return Err(PirError::unexpected_size(expected * 8, ciphertext.0.len() * 8));
    }
    Ok(())
  }
}

impl HomomorphicCrypto for RingLwe {
  fn public_parameters(&self) -> PublicParameters {
    PublicParameters {
      crypto_name: format!(
        "{}:{}:{}",
        RLWE_PREFIX, self.poly_degree, SUPPORTED_MODULUS_BITS
      ),
      poly_degree: self.poly_degree(),
      moduli_count: self.moduli_count(),
      ciphertext_bitsize: self.ciphertext_bitsize(),
      absorption_bitsize: self.absorption_bitsize(0),
    }
  }

  fn ciphertext_bitsize(&self) -> u64 {
    2 * self.poly_degree as u64 * SUPPORTED_MODULUS_BITS
  }

  fn absorption_bitsize(&self, _stream_index: u64) -> u64 {
    self.poly_degree as u64 * PLAINTEXT_BITS as u64
  }

  fn poly_degree(&self) -> u64 {
    self.poly_degree as u64
  }

  fn moduli_count(&self) -> u64 {
    1
  }

  fn encrypt(&self, value: u64) -> Result<Ciphertext> {
    let s = self.secret("encrypt")?;
    let n = self.poly_degree;
    let a = random_uniform_vector(n);
    let mut b = negacyclic_mul(&a, s);
    add_assign(&mut b, &random_ternary_vector(n));
    b[0] = b[0].wrapping_add(scale_up(value, PLAINTEXT_BITS));

    let mut words = a;
    words.extend(b);
    Ok(Ciphertext(words))
  }

  fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
    let s = self.secret("decrypt")?;
    self.check_len(ciphertext)?;
    let (a, b) = ciphertext.0.split_at(self.poly_degree);
    let mut phase = b.to_vec();
    sub_assign(&mut phase, &negacyclic_mul(a, s));
    let coeffs: Vec<u64> = phase
      .into_iter()
      .map(|c| round_down(c, PLAINTEXT_BITS))
      .collect();
    Ok(coeffs_to_bytes(
      &coeffs,
      PLAINTEXT_BITS as usize,
      (self.absorption_bitsize(0) / 8) as usize,
    ))
  }

  fn encode(&self, chunk: &[u8]) -> Result<Plaintext> {
    Ok(Plaintext(bytes_to_coeffs(
      chunk,
      PLAINTEXT_BITS as usize,
      self.poly_degree,
    )?))
  }

  fn zero_ciphertext(&self) -> Ciphertext {
    Ciphertext(vec![0u64; 2 * self.poly_degree])
  }

  fn mul_acc(
    &self,
    acc: &mut Ciphertext,
    ciphertext: &Ciphertext,
    plaintext: &Plaintext,
  ) {
    let n = self.poly_degree;
    let (acc_a, acc_b) = acc.0.split_at_mut(n);
    let (a, b) = ciphertext.0.split_at(n);
    negacyclic_mul_acc(acc_a, a, &plaintext.0);
    negacyclic_mul_acc(acc_b, b, &plaintext.0);
  }
}
