use super::{Ciphertext, HomomorphicCrypto, Plaintext, PublicParameters};
use super::{NO_CRYPTO_PREFIX, PLAINTEXT_BITS};
use crate::errors::{PirError, Result};
use crate::utils::format::{bytes_to_coeffs, coeffs_to_bytes};
use crate::utils::ring::*;

/// Cleartext engine: a "ciphertext" is the single scaled polynomial
/// `delta * m`. It shares the encoding and absorption arithmetic of
/// `RingLwe`, so it measures the cost of the PIR orchestration alone.
/// It offers no privacy at all.
#[derive(Clone, Debug)]
pub struct NoCryptography {
  poly_degree: usize,
}

impl NoCryptography {
  pub fn new(poly_degree: usize) -> Self {
    Self { poly_degree }
  }
}

impl HomomorphicCrypto for NoCryptography {
  fn public_parameters(&self) -> PublicParameters {
    PublicParameters {
      crypto_name: format!("{}:{}", NO_CRYPTO_PREFIX, self.poly_degree),
      poly_degree: self.poly_degree(),
      moduli_count: self.moduli_count(),
      ciphertext_bitsize: self.ciphertext_bitsize(),
      absorption_bitsize: self.absorption_bitsize(0),
    }
  }

  fn ciphertext_bitsize(&self) -> u64 {
    self.poly_degree as u64 * 64
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
    let mut words = vec![0u64; self.poly_degree];
    words[0] = scale_up(value, PLAINTEXT_BITS);
    Ok(Ciphertext(words))
  }

  fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
    if ciphertext.0.len() != self.poly_degree {
      return Err(PirError::unexpected_size(
        self.poly_degree * 8,
        ciphertext.0.len() * 8,
      ));
    }
    let coeffs: Vec<u64> = ciphertext
      .0
      .iter()
      .map(|&c| round_down(c, PLAINTEXT_BITS))
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
    Ciphertext(vec![0u64; self.poly_degree])
  }

  fn mul_acc(
    &self,
    acc: &mut Ciphertext,
    ciphertext: &Ciphertext,
    plaintext: &Plaintext,
  ) {
    negacyclic_mul_acc(&mut acc.0, &ciphertext.0, &plaintext.0);
  }
}
