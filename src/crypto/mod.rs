//! Homomorphic crypto engines and the factory that selects them by name.
//!
//! The PIR pipeline only sees the `HomomorphicCrypto` capability: sizes used
//! for the chunk arithmetic, plus the handful of operations needed to build
//! queries, fold the database and decrypt replies.

mod cleartext;
mod rlwe;

use std::fmt;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::errors::{PirError, Result};
use crate::params::ParameterSet;
use crate::utils::arith::ceil_div;
use crate::utils::format::{bytes_to_words_le, words_to_bytes_le};

pub use cleartext::NoCryptography;
pub use rlwe::RingLwe;

/// Bits of plaintext carried by each polynomial coefficient
pub const PLAINTEXT_BITS: u32 = 16;

const RLWE_PREFIX: &str = "RLWE";
const NO_CRYPTO_PREFIX: &str = "NoCryptography";
const SUPPORTED_MODULUS_BITS: u64 = 64;
const MIN_POLY_DEGREE: u64 = 64;
const MAX_POLY_DEGREE: u64 = 8192;

lazy_static! {
  static ref AVAILABLE_CRYPTO_PARAMS: Vec<String> = {
    let degrees = [256u64, 512, 1024, 2048, 4096];
    let mut names: Vec<String> = degrees
      .iter()
      .map(|d| format!("{}:{}:{}", RLWE_PREFIX, d, SUPPORTED_MODULUS_BITS))
      .collect();
    names.extend(degrees.iter().map(|d| format!("{}:{}", NO_CRYPTO_PREFIX, d)));
    names
  };
}

/// An opaque ciphertext, stored as little-endian 64-bit words. Its layout is
/// private to the engine that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext(pub(crate) Vec<u64>);
impl Ciphertext {
  pub fn to_bytes(&self) -> Vec<u8> {
    words_to_bytes_le(&self.0)
  }

  pub fn as_words(&self) -> &[u64] {
    &self.0
  }
}

/// A database chunk encoded for the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plaintext(pub(crate) Vec<u64>);

/// The capability the PIR pipeline consumes. Implementations must keep
/// `absorption_bitsize` and `ciphertext_bitsize` stable for the lifetime of
/// the engine, both sides of the protocol derive chunk counts from them.
pub trait HomomorphicCrypto: Send + Sync + fmt::Debug {
  /// Parameters a server needs to rebuild a keyless twin of this engine
  fn public_parameters(&self) -> PublicParameters;

  fn ciphertext_bitsize(&self) -> u64;

  /// Maximum plaintext bits a single ciphertext absorbs for `stream_index`
  fn absorption_bitsize(&self, stream_index: u64) -> u64;

  fn poly_degree(&self) -> u64;

  fn moduli_count(&self) -> u64;

  /// Encrypts a small selector value
  fn encrypt(&self, value: u64) -> Result<Ciphertext>;

  /// Decrypts a ciphertext into exactly `absorption_bitsize(0) / 8` bytes
  fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>>;

  /// Encodes at most `absorption_bitsize(0) / 8` bytes
  fn encode(&self, chunk: &[u8]) -> Result<Plaintext>;

  fn zero_ciphertext(&self) -> Ciphertext;

  /// `acc += ciphertext * plaintext`
  fn mul_acc(
    &self,
    acc: &mut Ciphertext,
    ciphertext: &Ciphertext,
    plaintext: &Plaintext,
  );

  fn deserialize(&self, bytes: &[u8]) -> Result<Ciphertext> {
    let expected = (self.ciphertext_bitsize() / 8) as usize;
    if bytes.len() != expected {
      return Err(PirError::unexpected_size(expected, bytes.len()));
    }
    Ok(Ciphertext(bytes_to_words_le(bytes)?))
  }
}

/// Everything about an engine that is safe to hand to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicParameters {
  pub crypto_name: String,
  pub poly_degree: u64,
  pub moduli_count: u64,
  pub ciphertext_bitsize: u64,
  pub absorption_bitsize: u64,
}
impl PublicParameters {
  /// Load params from a JSON file
  pub fn load(params_path: &str) -> Result<Self> {
    let reader = BufReader::new(fs::File::open(params_path)?);
    Ok(serde_json::from_reader(reader)?)
  }

  /// Writes the params struct as JSON to file
  pub fn write_to_file(&self, path: &str) -> Result<()> {
    Ok(serde_json::to_writer(&fs::File::create(path)?, self)?)
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    Ok(bincode::serialize(self)?)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    Ok(bincode::deserialize(bytes)?)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CryptoKind {
  Rlwe { poly_degree: u64 },
  Cleartext { poly_degree: u64 },
}

fn parse_poly_degree(name: &str, field: Option<&str>) -> Result<u64> {
  let degree: u64 = field
    .and_then(|f| f.parse().ok())
    .ok_or_else(|| PirError::UnknownCrypto(name.to_string()))?;
  if !degree.is_power_of_two()
    || !(MIN_POLY_DEGREE..=MAX_POLY_DEGREE).contains(&degree)
  {
    return Err(PirError::UnknownCrypto(name.to_string()));
  }
  Ok(degree)
}

fn parse_crypto_name(name: &str) -> Result<CryptoKind> {
  let mut fields = name.split(':');
  match fields.next() {
    Some(RLWE_PREFIX) => {
      let poly_degree = parse_poly_degree(name, fields.next())?;
      let modulus_bits: Option<u64> =
        fields.next().and_then(|f| f.parse().ok());
      if modulus_bits != Some(SUPPORTED_MODULUS_BITS) || fields.next().is_some()
      {
        return Err(PirError::UnknownCrypto(name.to_string()));
      }
      Ok(CryptoKind::Rlwe { poly_degree })
    }
    Some(NO_CRYPTO_PREFIX) => {
      let poly_degree = parse_poly_degree(name, fields.next())?;
      if fields.next().is_some() {
        return Err(PirError::UnknownCrypto(name.to_string()));
      }
      Ok(CryptoKind::Cleartext { poly_degree })
    }
    _ => Err(PirError::UnknownCrypto(name.to_string())),
  }
}

/// Factory for the bundled crypto engines.
pub struct CryptoProvider;
impl CryptoProvider {
  /// Builds the engine named `crypto_name` with freshly generated keys.
  /// Names look like `RLWE:1024:64` or `NoCryptography:1024`.
  pub fn get_crypto_method(
    crypto_name: &str,
  ) -> Result<Arc<dyn HomomorphicCrypto>> {
    let crypto: Arc<dyn HomomorphicCrypto> =
      match parse_crypto_name(crypto_name)? {
        CryptoKind::Rlwe { poly_degree } => {
          Arc::new(RingLwe::generate_keys(poly_degree as usize))
        }
        CryptoKind::Cleartext { poly_degree } => {
          Arc::new(NoCryptography::new(poly_degree as usize))
        }
      };
    tracing::debug!(crypto_name, "crypto engine created");
    Ok(crypto)
  }

  /// Builds the keyless server-side twin of a client engine
  pub fn from_public_parameters(
    params: &PublicParameters,
  ) -> Result<Arc<dyn HomomorphicCrypto>> {
    let crypto: Arc<dyn HomomorphicCrypto> =
      match parse_crypto_name(&params.crypto_name)? {
        CryptoKind::Rlwe { poly_degree } => {
          Arc::new(RingLwe::keyless(poly_degree as usize))
        }
        CryptoKind::Cleartext { poly_degree } => {
          Arc::new(NoCryptography::new(poly_degree as usize))
        }
      };
    if crypto.public_parameters() != *params {
      return Err(PirError::UnknownCrypto(params.crypto_name.clone()));
    }
    Ok(crypto)
  }

  /// Lists the crypto parameter names `get_crypto_method` is known to accept
  pub fn available_crypto_params() -> &'static [String] {
    AVAILABLE_CRYPTO_PARAMS.as_slice()
  }
}

/// Bytes a single ciphertext absorbs
pub fn absorption_bytesize(crypto: &dyn HomomorphicCrypto) -> u64 {
  crypto.absorption_bitsize(0) / 8
}

/// Bytes of one aggregated element, `alpha * element_bytesize`
pub fn aggregate_bytesize(
  params: &ParameterSet,
  element_bytesize: u64,
) -> Result<u64> {
  element_bytesize.checked_mul(params.alpha()).ok_or_else(|| {
    PirError::InvalidParameters(format!(
      "{} elements of {} bytes overflow an aggregate",
      params.alpha(),
      element_bytesize
    ))
  })
}

/// Number of plaintext chunks holding one aggregated element of
/// `alpha * element_bytesize` bytes. Used by the importer and the extractor.
pub fn plaintext_chunks(
  crypto: &dyn HomomorphicCrypto,
  params: &ParameterSet,
  element_bytesize: u64,
) -> Result<u64> {
  Ok(ceil_div(
    aggregate_bytesize(params, element_bytesize)?,
    absorption_bytesize(crypto),
  ))
}

/// Number of plaintext chunks one ciphertext expands to when it becomes the
/// input of the next dimension
pub fn ciphertext_expansion(crypto: &dyn HomomorphicCrypto) -> u64 {
  ceil_div(crypto.ciphertext_bitsize() / 8, absorption_bytesize(crypto))
}

/// Number of ciphertexts in a reply for elements of `element_bytesize`
/// bytes. Server and client both call this, which is how they agree on the
/// reply length.
pub fn reply_size_in_chunks(
  crypto: &dyn HomomorphicCrypto,
  params: &ParameterSet,
  element_bytesize: u64,
) -> Result<u64> {
  let expansion = ciphertext_expansion(crypto);
  let mut chunks = plaintext_chunks(crypto, params, element_bytesize)?;
  for _ in 1..params.d() {
    chunks = chunks.checked_mul(expansion).ok_or_else(|| {
      PirError::InvalidParameters(format!(
        "reply for elements of {} bytes overflows its chunk count",
        element_bytesize
      ))
    })?;
  }
  Ok(chunks)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn factory_parses_names() {
    let crypto = CryptoProvider::get_crypto_method("RLWE:1024:64").unwrap();
    assert_eq!(crypto.poly_degree(), 1024);
    assert_eq!(crypto.moduli_count(), 1);
    assert_eq!(crypto.ciphertext_bitsize(), 2 * 1024 * 64);
    assert_eq!(crypto.absorption_bitsize(0), 1024 * 16);

    let crypto =
      CryptoProvider::get_crypto_method("NoCryptography:256").unwrap();
    assert_eq!(crypto.ciphertext_bitsize(), 256 * 64);

    for bad in [
      "RLWE",
      "RLWE:1000:64",
      "RLWE:1024:32",
      "RLWE:1024:64:1",
      "LWE:80:1024:60",
      "NoCryptography:16",
    ] {
      assert!(matches!(
        CryptoProvider::get_crypto_method(bad),
        Err(PirError::UnknownCrypto(_))
      ));
    }
  }

  #[test]
  fn every_listed_param_is_accepted() {
    for name in CryptoProvider::available_crypto_params() {
      assert!(CryptoProvider::get_crypto_method(name).is_ok(), "{}", name);
    }
  }

  #[test]
  fn keyless_engine_cannot_decrypt() {
    let client = CryptoProvider::get_crypto_method("RLWE:256:64").unwrap();
    let pp = client.public_parameters();
    let pp = PublicParameters::from_bytes(&pp.to_bytes().unwrap()).unwrap();
    let server = CryptoProvider::from_public_parameters(&pp).unwrap();

    let ct = client.encrypt(1).unwrap();
    assert!(matches!(
      server.decrypt(&ct),
      Err(PirError::MissingSecretKey(_))
    ));
    assert!(matches!(server.encrypt(1), Err(PirError::MissingSecretKey(_))));
    assert_eq!(server.public_parameters(), client.public_parameters());
  }

  #[test]
  fn tampered_public_parameters_are_rejected() {
    let client = CryptoProvider::get_crypto_method("RLWE:256:64").unwrap();
    let mut pp = client.public_parameters();
    pp.absorption_bitsize += 8;
    assert!(CryptoProvider::from_public_parameters(&pp).is_err());
  }

  #[test]
  fn chunk_counts_expand_per_dimension() {
    // abs = 512 bytes, ciphertext = 4096 bytes, expansion = 8
    let crypto = CryptoProvider::get_crypto_method("RLWE:256:64").unwrap();
    let crypto = crypto.as_ref();
    let params = ParameterSet::new(2, vec![4, 4], 2).unwrap();
    assert_eq!(absorption_bytesize(crypto), 512);
    assert_eq!(ciphertext_expansion(crypto), 8);
    assert_eq!(plaintext_chunks(crypto, &params, 64).unwrap(), 1);
    assert_eq!(plaintext_chunks(crypto, &params, 300).unwrap(), 2);
    assert_eq!(reply_size_in_chunks(crypto, &params, 64).unwrap(), 8);
    assert_eq!(reply_size_in_chunks(crypto, &params, 300).unwrap(), 16);

    let params = ParameterSet::new(1, vec![16], 2).unwrap();
    assert_eq!(reply_size_in_chunks(crypto, &params, 300).unwrap(), 2);
  }

  #[test]
  fn plaintext_chunks_never_truncate() {
    let crypto = CryptoProvider::get_crypto_method("NoCryptography:256")
      .unwrap();
    let crypto = crypto.as_ref();
    for alpha in 1..4u64 {
      let params = ParameterSet::new(1, vec![8], alpha).unwrap();
      for bytes in [1u64, 63, 64, 511, 512, 513, 2000] {
        let chunks = plaintext_chunks(crypto, &params, bytes).unwrap();
        assert!(absorption_bytesize(crypto) * chunks >= alpha * bytes);
        assert!(absorption_bytesize(crypto) * (chunks - 1) < alpha * bytes);
      }
    }
  }

  #[test]
  fn oversized_elements_are_rejected_instead_of_overflowing() {
    let crypto = CryptoProvider::get_crypto_method("NoCryptography:256")
      .unwrap();
    let crypto = crypto.as_ref();
    let params = ParameterSet::new(1, vec![8], 4).unwrap();
    assert!(matches!(
      plaintext_chunks(crypto, &params, u64::MAX / 2),
      Err(PirError::InvalidParameters(_))
    ));

    // 2^55 chunks fit, expanding them 4 times per level over 5 levels
    // does not
    let params = ParameterSet::new(6, vec![2; 6], 1).unwrap();
    assert!(plaintext_chunks(crypto, &params, u64::MAX).is_ok());
    assert!(matches!(
      reply_size_in_chunks(crypto, &params, u64::MAX),
      Err(PirError::InvalidParameters(_))
    ));
  }
}
