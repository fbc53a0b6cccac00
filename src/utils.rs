//! Utility modules for ring arithmetic, sampling, data formats and memory
//! accounting used by the PIR pipeline.

/// Integer helpers shared by the chunk-count arithmetic
pub mod arith {
  /// Returns `ceil(num / den)`; `den` must be non-zero
  pub fn ceil_div(num: u64, den: u64) -> u64 {
    let mut quo = num / den;
    if num % den != 0 {
      quo += 1;
    }
    quo
  }
}

/// Arithmetic in `Z_{2^64}[X] / (X^N + 1)`, using wrapping u64 operations
/// as the modular reduction.
pub mod ring {
  /// Computes `acc += a * b` in the negacyclic ring. All three slices must
  /// have the same length `N`.
  pub fn negacyclic_mul_acc(acc: &mut [u64], a: &[u64], b: &[u64]) {
    let n = acc.len();
    debug_assert!(a.len() == n && b.len() == n);
    for (j, &bj) in b.iter().enumerate() {
      // plaintexts are zero padded, skipping saves most of the work on
      // short elements
      if bj == 0 {
        continue;
      }
      for (i, &ai) in a.iter().enumerate() {
        let prod = ai.wrapping_mul(bj);
        let k = i + j;
        if k < n {
          acc[k] = acc[k].wrapping_add(prod);
        } else {
          acc[k - n] = acc[k - n].wrapping_sub(prod);
        }
      }
    }
  }

  /// Returns `a * b` in the negacyclic ring
  pub fn negacyclic_mul(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = vec![0u64; a.len()];
    negacyclic_mul_acc(&mut out, a, b);
    out
  }

  /// Computes `acc += b` coefficient-wise
  pub fn add_assign(acc: &mut [u64], b: &[u64]) {
    for (x, &y) in acc.iter_mut().zip(b.iter()) {
      *x = x.wrapping_add(y);
    }
  }

  /// Computes `acc -= b` coefficient-wise
  pub fn sub_assign(acc: &mut [u64], b: &[u64]) {
    for (x, &y) in acc.iter_mut().zip(b.iter()) {
      *x = x.wrapping_sub(y);
    }
  }

  /// Scales `value` by `delta = 2^(64 - plaintext_bits)`
  pub fn scale_up(value: u64, plaintext_bits: u32) -> u64 {
    value.wrapping_shl(64 - plaintext_bits)
  }

  /// Rounds a noisy phase coefficient back to the plaintext space
  pub fn round_down(phase: u64, plaintext_bits: u32) -> u64 {
    let shift = 64 - plaintext_bits;
    phase.wrapping_add(1u64 << (shift - 1)) >> shift
  }
}

/// Randomness used by the bundled crypto engines
pub mod sampling {
  use rand_core::{OsRng, RngCore};

  // Values used to denote the size of intervals that are used for
  // sampling ternary values, and a max bound that dictates when
  // randomly sampled values should be rejected.
  const TERNARY_INTERVAL_SIZE: u32 = (u32::MAX - 2) / 3;
  const TERNARY_REJECTION_SAMPLING_MAX: u32 = TERNARY_INTERVAL_SIZE * 3;

  /// Samples uniformly from {0, 1, -1}, with -1 represented as `u64::MAX`
  /// so that it reduces correctly modulo 2^64.
  pub fn random_ternary() -> u64 {
    let mut val = OsRng.next_u32();
    while val > TERNARY_REJECTION_SAMPLING_MAX {
      val = OsRng.next_u32();
    }
    if val > TERNARY_INTERVAL_SIZE && val <= TERNARY_INTERVAL_SIZE * 2 {
      1
    } else if val > TERNARY_INTERVAL_SIZE * 2 {
      u64::MAX
    } else {
      0
    }
  }

  pub fn random_ternary_vector(width: usize) -> Vec<u64> {
    (0..width).map(|_| random_ternary()).collect()
  }

  /// Samples a polynomial with coefficients uniform in `Z_{2^64}`
  pub fn random_uniform_vector(width: usize) -> Vec<u64> {
    (0..width).map(|_| OsRng.next_u64()).collect()
  }
}

/// Functionality related to manipulation of data formats that are used
pub mod format {
  use crate::errors::{PirError, Result};
  use std::convert::TryInto;

  fn u8_to_bits_le(byte: u8) -> [bool; 8] {
    [
      byte & 1 != 0,
      byte & (1 << 1) != 0,
      byte & (1 << 2) != 0,
      byte & (1 << 3) != 0,

      byte & (1 << 4) != 0,
      byte & (1 << 5) != 0,
      byte & (1 << 6) != 0,
      byte & (1 << 7) != 0,
    ]
  }

  fn bits_to_u8_le(xs: &[bool]) -> u8 {
    assert!(xs.len() <= 8);
    xs.iter()
      .enumerate()
      .filter(|(_, &bit)| bit)
      .map(|(i, _)| 1u8 << i)
      .sum()
  }

  pub fn u64_to_bits_le(x: u64, bit_len: usize) -> Vec<bool> {
    x.to_le_bytes()
      .into_iter()
      .flat_map(u8_to_bits_le)
      .take(bit_len)
      .collect()
  }

  pub fn bits_to_u64_le(bits: &[bool]) -> u64 {
    assert!(bits.len() <= 64);
    bits.iter()
      .enumerate()
      .filter(|(_, &bit)| bit)
      .map(|(i, _)| 1u64 << i)
      .sum()
  }

  pub fn bits_to_bytes_le(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
      .map(bits_to_u8_le)
      .collect()
  }

  pub fn bytes_to_bits_le(bytes: &[u8]) -> Vec<bool> {
    bytes.iter()
      .copied()
      .flat_map(u8_to_bits_le)
      .collect()
  }

  /// Packs `bytes` into `width` coefficients of `entry_bit_len` bits each,
  /// zero padding the tail. Fails if the bytes do not fit.
  pub fn bytes_to_coeffs(
    bytes: &[u8],
    entry_bit_len: usize,
    width: usize,
  ) -> Result<Vec<u64>> {
    let capacity = entry_bit_len * width / 8;
    if bytes.len() > capacity {
      return Err(PirError::unexpected_size(capacity, bytes.len()));
    }
    let bits = bytes_to_bits_le(bytes);
    let mut coeffs: Vec<u64> = bits
      .chunks(entry_bit_len)
      .map(bits_to_u64_le)
      .collect();
    coeffs.resize(width, 0);
    Ok(coeffs)
  }

  /// Inverse of `bytes_to_coeffs`: unpacks `entry_bit_len` bits per
  /// coefficient and returns the first `byte_len` bytes.
  pub fn coeffs_to_bytes(
    coeffs: &[u64],
    entry_bit_len: usize,
    byte_len: usize,
  ) -> Vec<u8> {
    let bits: Vec<bool> = coeffs
      .iter()
      .flat_map(|&c| u64_to_bits_le(c, entry_bit_len))
      .collect();
    let mut bytes = bits_to_bytes_le(&bits);
    bytes.truncate(byte_len);
    bytes
  }

  pub fn words_to_bytes_le(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
  }

  pub fn bytes_to_words_le(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
      return Err(PirError::unexpected_size(
        bytes.len() - bytes.len() % 8 + 8,
        bytes.len(),
      ));
    }
    Ok(
      bytes
        .chunks_exact(8)
        .map(|c| {
          let word: [u8; 8] = c.try_into().unwrap_or([0u8; 8]);
          u64::from_le_bytes(word)
        })
        .collect(),
    )
  }
}

/// Memory accounting behind the advisory capacity warnings
pub mod memory {
  use std::fs;

  /// Source of the total memory figure the capacity checks compare against
  pub trait MemoryProbe: Send + Sync {
    /// Total system memory in bytes, `None` when it cannot be determined
    fn total_memory(&self) -> Option<u64>;
  }

  /// Reads `MemTotal` from `/proc/meminfo`
  #[derive(Clone, Copy, Debug, Default)]
  pub struct SystemMemory;

  impl MemoryProbe for SystemMemory {
    fn total_memory(&self) -> Option<u64> {
      let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
      parse_meminfo_total(&meminfo)
    }
  }

  /// A fixed memory figure, for tests and for hosts where the caller
  /// knows better than the system
  #[derive(Clone, Copy, Debug)]
  pub struct FixedMemory(pub u64);

  impl MemoryProbe for FixedMemory {
    fn total_memory(&self) -> Option<u64> {
      Some(self.0)
    }
  }

  pub fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line
      .trim_start_matches("MemTotal:")
      .trim()
      .trim_end_matches("kB")
      .trim()
      .parse()
      .ok()?;
    kib.checked_mul(1024)
  }

  /// True when `projected` bytes would take more than one tenth of
  /// `total` bytes
  pub fn exceeds_memory_budget(projected: u64, total: u64) -> bool {
    projected > total / 10
  }

  /// Logs the capacity warning for `what` if needed and reports whether it
  /// fired. Never alters control flow.
  pub fn warn_if_over_budget(
    probe: &dyn MemoryProbe,
    projected: u64,
    what: &str,
  ) -> bool {
    match probe.total_memory() {
      Some(total) if exceeds_memory_budget(projected, total) => {
        tracing::warn!(
          projected_bytes = projected,
          total_bytes = total,
          "going to use more than one tenth of the available memory for {}",
          what
        );
        true
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::arith::ceil_div;
  use super::format::*;
  use super::memory::*;
  use super::ring::*;

  #[test]
  fn ceil_div_rounds_up() {
    assert_eq!(ceil_div(16, 2), 8);
    assert_eq!(ceil_div(15, 2), 8);
    assert_eq!(ceil_div(1, 512), 1);
    assert_eq!(ceil_div(0, 7), 0);
  }

  #[test]
  fn negacyclic_wraps_with_sign() {
    // X^3 * X = X^4 = -1 in Z[X]/(X^4 + 1)
    let x3 = vec![0, 0, 0, 1];
    let x = vec![0, 1, 0, 0];
    assert_eq!(negacyclic_mul(&x3, &x), vec![u64::MAX, 0, 0, 0]);

    // (1 + X) * (1 + X) = 1 + 2X + X^2
    let a = vec![1, 1, 0, 0];
    assert_eq!(negacyclic_mul(&a, &a), vec![1, 2, 1, 0]);
  }

  #[test]
  fn rounding_absorbs_small_noise() {
    let bits = 16;
    let phase = scale_up(0xbeef, bits).wrapping_add(12345);
    assert_eq!(round_down(phase, bits), 0xbeef);
    let phase = scale_up(7, bits).wrapping_sub(12345);
    assert_eq!(round_down(phase, bits), 7);
  }

  #[test]
  fn coefficient_packing_preserves_bytes() {
    let bytes: Vec<u8> = (0..37u8).collect();
    let coeffs = bytes_to_coeffs(&bytes, 12, 32).unwrap();
    assert_eq!(coeffs.len(), 32);
    assert!(coeffs.iter().all(|&c| c < (1 << 12)));
    assert_eq!(coeffs_to_bytes(&coeffs, 12, bytes.len()), bytes);
  }

  #[test]
  fn coefficient_packing_rejects_oversized_input() {
    let bytes = vec![1u8; 65];
    assert!(bytes_to_coeffs(&bytes, 16, 32).is_err());
  }

  #[test]
  fn meminfo_is_parsed_in_bytes() {
    let meminfo = "MemTotal:       16318040 kB\nMemFree:  123 kB\n";
    assert_eq!(parse_meminfo_total(meminfo), Some(16318040 * 1024));
    assert_eq!(parse_meminfo_total("garbage"), None);
  }

  #[test]
  fn capacity_warning_threshold_is_one_tenth() {
    let total = 10_000;
    assert!(!exceeds_memory_budget(999, total));
    assert!(!exceeds_memory_budget(1_000, total));
    assert!(exceeds_memory_budget(1_001, total));

    let probe = FixedMemory(total);
    assert!(warn_if_over_budget(&probe, 1_001, "testing"));
    assert!(!warn_if_over_budget(&probe, 1_000, "testing"));
  }
}
