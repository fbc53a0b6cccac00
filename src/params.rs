use serde::{Deserialize, Serialize};

use crate::errors::{PirError, Result};

/// The `ParameterSet` fixes the shape of a PIR session: the database is
/// laid out as a `d`-dimensional hypercube with `n[i]` positions along
/// dimension `i`, and `alpha` consecutive database elements are aggregated
/// into each position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSet {
  d: usize,
  n: Vec<u64>,
  alpha: u64,
}
impl ParameterSet {
  pub fn new(d: usize, n: Vec<u64>, alpha: u64) -> Result<Self> {
    if d == 0 {
      return Err(PirError::InvalidParameters(
        "at least one dimension is required".into(),
      ));
    }
    if n.len() != d {
      return Err(PirError::InvalidParameters(format!(
        "expected {} dimension sizes, got {}",
        d,
        n.len()
      )));
    }
    if let Some(i) = n.iter().position(|&ni| ni == 0) {
      return Err(PirError::InvalidParameters(format!(
        "dimension {} has size zero",
        i
      )));
    }
    if alpha == 0 {
      return Err(PirError::InvalidParameters(
        "alpha must be at least one".into(),
      ));
    }
    n.iter().try_fold(1u64, |acc, &ni| acc.checked_mul(ni)).ok_or_else(
      || PirError::InvalidParameters("hypercube size overflows u64".into()),
    )?;
    Ok(Self { d, n, alpha })
  }

  pub fn d(&self) -> usize {
    self.d
  }

  pub fn n(&self) -> &[u64] {
    &self.n
  }

  pub fn alpha(&self) -> u64 {
    self.alpha
  }

  /// Number of ciphertext blocks in a query, the sum of all `n[i]`
  pub fn query_size(&self) -> u64 {
    self.n.iter().sum()
  }

  /// Number of aggregated elements the hypercube can address
  pub fn capacity(&self) -> u64 {
    // overflow was ruled out in `new`
    self.n.iter().product()
  }

  /// Number of hypercube positions left once dimensions `0..=level` have
  /// been folded
  pub(crate) fn remaining_after(&self, level: usize) -> u64 {
    self.n[level + 1..].iter().product()
  }

  /// Splits an aggregated element index into its per-dimension coordinates,
  /// dimension 0 being the most significant.
  pub fn decompose(&self, aggregated_index: u64) -> Result<Vec<u64>> {
    let capacity = self.capacity();
    if aggregated_index >= capacity {
      return Err(PirError::IndexOutOfRange {
        index: aggregated_index,
        capacity,
      });
    }
    let mut digits = vec![0u64; self.d];
    let mut rest = aggregated_index;
    for (digit, &ni) in digits.iter_mut().zip(self.n.iter()).rev() {
      *digit = rest % ni;
      rest /= ni;
    }
    Ok(digits)
  }
}
