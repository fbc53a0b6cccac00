use std::sync::Arc;

use rayon::prelude::*;

use crate::crypto::HomomorphicCrypto;
use crate::errors::{PirError, Result};
use crate::params::ParameterSet;
use crate::queue::CountedQueue;

/// The `QueryGenerator` is client side: it starts a PIR round by encrypting
/// a one-hot selector per dimension for the chosen element.
#[derive(Debug)]
pub struct QueryGenerator {
  params: ParameterSet,
  crypto: Arc<dyn HomomorphicCrypto>,
  chosen_element: Option<u64>,
  query_buffer: CountedQueue<Vec<u8>>,
}

impl QueryGenerator {
  pub fn new(params: ParameterSet, crypto: Arc<dyn HomomorphicCrypto>) -> Self {
    Self {
      params,
      crypto,
      chosen_element: None,
      query_buffer: CountedQueue::new(),
    }
  }

  /// Records the index of the database element to retrieve. The index is
  /// never sent to the server.
  pub fn set_chosen_element(&mut self, chosen_element: u64) -> Result<()> {
    let capacity = self.params.capacity().saturating_mul(self.params.alpha());
    if chosen_element / self.params.alpha() >= self.params.capacity() {
      return Err(PirError::IndexOutOfRange {
        index: chosen_element,
        capacity,
      });
    }
    self.chosen_element = Some(chosen_element);
    Ok(())
  }

  /// Encrypts the query for the chosen element and queues its blocks,
  /// dimension 0 first.
  pub fn generate_query(&mut self) -> Result<()> {
    let chosen = self
      .chosen_element
      .ok_or(PirError::InvalidState("no element was chosen"))?;
    if self.query_buffer.pending() != 0 {
      return Err(PirError::InvalidState(
        "previous query still has unpopped blocks",
      ));
    }
    let digits = self.params.decompose(chosen / self.params.alpha())?;

    let selectors: Vec<(u64, u64)> = self
      .params
      .n()
      .iter()
      .zip(digits.iter())
      .flat_map(|(&ni, &digit)| (0..ni).map(move |j| (j, digit)))
      .collect();
    let blocks = selectors
      .par_iter()
      .map(|&(j, digit)| -> Result<Vec<u8>> {
        let ct = self.crypto.encrypt(u64::from(j == digit))?;
        Ok(ct.to_bytes())
      })
      .collect::<Result<Vec<Vec<u8>>>>()?;

    tracing::debug!(blocks = blocks.len(), "query generated");
    self.query_buffer.refill(blocks);
    Ok(())
  }

  /// Pops the next query block, `Ok(None)` once all of them were popped
  pub fn pop_query(&mut self) -> Result<Option<Vec<u8>>> {
    self.query_buffer.pop()
  }

  pub fn query_element_bytesize(&self) -> u64 {
    self.crypto.ciphertext_bitsize() / 8
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::CryptoProvider;

  fn generator(d: usize, n: Vec<u64>, alpha: u64) -> QueryGenerator {
    let params = ParameterSet::new(d, n, alpha).unwrap();
    let crypto = CryptoProvider::get_crypto_method("RLWE:64:64").unwrap();
    QueryGenerator::new(params, crypto)
  }

  #[test]
  fn pops_exactly_query_size_blocks() {
    for (d, n) in [(1, vec![5]), (2, vec![4, 4]), (3, vec![2, 3, 1])] {
      let mut gen = generator(d, n.clone(), 1);
      gen.set_chosen_element(0).unwrap();
      gen.generate_query().unwrap();
      let expected: u64 = n.iter().sum();
      for _ in 0..expected {
        let block = gen.pop_query().unwrap().unwrap();
        assert_eq!(block.len() as u64, gen.query_element_bytesize());
      }
      assert_eq!(gen.pop_query().unwrap(), None);
      assert!(matches!(gen.pop_query(), Err(PirError::QueueExhausted)));
    }
  }

  #[test]
  fn selectors_are_one_hot_per_dimension() {
    let params = ParameterSet::new(2, vec![4, 4], 2).unwrap();
    let crypto = CryptoProvider::get_crypto_method("RLWE:64:64").unwrap();
    let mut gen = QueryGenerator::new(params, crypto.clone());
    // element 9 is aggregated element 4, coordinates (1, 0)
    gen.set_chosen_element(9).unwrap();
    gen.generate_query().unwrap();

    let mut selected = Vec::new();
    while let Some(block) = gen.pop_query().unwrap() {
      let ct = crypto.deserialize(&block).unwrap();
      let plain = crypto.decrypt(&ct).unwrap();
      // the selector lives in the constant coefficient
      selected.push(u16::from_le_bytes([plain[0], plain[1]]));
    }
    assert_eq!(selected, vec![0, 1, 0, 0, 1, 0, 0, 0]);
  }

  #[test]
  fn preconditions_are_enforced() {
    let mut gen = generator(2, vec![4, 4], 2);
    assert!(matches!(
      gen.generate_query(),
      Err(PirError::InvalidState(_))
    ));
    assert!(matches!(
      gen.set_chosen_element(32),
      Err(PirError::IndexOutOfRange { .. })
    ));
    gen.set_chosen_element(31).unwrap();
    gen.generate_query().unwrap();
    gen.pop_query().unwrap();
    assert!(matches!(
      gen.generate_query(),
      Err(PirError::InvalidState(_))
    ));
    while gen.pop_query().unwrap().is_some() {}
    gen.generate_query().unwrap();
  }
}
