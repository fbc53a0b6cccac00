//! Server side of a PIR round.
//!
//! A round goes `Idle -> QueryLoaded -> Computing -> Draining -> Idle`.
//! `generate_reply` and `pop_reply` both take `&self`, so the reply may be
//! drained from another thread while it is being computed: each chunk is
//! published into its slot as soon as it is ready and `pop_reply` waits on a
//! condition variable for the next slot in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use rayon::prelude::*;

use crate::crypto::{absorption_bytesize, reply_size_in_chunks};
use crate::crypto::{Ciphertext, HomomorphicCrypto, Plaintext};
use crate::db::ImportedDatabase;
use crate::errors::{PirError, Result};
use crate::params::ParameterSet;
use crate::utils::memory::{warn_if_over_budget, MemoryProbe, SystemMemory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyState {
  Idle,
  QueryLoaded,
  Computing,
  Draining,
  /// Generation failed, consumers are released with `ReplyAborted`
  Aborted,
}

#[derive(Debug)]
struct ReplyRound {
  state: ReplyState,
  slots: Vec<Option<Vec<u8>>>,
  current_reply: usize,
  nb_replies_to_handle: u64,
  nb_replies_generated: u64,
  exhaustion_signalled: bool,
}

impl ReplyRound {
  fn idle() -> Self {
    Self {
      state: ReplyState::Idle,
      slots: Vec::new(),
      current_reply: 0,
      nb_replies_to_handle: 0,
      nb_replies_generated: 0,
      exhaustion_signalled: false,
    }
  }
}

/// Ordered hand-off between the thread computing a reply and the thread
/// draining it.
#[derive(Debug)]
pub(crate) struct ReplyBuffer {
  round: Mutex<ReplyRound>,
  ready: Condvar,
}

impl ReplyBuffer {
  pub fn new() -> Self {
    Self {
      round: Mutex::new(ReplyRound::idle()),
      ready: Condvar::new(),
    }
  }

  // The round holds no invariant a panicking holder could break halfway,
  // so a poisoned lock is still usable.
  fn lock(&self) -> MutexGuard<'_, ReplyRound> {
    self.round.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> ReplyState {
    self.lock().state
  }

  pub fn nb_replies_generated(&self) -> u64 {
    self.lock().nb_replies_generated
  }

  fn set_state(&self, state: ReplyState) {
    let mut round = self.lock();
    *round = ReplyRound::idle();
    round.state = state;
    self.ready.notify_all();
  }

  /// Resets the bookkeeping for a reply of `chunks` chunks
  pub fn start(&self, chunks: u64) -> Result<()> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(chunks as usize)?;
    slots.resize(chunks as usize, None);

    let mut round = self.lock();
    round.state = ReplyState::Computing;
    round.slots = slots;
    round.current_reply = 0;
    round.nb_replies_to_handle = chunks;
    round.nb_replies_generated = chunks;
    round.exhaustion_signalled = false;
    self.ready.notify_all();
    Ok(())
  }

  pub fn publish(&self, index: usize, chunk: Vec<u8>) {
    let mut round = self.lock();
    if let Some(slot) = round.slots.get_mut(index) {
      *slot = Some(chunk);
    }
    if round.state == ReplyState::Computing {
      round.state = ReplyState::Draining;
    }
    self.ready.notify_all();
  }

  pub fn abort(&self) {
    let mut round = self.lock();
    round.state = ReplyState::Aborted;
    round.slots.clear();
    self.ready.notify_all();
  }

  /// Blocks until the next chunk in order is available
  pub fn pop(&self) -> Result<Option<Vec<u8>>> {
    let mut round = self.lock();
    loop {
      match round.state {
        ReplyState::Idle => {
          return Err(PirError::InvalidState("no query loaded"))
        }
        ReplyState::Aborted => return Err(PirError::ReplyAborted),
        // the consumer started before the generation did
        ReplyState::QueryLoaded => {}
        ReplyState::Computing | ReplyState::Draining => {
          if round.nb_replies_to_handle == 0 {
            if round.exhaustion_signalled {
              return Err(PirError::QueueExhausted);
            }
            round.exhaustion_signalled = true;
            return Ok(None);
          }
          let current = round.current_reply;
          if let Some(chunk) = round.slots[current].take() {
            round.current_reply += 1;
            round.nb_replies_to_handle -= 1;
            return Ok(Some(chunk));
          }
        }
      }
      round = self.ready.wait(round).unwrap_or_else(|e| e.into_inner());
    }
  }
}

// Clears the in-flight flag however `generate_reply` returns
struct InFlight<'a>(&'a AtomicBool);
impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// The `ReplyGenerator` is server side: it folds the imported database
/// with the client query and streams the encrypted reply back in chunks.
///
/// One instance serves one round at a time. Use one generator per
/// concurrent session.
pub struct ReplyGenerator {
  params: ParameterSet,
  crypto: Arc<dyn HomomorphicCrypto>,
  memory: Box<dyn MemoryProbe>,
  // selectors per dimension
  queries: Option<Vec<Vec<Ciphertext>>>,
  buffer: ReplyBuffer,
  in_flight: AtomicBool,
}

impl ReplyGenerator {
  pub fn new(params: ParameterSet, crypto: Arc<dyn HomomorphicCrypto>) -> Self {
    Self {
      params,
      crypto,
      memory: Box::new(SystemMemory),
      queries: None,
      buffer: ReplyBuffer::new(),
      in_flight: AtomicBool::new(false),
    }
  }

  pub fn with_memory_probe(mut self, memory: Box<dyn MemoryProbe>) -> Self {
    self.memory = memory;
    self
  }

  pub fn state(&self) -> ReplyState {
    self.buffer.state()
  }

  /// Parses a whole query, the concatenation of its blocks
  pub fn push_query(&mut self, raw_query: &[u8]) -> Result<()> {
    if self.queries.is_some() {
      return Err(PirError::InvalidState(
        "a query is already loaded, call free_queries first",
      ));
    }
    let block = self.query_element_bytesize() as usize;
    let expected = self.params.query_size() as usize * block;
    if raw_query.len() != expected {
      return Err(PirError::unexpected_size(expected, raw_query.len()));
    }

    let mut blocks = raw_query.chunks(block);
    let mut queries = Vec::with_capacity(self.params.d());
    for &ni in self.params.n() {
      let dimension = blocks
        .by_ref()
        .take(ni as usize)
        .map(|b| self.crypto.deserialize(b))
        .collect::<Result<Vec<Ciphertext>>>()?;
      queries.push(dimension);
    }
    self.queries = Some(queries);
    self.buffer.set_state(ReplyState::QueryLoaded);
    tracing::debug!(blocks = self.params.query_size(), "query loaded");
    Ok(())
  }

  /// Computes the reply against `database`. Chunks become available to
  /// `pop_reply` as they are produced, possibly before this returns.
  pub fn generate_reply(&self, database: &ImportedDatabase) -> Result<()> {
    let queries = self
      .queries
      .as_ref()
      .ok_or(PirError::InvalidState("generate_reply called before push_query"))?;
    if self
      .in_flight
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      return Err(PirError::InvalidState(
        "a reply is already being generated by this instance",
      ));
    }
    let _in_flight = InFlight(&self.in_flight);
    // a reply being drained is never recomputed in place, every round
    // starts from a fresh push_query
    if self.buffer.state() != ReplyState::QueryLoaded {
      return Err(PirError::InvalidState(
        "generate_reply needs a freshly pushed query",
      ));
    }

    // consumers may already be waiting, release them on any failure
    let result = self.run_round(queries, database);
    if result.is_err() {
      self.buffer.abort();
    }
    result
  }

  fn run_round(
    &self,
    queries: &[Vec<Ciphertext>],
    database: &ImportedDatabase,
  ) -> Result<()> {
    if database.nb_elements() > self.params.capacity() {
      return Err(PirError::InvalidParameters(format!(
        "{} aggregated elements do not fit in a hypercube of {}",
        database.nb_elements(),
        self.params.capacity()
      )));
    }

    let chunks = self.compute_reply_size_in_chunks(
      database.before_import_element_bytesize(),
    )?;
    self.check_reply_capacity(chunks);
    self.buffer.start(chunks)?;
    self.fold_all(queries, database, chunks)
  }

  fn fold_all(
    &self,
    queries: &[Vec<Ciphertext>],
    database: &ImportedDatabase,
    chunks: u64,
  ) -> Result<()> {
    let d = self.params.d();
    let mut expanded: Option<Vec<Vec<Plaintext>>> = None;
    let mut polys = database.polys_per_element() as usize;

    for (level, selectors) in queries.iter().enumerate().take(d - 1) {
      let rest = self.params.remaining_after(level) as usize;
      let input = expanded.as_deref().unwrap_or(database.elements());
      let folded = self.fold_dimension(selectors, input, rest, polys);
      let next = self.expand(folded)?;
      polys = next.first().map(Vec::len).unwrap_or(0);
      expanded = Some(next);
      tracing::debug!(level, rest, polys, "dimension folded");
    }
    let level_input = expanded.as_deref().unwrap_or(database.elements());

    if polys as u64 != chunks {
      return Err(PirError::ReplySizeMismatch {
        expected: chunks,
        got: polys as u64,
      });
    }

    // Last dimension: a single position remains, publish each chunk as
    // soon as it is computed.
    let selectors = &queries[d - 1];
    (0..polys).into_par_iter().for_each(|c| {
      let ct = self.fold_position(selectors, level_input, 1, 0, c);
      self.buffer.publish(c, ct.to_bytes());
    });
    tracing::info!(chunks, "reply generated");
    Ok(())
  }

  /// `sum_j selectors[j] * input[j * rest + r][c]`, absent positions
  /// counting as zero
  fn fold_position(
    &self,
    selectors: &[Ciphertext],
    input: &[Vec<Plaintext>],
    rest: usize,
    r: usize,
    c: usize,
  ) -> Ciphertext {
    let mut acc = self.crypto.zero_ciphertext();
    for (j, selector) in selectors.iter().enumerate() {
      if let Some(element) = input.get(j * rest + r) {
        self.crypto.mul_acc(&mut acc, selector, &element[c]);
      }
    }
    acc
  }

  fn fold_dimension(
    &self,
    selectors: &[Ciphertext],
    input: &[Vec<Plaintext>],
    rest: usize,
    polys: usize,
  ) -> Vec<Vec<Ciphertext>> {
    (0..rest)
      .into_par_iter()
      .map(|r| {
        (0..polys)
          .map(|c| self.fold_position(selectors, input, rest, r, c))
          .collect()
      })
      .collect()
  }

  /// Turns the ciphertexts of one level into the plaintexts of the next,
  /// each ciphertext spanning `ciphertext_expansion` chunks
  fn expand(&self, folded: Vec<Vec<Ciphertext>>) -> Result<Vec<Vec<Plaintext>>> {
    let abs_bytes = absorption_bytesize(self.crypto.as_ref()) as usize;
    folded
      .into_par_iter()
      .map(|cts| -> Result<Vec<Plaintext>> {
        let mut element = Vec::new();
        for ct in cts {
          for chunk in ct.to_bytes().chunks(abs_bytes) {
            element.push(self.crypto.encode(chunk)?);
          }
        }
        Ok(element)
      })
      .collect()
  }

  fn check_reply_capacity(&self, chunks: u64) -> bool {
    let poly_bytes =
      self.crypto.poly_degree() * self.crypto.moduli_count() * 8;
    warn_if_over_budget(
      self.memory.as_ref(),
      chunks.saturating_mul(poly_bytes),
      "storing the reply",
    )
  }

  /// Same count the client uses to size its extraction
  pub fn compute_reply_size_in_chunks(
    &self,
    element_bytesize: u64,
  ) -> Result<u64> {
    reply_size_in_chunks(self.crypto.as_ref(), &self.params, element_bytesize)
  }

  /// Pops the next reply chunk in generation order, waiting for it if it is
  /// not produced yet. `Ok(None)` once the whole reply was popped.
  pub fn pop_reply(&self) -> Result<Option<Vec<u8>>> {
    self.buffer.pop()
  }

  /// Drops the loaded query and whatever is left of the reply
  pub fn free_queries(&mut self) {
    self.queries = None;
    self.buffer.set_state(ReplyState::Idle);
  }

  pub fn nb_replies_generated(&self) -> u64 {
    self.buffer.nb_replies_generated()
  }

  pub fn reply_element_bytesize(&self) -> u64 {
    self.crypto.ciphertext_bitsize() / 8
  }

  pub fn query_element_bytesize(&self) -> u64 {
    self.crypto.ciphertext_bitsize() / 8
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::CryptoProvider;
  use crate::db::{DatabaseImporter, MemoryDb};
  use crate::query::QueryGenerator;
  use crate::utils::memory::FixedMemory;
  use std::sync::mpsc;
  use std::thread;
  use std::time::Duration;

  fn setup(
    crypto_name: &str,
    n: Vec<u64>,
    alpha: u64,
    count: usize,
    len: usize,
  ) -> (ParameterSet, Arc<dyn HomomorphicCrypto>, ImportedDatabase) {
    let params = ParameterSet::new(n.len(), n, alpha).unwrap();
    let crypto = CryptoProvider::get_crypto_method(crypto_name).unwrap();
    let db = MemoryDb::new(
      (0..count).map(|i| vec![i as u8 + 1; len]).collect(),
    );
    let imported =
      DatabaseImporter::new(params.clone(), crypto.clone(), Arc::new(db))
        .import_data(0, len as u64)
        .unwrap();
    (params, crypto, imported)
  }

  fn query_bytes(
    params: &ParameterSet,
    crypto: &Arc<dyn HomomorphicCrypto>,
    index: u64,
  ) -> Vec<u8> {
    let mut gen = QueryGenerator::new(params.clone(), crypto.clone());
    gen.set_chosen_element(index).unwrap();
    gen.generate_query().unwrap();
    let mut raw = Vec::new();
    while let Some(block) = gen.pop_query().unwrap() {
      raw.extend(block);
    }
    raw
  }

  #[test]
  fn buffer_delivers_in_order_and_waits_for_missing_slots() {
    let buffer = Arc::new(ReplyBuffer::new());
    buffer.set_state(ReplyState::QueryLoaded);
    let (tx, rx) = mpsc::channel();
    let consumer = {
      let buffer = buffer.clone();
      thread::spawn(move || {
        while let Some(chunk) = buffer.pop().unwrap() {
          tx.send(chunk[0]).unwrap();
        }
      })
    };

    buffer.start(3).unwrap();
    buffer.publish(0, vec![0]);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

    // slot 2 is ready but slot 1 is not, the consumer must keep waiting
    buffer.publish(2, vec![2]);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    buffer.publish(1, vec![1]);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    consumer.join().unwrap();
    assert!(matches!(buffer.pop(), Err(PirError::QueueExhausted)));
  }

  #[test]
  fn aborted_generation_releases_consumers() {
    let buffer = Arc::new(ReplyBuffer::new());
    buffer.start(2).unwrap();
    let consumer = {
      let buffer = buffer.clone();
      thread::spawn(move || buffer.pop())
    };
    buffer.abort();
    assert!(matches!(
      consumer.join().unwrap(),
      Err(PirError::ReplyAborted)
    ));
  }

  #[test]
  fn reply_count_matches_chunk_formula() {
    let (params, crypto, db) = setup("NoCryptography:64", vec![4, 4], 2, 16, 300);
    let mut gen = ReplyGenerator::new(params.clone(), crypto.clone());
    gen.push_query(&query_bytes(&params, &crypto, 3)).unwrap();
    gen.generate_reply(&db).unwrap();

    let expected = gen.compute_reply_size_in_chunks(300).unwrap();
    assert_eq!(gen.nb_replies_generated(), expected);
    let mut popped = 0;
    while let Some(chunk) = gen.pop_reply().unwrap() {
      assert_eq!(chunk.len() as u64, gen.reply_element_bytesize());
      popped += 1;
    }
    assert_eq!(popped, expected);
    assert!(matches!(gen.pop_reply(), Err(PirError::QueueExhausted)));
  }

  #[test]
  fn concurrent_drain_sees_generation_order() {
    let (params, crypto, db) = setup("NoCryptography:64", vec![2, 8], 1, 16, 64);
    let mut gen = ReplyGenerator::new(params.clone(), crypto.clone());
    gen.push_query(&query_bytes(&params, &crypto, 5)).unwrap();

    // sequential run for reference
    gen.generate_reply(&db).unwrap();
    let mut reference = Vec::new();
    while let Some(chunk) = gen.pop_reply().unwrap() {
      reference.push(chunk);
    }

    // new round, the consumer starts before generation and drains while
    // it runs
    gen.free_queries();
    gen.push_query(&query_bytes(&params, &crypto, 5)).unwrap();
    let drained = thread::scope(|s| {
      let consumer = s.spawn(|| {
        let mut chunks = Vec::new();
        while let Some(chunk) = gen.pop_reply().unwrap() {
          chunks.push(chunk);
        }
        chunks
      });
      gen.generate_reply(&db).unwrap();
      consumer.join().unwrap()
    });
    assert_eq!(drained, reference);
  }

  #[test]
  fn state_machine_is_enforced() {
    let (params, crypto, db) = setup("NoCryptography:64", vec![4], 1, 4, 8);
    let mut gen = ReplyGenerator::new(params.clone(), crypto.clone());
    assert_eq!(gen.state(), ReplyState::Idle);
    assert!(matches!(
      gen.generate_reply(&db),
      Err(PirError::InvalidState(_))
    ));
    assert!(matches!(gen.pop_reply(), Err(PirError::InvalidState(_))));
    assert!(gen.push_query(&[0u8; 3]).is_err());

    let raw = query_bytes(&params, &crypto, 1);
    gen.push_query(&raw).unwrap();
    assert_eq!(gen.state(), ReplyState::QueryLoaded);
    assert!(matches!(
      gen.push_query(&raw),
      Err(PirError::InvalidState(_))
    ));

    gen.generate_reply(&db).unwrap();
    assert_eq!(gen.state(), ReplyState::Draining);
    gen.free_queries();
    assert_eq!(gen.state(), ReplyState::Idle);
    gen.push_query(&raw).unwrap();
  }

  #[test]
  fn database_larger_than_hypercube_is_rejected() {
    let (_, crypto, db) = setup("NoCryptography:64", vec![8], 1, 8, 8);
    let small = ParameterSet::new(1, vec![4], 1).unwrap();
    let mut gen = ReplyGenerator::new(small.clone(), crypto.clone());
    gen.push_query(&query_bytes(&small, &crypto, 0)).unwrap();
    assert!(gen.generate_reply(&db).is_err());
  }

  #[test]
  fn reply_capacity_warning_uses_poly_footprint() {
    let params = ParameterSet::new(1, vec![4], 1).unwrap();
    let crypto = CryptoProvider::get_crypto_method("NoCryptography:64").unwrap();
    // 10 chunks * 64 coefficients * 1 modulus * 8 bytes = 5120 bytes
    let gen = ReplyGenerator::new(params.clone(), crypto.clone())
      .with_memory_probe(Box::new(FixedMemory(51_200)));
    assert!(!gen.check_reply_capacity(10));
    let gen = ReplyGenerator::new(params, crypto)
      .with_memory_probe(Box::new(FixedMemory(51_199)));
    assert!(gen.check_reply_capacity(10));
  }

  #[test]
  fn partly_drained_reply_is_not_regenerated() {
    let (params, crypto, db) = setup("NoCryptography:64", vec![4, 4], 2, 16, 300);
    let raw = query_bytes(&params, &crypto, 3);

    let mut reference_gen = ReplyGenerator::new(params.clone(), crypto.clone());
    reference_gen.push_query(&raw).unwrap();
    reference_gen.generate_reply(&db).unwrap();
    let mut reference = Vec::new();
    while let Some(chunk) = reference_gen.pop_reply().unwrap() {
      reference.push(chunk);
    }

    let mut gen = ReplyGenerator::new(params.clone(), crypto.clone());
    gen.push_query(&raw).unwrap();
    gen.generate_reply(&db).unwrap();
    let mut drained = vec![gen.pop_reply().unwrap().unwrap()];

    assert!(matches!(
      gen.generate_reply(&db),
      Err(PirError::InvalidState(_))
    ));
    assert_eq!(gen.state(), ReplyState::Draining);

    // the rejected call left the drain untouched: no duplicate, no gap
    while let Some(chunk) = gen.pop_reply().unwrap() {
      drained.push(chunk);
    }
    assert_eq!(drained, reference);

    gen.free_queries();
    gen.push_query(&raw).unwrap();
    gen.generate_reply(&db).unwrap();
  }

  #[test]
  fn generation_already_in_flight_is_rejected() {
    let (params, crypto, db) = setup("NoCryptography:64", vec![4], 1, 4, 8);
    let mut gen = ReplyGenerator::new(params.clone(), crypto.clone());
    gen.push_query(&query_bytes(&params, &crypto, 2)).unwrap();

    gen.in_flight.store(true, Ordering::Release);
    assert!(matches!(
      gen.generate_reply(&db),
      Err(PirError::InvalidState(_))
    ));
    // the rejected call neither starts nor aborts the round
    assert_eq!(gen.state(), ReplyState::QueryLoaded);
    assert!(gen.in_flight.load(Ordering::Acquire));

    gen.in_flight.store(false, Ordering::Release);
    gen.generate_reply(&db).unwrap();
    assert!(!gen.in_flight.load(Ordering::Acquire));
  }
}
