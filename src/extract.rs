use std::sync::Arc;

use rayon::prelude::*;

use crate::crypto::{
  absorption_bytesize, ciphertext_expansion, plaintext_chunks,
  reply_size_in_chunks,
};
use crate::crypto::{Ciphertext, HomomorphicCrypto};
use crate::errors::{PirError, Result};
use crate::params::ParameterSet;
use crate::queue::CountedQueue;

/// The `ReplyExtractor` is client side: it collects the reply chunks sent
/// by the server, in arrival order, and decrypts them back into the
/// plaintext of the chosen aggregated element.
#[derive(Debug)]
pub struct ReplyExtractor {
  params: ParameterSet,
  crypto: Arc<dyn HomomorphicCrypto>,
  replies_buffer: Vec<Ciphertext>,
  clear_chunks: CountedQueue<Vec<u8>>,
}

impl ReplyExtractor {
  pub fn new(params: ParameterSet, crypto: Arc<dyn HomomorphicCrypto>) -> Self {
    Self {
      params,
      crypto,
      replies_buffer: Vec::new(),
      clear_chunks: CountedQueue::new(),
    }
  }

  /// Enqueues one reply chunk as received
  pub fn push_encrypted_reply(&mut self, raw_bytes: &[u8]) -> Result<()> {
    let ct = self.crypto.deserialize(raw_bytes)?;
    self.replies_buffer.push(ct);
    Ok(())
  }

  /// Decrypts the pushed reply for elements of `max_file_bytesize` bytes
  /// and queues the resulting plaintext chunks.
  pub fn extract_reply(&mut self, max_file_bytesize: u64) -> Result<()> {
    if self.clear_chunks.pending() != 0 {
      return Err(PirError::InvalidState(
        "previous plaintext results were not drained",
      ));
    }
    let crypto = self.crypto.as_ref();
    let expected =
      reply_size_in_chunks(crypto, &self.params, max_file_bytesize)?;
    let got = self.replies_buffer.len() as u64;
    if got != expected {
      return Err(PirError::ReplySizeMismatch { expected, got });
    }

    let ct_bytes = (crypto.ciphertext_bitsize() / 8) as usize;
    let expansion = ciphertext_expansion(crypto) as usize;
    // the pushed replies are kept until extraction succeeds
    let mut peeled: Option<Vec<Ciphertext>> = None;

    // Peel the dimensions folded after the first one: every `expansion`
    // decrypted chunks hold one ciphertext of the level below.
    for level in (1..self.params.d()).rev() {
      let ciphertexts =
        peeled.as_deref().unwrap_or(self.replies_buffer.as_slice());
      let decrypted = self.decrypt_all(ciphertexts)?;
      let next = decrypted
        .chunks(expansion)
        .map(|pieces| {
          let mut bytes = pieces.concat();
          bytes.truncate(ct_bytes);
          crypto.deserialize(&bytes)
        })
        .collect::<Result<Vec<Ciphertext>>>()?;
      tracing::debug!(level, ciphertexts = next.len(), "level peeled");
      peeled = Some(next);
    }

    let ciphertexts =
      peeled.as_deref().unwrap_or(self.replies_buffer.as_slice());
    let chunks = self.decrypt_all(ciphertexts)?;
    let expected = self.nb_plaintext_replies(max_file_bytesize)?;
    if chunks.len() as u64 != expected {
      return Err(PirError::ReplySizeMismatch {
        expected,
        got: chunks.len() as u64,
      });
    }
    tracing::debug!(chunks = chunks.len(), "reply extracted");
    self.replies_buffer.clear();
    self.clear_chunks.refill(chunks);
    Ok(())
  }

  fn decrypt_all(&self, ciphertexts: &[Ciphertext]) -> Result<Vec<Vec<u8>>> {
    ciphertexts
      .par_iter()
      .map(|ct| self.crypto.decrypt(ct))
      .collect()
  }

  /// Pops the next plaintext chunk, `Ok(None)` once all were popped
  pub fn pop_plaintext_result(&mut self) -> Result<Option<Vec<u8>>> {
    self.clear_chunks.pop()
  }

  /// Bytes of plaintext in each chunk
  pub fn plaintext_reply_bytesize(&self) -> u64 {
    absorption_bytesize(self.crypto.as_ref())
  }

  /// Number of plaintext chunks for elements of `max_file_bytesize` bytes
  pub fn nb_plaintext_replies(&self, max_file_bytesize: u64) -> Result<u64> {
    plaintext_chunks(self.crypto.as_ref(), &self.params, max_file_bytesize)
  }

  /// Extracts the reply and returns the `max_file_bytesize` bytes of
  /// `chosen_element` out of its aggregate.
  pub fn extract_element(
    &mut self,
    chosen_element: u64,
    max_file_bytesize: u64,
  ) -> Result<Vec<u8>> {
    self.extract_reply(max_file_bytesize)?;
    let mut aggregate = Vec::new();
    while let Some(chunk) = self.pop_plaintext_result()? {
      aggregate.extend(chunk);
    }
    let start = ((chosen_element % self.params.alpha()) * max_file_bytesize)
      as usize;
    let end = start + max_file_bytesize as usize;
    aggregate
      .get(start..end)
      .map(<[u8]>::to_vec)
      .ok_or_else(|| PirError::unexpected_size(end, aggregate.len()))
  }
}
