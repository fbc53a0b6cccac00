//! The `errors` module gathers every failure the PIR pipeline can report
//! to its caller.
//!
//! Exhausted queues are not errors: `pop_*` methods signal them with
//! `Ok(None)`. Capacity warnings are not errors either, they are logged.

use std::collections::TryReserveError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PirError>;

#[derive(Debug, Error)]
pub enum PirError {
  #[error("Invalid PIR parameters: {0}")]
  InvalidParameters(String),

  #[error("Unknown crypto parameters {0:?}, see available_crypto_params()")]
  UnknownCrypto(String),

  // Raised by engines rebuilt from public parameters (server side)
  #[error("Crypto engine holds no secret key, cannot {0}")]
  MissingSecretKey(&'static str),

  #[error("Unexpected input size, expected {expected} bytes, got {got}")]
  UnexpectedInputSize { expected: usize, got: usize },

  #[error("Element index {index} out of range, the database shape addresses {capacity} elements")]
  IndexOutOfRange { index: u64, capacity: u64 },

  #[error("Invalid state: {0}")]
  InvalidState(&'static str),

  // Popping again after the exhaustion signal was already returned
  #[error("Attempted to pop from a queue that was already drained")]
  QueueExhausted,

  #[error("Reply size mismatch, expected {expected} chunks, got {got}")]
  ReplySizeMismatch { expected: u64, got: u64 },

  #[error("Reply generation failed before the reply was complete")]
  ReplyAborted,

  #[error("Allocation failed: {0}")]
  Allocation(#[from] TryReserveError),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("Serialization error: {0}")]
  Bincode(#[from] bincode::Error),

  #[error("Base64 decoding error: {0}")]
  Base64(#[from] base64::DecodeError),
}

impl PirError {
  pub fn unexpected_size(expected: usize, got: usize) -> Self {
    PirError::UnexpectedInputSize { expected, got }
  }
}
