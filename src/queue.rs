use std::collections::VecDeque;

use crate::errors::{PirError, Result};

/// A single-use FIFO drained by counting down. Popping yields the items in
/// insertion order, then `Ok(None)` once, then `Err(QueueExhausted)`.
#[derive(Debug)]
pub(crate) struct CountedQueue<T> {
  items: VecDeque<T>,
  remaining: usize,
  exhaustion_signalled: bool,
}

impl<T> CountedQueue<T> {
  pub fn new() -> Self {
    Self {
      items: VecDeque::new(),
      remaining: 0,
      exhaustion_signalled: false,
    }
  }

  /// Replaces the content of the queue with `items`
  pub fn refill(&mut self, items: Vec<T>) {
    self.remaining = items.len();
    self.items = items.into();
    self.exhaustion_signalled = false;
  }

  pub fn pop(&mut self) -> Result<Option<T>> {
    if self.remaining == 0 {
      if self.exhaustion_signalled {
        return Err(PirError::QueueExhausted);
      }
      self.exhaustion_signalled = true;
      return Ok(None);
    }
    self.remaining -= 1;
    Ok(self.items.pop_front())
  }

  /// Items not popped yet
  pub fn pending(&self) -> usize {
    self.remaining
  }
}
