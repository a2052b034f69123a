// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::collections::VecDeque;

/// Bytes awaiting transmission on one socket, in arrival order
#[derive(Debug, Default)]
pub struct OutboundBuffer {
  pending: VecDeque<u8>,
}

impl OutboundBuffer {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn extend(&mut self, bytes: &[u8]) {
    self.pending.extend(bytes);
  }

  /// The contiguous run at the head of the buffer; after the ring wraps this is only
  /// part of what is pending, and the remainder goes out on a later send
  pub fn front_chunk(&self) -> &[u8] {
    self.pending.as_slices().0
  }

  pub fn consume(&mut self, count: usize) {
    debug_assert!(
      count <= self.pending.len(),
      "Consumed {} bytes from a buffer of {}",
      count,
      self.pending.len()
    );
    self.pending.drain(..count.min(self.pending.len()));
  }

  /// Drops everything still pending, returning how many bytes were lost
  pub fn discard(&mut self) -> usize {
    let lost = self.pending.len();
    self.pending.clear();
    lost
  }
}
