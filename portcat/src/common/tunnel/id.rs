// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TunnelId(u64);

impl TunnelId {
  pub fn new(inner: u64) -> TunnelId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

/// Hands out ids that are never reused for the lifetime of the generator
#[derive(Debug, Default)]
pub struct MonotonicGenerator {
  next: u64,
}

impl MonotonicGenerator {
  pub fn next_id(&mut self) -> TunnelId {
    let id = TunnelId::new(self.next);
    self.next += 1;
    id
  }
}

impl std::fmt::Debug for TunnelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("TunnelId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for TunnelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.inner())
  }
}
