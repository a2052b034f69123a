// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use mio::Waker;

/// Requests that an event loop stop after its current iteration
///
/// Clones share state and may be moved to other threads; triggering wakes the loop's poll.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
  requested: Arc<AtomicBool>,
  waker: Arc<Waker>,
}

impl ShutdownTrigger {
  pub(crate) fn new(waker: Waker) -> Self {
    Self {
      requested: Arc::new(AtomicBool::new(false)),
      waker: Arc::new(waker),
    }
  }

  pub fn trigger(&self) -> io::Result<()> {
    self.requested.store(true, Ordering::SeqCst);
    self.waker.wake()
  }

  pub fn is_triggered(&self) -> bool {
    self.requested.load(Ordering::SeqCst)
  }
}
