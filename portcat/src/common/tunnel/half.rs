// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

use super::buffer::OutboundBuffer;

/// Which endpoint of a forwarded connection a half faces
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
  /// Faces the client accepted by the listener
  Local,
  /// Faces the route's remote address
  Remote,
}

impl Side {
  pub fn peer(self) -> Side {
    match self {
      Side::Local => Side::Remote,
      Side::Remote => Side::Local,
    }
  }

  pub(crate) fn index(self) -> usize {
    match self {
      Side::Local => 0,
      Side::Remote => 1,
    }
  }
}

impl std::fmt::Display for Side {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Side::Local => "local",
      Side::Remote => "remote",
    })
  }
}

/// Readiness reported by the poll and not yet consumed by a would-block result
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Readiness {
  pub readable: bool,
  pub writable: bool,
}

/// One endpoint's socket, the bytes queued for it, and its half-close state
///
/// The outbound buffer only ever holds bytes received by the peer half.
pub struct TunnelHalf<S> {
  pub(super) stream: S,
  pub(super) side: Side,
  pub(super) addr: SocketAddr,
  pub(super) outbound: OutboundBuffer,
  /// Set once; no further bytes will be queued for this socket
  pub(super) done: bool,
  pub(super) write_shut: bool,
  pub(super) read_closed: bool,
  pub(super) readiness: Readiness,
  pub(super) bytes_sent: u64,
}

impl<S> TunnelHalf<S> {
  pub fn new(side: Side, addr: SocketAddr, stream: S) -> Self {
    Self {
      stream,
      side,
      addr,
      outbound: OutboundBuffer::new(),
      done: false,
      write_shut: false,
      read_closed: false,
      readiness: Readiness::default(),
      bytes_sent: 0,
    }
  }

  pub fn side(&self) -> Side {
    self.side
  }

  /// Address of the far endpoint, for diagnostics
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn is_done(&self) -> bool {
    self.done
  }

  pub fn is_read_closed(&self) -> bool {
    self.read_closed
  }

  pub fn buffered(&self) -> usize {
    self.outbound.len()
  }

  pub fn readiness(&self) -> Readiness {
    self.readiness
  }

  /// Accumulate readiness from a poll event; flags clear only on would-block
  pub fn mark_ready(&mut self, readable: bool, writable: bool) {
    self.readiness.readable |= readable;
    self.readiness.writable |= writable;
  }

  pub fn stream(&self) -> &S {
    &self.stream
  }

  pub fn stream_mut(&mut self) -> &mut S {
    &mut self.stream
  }
}

impl<S> std::fmt::Debug for TunnelHalf<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelHalf")
      .field("side", &self.side)
      .field("addr", &self.addr)
      .field("buffered", &self.outbound.len())
      .field("done", &self.done)
      .field("write_shut", &self.write_shut)
      .field("read_closed", &self.read_closed)
      .finish_non_exhaustive()
  }
}
