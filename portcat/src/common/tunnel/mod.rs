// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A forwarded connection as a pair of [`TunnelHalf`]s and its half-close state machine
//!
//! Each half moves from open, to half-closed (`done`, write direction shut down once its
//! backlog drains), to closed. A [`Tunnel`] only reports a terminal status once both of its
//! halves have been half-closed, at which point the owner drops both sockets together.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use mio::Interest;

use crate::util::tunnel_stream::TunnelStream;

pub mod buffer;
pub mod half;
pub mod id;

pub use self::half::{Readiness, Side, TunnelHalf};
pub use self::id::TunnelId;

/// Outcome of a single operation on a tunnel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
  /// At least one half is still open, or closed but still draining
  Continue,
  /// Both halves are closed and every teardown call succeeded
  Shutdown,
  /// Both halves are closed; this many teardown calls failed along the way
  ShutdownWithErrors(usize),
}

impl TunnelStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, TunnelStatus::Continue)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("Receive failed on {side} half ({addr})")]
  Receive {
    side: Side,
    addr: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("Send failed on {side} half ({addr})")]
  Send {
    side: Side,
    addr: SocketAddr,
    #[source]
    source: io::Error,
  },
}

/// Conditions meaning the far endpoint is gone, as opposed to a local failure
fn is_disconnect(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
  )
}

/// Two mutually-peered halves; neither exists without the other
pub struct Tunnel<S> {
  halves: [TunnelHalf<S>; 2],
  errors: usize,
}

impl<S: TunnelStream> Tunnel<S> {
  pub fn new(local: TunnelHalf<S>, remote: TunnelHalf<S>) -> Self {
    assert!(
      local.side == Side::Local && remote.side == Side::Remote,
      "Tunnel halves must be constructed with their matching sides"
    );
    Self {
      halves: [local, remote],
      errors: 0,
    }
  }

  pub fn half(&self, side: Side) -> &TunnelHalf<S> {
    &self.halves[side.index()]
  }

  pub fn half_mut(&mut self, side: Side) -> &mut TunnelHalf<S> {
    &mut self.halves[side.index()]
  }

  fn split_mut(&mut self, side: Side) -> (&mut TunnelHalf<S>, &mut TunnelHalf<S>) {
    let [local, remote] = &mut self.halves;
    match side {
      Side::Local => (local, remote),
      Side::Remote => (remote, local),
    }
  }

  /// Teardown failures tallied so far
  pub fn error_count(&self) -> usize {
    self.errors
  }

  /// Fold a teardown failure observed outside the tunnel into its tally
  pub fn record_teardown_error(&mut self) {
    self.errors += 1;
  }

  /// One non-blocking read from `side`, relaying anything read to its peer
  ///
  /// Received bytes are queued on the peer and flushed immediately; whatever the peer's
  /// socket cannot take right now stays queued for the next writable signal. End of stream
  /// or a reset on `side` half-closes the peer, since the peer has nothing more to send.
  pub fn receive(&mut self, side: Side, scratch: &mut [u8]) -> Result<TunnelStatus, TunnelError> {
    let (this, peer) = self.split_mut(side);
    if this.read_closed || peer.done {
      this.readiness.readable = false;
      return Ok(TunnelStatus::Continue);
    }
    match this.stream.read(scratch) {
      Ok(0) => {
        tracing::trace!(%side, addr = %this.addr, "End of stream");
        this.read_closed = true;
        Ok(self.close(side.peer()))
      }
      Ok(count) => {
        peer.outbound.extend(&scratch[..count]);
        self.flush(side.peer())
      }
      Err(e) if e.kind() == ErrorKind::WouldBlock => {
        this.readiness.readable = false;
        Ok(TunnelStatus::Continue)
      }
      Err(e) if e.kind() == ErrorKind::Interrupted => Ok(TunnelStatus::Continue),
      Err(e) if is_disconnect(&e) => {
        tracing::debug!(%side, addr = %this.addr, error = ?e, "Connection lost while receiving");
        this.read_closed = true;
        this.readiness.readable = false;
        Ok(self.close(side.peer()))
      }
      Err(source) => Err(TunnelError::Receive {
        side,
        addr: this.addr,
        source,
      }),
    }
  }

  /// One non-blocking send of as much of `side`'s backlog as the socket accepts
  pub fn flush(&mut self, side: Side) -> Result<TunnelStatus, TunnelError> {
    let this = &mut self.halves[side.index()];
    if this.outbound.is_empty() {
      return Ok(TunnelStatus::Continue);
    }
    let sent = {
      let chunk = this.outbound.front_chunk();
      this.stream.write(chunk)
    };
    match sent {
      Ok(0) => Ok(self.lose_outbound(side, None)),
      Ok(count) => {
        this.outbound.consume(count);
        this.bytes_sent += count as u64;
        if this.outbound.is_empty() && this.done && !this.write_shut {
          self.shutdown_write(side);
          return Ok(self.status());
        }
        Ok(TunnelStatus::Continue)
      }
      Err(e) if e.kind() == ErrorKind::WouldBlock => {
        this.readiness.writable = false;
        Ok(TunnelStatus::Continue)
      }
      Err(e) if e.kind() == ErrorKind::Interrupted => Ok(TunnelStatus::Continue),
      Err(e) if is_disconnect(&e) => Ok(self.lose_outbound(side, Some(e))),
      Err(source) => Err(TunnelError::Send {
        side,
        addr: this.addr,
        source,
      }),
    }
  }

  /// Half-close `side`: no more bytes will be queued for it, and its write direction is
  /// shut down as soon as its backlog is empty
  ///
  /// Returns a terminal status once both halves have reached this point.
  pub fn close(&mut self, side: Side) -> TunnelStatus {
    let this = &mut self.halves[side.index()];
    if !this.done {
      this.done = true;
      if this.outbound.is_empty() {
        self.shutdown_write(side);
      }
    }
    self.status()
  }

  pub fn status(&self) -> TunnelStatus {
    if self.is_closed() {
      match self.errors {
        0 => TunnelStatus::Shutdown,
        n => TunnelStatus::ShutdownWithErrors(n),
      }
    } else {
      TunnelStatus::Continue
    }
  }

  pub fn is_closed(&self) -> bool {
    self.halves.iter().all(|half| half.done && half.write_shut)
  }

  fn shutdown_write(&mut self, side: Side) {
    let this = &mut self.halves[side.index()];
    this.write_shut = true;
    if let Err(e) = this.stream.shutdown_write() {
      tracing::warn!(%side, addr = %this.addr, error = ?e, "Write shutdown failed");
      self.errors += 1;
    }
  }

  /// The far end of `side` can no longer receive; its backlog is unsendable
  fn lose_outbound(&mut self, side: Side, cause: Option<io::Error>) -> TunnelStatus {
    let this = &mut self.halves[side.index()];
    let lost = this.outbound.discard();
    tracing::debug!(
      %side,
      addr = %this.addr,
      lost,
      error = ?cause,
      "Connection lost while sending"
    );
    this.done = true;
    this.write_shut = true;
    this.read_closed = true;
    this.readiness = Readiness::default();
    self.close(side.peer())
  }

  /// Whether `side` can still produce bytes its peer will accept
  pub fn can_receive(&self, side: Side) -> bool {
    !self.half(side).read_closed && !self.half(side.peer()).done
  }

  pub fn wants_flush(&self, side: Side) -> bool {
    let half = self.half(side);
    half.readiness.writable && !half.outbound.is_empty()
  }

  /// Reading pauses while the destination backlog is at or above `max_buffered`
  pub fn wants_receive(&self, side: Side, max_buffered: Option<usize>) -> bool {
    let under_limit = max_buffered.map_or(true, |limit| self.half(side.peer()).outbound.len() < limit);
    self.half(side).readiness.readable && self.can_receive(side) && under_limit
  }

  /// Poll interest for `side`, or `None` when it needs no events at all
  pub fn interest(&self, side: Side) -> Option<Interest> {
    let readable = self.can_receive(side).then_some(Interest::READABLE);
    let writable = (!self.half(side).outbound.is_empty()).then_some(Interest::WRITABLE);
    match (readable, writable) {
      (Some(r), Some(w)) => Some(r | w),
      (r, w) => r.or(w),
    }
  }

  /// Bytes relayed so far as (local to remote, remote to local)
  pub fn bytes_relayed(&self) -> (u64, u64) {
    (
      self.half(Side::Remote).bytes_sent,
      self.half(Side::Local).bytes_sent,
    )
  }
}

impl<S> std::fmt::Debug for Tunnel<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Tunnel")
      .field("local", &self.halves[0])
      .field("remote", &self.halves[1])
      .field("errors", &self.errors)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;
  use std::io::{self, ErrorKind, Read, Write};
  use std::net::SocketAddr;

  use mio::Interest;

  use super::{Side, Tunnel, TunnelError, TunnelHalf, TunnelStatus};
  use crate::util::tunnel_stream::TunnelStream;

  /// A memory stream whose reads replay a script and whose writes can be throttled
  #[derive(Default)]
  struct ScriptedStream {
    incoming: VecDeque<io::Result<Vec<u8>>>,
    written: Vec<u8>,
    write_budget: Option<usize>,
    write_error: Option<ErrorKind>,
    write_zero: bool,
    shutdowns: usize,
    fail_shutdown: bool,
  }

  impl ScriptedStream {
    fn reading(chunks: &[&[u8]]) -> Self {
      Self {
        incoming: chunks.iter().map(|c| Ok(c.to_vec())).collect(),
        ..Default::default()
      }
    }

    fn throttled(budget: usize) -> Self {
      Self {
        write_budget: Some(budget),
        ..Default::default()
      }
    }
  }

  impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      match self.incoming.pop_front() {
        None => Err(ErrorKind::WouldBlock.into()),
        Some(Err(e)) => Err(e),
        Some(Ok(chunk)) => {
          let count = chunk.len().min(buf.len());
          buf[..count].copy_from_slice(&chunk[..count]);
          if count < chunk.len() {
            self.incoming.push_front(Ok(chunk[count..].to_vec()));
          }
          Ok(count)
        }
      }
    }
  }

  impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      if let Some(kind) = self.write_error {
        return Err(kind.into());
      }
      if self.write_zero {
        return Ok(0);
      }
      let count = match self.write_budget {
        None => buf.len(),
        Some(budget) => budget.min(buf.len()),
      };
      if count == 0 && !buf.is_empty() {
        return Err(ErrorKind::WouldBlock.into());
      }
      self.written.extend_from_slice(&buf[..count]);
      if let Some(budget) = self.write_budget.as_mut() {
        *budget -= count;
      }
      Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  impl TunnelStream for ScriptedStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
      self.shutdowns += 1;
      if self.fail_shutdown {
        Err(ErrorKind::NotConnected.into())
      } else {
        Ok(())
      }
    }
  }

  fn tunnel(local: ScriptedStream, remote: ScriptedStream) -> Tunnel<ScriptedStream> {
    let local_addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    let remote_addr: SocketAddr = "10.0.0.2:8000".parse().unwrap();
    Tunnel::new(
      TunnelHalf::new(Side::Local, local_addr, local),
      TunnelHalf::new(Side::Remote, remote_addr, remote),
    )
  }

  fn stream(t: &Tunnel<ScriptedStream>, side: Side) -> &ScriptedStream {
    t.half(side).stream()
  }

  #[test]
  fn received_bytes_are_flushed_to_peer_immediately() {
    let mut t = tunnel(ScriptedStream::reading(&[b"ping"]), Default::default());
    let mut scratch = [0u8; 4096];
    assert_eq!(t.receive(Side::Local, &mut scratch).unwrap(), TunnelStatus::Continue);
    assert_eq!(stream(&t, Side::Remote).written, b"ping");
    assert_eq!(t.half(Side::Remote).buffered(), 0);
    assert_eq!(t.bytes_relayed(), (4, 0));
  }

  #[test]
  fn unwritable_peer_keeps_bytes_buffered_in_order() {
    let mut t = tunnel(
      ScriptedStream::reading(&[b"hello", b" world"]),
      ScriptedStream::throttled(3),
    );
    t.half_mut(Side::Remote).mark_ready(false, true);
    let mut scratch = [0u8; 4096];
    t.receive(Side::Local, &mut scratch).unwrap();
    assert_eq!(stream(&t, Side::Remote).written, b"hel");
    t.receive(Side::Local, &mut scratch).unwrap();
    assert_eq!(t.half(Side::Remote).buffered(), 8);
    assert!(
      !t.half(Side::Remote).readiness().writable,
      "A would-block send must consume the writable signal"
    );
    assert_eq!(t.interest(Side::Remote), Some(Interest::READABLE | Interest::WRITABLE));

    t.half_mut(Side::Remote).stream_mut().write_budget = None;
    t.flush(Side::Remote).unwrap();
    assert_eq!(stream(&t, Side::Remote).written, b"hello world");
    assert_eq!(t.interest(Side::Remote), Some(Interest::READABLE));
  }

  #[test]
  fn small_scratch_buffer_reads_in_chunks() {
    let mut t = tunnel(ScriptedStream::reading(&[b"abcdefgh"]), Default::default());
    let mut scratch = [0u8; 3];
    for _ in 0..3 {
      t.receive(Side::Local, &mut scratch).unwrap();
    }
    assert_eq!(stream(&t, Side::Remote).written, b"abcdefgh");
  }

  #[test]
  fn end_of_stream_half_closes_the_peer_only() {
    let mut t = tunnel(ScriptedStream::reading(&[b""]), Default::default());
    let mut scratch = [0u8; 16];
    assert_eq!(t.receive(Side::Local, &mut scratch).unwrap(), TunnelStatus::Continue);
    assert!(t.half(Side::Remote).is_done());
    assert_eq!(stream(&t, Side::Remote).shutdowns, 1);
    assert!(!t.half(Side::Local).is_done());
    assert!(t.half(Side::Local).is_read_closed());
    assert_eq!(t.interest(Side::Local), None);
    assert_eq!(t.interest(Side::Remote), Some(Interest::READABLE));
  }

  #[test]
  fn pair_closes_only_after_both_halves_are_done() {
    let mut t = tunnel(
      ScriptedStream::reading(&[b""]),
      ScriptedStream::reading(&[b"late reply", b""]),
    );
    let mut scratch = [0u8; 64];
    t.receive(Side::Local, &mut scratch).unwrap();
    assert!(!t.is_closed());
    // The remote may keep talking after the client stopped sending
    assert_eq!(t.receive(Side::Remote, &mut scratch).unwrap(), TunnelStatus::Continue);
    assert_eq!(stream(&t, Side::Local).written, b"late reply");
    assert_eq!(t.receive(Side::Remote, &mut scratch).unwrap(), TunnelStatus::Shutdown);
    assert!(t.is_closed());
    assert_eq!(stream(&t, Side::Local).shutdowns, 1);
    assert_eq!(stream(&t, Side::Remote).shutdowns, 1);
  }

  #[test]
  fn write_shutdown_waits_for_backlog_to_drain() {
    let mut t = tunnel(
      ScriptedStream::reading(&[b"abcd", b""]),
      ScriptedStream::throttled(2),
    );
    let mut scratch = [0u8; 64];
    t.receive(Side::Local, &mut scratch).unwrap();
    t.receive(Side::Local, &mut scratch).unwrap();
    assert!(t.half(Side::Remote).is_done());
    assert_eq!(
      stream(&t, Side::Remote).shutdowns,
      0,
      "Shutting down with bytes still queued would truncate the stream"
    );
    assert!(!t.half(Side::Remote).write_shut);

    t.half_mut(Side::Remote).stream_mut().write_budget = None;
    assert_eq!(t.flush(Side::Remote).unwrap(), TunnelStatus::Continue);
    assert_eq!(stream(&t, Side::Remote).written, b"abcd");
    assert_eq!(stream(&t, Side::Remote).shutdowns, 1);
  }

  #[test]
  fn reset_while_receiving_half_closes_the_peer() {
    let mut local = ScriptedStream::default();
    local
      .incoming
      .push_back(Err(ErrorKind::ConnectionReset.into()));
    let mut t = tunnel(local, Default::default());
    let mut scratch = [0u8; 64];
    assert_eq!(t.receive(Side::Local, &mut scratch).unwrap(), TunnelStatus::Continue);
    assert!(t.half(Side::Remote).is_done());
    assert!(t.half(Side::Local).is_read_closed());
  }

  #[test]
  fn zero_length_send_is_treated_as_connection_loss() {
    let remote = ScriptedStream {
      write_zero: true,
      ..Default::default()
    };
    let mut t = tunnel(ScriptedStream::reading(&[b"data"]), remote);
    let mut scratch = [0u8; 64];
    assert_eq!(t.receive(Side::Local, &mut scratch).unwrap(), TunnelStatus::Shutdown);
    assert_eq!(t.half(Side::Remote).buffered(), 0);
    assert!(t.half(Side::Local).is_done());
    assert_eq!(stream(&t, Side::Local).shutdowns, 1);
  }

  #[test]
  fn broken_pipe_on_send_half_closes_the_peer() {
    let local = ScriptedStream {
      write_error: Some(ErrorKind::BrokenPipe),
      ..Default::default()
    };
    let mut t = tunnel(local, ScriptedStream::reading(&[b"reply"]));
    let mut scratch = [0u8; 64];
    assert!(t.receive(Side::Remote, &mut scratch).unwrap().is_terminal());
    assert!(t.half(Side::Remote).is_done());
  }

  #[test]
  fn teardown_failures_are_tallied_not_fatal() {
    let failing = |chunks: &[&[u8]]| ScriptedStream {
      fail_shutdown: true,
      ..ScriptedStream::reading(chunks)
    };
    let mut t = tunnel(failing(&[b""]), failing(&[b""]));
    let mut scratch = [0u8; 64];
    assert_eq!(t.receive(Side::Local, &mut scratch).unwrap(), TunnelStatus::Continue);
    assert_eq!(
      t.receive(Side::Remote, &mut scratch).unwrap(),
      TunnelStatus::ShutdownWithErrors(2)
    );
  }

  #[test]
  fn close_is_idempotent() {
    let mut t = tunnel(Default::default(), Default::default());
    assert_eq!(t.close(Side::Local), TunnelStatus::Continue);
    assert_eq!(t.close(Side::Local), TunnelStatus::Continue);
    assert_eq!(stream(&t, Side::Local).shutdowns, 1);
    assert_eq!(t.close(Side::Remote), TunnelStatus::Shutdown);
  }

  #[test]
  fn would_block_consumes_read_readiness() {
    let mut t = tunnel(Default::default(), Default::default());
    t.half_mut(Side::Local).mark_ready(true, false);
    assert!(t.wants_receive(Side::Local, None));
    t.receive(Side::Local, &mut [0u8; 8]).unwrap();
    assert!(!t.wants_receive(Side::Local, None));
  }

  #[test]
  fn reading_pauses_while_destination_backlog_is_full() {
    let mut t = tunnel(
      ScriptedStream::reading(&[b"0123456789"]),
      ScriptedStream::throttled(0),
    );
    t.half_mut(Side::Local).mark_ready(true, false);
    t.receive(Side::Local, &mut [0u8; 64]).unwrap();
    assert_eq!(t.half(Side::Remote).buffered(), 10);
    assert!(!t.wants_receive(Side::Local, Some(10)));
    assert!(t.wants_receive(Side::Local, Some(11)));
    assert!(t.wants_receive(Side::Local, None));
  }

  #[test]
  fn unexpected_errors_are_surfaced() {
    let mut local = ScriptedStream::default();
    local
      .incoming
      .push_back(Err(ErrorKind::PermissionDenied.into()));
    let mut t = tunnel(local, Default::default());
    assert!(matches!(
      t.receive(Side::Local, &mut [0u8; 8]),
      Err(TunnelError::Receive {
        side: Side::Local,
        ..
      })
    ));
  }
}
