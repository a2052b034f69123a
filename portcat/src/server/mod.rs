// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The readiness-driven relay engine
//!
//! One [`EventLoop`] services every listener and every tunnel on a single thread. Each
//! iteration polls for readiness, flushes every writable backlog, then accepts pending
//! clients and performs one read on each readable half. Draining before reading keeps a
//! fast sender from growing a slow receiver's backlog without bound.

use std::{
  collections::{BTreeMap, HashMap},
  io::{self, ErrorKind},
  net::SocketAddr,
  time::Duration,
};

use mio::{net::TcpStream, Events, Interest, Poll, Registry, Token, Waker};

pub mod listener;

pub use self::listener::{AcceptError, Listener, ListenerError, DEFAULT_CONNECT_TIMEOUT};

use crate::common::tunnel::{
  id::MonotonicGenerator, Side, Tunnel, TunnelError, TunnelId, TunnelStatus,
};
use crate::util::shutdown::ShutdownTrigger;

const WAKE_TOKEN: Token = Token(0);
const SIDES: [Side; 2] = [Side::Local, Side::Remote];

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Parameters for an [`EventLoop`]
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct EventLoopConfig {
  /// Longest a poll may block without any readiness
  pub idle_timeout: Duration,
  /// Bytes requested from a socket per receive
  pub read_chunk_size: usize,
  /// Pause reading from a half while its peer's backlog is at least this large
  pub max_buffered_bytes: Option<usize>,
  pub events_capacity: usize,
}

impl Default for EventLoopConfig {
  fn default() -> Self {
    Self {
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
      read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
      max_buffered_bytes: None,
      events_capacity: 1024,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum EventLoopError {
  #[error("Failed to set up the readiness poll")]
  Setup(#[source] io::Error),
  #[error("Readiness poll failed")]
  Poll(#[source] io::Error),
  #[error("Failed to watch listener on {addr}")]
  Register {
    addr: SocketAddr,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Copy, Clone)]
enum Handle {
  Listener,
  Half(TunnelId, Side),
}

#[derive(Debug, Copy, Clone)]
enum Op {
  Flush,
  Receive,
}

#[derive(Debug)]
struct WatchedListener {
  listener: Listener,
  /// Readiness not yet consumed by a would-block accept
  pending: bool,
}

#[derive(Debug)]
struct WatchedTunnel {
  tunnel: Tunnel<TcpStream>,
  tokens: [Token; 2],
  interests: [Option<Interest>; 2],
}

impl WatchedTunnel {
  /// Bring each half's poll registration in line with what it currently needs
  fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
    for side in SIDES {
      let slot = side.index();
      let desired = self.tunnel.interest(side);
      let current = self.interests[slot];
      if desired == current {
        continue;
      }
      let token = self.tokens[slot];
      let stream = self.tunnel.half_mut(side).stream_mut();
      match (current, desired) {
        (None, Some(interest)) => registry.register(stream, token, interest)?,
        (Some(_), Some(interest)) => registry.reregister(stream, token, interest)?,
        (Some(_), None) => registry.deregister(stream)?,
        (None, None) => {}
      }
      self.interests[slot] = desired;
    }
    Ok(())
  }

  /// Remove both halves from the poll, returning how many deregistrations failed
  fn deregister(&mut self, registry: &Registry) -> usize {
    let mut failures = 0;
    for side in SIDES {
      if self.interests[side.index()].take().is_some() {
        let half = self.tunnel.half_mut(side);
        if let Err(e) = registry.deregister(half.stream_mut()) {
          tracing::warn!(%side, addr = %half.addr(), error = ?e, "Deregistration failed");
          failures += 1;
        }
      }
    }
    failures
  }
}

/// Owns the watch set: every listener and live tunnel half, and the poll that observes them
pub struct EventLoop {
  poll: Poll,
  events: Events,
  config: EventLoopConfig,
  shutdown: ShutdownTrigger,
  handles: HashMap<Token, Handle>,
  listeners: BTreeMap<Token, WatchedListener>,
  tunnels: BTreeMap<TunnelId, WatchedTunnel>,
  tunnel_ids: MonotonicGenerator,
  next_token: usize,
  scratch: Vec<u8>,
}

impl EventLoop {
  pub fn new(config: EventLoopConfig) -> Result<Self, EventLoopError> {
    let poll = Poll::new().map_err(EventLoopError::Setup)?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(EventLoopError::Setup)?;
    Ok(Self {
      events: Events::with_capacity(config.events_capacity.max(1)),
      scratch: vec![0u8; config.read_chunk_size.max(1)],
      poll,
      config,
      shutdown: ShutdownTrigger::new(waker),
      handles: HashMap::new(),
      listeners: BTreeMap::new(),
      tunnels: BTreeMap::new(),
      tunnel_ids: MonotonicGenerator::default(),
      next_token: WAKE_TOKEN.0 + 1,
    })
  }

  /// A handle that stops [`run`](Self::run) from any thread
  pub fn shutdown_trigger(&self) -> ShutdownTrigger {
    self.shutdown.clone()
  }

  /// Start watching `listener` for clients, returning its bound address
  pub fn add_listener(&mut self, mut listener: Listener) -> Result<SocketAddr, EventLoopError> {
    let token = self.allocate_token();
    let addr = listener.local_addr();
    self
      .poll
      .registry()
      .register(listener.socket_mut(), token, Interest::READABLE)
      .map_err(|source| EventLoopError::Register { addr, source })?;
    self.handles.insert(token, Handle::Listener);
    self.listeners.insert(
      token,
      WatchedListener {
        listener,
        pending: false,
      },
    );
    Ok(addr)
  }

  pub fn listener_addrs(&self) -> Vec<SocketAddr> {
    self
      .listeners
      .values()
      .map(|w| w.listener.local_addr())
      .collect()
  }

  /// Number of watched handles: listeners plus the halves of every live tunnel
  pub fn watch_len(&self) -> usize {
    self.handles.len()
  }

  pub fn tunnel_count(&self) -> usize {
    self.tunnels.len()
  }

  fn allocate_token(&mut self) -> Token {
    // Tokens are never reused, so late events for retired handles can't alias new ones
    let token = Token(self.next_token);
    self.next_token += 1;
    token
  }

  /// Service the watch set until the shutdown trigger fires
  pub fn run(&mut self) -> Result<(), EventLoopError> {
    tracing::info!(listeners = ?self.listener_addrs(), "Ready");
    while !self.shutdown.is_triggered() {
      self.run_once(Some(self.config.idle_timeout))?;
    }
    self.close_all();
    Ok(())
  }

  /// One poll-and-dispatch iteration
  ///
  /// Blocks for at most `timeout`, or not at all while earlier readiness is still unconsumed.
  pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), EventLoopError> {
    let timeout = if self.has_pending_work() {
      Some(Duration::ZERO)
    } else {
      timeout
    };
    match self.poll.poll(&mut self.events, timeout) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
      Err(e) => return Err(EventLoopError::Poll(e)),
    }
    if self.events.is_empty() && timeout != Some(Duration::ZERO) {
      self.liveness_sweep();
    } else {
      self.record_readiness();
    }

    let writable = self.ready_halves(|tunnel, side| tunnel.wants_flush(side));
    for (id, side) in writable {
      self.service(id, side, Op::Flush);
    }

    let acceptable = self
      .listeners
      .iter()
      .filter(|(_, w)| w.pending)
      .map(|(token, _)| *token)
      .collect::<Vec<_>>();
    for token in acceptable {
      self.accept(token);
    }

    let max_buffered = self.config.max_buffered_bytes;
    let readable = self.ready_halves(|tunnel, side| tunnel.wants_receive(side, max_buffered));
    for (id, side) in readable {
      self.service(id, side, Op::Receive);
    }
    Ok(())
  }

  fn has_pending_work(&self) -> bool {
    let max_buffered = self.config.max_buffered_bytes;
    self.listeners.values().any(|w| w.pending)
      || self.tunnels.values().any(|w| {
        SIDES
          .into_iter()
          .any(|side| w.tunnel.wants_flush(side) || w.tunnel.wants_receive(side, max_buffered))
      })
  }

  /// Snapshot the halves matching `predicate` so servicing can mutate the watch set freely
  fn ready_halves<F>(&self, predicate: F) -> Vec<(TunnelId, Side)>
  where
    F: Fn(&Tunnel<TcpStream>, Side) -> bool,
  {
    self
      .tunnels
      .iter()
      .flat_map(|(id, w)| {
        SIDES
          .into_iter()
          .filter(|side| predicate(&w.tunnel, *side))
          .map(move |side| (*id, side))
          .collect::<Vec<_>>()
      })
      .collect()
  }

  fn record_readiness(&mut self) {
    for event in self.events.iter() {
      let token = event.token();
      if token == WAKE_TOKEN {
        continue;
      }
      match self.handles.get(&token) {
        Some(Handle::Listener) => {
          if let Some(watched) = self.listeners.get_mut(&token) {
            watched.pending = true;
          }
        }
        Some(Handle::Half(id, side)) => {
          if let Some(watched) = self.tunnels.get_mut(id) {
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            watched.tunnel.half_mut(*side).mark_ready(readable, writable);
          }
        }
        None => tracing::trace!(?token, "Ignoring readiness for a retired handle"),
      }
    }
  }

  /// Nothing became ready within the idle timeout; retry anything that could make progress
  ///
  /// Listeners are included so clients queued behind a failed accept are not stranded until
  /// the next connection arrives.
  fn liveness_sweep(&mut self) {
    tracing::trace!(tunnels = self.tunnels.len(), "Idle timeout elapsed");
    for watched in self.listeners.values_mut() {
      watched.pending = true;
    }
    for watched in self.tunnels.values_mut() {
      for side in SIDES {
        let readable = watched.tunnel.can_receive(side);
        let writable = watched.tunnel.half(side).buffered() > 0;
        watched.tunnel.half_mut(side).mark_ready(readable, writable);
      }
    }
  }

  fn accept(&mut self, token: Token) {
    let (accepted, local, remote) = match self.listeners.get_mut(&token) {
      None => return,
      Some(watched) => {
        let accepted = watched.listener.accept();
        match &accepted {
          Ok(None) => watched.pending = false,
          Err(e) if !e.is_transient() => watched.pending = false,
          _ => {}
        }
        (
          accepted,
          watched.listener.local_addr(),
          watched.listener.remote_addr(),
        )
      }
    };
    match accepted {
      Ok(None) => {}
      Ok(Some(tunnel)) => self.admit(tunnel),
      Err(e @ AcceptError::Dial { .. }) => {
        tracing::warn!(%local, %remote, err = ?e, "{}", e);
      }
      Err(e) => {
        tracing::error!(%local, err = ?e, "{}", e);
      }
    }
  }

  fn admit(&mut self, tunnel: Tunnel<TcpStream>) {
    let id = self.tunnel_ids.next_id();
    let tokens = [self.allocate_token(), self.allocate_token()];
    let client = tunnel.half(Side::Local).addr();
    let remote = tunnel.half(Side::Remote).addr();
    let mut watched = WatchedTunnel {
      tunnel,
      tokens,
      interests: [None, None],
    };
    if let Err(e) = watched.sync_interest(self.poll.registry()) {
      tracing::error!(tunnel = %id, err = ?e, "Failed to watch tunnel {} -> {}", client, remote);
      watched.deregister(self.poll.registry());
      return;
    }
    for side in SIDES {
      self.handles.insert(tokens[side.index()], Handle::Half(id, side));
    }
    self.tunnels.insert(id, watched);
    tracing::info!(tunnel = %id, "Tunnel opened: {} -> {}", client, remote);
  }

  fn service(&mut self, id: TunnelId, side: Side, op: Op) {
    // The tunnel may have been retired earlier in this batch
    let watched = match self.tunnels.get_mut(&id) {
      Some(watched) => watched,
      None => return,
    };
    let result = match op {
      Op::Flush => watched.tunnel.flush(side),
      Op::Receive => watched.tunnel.receive(side, &mut self.scratch),
    };
    self.settle(id, side, result);
  }

  /// Apply the outcome of one operation; a failure drops only the tunnel it occurred on
  fn settle(&mut self, id: TunnelId, side: Side, result: Result<TunnelStatus, TunnelError>) {
    match result {
      Ok(TunnelStatus::Continue) => {
        let synced = match self.tunnels.get_mut(&id) {
          Some(watched) => watched.sync_interest(self.poll.registry()),
          None => return,
        };
        if let Err(e) = synced {
          tracing::error!(tunnel = %id, %side, err = ?e, "Failed to update readiness interest");
          self.retire(id, side, true);
        }
      }
      Ok(_) => self.retire(id, side, false),
      Err(e) => {
        tracing::error!(tunnel = %id, err = ?e, "Tunnel failed: {}", e);
        self.retire(id, side, true);
      }
    }
  }

  /// Remove a tunnel from the watch set and close both of its sockets
  fn retire(&mut self, id: TunnelId, side: Side, failed: bool) {
    let mut watched = match self.tunnels.remove(&id) {
      Some(watched) => watched,
      None => return,
    };
    for token in watched.tokens {
      self.handles.remove(&token);
    }
    for _ in 0..watched.deregister(self.poll.registry()) {
      watched.tunnel.record_teardown_error();
    }
    let addr = watched.tunnel.half(side).addr();
    let (sent, received) = watched.tunnel.bytes_relayed();
    match (failed, watched.tunnel.status()) {
      (false, TunnelStatus::Shutdown) => tracing::info!(
        tunnel = %id,
        sent,
        received,
        "Connection shut down successfully ({}, {})",
        addr,
        side
      ),
      (false, TunnelStatus::ShutdownWithErrors(errors)) => tracing::warn!(
        tunnel = %id,
        sent,
        received,
        "Connection shut down with {} errors ({}, {})",
        errors,
        addr,
        side
      ),
      _ => tracing::warn!(
        tunnel = %id,
        sent,
        received,
        errors = watched.tunnel.error_count(),
        "Connection dropped ({}, {})",
        addr,
        side
      ),
    }
  }

  /// Drop every tunnel and listener, closing their sockets
  fn close_all(&mut self) {
    tracing::info!(
      tunnels = self.tunnels.len(),
      listeners = self.listeners.len(),
      "Shutting down"
    );
    let registry = self.poll.registry();
    for (_, mut watched) in std::mem::take(&mut self.tunnels) {
      watched.deregister(registry);
    }
    for (_, mut watched) in std::mem::take(&mut self.listeners) {
      // The poll is going away with the loop; a failure here has no consequence
      let _ = registry.deregister(watched.listener.socket_mut());
    }
    self.handles.clear();
  }
}

impl std::fmt::Debug for EventLoop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventLoop")
      .field("config", &self.config)
      .field("listeners", &self.listeners.len())
      .field("tunnels", &self.tunnels.len())
      .finish_non_exhaustive()
  }
}
