// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::{self, ErrorKind},
  net::{Shutdown, SocketAddr},
  time::Duration,
};

use mio::net::{TcpListener, TcpStream};

use crate::common::{
  route::Route,
  tunnel::{Side, Tunnel, TunnelHalf},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
  #[error("Failed to bind listener for route {route}")]
  Bind {
    route: Route,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
  #[error("Failed to accept a client on {local}")]
  Accept {
    local: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("Failed to open tunnel: {local} -> {remote} (client {client})")]
  Dial {
    local: SocketAddr,
    remote: SocketAddr,
    client: SocketAddr,
    #[source]
    source: io::Error,
  },
}

impl AcceptError {
  /// Whether the listener may still have clients queued behind this failure
  pub fn is_transient(&self) -> bool {
    match self {
      AcceptError::Dial { .. } => true,
      AcceptError::Accept { source, .. } => matches!(
        source.kind(),
        ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
      ),
    }
  }
}

/// A bound, listening socket serving one [`Route`]
///
/// Each accepted client is paired with a fresh connection to the route's remote address.
/// The remote dial is synchronous: it stalls the event loop for up to the connect timeout.
#[derive(Debug)]
pub struct Listener {
  route: Route,
  socket: TcpListener,
  local_addr: SocketAddr,
  connect_timeout: Option<Duration>,
}

impl Listener {
  /// Bind and listen on the route's local address; port 0 resolves to an ephemeral port
  #[tracing::instrument(level = "debug", err)]
  pub fn bind(route: Route) -> Result<Self, ListenerError> {
    let bind_error = |source| ListenerError::Bind { route, source };
    let socket = TcpListener::bind(route.local_address()).map_err(bind_error)?;
    let local_addr = socket.local_addr().map_err(bind_error)?;
    tracing::info!(%local_addr, remote = %route.remote_address(), "Listening");
    Ok(Self {
      route,
      socket,
      local_addr,
      connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
    })
  }

  /// `None` leaves the dial bounded only by the operating system's connect timeout
  pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }

  /// The bound address, with any ephemeral port resolved
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.route.remote_address()
  }

  pub(crate) fn socket_mut(&mut self) -> &mut TcpListener {
    &mut self.socket
  }

  /// Accept one pending client and connect it to the route's remote address
  ///
  /// Returns `Ok(None)` when no client is waiting. If the remote cannot be reached, the
  /// accepted client is closed and no tunnel is produced.
  #[tracing::instrument(level = "trace", skip(self), fields(local = %self.local_addr))]
  pub fn accept(&self) -> Result<Option<Tunnel<TcpStream>>, AcceptError> {
    let (client, client_addr) = match self.socket.accept() {
      Ok(accepted) => accepted,
      Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
      Err(source) => {
        return Err(AcceptError::Accept {
          local: self.local_addr,
          source,
        })
      }
    };
    let remote_addr = self.remote_addr();
    tracing::trace!(client = %client_addr, remote = %remote_addr, "Dialing remote");
    let remote = match self.dial() {
      Ok(remote) => remote,
      Err(source) => {
        // Errors closing the orphaned client don't change the outcome
        let _ = client.shutdown(Shutdown::Both);
        drop(client);
        return Err(AcceptError::Dial {
          local: self.local_addr,
          remote: remote_addr,
          client: client_addr,
          source,
        });
      }
    };
    Ok(Some(Tunnel::new(
      TunnelHalf::new(Side::Local, client_addr, client),
      TunnelHalf::new(Side::Remote, remote_addr, remote),
    )))
  }

  fn dial(&self) -> io::Result<TcpStream> {
    let remote = self.remote_addr();
    let stream = match self.connect_timeout {
      Some(timeout) => std::net::TcpStream::connect_timeout(&remote, timeout)?,
      None => std::net::TcpStream::connect(remote)?,
    };
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream))
  }
}
