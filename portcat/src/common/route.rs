// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Forwarding rules and the table that bootstraps one listener per rule
//!
//! A route specifier has the form `[[local_host:]local_port:]remote_host:remote_port`.
//! An omitted local host listens on all interfaces; an omitted local port is
//! assigned by the OS at bind time. Only IPv4 is supported.

use std::{
  net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs},
  str::FromStr,
  time::Duration,
};

use crate::server::listener::{Listener, ListenerError};

/// One forwarding rule: connections accepted on `local` are relayed to `remote`
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Route {
  local: SocketAddrV4,
  remote: SocketAddrV4,
}

impl Route {
  pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
    Self { local, remote }
  }

  pub fn local_address(&self) -> SocketAddr {
    SocketAddr::V4(self.local)
  }

  pub fn remote_address(&self) -> SocketAddr {
    SocketAddr::V4(self.remote)
  }
}

impl std::fmt::Display for Route {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} -> {}", self.local, self.remote)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteParseError {
  #[error("Route specifiers take the form [[local_host:]local_port:]remote_host:remote_port")]
  MalformedSpecifier,
  #[error("IPv6 addresses are not supported")]
  Ipv6NotSupported,
  #[error("Host must not be empty")]
  EmptyHost,
  #[error("Invalid host {0:?}")]
  InvalidHost(String),
  #[error("Invalid port {0:?}")]
  InvalidPort(String),
  #[error("Port {0} is out of range")]
  PortOutOfRange(u64),
  #[error("Remote port must not be zero")]
  ZeroRemotePort,
  #[error("Could not resolve host {host:?}")]
  UnresolvableHost {
    host: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Host {0:?} did not resolve to any IPv4 address")]
  NoIpv4Address(String),
}

/// A route specifier that is syntactically valid but whose hostnames are not yet resolved
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RouteSpecifier<'a> {
  local_host: Option<&'a str>,
  local_port: u16,
  remote_host: &'a str,
  remote_port: u16,
}

impl<'a> RouteSpecifier<'a> {
  /// Checks the specifier's shape, ports, and host syntax without touching the resolver
  pub fn parse(s: &'a str) -> Result<Self, RouteParseError> {
    if s.contains('[') || s.contains(']') || s.contains("::") {
      return Err(RouteParseError::Ipv6NotSupported);
    }
    let segments = s.split(':').collect::<Vec<_>>();
    let (local_host, local_port, remote_host, remote_port) = match segments.as_slice() {
      [remote_host, remote_port] => (None, None, *remote_host, *remote_port),
      [local_port, remote_host, remote_port] => {
        (None, Some(*local_port), *remote_host, *remote_port)
      }
      [local_host, local_port, remote_host, remote_port] => (
        Some(*local_host),
        Some(*local_port),
        *remote_host,
        *remote_port,
      ),
      _ => return Err(RouteParseError::MalformedSpecifier),
    };

    let local_port = local_port.map(parse_port).transpose()?.unwrap_or(0);
    let remote_port = parse_port(remote_port)?;
    if remote_port == 0 {
      return Err(RouteParseError::ZeroRemotePort);
    }
    if let Some(host) = local_host {
      check_host(host)?;
    }
    check_host(remote_host)?;
    Ok(Self {
      local_host,
      local_port,
      remote_host,
      remote_port,
    })
  }

  /// Resolve both hosts, keeping only IPv4 results
  pub fn resolve(&self) -> Result<Route, RouteParseError> {
    let local = match self.local_host {
      None => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.local_port),
      Some(host) => resolve_ipv4(host, self.local_port)?,
    };
    let remote = resolve_ipv4(self.remote_host, self.remote_port)?;
    Ok(Route::new(local, remote))
  }
}

impl FromStr for Route {
  type Err = RouteParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    RouteSpecifier::parse(s)?.resolve()
  }
}

fn parse_port(v: &str) -> Result<u16, RouteParseError> {
  if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
    return Err(RouteParseError::InvalidPort(v.to_owned()));
  }
  // Digits-only input can still overflow a u64; anything that long is out of range anyway
  let wide = v.parse::<u64>().unwrap_or(u64::MAX);
  u16::try_from(wide).map_err(|_| RouteParseError::PortOutOfRange(wide))
}

fn is_hostname(host: &str) -> bool {
  let labels_valid = host.split('.').all(|label| {
    !label.is_empty()
      && !label.starts_with('-')
      && !label.ends_with('-')
      && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
  });
  // Dotted digits that failed to parse as an Ipv4Addr are a malformed literal, not a name
  let looks_numeric = host.bytes().all(|b| b.is_ascii_digit() || b == b'.');
  labels_valid && !looks_numeric
}

fn check_host(host: &str) -> Result<(), RouteParseError> {
  if host.is_empty() {
    Err(RouteParseError::EmptyHost)
  } else if host.parse::<Ipv4Addr>().is_ok() || is_hostname(host) {
    Ok(())
  } else {
    Err(RouteParseError::InvalidHost(host.to_owned()))
  }
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4, RouteParseError> {
  if let Ok(ip) = host.parse::<Ipv4Addr>() {
    return Ok(SocketAddrV4::new(ip, port));
  }
  let resolved = (host, port)
    .to_socket_addrs()
    .map_err(|source| RouteParseError::UnresolvableHost {
      host: host.to_owned(),
      source,
    })?;
  resolved
    .filter_map(|addr| match addr {
      SocketAddr::V4(v4) => Some(v4),
      SocketAddr::V6(_) => None,
    })
    .next()
    .ok_or_else(|| RouteParseError::NoIpv4Address(host.to_owned()))
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid route specifier #{index} ({spec:?})")]
pub struct RouteTableError {
  pub index: usize,
  pub spec: String,
  #[source]
  pub source: RouteParseError,
}

/// The full set of routes; every route is served concurrently by its own [`Listener`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTable {
  routes: Vec<Route>,
}

impl RouteTable {
  /// Parses every specifier, failing the whole table on the first invalid one
  pub fn parse_all<Specs, Spec>(specs: Specs) -> Result<Self, RouteTableError>
  where
    Specs: IntoIterator<Item = Spec>,
    Spec: AsRef<str>,
  {
    specs
      .into_iter()
      .enumerate()
      .map(|(index, spec)| {
        let spec = spec.as_ref();
        spec.parse::<Route>().map_err(|source| RouteTableError {
          index,
          spec: spec.to_owned(),
          source,
        })
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.routes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.routes.is_empty()
  }

  /// Binds a listener for every route, or none at all
  ///
  /// Listeners bound before a failing route are closed before the error is returned.
  pub fn bind_all(&self, connect_timeout: Option<Duration>) -> Result<Vec<Listener>, ListenerError> {
    let mut listeners = Vec::with_capacity(self.routes.len());
    for route in self.routes.iter() {
      match Listener::bind(*route) {
        Ok(listener) => listeners.push(listener.with_connect_timeout(connect_timeout)),
        Err(e) => {
          if !listeners.is_empty() {
            tracing::warn!(
              bound = listeners.len(),
              "Closing previously bound listeners after bind failure"
            );
          }
          drop(listeners);
          return Err(e);
        }
      }
    }
    Ok(listeners)
  }
}

impl FromIterator<Route> for RouteTable {
  fn from_iter<T: IntoIterator<Item = Route>>(iter: T) -> Self {
    Self {
      routes: iter.into_iter().collect(),
    }
  }
}
