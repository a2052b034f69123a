// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::{Read, Result as IOResult, Write};
use std::net::Shutdown;

/// A non-blocking byte stream able to half-close its write direction
///
/// Abstracts over the socket type so tunnel halves can be driven by memory streams in tests.
pub trait TunnelStream: Read + Write {
  /// Announce that no further bytes will be written, leaving the read direction open
  fn shutdown_write(&mut self) -> IOResult<()>;
}

impl TunnelStream for mio::net::TcpStream {
  fn shutdown_write(&mut self) -> IOResult<()> {
    self.shutdown(Shutdown::Write)
  }
}
