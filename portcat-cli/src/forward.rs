// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use portcat::{
  common::route::RouteTable,
  server::{EventLoop, EventLoopConfig},
  util::shutdown::ShutdownTrigger,
};
use signal_hook::{
  consts::{SIGINT, SIGTERM},
  iterator::Signals,
};
use std::{thread::JoinHandle, time::Duration};

/// Parameters used to run the forwarder
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ForwardArgs {
  pub routes: RouteTable,
  pub connect_timeout: Option<Duration>,
  pub event_loop: EventLoopConfig,
}

/// Bind every route, then relay until SIGINT or SIGTERM
///
/// Listener bring-up is all-or-nothing: a route that cannot be bound closes the others.
#[tracing::instrument(
skip(config),
fields(
routes=config.routes.len(),
connect_timeout=?config.connect_timeout,
),
err
)]
pub fn forward_main(config: ForwardArgs) -> Result<()> {
  let mut event_loop =
    EventLoop::new(config.event_loop).context("Failed to create the event loop")?;
  let listeners = config
    .routes
    .bind_all(config.connect_timeout)
    .context("Failed to bind routes")?;
  for listener in listeners {
    event_loop
      .add_listener(listener)
      .context("Failed to watch listener")?;
  }

  let (signal_handle, signal_thread) = spawn_signal_listener(event_loop.shutdown_trigger())?;
  let result = event_loop.run();

  signal_handle.close();
  let _ = signal_thread.join();

  result.context("Event loop failed")
}

fn spawn_signal_listener(
  trigger: ShutdownTrigger,
) -> Result<(signal_hook::iterator::Handle, JoinHandle<()>)> {
  let mut signals =
    Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
  let handle = signals.handle();
  let thread = std::thread::Builder::new()
    .name("signal-listener".into())
    .spawn(move || {
      if let Some(signal) = signals.forever().next() {
        tracing::trace!(signal, "Signal received, initiating graceful shutdown");
        if let Err(e) = trigger.trigger() {
          tracing::error!(err = ?e, "Failed to wake the event loop");
        }
      }
    })
    .context("Failed to spawn the signal listener")?;
  Ok((handle, thread))
}
