// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use portcat::{
  common::route::RouteTable,
  server::EventLoopConfig,
  util::validators::{
    parse_byte_count, parse_seconds, validate_byte_count, validate_route, validate_seconds,
  },
};

mod forward;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = command().get_matches();
  match main_args_handler(&matches) {
    Err(err) => {
      tracing::error!(err = ?err, "forwarder_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("Forwarder exited successfully"),
  }
}

fn command() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("routes")
        .help("Forwarding rules of the form [[local_host:]local_port:]remote_host:remote_port")
        .value_name("ROUTE")
        .validator(validate_route)
        .takes_value(true)
        .multiple_values(true),
    )
    .arg(
      Arg::new("idle-timeout")
        .help("Seconds a poll may block without any readiness")
        .long("idle-timeout")
        .validator(validate_seconds)
        .default_value("60")
        .takes_value(true),
    )
    .arg(
      Arg::new("connect-timeout")
        .help("Seconds to wait when dialing a remote; 0 defers to the OS")
        .long("connect-timeout")
        .short('t')
        .validator(validate_seconds)
        .default_value("10")
        .takes_value(true),
    )
    .arg(
      Arg::new("chunk-size")
        .help("Bytes read from a socket per receive (k/m suffixes allowed)")
        .long("chunk-size")
        .validator(validate_byte_count)
        .default_value("4096")
        .takes_value(true),
    )
    .arg(
      Arg::new("max-buffer")
        .help("Pause reading from a side once its destination has this many bytes queued")
        .long("max-buffer")
        .validator(validate_byte_count)
        .takes_value(true)
        .required(false),
    )
}

pub fn forward_arg_handling(args: &'_ ArgMatches) -> Result<forward::ForwardArgs> {
  let specs = args
    .values_of("routes")
    .map(|specs| specs.collect::<Vec<_>>())
    .unwrap_or_default();
  let routes = RouteTable::parse_all(specs)?;
  let idle_timeout = parse_seconds(args.value_of("idle-timeout").unwrap())?
    .ok_or_else(|| anyhow::Error::msg("Idle timeout must be at least one second"))?;
  let connect_timeout = parse_seconds(args.value_of("connect-timeout").unwrap())?;
  let read_chunk_size = parse_byte_count(args.value_of("chunk-size").unwrap())?;
  let max_buffered_bytes = args
    .value_of("max-buffer")
    .map(parse_byte_count)
    .transpose()?;

  Ok(forward::ForwardArgs {
    routes,
    connect_timeout,
    event_loop: EventLoopConfig {
      idle_timeout,
      read_chunk_size,
      max_buffered_bytes,
      ..Default::default()
    },
  })
}

fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let config = forward_arg_handling(matches).context("Invalid arguments")?;
  if config.routes.is_empty() {
    tracing::warn!("No routes configured; nothing will be forwarded");
  }
  tracing::info!("Running forwarder with config {:#?}", config);
  forward::forward_main(config)
}
