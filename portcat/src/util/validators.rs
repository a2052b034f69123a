// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::time::Duration;

use crate::common::route::RouteSpecifier;

/// Whole seconds; `0` maps to `None`, meaning "no limit" to the caller
pub fn parse_seconds(v: &str) -> Result<Option<Duration>> {
  match v.trim().parse::<u64>() {
    Ok(0) => Ok(None),
    Ok(secs) => Ok(Some(Duration::from_secs(secs))),
    Err(_) => Err(AnyErr::msg("Duration must be a whole number of seconds")),
  }
}

/// A byte count with an optional binary suffix: `4096`, `64k`, `1m`
pub fn parse_byte_count(v: &str) -> Result<usize> {
  let v = v.trim();
  let (digits, multiplier) = match v.char_indices().last() {
    None => return Err(AnyErr::msg("Byte count must not be empty")),
    Some((idx, c)) => match c.to_ascii_lowercase() {
      'k' => (&v[..idx], 1024usize),
      'm' => (&v[..idx], 1024 * 1024),
      'g' => (&v[..idx], 1024 * 1024 * 1024),
      _ => (v, 1),
    },
  };
  let count = digits
    .parse::<usize>()
    .map_err(|_| AnyErr::msg("Byte count must be a whole number with an optional k/m/g suffix"))?;
  count
    .checked_mul(multiplier)
    .ok_or_else(|| AnyErr::msg("Byte count overflows the platform word size"))
}

/// Syntax only; hostnames are resolved once, when the route table is built
pub fn validate_route(v: &str) -> Result<(), String> {
  RouteSpecifier::parse(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_byte_count(v: &str) -> Result<(), String> {
  match parse_byte_count(v) {
    Ok(0) => Err(String::from("Byte count must be greater than zero")),
    Ok(_) => Ok(()),
    Err(e) => Err(e.to_string()),
  }
}
