// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A single-threaded, readiness-driven TCP port forwarder
//!
//! Each configured [`Route`](common::route::Route) gets a [`Listener`](server::Listener);
//! every accepted client is paired with a fresh connection to the route's remote
//! address, and the two halves are relayed by one [`EventLoop`](server::EventLoop).
#![warn(unused_imports)]

pub mod common;
pub mod server;
pub mod util;
