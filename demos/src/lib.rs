//! # Tether Demos
//!
//! A length-prefixed TCP echo server built from the tether crates:
//!
//! - [`event_loop`]: drives a [`LocalEventBase`](tether::LocalEventBase) from a tokio task
//! - [`handlers`]: the socket and echo stages of the per-connection pipeline
//! - [`connection`]: a [`ManagedConnection`](tether::ManagedConnection) wrapping one pipeline
//! - [`server`]: the accept loop and graceful shutdown
//!
//! ## Running Examples
//!
//! ```bash
//! cargo run --example echo_server_tcp -- --debug --idle-timeout-ms 30000
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod connection;
pub mod event_loop;
pub mod handlers;
pub mod server;
