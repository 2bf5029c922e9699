//! # Tether - Connection Management and Handler Pipelines
//!
//! `tether` provides the per-connection plumbing of an event-driven network server,
//! independent of any particular I/O runtime:
//!
//! - a [`Pipeline`] of [`Handler`]s that turns bytes from a transport into application
//!   messages and application writes back into bytes, in the style of
//!   [Netty](https://netty.io) and [Wangle](https://github.com/facebook/wangle);
//! - a [`ConnectionManager`] that tracks every connection living on one event loop,
//!   expires idle ones, evicts the longest idle under pressure and drains them on
//!   shutdown.
//!
//! ## Pipeline
//!
//! Handlers are linked in order. Inbound events (`read`, `read_eof`, `read_exception`,
//! `transport_active`, `transport_inactive`) enter at the front and travel toward the
//! back. Writes and close requests enter at the back and travel toward the front.
//!
//! ```text
//!                                    │ write() / close()
//!   ┌────────────────────────────────┼──────────────┐
//!   │  Pipeline                      ↓              │
//!   │   ┌──────────────────────────────────────┐    │
//!   │   │              Handler N               │    │
//!   │   └──────────────────────────────────────┘    │
//!   │          ↑                     │              │
//!   │   fire_handle_read()    fire_handle_write()   │
//!   │          │                     ↓              │
//!   │   ┌──────────────────────────────────────┐    │
//!   │   │              Handler 1               │    │
//!   │   └──────────────────────────────────────┘    │
//!   │          ↑                     │              │
//!   └──────────┼─────────────────────┼──────────────┘
//!              │ read()              ↓ socket write
//!   ┌──────────┴─────────────────────┴──────────────┐
//!   │        Transport (provided by the caller)     │
//!   └───────────────────────────────────────────────┘
//! ```
//!
//! Every handler method takes `&self` and returns immediately. Writes report their
//! completion through a [`WriteFuture`], so a handler may write while it is still
//! handling a read.
//!
//! ## Connection manager
//!
//! The [`ConnectionManager`] keeps busy connections in front of idle ones and the idle
//! ones ordered by how long they have been idle. Its timers and deferred work run on an
//! [`EventBase`]; [`LocalEventBase`] is a manually driven implementation that fits any
//! event loop and makes timing deterministic in tests.
//!
//! ```rust
//! use std::time::Duration;
//! use tether::{ConnectionManager, LocalEventBase};
//! use std::rc::Rc;
//!
//! let event_base = Rc::new(LocalEventBase::new());
//! let manager = ConnectionManager::builder(event_base.clone())
//!     .timeout(Duration::from_secs(30))
//!     .build();
//!
//! assert_eq!(manager.num_connections(), 0);
//! assert_eq!(manager.idle_conn_early_drop_threshold(), Duration::from_secs(15));
//!
//! // Drive the loop from your own reactor.
//! event_base.advance(Duration::from_secs(1));
//! event_base.run_loop_callbacks();
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![warn(missing_docs)]

// ========================================
// Module Declarations
// ========================================

/// Per event loop connection tracking
pub mod acceptor;

/// Timer and loop callback scheduling
pub(crate) mod event_base;

/// Handler and context types
pub(crate) mod handler;

/// Internal handler types (not part of public API)
pub(crate) mod handler_internal;

/// Pipeline of handlers
pub(crate) mod pipeline;

/// Internal pipeline types (not part of public API)
pub(crate) mod pipeline_internal;

#[cfg(test)]
mod pipeline_test;

// ========================================
// Public Exports
// ========================================

/// Connection manager and the connection contract it drives
pub use acceptor::{
    ConnectionLink, ConnectionManager, ConnectionManagerBuilder, ConnectionManagerCallback,
    ManagedConnection, ShutdownAction, MAX_DRAIN_PER_PASS,
};

/// Scheduling of timers and loop callbacks
pub use event_base::{Callback, CallbackHandle, EventBase, LocalEventBase};

/// Handler and context types for building pipelines
pub use handler::{write_error, write_ok, Context, Handler, Message, Unit, WriteFuture};

/// Pipeline types and entry points
pub use pipeline::{
    InboundPipeline, OutboundPipeline, Pipeline, PipelineBase, PipelineFactory,
    PipelineManager, ReadBufferSettings, Transport, WriteFlags,
};

/// How a pipeline holds its handlers
pub use pipeline_internal::HandlerOwnership;
