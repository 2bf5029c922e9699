//! # Acceptor - Connection Lifecycle Management
//!
//! A server accepts connections on several event loop threads. Each thread owns a
//! [`ConnectionManager`] that keeps track of the connections living on it:
//!
//! - **Activity ordering**: connections report [`on_activated`] when work starts and
//!   [`on_deactivated`] when they become idle. The registry keeps busy connections at
//!   the front and idle ones at the back, ordered by how long they have been idle.
//! - **Idle timeouts**: [`add_connection`] and [`schedule_timeout`] arm a per-connection
//!   timer on the [`EventBase`](crate::EventBase); on expiry the connection's
//!   [`ManagedConnection::timeout_expired`] hook runs.
//! - **Early eviction**: under resource pressure [`drop_idle_connections`] expires the
//!   longest idle connections ahead of time.
//! - **Graceful shutdown**: [`initiate_graceful_shutdown`] first notifies every
//!   connection of the pending shutdown, then asks each one to close once idle. Work is
//!   split into passes of at most [`MAX_DRAIN_PER_PASS`] connections, one per loop turn.
//! - **Hard shutdown**: [`drop_all_connections`] closes everything synchronously.
//!
//! ```text
//!  front                                                 back
//!  ┌──────┐   ┌──────┐   ┌──────┐   ┌──────┐   ┌──────┐
//!  │ busy │ ⇄ │ busy │ ⇄ │ idle │ ⇄ │ idle │ ⇄ │ idle │
//!  └──────┘   └──────┘   └──────┘   └──────┘   └──────┘
//!                           ↑
//!                      idle cursor
//! ```
//!
//! [`on_activated`]: ConnectionManager::on_activated
//! [`on_deactivated`]: ConnectionManager::on_deactivated
//! [`add_connection`]: ConnectionManager::add_connection
//! [`schedule_timeout`]: ConnectionManager::schedule_timeout
//! [`drop_idle_connections`]: ConnectionManager::drop_idle_connections
//! [`initiate_graceful_shutdown`]: ConnectionManager::initiate_graceful_shutdown
//! [`drop_all_connections`]: ConnectionManager::drop_all_connections

mod connection_list;
mod connection_manager;
mod managed_connection;

#[cfg(test)]
mod connection_manager_test;

pub use connection_manager::{
    ConnectionManager, ConnectionManagerBuilder, ConnectionManagerCallback, ShutdownAction,
    MAX_DRAIN_PER_PASS,
};
pub use managed_connection::{ConnectionLink, ManagedConnection};
