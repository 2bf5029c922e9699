//! # Tether Executor - Event Loop Threads and Work Queues
//!
//! `tether-executor` provides the two execution collaborators a tether server needs:
//!
//! - [`LocalExecutorBuilder`]: a single-threaded tokio executor built on `LocalSet`,
//!   with optional CPU pinning and thread naming. Connection managers and pipelines
//!   are `!Send` and live on one of these.
//! - [`PriorityQueue`]: a bounded multi-priority MPMC queue that worker pools use
//!   to hand work between threads.
//!
//! ## Spawning Local Tasks
//!
//! ```rust
//! use tether_executor::{spawn_local, yield_local, LocalExecutorBuilder};
//!
//! let sum = LocalExecutorBuilder::default().run(async {
//!     let task1 = spawn_local(async {
//!         yield_local().await;
//!         1
//!     });
//!     let task2 = spawn_local(async { 2 });
//!
//!     task1.await.unwrap_or(0) + task2.await.unwrap_or(0)
//! })?;
//! assert_eq!(sum, 3);
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## CPU Pinning
//!
//! ```rust,no_run
//! use core_affinity::CoreId;
//! use tether_executor::LocalExecutorBuilder;
//!
//! let handle = LocalExecutorBuilder::new()
//!     .name("event-loop-0")
//!     .core_id(CoreId { id: 0 })
//!     .spawn(|| async {
//!         println!("Running on CPU core 0!");
//!     })?;
//! handle.join().ok();
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Awaiting a [`Task`] yields a [`TaskError`] if the task panicked or was cancelled.
//! Adding to a full [`PriorityQueue`] lane returns [`QueueError::Full`] with the item.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![warn(missing_docs)]

mod local;
mod priority_queue;


pub use local::*;
pub use priority_queue::{PriorityQueue, QueueError, MID_PRI};
