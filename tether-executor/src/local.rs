//! Tokio-based local executor
//!
//! Each executor drives a single-threaded tokio runtime with a `LocalSet`, so
//! `!Send` state such as connection managers and pipelines can live in its tasks.

use core_affinity::{set_for_current, CoreId};
use log::{debug, warn};
use scoped_tls::scoped_thread_local;
use std::{
    future::Future,
    io::Result,
    pin::Pin,
    task::{Context, Poll},
    thread::{self, JoinHandle},
};
use tokio::task::LocalSet;

scoped_thread_local!(static LOCAL: LocalSet);

/// A handle to a spawned task.
///
/// When awaited, returns `Result<T, TaskError>`:
/// - `Ok(T)`: the task completed
/// - `Err(TaskError)`: the task panicked or was cancelled
///
/// # Example
///
/// ```rust
/// use tether_executor::{spawn_local, LocalExecutorBuilder};
///
/// let result = LocalExecutorBuilder::default().run(async {
///     spawn_local(async { 42 }).await
/// })?;
/// assert_eq!(result.ok(), Some(42));
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct Task<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T> Future for Task<T> {
    type Output = std::result::Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|result| result.map_err(TaskError))
    }
}

impl<T> Task<T> {
    /// Lets the task run to completion in the background.
    pub fn detach(self) {
        drop(self.inner);
    }

    /// Aborts the task.
    pub fn cancel(self) {
        self.inner.abort();
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// Error returned when a spawned task panicked or was cancelled.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct TaskError(tokio::task::JoinError);

impl TaskError {
    /// Whether the task was cancelled rather than panicking.
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Configures and starts a single-threaded executor.
#[derive(Debug, Default)]
pub struct LocalExecutorBuilder {
    core_id: Option<CoreId>,
    name: String,
}

impl LocalExecutorBuilder {
    /// Creates a new LocalExecutorBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the thread started by [`spawn`](LocalExecutorBuilder::spawn).
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Pins the executor thread to the specified CPU core
    pub fn core_id(mut self, core_id: CoreId) -> Self {
        self.core_id = Some(core_id);
        self
    }

    /// Runs the executor on the current thread until `f` completes.
    ///
    /// Fails if the tokio runtime cannot be created.
    pub fn run<T>(mut self, f: impl Future<Output = T>) -> Result<T> {
        if let Some(core_id) = self.core_id.take() {
            pin(core_id);
        }
        block_on_local(f)
    }

    /// Starts a thread that runs the executor until the future built by
    /// `fut_gen` completes.
    pub fn spawn<G, F, T>(mut self, fut_gen: G) -> Result<JoinHandle<Result<T>>>
    where
        G: FnOnce() -> F + Send + 'static,
        F: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let core_id = self.core_id.take();

        thread::Builder::new().name(self.name).spawn(move || {
            if let Some(core_id) = core_id {
                pin(core_id);
            }
            block_on_local(fut_gen())
        })
    }
}

fn pin(core_id: CoreId) {
    if set_for_current(core_id) {
        debug!("pinned executor thread to core {}", core_id.id);
    } else {
        warn!("failed to pin executor thread to core {}", core_id.id);
    }
}

fn block_on_local<T>(f: impl Future<Output = T>) -> Result<T> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local_set = LocalSet::new();
    Ok(LOCAL.set(&local_set, || rt.block_on(local_set.run_until(f))))
}

/// Spawns a task onto the current executor.
///
/// # Panics
///
/// Panics if called outside of an executor started by [`LocalExecutorBuilder`].
pub fn spawn_local<T: 'static>(future: impl Future<Output = T> + 'static) -> Task<T> {
    if LOCAL.is_set() {
        LOCAL.with(|local_set| Task {
            inner: local_set.spawn_local(future),
        })
    } else {
        panic!("`spawn_local()` must be called from a tokio `LocalSet`")
    }
}

/// Whether the current thread runs an executor started by [`LocalExecutorBuilder`].
pub fn in_local_executor() -> bool {
    LOCAL.is_set()
}

/// Yields to the other tasks of the current executor.
pub async fn yield_local() {
    tokio::task::yield_now().await
}
