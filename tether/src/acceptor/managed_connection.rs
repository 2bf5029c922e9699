use crate::acceptor::ConnectionManager;
use crate::event_base::CallbackHandle;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Registration state a [`ConnectionManager`] keeps inside each connection.
///
/// Embed one in every [`ManagedConnection`] implementation and return it from
/// [`ManagedConnection::link`]. Only the manager mutates it.
#[derive(Default)]
pub struct ConnectionLink {
    manager: RefCell<Weak<ConnectionManager>>,
    key: Cell<Option<usize>>,
    timeout: RefCell<Option<CallbackHandle>>,
    /// Drain phase that last visited the connection, zero for none.
    drained_in: Cell<u64>,
}

impl ConnectionLink {
    /// Creates an unregistered link.
    pub fn new() -> Self {
        Self::default()
    }

    /// The manager currently owning the connection, if any.
    pub fn manager(&self) -> Option<Rc<ConnectionManager>> {
        if self.key.get().is_some() {
            self.manager.borrow().upgrade()
        } else {
            None
        }
    }

    /// Whether an idle timeout is armed and has not fired yet.
    pub fn timeout_pending(&self) -> bool {
        self.timeout
            .borrow()
            .as_ref()
            .is_some_and(CallbackHandle::is_pending)
    }

    /// Disarms the idle timeout, if any.
    pub fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout.borrow_mut().take() {
            handle.cancel();
        }
    }

    pub(crate) fn is_owned_by(&self, manager: &ConnectionManager) -> bool {
        self.key.get().is_some()
            && std::ptr::eq(self.manager.borrow().as_ptr(), manager as *const _)
    }

    pub(crate) fn key(&self) -> Option<usize> {
        self.key.get()
    }

    pub(crate) fn attach(&self, manager: Weak<ConnectionManager>, key: usize) {
        *self.manager.borrow_mut() = manager;
        self.key.set(Some(key));
        self.drained_in.set(0);
    }

    pub(crate) fn detach(&self) {
        *self.manager.borrow_mut() = Weak::new();
        self.key.set(None);
    }

    pub(crate) fn drained_in(&self) -> u64 {
        self.drained_in.get()
    }

    /// Records a visit by drain phase `phase`. Returns `false` if the phase
    /// already visited the connection.
    pub(crate) fn mark_drained(&self, phase: u64) -> bool {
        self.drained_in.replace(phase) != phase
    }

    pub(crate) fn set_timeout(&self, handle: CallbackHandle) {
        if let Some(old) = self.timeout.borrow_mut().replace(handle) {
            old.cancel();
        }
    }
}

/// A connection whose lifetime is overseen by a [`ConnectionManager`].
///
/// Implementations are expected to use interior mutability: the manager calls
/// these hooks through shared references, and the hooks may call back into the
/// manager (for example `close_when_idle` removing the connection).
pub trait ManagedConnection {
    /// Registration state owned by the manager.
    fn link(&self) -> &ConnectionLink;

    /// Whether a request or response is in flight.
    fn is_busy(&self) -> bool;

    /// How long the connection has been idle. Zero means unknown or busy.
    fn idle_time(&self) -> Duration {
        Duration::ZERO
    }

    /// First phase of graceful shutdown: tell the peer that the connection is
    /// going away (GOAWAY, `Connection: close`, ...).
    fn notify_pending_shutdown(&self);

    /// Second phase of graceful shutdown: close now if idle, otherwise as soon
    /// as the connection becomes idle.
    fn close_when_idle(&self);

    /// Closes immediately, abandoning in-flight work.
    fn drop_connection(&self);

    /// The idle timeout fired, or the manager evicted this connection early.
    fn timeout_expired(&self);

    /// Logs diagnostic state. Higher verbosity means more detail.
    fn dump_connection_state(&self, verbosity: u8);

    /// Disarms the idle timeout.
    fn cancel_timeout(&self) {
        self.link().cancel_timeout();
    }

    /// The manager currently owning this connection.
    fn connection_manager(&self) -> Option<Rc<ConnectionManager>> {
        self.link().manager()
    }
}
