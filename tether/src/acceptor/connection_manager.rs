use crate::acceptor::connection_list::ConnectionList;
use crate::acceptor::managed_connection::ManagedConnection;
use crate::event_base::{Callback, CallbackHandle, EventBase};
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Upper bound on connections visited by a single drain pass.
pub const MAX_DRAIN_PER_PASS: usize = 64;

/// Number of connections whose state is dumped by `drop_all_connections`.
const MAX_CONNS_TO_DUMP: usize = 2;

/// Registry change notifications.
///
/// All methods default to doing nothing. They run with no internal state
/// borrowed, so they may call back into the manager.
pub trait ConnectionManagerCallback {
    /// `conn` joined `manager`.
    fn on_connection_added(&self, _manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {}

    /// `conn` left `manager` through `remove_connection`.
    fn on_connection_removed(&self, _manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {}

    /// The manager became empty.
    fn on_empty(&self, _manager: &ConnectionManager) {}
}

/// Phase of a graceful shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownAction {
    /// No shutdown in progress.
    None,
    /// Telling every connection that a shutdown is coming.
    NotifyPendingShutdown,
    /// Closing connections once they are idle.
    CloseWhenIdle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DrainCursor {
    Front,
    At(usize),
    End,
}

struct Registry {
    conns: ConnectionList<Rc<dyn ManagedConnection>>,
    /// First idle connection, `None` when every connection is busy.
    idle_cursor: Option<usize>,
    drain_cursor: DrainCursor,
    /// Current drain phase; connections visited in it carry the same stamp.
    drain_phase: u64,
}

impl Registry {
    fn new() -> Self {
        Self {
            conns: ConnectionList::new(),
            idle_cursor: None,
            drain_cursor: DrainCursor::Front,
            drain_phase: 1,
        }
    }

    /// Starts a new drain phase from the front of the list.
    fn start_drain_phase(&mut self) {
        self.drain_phase += 1;
        self.drain_cursor = DrainCursor::Front;
    }

    /// First connection the current phase has not visited, wherever it sits.
    fn first_undrained(&self) -> Option<usize> {
        self.conns.keys().find(|&key| {
            self.conns
                .get(key)
                .is_some_and(|conn| conn.link().drained_in() != self.drain_phase)
        })
    }

    /// Next connection for the drain pass. Once the cursor is at the end,
    /// picks up connections that were moved behind it during the phase.
    fn next_to_drain(&mut self) -> Option<usize> {
        if let Some(key) = self.drain_position() {
            return Some(key);
        }
        let key = self.first_undrained()?;
        self.drain_cursor = DrainCursor::At(key);
        Some(key)
    }

    fn drain_finished(&self) -> bool {
        self.drain_position().is_none() && self.first_undrained().is_none()
    }

    fn step(&self, key: usize) -> DrainCursor {
        match self.conns.next(key) {
            Some(next) => DrainCursor::At(next),
            None => DrainCursor::End,
        }
    }

    fn drain_position(&self) -> Option<usize> {
        match self.drain_cursor {
            DrainCursor::Front => self.conns.front(),
            DrainCursor::At(key) => Some(key),
            DrainCursor::End => None,
        }
    }

    fn unlink(&mut self, key: usize) -> Option<Rc<dyn ManagedConnection>> {
        if self.idle_cursor == Some(key) {
            self.idle_cursor = self.conns.next(key);
        }
        if self.drain_cursor == DrainCursor::At(key) {
            self.drain_cursor = self.step(key);
        }
        self.conns.remove(key)
    }

    fn activate(&mut self, key: usize) {
        if self.idle_cursor == Some(key) {
            self.idle_cursor = self.conns.next(key);
        }
        if self.drain_cursor == DrainCursor::At(key) {
            self.drain_cursor = self.step(key);
        }
        self.conns.move_to_front(key);
    }

    fn deactivate(&mut self, key: usize) {
        let drain_follows = self.drain_cursor == DrainCursor::At(key);
        if drain_follows {
            self.drain_cursor = self.step(key);
        }
        if self.idle_cursor == Some(key) {
            self.idle_cursor = self.conns.next(key);
        }
        self.conns.move_to_back(key);
        if self.idle_cursor.is_none() {
            self.idle_cursor = Some(key);
        }
        // still owed a visit in the current drain phase
        if drain_follows && self.drain_cursor == DrainCursor::End {
            self.drain_cursor = DrainCursor::At(key);
        }
    }

    fn reset_cursors(&mut self) {
        self.idle_cursor = None;
        self.start_drain_phase();
    }
}

/// Configures and creates a [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    event_base: Rc<dyn EventBase>,
    timeout: Duration,
    idle_conn_early_drop_threshold: Option<Duration>,
    callback: Option<Rc<dyn ConnectionManagerCallback>>,
}

impl ConnectionManagerBuilder {
    /// Default idle timeout armed by `add_connection(conn, true)`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Minimum idle time a connection needs before `drop_idle_connections`
    /// may evict it. Defaults to half the timeout.
    pub fn idle_conn_early_drop_threshold(mut self, threshold: Duration) -> Self {
        self.idle_conn_early_drop_threshold = Some(threshold);
        self
    }

    /// Registry change observer.
    pub fn callback(mut self, callback: Rc<dyn ConnectionManagerCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Creates the manager.
    pub fn build(self) -> Rc<ConnectionManager> {
        let threshold = self
            .idle_conn_early_drop_threshold
            .unwrap_or(self.timeout / 2);
        Rc::new_cyclic(|self_ref| ConnectionManager {
            self_ref: self_ref.clone(),
            event_base: self.event_base,
            timeout: self.timeout,
            idle_conn_early_drop_threshold: threshold,
            callback: self.callback,
            registry: RefCell::new(Registry::new()),
            action: Cell::new(ShutdownAction::None),
            drain_pass: RefCell::new(None),
            idle_grace: RefCell::new(None),
        })
    }
}

/// Tracks every live connection of one event loop thread.
///
/// Connections are kept in activity order: the most recently activated at the
/// front, idle ones at the back in the order they went idle. On top of that
/// ordering the manager provides idle timeouts, early eviction of the longest
/// idle connections under resource pressure, and a two phase graceful
/// shutdown that drains at most [`MAX_DRAIN_PER_PASS`] connections per loop
/// turn.
///
/// The manager lives in an `Rc` and is not `Send`. Every method may be called
/// from inside a connection hook or a registry callback.
///
/// # Example
///
/// ```rust
/// use tether::{ConnectionLink, ConnectionManager, LocalEventBase, ManagedConnection};
/// use std::{rc::Rc, time::Duration};
///
/// #[derive(Default)]
/// struct Conn {
///     link: ConnectionLink,
/// }
///
/// impl ManagedConnection for Conn {
///     fn link(&self) -> &ConnectionLink { &self.link }
///     fn is_busy(&self) -> bool { false }
///     fn notify_pending_shutdown(&self) {}
///     fn close_when_idle(&self) {
///         if let Some(manager) = self.connection_manager() {
///             manager.remove_connection(self);
///         }
///     }
///     fn drop_connection(&self) {}
///     fn timeout_expired(&self) {}
///     fn dump_connection_state(&self, _verbosity: u8) {}
/// }
///
/// let event_base = Rc::new(LocalEventBase::new());
/// let manager = ConnectionManager::new(event_base, Duration::from_secs(60));
///
/// let conn: Rc<dyn ManagedConnection> = Rc::new(Conn::default());
/// manager.add_connection(&conn, true);
/// assert_eq!(manager.num_connections(), 1);
///
/// manager.initiate_graceful_shutdown(Duration::ZERO);
/// assert_eq!(manager.num_connections(), 0);
/// ```
pub struct ConnectionManager {
    self_ref: Weak<ConnectionManager>,
    event_base: Rc<dyn EventBase>,
    timeout: Duration,
    idle_conn_early_drop_threshold: Duration,
    callback: Option<Rc<dyn ConnectionManagerCallback>>,
    registry: RefCell<Registry>,
    action: Cell<ShutdownAction>,
    drain_pass: RefCell<Option<CallbackHandle>>,
    idle_grace: RefCell<Option<CallbackHandle>>,
}

impl ConnectionManager {
    /// Starts configuring a manager bound to `event_base`.
    pub fn builder(event_base: Rc<dyn EventBase>) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            event_base,
            timeout: Duration::ZERO,
            idle_conn_early_drop_threshold: None,
            callback: None,
        }
    }

    /// Creates a manager with the given default idle timeout.
    pub fn new(event_base: Rc<dyn EventBase>, timeout: Duration) -> Rc<Self> {
        Self::builder(event_base).timeout(timeout).build()
    }

    /// Default idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Idle time below which `drop_idle_connections` leaves a connection alone.
    pub fn idle_conn_early_drop_threshold(&self) -> Duration {
        self.idle_conn_early_drop_threshold
    }

    /// Current graceful shutdown phase.
    pub fn shutdown_action(&self) -> ShutdownAction {
        self.action.get()
    }

    /// Whether a drain pass or the idle grace period is still outstanding.
    pub fn is_draining(&self) -> bool {
        Self::pending(&self.drain_pass) || Self::pending(&self.idle_grace)
    }

    /// Number of managed connections.
    pub fn num_connections(&self) -> usize {
        self.registry.borrow().conns.len()
    }

    /// The event base timers and drain passes are scheduled on.
    pub fn event_base(&self) -> &Rc<dyn EventBase> {
        &self.event_base
    }

    /// Registers `conn`, moving it away from any other manager first.
    ///
    /// New connections start in the busy part of the registry. When
    /// `arm_timeout` is set the default idle timeout is (re)armed, even if the
    /// connection was already registered here.
    pub fn add_connection(&self, conn: &Rc<dyn ManagedConnection>, arm_timeout: bool) {
        let link = conn.link();
        if !link.is_owned_by(self) {
            if let Some(old_manager) = link.manager() {
                debug!("moving connection from another connection manager");
                old_manager.remove_connection(conn.as_ref());
            }

            let key = self.registry.borrow_mut().conns.push_front(Rc::clone(conn));
            link.attach(self.self_ref.clone(), key);
            trace!("connection added, {} managed", self.num_connections());

            if let Some(callback) = &self.callback {
                callback.on_connection_added(self, conn);
            }
        }
        if arm_timeout {
            self.schedule_timeout(conn, self.timeout);
        }
    }

    /// Unregisters `conn`. Does nothing unless this manager owns it.
    pub fn remove_connection(&self, conn: &dyn ManagedConnection) {
        let link = conn.link();
        if !link.is_owned_by(self) {
            return;
        }
        let Some(key) = link.key() else {
            return;
        };

        link.cancel_timeout();
        link.detach();
        let removed = self.registry.borrow_mut().unlink(key);
        trace!("connection removed, {} managed", self.num_connections());

        if let (Some(removed), Some(callback)) = (removed, &self.callback) {
            callback.on_connection_removed(self, &removed);
            if self.num_connections() == 0 {
                callback.on_empty(self);
            }
        }
    }

    /// Arms (or re-arms) the idle timeout of `conn`. A zero `timeout` leaves
    /// the current timer untouched.
    pub fn schedule_timeout(&self, conn: &Rc<dyn ManagedConnection>, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let weak_conn = Rc::downgrade(conn);
        let handle = self.event_base.schedule_timeout(
            timeout,
            Box::new(move || {
                if let Some(conn) = weak_conn.upgrade() {
                    conn.timeout_expired();
                }
            }),
        );
        conn.link().set_timeout(handle);
    }

    /// Re-arms the default idle timeout of `conn`.
    pub fn reset_timeout(&self, conn: &Rc<dyn ManagedConnection>) {
        self.schedule_timeout(conn, self.timeout);
    }

    /// Schedules an arbitrary callback on the manager's event base.
    pub fn schedule_callback_timeout(&self, timeout: Duration, callback: Callback) -> CallbackHandle {
        self.event_base.schedule_timeout(timeout, callback)
    }

    /// `conn` started processing a request.
    pub fn on_activated(&self, conn: &dyn ManagedConnection) {
        if let Some(key) = self.owned_key(conn) {
            self.registry.borrow_mut().activate(key);
        }
    }

    /// `conn` finished all outstanding work and is now idle.
    pub fn on_deactivated(&self, conn: &dyn ManagedConnection) {
        if let Some(key) = self.owned_key(conn) {
            self.registry.borrow_mut().deactivate(key);
        }
    }

    /// Evicts up to `num` of the longest idle connections by expiring their
    /// timeout early. Stops at the first connection that has not been idle for
    /// longer than the early drop threshold. Returns the number evicted.
    pub fn drop_idle_connections(&self, num: usize) -> usize {
        debug!("attempt to drop {} idle connections", num);
        if self.idle_conn_early_drop_threshold >= self.timeout {
            return 0;
        }

        let mut count = 0;
        while count < num {
            let candidate = {
                let registry = self.registry.borrow();
                registry
                    .idle_cursor
                    .and_then(|key| registry.conns.get(key).map(|conn| (key, Rc::clone(conn))))
            };
            let Some((key, conn)) = candidate else {
                break;
            };

            let idle_time = conn.idle_time();
            if idle_time.is_zero() || idle_time <= self.idle_conn_early_drop_threshold {
                trace!(
                    "conn's idle time {:?} within early drop threshold {:?}, dropped {}/{}",
                    idle_time,
                    self.idle_conn_early_drop_threshold,
                    count,
                    num
                );
                break;
            }

            {
                let mut registry = self.registry.borrow_mut();
                if registry.idle_cursor == Some(key) {
                    registry.idle_cursor = registry.conns.next(key);
                }
            }
            conn.timeout_expired();
            count += 1;
        }
        count
    }

    /// Starts a graceful shutdown.
    ///
    /// With a non-zero `idle_grace` every connection is first notified of the
    /// pending shutdown, and idle connections are closed once the grace period
    /// elapses. With a zero grace period closing starts right away.
    pub fn initiate_graceful_shutdown(&self, idle_grace: Duration) {
        if idle_grace.is_zero() {
            self.action.set(ShutdownAction::CloseWhenIdle);
            debug!("proceeding directly to closing idle connections");
        } else {
            let manager = self.self_ref.clone();
            let handle = self.event_base.schedule_timeout(
                idle_grace,
                Box::new(move || {
                    if let Some(manager) = manager.upgrade() {
                        manager.idle_grace_expired();
                    }
                }),
            );
            if let Some(old) = self.idle_grace.borrow_mut().replace(handle) {
                old.cancel();
            }
            self.action.set(ShutdownAction::NotifyPendingShutdown);
            debug!("scheduling idle grace period of {:?}", idle_grace);
        }

        self.registry.borrow_mut().start_drain_phase();
        self.drain_all_connections();
    }

    /// Runs one drain pass over at most [`MAX_DRAIN_PER_PASS`] connections,
    /// continuing where the previous pass stopped. A phase ends only after
    /// every connection has been visited once, including connections that
    /// were re-spliced behind the cursor or added while the phase ran. Does
    /// nothing unless a graceful shutdown is in progress.
    pub fn drain_all_connections(&self) {
        let action = self.action.get();
        if action == ShutdownAction::None {
            return;
        }
        if let Some(pass) = self.drain_pass.borrow_mut().take() {
            pass.cancel();
        }

        let mut num_cleared = 0;
        let mut num_kept = 0;
        let mut visited = 0;
        let phase = self.registry.borrow().drain_phase;
        while visited < MAX_DRAIN_PER_PASS {
            let conn = {
                let mut registry = self.registry.borrow_mut();
                let Some(key) = registry.next_to_drain() else {
                    break;
                };
                registry.drain_cursor = registry.step(key);
                registry.conns.get(key).cloned()
            };
            let Some(conn) = conn else {
                break;
            };
            if !conn.link().mark_drained(phase) {
                continue;
            }

            visited += 1;
            if action == ShutdownAction::NotifyPendingShutdown {
                conn.notify_pending_shutdown();
            } else {
                if conn.is_busy() {
                    num_kept += 1;
                } else {
                    num_cleared += 1;
                }
                conn.close_when_idle();
            }
        }

        if action == ShutdownAction::CloseWhenIdle {
            debug!(
                "idle connections cleared: {}, busy conns kept: {}",
                num_cleared, num_kept
            );
        }

        let reached_end = self.registry.borrow().drain_finished();
        if !reached_end {
            self.schedule_drain_pass();
        } else if action == ShutdownAction::NotifyPendingShutdown {
            self.action.set(ShutdownAction::CloseWhenIdle);
            self.registry.borrow_mut().start_drain_phase();
            if !Self::pending(&self.idle_grace) {
                self.schedule_drain_pass();
            }
        } else {
            self.registry.borrow_mut().start_drain_phase();
            trace!("drain complete, {} connections remain", self.num_connections());
        }
    }

    /// Immediately drops every connection, cancelling all pending timers.
    pub fn drop_all_connections(&self) {
        debug!("connections to drop: {}", self.num_connections());
        if let Some(pass) = self.drain_pass.borrow_mut().take() {
            pass.cancel();
        }
        if let Some(grace) = self.idle_grace.borrow_mut().take() {
            grace.cancel();
        }

        let mut dropped = 0;
        loop {
            let conn = {
                let mut registry = self.registry.borrow_mut();
                match registry.conns.front() {
                    Some(key) => registry.unlink(key),
                    None => None,
                }
            };
            let Some(conn) = conn else {
                break;
            };

            conn.cancel_timeout();
            conn.link().detach();
            dropped += 1;
            if dropped <= MAX_CONNS_TO_DUMP {
                conn.dump_connection_state(3);
            }
            conn.drop_connection();
        }
        self.registry.borrow_mut().reset_cursors();

        if dropped > 0 {
            if let Some(callback) = &self.callback {
                callback.on_empty(self);
            }
        }
    }

    fn idle_grace_expired(&self) {
        debug!("idle grace period expired, closing idle connections");
        self.action.set(ShutdownAction::CloseWhenIdle);
        self.registry.borrow_mut().start_drain_phase();
        self.drain_all_connections();
    }

    fn schedule_drain_pass(&self) {
        let manager = self.self_ref.clone();
        let handle = self.event_base.run_in_loop(Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.drain_all_connections();
            }
        }));
        if let Some(old) = self.drain_pass.borrow_mut().replace(handle) {
            old.cancel();
        }
    }

    fn owned_key(&self, conn: &dyn ManagedConnection) -> Option<usize> {
        let link = conn.link();
        if link.is_owned_by(self) {
            link.key()
        } else {
            None
        }
    }

    fn pending(handle: &RefCell<Option<CallbackHandle>>) -> bool {
        handle
            .borrow()
            .as_ref()
            .is_some_and(CallbackHandle::is_pending)
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (Vec<usize>, Option<usize>) {
        let registry = self.registry.borrow();
        (registry.conns.keys().collect(), registry.idle_cursor)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(pass) = self.drain_pass.get_mut().take() {
            pass.cancel();
        }
        if let Some(grace) = self.idle_grace.get_mut().take() {
            grace.cancel();
        }
        let registry = self.registry.get_mut();
        while let Some((_, conn)) = registry.conns.pop_front() {
            conn.cancel_timeout();
            conn.link().detach();
        }
    }
}
