//! # Event Base - Timers and Loop Callbacks
//!
//! Everything in tether that needs to happen "later" goes through an [`EventBase`]:
//! idle timeouts of managed connections, the grace period of a graceful shutdown
//! and the follow-up passes of connection draining.
//!
//! The trait deliberately stays tiny so that any executor can provide it. The crate
//! ships [`LocalEventBase`], a sans-io implementation that owns no thread and no
//! socket: the caller drives it with [`LocalEventBase::poll_timeout`] /
//! [`LocalEventBase::handle_timeout`] and runs one loop turn at a time with
//! [`LocalEventBase::run_loop_callbacks`].
//!
//! ## Example
//!
//! ```rust
//! use tether::{EventBase, LocalEventBase};
//! use std::{cell::Cell, rc::Rc, time::Duration};
//!
//! let event_base = LocalEventBase::new();
//! let fired = Rc::new(Cell::new(false));
//!
//! let f = fired.clone();
//! event_base.schedule_timeout(Duration::from_secs(5), Box::new(move || f.set(true)));
//!
//! let deadline = event_base.poll_timeout().unwrap();
//! event_base.handle_timeout(deadline);
//! assert!(fired.get());
//! ```

use log::trace;
use std::cell::{Cell, RefCell};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A deferred unit of work run on the event base thread.
pub type Callback = Box<dyn FnOnce()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallbackState {
    Pending,
    Cancelled,
    Fired,
}

/// Cancellation handle for a scheduled timeout or loop callback.
///
/// Clones share state, so cancelling through any clone cancels the callback.
#[derive(Clone, Debug)]
pub struct CallbackHandle {
    state: Rc<Cell<CallbackState>>,
}

impl Default for CallbackHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackHandle {
    /// Creates a handle in the pending state.
    ///
    /// [`EventBase`] implementations create one per scheduled callback and must
    /// call [`CallbackHandle::try_fire`] right before running it.
    pub fn new() -> Self {
        Self {
            state: Rc::new(Cell::new(CallbackState::Pending)),
        }
    }

    /// Cancels the callback. Returns `true` if it was still pending.
    pub fn cancel(&self) -> bool {
        if self.is_pending() {
            self.state.set(CallbackState::Cancelled);
            true
        } else {
            false
        }
    }

    /// Returns `true` until the callback has either fired or been cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.get() == CallbackState::Pending
    }

    /// Returns `true` if the callback was cancelled before it could fire.
    pub fn is_cancelled(&self) -> bool {
        self.state.get() == CallbackState::Cancelled
    }

    /// Marks the callback as fired. Returns `false` if it is no longer pending,
    /// in which case the callback must not run.
    pub fn try_fire(&self) -> bool {
        if self.is_pending() {
            self.state.set(CallbackState::Fired);
            true
        } else {
            false
        }
    }
}

/// Scheduler collaborator used by the connection manager.
///
/// All callbacks run on the thread that owns the event base.
pub trait EventBase {
    /// Returns the event base's notion of the current time.
    fn now(&self) -> Instant;

    /// Runs `callback` once, `after` from now, unless cancelled first.
    fn schedule_timeout(&self, after: Duration, callback: Callback) -> CallbackHandle;

    /// Runs `callback` on the next loop turn, unless cancelled first.
    ///
    /// Callbacks queued while a loop turn is running are deferred to the
    /// following turn.
    fn run_in_loop(&self, callback: Callback) -> CallbackHandle;
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    handle: CallbackHandle,
    callback: Callback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct LocalEventBaseInner {
    now: Instant,
    seq: u64,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    loop_callbacks: VecDeque<(CallbackHandle, Callback)>,
}

/// Sans-io [`EventBase`] driven entirely by its owner.
///
/// Time only moves when [`handle_timeout`](LocalEventBase::handle_timeout) is
/// called, which makes timing-dependent behavior fully deterministic in tests.
/// Timers with equal deadlines fire in scheduling order.
pub struct LocalEventBase {
    inner: RefCell<LocalEventBaseInner>,
}

impl Default for LocalEventBase {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBase {
    /// Creates an event base whose clock starts at `Instant::now()`.
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// Creates an event base whose clock starts at `now`.
    pub fn with_start(now: Instant) -> Self {
        Self {
            inner: RefCell::new(LocalEventBaseInner {
                now,
                seq: 0,
                timers: BinaryHeap::new(),
                loop_callbacks: VecDeque::new(),
            }),
        }
    }

    /// Returns the earliest deadline of a still pending timeout.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut inner = self.inner.borrow_mut();
        while let Some(Reverse(entry)) = inner.timers.peek() {
            if entry.handle.is_pending() {
                return Some(entry.deadline);
            }
            inner.timers.pop();
        }
        None
    }

    /// Advances the clock to `now` (it never goes backwards) and fires every
    /// timeout due by then. Returns the number of callbacks run.
    pub fn handle_timeout(&self, now: Instant) -> usize {
        {
            let mut inner = self.inner.borrow_mut();
            if now > inner.now {
                inner.now = now;
            }
        }

        let mut fired = 0;
        loop {
            let entry = {
                let mut inner = self.inner.borrow_mut();
                let due = match inner.timers.peek() {
                    Some(Reverse(entry)) => entry.deadline <= inner.now,
                    None => false,
                };
                if !due {
                    break;
                }
                inner.timers.pop()
            };

            if let Some(Reverse(entry)) = entry {
                if entry.handle.try_fire() {
                    (entry.callback)();
                    fired += 1;
                }
            }
        }

        if fired > 0 {
            trace!("fired {} timeouts", fired);
        }
        fired
    }

    /// Advances the clock by `by` and fires the timeouts that became due.
    pub fn advance(&self, by: Duration) -> usize {
        let now = self.now() + by;
        self.handle_timeout(now)
    }

    /// Runs one loop turn: every callback queued before this call.
    /// Returns the number of callbacks run.
    pub fn run_loop_callbacks(&self) -> usize {
        let callbacks = std::mem::take(&mut self.inner.borrow_mut().loop_callbacks);

        let mut ran = 0;
        for (handle, callback) in callbacks {
            if handle.try_fire() {
                callback();
                ran += 1;
            }
        }
        ran
    }

    /// Number of queued loop callbacks that have not been cancelled.
    pub fn pending_loop_callbacks(&self) -> usize {
        self.inner
            .borrow()
            .loop_callbacks
            .iter()
            .filter(|(handle, _)| handle.is_pending())
            .count()
    }

    /// Number of scheduled timeouts that have not fired or been cancelled.
    pub fn pending_timeouts(&self) -> usize {
        self.inner
            .borrow()
            .timers
            .iter()
            .filter(|Reverse(entry)| entry.handle.is_pending())
            .count()
    }
}

impl EventBase for LocalEventBase {
    fn now(&self) -> Instant {
        self.inner.borrow().now
    }

    fn schedule_timeout(&self, after: Duration, callback: Callback) -> CallbackHandle {
        let handle = CallbackHandle::new();
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.now + after;
        let seq = inner.seq;
        inner.seq += 1;
        inner.timers.push(Reverse(TimerEntry {
            deadline,
            seq,
            handle: handle.clone(),
            callback,
        }));
        handle
    }

    fn run_in_loop(&self, callback: Callback) -> CallbackHandle {
        let handle = CallbackHandle::new();
        self.inner
            .borrow_mut()
            .loop_callbacks
            .push_back((handle.clone(), callback));
        handle
    }
}
