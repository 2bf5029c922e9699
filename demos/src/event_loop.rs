//! Drives a [`LocalEventBase`] from a tokio task.

use log::trace;
use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};
use tether::LocalEventBase;
use tether_executor::yield_local;
use tokio::sync::Notify;

/// Longest the driver sleeps, which bounds how stale the event base clock gets.
pub const MAX_TICK: Duration = Duration::from_millis(100);

/// Fires due timers and runs loop callbacks of one [`LocalEventBase`].
pub struct EventLoopDriver {
    event_base: Rc<LocalEventBase>,
    wake: Notify,
    stopped: Cell<bool>,
}

impl EventLoopDriver {
    pub fn new(event_base: Rc<LocalEventBase>) -> Rc<Self> {
        Rc::new(Self {
            event_base,
            wake: Notify::new(),
            stopped: Cell::new(false),
        })
    }

    pub fn event_base(&self) -> &Rc<LocalEventBase> {
        &self.event_base
    }

    /// Asks the driver to run a turn soon, e.g. after work was queued with `run_in_loop`.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.stopped.set(true);
        self.wake.notify_one();
    }

    /// Fires due timers, then runs one batch of loop callbacks.
    pub fn turn(&self) -> usize {
        let fired = self.event_base.handle_timeout(Instant::now());
        let ran = self.event_base.run_loop_callbacks();
        if fired + ran > 0 {
            trace!("event loop turn: {} timers, {} callbacks", fired, ran);
        }
        fired + ran
    }

    /// Runs turns until [`stop`](EventLoopDriver::stop) is called.
    pub async fn run(&self) {
        while !self.stopped.get() {
            self.turn();
            if self.event_base.pending_loop_callbacks() > 0 {
                yield_local().await;
                continue;
            }

            let mut eto = Instant::now() + MAX_TICK;
            if let Some(deadline) = self.event_base.poll_timeout() {
                eto = eto.min(deadline);
            }
            let delay_from_now = eto
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::from_secs(0));
            if delay_from_now.is_zero() {
                continue;
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay_from_now) => {}
            }
        }
        trace!("event loop driver stopped");
    }
}
