use super::*;
use crate::event_base::LocalEventBase;
use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

type EventLog = Rc<RefCell<Vec<(usize, &'static str)>>>;

struct TestConnection {
    id: usize,
    link: ConnectionLink,
    busy: Cell<bool>,
    idle_time: Cell<Duration>,
    log: EventLog,
}

impl TestConnection {
    fn new(id: usize, log: &EventLog) -> Rc<Self> {
        Rc::new(Self {
            id,
            link: ConnectionLink::new(),
            busy: Cell::new(false),
            idle_time: Cell::new(Duration::ZERO),
            log: log.clone(),
        })
    }

    fn record(&self, event: &'static str) {
        self.log.borrow_mut().push((self.id, event));
    }

    fn close(&self) {
        if let Some(manager) = self.connection_manager() {
            manager.remove_connection(self);
        }
    }
}

impl ManagedConnection for TestConnection {
    fn link(&self) -> &ConnectionLink {
        &self.link
    }

    fn is_busy(&self) -> bool {
        self.busy.get()
    }

    fn idle_time(&self) -> Duration {
        self.idle_time.get()
    }

    fn notify_pending_shutdown(&self) {
        self.record("notify");
    }

    fn close_when_idle(&self) {
        self.record("close");
        if !self.busy.get() {
            self.close();
        }
    }

    fn drop_connection(&self) {
        self.record("drop");
        self.close();
    }

    fn timeout_expired(&self) {
        self.record("timeout");
        self.close();
    }

    fn dump_connection_state(&self, _verbosity: u8) {
        self.record("dump");
    }
}

#[derive(Default)]
struct CountingCallback {
    added: Cell<usize>,
    removed: Cell<usize>,
    empty: Cell<usize>,
}

impl ConnectionManagerCallback for CountingCallback {
    fn on_connection_added(&self, _manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {
        self.added.set(self.added.get() + 1);
    }

    fn on_connection_removed(&self, _manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {
        self.removed.set(self.removed.get() + 1);
    }

    fn on_empty(&self, _manager: &ConnectionManager) {
        self.empty.set(self.empty.get() + 1);
    }
}

struct Fixture {
    event_base: Rc<LocalEventBase>,
    manager: Rc<ConnectionManager>,
    callback: Rc<CountingCallback>,
    log: EventLog,
}

impl Fixture {
    fn new(timeout: Duration) -> Self {
        let event_base = Rc::new(LocalEventBase::new());
        let callback = Rc::new(CountingCallback::default());
        let manager = ConnectionManager::builder(event_base.clone())
            .timeout(timeout)
            .callback(callback.clone())
            .build();
        Self {
            event_base,
            manager,
            callback,
            log: Rc::new(RefCell::new(vec![])),
        }
    }

    fn connections(&self, count: usize) -> Vec<Rc<TestConnection>> {
        (0..count)
            .map(|id| {
                let conn = TestConnection::new(id, &self.log);
                let dyn_conn: Rc<dyn ManagedConnection> = conn.clone();
                self.manager.add_connection(&dyn_conn, false);
                conn
            })
            .collect()
    }

    fn events(&self, event: &'static str) -> Vec<usize> {
        self.log
            .borrow()
            .iter()
            .filter(|(_, e)| *e == event)
            .map(|(id, _)| *id)
            .collect()
    }

    fn idle_ids(&self, conns: &[Rc<TestConnection>]) -> Vec<usize> {
        let ids: HashMap<usize, usize> = conns
            .iter()
            .filter_map(|c| c.link.key().map(|key| (key, c.id)))
            .collect();
        let (keys, idle_cursor) = self.manager.snapshot();
        match idle_cursor {
            Some(cursor) => keys
                .into_iter()
                .skip_while(|key| *key != cursor)
                .map(|key| ids[&key])
                .collect(),
            None => vec![],
        }
    }
}

fn as_dyn(conn: &Rc<TestConnection>) -> Rc<dyn ManagedConnection> {
    conn.clone()
}

#[test]
fn test_add_and_remove_notify_callback() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(2);
    assert_eq!(f.manager.num_connections(), 2);
    assert_eq!(f.callback.added.get(), 2);

    f.manager.remove_connection(conns[0].as_ref());
    assert_eq!(f.callback.removed.get(), 1);
    assert_eq!(f.callback.empty.get(), 0);

    // double removal is a no-op
    f.manager.remove_connection(conns[0].as_ref());
    assert_eq!(f.callback.removed.get(), 1);

    f.manager.remove_connection(conns[1].as_ref());
    assert_eq!(f.manager.num_connections(), 0);
    assert_eq!(f.callback.removed.get(), 2);
    assert_eq!(f.callback.empty.get(), 1);
    assert!(conns[1].connection_manager().is_none());
}

#[test]
fn test_add_moves_connection_between_managers() {
    let a = Fixture::new(Duration::from_secs(60));
    let b = Fixture::new(Duration::from_secs(60));
    let conns = a.connections(3);

    b.manager.add_connection(&as_dyn(&conns[1]), false);

    assert_eq!(a.manager.num_connections(), 2);
    assert_eq!(b.manager.num_connections(), 1);
    assert_eq!(a.callback.removed.get(), 1);
    assert_eq!(b.callback.added.get(), 1);
    let owner = conns[1].connection_manager().unwrap();
    assert!(Rc::ptr_eq(&owner, &b.manager));
}

#[derive(Default)]
struct ManagerLog {
    events: RefCell<Vec<(*const ConnectionManager, &'static str, usize)>>,
}

impl ConnectionManagerCallback for ManagerLog {
    fn on_connection_added(&self, manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {
        self.events
            .borrow_mut()
            .push((manager as *const _, "added", manager.num_connections()));
    }

    fn on_connection_removed(&self, manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {
        self.events
            .borrow_mut()
            .push((manager as *const _, "removed", manager.num_connections()));
    }
}

#[test]
fn test_shared_callback_sees_which_manager_changed() {
    let event_base = Rc::new(LocalEventBase::new());
    let log = Rc::new(ManagerLog::default());
    let first = ConnectionManager::builder(event_base.clone())
        .timeout(Duration::from_secs(60))
        .callback(log.clone())
        .build();
    let second = ConnectionManager::builder(event_base.clone())
        .timeout(Duration::from_secs(60))
        .callback(log.clone())
        .build();

    let conn_log: EventLog = Rc::new(RefCell::new(vec![]));
    let conn = TestConnection::new(0, &conn_log);
    first.add_connection(&as_dyn(&conn), false);
    second.add_connection(&as_dyn(&conn), false);

    let first_ptr = Rc::as_ptr(&first);
    let second_ptr = Rc::as_ptr(&second);
    assert_eq!(
        *log.events.borrow(),
        vec![
            (first_ptr, "added", 1),
            (first_ptr, "removed", 0),
            (second_ptr, "added", 1),
        ]
    );
}

#[test]
fn test_add_twice_keeps_membership_and_arms_timeout() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(1);
    assert!(!conns[0].link.timeout_pending());

    f.manager.add_connection(&as_dyn(&conns[0]), true);
    assert_eq!(f.manager.num_connections(), 1);
    assert_eq!(f.callback.added.get(), 1);
    assert!(conns[0].link.timeout_pending());
}

#[test]
fn test_idle_timeout_expires() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(2);
    f.manager.add_connection(&as_dyn(&conns[0]), true);

    assert_eq!(f.event_base.advance(Duration::from_secs(59)), 0);
    assert_eq!(f.event_base.advance(Duration::from_secs(1)), 1);
    assert_eq!(f.events("timeout"), vec![0]);
    assert_eq!(f.manager.num_connections(), 1);
}

#[test]
fn test_schedule_timeout_rearms_and_ignores_zero() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(1);
    let conn = as_dyn(&conns[0]);

    f.manager.schedule_timeout(&conn, Duration::ZERO);
    assert!(!conns[0].link.timeout_pending());

    f.manager.schedule_timeout(&conn, Duration::from_secs(10));
    f.event_base.advance(Duration::from_secs(5));
    f.manager.schedule_timeout(&conn, Duration::from_secs(10));
    f.event_base.advance(Duration::from_secs(6));
    assert!(f.events("timeout").is_empty());
    assert_eq!(f.event_base.pending_timeouts(), 1);

    f.event_base.advance(Duration::from_secs(4));
    assert_eq!(f.events("timeout"), vec![0]);
}

#[test]
fn test_removal_cancels_timeout() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(1);
    f.manager.add_connection(&as_dyn(&conns[0]), true);

    f.manager.remove_connection(conns[0].as_ref());
    assert_eq!(f.event_base.pending_timeouts(), 0);
    f.event_base.advance(Duration::from_secs(120));
    assert!(f.events("timeout").is_empty());
}

#[test]
fn test_schedule_callback_timeout() {
    let f = Fixture::new(Duration::from_secs(60));
    let fired = Rc::new(Cell::new(0));

    let first = fired.clone();
    f.manager
        .schedule_callback_timeout(Duration::from_secs(1), Box::new(move || first.set(first.get() + 1)));
    let second = fired.clone();
    let cancelled = f
        .manager
        .schedule_callback_timeout(Duration::from_secs(2), Box::new(move || second.set(second.get() + 10)));
    assert!(cancelled.cancel());

    f.event_base.advance(Duration::from_secs(5));
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_activation_ordering() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(4);
    assert!(f.idle_ids(&conns).is_empty());

    f.manager.on_deactivated(conns[2].as_ref());
    f.manager.on_deactivated(conns[0].as_ref());
    f.manager.on_deactivated(conns[3].as_ref());
    assert_eq!(f.idle_ids(&conns), vec![2, 0, 3]);

    f.manager.on_activated(conns[2].as_ref());
    assert_eq!(f.idle_ids(&conns), vec![0, 3]);

    f.manager.remove_connection(conns[0].as_ref());
    assert_eq!(f.idle_ids(&conns), vec![3]);

    f.manager.on_activated(conns[3].as_ref());
    assert!(f.idle_ids(&conns).is_empty());
}

#[test]
fn test_drop_idle_connections_disabled() {
    let event_base = Rc::new(LocalEventBase::new());
    let manager = ConnectionManager::builder(event_base)
        .timeout(Duration::from_secs(60))
        .idle_conn_early_drop_threshold(Duration::from_secs(60))
        .build();
    let log: EventLog = Rc::new(RefCell::new(vec![]));
    let conn = TestConnection::new(0, &log);
    conn.idle_time.set(Duration::from_secs(3600));
    manager.add_connection(&as_dyn(&conn), false);
    manager.on_deactivated(conn.as_ref());

    assert_eq!(manager.drop_idle_connections(10), 0);
    assert!(log.borrow().is_empty());
    assert_eq!(manager.num_connections(), 1);
}

#[test]
fn test_drop_idle_connections_respects_threshold() {
    let f = Fixture::new(Duration::from_secs(60));
    assert_eq!(f.manager.idle_conn_early_drop_threshold(), Duration::from_secs(30));
    let conns = f.connections(4);
    for (id, idle) in [(0, 50), (1, 40), (2, 10)] {
        conns[id].idle_time.set(Duration::from_secs(idle));
        f.manager.on_deactivated(conns[id].as_ref());
    }

    assert_eq!(f.manager.drop_idle_connections(1), 1);
    assert_eq!(f.events("timeout"), vec![0]);

    assert_eq!(f.manager.drop_idle_connections(10), 1);
    assert_eq!(f.events("timeout"), vec![0, 1]);
    assert_eq!(f.manager.num_connections(), 2);
    assert_eq!(f.idle_ids(&conns), vec![2]);
}

#[test]
fn test_drop_idle_connections_stops_at_zero_idle_time() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(2);
    f.manager.on_deactivated(conns[0].as_ref());
    conns[1].idle_time.set(Duration::from_secs(59));
    f.manager.on_deactivated(conns[1].as_ref());

    assert_eq!(f.manager.drop_idle_connections(2), 0);
}

#[test]
fn test_graceful_shutdown_without_grace_closes_idle() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(3);
    conns[1].busy.set(true);

    f.manager.initiate_graceful_shutdown(Duration::ZERO);

    assert_eq!(f.manager.shutdown_action(), ShutdownAction::CloseWhenIdle);
    assert!(f.events("notify").is_empty());
    assert_eq!(f.events("close").len(), 3);
    assert_eq!(f.manager.num_connections(), 1);
    assert!(!f.manager.is_draining());
}

#[test]
fn test_graceful_shutdown_notifies_before_closing() {
    let f = Fixture::new(Duration::from_secs(60));
    let _conns = f.connections(100);

    f.manager.initiate_graceful_shutdown(Duration::from_secs(5));
    assert_eq!(f.manager.shutdown_action(), ShutdownAction::NotifyPendingShutdown);
    assert_eq!(f.events("notify").len(), MAX_DRAIN_PER_PASS);

    assert_eq!(f.event_base.run_loop_callbacks(), 1);
    assert_eq!(f.events("notify").len(), 100);
    assert!(f.events("close").is_empty());
    assert_eq!(f.manager.shutdown_action(), ShutdownAction::CloseWhenIdle);
    assert_eq!(f.event_base.pending_loop_callbacks(), 0);

    f.event_base.advance(Duration::from_secs(5));
    assert_eq!(f.events("close").len(), MAX_DRAIN_PER_PASS);
    f.event_base.run_loop_callbacks();
    assert_eq!(f.events("close").len(), 100);
    assert_eq!(f.manager.num_connections(), 0);
    assert_eq!(f.callback.empty.get(), 1);
    assert!(!f.manager.is_draining());
}

#[test]
fn test_grace_expiry_before_notify_completes() {
    let f = Fixture::new(Duration::from_secs(60));
    let _conns = f.connections(70);

    f.manager.initiate_graceful_shutdown(Duration::from_secs(1));
    f.event_base.advance(Duration::from_secs(1));
    assert_eq!(f.manager.shutdown_action(), ShutdownAction::CloseWhenIdle);

    while f.event_base.run_loop_callbacks() > 0 {}
    assert_eq!(f.manager.num_connections(), 0);
}

#[test]
fn test_drain_pass_limit() {
    let f = Fixture::new(Duration::from_secs(60));
    let _conns = f.connections(150);

    f.manager.initiate_graceful_shutdown(Duration::ZERO);
    assert_eq!(f.manager.num_connections(), 150 - MAX_DRAIN_PER_PASS);
    assert!(f.manager.is_draining());

    f.event_base.run_loop_callbacks();
    assert_eq!(f.manager.num_connections(), 150 - 2 * MAX_DRAIN_PER_PASS);

    f.event_base.run_loop_callbacks();
    assert_eq!(f.manager.num_connections(), 0);
    assert_eq!(f.event_base.pending_loop_callbacks(), 0);
}

#[test]
fn test_deactivated_connection_at_drain_cursor_is_still_visited() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(MAX_DRAIN_PER_PASS + 1);
    for conn in &conns {
        conn.busy.set(true);
    }

    f.manager.initiate_graceful_shutdown(Duration::ZERO);
    assert_eq!(f.events("close").len(), MAX_DRAIN_PER_PASS);

    // connection 0 was added first, so it sits at the back and is next in line
    conns[0].busy.set(false);
    f.manager.on_deactivated(conns[0].as_ref());
    f.event_base.run_loop_callbacks();
    assert_eq!(f.events("close").len(), MAX_DRAIN_PER_PASS + 1);
    assert!(conns[0].connection_manager().is_none());
}

#[test]
fn test_connection_activated_ahead_of_drain_cursor_is_still_closed() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(100);

    f.manager.initiate_graceful_shutdown(Duration::ZERO);
    assert_eq!(f.manager.num_connections(), 100 - MAX_DRAIN_PER_PASS);

    // connection 10 has not been visited yet; activation splices it in front of the cursor
    conns[10].busy.set(true);
    f.manager.on_activated(conns[10].as_ref());
    for _ in 0..10 {
        f.event_base.run_loop_callbacks();
    }
    assert!(f.events("close").contains(&10));
    assert_eq!(f.manager.num_connections(), 1);

    conns[10].busy.set(false);
    f.manager.on_deactivated(conns[10].as_ref());
    for _ in 0..10 {
        f.event_base.run_loop_callbacks();
    }
    assert_eq!(f.events("close").iter().filter(|id| **id == 10).count(), 1);
    assert!(!f.manager.is_draining());
    assert_eq!(f.manager.shutdown_action(), ShutdownAction::CloseWhenIdle);
}

#[test]
fn test_connection_added_during_drain_is_visited() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(MAX_DRAIN_PER_PASS + 1);
    for conn in &conns {
        conn.busy.set(true);
    }
    f.manager.initiate_graceful_shutdown(Duration::ZERO);
    assert!(f.manager.is_draining());

    let late = TestConnection::new(500, &f.log);
    f.manager.add_connection(&as_dyn(&late), false);
    f.event_base.run_loop_callbacks();

    assert_eq!(f.events("close").len(), MAX_DRAIN_PER_PASS + 2);
    assert!(late.connection_manager().is_none());
    assert!(!f.manager.is_draining());
}

#[test]
fn test_drop_all_connections() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(3);
    for conn in &conns {
        f.manager.add_connection(&as_dyn(conn), true);
    }
    f.manager.initiate_graceful_shutdown(Duration::from_secs(10));

    f.manager.drop_all_connections();

    assert_eq!(f.manager.num_connections(), 0);
    assert_eq!(f.events("drop").len(), 3);
    assert_eq!(f.events("dump").len(), 2);
    assert_eq!(f.callback.empty.get(), 1);
    assert_eq!(f.callback.removed.get(), 0);
    assert_eq!(f.event_base.pending_timeouts(), 0);
    assert_eq!(f.event_base.pending_loop_callbacks(), 0);
    assert!(conns.iter().all(|c| c.connection_manager().is_none()));

    f.manager.drop_all_connections();
    assert_eq!(f.callback.empty.get(), 1);
}

#[test]
fn test_dropping_manager_detaches_connections() {
    let f = Fixture::new(Duration::from_secs(60));
    let conns = f.connections(2);
    f.manager.add_connection(&as_dyn(&conns[0]), true);

    let Fixture {
        event_base,
        manager,
        ..
    } = f;
    drop(manager);

    assert!(conns[0].connection_manager().is_none());
    assert_eq!(event_base.pending_timeouts(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Remove(usize),
    Activate(usize),
    Deactivate(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (0..4u8, 0..8usize).prop_map(|(kind, id)| match kind {
        0 => Op::Add(id),
        1 => Op::Remove(id),
        2 => Op::Activate(id),
        _ => Op::Deactivate(id),
    })
}

proptest! {
    #[test]
    fn prop_idle_cursor_tracks_deactivation_order(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let f = Fixture::new(Duration::from_secs(60));
        let conns: Vec<Rc<TestConnection>> =
            (0..8).map(|id| TestConnection::new(id, &f.log)).collect();

        let mut registered = vec![false; 8];
        let mut idle: Vec<usize> = vec![];

        for op in ops {
            match op {
                Op::Add(id) => {
                    f.manager.add_connection(&as_dyn(&conns[id]), false);
                    registered[id] = true;
                }
                Op::Remove(id) => {
                    f.manager.remove_connection(conns[id].as_ref());
                    registered[id] = false;
                    idle.retain(|i| *i != id);
                }
                Op::Activate(id) => {
                    f.manager.on_activated(conns[id].as_ref());
                    idle.retain(|i| *i != id);
                }
                Op::Deactivate(id) => {
                    f.manager.on_deactivated(conns[id].as_ref());
                    if registered[id] {
                        idle.retain(|i| *i != id);
                        idle.push(id);
                    }
                }
            }

            prop_assert_eq!(
                f.manager.num_connections(),
                registered.iter().filter(|r| **r).count()
            );
            prop_assert_eq!(f.idle_ids(&conns), idle.clone());
        }
    }
}
