use super::*;
use futures::executor::block_on;
use std::cell::{Cell, RefCell};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

type Log = Rc<RefCell<Vec<String>>>;

/// Records every event and forwards it unchanged.
struct Tracer {
    name: &'static str,
    log: Log,
}

impl Tracer {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: Rc::clone(log),
        }
    }

    fn record(&self, event: &str) {
        self.log.borrow_mut().push(format!("{}:{}", self.name, event));
    }
}

impl Handler for Tracer {
    type Rin = String;
    type Rout = String;
    type Win = String;
    type Wout = String;

    fn name(&self) -> &str {
        self.name
    }

    fn transport_active(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        self.record("active");
        ctx.fire_transport_active();
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        self.record(&format!("read {}", msg));
        ctx.fire_handle_read(msg);
    }

    fn handle_read_eof(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        self.record("eof");
        ctx.fire_handle_read_eof();
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        self.record(&format!("write {}", msg));
        ctx.fire_handle_write(msg)
    }

    fn handle_close(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) -> WriteFuture {
        self.record("close");
        ctx.fire_handle_close()
    }

    fn attach_pipeline(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        self.record("attach");
    }

    fn detach_pipeline(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        self.record("detach");
    }
}

/// Front stage that completes writes instead of forwarding them.
#[derive(Default)]
struct Sink {
    written: RefCell<Vec<String>>,
    closed: Cell<bool>,
    flags: Cell<WriteFlags>,
}

impl Handler for Sink {
    type Rin = String;
    type Rout = String;
    type Win = String;
    type Wout = String;

    fn name(&self) -> &str {
        "Sink"
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        ctx.fire_handle_read(msg);
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        self.flags.set(ctx.write_flags());
        self.written.borrow_mut().push(msg);
        write_ok()
    }

    fn handle_close(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) -> WriteFuture {
        self.closed.set(true);
        write_ok()
    }
}

/// Inbound only: parses reads into numbers.
struct Parse;

impl Handler for Parse {
    type Rin = String;
    type Rout = u32;
    type Win = Unit;
    type Wout = Unit;

    fn name(&self) -> &str {
        "Parse"
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        match msg.parse::<u32>() {
            Ok(n) => ctx.fire_handle_read(n),
            Err(err) => ctx.fire_handle_read_exception(Box::new(err)),
        }
    }

    fn handle_write(
        &self,
        _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        msg.unreachable()
    }
}

/// Outbound only: renders numbers as strings.
struct Render;

impl Handler for Render {
    type Rin = Unit;
    type Rout = Unit;
    type Win = u32;
    type Wout = String;

    fn name(&self) -> &str {
        "Render"
    }

    fn handle_read(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        msg.unreachable()
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        ctx.fire_handle_write(msg.to_string())
    }
}

/// Application stage: doubles every number and writes it back.
#[derive(Default)]
struct Doubler {
    errors: RefCell<Vec<String>>,
}

impl Handler for Doubler {
    type Rin = u32;
    type Rout = u32;
    type Win = u32;
    type Wout = u32;

    fn name(&self) -> &str {
        "Doubler"
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        let _ = ctx.fire_handle_write(msg * 2);
    }

    fn handle_read_exception(
        &self,
        _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        err: Box<dyn std::error::Error>,
    ) {
        self.errors.borrow_mut().push(err.to_string());
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        ctx.fire_handle_write(msg)
    }
}

/// Removes itself from the pipeline on the first read.
struct OneShot {
    pipeline: RefCell<Weak<Pipeline<String, String>>>,
    log: Log,
}

impl Handler for OneShot {
    type Rin = String;
    type Rout = String;
    type Win = String;
    type Wout = String;

    fn name(&self) -> &str {
        "OneShot"
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        self.log.borrow_mut().push(format!("OneShot:read {}", msg));
        if let Some(pipeline) = self.pipeline.borrow().upgrade() {
            assert!(pipeline.remove("OneShot").is_ok());
        }
        ctx.fire_handle_read(msg);
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        ctx.fire_handle_write(msg)
    }

    fn detach_pipeline(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        self.log.borrow_mut().push("OneShot:detach".to_string());
    }
}

struct FixedTransport;

impl Transport for FixedTransport {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(SocketAddr::from(([10, 0, 0, 1], 50000)))
    }
}

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn taken(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.borrow_mut())
}

fn abc(log: &Log) -> Pipeline<String, String> {
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back(Tracer::new("A", log))
        .add_back(Tracer::new("B", log))
        .add_back(Tracer::new("C", log));
    taken(log);
    pipeline
}

#[test]
fn test_inbound_and_outbound_order() {
    let log = new_log();
    let pipeline = abc(&log);
    assert_eq!(pipeline.names(), vec!["A", "B", "C"]);

    pipeline.read("x".to_string());
    assert_eq!(taken(&log), vec!["A:read x", "B:read x", "C:read x"]);

    let result = block_on(pipeline.write("y".to_string()));
    assert_eq!(taken(&log), vec!["C:write y", "B:write y", "A:write y"]);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::NotConnected);
}

#[test]
fn test_attach_on_add_and_detach_on_remove() {
    let log = new_log();
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline.add_back(Tracer::new("A", &log));
    assert_eq!(taken(&log), vec!["A:attach"]);

    pipeline.remove("A").unwrap();
    assert_eq!(taken(&log), vec!["A:detach"]);
    assert!(pipeline.is_empty());
}

#[test]
fn test_remove_middle_handler_relinks_chain() {
    let log = new_log();
    let pipeline = abc(&log);

    pipeline.remove("B").unwrap();
    assert_eq!(taken(&log), vec!["B:detach"]);
    assert_eq!(pipeline.names(), vec!["A", "C"]);

    pipeline.read("x".to_string());
    let _ = block_on(pipeline.write("y".to_string()));
    assert_eq!(
        taken(&log),
        vec!["A:read x", "C:read x", "C:write y", "A:write y"]
    );
}

#[test]
fn test_remove_unknown_handler_is_not_found() {
    let log = new_log();
    let pipeline = abc(&log);

    let err = pipeline.remove("Z").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(pipeline.len(), 3);

    let err = pipeline.remove_kind::<Sink>().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_remove_kind_removes_first_instance() {
    let log = new_log();
    let pipeline = abc(&log);
    pipeline.add_front(Sink::default());

    pipeline.remove_kind::<Tracer>().unwrap();
    assert_eq!(pipeline.names(), vec!["Sink", "B", "C"]);
    assert_eq!(taken(&log), vec!["A:detach"]);

    pipeline.remove_kind::<Tracer>().unwrap().remove_kind::<Tracer>().unwrap();
    assert_eq!(pipeline.names(), vec!["Sink"]);
    assert_eq!(taken(&log), vec!["B:detach", "C:detach"]);
    assert_eq!(
        pipeline.remove_kind::<Tracer>().err().unwrap().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_remove_by_name_removes_every_match() {
    let log = new_log();
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back(Tracer::new("T", &log))
        .add_back(Tracer::new("U", &log))
        .add_back(Tracer::new("T", &log));
    taken(&log);

    pipeline.remove("T").unwrap();
    assert_eq!(pipeline.names(), vec!["U"]);
    assert_eq!(taken(&log), vec!["T:detach", "T:detach"]);
}

#[test]
fn test_remove_front_and_back() {
    let log = new_log();
    let pipeline = abc(&log);

    pipeline.remove_front().unwrap().remove_back().unwrap();
    assert_eq!(pipeline.names(), vec!["B"]);

    pipeline.remove_back().unwrap();
    assert_eq!(
        pipeline.remove_front().err().unwrap().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        pipeline.remove_back().err().unwrap().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_remove_handler_by_identity() {
    let log = new_log();
    let first = Rc::new(Tracer::new("T", &log));
    let second = Rc::new(Tracer::new("T", &log));
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back_shared(first.clone())
        .add_back_shared(second.clone());

    pipeline.remove_handler(&second).unwrap();
    assert_eq!(pipeline.len(), 1);
    assert!(Rc::ptr_eq(&pipeline.get_handler::<Tracer>(0).unwrap(), &first));

    let err = pipeline.remove_handler(&second).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_remove_handler_added_twice_removes_first_context() {
    let log = new_log();
    let tracer = Rc::new(Tracer::new("T", &log));
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back_shared(tracer.clone())
        .add_back(Tracer::new("M", &log))
        .add_back_shared(tracer.clone());
    taken(&log);

    pipeline.remove_handler(&tracer).unwrap();
    assert_eq!(pipeline.names(), vec!["M", "T"]);
    assert_eq!(taken(&log), vec!["T:detach"]);
    assert!(Rc::ptr_eq(&pipeline.get_handler::<Tracer>(1).unwrap(), &tracer));
}

#[test]
fn test_get_handler() {
    let log = new_log();
    let pipeline = abc(&log);

    let b = pipeline.get_handler::<Tracer>(1).unwrap();
    assert_eq!(b.name(), "B");

    assert_eq!(
        pipeline.get_handler::<Tracer>(3).err().unwrap().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        pipeline.get_handler::<Sink>(0).err().unwrap().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_handler_ownership() {
    let log = new_log();
    let shared = Rc::new(Tracer::new("S", &log));
    let borrowed = Rc::new(Tracer::new("W", &log));
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back(Tracer::new("O", &log))
        .add_back_shared(shared.clone())
        .add_back_borrowed(&borrowed);

    assert_eq!(pipeline.handler_ownership(0), Some(HandlerOwnership::Owned));
    assert_eq!(pipeline.handler_ownership(1), Some(HandlerOwnership::Shared));
    assert_eq!(pipeline.handler_ownership(2), Some(HandlerOwnership::Borrowed));
    assert_eq!(pipeline.handler_ownership(3), None);

    assert!(Rc::strong_count(&shared) > 1);
    assert_eq!(Rc::strong_count(&borrowed), 1);
}

#[test]
fn test_dropped_borrowed_handler_is_skipped() {
    let log = new_log();
    let borrowed = Rc::new(Tracer::new("W", &log));
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back(Tracer::new("A", &log))
        .add_back_borrowed(&borrowed);
    drop(borrowed);
    taken(&log);

    pipeline.read("x".to_string());
    assert_eq!(taken(&log), vec!["A:read x"]);

    assert_eq!(
        pipeline.get_handler::<Tracer>(1).err().unwrap().kind(),
        ErrorKind::NotFound
    );
    let err = block_on(pipeline.write("y".to_string())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[test]
fn test_drop_detaches_everything_but_owner() {
    let log = new_log();
    let owner = Rc::new(Tracer::new("Owner", &log));
    let stranger = Rc::new(Tracer::new("Stranger", &log));
    {
        let pipeline: Pipeline<String, String> = Pipeline::new();
        pipeline
            .add_back(Tracer::new("A", &log))
            .add_back_shared(owner.clone());
        assert!(pipeline.set_owner(&owner));
        assert!(!pipeline.set_owner(&stranger));
        taken(&log);
    }
    assert_eq!(taken(&log), vec!["A:detach"]);
    assert_eq!(Rc::strong_count(&owner), 1);
}

#[test]
fn test_removed_owner_is_no_longer_exempt() {
    let log = new_log();
    let owner = Rc::new(Tracer::new("Owner", &log));
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline.add_back_shared(owner.clone());
    assert!(pipeline.set_owner(&owner));

    pipeline.remove_handler(&owner).unwrap();
    pipeline.add_back_shared(owner.clone());
    taken(&log);

    drop(pipeline);
    assert_eq!(taken(&log), vec!["Owner:detach"]);
}

#[test]
fn test_unidirectional_handlers_are_skipped() {
    let sink = Rc::new(Sink::default());
    let doubler = Rc::new(Doubler::default());
    let pipeline: Pipeline<String, u32> = Pipeline::new();
    pipeline
        .add_back_shared(sink.clone())
        .add_back(Parse)
        .add_back(Render)
        .add_back_shared(doubler.clone());
    pipeline.finalize().unwrap();

    pipeline.read("21".to_string());
    assert_eq!(*sink.written.borrow(), vec!["42".to_string()]);

    pipeline.read("nope".to_string());
    assert_eq!(doubler.errors.borrow().len(), 1);

    block_on(pipeline.write(7)).unwrap();
    assert_eq!(sink.written.borrow().last().map(String::as_str), Some("7"));
}

#[test]
fn test_finalize_detects_type_mismatch() {
    let pipeline: Pipeline<String, u32> = Pipeline::new();
    pipeline.add_back(Sink::default()).add_back(Doubler::default());

    let err = pipeline.finalize().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn test_finalize_requires_both_directions() {
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline.add_back(Parse);
    assert_eq!(
        pipeline.finalize().unwrap_err().kind(),
        ErrorKind::InvalidInput
    );

    let pipeline: Pipeline<String, Unit> = Pipeline::new();
    pipeline.add_back(Parse);
    assert!(pipeline.finalize().is_ok());
}

#[test]
fn test_empty_pipeline_entry_points() {
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline.transport_active();
    pipeline.read("lost".to_string());
    pipeline.read_eof();

    let err = block_on(pipeline.write("lost".to_string())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = block_on(pipeline.close()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[test]
fn test_close_travels_to_front() {
    let log = new_log();
    let sink = Rc::new(Sink::default());
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline
        .add_back_shared(sink.clone())
        .add_back(Tracer::new("A", &log));

    block_on(pipeline.close()).unwrap();
    assert!(sink.closed.get());
    assert_eq!(taken(&log), vec!["A:attach", "A:close"]);
}

#[test]
fn test_handler_removes_itself_during_read() {
    let log = new_log();
    let pipeline: Rc<Pipeline<String, String>> = Rc::new(Pipeline::new());
    let one_shot = OneShot {
        pipeline: RefCell::new(Rc::downgrade(&pipeline)),
        log: Rc::clone(&log),
    };
    pipeline
        .add_back(Tracer::new("A", &log))
        .add_back(one_shot)
        .add_back(Tracer::new("C", &log));
    taken(&log);

    pipeline.read("1".to_string());
    assert_eq!(
        taken(&log),
        vec!["A:read 1", "OneShot:read 1", "OneShot:detach", "C:read 1"]
    );

    pipeline.read("2".to_string());
    assert_eq!(taken(&log), vec!["A:read 2", "C:read 2"]);
}

#[test]
fn test_shared_state_defaults_and_updates() {
    let sink = Rc::new(Sink::default());
    let pipeline: Pipeline<String, String> = Pipeline::new();
    pipeline.add_back_shared(sink.clone());

    assert!(pipeline.transport().is_none());
    assert_eq!(pipeline.write_flags(), WriteFlags::NONE);
    assert_eq!(
        pipeline.read_buffer_settings(),
        ReadBufferSettings {
            min_available: 2048,
            allocation_size: 2048
        }
    );

    pipeline.set_transport(Some(Rc::new(FixedTransport)));
    let peer = pipeline.transport().unwrap().peer_addr().unwrap();
    assert_eq!(peer.port(), 50000);

    pipeline.set_write_flags(WriteFlags::CORK | WriteFlags::EOR);
    block_on(pipeline.write("x".to_string())).unwrap();
    assert!(sink.flags.get().contains(WriteFlags::CORK));
    assert!(sink.flags.get().contains(WriteFlags::EOR));
    assert!(!sink.flags.get().contains(WriteFlags::WRITE_SHUTDOWN));

    pipeline.set_read_buffer_settings(ReadBufferSettings {
        min_available: 1,
        allocation_size: 4096,
    });
    assert_eq!(pipeline.read_buffer_settings().allocation_size, 4096);
}

#[derive(Default)]
struct Registry {
    pipelines: RefCell<Vec<Rc<Pipeline<String, String>>>>,
}

impl PipelineManager for Registry {
    fn delete_pipeline(&self, pipeline: &dyn PipelineBase) {
        let Some(target) = pipeline.as_any().downcast_ref::<Pipeline<String, String>>() else {
            return;
        };
        self.pipelines
            .borrow_mut()
            .retain(|p| !std::ptr::eq(p.as_ref(), target));
    }
}

#[test]
fn test_delete_pipeline_defers_to_manager() {
    let registry = Rc::new(Registry::default());
    let pipeline: Rc<Pipeline<String, String>> = Rc::new(Pipeline::new());
    registry.pipelines.borrow_mut().push(pipeline.clone());

    pipeline.delete_pipeline();
    assert_eq!(registry.pipelines.borrow().len(), 1);

    let manager: Rc<dyn PipelineManager> = registry.clone();
    pipeline.set_pipeline_manager(Some(Rc::downgrade(&manager)));
    pipeline.delete_pipeline();
    assert!(registry.pipelines.borrow().is_empty());
}

struct Factory;

impl PipelineFactory<String, String> for Factory {
    fn new_pipeline(&self, transport: Rc<dyn Transport>) -> Rc<Pipeline<String, String>> {
        let pipeline: Pipeline<String, String> = Pipeline::new();
        pipeline.set_transport(Some(transport));
        pipeline.add_back(Sink::default());
        Rc::new(pipeline)
    }
}

#[test]
fn test_pipeline_factory() {
    let pipeline = Factory.new_pipeline(Rc::new(FixedTransport));
    assert!(pipeline.finalize().is_ok());
    assert_eq!(
        pipeline.transport().unwrap().local_addr().unwrap().port(),
        8080
    );
}

struct Pinned {
    value: u32,
    _pinned: std::marker::PhantomPinned,
}

#[derive(Default)]
struct PinnedSink {
    seen: Cell<u32>,
}

impl Handler for PinnedSink {
    type Rin = std::pin::Pin<Box<Pinned>>;
    type Rout = std::pin::Pin<Box<Pinned>>;
    type Win = Unit;
    type Wout = Unit;

    fn name(&self) -> &str {
        "PinnedSink"
    }

    fn handle_read(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        self.seen.set(msg.value);
    }

    fn handle_write(
        &self,
        _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        msg.unreachable()
    }
}

#[test]
fn test_pinned_messages_travel_boxed() {
    let sink = Rc::new(PinnedSink::default());
    let pipeline: Pipeline<std::pin::Pin<Box<Pinned>>, Unit> = Pipeline::new();
    pipeline.add_back_shared(sink.clone());
    assert!(pipeline.finalize().is_ok());

    pipeline.read(Box::pin(Pinned {
        value: 7,
        _pinned: std::marker::PhantomPinned,
    }));
    assert_eq!(sink.seen.get(), 7);
}
