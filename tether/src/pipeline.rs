//! # Pipeline - Ordered Chain of Handlers
//!
//! A [`Pipeline`] owns an ordered list of [`Handler`]s. Inbound events enter at the
//! front and travel toward the back; writes enter at the back and travel toward the
//! front, where a transport handler typically hands them to a socket.
//!
//! ```text
//!            read / read_eof / read_exception / transport_active
//!                                   │
//!   ┌───────────┐   ┌───────────┐   ↓   ┌───────────┐
//!   │ Transport │ → │   Codec   │ → ... │    App    │
//!   │  handler  │ ← │           │ ← ... │  handler  │
//!   └───────────┘   └───────────┘   ↑   └───────────┘
//!                                   │
//!                           write / close
//! ```
//!
//! ## Mutability
//!
//! Handlers can be added and removed at any time, including from inside a handler
//! callback. Every mutation relinks the chain before it returns, so the next event
//! always sees the current set of handlers. [`PipelineBase::finalize`] additionally
//! checks that adjacent handlers agree on their message types.
//!
//! ## Ownership
//!
//! | method | the pipeline holds |
//! |--------|--------------------|
//! | [`add_back`](Pipeline::add_back) / [`add_front`](Pipeline::add_front) | the only reference |
//! | [`add_back_shared`](Pipeline::add_back_shared) / [`add_front_shared`](Pipeline::add_front_shared) | one of several `Rc`s |
//! | [`add_back_borrowed`](Pipeline::add_back_borrowed) / [`add_front_borrowed`](Pipeline::add_front_borrowed) | a `Weak` |
//!
//! ## Unidirectional pipelines
//!
//! Use [`Unit`](crate::Unit) as the read type for a write-only pipeline, or as the write type for a
//! read-only one. The missing direction's entry points do not exist:
//!
//! ```rust,compile_fail
//! use tether::{OutboundPipeline, Pipeline, Unit};
//!
//! let pipeline: Pipeline<String, Unit> = Pipeline::new();
//! let _ = pipeline.close();
//! ```
//!
//! ```rust,compile_fail
//! use tether::{InboundPipeline, Pipeline, Unit};
//!
//! let pipeline: Pipeline<Unit, String> = Pipeline::new();
//! pipeline.read_eof();
//! ```
//!
//! Entry points are available for every [`Message`] type, which covers all types
//! except [`Unit`](crate::Unit) and those that opt out of `Unpin`; box and pin the latter.

use std::any::{type_name, Any, TypeId};
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::rc::{Rc, Weak};

use log::warn;

use crate::handler::{write_error, Handler, HandlerRef, Message, WriteFuture};
use crate::pipeline_internal::{Entry, HandlerNode, HandlerOwnership, PipelineInternal};

/// Endpoint information of the connection a pipeline serves.
pub trait Transport {
    /// Local address of the connection.
    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    /// Remote address of the connection.
    fn peer_addr(&self) -> std::io::Result<SocketAddr>;
}

/// Flags passed along with writes to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WriteFlags(u32);

impl WriteFlags {
    /// No flags.
    pub const NONE: WriteFlags = WriteFlags(0);
    /// More data follows; the transport may delay sending.
    pub const CORK: WriteFlags = WriteFlags(0x01);
    /// The write ends a logical record.
    pub const EOR: WriteFlags = WriteFlags(0x02);
    /// Shut down the write side once the data has been written.
    pub const WRITE_SHUTDOWN: WriteFlags = WriteFlags(0x04);

    /// Raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for WriteFlags {
    fn bitor_assign(&mut self, rhs: WriteFlags) {
        self.0 |= rhs.0;
    }
}

/// Buffer sizing hints for transport reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadBufferSettings {
    /// Minimum free space to have available before reading.
    pub min_available: u64,
    /// Size of a freshly allocated read buffer.
    pub allocation_size: u64,
}

impl Default for ReadBufferSettings {
    fn default() -> Self {
        Self {
            min_available: 2048,
            allocation_size: 2048,
        }
    }
}

/// Owner of pipelines, asked to dispose of one on request.
pub trait PipelineManager {
    /// Destroys `pipeline`, typically by dropping the last reference to it.
    fn delete_pipeline(&self, pipeline: &dyn PipelineBase);
}

/// Creates a pipeline for every accepted connection.
pub trait PipelineFactory<R, W> {
    /// Builds the pipeline serving `transport`.
    fn new_pipeline(&self, transport: Rc<dyn Transport>) -> Rc<Pipeline<R, W>>;
}

/// State shared by a pipeline and all of its contexts.
#[derive(Default)]
pub(crate) struct PipelineState {
    transport: RefCell<Option<Rc<dyn Transport>>>,
    write_flags: Cell<WriteFlags>,
    read_buffer_settings: Cell<ReadBufferSettings>,
    manager: RefCell<Option<Weak<dyn PipelineManager>>>,
}

impl PipelineState {
    pub(crate) fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.transport.borrow().clone()
    }

    pub(crate) fn write_flags(&self) -> WriteFlags {
        self.write_flags.get()
    }

    pub(crate) fn set_write_flags(&self, flags: WriteFlags) {
        self.write_flags.set(flags);
    }

    pub(crate) fn read_buffer_settings(&self) -> ReadBufferSettings {
        self.read_buffer_settings.get()
    }

    pub(crate) fn set_read_buffer_settings(&self, settings: ReadBufferSettings) {
        self.read_buffer_settings.set(settings);
    }
}

/// Type independent pipeline operations.
pub trait PipelineBase {
    /// Number of handlers.
    fn len(&self) -> usize;

    /// Whether the pipeline has no handlers.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler names from front to back.
    fn names(&self) -> Vec<String>;

    /// Relinks the chain and checks that adjacent handlers agree on message
    /// types. Fails with `InvalidInput` when a direction the pipeline exposes
    /// has no handler, and with `InvalidData` on a type mismatch.
    fn finalize(&self) -> Result<(), std::io::Error>;

    /// Associates the connection the pipeline serves.
    fn set_transport(&self, transport: Option<Rc<dyn Transport>>);

    /// The connection the pipeline serves.
    fn transport(&self) -> Option<Rc<dyn Transport>>;

    /// Sets the flags applied to writes reaching the transport.
    fn set_write_flags(&self, flags: WriteFlags);

    /// Flags applied to writes reaching the transport.
    fn write_flags(&self) -> WriteFlags;

    /// Sets the buffer sizing hints for transport reads.
    fn set_read_buffer_settings(&self, settings: ReadBufferSettings);

    /// Buffer sizing hints for transport reads, `2048/2048` by default.
    fn read_buffer_settings(&self) -> ReadBufferSettings;

    /// Registers the manager that [`delete_pipeline`](PipelineBase::delete_pipeline) defers to.
    fn set_pipeline_manager(&self, manager: Option<Weak<dyn PipelineManager>>);

    /// Asks the pipeline manager, if any, to destroy this pipeline.
    fn delete_pipeline(&self);

    /// Upcast for downcasting to a concrete `Pipeline<R, W>`.
    fn as_any(&self) -> &dyn Any;
}

/// Inbound entry points, pushing events from the transport toward the application.
pub trait InboundPipeline<R> {
    /// The transport is connected.
    fn transport_active(&self);

    /// The transport is disconnected.
    fn transport_inactive(&self);

    /// Pushes a message into the first inbound handler.
    fn read(&self, msg: R);

    /// The peer will send no more data.
    fn read_eof(&self);

    /// Reading from the transport failed.
    fn read_exception(&self, err: Box<dyn Error>);
}

/// Outbound entry points, pushing writes from the application toward the transport.
pub trait OutboundPipeline<W> {
    /// Pushes a message into the last outbound handler.
    fn write(&self, msg: W) -> WriteFuture;

    /// Asks the chain to close the transport.
    fn close(&self) -> WriteFuture;
}

/// An ordered, mutable chain of handlers.
///
/// `R` is the type read from the transport, `W` the type the application writes.
pub struct Pipeline<R, W> {
    state: Rc<PipelineState>,
    internal: RefCell<PipelineInternal<R, W>>,
}

impl<R: 'static, W: 'static> Default for Pipeline<R, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: 'static, W: 'static> Pipeline<R, W> {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self {
            state: Rc::new(PipelineState::default()),
            internal: RefCell::new(PipelineInternal::new()),
        }
    }

    fn add<H: Handler + 'static>(
        &self,
        handler: HandlerRef<H>,
        ownership: HandlerOwnership,
        front: bool,
    ) -> &Self {
        let Some(node) = HandlerNode::new(handler, ownership, &self.state) else {
            warn!("skipping {} handler that was already dropped", type_name::<H>());
            return self;
        };
        let (handler, context) = (Rc::clone(&node.handler), Rc::clone(&node.context));
        {
            let mut internal = self.internal.borrow_mut();
            let index = if front { 0 } else { internal.len() };
            internal.insert(index, node);
        }
        handler.attach_pipeline_internal(&*context);
        self
    }

    /// Appends a handler the pipeline owns.
    pub fn add_back(&self, handler: impl Handler + 'static) -> &Self {
        self.add(HandlerRef::Strong(Rc::new(handler)), HandlerOwnership::Owned, false)
    }

    /// Prepends a handler the pipeline owns.
    pub fn add_front(&self, handler: impl Handler + 'static) -> &Self {
        self.add(HandlerRef::Strong(Rc::new(handler)), HandlerOwnership::Owned, true)
    }

    /// Appends a handler shared with the caller.
    pub fn add_back_shared<H: Handler + 'static>(&self, handler: Rc<H>) -> &Self {
        self.add(HandlerRef::Strong(handler), HandlerOwnership::Shared, false)
    }

    /// Prepends a handler shared with the caller.
    pub fn add_front_shared<H: Handler + 'static>(&self, handler: Rc<H>) -> &Self {
        self.add(HandlerRef::Strong(handler), HandlerOwnership::Shared, true)
    }

    /// Appends a handler the caller keeps alive. Events reaching it after it
    /// has been dropped are discarded.
    pub fn add_back_borrowed<H: Handler + 'static>(&self, handler: &Rc<H>) -> &Self {
        self.add(HandlerRef::Weak(Rc::downgrade(handler)), HandlerOwnership::Borrowed, false)
    }

    /// Prepends a handler the caller keeps alive.
    pub fn add_front_borrowed<H: Handler + 'static>(&self, handler: &Rc<H>) -> &Self {
        self.add(HandlerRef::Weak(Rc::downgrade(handler)), HandlerOwnership::Borrowed, true)
    }

    fn detach_all(removed: Vec<HandlerNode>) {
        for node in &removed {
            node.detach();
        }
    }

    /// Removes the first context holding this exact handler instance.
    pub fn remove_handler<H: Handler + 'static>(
        &self,
        handler: &Rc<H>,
    ) -> Result<&Self, std::io::Error> {
        let addr = Rc::as_ptr(handler) as *const ();
        let removed = self.internal.borrow_mut().remove_identity(addr)?;
        removed.detach();
        Ok(self)
    }

    /// Removes the first handler of type `H`, counted from the front.
    pub fn remove_kind<H: Handler + 'static>(&self) -> Result<&Self, std::io::Error> {
        let removed = self
            .internal
            .borrow_mut()
            .remove_kind(TypeId::of::<H>(), type_name::<H>())?;
        removed.detach();
        Ok(self)
    }

    /// Removes every handler named `handler_name`.
    pub fn remove(&self, handler_name: &str) -> Result<&Self, std::io::Error> {
        let removed = self.internal.borrow_mut().remove_named(handler_name)?;
        Self::detach_all(removed);
        Ok(self)
    }

    /// Removes the first handler.
    pub fn remove_front(&self) -> Result<&Self, std::io::Error> {
        let removed = self.internal.borrow_mut().remove_at(0)?;
        removed.detach();
        Ok(self)
    }

    /// Removes the last handler.
    pub fn remove_back(&self) -> Result<&Self, std::io::Error> {
        let removed = {
            let mut internal = self.internal.borrow_mut();
            let len = internal.len();
            internal.remove_at(len.wrapping_sub(1))?
        };
        removed.detach();
        Ok(self)
    }

    /// The handler at `index`, counted from the front.
    ///
    /// Fails with `NotFound` when the index is out of range, the handler is not
    /// an `H`, or a borrowed handler has been dropped.
    pub fn get_handler<H: Handler + 'static>(&self, index: usize) -> Result<Rc<H>, std::io::Error> {
        self.internal.borrow().get_handler::<H>(index)
    }

    /// How the pipeline holds the handler at `index`.
    pub fn handler_ownership(&self, index: usize) -> Option<HandlerOwnership> {
        self.internal.borrow().ownership(index)
    }

    /// Marks `handler` as the pipeline's owner. The owner is not detached when
    /// the pipeline is dropped. Returns `false` if it is not in the pipeline.
    pub fn set_owner<H: Handler + 'static>(&self, handler: &Rc<H>) -> bool {
        self.internal
            .borrow_mut()
            .set_owner(Rc::as_ptr(handler) as *const ())
    }

    fn front(&self) -> Option<Entry> {
        self.internal.borrow().front()
    }

    fn back(&self) -> Option<Entry> {
        self.internal.borrow().back()
    }
}

impl<R: 'static, W: 'static> PipelineBase for Pipeline<R, W> {
    fn len(&self) -> usize {
        self.internal.borrow().len()
    }

    fn names(&self) -> Vec<String> {
        self.internal.borrow().names()
    }

    fn finalize(&self) -> Result<(), std::io::Error> {
        self.internal.borrow_mut().finalize()
    }

    fn set_transport(&self, transport: Option<Rc<dyn Transport>>) {
        *self.state.transport.borrow_mut() = transport;
    }

    fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.state.transport()
    }

    fn set_write_flags(&self, flags: WriteFlags) {
        self.state.set_write_flags(flags);
    }

    fn write_flags(&self) -> WriteFlags {
        self.state.write_flags()
    }

    fn set_read_buffer_settings(&self, settings: ReadBufferSettings) {
        self.state.set_read_buffer_settings(settings);
    }

    fn read_buffer_settings(&self) -> ReadBufferSettings {
        self.state.read_buffer_settings()
    }

    fn set_pipeline_manager(&self, manager: Option<Weak<dyn PipelineManager>>) {
        *self.state.manager.borrow_mut() = manager;
    }

    fn delete_pipeline(&self) {
        let manager = self.state.manager.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(manager) = manager {
            manager.delete_pipeline(self);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<R: Message, W: 'static> InboundPipeline<R> for Pipeline<R, W> {
    fn transport_active(&self) {
        if let Some((handler, context)) = self.front() {
            handler.transport_active_internal(&*context);
        }
    }

    fn transport_inactive(&self) {
        if let Some((handler, context)) = self.front() {
            handler.transport_inactive_internal(&*context);
        }
    }

    fn read(&self, msg: R) {
        if let Some((handler, context)) = self.front() {
            handler.handle_read_internal(&*context, Box::new(msg));
        } else {
            warn!("read reached end of pipeline");
        }
    }

    fn read_eof(&self) {
        if let Some((handler, context)) = self.front() {
            handler.handle_read_eof_internal(&*context);
        } else {
            warn!("read_eof reached end of pipeline");
        }
    }

    fn read_exception(&self, err: Box<dyn Error>) {
        if let Some((handler, context)) = self.front() {
            handler.handle_read_exception_internal(&*context, err);
        } else {
            warn!("read_exception reached end of pipeline: {}", err);
        }
    }
}

impl<R: 'static, W: Message> OutboundPipeline<W> for Pipeline<R, W> {
    fn write(&self, msg: W) -> WriteFuture {
        if let Some((handler, context)) = self.back() {
            handler.handle_write_internal(&*context, Box::new(msg))
        } else {
            warn!("write reached end of pipeline");
            write_error(ErrorKind::NotConnected, "write reached end of pipeline")
        }
    }

    fn close(&self) -> WriteFuture {
        if let Some((handler, context)) = self.back() {
            handler.handle_close_internal(&*context)
        } else {
            warn!("close reached end of pipeline");
            write_error(ErrorKind::NotConnected, "close reached end of pipeline")
        }
    }
}

impl<R, W> Drop for Pipeline<R, W> {
    fn drop(&mut self) {
        let internal = self.internal.get_mut();
        let nodes = internal.take_nodes();
        for node in &nodes {
            if !internal.is_owner(node) {
                node.detach();
            }
        }
    }
}
