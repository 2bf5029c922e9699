//! # Handler Trait - Bidirectional Protocol Stages
//!
//! A [`Handler`] is one stage of a [`Pipeline`](crate::Pipeline). Inbound events travel
//! from the front of the pipeline (the transport) to the back (the application);
//! outbound writes travel from the back to the front.
//!
//! ## Type Parameters
//!
//! - `Rin`: **R**ead **in**put - what this handler receives from the handler in front of it
//! - `Rout`: **R**ead **out**put - what it passes to the handler behind it
//! - `Win`: **W**rite **in**put - what it receives from the handler behind it
//! - `Wout`: **W**rite **out**put - what it passes to the handler in front of it
//!
//! ```text
//! Pipeline: Transport -> Codec -> App
//!
//! read:   Transport(Rin -> Rout) -> Codec(Rin -> Rout) -> App(Rin)
//! write:  Transport(Wout <- Win) <- Codec(Wout <- Win) <- App(Win)
//! ```
//!
//! A handler whose `Rin` is [`Unit`] only takes part in the outbound direction, and one
//! whose `Win` is [`Unit`] only in the inbound direction. The pipeline skips such handlers
//! when it links the other direction.
//!
//! ## Push model
//!
//! Every method takes `&self`. Handlers keep mutable state in `Cell`/`RefCell`, because a
//! handler is allowed to write back (or close the pipeline) while it is still handling a
//! read: an echo stage calls [`Context::fire_handle_write`] from inside
//! [`Handler::handle_read`].
//!
//! Writes return a [`WriteFuture`] that resolves once the stage at the front of the
//! pipeline has completed or failed the write.
//!
//! ## Example
//!
//! ```rust
//! use tether::{Context, Handler, InboundPipeline, Pipeline, WriteFuture};
//! use std::{cell::RefCell, rc::Rc};
//!
//! struct ToUpper;
//!
//! impl Handler for ToUpper {
//!     type Rin = String;
//!     type Rout = String;
//!     type Win = String;
//!     type Wout = String;
//!
//!     fn name(&self) -> &str {
//!         "ToUpper"
//!     }
//!
//!     fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
//!         ctx.fire_handle_read(msg.to_uppercase());
//!     }
//!
//!     fn handle_write(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Win) -> WriteFuture {
//!         ctx.fire_handle_write(msg)
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Collector {
//!     seen: RefCell<Vec<String>>,
//! }
//!
//! impl Handler for Collector {
//!     type Rin = String;
//!     type Rout = String;
//!     type Win = String;
//!     type Wout = String;
//!
//!     fn name(&self) -> &str {
//!         "Collector"
//!     }
//!
//!     fn handle_read(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
//!         self.seen.borrow_mut().push(msg);
//!     }
//!
//!     fn handle_write(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Win) -> WriteFuture {
//!         ctx.fire_handle_write(msg)
//!     }
//! }
//!
//! let collector = Rc::new(Collector::default());
//! let pipeline: Pipeline<String, String> = Pipeline::new();
//! pipeline.add_back(ToUpper).add_back_shared(collector.clone());
//!
//! pipeline.read("hello".to_string());
//! assert_eq!(*collector.seen.borrow(), vec!["HELLO".to_string()]);
//! ```

use crate::handler_internal::{ContextInternal, HandlerInternal, Link};
use crate::pipeline::{PipelineState, ReadBufferSettings, Transport, WriteFlags};
use futures::future::{self, FutureExt, LocalBoxFuture};
use log::{trace, warn};
use std::any::Any;
use std::cell::RefCell;
use std::convert::Infallible;
use std::error::Error;
use std::io::{self, ErrorKind};
use std::marker::{PhantomData, PhantomPinned};
use std::rc::{Rc, Weak};

/// Completion of an outbound write or close.
pub type WriteFuture = LocalBoxFuture<'static, io::Result<()>>;

/// Builds an already failed [`WriteFuture`].
pub fn write_error(kind: ErrorKind, msg: impl Into<String>) -> WriteFuture {
    future::ready(Err(io::Error::new(kind, msg.into()))).boxed_local()
}

/// Builds an already completed [`WriteFuture`].
pub fn write_ok() -> WriteFuture {
    future::ready(Ok(())).boxed_local()
}

/// Message type of a direction that carries nothing.
///
/// `Unit` has no values, so a handler method that receives one can never run;
/// implement it with [`Unit::unreachable`]. A [`Pipeline`](crate::Pipeline) whose
/// read type is `Unit` has no inbound entry points, and one whose write type is
/// `Unit` has no outbound entry points, because `Unit` is not a [`Message`].
pub struct Unit {
    never: Infallible,
    _pinned: PhantomPinned,
}

impl Unit {
    /// Proves to the compiler that this code path cannot be reached.
    pub fn unreachable(self) -> ! {
        match self.never {}
    }
}

/// A type that can travel through the entry points of a [`Pipeline`](crate::Pipeline).
///
/// Implemented for every `'static` type that is `Unpin`, which is every type
/// except [`Unit`] and types that opt out of `Unpin` themselves. Wrap such a
/// type in `Pin<Box<_>>` to send it:
///
/// ```rust
/// use std::{marker::PhantomPinned, pin::Pin};
/// use tether::Message;
///
/// struct SelfReferential {
///     _pinned: PhantomPinned,
/// }
///
/// fn is_message<T: Message>() {}
/// is_message::<String>();
/// is_message::<Pin<Box<SelfReferential>>>();
/// ```
///
/// ```rust,compile_fail
/// use tether::{Message, Unit};
///
/// fn is_message<T: Message>() {}
/// is_message::<Unit>();
/// ```
pub trait Message: Unpin + 'static {}

impl<T: Unpin + 'static> Message for T {}

/// One stage of a pipeline.
///
/// See the [crate-level documentation](crate) for the message flow.
pub trait Handler {
    /// Read input message type.
    type Rin: 'static;
    /// Read output message type.
    type Rout: 'static;
    /// Write input message type.
    type Win: 'static;
    /// Write output message type.
    type Wout: 'static;

    /// Returns the handler's name, used in logs and by [`Pipeline::remove`](crate::Pipeline::remove).
    fn name(&self) -> &str;

    /// The transport is connected.
    fn transport_active(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        ctx.fire_transport_active();
    }

    /// The transport is disconnected.
    fn transport_inactive(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        ctx.fire_transport_inactive();
    }

    /// Handles an inbound message.
    fn handle_read(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Rin,
    );

    /// The peer will send no more data.
    fn handle_read_eof(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        ctx.fire_handle_read_eof();
    }

    /// An inbound stage failed.
    fn handle_read_exception(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        err: Box<dyn Error>,
    ) {
        ctx.fire_handle_read_exception(err);
    }

    /// Handles an outbound message.
    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture;

    /// Handles a close request travelling toward the transport.
    fn handle_close(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) -> WriteFuture {
        ctx.fire_handle_close()
    }

    /// The handler was linked into a pipeline.
    fn attach_pipeline(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {}

    /// The handler was removed from its pipeline, or the pipeline was dropped.
    fn detach_pipeline(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {}
}

/// Gives a [`Handler`] access to its neighbours and to shared pipeline state.
///
/// Inbound `fire_*` methods forward to the next handler toward the back of the
/// pipeline; [`fire_handle_write`](Context::fire_handle_write) and
/// [`fire_handle_close`](Context::fire_handle_close) forward to the next handler
/// toward the front.
pub struct Context<Rin, Rout, Win, Wout> {
    name: String,
    state: Rc<PipelineState>,

    next_in: RefCell<Option<Link>>,
    next_out: RefCell<Option<Link>>,

    phantom: PhantomData<(Rin, Rout, Win, Wout)>,
}

impl<Rin: 'static, Rout: 'static, Win: 'static, Wout: 'static> Context<Rin, Rout, Win, Wout> {
    pub(crate) fn new(name: &str, state: Rc<PipelineState>) -> Self {
        Self {
            name: name.to_string(),
            state,
            next_in: RefCell::new(None),
            next_out: RefCell::new(None),
            phantom: PhantomData,
        }
    }

    /// Name of the handler owning this context.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Transport attached to the pipeline, if any.
    pub fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.state.transport()
    }

    /// Flags applied to writes reaching the transport.
    pub fn write_flags(&self) -> WriteFlags {
        self.state.write_flags()
    }

    /// Changes the flags applied to writes reaching the transport.
    pub fn set_write_flags(&self, flags: WriteFlags) {
        self.state.set_write_flags(flags);
    }

    /// Buffer sizing hints for transport reads.
    pub fn read_buffer_settings(&self) -> ReadBufferSettings {
        self.state.read_buffer_settings()
    }

    /// Changes the buffer sizing hints for transport reads.
    pub fn set_read_buffer_settings(&self, settings: ReadBufferSettings) {
        self.state.set_read_buffer_settings(settings);
    }

    fn next_in(&self) -> Option<(Rc<dyn HandlerInternal>, Rc<dyn ContextInternal>)> {
        self.next_in.borrow().as_ref().and_then(Link::upgrade)
    }

    fn next_out(&self) -> Option<(Rc<dyn HandlerInternal>, Rc<dyn ContextInternal>)> {
        self.next_out.borrow().as_ref().and_then(Link::upgrade)
    }

    /// Propagates the transport active event.
    pub fn fire_transport_active(&self) {
        if let Some((next_handler, next_context)) = self.next_in() {
            next_handler.transport_active_internal(&*next_context);
        }
    }

    /// Propagates the transport inactive event.
    pub fn fire_transport_inactive(&self) {
        if let Some((next_handler, next_context)) = self.next_in() {
            next_handler.transport_inactive_internal(&*next_context);
        }
    }

    /// Forwards an inbound message to the next handler.
    pub fn fire_handle_read(&self, msg: Rout) {
        if let Some((next_handler, next_context)) = self.next_in() {
            next_handler.handle_read_internal(&*next_context, Box::new(msg));
        } else {
            warn!("handle_read reached end of pipeline");
        }
    }

    /// Propagates the end-of-input event.
    pub fn fire_handle_read_eof(&self) {
        if let Some((next_handler, next_context)) = self.next_in() {
            next_handler.handle_read_eof_internal(&*next_context);
        } else {
            warn!("handle_read_eof reached end of pipeline");
        }
    }

    /// Propagates an inbound error.
    pub fn fire_handle_read_exception(&self, err: Box<dyn Error>) {
        if let Some((next_handler, next_context)) = self.next_in() {
            next_handler.handle_read_exception_internal(&*next_context, err);
        } else {
            warn!("handle_read_exception reached end of pipeline: {}", err);
        }
    }

    /// Forwards an outbound message to the next handler toward the transport.
    pub fn fire_handle_write(&self, msg: Wout) -> WriteFuture {
        if let Some((next_handler, next_context)) = self.next_out() {
            next_handler.handle_write_internal(&*next_context, Box::new(msg))
        } else {
            warn!("handle_write reached end of pipeline");
            write_error(ErrorKind::NotConnected, "handle_write reached end of pipeline")
        }
    }

    /// Forwards a close request toward the transport.
    pub fn fire_handle_close(&self) -> WriteFuture {
        if let Some((next_handler, next_context)) = self.next_out() {
            next_handler.handle_close_internal(&*next_context)
        } else {
            warn!("handle_close reached end of pipeline");
            write_error(ErrorKind::NotConnected, "handle_close reached end of pipeline")
        }
    }
}

impl<Rin: 'static, Rout: 'static, Win: 'static, Wout: 'static> ContextInternal
    for Context<Rin, Rout, Win, Wout>
{
    fn name(&self) -> &str {
        self.name.as_str()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn set_next_in(&self, next: Option<Link>) {
        *self.next_in.borrow_mut() = next;
    }
    fn set_next_out(&self, next: Option<Link>) {
        *self.next_out.borrow_mut() = next;
    }
}

pub(crate) enum HandlerRef<H> {
    Strong(Rc<H>),
    Weak(Weak<H>),
}

/// Type-erasing wrapper the pipeline dispatches through.
pub(crate) struct HandlerAdapter<H> {
    name: String,
    handler: HandlerRef<H>,
}

impl<H: Handler + 'static> HandlerAdapter<H> {
    pub(crate) fn new(name: String, handler: HandlerRef<H>) -> Self {
        Self { name, handler }
    }

    fn handler(&self) -> Option<Rc<H>> {
        let handler = match &self.handler {
            HandlerRef::Strong(handler) => Some(Rc::clone(handler)),
            HandlerRef::Weak(handler) => handler.upgrade(),
        };
        if handler.is_none() {
            warn!("{} handler was dropped while still in pipeline", self.name);
        }
        handler
    }

    fn context<'a>(
        &self,
        ctx: &'a dyn ContextInternal,
    ) -> &'a Context<H::Rin, H::Rout, H::Win, H::Wout> {
        if let Some(ctx) = ctx
            .as_any()
            .downcast_ref::<Context<H::Rin, H::Rout, H::Win, H::Wout>>()
        {
            ctx
        } else {
            panic!(
                "ctx can't downcast_ref::<Context<Rin, Rout, Win, Wout>> in {} handler",
                ctx.name()
            );
        }
    }

    fn dropped(&self) -> WriteFuture {
        write_error(
            ErrorKind::NotConnected,
            format!("{} handler was dropped while still in pipeline", self.name),
        )
    }
}

impl<H: Handler + 'static> HandlerInternal for HandlerAdapter<H> {
    fn transport_active_internal(&self, ctx: &dyn ContextInternal) {
        let ctx = self.context(ctx);
        if let Some(handler) = self.handler() {
            handler.transport_active(ctx);
        }
    }
    fn transport_inactive_internal(&self, ctx: &dyn ContextInternal) {
        let ctx = self.context(ctx);
        if let Some(handler) = self.handler() {
            handler.transport_inactive(ctx);
        }
    }

    fn handle_read_internal(&self, ctx: &dyn ContextInternal, msg: Box<dyn Any>) {
        let ctx = self.context(ctx);
        if let Ok(msg) = msg.downcast::<H::Rin>() {
            if let Some(handler) = self.handler() {
                handler.handle_read(ctx, *msg);
            }
        } else {
            panic!("msg can't downcast::<Rin> in {} handler", ctx.name());
        }
    }
    fn handle_read_eof_internal(&self, ctx: &dyn ContextInternal) {
        let ctx = self.context(ctx);
        if let Some(handler) = self.handler() {
            handler.handle_read_eof(ctx);
        }
    }
    fn handle_read_exception_internal(&self, ctx: &dyn ContextInternal, err: Box<dyn Error>) {
        let ctx = self.context(ctx);
        if let Some(handler) = self.handler() {
            handler.handle_read_exception(ctx, err);
        }
    }

    fn handle_write_internal(&self, ctx: &dyn ContextInternal, msg: Box<dyn Any>) -> WriteFuture {
        let ctx = self.context(ctx);
        if let Ok(msg) = msg.downcast::<H::Win>() {
            match self.handler() {
                Some(handler) => handler.handle_write(ctx, *msg),
                None => self.dropped(),
            }
        } else {
            panic!("msg can't downcast::<Win> in {} handler", ctx.name());
        }
    }
    fn handle_close_internal(&self, ctx: &dyn ContextInternal) -> WriteFuture {
        let ctx = self.context(ctx);
        match self.handler() {
            Some(handler) => handler.handle_close(ctx),
            None => self.dropped(),
        }
    }

    fn attach_pipeline_internal(&self, ctx: &dyn ContextInternal) {
        let ctx = self.context(ctx);
        if let Some(handler) = self.handler() {
            trace!("attaching {} handler", ctx.name());
            handler.attach_pipeline(ctx);
        }
    }
    fn detach_pipeline_internal(&self, ctx: &dyn ContextInternal) {
        let ctx = self.context(ctx);
        if let Some(handler) = self.handler() {
            trace!("detaching {} handler", ctx.name());
            handler.detach_pipeline(ctx);
        }
    }
}
