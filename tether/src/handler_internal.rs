use crate::handler::WriteFuture;
use std::any::Any;
use std::error::Error;
use std::rc::{Rc, Weak};

#[doc(hidden)]
pub trait HandlerInternal {
    fn transport_active_internal(&self, ctx: &dyn ContextInternal);
    fn transport_inactive_internal(&self, ctx: &dyn ContextInternal);

    fn handle_read_internal(&self, ctx: &dyn ContextInternal, msg: Box<dyn Any>);
    fn handle_read_eof_internal(&self, ctx: &dyn ContextInternal);
    fn handle_read_exception_internal(&self, ctx: &dyn ContextInternal, err: Box<dyn Error>);

    fn handle_write_internal(&self, ctx: &dyn ContextInternal, msg: Box<dyn Any>) -> WriteFuture;
    fn handle_close_internal(&self, ctx: &dyn ContextInternal) -> WriteFuture;

    fn attach_pipeline_internal(&self, ctx: &dyn ContextInternal);
    fn detach_pipeline_internal(&self, ctx: &dyn ContextInternal);
}

#[doc(hidden)]
pub trait ContextInternal {
    fn name(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
    fn set_next_in(&self, next: Option<Link>);
    fn set_next_out(&self, next: Option<Link>);
}

/// Non-owning edge from one context to the next one in a direction.
#[doc(hidden)]
#[derive(Clone)]
pub struct Link {
    handler: Weak<dyn HandlerInternal>,
    context: Weak<dyn ContextInternal>,
}

impl Link {
    pub(crate) fn new(handler: &Rc<dyn HandlerInternal>, context: &Rc<dyn ContextInternal>) -> Self {
        Self {
            handler: Rc::downgrade(handler),
            context: Rc::downgrade(context),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<(Rc<dyn HandlerInternal>, Rc<dyn ContextInternal>)> {
        Some((self.handler.upgrade()?, self.context.upgrade()?))
    }
}
