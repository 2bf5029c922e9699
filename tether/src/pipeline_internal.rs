use std::any::{type_name, Any, TypeId};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use crate::handler::{Context, Handler, HandlerAdapter, HandlerRef, Unit};
use crate::handler_internal::{ContextInternal, HandlerInternal, Link};
use crate::pipeline::PipelineState;

/// How a pipeline holds on to one of its handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOwnership {
    /// The pipeline owns the handler exclusively.
    Owned,
    /// The pipeline holds one of several strong references.
    Shared,
    /// The pipeline holds a weak reference; the caller keeps the handler alive.
    Borrowed,
}

#[derive(Clone, Copy)]
struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    fn is_unit(&self) -> bool {
        self.id == TypeId::of::<Unit>()
    }
}

enum AnyHandler {
    Strong(Rc<dyn Any>),
    Weak(Weak<dyn Any>),
}

impl AnyHandler {
    fn upgrade(&self) -> Option<Rc<dyn Any>> {
        match self {
            AnyHandler::Strong(handler) => Some(Rc::clone(handler)),
            AnyHandler::Weak(handler) => handler.upgrade(),
        }
    }

    fn addr(&self) -> *const () {
        match self {
            AnyHandler::Strong(handler) => Rc::as_ptr(handler) as *const (),
            AnyHandler::Weak(handler) => handler.as_ptr() as *const (),
        }
    }
}

/// One handler together with its context.
pub(crate) struct HandlerNode {
    name: String,
    kind: TypeId,
    ownership: HandlerOwnership,
    any: AnyHandler,
    pub(crate) handler: Rc<dyn HandlerInternal>,
    pub(crate) context: Rc<dyn ContextInternal>,
    rin: MessageType,
    rout: MessageType,
    win: MessageType,
    wout: MessageType,
}

impl HandlerNode {
    pub(crate) fn new<H: Handler + 'static>(
        handler: HandlerRef<H>,
        ownership: HandlerOwnership,
        state: &Rc<PipelineState>,
    ) -> Option<Self> {
        let (name, any) = match &handler {
            HandlerRef::Strong(h) => (h.name().to_owned(), AnyHandler::Strong(h.clone() as Rc<dyn Any>)),
            HandlerRef::Weak(w) => {
                let h = w.upgrade()?;
                (h.name().to_owned(), AnyHandler::Weak(w.clone() as Weak<dyn Any>))
            }
        };
        let context: Context<H::Rin, H::Rout, H::Win, H::Wout> = Context::new(&name, Rc::clone(state));

        Some(Self {
            handler: Rc::new(HandlerAdapter::new(name.clone(), handler)),
            context: Rc::new(context),
            name,
            kind: TypeId::of::<H>(),
            ownership,
            any,
            rin: MessageType::of::<H::Rin>(),
            rout: MessageType::of::<H::Rout>(),
            win: MessageType::of::<H::Win>(),
            wout: MessageType::of::<H::Wout>(),
        })
    }

    pub(crate) fn is_inbound(&self) -> bool {
        !self.rin.is_unit()
    }

    pub(crate) fn is_outbound(&self) -> bool {
        !self.win.is_unit()
    }

    pub(crate) fn detach(&self) {
        self.handler.detach_pipeline_internal(&*self.context);
    }

    fn link(&self) -> Link {
        Link::new(&self.handler, &self.context)
    }

    fn entry(&self) -> Entry {
        (Rc::clone(&self.handler), Rc::clone(&self.context))
    }
}

pub(crate) type Entry = (Rc<dyn HandlerInternal>, Rc<dyn ContextInternal>);

/// Handler storage and the two dispatch arrays derived from it.
///
/// # Architecture
///
/// ```text
/// nodes:    [ A (in/out) ][ B (out only) ][ C (in/out) ]
///
/// inbound:  A ──next_in──→ C                (front to back)
/// outbound: A ←─next_out── B ←─next_out── C  (back to front)
/// ```
///
/// Links between contexts are weak; only `nodes` and the dispatch arrays hold
/// strong references. A dispatch upgrades the link it follows, so a handler
/// removed while it is running stays alive until it returns.
///
/// Every structural mutation is followed by [`rebuild`](PipelineInternal::rebuild),
/// so the dispatch arrays and links never describe a stale chain.
pub(crate) struct PipelineInternal<R, W> {
    pub(crate) nodes: Vec<HandlerNode>,
    in_ctxs: Vec<Entry>,
    out_ctxs: Vec<Entry>,
    owner: Option<*const ()>,
    phantom: PhantomData<(R, W)>,
}

impl<R, W> PipelineInternal<R, W> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![],
            in_ctxs: vec![],
            out_ctxs: vec![],
            owner: None,
            phantom: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name.clone()).collect()
    }

    pub(crate) fn insert(&mut self, index: usize, node: HandlerNode) {
        self.nodes.insert(index, node);
        self.rebuild();
    }

    pub(crate) fn front(&self) -> Option<Entry> {
        self.in_ctxs.first().cloned()
    }

    pub(crate) fn back(&self) -> Option<Entry> {
        self.out_ctxs.last().cloned()
    }

    /// Removes every node matching `pred` and returns them for detaching.
    pub(crate) fn remove_where(
        &mut self,
        pred: impl Fn(&HandlerNode) -> bool,
        what: &str,
    ) -> Result<Vec<HandlerNode>, std::io::Error> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.nodes).into_iter().partition(|node| pred(node));
        self.nodes = kept;

        if removed.is_empty() {
            Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("No such handler {} in pipeline", what),
            ))
        } else {
            for node in &removed {
                if self.owner == Some(node.any.addr()) {
                    self.owner = None;
                }
            }
            self.rebuild();
            Ok(removed)
        }
    }

    /// Removes the first node matching `pred`.
    pub(crate) fn remove_first(
        &mut self,
        pred: impl Fn(&HandlerNode) -> bool,
        what: &str,
    ) -> Result<HandlerNode, std::io::Error> {
        match self.nodes.iter().position(pred) {
            Some(index) => self.remove_at(index),
            None => Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("No such handler {} in pipeline", what),
            )),
        }
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Result<HandlerNode, std::io::Error> {
        if index >= self.nodes.len() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                "No handlers in pipeline",
            ));
        }
        let node = self.nodes.remove(index);
        if self.owner == Some(node.any.addr()) {
            self.owner = None;
        }
        self.rebuild();
        Ok(node)
    }

    pub(crate) fn remove_identity(&mut self, addr: *const ()) -> Result<HandlerNode, std::io::Error> {
        self.remove_first(|node| node.any.addr() == addr, "instance")
    }

    pub(crate) fn remove_kind(&mut self, kind: TypeId, kind_name: &str) -> Result<HandlerNode, std::io::Error> {
        self.remove_first(|node| node.kind == kind, kind_name)
    }

    pub(crate) fn remove_named(&mut self, handler_name: &str) -> Result<Vec<HandlerNode>, std::io::Error> {
        self.remove_where(
            |node| node.name == handler_name,
            &format!("\"{}\"", handler_name),
        )
    }

    pub(crate) fn get_handler<H: 'static>(&self, index: usize) -> Result<Rc<H>, std::io::Error> {
        let node = self.nodes.get(index).ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::NotFound,
                format!("No handler at index {} in pipeline", index),
            )
        })?;
        node.any
            .upgrade()
            .and_then(|handler| handler.downcast::<H>().ok())
            .ok_or_else(|| {
                std::io::Error::new(
                    ErrorKind::NotFound,
                    format!(
                        "Handler at index {} is not a live {}",
                        index,
                        type_name::<H>()
                    ),
                )
            })
    }

    pub(crate) fn ownership(&self, index: usize) -> Option<HandlerOwnership> {
        self.nodes.get(index).map(|node| node.ownership)
    }

    pub(crate) fn set_owner(&mut self, addr: *const ()) -> bool {
        if self.nodes.iter().any(|node| node.any.addr() == addr) {
            self.owner = Some(addr);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_owner(&self, node: &HandlerNode) -> bool {
        self.owner == Some(node.any.addr())
    }

    /// Recomputes both dispatch arrays and relinks every context.
    pub(crate) fn rebuild(&mut self) {
        for node in &self.nodes {
            node.context.set_next_in(None);
            node.context.set_next_out(None);
        }

        let inbound: Vec<&HandlerNode> = self.nodes.iter().filter(|n| n.is_inbound()).collect();
        for pair in inbound.windows(2) {
            pair[0].context.set_next_in(Some(pair[1].link()));
        }

        let outbound: Vec<&HandlerNode> = self.nodes.iter().filter(|n| n.is_outbound()).collect();
        for pair in outbound.windows(2) {
            pair[1].context.set_next_out(Some(pair[0].link()));
        }

        self.in_ctxs = inbound.iter().map(|node| node.entry()).collect();
        self.out_ctxs = outbound.iter().map(|node| node.entry()).collect();
    }

    /// Unlinks and hands out every node, leaving the pipeline empty.
    pub(crate) fn take_nodes(&mut self) -> Vec<HandlerNode> {
        for node in &self.nodes {
            node.context.set_next_in(None);
            node.context.set_next_out(None);
        }
        self.in_ctxs.clear();
        self.out_ctxs.clear();
        std::mem::take(&mut self.nodes)
    }
}

impl<R: 'static, W: 'static> PipelineInternal<R, W> {
    /// Rebuilds and checks that message types line up along both directions.
    pub(crate) fn finalize(&mut self) -> Result<(), std::io::Error> {
        self.rebuild();

        let read = MessageType::of::<R>();
        let write = MessageType::of::<W>();

        let inbound: Vec<&HandlerNode> = self.nodes.iter().filter(|n| n.is_inbound()).collect();
        if !read.is_unit() {
            let Some(first) = inbound.first() else {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "No inbound handler in pipeline",
                ));
            };
            check_types(read, first.rin, "pipeline", &first.name)?;
        }
        for pair in inbound.windows(2) {
            check_types(pair[0].rout, pair[1].rin, &pair[0].name, &pair[1].name)?;
        }

        let outbound: Vec<&HandlerNode> = self.nodes.iter().filter(|n| n.is_outbound()).collect();
        if !write.is_unit() {
            let Some(last) = outbound.last() else {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "No outbound handler in pipeline",
                ));
            };
            check_types(write, last.win, "pipeline", &last.name)?;
        }
        for pair in outbound.windows(2) {
            check_types(pair[1].wout, pair[0].win, &pair[1].name, &pair[0].name)?;
        }

        Ok(())
    }
}

fn check_types(
    produced: MessageType,
    expected: MessageType,
    from: &str,
    to: &str,
) -> Result<(), std::io::Error> {
    if produced.id == expected.id {
        Ok(())
    } else {
        Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "{} produces {} but {} handler expects {}",
                from, produced.name, to, expected.name
            ),
        ))
    }
}
