//! Pipeline stages of the echo server.
//!
//! ```text
//!   socket ──BytesMut──> SocketHandler ─> LengthFieldBasedFrameDecoder ─> EchoHandler
//!   socket <──Bytes───── SocketHandler <─ LengthFieldPrepender <─────────┘
//! ```

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use log::{info, trace, warn};
use std::{
    cell::{Cell, RefCell},
    error::Error,
    io::ErrorKind,
    net::SocketAddr,
    rc::Rc,
};
use tether::{
    write_error, write_ok, Context, Handler, Pipeline, PipelineBase, PipelineFactory, Transport,
    WriteFlags, WriteFuture,
};
use tether_codec::{LengthFieldBasedFrameDecoder, LengthFieldPrepender};
use tether_executor::spawn_local;
use tokio::sync::{mpsc, oneshot};

/// Work handed from the pipeline to the task owning the socket.
pub enum Outgoing {
    /// Bytes to write, and where to report completion.
    Data(Bytes, oneshot::Sender<std::io::Result<()>>),
    /// Shut the socket down.
    Close,
}

/// Addresses of an accepted TCP connection.
pub struct TcpTransport {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

/// Front stage: passes socket reads on and queues writes for the socket task.
pub struct SocketHandler {
    tx: mpsc::UnboundedSender<Outgoing>,
    rx: RefCell<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    pending_writes: Cell<usize>,
}

impl Default for SocketHandler {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: RefCell::new(Some(rx)),
            pending_writes: Cell::new(0),
        }
    }
}

impl SocketHandler {
    /// Hands out the queue of outgoing work, once.
    pub fn take_outgoing(&self) -> Option<mpsc::UnboundedReceiver<Outgoing>> {
        self.rx.borrow_mut().take()
    }

    /// Writes queued but not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.pending_writes.get()
    }

    /// The socket task finished one write.
    pub fn complete_write(&self) {
        self.pending_writes.set(self.pending_writes.get().saturating_sub(1));
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

impl Handler for SocketHandler {
    type Rin = BytesMut;
    type Rout = BytesMut;
    type Win = Bytes;
    type Wout = Bytes;

    fn name(&self) -> &str {
        "SocketHandler"
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        trace!("socket read {} bytes", msg.len());
        ctx.fire_handle_read(msg);
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Outgoing::Data(msg, done_tx)).is_err() {
            return write_error(ErrorKind::NotConnected, "socket already closed");
        }
        self.pending_writes.set(self.pending_writes.get() + 1);
        if ctx.write_flags().contains(WriteFlags::WRITE_SHUTDOWN) {
            self.close();
        }

        async move {
            done_rx.await.unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    ErrorKind::NotConnected,
                    "socket closed before the write completed",
                ))
            })
        }
        .boxed_local()
    }

    fn handle_close(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) -> WriteFuture {
        self.close();
        write_ok()
    }
}

/// Back stage: writes every frame back to the peer.
#[derive(Default)]
pub struct EchoHandler {
    frames: Cell<u64>,
}

impl EchoHandler {
    fn peer(ctx: &Context<Bytes, Bytes, Bytes, Bytes>) -> String {
        ctx.transport()
            .and_then(|transport| transport.peer_addr().ok())
            .map_or_else(|| "unknown peer".to_string(), |addr| addr.to_string())
    }
}

impl Handler for EchoHandler {
    type Rin = Bytes;
    type Rout = Bytes;
    type Win = Bytes;
    type Wout = Bytes;

    fn name(&self) -> &str {
        "EchoHandler"
    }

    fn transport_active(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        info!("{} connected", Self::peer(ctx));
    }

    fn transport_inactive(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        info!("{} disconnected after {} frames", Self::peer(ctx), self.frames.get());
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        self.frames.set(self.frames.get() + 1);
        let peer = Self::peer(ctx);
        let write = ctx.fire_handle_write(msg);
        spawn_local(async move {
            if let Err(err) = write.await {
                warn!("echo to {} failed: {}", peer, err);
            }
        })
        .detach();
    }

    fn handle_read_eof(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        trace!("{} sent eof", Self::peer(ctx));
        let _ = ctx.fire_handle_close();
    }

    fn handle_read_exception(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        err: Box<dyn Error>,
    ) {
        warn!("closing {}: {}", Self::peer(ctx), err);
        let _ = ctx.fire_handle_close();
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        ctx.fire_handle_write(msg)
    }
}

/// Builds the echo pipeline for every accepted connection.
pub struct EchoPipelineFactory {
    length_field_length: usize,
    max_frame_length: usize,
}

impl EchoPipelineFactory {
    /// Fails if `length_field_length` is not a supported width.
    pub fn new(length_field_length: usize, max_frame_length: usize) -> std::io::Result<Self> {
        LengthFieldPrepender::new(length_field_length)?;
        Ok(Self {
            length_field_length,
            max_frame_length,
        })
    }

    fn build(&self, pipeline: &Pipeline<BytesMut, Bytes>) -> std::io::Result<()> {
        pipeline
            .add_back(SocketHandler::default())
            .add_back(LengthFieldBasedFrameDecoder::new(
                self.length_field_length,
                self.max_frame_length,
            )?)
            .add_back(LengthFieldPrepender::new(self.length_field_length)?)
            .add_back(EchoHandler::default());
        pipeline.finalize()
    }
}

impl PipelineFactory<BytesMut, Bytes> for EchoPipelineFactory {
    fn new_pipeline(&self, transport: Rc<dyn Transport>) -> Rc<Pipeline<BytesMut, Bytes>> {
        let pipeline: Pipeline<BytesMut, Bytes> = Pipeline::new();
        pipeline.set_transport(Some(transport));
        if let Err(err) = self.build(&pipeline) {
            warn!("echo pipeline is incomplete: {}", err);
        }
        Rc::new(pipeline)
    }
}
