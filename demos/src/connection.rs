//! One accepted connection under a [`ConnectionManager`].

use bytes::{Bytes, BytesMut};
use log::{debug, info};
use std::{
    cell::Cell,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};
use tether::{
    ConnectionLink, ConnectionManager, InboundPipeline, ManagedConnection, OutboundPipeline,
    Pipeline, PipelineBase, PipelineFactory,
};

use crate::handlers::{SocketHandler, TcpTransport};

/// Couples an echo pipeline with the lifecycle hooks the manager drives.
///
/// The connection is busy while a read is being processed or a write is
/// queued on the socket.
pub struct EchoConnection {
    link: ConnectionLink,
    peer_addr: SocketAddr,
    pipeline: Rc<Pipeline<BytesMut, Bytes>>,
    socket: Rc<SocketHandler>,
    processing: Cell<bool>,
    last_activity: Cell<Instant>,
    shutdown_notified: Cell<bool>,
    close_pending: Cell<bool>,
    closed: Cell<bool>,
}

impl EchoConnection {
    pub fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        factory: &dyn PipelineFactory<BytesMut, Bytes>,
    ) -> std::io::Result<Rc<Self>> {
        let pipeline = factory.new_pipeline(Rc::new(TcpTransport {
            local_addr,
            peer_addr,
        }));
        let socket = pipeline.get_handler::<SocketHandler>(0)?;
        Ok(Rc::new(Self {
            link: ConnectionLink::new(),
            peer_addr,
            pipeline,
            socket,
            processing: Cell::new(false),
            last_activity: Cell::new(Instant::now()),
            shutdown_notified: Cell::new(false),
            close_pending: Cell::new(false),
            closed: Cell::new(false),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn pipeline(&self) -> &Rc<Pipeline<BytesMut, Bytes>> {
        &self.pipeline
    }

    pub fn socket(&self) -> &Rc<SocketHandler> {
        &self.socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Pushes bytes read from the socket through the pipeline.
    pub fn on_read(self: &Rc<Self>, bytes: BytesMut) {
        let manager = self.connection_manager();
        if let Some(manager) = &manager {
            manager.on_activated(self.as_ref());
        }

        self.processing.set(true);
        self.pipeline.read(bytes);
        self.processing.set(false);
        self.last_activity.set(Instant::now());

        if let Some(manager) = &manager {
            let conn: Rc<dyn ManagedConnection> = self.clone();
            manager.reset_timeout(&conn);
        }
        self.maybe_idle();
    }

    /// The socket task finished one queued write.
    pub fn on_write_done(&self) {
        self.socket.complete_write();
        self.last_activity.set(Instant::now());
        self.maybe_idle();
    }

    fn maybe_idle(&self) {
        if self.is_busy() {
            return;
        }
        if let Some(manager) = self.connection_manager() {
            manager.on_deactivated(self);
        }
        if self.close_pending.get() {
            self.close();
        }
    }

    /// Leaves the manager and asks the socket task to shut down.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        debug!("closing connection to {}", self.peer_addr);
        if let Some(manager) = self.connection_manager() {
            manager.remove_connection(self);
        }
        let _ = self.pipeline.close();
    }
}

impl ManagedConnection for EchoConnection {
    fn link(&self) -> &ConnectionLink {
        &self.link
    }

    fn is_busy(&self) -> bool {
        self.processing.get() || self.socket.pending_writes() > 0
    }

    fn idle_time(&self) -> Duration {
        if self.is_busy() {
            Duration::ZERO
        } else {
            self.last_activity.get().elapsed()
        }
    }

    fn notify_pending_shutdown(&self) {
        // the echo protocol has no goaway frame
        self.shutdown_notified.set(true);
    }

    fn close_when_idle(&self) {
        if self.is_busy() {
            self.close_pending.set(true);
        } else {
            self.close();
        }
    }

    fn drop_connection(&self) {
        self.close();
    }

    fn timeout_expired(&self) {
        info!("{} idle for {:?}, closing", self.peer_addr, self.idle_time());
        self.close();
    }

    fn dump_connection_state(&self, verbosity: u8) {
        info!(
            "connection {}: busy={} pending_writes={} idle={:?}",
            self.peer_addr,
            self.is_busy(),
            self.socket.pending_writes(),
            self.idle_time()
        );
        if verbosity > 1 {
            info!(
                "connection {}: handlers={:?} shutdown_notified={} close_pending={}",
                self.peer_addr,
                self.pipeline.names(),
                self.shutdown_notified.get(),
                self.close_pending.get()
            );
        }
    }
}

/// Hands `conn` to `manager` with its idle timeout armed.
pub fn register(manager: &ConnectionManager, conn: &Rc<EchoConnection>) {
    let conn: Rc<dyn ManagedConnection> = conn.clone();
    manager.add_connection(&conn, true);
}
