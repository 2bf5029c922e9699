//! Accept loop of the echo server.

use bytes::BytesMut;
use log::{debug, error, info, trace, warn};
use std::{rc::Rc, time::Duration};
use tether::{
    ConnectionManager, ConnectionManagerCallback, InboundPipeline, LocalEventBase,
    ManagedConnection, PipelineBase,
};
use tether_executor::spawn_local;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, Notify},
};
use wg::AsyncWaitGroup;

use crate::{
    connection::{register, EchoConnection},
    event_loop::EventLoopDriver,
    handlers::{EchoPipelineFactory, Outgoing},
};

/// Tunables of the echo server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle connections are closed after this long.
    pub idle_timeout: Duration,
    /// Time between announcing a shutdown and closing idle connections.
    pub idle_grace: Duration,
    /// Time after the grace period before remaining connections are dropped.
    pub drain_timeout: Duration,
    /// Width of the length prefix in bytes.
    pub length_field_length: usize,
    /// Largest accepted frame, prefix included.
    pub max_frame_length: usize,
    /// Evict idle connections beyond this many; zero means unlimited.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            idle_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            length_field_length: 4,
            max_frame_length: 64 * 1024,
            max_connections: 0,
        }
    }
}

struct ServerCallback {
    empty: Rc<Notify>,
}

impl ConnectionManagerCallback for ServerCallback {
    fn on_connection_added(&self, manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {
        trace!("connection added, {} managed", manager.num_connections());
    }

    fn on_connection_removed(&self, manager: &ConnectionManager, _conn: &Rc<dyn ManagedConnection>) {
        trace!("connection removed, {} managed", manager.num_connections());
    }

    fn on_empty(&self, _manager: &ConnectionManager) {
        debug!("no connections left");
        self.empty.notify_one();
    }
}

async fn process_connection(
    stream: TcpStream,
    conn: Rc<EchoConnection>,
    driver: Rc<EventLoopDriver>,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut outgoing = conn
        .socket()
        .take_outgoing()
        .ok_or_else(|| anyhow::anyhow!("socket of {} already taken", conn.peer_addr()))?;

    let mut buf = vec![0; conn.pipeline().read_buffer_settings().allocation_size as usize];
    let mut read_open = true;

    conn.pipeline().transport_active();
    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                match msg {
                    Some(Outgoing::Data(bytes, done)) => {
                        let result = writer.write_all(&bytes).await;
                        let failed = result.is_err();
                        if let Err(err) = &result {
                            warn!("stream write error {}", err);
                        }
                        let _ = done.send(result);
                        conn.on_write_done();
                        driver.wake();
                        if failed {
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            res = reader.read(&mut buf), if read_open => {
                match res {
                    Ok(0) => {
                        read_open = false;
                        conn.pipeline().read_eof();
                    }
                    Ok(n) => {
                        trace!("stream read {} bytes", n);
                        conn.on_read(BytesMut::from(&buf[..n]));
                    }
                    Err(err) => {
                        read_open = false;
                        conn.pipeline().read_exception(Box::new(err));
                    }
                }
                driver.wake();
            }
        }
    }

    conn.pipeline().transport_inactive();
    conn.close();
    driver.wake();
    trace!("tcp connection to {} is down", conn.peer_addr());
    Ok(())
}

/// Serves echo connections from `listener` until `stop_rx` fires, then
/// drains the remaining connections gracefully.
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    mut stop_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let wait_group = AsyncWaitGroup::new();
    let factory = EchoPipelineFactory::new(config.length_field_length, config.max_frame_length)?;

    let driver = EventLoopDriver::new(Rc::new(LocalEventBase::new()));
    let empty = Rc::new(Notify::new());
    let manager = ConnectionManager::builder(driver.event_base().clone())
        .timeout(config.idle_timeout)
        .callback(Rc::new(ServerCallback {
            empty: Rc::clone(&empty),
        }))
        .build();

    let driver_task = {
        let driver = Rc::clone(&driver);
        spawn_local(async move { driver.run().await })
    };

    let local_addr = listener.local_addr()?;
    info!("echo server listening on {}", local_addr);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                trace!("listener exit loop");
                break;
            }
            res = listener.accept() => {
                let (stream, peer_addr) = match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("listener accept error {}", err);
                        continue;
                    }
                };

                if config.max_connections > 0 && manager.num_connections() >= config.max_connections {
                    let excess = manager.num_connections() + 1 - config.max_connections;
                    let dropped = manager.drop_idle_connections(excess);
                    debug!("at connection limit, evicted {} idle connections", dropped);
                    if manager.num_connections() >= config.max_connections {
                        warn!("rejecting {}: {} connections busy", peer_addr, manager.num_connections());
                        continue;
                    }
                }

                let conn = match EchoConnection::new(stream.local_addr()?, peer_addr, &factory) {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!("can't set up connection from {}: {}", peer_addr, err);
                        continue;
                    }
                };
                register(&manager, &conn);
                driver.wake();

                let worker = wait_group.add(1);
                let driver = Rc::clone(&driver);
                spawn_local(async move {
                    if let Err(err) = process_connection(stream, conn, driver).await {
                        error!("process_connection got error: {}", err);
                    }
                    worker.done();
                })
                .detach();
            }
        }
    }
    drop(listener);

    info!(
        "Wait for Gracefully Shutdown of {} connections...",
        manager.num_connections()
    );
    manager.initiate_graceful_shutdown(config.idle_grace);
    driver.wake();

    let deadline = tokio::time::Instant::now() + config.idle_grace + config.drain_timeout;
    while manager.num_connections() > 0 {
        tokio::select! {
            _ = empty.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {
                warn!("drain timed out, dropping {} connections", manager.num_connections());
                manager.drop_all_connections();
            }
        }
    }
    wait_group.wait().await;

    driver.stop();
    let _ = driver_task.await;
    info!("Server is Gracefully Shutdown Completed");

    Ok(())
}
