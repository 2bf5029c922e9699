use clap::Parser;
use log::{error, info};
use std::{io::Write, str::FromStr, time::Duration};
use tokio::{net::TcpListener, sync::broadcast};

use tether_demos::server::{serve, ServerConfig};
use tether_executor::LocalExecutorBuilder;

#[derive(Parser)]
#[command(name = "Echo Server TCP")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed echo server with idle timeouts and graceful shutdown", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    /// Close connections idle for this long
    #[arg(long, default_value_t = 60_000)]
    idle_timeout_ms: u64,
    /// Grace period between announcing shutdown and closing idle connections
    #[arg(long, default_value_t = 5_000)]
    idle_grace_ms: u64,
    /// Width of the length prefix: 1, 2, 3, 4 or 8 bytes
    #[arg(long, default_value_t = 4)]
    length_field_length: usize,
    /// Evict idle connections beyond this many, 0 for no limit
    #[arg(long, default_value_t = 0)]
    max_connections: usize,
}

async fn run(stop_rx: broadcast::Receiver<()>, host: String, port: u16, config: ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    serve(listener, config, stop_rx).await
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let host = cli.host;
    let port = cli.port;
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    if cli.debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }

    let config = ServerConfig {
        idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
        idle_grace: Duration::from_millis(cli.idle_grace_ms),
        length_field_length: cli.length_field_length,
        max_connections: cli.max_connections,
        ..Default::default()
    };

    let (stop_tx, stop_rx) = broadcast::channel::<()>(1);

    info!("Press Ctrl-C to stop");
    let mut stop_tx = Some(stop_tx);
    ctrlc::set_handler(move || {
        if let Some(stop_tx) = stop_tx.take() {
            let _ = stop_tx.send(());
        }
    })?;

    LocalExecutorBuilder::default()
        .name("echo-server")
        .run(async move {
            if let Err(err) = run(stop_rx, host, port, config).await {
                error!("run got error: {}", err);
            }
        })?;

    Ok(())
}
