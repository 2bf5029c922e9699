use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use log::info;
use std::{io::Write, str::FromStr};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use tether_codec::{LengthFieldBasedFrameDecoder, LengthFieldPrepender};
use tether_executor::LocalExecutorBuilder;

#[derive(Parser)]
#[command(name = "Echo Client TCP")]
#[command(version = "0.1.0")]
#[command(about = "Sends stdin lines as length-prefixed frames and prints the echoes", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(long, default_value_t = 4)]
    length_field_length: usize,
}

async fn run(host: String, port: u16, length_field_length: usize) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(format!("{host}:{port}")).await?;
    let prepender = LengthFieldPrepender::new(length_field_length)?;
    let decoder = LengthFieldBasedFrameDecoder::new(length_field_length, 64 * 1024)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inbound = BytesMut::new();
    let mut buf = vec![0u8; 2048];
    while let Some(line) = lines.next_line().await? {
        let frame = prepender.encode(Bytes::from(line))?;
        stream.write_all(&frame).await?;

        let echo = loop {
            if let Some(echo) = decoder.decode(&mut inbound)? {
                break echo;
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                info!("server closed the connection");
                return Ok(());
            }
            inbound.put_slice(&buf[..n]);
        };
        println!("{}", String::from_utf8_lossy(&echo));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
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

    LocalExecutorBuilder::default().run(run(cli.host, cli.port, cli.length_field_length))?
}
