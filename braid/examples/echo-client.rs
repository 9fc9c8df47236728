use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

// Echo client: reads stdin line by line, writes each line to its own
// stream, and prints the echoes. With a server capped at max-streams=1
// the echoes come back in order; otherwise they interleave.

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:4433")]
    addr: SocketAddr,

    /// The server name presented for TLS verification.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Skip root CA verification and trust this PEM certificate instead.
    #[arg(long)]
    tls_cert: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut builder = braid::quic::Client::builder().with_alpn(&["echo"]);
    if let Some(path) = args.tls_cert {
        let file = std::fs::File::open(path).context("failed to open cert file")?;
        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to load certs")?;
        builder = builder.with_server_certificates(certs)?;
    }
    let client = builder.build()?;

    let conn = client.connect(args.addr, &args.server_name)?;
    tracing::info!(addr = %args.addr, "connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = Vec::new();

    while let Some(line) = lines.next_line().await? {
        let stream = conn.open_stream().await?;
        tasks.push(tokio::spawn(async move {
            let result = echo_line(&stream, line.as_bytes()).await;
            match result {
                Ok(echoed) => println!("{}", String::from_utf8_lossy(&echoed)),
                Err(err) => tracing::warn!(%err, "echo failed"),
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    conn.close();
    client.close().await;
    Ok(())
}

async fn echo_line(
    stream: &braid::quic::Stream,
    line: &[u8],
) -> Result<Vec<u8>, braid::StreamError> {
    stream.write_all(line).await?;
    stream.shutdown(braid::quic::Shutdown::Write)?;

    let mut echoed = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match stream.read_some(&mut buf).await {
            Ok(n) => echoed.extend_from_slice(&buf[..n]),
            Err(braid::StreamError::Eof) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(echoed)
}
