use std::{fs, io, path};

use anyhow::Context;
use clap::Parser;
use rustls::pki_types::CertificateDer;

// Echo server that accepts connections and their streams, writing back
// anything it reads on each stream.

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    addr: std::net::SocketAddr,

    /// Use the certificates at this path, encoded as PEM.
    #[arg(long)]
    tls_cert: path::PathBuf,

    /// Use the private key at this path, encoded as PEM.
    #[arg(long)]
    tls_key: path::PathBuf,

    /// Cap on concurrent streams per connection.
    #[arg(long)]
    max_streams: Option<u64>,
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

    let chain = fs::File::open(args.tls_cert).context("failed to open cert file")?;
    let mut chain = io::BufReader::new(chain);
    let chain: Vec<CertificateDer> = rustls_pemfile::certs(&mut chain)
        .collect::<Result<_, _>>()
        .context("failed to load certs")?;
    anyhow::ensure!(!chain.is_empty(), "could not find certificate");

    let keys = fs::File::open(args.tls_key).context("failed to open key file")?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(keys))
        .context("failed to load private key")?
        .context("missing private key")?;

    let mut settings = braid::Settings::server();
    if let Some(max) = args.max_streams {
        settings.max_streams_per_connection = max;
    }

    let server = braid::quic::Server::builder()
        .with_bind(args.addr)
        .with_alpn(&["echo"])
        .with_settings(settings)
        .with_single_cert(chain, key)?;

    tracing::info!(addr = %args.addr, "listening");

    loop {
        let conn = match server.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = run_connection(conn).await {
                tracing::info!(%err, "connection finished");
            }
        });
    }
}

async fn run_connection(conn: braid::quic::Connection) -> anyhow::Result<()> {
    tracing::info!(remote = %conn.remote_endpoint()?, "accepted connection");

    loop {
        let stream = conn.accept_stream().await?;
        tokio::spawn(async move {
            if let Err(err) = echo(stream).await {
                tracing::info!(%err, "stream finished");
            }
        });
    }
}

async fn echo(stream: braid::quic::Stream) -> anyhow::Result<()> {
    let mut buf = [0u8; 256];
    loop {
        let n = match stream.read_some(&mut buf).await {
            Ok(n) => n,
            Err(braid::StreamError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        stream.write_all(&buf[..n]).await?;
    }
    stream.close().await?;
    Ok(())
}
