//! Client construction: TLS configuration, socket binding, and the
//! engine tasks behind a connecting endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use thiserror::Error;

use crate::conn::ConnKey;
use crate::engine::{spawn_driver, Engine};
use crate::error::ConnectionError;
use crate::handle::ConnHandle;
use crate::settings::Settings;
use crate::socket::{run_socket, SocketIo};

/// An error constructing a client or server.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("tls configuration unusable for QUIC: {0}")]
    Crypto(#[from] quinn_proto::crypto::rustls::NoInitialCipherSuite),
}

pub(crate) fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    #[cfg(feature = "aws-lc-rs")]
    return Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    #[cfg(all(feature = "ring", not(feature = "aws-lc-rs")))]
    return Arc::new(rustls::crypto::ring::default_provider());

    #[cfg(not(any(feature = "aws-lc-rs", feature = "ring")))]
    compile_error!("enable the aws-lc-rs or ring feature");
}

/// The engine, its socket, and the tasks driving them. Dropping aborts
/// the tasks.
pub(crate) struct Core {
    pub engine: Arc<Engine>,
    pub socket: usize,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Core {
    pub fn start(
        engine: Arc<Engine>,
        io: Arc<SocketIo>,
        server_config: Option<Arc<quinn_proto::ServerConfig>>,
    ) -> Self {
        let socket = engine.add_socket(io.clone(), server_config);
        let tasks = vec![
            spawn_driver(engine.clone()),
            tokio::spawn(run_socket(engine.clone(), io)),
        ];
        Self {
            engine,
            socket,
            tasks,
        }
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.engine.local_endpoint(self.socket)
    }

    /// Close the socket and engine. The cooldown pass lets queued
    /// CONNECTION_CLOSE frames reach the wire before the tasks stop.
    pub async fn close(&self) {
        self.engine.close_socket(self.socket);
        self.engine.shutdown();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        self.engine.stop();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // Fail everything first so operations parked on dead tasks still
        // complete with `engine stopped`.
        self.engine.shutdown();
        self.engine.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Construct a client using sane defaults.
pub(crate) struct ClientBuilder {
    http: bool,
    bind: SocketAddr,
    alpn: Vec<Vec<u8>>,
    settings: Settings,
    roots: RootCertStore,
}

impl ClientBuilder {
    pub fn new(http: bool) -> Self {
        Self {
            http,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            alpn: Vec::new(),
            settings: Settings::client(),
            roots: RootCertStore::empty(),
        }
    }

    pub fn with_bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    pub fn with_alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Trust the given root certificates.
    pub fn with_root_certificates(mut self, roots: RootCertStore) -> Self {
        self.roots = roots;
        self
    }

    /// Trust specific (typically self-signed) server certificates instead
    /// of a root store.
    pub fn with_server_certificates(
        mut self,
        certs: Vec<CertificateDer<'static>>,
    ) -> Result<Self, BuildError> {
        for cert in certs {
            self.roots.add(cert).map_err(rustls::Error::from)?;
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Client, BuildError> {
        let mut crypto = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(rustls::Error::from)?
            .with_root_certificates(self.roots)
            .with_no_client_auth();
        crypto.alpn_protocols = self.alpn;

        let crypto = quinn_proto::crypto::rustls::QuicClientConfig::try_from(crypto)?;
        let mut config = quinn_proto::ClientConfig::new(Arc::new(crypto));
        config.transport_config(self.settings.transport_config());

        let engine = Engine::new(self.http, self.settings, None);
        let io = Arc::new(SocketIo::bind(0, self.bind)?);
        let core = Core::start(engine, io, None);

        Ok(Client { core, config })
    }
}

/// A connecting endpoint: one UDP socket, many connections.
pub(crate) struct Client {
    core: Core,
    config: quinn_proto::ClientConfig,
}

impl Client {
    /// Start a connection to the given endpoint. The handshake begins
    /// here but the connection is usable immediately; handshake failures
    /// surface on the first operation that needs the connection.
    pub fn connect(
        &self,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<Arc<ConnHandle>, ConnectionError> {
        let key: ConnKey =
            self.core
                .engine
                .connect(self.core.socket, self.config.clone(), remote, server_name)?;
        Ok(Arc::new(ConnHandle {
            engine: self.core.engine.clone(),
            key,
        }))
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.core.local_endpoint()
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}
