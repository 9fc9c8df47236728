//! Server construction: certificate configuration (static chain or SNI
//! resolver), the listening socket, and connection accept.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;

use crate::client::{provider, BuildError, Core};
use crate::engine::Engine;
use crate::error::ConnectionError;
use crate::handle::ConnHandle;
use crate::settings::Settings;
use crate::socket::SocketIo;

/// Construct a server using sane defaults.
pub(crate) struct ServerBuilder {
    http: bool,
    bind: SocketAddr,
    alpn: Vec<Vec<u8>>,
    settings: Settings,
    backlog: usize,
}

impl ServerBuilder {
    pub fn new(http: bool) -> Self {
        Self {
            http,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            alpn: Vec::new(),
            settings: Settings::server(),
            backlog: 16,
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

    /// The incoming-connection queue capacity armed by `listen`.
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    /// Serve a single certificate chain.
    pub fn with_single_cert(
        self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Server, BuildError> {
        let crypto = self
            .crypto_builder()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        self.build(crypto)
    }

    /// Select certificates by SNI at handshake time.
    pub fn with_cert_resolver(
        self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Server, BuildError> {
        let crypto = self
            .crypto_builder()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        self.build(crypto)
    }

    fn crypto_builder(
        &self,
    ) -> Result<rustls::ConfigBuilder<rustls::ServerConfig, rustls::WantsVerifier>, BuildError> {
        Ok(rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(rustls::Error::from)?)
    }

    fn build(self, mut crypto: rustls::ServerConfig) -> Result<Server, BuildError> {
        crypto.alpn_protocols = self.alpn;

        let crypto = quinn_proto::crypto::rustls::QuicServerConfig::try_from(crypto)?;
        let mut config = quinn_proto::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(self.settings.transport_config());
        let config = Arc::new(config);

        let engine = Engine::new(self.http, self.settings, Some(config.clone()));
        let io = Arc::new(SocketIo::bind(0, self.bind)?);
        let core = Core::start(engine, io, Some(config));

        let server = Server {
            core,
            backlog: self.backlog,
        };
        server.listen(server.backlog);
        Ok(server)
    }
}

/// A listening endpoint: accepts handshake-complete connections.
pub(crate) struct Server {
    core: Core,
    backlog: usize,
}

impl Server {
    /// Re-arm the incoming queue with a new capacity. Connections beyond
    /// it are refused until someone accepts.
    pub fn listen(&self, backlog: usize) {
        self.core.engine.listen(self.core.socket, backlog);
    }

    /// Accept an incoming connection whose handshake has completed.
    pub fn accept(&self) -> AcceptConn<'_> {
        AcceptConn {
            core: &self.core,
            token: self.core.engine.token(),
            registered: false,
            done: false,
        }
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.core.local_endpoint()
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

/// Future for an inbound connection.
pub(crate) struct AcceptConn<'a> {
    core: &'a Core,
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for AcceptConn<'_> {
    type Output = Result<Arc<ConnHandle>, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = futures::ready!(this.core.engine.poll_accept_conn(
            cx,
            this.core.socket,
            this.token,
            &mut this.registered,
        ));
        this.done = true;
        Poll::Ready(result.map(|key| {
            Arc::new(ConnHandle {
                engine: this.core.engine.clone(),
                key,
            })
        }))
    }
}

impl Drop for AcceptConn<'_> {
    fn drop(&mut self) {
        if self.registered && !self.done {
            self.core
                .engine
                .cancel_accept_conn(self.core.socket, self.token);
        }
    }
}
