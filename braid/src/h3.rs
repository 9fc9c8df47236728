//! HTTP/3 header + body streams.
//!
//! Connections exchange SETTINGS on control streams at handshake
//! completion; request streams carry a header section, then body bytes,
//! each direction independently. Header compression is QPACK with the
//! static table only.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::RootCertStore;

use crate::client::{self, BuildError};
use crate::error::{ConnectionError, StreamError};
use crate::handle::{ConnHandle, StreamHandle};
use crate::server;
use crate::settings::Settings;

pub use crate::handle::Shutdown;
pub use braid_proto::{Field, Fields};
pub use http::{Method, StatusCode};

/// Construct an HTTP/3 [Client].
pub struct ClientBuilder(client::ClientBuilder);

impl ClientBuilder {
    pub fn new() -> Self {
        Self(client::ClientBuilder::new(true).with_alpn(&["h3"]))
    }

    pub fn with_bind(self, addr: SocketAddr) -> Self {
        Self(self.0.with_bind(addr))
    }

    /// Replace the default `h3` ALPN offer.
    pub fn with_alpn(self, protocols: &[&str]) -> Self {
        Self(self.0.with_alpn(protocols))
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        Self(self.0.with_settings(settings))
    }

    pub fn with_root_certificates(self, roots: RootCertStore) -> Self {
        Self(self.0.with_root_certificates(roots))
    }

    pub fn with_server_certificates(
        self,
        certs: Vec<CertificateDer<'static>>,
    ) -> Result<Self, BuildError> {
        Ok(Self(self.0.with_server_certificates(certs)?))
    }

    pub fn build(self) -> Result<Client, BuildError> {
        Ok(Client(self.0.build()?))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An HTTP/3 client.
pub struct Client(client::Client);

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Open a connection. The TLS handshake and the SETTINGS exchange
    /// proceed in the background.
    pub fn connect(
        &self,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<Connection, ConnectionError> {
        Ok(Connection(self.0.connect(remote, server_name)?))
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.0.local_endpoint()
    }

    pub async fn close(&self) {
        self.0.close().await;
    }
}

/// Construct an HTTP/3 [Server].
pub struct ServerBuilder(server::ServerBuilder);

impl ServerBuilder {
    pub fn new() -> Self {
        Self(server::ServerBuilder::new(true).with_alpn(&["h3"]))
    }

    pub fn with_bind(self, addr: SocketAddr) -> Self {
        Self(self.0.with_bind(addr))
    }

    pub fn with_alpn(self, protocols: &[&str]) -> Self {
        Self(self.0.with_alpn(protocols))
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        Self(self.0.with_settings(settings))
    }

    pub fn with_backlog(self, backlog: usize) -> Self {
        Self(self.0.with_backlog(backlog))
    }

    pub fn with_single_cert(
        self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Server, BuildError> {
        Ok(Server(self.0.with_single_cert(chain, key)?))
    }

    pub fn with_cert_resolver(
        self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Server, BuildError> {
        Ok(Server(self.0.with_cert_resolver(resolver)?))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An HTTP/3 server.
pub struct Server(server::Server);

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn listen(&self, backlog: usize) {
        self.0.listen(backlog);
    }

    /// Accept an incoming connection whose handshake has completed.
    pub async fn accept(&self) -> Result<Connection, ConnectionError> {
        Ok(Connection(self.0.accept().await?))
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.0.local_endpoint()
    }

    pub async fn close(&self) {
        self.0.close().await;
    }
}

/// An HTTP/3 connection.
#[derive(Clone)]
pub struct Connection(pub(crate) Arc<ConnHandle>);

impl Connection {
    /// Open a request stream.
    pub async fn open_stream(&self) -> Result<Stream, StreamError> {
        Ok(Stream(Arc::new(self.0.open_stream().await?)))
    }

    /// Accept a peer-initiated request stream.
    pub async fn accept_stream(&self) -> Result<Stream, StreamError> {
        Ok(Stream(Arc::new(self.0.accept_stream().await?)))
    }

    /// Send GOAWAY: new locally-initiated streams fail with `going_away`,
    /// and the peer learns which requests will not be processed.
    pub fn go_away(&self) -> Result<(), ConnectionError> {
        self.0.go_away()
    }

    pub fn close(&self) {
        self.0.close();
    }

    pub fn remote_endpoint(&self) -> Result<SocketAddr, ConnectionError> {
        self.0.remote_endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.0.alpn()
    }
}

/// An HTTP/3 request stream: a header section, then body bytes, per
/// direction.
#[derive(Clone)]
pub struct Stream(pub(crate) Arc<StreamHandle>);

impl Stream {
    /// Read the header section. Must precede body reads; submitting this
    /// after the body started fails with an invalid-state error.
    pub async fn read_headers(&self) -> Result<Fields, StreamError> {
        self.0.read_headers().await
    }

    /// Read some body bytes. Completes with [StreamError::Eof] at the end
    /// of the body.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.0.read_some(buf).await
    }

    /// Serialize and send the header section. The field list is
    /// compressed exactly once, at this call; a section larger than the
    /// peer's advertised cap fails with [StreamError::FrameSize].
    pub fn write_headers(&self, fields: &Fields) -> Result<(), StreamError> {
        self.0.write_headers(fields)
    }

    /// Write some body bytes, framed as DATA.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.0.write_some(buf).await
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<(), StreamError> {
        self.0.write_all(buf).await
    }

    /// Gather-write several fragments as one operation.
    pub async fn write_vectored(
        &self,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Result<usize, StreamError> {
        self.0.write_vectored(bufs).await
    }

    /// Scatter-read into the given fragments.
    pub async fn read_vectored(
        &self,
        bufs: &mut [std::io::IoSliceMut<'_>],
    ) -> Result<usize, StreamError> {
        self.0.read_vectored(bufs).await
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.0.flush()
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<(), StreamError> {
        self.0.shutdown(how)
    }

    /// Graceful close: stop sending and wait until the peer acknowledges
    /// every byte.
    pub async fn close(&self) -> Result<(), StreamError> {
        self.0.close().await
    }

    pub fn reset(&self, code: u64) {
        self.0.reset(code)
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    pub fn set_priority(&self, urgency: u8, incremental: bool) {
        self.0.set_priority(urgency, incremental)
    }
}
