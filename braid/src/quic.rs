//! Raw QUIC byte streams: connections multiplex bidirectional streams
//! with independent flow control, no HTTP/3 framing.

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

/// Construct a raw QUIC [Client].
pub struct ClientBuilder(client::ClientBuilder);

impl ClientBuilder {
    pub fn new() -> Self {
        Self(client::ClientBuilder::new(false))
    }

    /// Bind the UDP socket to a specific local address.
    pub fn with_bind(self, addr: SocketAddr) -> Self {
        Self(self.0.with_bind(addr))
    }

    /// Offer the given ALPN protocols, in preference order.
    pub fn with_alpn(self, protocols: &[&str]) -> Self {
        Self(self.0.with_alpn(protocols))
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        Self(self.0.with_settings(settings))
    }

    /// Trust the given root certificates.
    pub fn with_root_certificates(self, roots: RootCertStore) -> Self {
        Self(self.0.with_root_certificates(roots))
    }

    /// Trust specific (typically self-signed) server certificates.
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

/// A QUIC client: one UDP socket servicing any number of connections.
pub struct Client(client::Client);

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Open a connection to the given endpoint and server name. The TLS
    /// handshake starts here but the call does not wait for it; handshake
    /// failures surface on the first operation that needs the connection.
    pub fn connect(
        &self,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<Connection, ConnectionError> {
        Ok(Connection(self.0.connect(remote, server_name)?))
    }

    /// The socket's locally-bound address.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.0.local_endpoint()
    }

    /// Close the socket along with every connection on it.
    pub async fn close(&self) {
        self.0.close().await;
    }
}

/// Construct a raw QUIC [Server].
pub struct ServerBuilder(server::ServerBuilder);

impl ServerBuilder {
    pub fn new() -> Self {
        Self(server::ServerBuilder::new(false))
    }

    pub fn with_bind(self, addr: SocketAddr) -> Self {
        Self(self.0.with_bind(addr))
    }

    /// Accept the given ALPN protocols; the first common protocol wins.
    pub fn with_alpn(self, protocols: &[&str]) -> Self {
        Self(self.0.with_alpn(protocols))
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        Self(self.0.with_settings(settings))
    }

    /// The incoming-connection queue capacity.
    pub fn with_backlog(self, backlog: usize) -> Self {
        Self(self.0.with_backlog(backlog))
    }

    /// Serve a single certificate chain.
    pub fn with_single_cert(
        self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Server, BuildError> {
        Ok(Server(self.0.with_single_cert(chain, key)?))
    }

    /// Select certificates by SNI at handshake time.
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

/// A QUIC server: accepts handshake-complete connections from one socket.
pub struct Server(server::Server);

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Re-arm the incoming queue with a new capacity. Connections above
    /// it are refused rather than queued.
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

    /// Close the socket along with every connection on it.
    pub async fn close(&self) {
        self.0.close().await;
    }
}

/// A QUIC connection. Dropping the handle aborts the connection.
#[derive(Clone)]
pub struct Connection(pub(crate) Arc<ConnHandle>);

impl Connection {
    /// Open a locally-initiated bidirectional stream. Blocks while the
    /// peer's concurrent-stream cap is reached.
    pub async fn open_stream(&self) -> Result<Stream, StreamError> {
        Ok(Stream(Arc::new(self.0.open_stream().await?)))
    }

    /// Accept a peer-initiated bidirectional stream.
    pub async fn accept_stream(&self) -> Result<Stream, StreamError> {
        Ok(Stream(Arc::new(self.0.accept_stream().await?)))
    }

    /// Advertise graceful shutdown: new locally-initiated streams fail
    /// with `going_away`, existing streams finish normally.
    pub fn go_away(&self) -> Result<(), ConnectionError> {
        self.0.go_away()
    }

    /// Abort the connection. Every attached stream observes `aborted`.
    pub fn close(&self) {
        self.0.close();
    }

    pub fn remote_endpoint(&self) -> Result<SocketAddr, ConnectionError> {
        self.0.remote_endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    /// A process-stable identifier for this connection.
    pub fn id(&self) -> u64 {
        self.0.id()
    }

    /// The negotiated ALPN protocol, once the handshake completes.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.0.alpn()
    }
}

/// A bidirectional byte stream. Dropping the handle resets the stream
/// unless it was closed first.
#[derive(Clone)]
pub struct Stream(pub(crate) Arc<StreamHandle>);

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.0.id()).finish()
    }
}

impl Stream {
    /// Read some bytes. Completes with [StreamError::Eof] once the peer
    /// has finished sending.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.0.read_some(buf).await
    }

    /// Write some bytes, bounded by the effective flow-control window.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.0.write_some(buf).await
    }

    /// Write every byte of `buf`.
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

    /// Push queued bytes toward the wire.
    pub fn flush(&self) -> Result<(), StreamError> {
        self.0.flush()
    }

    /// Shut down one or both halves; pending operations on those halves
    /// complete with `aborted`.
    pub fn shutdown(&self, how: Shutdown) -> Result<(), StreamError> {
        self.0.shutdown(how)
    }

    /// Graceful close: stop sending and wait until the peer acknowledges
    /// every byte.
    pub async fn close(&self) -> Result<(), StreamError> {
        self.0.close().await
    }

    /// Abort both sides immediately.
    pub fn reset(&self, code: u64) {
        self.0.reset(code)
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    /// Record priority metadata; scheduling stays FIFO.
    pub fn set_priority(&self, urgency: u8, incremental: bool) {
        self.0.set_priority(urgency, incremental)
    }
}
