//! An event-driven QUIC transport and HTTP/3 framing engine.
//!
//! One engine task owns the protocol machine, its UDP sockets, and a
//! time-based tick; applications get asynchronous connection and stream
//! operations whose completions are never delivered while engine state is
//! locked. Two surfaces share the internals:
//!
//! - [quic]: raw bidirectional byte streams.
//! - [h3]: HTTP/3 request streams with a header section before the body.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = braid::quic::Client::builder()
//!     .with_alpn(&["echo"])
//!     .build()?;
//! let conn = client.connect("127.0.0.1:4433".parse()?, "localhost")?;
//! let mut stream = conn.open_stream().await?;
//! stream.write_all(b"hello\n").await?;
//! stream.shutdown(braid::quic::Shutdown::Write)?;
//! # Ok(()) }
//! ```

mod client;
mod conn;
mod engine;
mod error;
mod flow;
mod h3conn;
mod handle;
mod op;
mod server;
mod settings;
mod socket;
mod stream;

pub mod h3;
pub mod quic;

pub use client::BuildError;
pub use error::{ConnectionError, StreamError, TLS_NO_APPLICATION_PROTOCOL};
pub use op::MAX_FRAGMENTS;
pub use settings::Settings;

// TLS configuration types callers need to construct clients and servers.
pub use rustls;
