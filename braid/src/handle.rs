//! Shared handle types behind the public `quic` and `h3` surfaces.
//!
//! Handles hold the engine plus generation-guarded keys, never direct
//! references into engine state. Each async operation is a small future
//! that re-enters the engine lock on every poll and unregisters itself if
//! dropped mid-flight, so a cancelled future can never strand a pending
//! operation in the state machines.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use braid_proto::Fields;

use crate::conn::{sid, ConnKey};
use crate::engine::Engine;
use crate::error::{ConnectionError, StreamError};
use crate::op::{WakeList, MAX_FRAGMENTS};
use crate::stream::Priority;

/// Which halves of a stream `shutdown` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

// ---- connection ----------------------------------------------------------

/// Internal connection handle; the public wrappers are thin shells over
/// this.
pub(crate) struct ConnHandle {
    pub engine: Arc<Engine>,
    pub key: ConnKey,
}

impl ConnHandle {
    pub fn is_open(&self) -> bool {
        self.engine.with_state(|state, _| {
            Engine::conn_mut(state, self.key)
                .map(|conn| conn.is_open())
                .unwrap_or(false)
        })
    }

    pub fn remote_endpoint(&self) -> Result<SocketAddr, ConnectionError> {
        self.engine.with_state(|state, _| {
            Engine::conn_mut(state, self.key)
                .map(|conn| conn.remote_endpoint())
                .ok_or(ConnectionError::NotConnected)
        })
    }

    /// A process-stable connection identifier.
    pub fn id(&self) -> u64 {
        self.key.generation
    }

    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.engine.with_state(|state, _| {
            Engine::conn_mut(state, self.key).and_then(|conn| conn.alpn())
        })
    }

    pub fn go_away(&self) -> Result<(), ConnectionError> {
        self.engine.with_state(|state, outcome| {
            match Engine::conn_mut(state, self.key) {
                Some(conn) => conn.go_away(&mut outcome.wakers),
                None => Err(ConnectionError::NotConnected),
            }
        })
    }

    pub fn close(&self) {
        self.engine.with_state(|state, outcome| {
            if let Some(conn) = Engine::conn_mut(state, self.key) {
                conn.close(std::time::Instant::now(), &mut outcome.wakers);
            }
        });
    }

    pub fn open_stream(self: &Arc<Self>) -> OpenStream {
        OpenStream {
            conn: self.clone(),
            token: self.engine.token(),
            registered: false,
            done: false,
        }
    }

    pub fn accept_stream(self: &Arc<Self>) -> AcceptStream {
        AcceptStream {
            conn: self.clone(),
            token: self.engine.token(),
            registered: false,
            done: false,
        }
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        self.engine.release_conn(self.key);
    }
}

/// Future for a locally-initiated stream.
pub(crate) struct OpenStream {
    conn: Arc<ConnHandle>,
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for OpenStream {
    type Output = Result<StreamHandle, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = futures::ready!(this.conn.engine.with_state(|state, _| {
            match Engine::conn_mut(state, this.conn.key) {
                Some(conn) => conn.poll_open_stream(cx, this.token, &mut this.registered),
                None => Poll::Ready(Err(ConnectionError::NotConnected.into())),
            }
        }));
        this.done = true;
        Poll::Ready(result.map(|id| StreamHandle {
            conn: this.conn.clone(),
            id,
        }))
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        if self.registered && !self.done {
            let token = self.token;
            let key = self.conn.key;
            self.conn.engine.with_state(|state, outcome| {
                if let Some(conn) = Engine::conn_mut(state, key) {
                    conn.cancel_pending_stream(token, &mut outcome.wakers);
                }
            });
        }
    }
}

/// Future for a peer-initiated stream.
pub(crate) struct AcceptStream {
    conn: Arc<ConnHandle>,
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for AcceptStream {
    type Output = Result<StreamHandle, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = futures::ready!(this.conn.engine.with_state(|state, _| {
            match Engine::conn_mut(state, this.conn.key) {
                Some(conn) => conn.poll_accept_stream(cx, this.token, &mut this.registered),
                None => Poll::Ready(Err(ConnectionError::NotConnected.into())),
            }
        }));
        this.done = true;
        Poll::Ready(result.map(|id| StreamHandle {
            conn: this.conn.clone(),
            id,
        }))
    }
}

impl Drop for AcceptStream {
    fn drop(&mut self) {
        if self.registered && !self.done {
            let token = self.token;
            let key = self.conn.key;
            self.conn.engine.with_state(|state, outcome| {
                if let Some(conn) = Engine::conn_mut(state, key) {
                    conn.cancel_pending_stream(token, &mut outcome.wakers);
                }
            });
        }
    }
}

// ---- stream --------------------------------------------------------------

/// Internal stream handle. Dropping it resets the stream unless it was
/// closed first.
pub(crate) struct StreamHandle {
    pub conn: Arc<ConnHandle>,
    pub id: quinn_proto::StreamId,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        sid(self.id)
    }

    pub fn is_open(&self) -> bool {
        self.conn.engine.with_state(|state, _| {
            Engine::conn_mut(state, self.conn.key)
                .map(|conn| conn.stream_is_open(self.id))
                .unwrap_or(false)
        })
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut crate::conn::Conn, &mut WakeList) -> Result<R, StreamError>,
    ) -> Result<R, StreamError> {
        self.conn.engine.with_state(|state, outcome| {
            match Engine::conn_mut(state, self.conn.key) {
                Some(conn) => f(conn, &mut outcome.wakers),
                None => Err(ConnectionError::NotConnected.into()),
            }
        })
    }

    /// Read some body bytes. Completes with [StreamError::Eof] once the
    /// peer finishes sending.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        ReadSome {
            stream: self,
            buf,
            token: 0,
            registered: false,
            done: false,
        }
        .await
    }

    /// Read the next header section (HTTP/3 mode).
    pub async fn read_headers(&self) -> Result<Fields, StreamError> {
        ReadHeaders {
            stream: self,
            token: 0,
            registered: false,
            done: false,
        }
        .await
    }

    /// Write some body bytes; the accepted count is bounded by the
    /// effective flow-control window.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, StreamError> {
        WriteSome {
            stream: self,
            buf,
            token: 0,
            registered: false,
            done: false,
        }
        .await
    }

    /// Write every byte of `buf`.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), StreamError> {
        while !buf.is_empty() {
            let n = self.write_some(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Gather-write the fragments as one operation, returning the bytes
    /// accepted. At most [MAX_FRAGMENTS] fragments are taken.
    pub async fn write_vectored(&self, bufs: &[std::io::IoSlice<'_>]) -> Result<usize, StreamError> {
        let total: usize = bufs
            .iter()
            .take(MAX_FRAGMENTS)
            .map(|b| b.len())
            .sum();
        let mut gathered = Vec::with_capacity(total);
        for buf in bufs.iter().take(MAX_FRAGMENTS) {
            gathered.extend_from_slice(buf);
        }
        self.write_some(&gathered).await
    }

    /// Scatter-read into the first non-empty fragment; at most
    /// [MAX_FRAGMENTS] fragments are considered.
    pub async fn read_vectored(
        &self,
        bufs: &mut [std::io::IoSliceMut<'_>],
    ) -> Result<usize, StreamError> {
        match bufs
            .iter_mut()
            .take(MAX_FRAGMENTS)
            .find(|b| !b.is_empty())
        {
            Some(buf) => self.read_some(buf).await,
            None => Ok(0),
        }
    }

    /// Serialize and send a header section (HTTP/3 mode). The field list
    /// is compressed exactly once, at this call.
    pub fn write_headers(&self, fields: &Fields) -> Result<(), StreamError> {
        let id = self.id;
        self.with_conn(|conn, wakers| conn.write_headers(id, fields, wakers))
    }

    /// Push queued bytes toward the wire.
    pub fn flush(&self) -> Result<(), StreamError> {
        let id = self.id;
        self.with_conn(|conn, wakers| conn.flush(id, wakers))
    }

    /// Shut down one or both halves. Pending operations on the named
    /// halves complete with `aborted`.
    pub fn shutdown(&self, how: Shutdown) -> Result<(), StreamError> {
        let id = self.id;
        let (read, write) = match how {
            Shutdown::Read => (true, false),
            Shutdown::Write => (false, true),
            Shutdown::Both => (true, true),
        };
        self.with_conn(|conn, wakers| conn.shutdown(id, read, write, wakers))
    }

    /// Graceful close: stop sending, then wait until the peer has
    /// acknowledged every byte.
    pub async fn close(&self) -> Result<(), StreamError> {
        CloseStream {
            stream: self,
            token: 0,
            registered: false,
            done: false,
        }
        .await
    }

    /// Abort both sides immediately with an application error code.
    pub fn reset(&self, code: u64) {
        let id = self.id;
        let _ = self.with_conn(|conn, wakers| {
            conn.reset_stream(id, code, wakers);
            Ok(())
        });
    }

    /// Record priority metadata. Stored for a future re-prioritizer;
    /// scheduling stays FIFO.
    pub fn set_priority(&self, urgency: u8, incremental: bool) {
        let id = self.id;
        let _ = self.with_conn(|conn, _| {
            conn.set_priority(
                id,
                Priority {
                    urgency,
                    incremental,
                },
            );
            Ok(())
        });
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let id = self.id;
        self.conn.engine.with_state(|state, outcome| {
            if let Some(conn) = Engine::conn_mut(state, self.conn.key) {
                conn.release_stream(id, &mut outcome.wakers);
            }
        });
    }
}

// ---- stream op futures ---------------------------------------------------

struct ReadSome<'a, 'b> {
    stream: &'a StreamHandle,
    buf: &'b mut [u8],
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for ReadSome<'_, '_> {
    type Output = Result<usize, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.token == 0 {
            this.token = this.stream.conn.engine.token();
        }
        let id = this.stream.id;
        let key = this.stream.conn.key;
        let result = this.stream.conn.engine.with_state(|state, _| {
            match Engine::conn_mut(state, key) {
                Some(conn) => conn.poll_read(cx, id, this.token, &mut this.registered, this.buf),
                None => Poll::Ready(Err(ConnectionError::NotConnected.into())),
            }
        });
        if result.is_ready() {
            this.done = true;
        }
        result
    }
}

impl Drop for ReadSome<'_, '_> {
    fn drop(&mut self) {
        abandon(self.stream, self.token, self.registered, self.done, Abandon::Recv);
    }
}

struct ReadHeaders<'a> {
    stream: &'a StreamHandle,
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for ReadHeaders<'_> {
    type Output = Result<Fields, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.token == 0 {
            this.token = this.stream.conn.engine.token();
        }
        let id = this.stream.id;
        let key = this.stream.conn.key;
        let result = this.stream.conn.engine.with_state(|state, _| {
            match Engine::conn_mut(state, key) {
                Some(conn) => conn.poll_read_headers(cx, id, this.token, &mut this.registered),
                None => Poll::Ready(Err(ConnectionError::NotConnected.into())),
            }
        });
        if result.is_ready() {
            this.done = true;
        }
        result
    }
}

impl Drop for ReadHeaders<'_> {
    fn drop(&mut self) {
        abandon(self.stream, self.token, self.registered, self.done, Abandon::Recv);
    }
}

struct WriteSome<'a, 'b> {
    stream: &'a StreamHandle,
    buf: &'b [u8],
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for WriteSome<'_, '_> {
    type Output = Result<usize, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.token == 0 {
            this.token = this.stream.conn.engine.token();
        }
        let id = this.stream.id;
        let key = this.stream.conn.key;
        let result = this.stream.conn.engine.with_state(|state, outcome| {
            match Engine::conn_mut(state, key) {
                Some(conn) => conn.poll_write(
                    cx,
                    id,
                    this.token,
                    &mut this.registered,
                    this.buf,
                    &mut outcome.wakers,
                ),
                None => Poll::Ready(Err(ConnectionError::NotConnected.into())),
            }
        });
        if result.is_ready() {
            this.done = true;
        }
        result
    }
}

impl Drop for WriteSome<'_, '_> {
    fn drop(&mut self) {
        abandon(self.stream, self.token, self.registered, self.done, Abandon::Send);
    }
}

struct CloseStream<'a> {
    stream: &'a StreamHandle,
    token: u64,
    registered: bool,
    done: bool,
}

impl Future for CloseStream<'_> {
    type Output = Result<(), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.token == 0 {
            this.token = this.stream.conn.engine.token();
        }
        let id = this.stream.id;
        let key = this.stream.conn.key;
        let result = this.stream.conn.engine.with_state(|state, outcome| {
            match Engine::conn_mut(state, key) {
                Some(conn) => conn.poll_close(
                    cx,
                    id,
                    this.token,
                    &mut this.registered,
                    &mut outcome.wakers,
                ),
                None => Poll::Ready(Err(ConnectionError::NotConnected.into())),
            }
        });
        if result.is_ready() {
            this.done = true;
        }
        result
    }
}

impl Drop for CloseStream<'_> {
    fn drop(&mut self) {
        // A close future dropped mid-flight leaves the stream closing; the
        // FIN is on the wire and cannot be recalled. The completion is
        // collected by a later close call or discarded at reset.
        let _ = (self.registered, self.done);
    }
}

enum Abandon {
    Recv,
    Send,
}

/// A data future died before completion: detach its pending operation so
/// the side is free for the next submission.
fn abandon(stream: &StreamHandle, token: u64, registered: bool, done: bool, side: Abandon) {
    if !registered || done {
        return;
    }
    let id = stream.id;
    stream.conn.engine.with_state(|state, _| {
        if let Some(conn) = Engine::conn_mut(state, stream.conn.key) {
            match side {
                Abandon::Recv => conn.abandon_recv(id, token),
                Abandon::Send => conn.abandon_send(id, token),
            }
        }
    });
}
