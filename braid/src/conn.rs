//! The connection state machine: stream registries, per-connection flow
//! control and writer scheduling, error fan-out, and the poll entry points
//! behind every stream operation.
//!
//! Everything here runs under the engine lock. Wakers are collected into a
//! [WakeList] and woken by the caller after the lock drops.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};

use braid_proto::{qpack, Fields};

use crate::error::{ConnectionError, StreamError};
use crate::flow::{Window, WriterQueue};
use crate::h3conn::{H3Conn, H3Event};
use crate::op::{Op, WakeList};
use crate::stream::{
    advance_frames, data_frame_header, headers_frame, CloseOp, FrameRx, FrameStage, Priority,
    QueuedChunk, RecvSide, SendSide, SideOp, StreamEntry, StreamState, DROP_CODE,
};

/// A stable reference to a connection: the protocol machine's handle plus
/// a generation counter so recycled handles are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub handle: quinn_proto::ConnectionHandle,
    pub generation: u64,
}

/// A stream-connect or stream-accept operation waiting its turn.
#[derive(Debug)]
pub(crate) struct PendingStream {
    pub token: u64,
    pub op: Op<Result<quinn_proto::StreamId, StreamError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    /// Handshake may still be in flight; operations are accepted.
    Open,
    /// Terminal. A stored error, if any, goes to the next operation.
    Closed,
}

pub(crate) struct Conn {
    pub proto: quinn_proto::Connection,
    pub socket: usize,
    pub generation: u64,
    pub http: bool,

    pub phase: ConnPhase,
    /// Handshake completed (Connected event seen).
    pub established: bool,
    /// Connection error stored because no operation was waiting.
    pub error: Option<ConnectionError>,
    failed: bool,

    pub streams: HashMap<quinn_proto::StreamId, StreamEntry>,
    pub connecting: VecDeque<PendingStream>,
    pub accepting: VecDeque<PendingStream>,
    pub incoming: VecDeque<quinn_proto::StreamId>,
    /// Completed connect/accept operations awaiting collection.
    pub finished: HashMap<u64, Op<Result<quinn_proto::StreamId, StreamError>>>,

    /// Connection-level send pacing window.
    pub flow: Window,
    stream_window: u32,
    pub writers: WriterQueue<quinn_proto::StreamId>,

    pub local_goaway: bool,
    pub peer_goaway: bool,

    pub h3: Option<H3Conn>,
    /// Highest peer-initiated bidirectional stream id seen, for GOAWAY.
    max_incoming: Option<u64>,

    /// A public handle exists (or existed): the connection was connected
    /// or accepted by someone. Unclaimed incoming connections are reaped
    /// as soon as they drain.
    pub claimed: bool,
    /// The public handle was dropped; the entry may be reaped once the
    /// protocol machine drains.
    pub handle_dropped: bool,
    pub drained: bool,
}

pub(crate) fn sid(id: quinn_proto::StreamId) -> u64 {
    quinn_proto::VarInt::from(id).into_inner()
}

/// One chunk pulled from the protocol machine's receive stream.
pub(crate) enum Pull {
    Data(Bytes),
    Blocked,
    Fin,
    Reset(u64),
    /// The protocol machine no longer knows the stream.
    Closed,
}

pub(crate) fn pull_chunk(
    proto: &mut quinn_proto::Connection,
    id: quinn_proto::StreamId,
    max: usize,
) -> Pull {
    let mut stream = proto.recv_stream(id);
    let mut recv = match stream.read(true) {
        Ok(chunks) => chunks,
        Err(_) => return Pull::Closed,
    };
    let result = match recv.next(max) {
        Ok(Some(chunk)) => Pull::Data(chunk.bytes),
        Ok(None) => Pull::Fin,
        Err(quinn_proto::ReadError::Blocked) => Pull::Blocked,
        Err(quinn_proto::ReadError::Reset(code)) => Pull::Reset(code.into_inner()),
    };
    let _ = recv.finalize();
    result
}

/// Outcome of a body-read attempt against the protocol machine.
enum ReadOutcome {
    Data(usize),
    Blocked,
    Eof,
    Reset(u64),
}

/// Outcome of a header-read attempt.
enum HeaderOutcome {
    Fields(Fields),
    Blocked,
    Eof,
    Reset(u64),
}

/// How a submission relates to the side's current sub-state.
enum Gate {
    /// Proceed with the protocol machine.
    Attempt,
    /// Deliver this error without touching anything.
    Deliver(StreamError),
    Busy,
}

impl Conn {
    pub fn new(
        proto: quinn_proto::Connection,
        socket: usize,
        generation: u64,
        http: bool,
        conn_window: u32,
        stream_window: u32,
        max_field_section_size: u64,
    ) -> Self {
        Self {
            proto,
            socket,
            generation,
            http,
            phase: ConnPhase::Open,
            established: false,
            error: None,
            failed: false,
            streams: HashMap::new(),
            connecting: VecDeque::new(),
            accepting: VecDeque::new(),
            incoming: VecDeque::new(),
            finished: HashMap::new(),
            flow: Window::new(conn_window),
            stream_window,
            writers: WriterQueue::default(),
            local_goaway: false,
            peer_goaway: false,
            h3: http.then(|| H3Conn::new(max_field_section_size)),
            max_incoming: None,
            claimed: false,
            handle_dropped: false,
            drained: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase == ConnPhase::Open && self.error.is_none()
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.proto.remote_address()
    }

    pub fn alpn(&self) -> Option<Vec<u8>> {
        let data = self.proto.crypto_session().handshake_data()?;
        let data = data
            .downcast::<quinn_proto::crypto::rustls::HandshakeData>()
            .ok()?;
        data.protocol.clone()
    }

    fn new_entry(&mut self, id: quinn_proto::StreamId) -> &mut StreamEntry {
        let entry = StreamEntry::new(id, self.http, self.stream_window);
        self.streams.entry(id).or_insert(entry)
    }

    /// Deliver a stored connection error, if one is waiting, to this
    /// operation. The connection transitions to closed.
    fn take_stored(&mut self) -> Option<ConnectionError> {
        let err = self.error.take()?;
        self.phase = ConnPhase::Closed;
        Some(err)
    }

    // ---- connection-level operations ------------------------------------

    /// Open a locally-initiated stream. Queued FIFO when the peer's stream
    /// cap is reached.
    pub fn poll_open_stream(
        &mut self,
        cx: &mut Context<'_>,
        token: u64,
        registered: &mut bool,
    ) -> Poll<Result<quinn_proto::StreamId, StreamError>> {
        if let Some(mut op) = self.finished.remove(&token) {
            if let Some(result) = op.take_result() {
                return Poll::Ready(result);
            }
        }

        if *registered {
            if let Some(pending) = self.connecting.iter_mut().find(|p| p.token == token) {
                pending.op.register(cx);
                return Poll::Pending;
            }
            // Neither queued nor finished: the engine was torn down.
            return Poll::Ready(Err(ConnectionError::EngineStopped.into()));
        }

        if let Some(err) = self.take_stored() {
            return Poll::Ready(Err(err.into()));
        }
        if self.phase == ConnPhase::Closed {
            return Poll::Ready(Err(ConnectionError::NotConnected.into()));
        }
        if self.local_goaway {
            return Poll::Ready(Err(ConnectionError::GoingAway.into()));
        }
        if self.peer_goaway {
            return Poll::Ready(Err(ConnectionError::PeerGoingAway.into()));
        }

        // Fast path, in submission order behind any queued ops. Streams
        // open only once the handshake completes, so a handshake failure
        // reaches the operations waiting on it.
        if self.established && self.connecting.is_empty() {
            if let Some(id) = self.proto.streams().open(quinn_proto::Dir::Bi) {
                tracing::trace!(stream = ?id, "opened stream");
                self.new_entry(id);
                return Poll::Ready(Ok(id));
            }
        }

        *registered = true;
        self.connecting.push_back(PendingStream {
            token,
            op: Op::new(cx),
        });
        Poll::Pending
    }

    /// Accept a peer-initiated stream.
    pub fn poll_accept_stream(
        &mut self,
        cx: &mut Context<'_>,
        token: u64,
        registered: &mut bool,
    ) -> Poll<Result<quinn_proto::StreamId, StreamError>> {
        if let Some(mut op) = self.finished.remove(&token) {
            if let Some(result) = op.take_result() {
                return Poll::Ready(result);
            }
        }

        if *registered {
            if let Some(pending) = self.accepting.iter_mut().find(|p| p.token == token) {
                pending.op.register(cx);
                return Poll::Pending;
            }
            return Poll::Ready(Err(ConnectionError::EngineStopped.into()));
        }

        if let Some(err) = self.take_stored() {
            return Poll::Ready(Err(err.into()));
        }
        if self.phase == ConnPhase::Closed {
            return Poll::Ready(Err(ConnectionError::NotConnected.into()));
        }

        if let Some(id) = self.incoming.pop_front() {
            tracing::trace!(stream = ?id, "accepted queued stream");
            self.new_entry(id);
            return Poll::Ready(Ok(id));
        }

        *registered = true;
        self.accepting.push_back(PendingStream {
            token,
            op: Op::new(cx),
        });
        Poll::Pending
    }

    /// A connect/accept future was dropped before completion.
    pub fn cancel_pending_stream(&mut self, token: u64, wakers: &mut WakeList) {
        self.connecting.retain(|p| p.token != token);
        self.accepting.retain(|p| p.token != token);
        if let Some(mut op) = self.finished.remove(&token) {
            if let Some(Ok(id)) = op.take_result() {
                // The stream was handed to nobody; tear it down.
                self.reset_stream(id, DROP_CODE, wakers);
                self.streams.remove(&id);
            }
        }
    }

    /// Retry queued stream-connect operations as capacity appears.
    pub fn drain_connecting(&mut self, wakers: &mut WakeList) {
        if !self.established {
            return;
        }
        while !self.connecting.is_empty() {
            let Some(id) = self.proto.streams().open(quinn_proto::Dir::Bi) else {
                break;
            };
            let pending = self.connecting.pop_front().unwrap_or_else(|| unreachable!());
            tracing::trace!(stream = ?id, "opened queued stream");
            self.new_entry(id);
            let (done, waker) = pending.op.complete(Ok(id));
            self.finished.insert(pending.token, done.into_inner());
            wakers.push(waker);
        }
    }

    /// The protocol machine has newly-opened peer streams to hand over.
    pub fn drain_peer_opened(&mut self, dir: quinn_proto::Dir, wakers: &mut WakeList) {
        while let Some(id) = self.proto.streams().accept(dir) {
            match dir {
                quinn_proto::Dir::Uni => {
                    if let Some(h3) = &mut self.h3 {
                        h3.on_uni_opened(id);
                        // The type varint may already be buffered.
                        let mut events = Vec::new();
                        let result = h3.on_readable(&mut self.proto, id, &mut events);
                        self.apply_h3(result, events, wakers);
                    } else {
                        // Raw QUIC exposes no unidirectional surface.
                        let code = quinn_proto::VarInt::from_u32(0);
                        let _ = self.proto.recv_stream(id).stop(code);
                    }
                }
                quinn_proto::Dir::Bi => {
                    self.max_incoming = Some(
                        self.max_incoming
                            .map_or(sid(id), |prev| prev.max(sid(id))),
                    );
                    if let Some(pending) = self.accepting.pop_front() {
                        tracing::trace!(stream = ?id, "accepted stream");
                        self.new_entry(id);
                        let (done, waker) = pending.op.complete(Ok(id));
                        self.finished.insert(pending.token, done.into_inner());
                        wakers.push(waker);
                    } else {
                        tracing::trace!(stream = ?id, "queued incoming stream");
                        self.incoming.push_back(id);
                    }
                }
            }
        }
    }

    /// Advertise graceful shutdown. New locally-initiated streams fail
    /// with `going_away`; existing streams finish normally.
    pub fn go_away(&mut self, wakers: &mut WakeList) -> Result<(), ConnectionError> {
        if let Some(err) = self.take_stored() {
            return Err(err);
        }
        if self.phase == ConnPhase::Closed {
            return Err(ConnectionError::NotConnected);
        }

        self.local_goaway = true;
        if let Some(h3) = &mut self.h3 {
            let next = self.max_incoming.map_or(0, |id| id + 4);
            h3.queue_goaway(next);
            let result = h3.flush(&mut self.proto);
            self.apply_h3(result, Vec::new(), wakers);
        }
        Ok(())
    }

    /// Abort the connection now. Every stream observes `aborted`; a
    /// CONNECTION_CLOSE goes out on the next process pass.
    pub fn close(&mut self, now: std::time::Instant, wakers: &mut WakeList) {
        if self.phase == ConnPhase::Closed && self.failed {
            return;
        }
        self.proto
            .close(now, quinn_proto::VarInt::from_u32(0), Bytes::new());
        self.fail(ConnectionError::Aborted, false, wakers);
    }

    /// Apply the outcome of an h3-layer call: errors become connection
    /// failures, events become state transitions.
    pub fn apply_h3(
        &mut self,
        result: Result<(), ConnectionError>,
        events: Vec<H3Event>,
        wakers: &mut WakeList,
    ) {
        for event in events {
            match event {
                H3Event::PeerSettings => {
                    // HTTP/3 SETTINGS define no field that revises the
                    // initial stream window, so the re-base arrives with
                    // the initial unchanged.
                    let initial = self.stream_window;
                    self.revise_initial_window(initial, wakers);
                }
                H3Event::PeerGoaway(_) => {
                    self.peer_goaway = true;
                    // Pending stream connects learn the peer is leaving.
                    for pending in self.connecting.drain(..) {
                        let (done, waker) = pending
                            .op
                            .complete(Err(ConnectionError::PeerGoingAway.into()));
                        self.finished.insert(pending.token, done.into_inner());
                        wakers.push(waker);
                    }
                }
            }
        }

        if let Err(err) = result {
            let code = match &err {
                ConnectionError::Application { code } => *code,
                _ => braid_proto::code::H3_GENERAL_PROTOCOL_ERROR,
            };
            let code = quinn_proto::VarInt::from_u64(code).unwrap_or(quinn_proto::VarInt::MAX);
            self.proto
                .close(std::time::Instant::now(), code, Bytes::new());
            self.fail(err, true, wakers);
        }
    }

    /// Connection-level failure: fan the error out to every attached
    /// stream and pending operation. If nothing consumed it and `store`
    /// is set, the error waits for the next operation.
    pub fn fail(&mut self, err: ConnectionError, store: bool, wakers: &mut WakeList) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.phase = ConnPhase::Closed;
        tracing::debug!(error = %err, "connection failed");

        let mut delivered = 0;

        let stream_err = StreamError::Connection(err.clone());
        for pending in self.connecting.drain(..).chain(self.accepting.drain(..)) {
            let (done, waker) = pending.op.complete(Err(stream_err.clone()));
            self.finished.insert(pending.token, done.into_inner());
            wakers.push(waker);
            delivered += 1;
        }
        self.incoming.clear();

        for entry in self.streams.values_mut() {
            entry.queued.clear();
            delivered += entry.on_conn_error(stream_err.clone(), wakers);
        }
        wakers.extend(self.writers.drain());

        if delivered == 0 && store {
            self.error = Some(err);
        }
    }

    // ---- event handlers --------------------------------------------------

    pub fn on_connected(&mut self, wakers: &mut WakeList) {
        self.established = true;
        tracing::debug!(alpn = ?self.alpn().map(|a| String::from_utf8_lossy(&a).into_owned()), "handshake complete");
        if let Some(h3) = &mut self.h3 {
            let result = h3.on_connected(&mut self.proto);
            self.apply_h3(result, Vec::new(), wakers);
        }
        self.drain_connecting(wakers);
    }

    pub fn on_readable(&mut self, id: quinn_proto::StreamId, wakers: &mut WakeList) {
        if let Some(h3) = &mut self.h3 {
            if h3.is_internal(id) {
                let mut events = Vec::new();
                let result = h3.on_readable(&mut self.proto, id, &mut events);
                self.apply_h3(result, events, wakers);
                return;
            }
        }
        if let Some(entry) = self.streams.get(&id) {
            if let StreamState::Open { recv, .. } = &entry.state {
                recv.notify(wakers);
            }
        }
        // Data on un-accepted incoming streams waits in the protocol
        // machine until someone accepts.
    }

    pub fn on_writable(&mut self, id: quinn_proto::StreamId, wakers: &mut WakeList) {
        if let Some(h3) = &mut self.h3 {
            if h3.is_internal(id) {
                let result = h3.flush(&mut self.proto);
                self.apply_h3(result, Vec::new(), wakers);
                return;
            }
        }
        self.flush_stream(id, wakers);
        // A direct writer parked on this stream's credit re-polls now.
        if let Some(entry) = self.streams.get(&id) {
            if let StreamState::Open { send, .. } = &entry.state {
                send.notify(wakers);
            }
        }
        self.wake_writers(wakers);
    }

    pub fn on_finished(&mut self, id: quinn_proto::StreamId, wakers: &mut WakeList) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        entry.acked = true;
        if let StreamState::Closing(_) = &entry.state {
            let StreamState::Closing(close) =
                std::mem::replace(&mut entry.state, StreamState::Closed)
            else {
                unreachable!()
            };
            let (done, waker) = close.op.complete(Ok(()));
            entry.state = StreamState::Closing(CloseOp {
                token: close.token,
                op: done.into_inner(),
            });
            wakers.push(waker);
        }
    }

    pub fn on_stopped(&mut self, id: quinn_proto::StreamId, code: u64, wakers: &mut WakeList) {
        self.writers.cancel(id);
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        release_queued(entry, &mut self.flow);
        match &mut entry.state {
            StreamState::Open { send, .. } => {
                send.cancel(
                    StreamError::Stopped(code),
                    StreamError::Stopped(code),
                    wakers,
                );
            }
            StreamState::Closing(_) => {
                let StreamState::Closing(close) =
                    std::mem::replace(&mut entry.state, StreamState::Closed)
                else {
                    unreachable!()
                };
                let (done, waker) = close.op.complete(Err(StreamError::Reset(code)));
                entry.state = StreamState::Closing(CloseOp {
                    token: close.token,
                    op: done.into_inner(),
                });
                wakers.push(waker);
            }
            _ => {}
        }
        self.wake_writers(wakers);
    }

    // ---- send path -------------------------------------------------------

    /// Drain a stream's queued chunks into the protocol machine, crediting
    /// the pacing windows for accepted bytes.
    pub fn flush_stream(&mut self, id: quinn_proto::StreamId, wakers: &mut WakeList) {
        let Self {
            proto,
            streams,
            flow,
            writers,
            ..
        } = self;
        let Some(entry) = streams.get_mut(&id) else {
            return;
        };

        while let Some(chunk) = entry.queued.front_mut() {
            match proto.send_stream(id).write(&chunk.data) {
                Ok(0) => break,
                Ok(n) => {
                    if chunk.costed {
                        // Cannot overflow: credits never exceed what
                        // consume() debited.
                        let _ = entry.window.credit(n as u64);
                        let _ = flow.credit(n as u64);
                    }
                    chunk.data.advance(n);
                    if chunk.data.is_empty() {
                        entry.queued.pop_front();
                    }
                }
                Err(quinn_proto::WriteError::Blocked) => break,
                Err(quinn_proto::WriteError::Stopped(code)) => {
                    writers.cancel(id);
                    release_queued(entry, flow);
                    if let StreamState::Open { send, .. } = &mut entry.state {
                        send.cancel(
                            StreamError::Stopped(code.into_inner()),
                            StreamError::Stopped(code.into_inner()),
                            wakers,
                        );
                    }
                    return;
                }
                Err(quinn_proto::WriteError::ClosedStream) => {
                    release_queued(entry, flow);
                    return;
                }
            }
        }

        if entry.queued.is_empty() && entry.fin_pending && !entry.fin_sent {
            match proto.send_stream(id).finish() {
                Ok(()) => {
                    tracing::trace!(stream = ?id, "sent FIN");
                    entry.fin_sent = true;
                }
                Err(quinn_proto::FinishError::Stopped(code)) => {
                    writers.cancel(id);
                    if let StreamState::Open { send, .. } = &mut entry.state {
                        send.cancel(
                            StreamError::Stopped(code.into_inner()),
                            StreamError::Stopped(code.into_inner()),
                            wakers,
                        );
                    }
                }
                Err(quinn_proto::FinishError::ClosedStream) => {}
            }
        }
    }

    /// Flush every stream with queued data and the control stream.
    pub fn flush_all(&mut self, wakers: &mut WakeList) {
        let ids: Vec<_> = self
            .streams
            .iter()
            .filter(|(_, e)| !e.queued.is_empty() || (e.fin_pending && !e.fin_sent))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.flush_stream(id, wakers);
        }
        if let Some(h3) = &mut self.h3 {
            let result = h3.flush(&mut self.proto);
            self.apply_h3(result, Vec::new(), wakers);
        }
        self.wake_writers(wakers);
    }

    /// Re-base every stream's send window on a revised initial window
    /// size, shifting each by the delta. A shift may drive a window
    /// negative; pushing one past the maximum is a flow-control error for
    /// the whole connection.
    pub fn revise_initial_window(&mut self, initial: u32, wakers: &mut WakeList) {
        let delta = i64::from(initial) - i64::from(self.stream_window);
        self.stream_window = initial;
        if delta == 0 {
            return;
        }

        tracing::debug!(initial, delta, "revising stream windows");
        let mut overflow = false;
        for entry in self.streams.values_mut() {
            if entry.window.adjust(delta).is_err() {
                overflow = true;
            }
        }
        if overflow {
            let code = quinn_proto::VarInt::from_u32(0x3);
            self.proto
                .close(std::time::Instant::now(), code, Bytes::new());
            self.fail(
                crate::error::from_transport_code(0x3, "flow-control window overflow"),
                true,
                wakers,
            );
            return;
        }

        self.wake_writers(wakers);
    }

    /// Wake parked writers, FIFO among streams whose effective window is
    /// positive.
    fn wake_writers(&mut self, wakers: &mut WakeList) {
        let Self {
            streams,
            flow,
            writers,
            ..
        } = self;
        while flow.is_positive() {
            let eligible = writers.pop_eligible(|id| {
                streams
                    .get(&id)
                    .map(|e| e.window.is_positive())
                    .unwrap_or(true)
            });
            match eligible {
                Some((_, waker)) => wakers.push(waker),
                None => break,
            }
        }
    }

    // ---- stream operations ----------------------------------------------

    fn gate_recv(recv: &mut RecvSide, token: u64, registered: bool, header_op: bool) -> Gate {
        match recv {
            RecvSide::Shutdown { op, next } => {
                if let Some(side) = op {
                    if side.token == token || !registered {
                        let side = op.take().unwrap_or_else(|| unreachable!());
                        let err = side
                            .op
                            .into_result()
                            .unwrap_or_else(|| next.clone());
                        return Gate::Deliver(err);
                    }
                }
                Gate::Deliver(next.clone())
            }
            RecvSide::ExpectingHeader => {
                if header_op {
                    Gate::Attempt
                } else {
                    Gate::Deliver(StreamError::InvalidState)
                }
            }
            RecvSide::ExpectingBody => {
                if header_op {
                    Gate::Deliver(StreamError::InvalidState)
                } else {
                    Gate::Attempt
                }
            }
            RecvSide::Header(side) | RecvSide::Body(side) => {
                if side.token == token {
                    Gate::Attempt
                } else {
                    Gate::Busy
                }
            }
        }
    }

    /// Read body bytes into `buf`.
    pub fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        id: quinn_proto::StreamId,
        token: u64,
        registered: &mut bool,
        buf: &mut [u8],
    ) -> Poll<Result<usize, StreamError>> {
        let Self { proto, streams, .. } = self;
        let Some(entry) = streams.get_mut(&id) else {
            return Poll::Ready(Err(StreamError::Closed));
        };

        let (recv, _send) = match checked_open(entry) {
            Err(err) => return Poll::Ready(Err(err)),
            Ok(None) => return Poll::Ready(Err(StreamError::Closed)),
            Ok(Some(sides)) => sides,
        };

        match Self::gate_recv(recv, token, *registered, false) {
            Gate::Deliver(err) => return Poll::Ready(Err(err)),
            Gate::Busy => return Poll::Ready(Err(StreamError::Busy)),
            Gate::Attempt => {}
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let outcome = match &mut entry.frames {
            Some(rx) => attempt_read_h3(proto, id, rx, buf),
            None => attempt_read_quic(proto, id, buf),
        };

        let StreamState::Open { recv, .. } = &mut entry.state else {
            unreachable!()
        };
        match outcome {
            Ok(ReadOutcome::Data(n)) => {
                *recv = RecvSide::ExpectingBody;
                Poll::Ready(Ok(n))
            }
            Ok(ReadOutcome::Blocked) => {
                match recv {
                    RecvSide::Body(side) => side.op.register(cx),
                    _ => *recv = RecvSide::Body(SideOp::new(token, cx)),
                }
                *registered = true;
                Poll::Pending
            }
            Ok(ReadOutcome::Eof) => {
                *recv = RecvSide::Shutdown {
                    op: None,
                    next: StreamError::Eof,
                };
                Poll::Ready(Err(StreamError::Eof))
            }
            Ok(ReadOutcome::Reset(code)) => {
                *recv = RecvSide::Shutdown {
                    op: None,
                    next: StreamError::Reset(code),
                };
                Poll::Ready(Err(StreamError::Reset(code)))
            }
            Err(err) => {
                *recv = RecvSide::Shutdown {
                    op: None,
                    next: err.clone(),
                };
                Poll::Ready(Err(err))
            }
        }
    }

    /// Read a header section (HTTP/3 mode).
    pub fn poll_read_headers(
        &mut self,
        cx: &mut Context<'_>,
        id: quinn_proto::StreamId,
        token: u64,
        registered: &mut bool,
    ) -> Poll<Result<Fields, StreamError>> {
        let Self { proto, streams, .. } = self;
        let Some(entry) = streams.get_mut(&id) else {
            return Poll::Ready(Err(StreamError::Closed));
        };

        let (recv, _send) = match checked_open(entry) {
            Err(err) => return Poll::Ready(Err(err)),
            Ok(None) => return Poll::Ready(Err(StreamError::Closed)),
            Ok(Some(sides)) => sides,
        };

        match Self::gate_recv(recv, token, *registered, true) {
            Gate::Deliver(err) => return Poll::Ready(Err(err)),
            Gate::Busy => return Poll::Ready(Err(StreamError::Busy)),
            Gate::Attempt => {}
        }

        let Some(rx) = &mut entry.frames else {
            // Raw QUIC streams carry no headers.
            return Poll::Ready(Err(StreamError::InvalidState));
        };

        let outcome = attempt_read_headers(proto, id, rx);
        let StreamState::Open { recv, .. } = &mut entry.state else {
            unreachable!()
        };
        match outcome {
            Ok(HeaderOutcome::Fields(fields)) => {
                *recv = RecvSide::ExpectingBody;
                Poll::Ready(Ok(fields))
            }
            Ok(HeaderOutcome::Blocked) => {
                match recv {
                    RecvSide::Header(side) => side.op.register(cx),
                    _ => *recv = RecvSide::Header(SideOp::new(token, cx)),
                }
                *registered = true;
                Poll::Pending
            }
            Ok(HeaderOutcome::Eof) => {
                *recv = RecvSide::Shutdown {
                    op: None,
                    next: StreamError::Eof,
                };
                Poll::Ready(Err(StreamError::Eof))
            }
            Ok(HeaderOutcome::Reset(code)) => {
                *recv = RecvSide::Shutdown {
                    op: None,
                    next: StreamError::Reset(code),
                };
                Poll::Ready(Err(StreamError::Reset(code)))
            }
            Err(err) => {
                *recv = RecvSide::Shutdown {
                    op: None,
                    next: err.clone(),
                };
                Poll::Ready(Err(err))
            }
        }
    }

    /// Write body bytes. Raw QUIC hands them straight to the protocol
    /// machine, bounded by the peer's credit; HTTP/3 frames them through
    /// the send queue, bounded by the effective pacing window.
    pub fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        id: quinn_proto::StreamId,
        token: u64,
        registered: &mut bool,
        buf: &[u8],
        wakers: &mut WakeList,
    ) -> Poll<Result<usize, StreamError>> {
        let http = self.http;
        {
            let Some(entry) = self.streams.get_mut(&id) else {
                return Poll::Ready(Err(StreamError::Closed));
            };

            let (_recv, send) = match checked_open(entry) {
                Err(err) => return Poll::Ready(Err(err)),
                Ok(None) => return Poll::Ready(Err(StreamError::Closed)),
                Ok(Some(sides)) => sides,
            };

            match send {
                SendSide::Shutdown { op, next } => {
                    if let Some(side) = op {
                        if side.token == token || !*registered {
                            let side = op.take().unwrap_or_else(|| unreachable!());
                            let next = next.clone();
                            let err = side.op.into_result().unwrap_or(next);
                            return Poll::Ready(Err(err));
                        }
                    }
                    return Poll::Ready(Err(next.clone()));
                }
                SendSide::ExpectingHeader => {
                    return Poll::Ready(Err(StreamError::InvalidState));
                }
                SendSide::Blocked(side) if side.token != token => {
                    return Poll::Ready(Err(StreamError::Busy));
                }
                SendSide::ExpectingBody | SendSide::Blocked(_) => {}
            }

            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            if !http {
                // Raw QUIC writes go straight to the protocol machine, so
                // the accepted count is bounded by the peer's actual
                // credit and a full window leaves further bytes pending.
                return self.poll_write_direct(cx, id, token, registered, buf, wakers);
            }

            let effective = self.flow.available().min(entry.window.available());
            if effective == 0 {
                let StreamState::Open { send, .. } = &mut entry.state else {
                    unreachable!()
                };
                match send {
                    SendSide::Blocked(side) => side.op.register(cx),
                    _ => *send = SendSide::Blocked(SideOp::new(token, cx)),
                }
                *registered = true;
                self.writers.park(id, cx.waker().clone());
                return Poll::Pending;
            }

            let n = effective.min(buf.len());
            self.flow.consume(n);
            entry.window.consume(n);

            entry.queued.push_back(QueuedChunk {
                data: data_frame_header(n),
                costed: false,
            });
            entry.queued.push_back(QueuedChunk {
                data: Bytes::copy_from_slice(&buf[..n]),
                costed: true,
            });

            let StreamState::Open { send, .. } = &mut entry.state else {
                unreachable!()
            };
            if matches!(send, SendSide::Blocked(_)) {
                *send = SendSide::ExpectingBody;
            }
            self.writers.cancel(id);
            self.flush_stream(id, wakers);

            Poll::Ready(Ok(n))
        }
    }

    /// Raw-QUIC write: hand bytes directly to the protocol machine. The
    /// return size is whatever the peer's credit admits right now; zero
    /// credit parks the writer until the window reopens.
    fn poll_write_direct(
        &mut self,
        cx: &mut Context<'_>,
        id: quinn_proto::StreamId,
        token: u64,
        registered: &mut bool,
        buf: &[u8],
        wakers: &mut WakeList,
    ) -> Poll<Result<usize, StreamError>> {
        // A pending FIN drains first so ordering holds.
        self.flush_stream(id, wakers);

        let Self {
            proto,
            streams,
            writers,
            ..
        } = self;
        let Some(entry) = streams.get_mut(&id) else {
            return Poll::Ready(Err(StreamError::Closed));
        };

        match proto.send_stream(id).write(buf) {
            Ok(n) if n > 0 => {
                if let StreamState::Open { send, .. } = &mut entry.state {
                    if matches!(send, SendSide::Blocked(_)) {
                        *send = SendSide::ExpectingBody;
                    }
                }
                writers.cancel(id);
                Poll::Ready(Ok(n))
            }
            Ok(_) | Err(quinn_proto::WriteError::Blocked) => {
                if let StreamState::Open { send, .. } = &mut entry.state {
                    match send {
                        SendSide::Blocked(side) => side.op.register(cx),
                        _ => *send = SendSide::Blocked(SideOp::new(token, cx)),
                    }
                }
                *registered = true;
                writers.park(id, cx.waker().clone());
                Poll::Pending
            }
            Err(quinn_proto::WriteError::Stopped(code)) => {
                writers.cancel(id);
                let code = code.into_inner();
                if let StreamState::Open { send, .. } = &mut entry.state {
                    *send = SendSide::Shutdown {
                        op: None,
                        next: StreamError::Stopped(code),
                    };
                }
                Poll::Ready(Err(StreamError::Stopped(code)))
            }
            Err(quinn_proto::WriteError::ClosedStream) => Poll::Ready(Err(StreamError::Closed)),
        }
    }

    /// Serialize a header section and hand it to the protocol machine.
    pub fn write_headers(
        &mut self,
        id: quinn_proto::StreamId,
        fields: &Fields,
        wakers: &mut WakeList,
    ) -> Result<(), StreamError> {
        let peer_cap = self
            .h3
            .as_ref()
            .and_then(|h3| h3.peer_max_field_section());

        let Some(entry) = self.streams.get_mut(&id) else {
            return Err(StreamError::Closed);
        };

        let (_recv, send) = match checked_open(entry)? {
            Some(sides) => sides,
            None => return Err(StreamError::Closed),
        };

        match send {
            SendSide::Shutdown { next, .. } => return Err(next.clone()),
            SendSide::Blocked(_) => return Err(StreamError::Busy),
            SendSide::ExpectingBody => return Err(StreamError::InvalidState),
            SendSide::ExpectingHeader => {}
        }

        if entry.frames.is_none() {
            return Err(StreamError::InvalidState);
        }

        // Serialize once; the compression state advances here.
        let mut section = BytesMut::new();
        qpack::encode(fields, &mut section);

        if let Some(cap) = peer_cap {
            if section.len() as u64 > cap {
                return Err(StreamError::FrameSize);
            }
        }

        entry.queued.push_back(QueuedChunk {
            data: headers_frame(&section),
            costed: false,
        });
        let StreamState::Open { send, .. } = &mut entry.state else {
            unreachable!()
        };
        *send = SendSide::ExpectingBody;

        self.flush_stream(id, wakers);
        Ok(())
    }

    /// Force queued bytes toward the wire.
    pub fn flush(
        &mut self,
        id: quinn_proto::StreamId,
        wakers: &mut WakeList,
    ) -> Result<(), StreamError> {
        {
            let Some(entry) = self.streams.get_mut(&id) else {
                return Err(StreamError::Closed);
            };
            match &entry.state {
                StreamState::Error(_) => {
                    let StreamState::Error(err) =
                        std::mem::replace(&mut entry.state, StreamState::Closed)
                    else {
                        unreachable!()
                    };
                    return Err(err);
                }
                StreamState::Closed => return Err(StreamError::Closed),
                _ => {}
            }
        }
        self.flush_stream(id, wakers);
        Ok(())
    }

    /// Half or full shutdown. Pending operations on the named sides
    /// complete with `aborted`; later submissions observe `closed`.
    pub fn shutdown(
        &mut self,
        id: quinn_proto::StreamId,
        read: bool,
        write: bool,
        wakers: &mut WakeList,
    ) -> Result<(), StreamError> {
        let Self {
            proto,
            streams,
            writers,
            ..
        } = self;
        let Some(entry) = streams.get_mut(&id) else {
            return Err(StreamError::Closed);
        };

        match &mut entry.state {
            StreamState::Error(_) => {
                let StreamState::Error(err) =
                    std::mem::replace(&mut entry.state, StreamState::Closed)
                else {
                    unreachable!()
                };
                return Err(err);
            }
            StreamState::Closed | StreamState::Closing(_) => return Err(StreamError::Closed),
            StreamState::Open { recv, send } => {
                if read {
                    let _ = proto
                        .recv_stream(id)
                        .stop(quinn_proto::VarInt::from_u32(0));
                    recv.cancel(StreamError::Aborted, StreamError::Closed, wakers);
                }
                if write {
                    entry.fin_pending = true;
                    send.cancel(StreamError::Aborted, StreamError::Closed, wakers);
                    writers.cancel(id);
                }
            }
        }

        if write {
            self.flush_stream(id, wakers);
        }
        Ok(())
    }

    /// Graceful close: stop reading, finish writing, wait for every byte
    /// to be acknowledged.
    pub fn poll_close(
        &mut self,
        cx: &mut Context<'_>,
        id: quinn_proto::StreamId,
        token: u64,
        registered: &mut bool,
        wakers: &mut WakeList,
    ) -> Poll<Result<(), StreamError>> {
        let Some(entry) = self.streams.get_mut(&id) else {
            return Poll::Ready(Err(StreamError::Closed));
        };

        match &mut entry.state {
            StreamState::Error(_) => {
                let StreamState::Error(err) =
                    std::mem::replace(&mut entry.state, StreamState::Closed)
                else {
                    unreachable!()
                };
                Poll::Ready(Err(err))
            }
            StreamState::Closed => {
                if *registered {
                    // Our close completed and a racing path collapsed the
                    // state; report success.
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(StreamError::Closed))
                }
            }
            StreamState::Closing(close) => {
                if close.token != token {
                    return Poll::Ready(Err(StreamError::InvalidState));
                }
                match crate::op::poll_slot(&mut close.op, cx) {
                    Poll::Ready(result) => {
                        entry.state = StreamState::Closed;
                        Poll::Ready(result)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            StreamState::Open { recv, send } => {
                // First submission: cancel whatever is pending, stop the
                // read side, and finish the write side.
                recv.cancel(StreamError::Aborted, StreamError::Closed, wakers);
                send.cancel(StreamError::Aborted, StreamError::Closed, wakers);
                let _ = self
                    .proto
                    .recv_stream(id)
                    .stop(quinn_proto::VarInt::from_u32(0));
                entry.fin_pending = true;
                self.writers.cancel(id);

                entry.state = StreamState::Closing(CloseOp {
                    token,
                    op: Op::new(cx),
                });
                *registered = true;
                self.flush_stream(id, wakers);
                Poll::Pending
            }
        }
    }

    /// Abort both sides immediately.
    pub fn reset_stream(&mut self, id: quinn_proto::StreamId, code: u64, wakers: &mut WakeList) {
        self.writers.cancel(id);
        let Self {
            proto,
            streams,
            flow,
            ..
        } = self;
        let Some(entry) = streams.get_mut(&id) else {
            return;
        };

        tracing::trace!(stream = ?id, code, "resetting stream");
        release_queued(entry, flow);
        entry.queued.clear();

        let code_v = quinn_proto::VarInt::from_u64(code).unwrap_or(quinn_proto::VarInt::MAX);
        let _ = proto.send_stream(id).reset(code_v);
        let _ = proto.recv_stream(id).stop(code_v);

        match &mut entry.state {
            StreamState::Open { recv, send } => {
                recv.cancel(StreamError::Aborted, StreamError::Closed, wakers);
                send.cancel(StreamError::Aborted, StreamError::Closed, wakers);
                entry.state = StreamState::Closed;
            }
            StreamState::Closing(_) => {
                let StreamState::Closing(close) =
                    std::mem::replace(&mut entry.state, StreamState::Closed)
                else {
                    unreachable!()
                };
                let (done, waker) = close.op.complete(Err(StreamError::Aborted));
                entry.state = StreamState::Closing(CloseOp {
                    token: close.token,
                    op: done.into_inner(),
                });
                wakers.push(waker);
            }
            _ => entry.state = StreamState::Closed,
        }
    }

    /// The public stream handle went away.
    pub fn release_stream(&mut self, id: quinn_proto::StreamId, wakers: &mut WakeList) {
        if let Some(entry) = self.streams.get(&id) {
            match entry.state {
                StreamState::Open { .. } | StreamState::Closing(_) => {
                    self.reset_stream(id, DROP_CODE, wakers);
                }
                _ => {}
            }
        }
        self.streams.remove(&id);
    }

    /// A read future was dropped mid-flight: free the receive side.
    pub fn abandon_recv(&mut self, id: quinn_proto::StreamId, token: u64) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        if let StreamState::Open { recv, .. } = &mut entry.state {
            match recv {
                RecvSide::Header(side) if side.token == token => {
                    *recv = RecvSide::ExpectingHeader;
                }
                RecvSide::Body(side) if side.token == token => {
                    *recv = RecvSide::ExpectingBody;
                }
                _ => {}
            }
        }
    }

    /// A write future was dropped mid-flight: free the send side.
    pub fn abandon_send(&mut self, id: quinn_proto::StreamId, token: u64) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        if let StreamState::Open { send, .. } = &mut entry.state {
            if let SendSide::Blocked(side) = send {
                if side.token == token {
                    *send = SendSide::ExpectingBody;
                    self.writers.cancel(id);
                }
            }
        }
    }

    pub fn set_priority(&mut self, id: quinn_proto::StreamId, priority: Priority) {
        if let Some(entry) = self.streams.get_mut(&id) {
            entry.priority = Some(priority);
        }
    }

    pub fn stream_is_open(&self, id: quinn_proto::StreamId) -> bool {
        self.streams.get(&id).map(|e| e.is_open()).unwrap_or(false)
    }
}

/// Credit un-flushed costed bytes back to the connection window so an
/// aborted stream does not leak send capacity.
fn release_queued(entry: &mut StreamEntry, flow: &mut Window) {
    let costed: usize = entry
        .queued
        .iter()
        .filter(|c| c.costed)
        .map(|c| c.data.len())
        .sum();
    if costed > 0 {
        let _ = flow.credit(costed as u64);
    }
    entry.queued.clear();
}

/// Resolve the outer stream state: `Ok(Some(sides))` when open,
/// `Ok(None)` when closed/closing, `Err` to deliver a stored error.
#[allow(clippy::type_complexity)]
fn checked_open(
    entry: &mut StreamEntry,
) -> Result<Option<(&mut RecvSide, &mut SendSide)>, StreamError> {
    if matches!(entry.state, StreamState::Error(_)) {
        let StreamState::Error(err) = std::mem::replace(&mut entry.state, StreamState::Closed)
        else {
            unreachable!()
        };
        return Err(err);
    }
    match &mut entry.state {
        StreamState::Closed | StreamState::Closing(_) => Ok(None),
        StreamState::Open { recv, send } => Ok(Some((recv, send))),
        StreamState::Error(_) => unreachable!(),
    }
}

// ---- read attempts against the protocol machine -------------------------

fn attempt_read_quic(
    proto: &mut quinn_proto::Connection,
    id: quinn_proto::StreamId,
    buf: &mut [u8],
) -> Result<ReadOutcome, StreamError> {
    let mut filled = 0;
    loop {
        if filled == buf.len() {
            return Ok(ReadOutcome::Data(filled));
        }
        match pull_chunk(proto, id, buf.len() - filled) {
            Pull::Data(bytes) => {
                buf[filled..filled + bytes.len()].copy_from_slice(&bytes);
                filled += bytes.len();
            }
            Pull::Blocked => {
                return Ok(if filled > 0 {
                    ReadOutcome::Data(filled)
                } else {
                    ReadOutcome::Blocked
                });
            }
            Pull::Fin | Pull::Closed => {
                return Ok(if filled > 0 {
                    ReadOutcome::Data(filled)
                } else {
                    ReadOutcome::Eof
                });
            }
            Pull::Reset(code) => {
                return Ok(if filled > 0 {
                    ReadOutcome::Data(filled)
                } else {
                    ReadOutcome::Reset(code)
                });
            }
        }
    }
}

fn attempt_read_h3(
    proto: &mut quinn_proto::Connection,
    id: quinn_proto::StreamId,
    rx: &mut FrameRx,
    buf: &mut [u8],
) -> Result<ReadOutcome, StreamError> {
    let mut filled = 0;
    loop {
        advance_frames(rx)?;
        match rx.stage {
            FrameStage::Data { remaining } => {
                // Bytes pulled past the frame header sit in `partial`.
                if !rx.partial.is_empty() {
                    let take = (remaining.min(rx.partial.len() as u64) as usize)
                        .min(buf.len() - filled);
                    buf[filled..filled + take].copy_from_slice(&rx.partial[..take]);
                    rx.partial.advance(take);
                    filled += take;
                    set_data_stage(rx, remaining - take as u64);
                    if filled == buf.len() {
                        return Ok(ReadOutcome::Data(filled));
                    }
                    continue;
                }

                if filled == buf.len() {
                    return Ok(ReadOutcome::Data(filled));
                }

                let want = (remaining as usize).min(buf.len() - filled);
                match pull_chunk(proto, id, want) {
                    Pull::Data(bytes) => {
                        buf[filled..filled + bytes.len()].copy_from_slice(&bytes);
                        filled += bytes.len();
                        set_data_stage(rx, remaining - bytes.len() as u64);
                    }
                    Pull::Blocked => {
                        return Ok(if filled > 0 {
                            ReadOutcome::Data(filled)
                        } else {
                            ReadOutcome::Blocked
                        });
                    }
                    Pull::Fin | Pull::Closed => {
                        return Err(StreamError::Frame("stream ended inside a frame".into()));
                    }
                    Pull::Reset(code) => {
                        return Ok(if filled > 0 {
                            ReadOutcome::Data(filled)
                        } else {
                            ReadOutcome::Reset(code)
                        });
                    }
                }
            }
            FrameStage::Header | FrameStage::Skip { .. } => {
                match pull_chunk(proto, id, 8192) {
                    Pull::Data(bytes) => rx.partial.extend_from_slice(&bytes),
                    Pull::Blocked => {
                        return Ok(if filled > 0 {
                            ReadOutcome::Data(filled)
                        } else {
                            ReadOutcome::Blocked
                        });
                    }
                    Pull::Fin | Pull::Closed => {
                        let clean = matches!(rx.stage, FrameStage::Header) && rx.partial.is_empty();
                        if clean {
                            return Ok(if filled > 0 {
                                ReadOutcome::Data(filled)
                            } else {
                                ReadOutcome::Eof
                            });
                        }
                        return Err(StreamError::Frame("stream ended inside a frame".into()));
                    }
                    Pull::Reset(code) => {
                        return Ok(if filled > 0 {
                            ReadOutcome::Data(filled)
                        } else {
                            ReadOutcome::Reset(code)
                        });
                    }
                }
            }
            FrameStage::Headers { .. } => {
                // A header section the application has not read yet.
                return Err(StreamError::InvalidState);
            }
        }
    }
}

fn set_data_stage(rx: &mut FrameRx, remaining: u64) {
    rx.stage = if remaining == 0 {
        FrameStage::Header
    } else {
        FrameStage::Data { remaining }
    };
}

fn attempt_read_headers(
    proto: &mut quinn_proto::Connection,
    id: quinn_proto::StreamId,
    rx: &mut FrameRx,
) -> Result<HeaderOutcome, StreamError> {
    loop {
        advance_frames(rx)?;
        match rx.stage {
            FrameStage::Headers { remaining } => {
                if rx.partial.len() as u64 >= remaining {
                    let payload = rx.partial.split_to(remaining as usize);
                    let fields = qpack::decode(&mut payload.freeze())
                        .map_err(|err| StreamError::Frame(err.to_string().into()))?;
                    rx.saw_headers = true;
                    rx.stage = FrameStage::Header;
                    tracing::trace!(count = fields.len(), "received headers");
                    return Ok(HeaderOutcome::Fields(fields));
                }
            }
            FrameStage::Data { .. } => {
                // DATA while we expect a header section.
                return Err(StreamError::Frame("DATA before HEADERS".into()));
            }
            FrameStage::Header | FrameStage::Skip { .. } => {}
        }

        match pull_chunk(proto, id, 8192) {
            Pull::Data(bytes) => rx.partial.extend_from_slice(&bytes),
            Pull::Blocked => return Ok(HeaderOutcome::Blocked),
            Pull::Fin | Pull::Closed => {
                let clean = matches!(rx.stage, FrameStage::Header) && rx.partial.is_empty();
                if clean {
                    return Ok(HeaderOutcome::Eof);
                }
                return Err(StreamError::Frame("stream ended inside a frame".into()));
            }
            Pull::Reset(code) => return Ok(HeaderOutcome::Reset(code)),
        }
    }
}
