//! Per-stream state: the outer lifecycle variant and the two per-side
//! sub-state machines, plus the HTTP/3 frame reader that sits between the
//! protocol machine's byte stream and the application's body reads.
//!
//! All transitions happen under the engine lock. Completion wakers are
//! handed back to the caller and woken after the lock drops.

use std::collections::VecDeque;
use std::task::Context;

use bytes::{Buf, Bytes, BytesMut};

use braid_proto::{Frame, VarInt, MAX_FRAME_SIZE};

use crate::error::StreamError;
use crate::flow::Window;
use crate::op::{Op, WakeList};

/// Error code sent when a stream handle is dropped without an explicit
/// finish or reset. "braid" in ascii.
pub(crate) const DROP_CODE: u64 = 0x62726169_64;

/// A pending operation on one side of a stream, tagged with the owning
/// future's token so re-polls are told apart from second submissions.
#[derive(Debug)]
pub(crate) struct SideOp {
    pub token: u64,
    pub op: Op<StreamError>,
}

impl SideOp {
    pub fn new(token: u64, cx: &mut Context<'_>) -> Self {
        Self {
            token,
            op: Op::new(cx),
        }
    }
}

/// The receiving sub-state machine.
///
/// HTTP/3 streams start at `ExpectingHeader`; raw QUIC streams start at
/// `ExpectingBody`. `Shutdown` keeps an uncollected cancelled operation
/// (delivered to the future that owns it, or to the next submission) and
/// the error every later submission observes.
#[derive(Debug)]
pub(crate) enum RecvSide {
    ExpectingHeader,
    Header(SideOp),
    ExpectingBody,
    Body(SideOp),
    Shutdown {
        op: Option<SideOp>,
        next: StreamError,
    },
}

impl RecvSide {
    /// Cancel whatever operation is pending, transitioning to `Shutdown`.
    ///
    /// Returns 1 if an operation was delivered, 0 otherwise; the caller
    /// uses the count to decide whether an error was consumed. A side that
    /// is already shut down keeps its original stored reason.
    pub fn cancel(&mut self, err: StreamError, next: StreamError, wakers: &mut WakeList) -> usize {
        match self {
            RecvSide::Header(_) | RecvSide::Body(_) => {
                let side = match std::mem::replace(
                    self,
                    RecvSide::Shutdown {
                        op: None,
                        next: next.clone(),
                    },
                ) {
                    RecvSide::Header(side) | RecvSide::Body(side) => side,
                    _ => unreachable!(),
                };
                let (done, waker) = side.op.complete(err);
                wakers.push(waker);
                *self = RecvSide::Shutdown {
                    op: Some(SideOp {
                        token: side.token,
                        op: done.into_inner(),
                    }),
                    next,
                };
                1
            }
            RecvSide::Shutdown { .. } => 0,
            _ => {
                *self = RecvSide::Shutdown { op: None, next };
                0
            }
        }
    }

    /// Wake a parked reader so it re-polls the protocol machine. The
    /// pending operation stays registered; the outcome is computed by the
    /// future under the engine lock.
    pub fn notify(&self, wakers: &mut WakeList) {
        if let RecvSide::Header(side) | RecvSide::Body(side) = self {
            wakers.push(side.op.waker());
        }
    }
}

/// The sending sub-state machine, mirrored.
///
/// `Blocked` is the in-flight body state: a write parked on the
/// flow-control window. Header writes serialize inline and never park.
#[derive(Debug)]
pub(crate) enum SendSide {
    ExpectingHeader,
    ExpectingBody,
    Blocked(SideOp),
    Shutdown {
        op: Option<SideOp>,
        next: StreamError,
    },
}

impl SendSide {
    pub fn cancel(&mut self, err: StreamError, next: StreamError, wakers: &mut WakeList) -> usize {
        match self {
            SendSide::Blocked(_) => {
                let side = match std::mem::replace(
                    self,
                    SendSide::Shutdown {
                        op: None,
                        next: next.clone(),
                    },
                ) {
                    SendSide::Blocked(side) => side,
                    _ => unreachable!(),
                };
                let (done, waker) = side.op.complete(err);
                wakers.push(waker);
                *self = SendSide::Shutdown {
                    op: Some(SideOp {
                        token: side.token,
                        op: done.into_inner(),
                    }),
                    next,
                };
                1
            }
            SendSide::Shutdown { .. } => 0,
            _ => {
                *self = SendSide::Shutdown { op: None, next };
                0
            }
        }
    }

    /// Wake a writer parked on the flow-control window.
    pub fn notify(&self, wakers: &mut WakeList) {
        if let SendSide::Blocked(side) = self {
            wakers.push(side.op.waker());
        }
    }
}

/// A chunk queued for the protocol machine. `costed` bytes were debited
/// from the flow-control windows and are credited back as the protocol
/// machine accepts them; frame headers ride for free.
#[derive(Debug)]
pub(crate) struct QueuedChunk {
    pub data: Bytes,
    pub costed: bool,
}

/// Progress of the inbound HTTP/3 frame parser on a request stream.
#[derive(Debug)]
pub(crate) enum FrameStage {
    /// Between frames; `partial` accumulates the next frame header.
    Header,
    /// Inside a DATA frame payload.
    Data { remaining: u64 },
    /// Inside a frame we discard (unknown, GREASE, trailers).
    Skip { remaining: u64 },
    /// Accumulating a HEADERS frame payload.
    Headers { remaining: u64 },
}

/// Frame-layer receive state for one HTTP/3 request stream.
#[derive(Debug)]
pub(crate) struct FrameRx {
    pub stage: FrameStage,
    /// Unparsed frame-header bytes, or the HEADERS payload being gathered.
    pub partial: BytesMut,
    /// Whether a HEADERS frame was already consumed (so a later HEADERS is
    /// a trailer section ending the body).
    pub saw_headers: bool,
}

impl FrameRx {
    pub fn new() -> Self {
        Self {
            stage: FrameStage::Header,
            partial: BytesMut::new(),
            saw_headers: false,
        }
    }
}

/// The graceful-close operation, tagged like side operations.
#[derive(Debug)]
pub(crate) struct CloseOp {
    pub token: u64,
    pub op: Op<Result<(), StreamError>>,
}

/// Outer stream lifecycle.
///
/// `incoming`, `accepting`, and `connecting` live as queues on the owning
/// connection; an entry exists from the moment a stream is open.
#[derive(Debug)]
pub(crate) enum StreamState {
    Open { recv: RecvSide, send: SendSide },
    /// Graceful close in flight: waiting for every sent byte to be acked.
    Closing(CloseOp),
    /// A connection-level error stored for the next operation.
    Error(StreamError),
    Closed,
}

#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub id: quinn_proto::StreamId,
    pub state: StreamState,

    /// Send-side pacing window; debited when a write is accepted, credited
    /// as the protocol machine drains the queue.
    pub window: Window,

    /// Data committed but not yet accepted by the protocol machine.
    pub queued: VecDeque<QueuedChunk>,

    /// FIN requested (graceful close or shutdown(write)).
    pub fin_pending: bool,
    /// FIN handed to the protocol machine.
    pub fin_sent: bool,
    /// Every sent byte (and the FIN) has been acknowledged.
    pub acked: bool,

    /// Inbound frame parser, present in HTTP/3 mode.
    pub frames: Option<FrameRx>,

    /// Priority metadata; stored, never used for ordering.
    pub priority: Option<Priority>,
}

/// Stream priority, stored for a future re-prioritizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub urgency: u8,
    pub incremental: bool,
}

impl StreamEntry {
    pub fn new(id: quinn_proto::StreamId, http: bool, window: u32) -> Self {
        let (recv, send) = if http {
            (RecvSide::ExpectingHeader, SendSide::ExpectingHeader)
        } else {
            (RecvSide::ExpectingBody, SendSide::ExpectingBody)
        };
        Self {
            id,
            state: StreamState::Open { recv, send },
            window: Window::new(window),
            queued: VecDeque::new(),
            fin_pending: false,
            fin_sent: false,
            acked: false,
            frames: http.then(FrameRx::new),
            priority: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open { .. })
    }

    /// Bytes queued but not yet accepted by the protocol machine.
    pub fn queued_bytes(&self) -> usize {
        self.queued.iter().map(|c| c.data.len()).sum()
    }

    /// Cancel both sides, completing pending operations with `err` and
    /// leaving `next` for later submissions. Returns how many operations
    /// were delivered.
    pub fn cancel_both(
        &mut self,
        err: StreamError,
        next: StreamError,
        wakers: &mut WakeList,
    ) -> usize {
        match &mut self.state {
            StreamState::Open { recv, send } => {
                recv.cancel(err.clone(), next.clone(), wakers)
                    + send.cancel(err, next, wakers)
            }
            StreamState::Closing(_) => {
                let StreamState::Closing(close) =
                    std::mem::replace(&mut self.state, StreamState::Closed)
                else {
                    unreachable!()
                };
                let (done, waker) = close.op.complete(Err(err));
                wakers.push(waker);
                self.state = StreamState::Closing(CloseOp {
                    token: close.token,
                    op: done.into_inner(),
                });
                1
            }
            _ => 0,
        }
    }

    /// A connection-level error fans out to this stream. If no operation
    /// consumed it, the error is stored for the next submission.
    pub fn on_conn_error(&mut self, err: StreamError, wakers: &mut WakeList) -> usize {
        let delivered = self.cancel_both(err.clone(), err.clone(), wakers);
        if delivered == 0 && matches!(self.state, StreamState::Open { .. }) {
            self.state = StreamState::Error(err);
        }
        delivered
    }
}

/// Parse as much of the inbound frame stream as `partial` allows,
/// advancing `stage`. Returns an error on malformed framing.
///
/// This only interprets frame headers; payload bytes are consumed by the
/// read path according to the stage.
pub(crate) fn advance_frames(rx: &mut FrameRx) -> Result<(), StreamError> {
    loop {
        match rx.stage {
            FrameStage::Header => {
                let mut cursor = &rx.partial[..];
                let Ok((typ, len)) = Frame::read_header(&mut cursor) else {
                    // Not enough bytes for the header yet.
                    return Ok(());
                };
                let consumed = rx.partial.len() - cursor.remaining();
                rx.partial.advance(consumed);

                if typ == Frame::DATA {
                    if !rx.saw_headers {
                        return Err(StreamError::Frame("DATA before HEADERS".into()));
                    }
                    if len > 0 {
                        rx.stage = FrameStage::Data { remaining: len };
                        return Ok(());
                    }
                } else if typ == Frame::HEADERS {
                    if len > MAX_FRAME_SIZE {
                        return Err(StreamError::Frame("HEADERS frame too large".into()));
                    }
                    if rx.saw_headers {
                        // Trailer section: ends the body, content discarded.
                        tracing::trace!(len, "skipping trailer section");
                        rx.stage = FrameStage::Skip { remaining: len };
                    } else {
                        rx.stage = FrameStage::Headers { remaining: len };
                        return Ok(());
                    }
                } else if typ == Frame::PUSH_PROMISE {
                    return Err(StreamError::Frame("unexpected PUSH_PROMISE".into()));
                } else if typ == Frame::SETTINGS || typ == Frame::GOAWAY {
                    // Control-stream frames are invalid on a request stream.
                    return Err(StreamError::Frame("control frame on request stream".into()));
                } else {
                    // Unknown and GREASE frames are skipped.
                    tracing::trace!(frame = ?typ, len, "skipping frame");
                    rx.stage = FrameStage::Skip { remaining: len };
                }
            }
            FrameStage::Skip { remaining } => {
                let take = (rx.partial.len() as u64).min(remaining);
                rx.partial.advance(take as usize);
                let left = remaining - take;
                if left == 0 {
                    rx.stage = FrameStage::Header;
                } else {
                    rx.stage = FrameStage::Skip { remaining: left };
                    return Ok(());
                }
            }
            FrameStage::Data { .. } | FrameStage::Headers { .. } => return Ok(()),
        }
    }
}

/// Encode a DATA frame header for a payload of `len` bytes.
pub(crate) fn data_frame_header(len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    Frame::DATA.encode(&mut buf);
    VarInt::try_from(len)
        .expect("payload bounded by the flow-control window")
        .encode(&mut buf);
    buf.freeze()
}

/// Encode a HEADERS frame around an already-serialized field section.
pub(crate) fn headers_frame(section: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(section.len() + 10);
    Frame::HEADERS.write(section, &mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn rx_with(bytes: &[u8], saw_headers: bool) -> FrameRx {
        let mut rx = FrameRx::new();
        rx.saw_headers = saw_headers;
        rx.partial.put_slice(bytes);
        rx
    }

    #[test]
    fn parses_data_header() {
        let mut buf = BytesMut::new();
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(5).encode(&mut buf);

        let mut rx = rx_with(&buf, true);
        advance_frames(&mut rx).unwrap();
        assert!(matches!(rx.stage, FrameStage::Data { remaining: 5 }));
        assert!(rx.partial.is_empty());
    }

    #[test]
    fn data_before_headers_is_an_error() {
        let mut buf = BytesMut::new();
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(1).encode(&mut buf);

        let mut rx = rx_with(&buf, false);
        assert!(matches!(
            advance_frames(&mut rx),
            Err(StreamError::Frame(_))
        ));
    }

    #[test]
    fn skips_unknown_frames() {
        let mut buf = BytesMut::new();
        // GREASE frame with a 3-byte payload, then DATA.
        VarInt::from_u32(0x21).encode(&mut buf);
        VarInt::from_u32(3).encode(&mut buf);
        buf.put_slice(b"xyz");
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(2).encode(&mut buf);

        let mut rx = rx_with(&buf, true);
        advance_frames(&mut rx).unwrap();
        assert!(matches!(rx.stage, FrameStage::Data { remaining: 2 }));
    }

    #[test]
    fn incomplete_header_waits() {
        // A 2-byte length varint cut in half.
        let mut buf = BytesMut::new();
        Frame::DATA.encode(&mut buf);
        buf.put_u8(0x7b); // first byte of a 2-byte varint

        let mut rx = rx_with(&buf[..1], true);
        advance_frames(&mut rx).unwrap();
        assert!(matches!(rx.stage, FrameStage::Header));
        assert_eq!(rx.partial.len(), 1);
    }

    #[test]
    fn trailers_are_skipped() {
        let mut buf = BytesMut::new();
        Frame::HEADERS.encode(&mut buf);
        VarInt::from_u32(2).encode(&mut buf);
        buf.put_slice(&[0, 0]);

        let mut rx = rx_with(&buf, true);
        advance_frames(&mut rx).unwrap();
        assert!(matches!(rx.stage, FrameStage::Header));
        assert!(rx.partial.is_empty());
    }

    #[test]
    fn zero_length_data_frames_collapse() {
        let mut buf = BytesMut::new();
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(0).encode(&mut buf);
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(4).encode(&mut buf);

        let mut rx = rx_with(&buf, true);
        advance_frames(&mut rx).unwrap();
        assert!(matches!(rx.stage, FrameStage::Data { remaining: 4 }));
    }
}
