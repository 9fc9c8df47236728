//! HTTP/3 connection plumbing: the control streams, the SETTINGS
//! exchange, GOAWAY, and the unidirectional streams the protocol keeps to
//! itself (QPACK encoder/decoder streams are accepted and drained).
//!
//! Request streams never touch this module; their framing lives with the
//! stream state machines.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};

use braid_proto::{code, Frame, Setting, Settings, StreamUni, VarInt};

use crate::conn::{pull_chunk, Pull};
use crate::error::ConnectionError;

/// Something the control stream told us that the connection must act on.
#[derive(Debug)]
pub(crate) enum H3Event {
    /// The peer's SETTINGS arrived; connection-wide parameters re-base.
    PeerSettings,
    /// The peer sent GOAWAY: it will not accept streams at or above `id`.
    PeerGoaway(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UniKind {
    /// Stream type varint not complete yet.
    Unknown,
    /// The peer's control stream.
    Control,
    /// A stream we keep open but ignore (QPACK encoder/decoder).
    Drain,
}

#[derive(Debug)]
struct UniStream {
    kind: UniKind,
    buf: BytesMut,
}

fn app_error(code: u64) -> ConnectionError {
    ConnectionError::Application { code }
}

#[derive(Debug)]
pub(crate) struct H3Conn {
    /// Our control stream, opened at handshake completion.
    ctrl_out: Option<quinn_proto::StreamId>,
    /// Control bytes waiting for the protocol machine.
    ctrl_buf: VecDeque<Bytes>,

    /// Peer-initiated unidirectional streams.
    unis: HashMap<quinn_proto::StreamId, UniStream>,
    peer_ctrl: Option<quinn_proto::StreamId>,

    /// The peer's SETTINGS, once the control stream delivers them.
    peer_settings: Option<Settings>,

    /// The SETTINGS we advertise.
    settings: Settings,

    goaway_sent: bool,
}

impl H3Conn {
    pub fn new(max_field_section_size: u64) -> Self {
        let mut settings = Settings::default();
        settings.insert(
            Setting::MAX_FIELD_SECTION_SIZE,
            VarInt::try_from(max_field_section_size).unwrap_or(VarInt::MAX),
        );
        Self {
            ctrl_out: None,
            ctrl_buf: VecDeque::new(),
            unis: HashMap::new(),
            peer_ctrl: None,
            peer_settings: None,
            settings,
            goaway_sent: false,
        }
    }

    /// The peer's advertised cap on serialized field sections.
    pub fn peer_max_field_section(&self) -> Option<u64> {
        self.peer_settings.as_ref()?.max_field_section_size()
    }

    /// Handshake completed: open the control stream and queue SETTINGS.
    pub fn on_connected(
        &mut self,
        proto: &mut quinn_proto::Connection,
    ) -> Result<(), ConnectionError> {
        if self.ctrl_out.is_some() {
            return Ok(());
        }

        let Some(id) = proto.streams().open(quinn_proto::Dir::Uni) else {
            // The peer forbids unidirectional streams entirely, which makes
            // HTTP/3 impossible.
            return Err(app_error(code::H3_STREAM_CREATION_ERROR));
        };

        tracing::debug!(stream = ?id, "opening control stream");
        self.ctrl_out = Some(id);

        let mut buf = BytesMut::new();
        self.settings.encode_control(&mut buf);
        // SETTINGS must be the first frame even if a GOAWAY was queued
        // before the handshake completed.
        self.ctrl_buf.push_front(buf.freeze());
        self.flush(proto)
    }

    /// Queue a GOAWAY advertising that requests at or above `next_request`
    /// will not be processed. Sent once; later calls are no-ops.
    pub fn queue_goaway(&mut self, next_request: u64) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;

        tracing::debug!(id = next_request, "sending GOAWAY");
        let mut payload = BytesMut::new();
        VarInt::try_from(next_request)
            .unwrap_or(VarInt::MAX)
            .encode(&mut payload);

        let mut buf = BytesMut::new();
        Frame::GOAWAY.write(&payload, &mut buf);
        self.ctrl_buf.push_back(buf.freeze());
    }

    /// Drain queued control bytes into the protocol machine.
    pub fn flush(&mut self, proto: &mut quinn_proto::Connection) -> Result<(), ConnectionError> {
        let Some(id) = self.ctrl_out else {
            return Ok(());
        };

        while let Some(chunk) = self.ctrl_buf.front_mut() {
            match proto.send_stream(id).write(chunk) {
                Ok(n) => {
                    chunk.advance(n);
                    if chunk.is_empty() {
                        self.ctrl_buf.pop_front();
                    }
                }
                Err(quinn_proto::WriteError::Blocked) => break,
                Err(_) => {
                    // The peer killed our control stream.
                    return Err(app_error(code::H3_CLOSED_CRITICAL_STREAM));
                }
            }
        }
        Ok(())
    }

    /// Is this one of the streams this module owns?
    pub fn is_internal(&self, id: quinn_proto::StreamId) -> bool {
        self.ctrl_out == Some(id) || self.unis.contains_key(&id)
    }

    /// A peer-initiated unidirectional stream appeared.
    pub fn on_uni_opened(&mut self, id: quinn_proto::StreamId) {
        self.unis.insert(
            id,
            UniStream {
                kind: UniKind::Unknown,
                buf: BytesMut::new(),
            },
        );
    }

    /// One of our unidirectional streams is readable.
    pub fn on_readable(
        &mut self,
        proto: &mut quinn_proto::Connection,
        id: quinn_proto::StreamId,
        events: &mut Vec<H3Event>,
    ) -> Result<(), ConnectionError> {
        loop {
            if !self.unis.contains_key(&id) {
                return Ok(());
            }

            match pull_chunk(proto, id, 8192) {
                Pull::Data(bytes) => {
                    let Some(uni) = self.unis.get_mut(&id) else {
                        return Ok(());
                    };
                    if uni.kind == UniKind::Drain {
                        continue;
                    }
                    uni.buf.extend_from_slice(&bytes);

                    if uni.kind == UniKind::Unknown {
                        let mut cursor = &uni.buf[..];
                        let Ok(typ) = StreamUni::decode(&mut cursor) else {
                            continue; // need more bytes for the type varint
                        };
                        let consumed = uni.buf.len() - cursor.remaining();
                        uni.buf.advance(consumed);

                        if typ == StreamUni::CONTROL {
                            if self.peer_ctrl.is_some() {
                                return Err(app_error(code::H3_STREAM_CREATION_ERROR));
                            }
                            tracing::debug!(stream = ?id, "peer control stream");
                            self.peer_ctrl = Some(id);
                            if let Some(uni) = self.unis.get_mut(&id) {
                                uni.kind = UniKind::Control;
                            }
                        } else if typ == StreamUni::QPACK_ENCODER
                            || typ == StreamUni::QPACK_DECODER
                        {
                            uni.kind = UniKind::Drain;
                            uni.buf.clear();
                        } else {
                            // Push streams and unknown types: refuse to read.
                            tracing::debug!(stream = ?id, ?typ, "refusing uni stream");
                            let code =
                                quinn_proto::VarInt::from_u32(code::H3_STREAM_CREATION_ERROR as u32);
                            let _ = proto.recv_stream(id).stop(code);
                            self.unis.remove(&id);
                            return Ok(());
                        }
                    }

                    if self.unis.get(&id).map(|u| u.kind) == Some(UniKind::Control) {
                        self.parse_control(id, events)?;
                    }
                }
                Pull::Blocked | Pull::Closed => return Ok(()),
                Pull::Fin | Pull::Reset(_) => {
                    let critical = self.peer_ctrl == Some(id);
                    self.unis.remove(&id);
                    if critical {
                        return Err(app_error(code::H3_CLOSED_CRITICAL_STREAM));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Parse complete frames off the peer control stream buffer.
    fn parse_control(
        &mut self,
        id: quinn_proto::StreamId,
        events: &mut Vec<H3Event>,
    ) -> Result<(), ConnectionError> {
        loop {
            let Some(uni) = self.unis.get_mut(&id) else {
                return Ok(());
            };

            let mut cursor = &uni.buf[..];
            let Ok((typ, len)) = Frame::read_header(&mut cursor) else {
                return Ok(());
            };
            if len > braid_proto::MAX_FRAME_SIZE {
                return Err(app_error(code::H3_FRAME_ERROR));
            }
            if (cursor.remaining() as u64) < len {
                return Ok(()); // wait for the full payload
            }

            let header_len = uni.buf.len() - cursor.remaining();
            uni.buf.advance(header_len);
            let mut payload = uni.buf.split_to(len as usize).freeze();

            if self.peer_settings.is_none() {
                // SETTINGS must be the first frame on the control stream.
                if typ != Frame::SETTINGS {
                    return Err(app_error(code::H3_MISSING_SETTINGS));
                }
                let settings = Settings::decode(&mut payload)
                    .map_err(|_| app_error(code::H3_SETTINGS_ERROR))?;
                tracing::debug!(?settings, "received SETTINGS");
                self.peer_settings = Some(settings);
                events.push(H3Event::PeerSettings);
                continue;
            }

            if typ == Frame::SETTINGS {
                return Err(app_error(code::H3_FRAME_UNEXPECTED));
            } else if typ == Frame::GOAWAY {
                let goaway = VarInt::decode(&mut payload)
                    .map_err(|_| app_error(code::H3_FRAME_ERROR))?;
                tracing::debug!(id = goaway.into_inner(), "received GOAWAY");
                events.push(H3Event::PeerGoaway(goaway.into_inner()));
            } else if typ == Frame::DATA || typ == Frame::HEADERS || typ == Frame::PUSH_PROMISE {
                return Err(app_error(code::H3_FRAME_UNEXPECTED));
            } else {
                tracing::trace!(frame = ?typ, "ignoring control frame");
            }
        }
    }
}
