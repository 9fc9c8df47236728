use std::fmt::{self, Debug};

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use super::{VarInt, VarIntUnexpectedEnd};

/// The largest frame payload we will buffer in memory.
///
/// DATA payloads stream through without buffering; this bounds everything
/// else (HEADERS, SETTINGS, GOAWAY).
pub const MAX_FRAME_SIZE: u64 = 0x10000;

/// An HTTP/3 frame type, per RFC 9114 section 7.2.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(pub VarInt);

macro_rules! frames {
    {$($name:ident = $val:expr,)*} => {
        impl Frame {
            $(pub const $name: Frame = Frame(VarInt::from_u32($val));)*
        }
    }
}

frames! {
    DATA = 0x0,
    HEADERS = 0x1,
    CANCEL_PUSH = 0x3,
    SETTINGS = 0x4,
    PUSH_PROMISE = 0x5,
    GOAWAY = 0x7,
    MAX_PUSH_ID = 0xd,
}

impl Frame {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Frame(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    // Reference: https://datatracker.ietf.org/doc/html/rfc9114#section-7.2.8
    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Frame::DATA => write!(f, "DATA"),
            Frame::HEADERS => write!(f, "HEADERS"),
            Frame::CANCEL_PUSH => write!(f, "CANCEL_PUSH"),
            Frame::SETTINGS => write!(f, "SETTINGS"),
            Frame::PUSH_PROMISE => write!(f, "PUSH_PROMISE"),
            Frame::GOAWAY => write!(f, "GOAWAY"),
            Frame::MAX_PUSH_ID => write!(f, "MAX_PUSH_ID"),
            x if x.is_grease() => write!(f, "GREASE FRAME [{:x?}]", x.0.into_inner()),
            x => write!(f, "UNKNOWN FRAME [{:x?}]", x.0.into_inner()),
        }
    }
}

/// A unidirectional stream type, per RFC 9114 section 6.2.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamUni(pub VarInt);

macro_rules! stream_unis {
    {$($name:ident = $val:expr,)*} => {
        impl StreamUni {
            $(pub const $name: StreamUni = StreamUni(VarInt::from_u32($val));)*
        }
    }
}

stream_unis! {
    CONTROL = 0x0,
    PUSH = 0x1,
    QPACK_ENCODER = 0x2,
    QPACK_DECODER = 0x3,
}

impl StreamUni {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(StreamUni(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

impl Debug for StreamUni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StreamUni::CONTROL => write!(f, "CONTROL"),
            StreamUni::PUSH => write!(f, "PUSH"),
            StreamUni::QPACK_ENCODER => write!(f, "QPACK_ENCODER"),
            StreamUni::QPACK_DECODER => write!(f, "QPACK_DECODER"),
            x if x.is_grease() => write!(f, "GREASE STREAM [{:x?}]", x.0.into_inner()),
            x => write!(f, "UNKNOWN STREAM [{:x?}]", x.0.into_inner()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("frame too large")]
    TooLarge,
}

impl From<VarIntUnexpectedEnd> for FrameError {
    fn from(_: VarIntUnexpectedEnd) -> Self {
        FrameError::UnexpectedEnd
    }
}

impl Frame {
    /// Decode a frame header, returning the type and payload length.
    ///
    /// Consumes nothing on [FrameError::UnexpectedEnd] if `buf` is rewindable;
    /// callers hand in a cloned cursor and commit on success.
    pub fn read_header<B: Buf>(buf: &mut B) -> Result<(Self, u64), VarIntUnexpectedEnd> {
        let typ = Frame::decode(buf)?;
        let len = VarInt::decode(buf)?;
        Ok((typ, len.into_inner()))
    }

    /// Decode a full frame, payload included.
    pub fn read<B: Buf>(buf: &mut B) -> Result<(Self, Bytes), FrameError> {
        let (typ, len) = Self::read_header(buf)?;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge);
        }
        if buf.remaining() < len as usize {
            return Err(FrameError::UnexpectedEnd);
        }
        Ok((typ, buf.copy_to_bytes(len as usize)))
    }

    /// Encode a frame header followed by its payload.
    pub fn write<B: BufMut>(&self, payload: &[u8], buf: &mut B) {
        self.encode(buf);
        VarInt::try_from(payload.len())
            .expect("frame payload too large")
            .encode(buf);
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn roundtrip() {
        let mut buf = BytesMut::new();
        Frame::GOAWAY.write(&[0x04], &mut buf);

        let mut cursor = buf.freeze();
        let (typ, payload) = Frame::read(&mut cursor).unwrap();
        assert_eq!(typ, Frame::GOAWAY);
        assert_eq!(&payload[..], &[0x04]);
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn partial_header() {
        let mut buf = BytesMut::new();
        Frame::HEADERS.encode(&mut buf);
        // length varint missing entirely
        let mut cursor = buf.freeze();
        assert!(Frame::read_header(&mut cursor).is_err());
    }

    #[test]
    fn partial_payload() {
        let mut buf = BytesMut::new();
        Frame::HEADERS.encode(&mut buf);
        VarInt::from_u32(10).encode(&mut buf);
        buf.put_slice(b"short");

        let mut cursor = buf.freeze();
        assert_eq!(Frame::read(&mut cursor), Err(FrameError::UnexpectedEnd));
    }

    #[test]
    fn oversized() {
        let mut buf = BytesMut::new();
        Frame::SETTINGS.encode(&mut buf);
        VarInt::try_from(MAX_FRAME_SIZE + 1).unwrap().encode(&mut buf);

        let mut cursor = buf.freeze();
        assert_eq!(Frame::read(&mut cursor), Err(FrameError::TooLarge));
    }

    #[test]
    fn grease() {
        assert!(Frame(VarInt::from_u32(0x21)).is_grease());
        assert!(Frame(VarInt::from_u32(0x21 + 0x1f)).is_grease());
        assert!(!Frame::DATA.is_grease());
        assert!(!Frame(VarInt::from_u32(0x20)).is_grease());
        assert!(StreamUni(VarInt::from_u32(0x40)).is_grease());
    }
}
