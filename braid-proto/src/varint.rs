use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// The decode buffer ran out before the full integer arrived.
///
/// This is not fatal; callers typically wait for more data and retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unexpected end of input")]
pub struct VarIntUnexpectedEnd;

/// The value is too large to be encoded as a QUIC varint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

/// An integer less than 2^62, encoded per RFC 9000 section 16.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(u64);

impl VarInt {
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Construct from a u32, which always fits.
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// The number of bytes this value occupies on the wire.
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < (1 << 6) {
            1
        } else if x < (1 << 14) {
            2
        } else if x < (1 << 30) {
            4
        } else {
            8
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(VarIntUnexpectedEnd);
        }

        let first = buf.chunk()[0];
        let len = 1 << (first >> 6);
        if buf.remaining() < len {
            return Err(VarIntUnexpectedEnd);
        }

        let mut value = (buf.get_u8() & 0b0011_1111) as u64;
        for _ in 1..len {
            value = (value << 8) | buf.get_u8() as u64;
        }

        Ok(Self(value))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let x = self.0;
        if x < (1 << 6) {
            buf.put_u8(x as u8);
        } else if x < (1 << 14) {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < (1 << 30) {
            buf.put_u32(0b10 << 30 | x as u32);
        } else {
            debug_assert!(x < (1 << 62), "varint out of bounds");
            buf.put_u64(0b11 << 62 | x);
        }
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value <= Self::MAX.0 {
            Ok(Self(value))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::try_from(value as u64)
    }
}

impl From<u32> for VarInt {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl From<VarInt> for u64 {
    fn from(value: VarInt) -> Self {
        value.0
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(value: u64) -> usize {
        let v = VarInt::try_from(value).unwrap();
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.size());

        let mut cursor = buf.freeze();
        let decoded = VarInt::decode(&mut cursor).unwrap();
        assert_eq!(decoded.into_inner(), value);
        assert!(!cursor.has_remaining());
        v.size()
    }

    #[test]
    fn encoding_widths() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 4);
        assert_eq!(roundtrip(1073741823), 4);
        assert_eq!(roundtrip(1073741824), 8);
        assert_eq!(roundtrip((1 << 62) - 1), 8);
    }

    #[test]
    fn out_of_bounds() {
        assert!(VarInt::try_from(1u64 << 62).is_err());
        assert!(VarInt::try_from(u64::MAX).is_err());
    }

    #[test]
    fn truncated() {
        let mut buf = BytesMut::new();
        VarInt::from_u32(16384).encode(&mut buf);
        let buf = buf.freeze();

        // Every strict prefix fails without consuming anything.
        for len in 0..buf.len() {
            let mut partial = buf.slice(..len);
            assert_eq!(VarInt::decode(&mut partial), Err(VarIntUnexpectedEnd));
        }
    }

    #[test]
    fn rfc_vectors() {
        // RFC 9000 appendix A.1 sample encodings.
        let cases: &[(u64, &[u8])] = &[
            (151_288_809_941_952_652, &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]),
            (494_878_333, &[0x9d, 0x7f, 0x3e, 0x7d]),
            (15_293, &[0x7b, 0xbd]),
            (37, &[0x25]),
        ];
        for (value, bytes) in cases {
            let mut buf = BytesMut::new();
            VarInt::try_from(*value).unwrap().encode(&mut buf);
            assert_eq!(&buf[..], *bytes);

            let mut cursor = &bytes[..];
            assert_eq!(VarInt::decode(&mut cursor).unwrap().into_inner(), *value);
        }
    }
}
