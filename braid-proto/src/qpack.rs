//! QPACK field-section coding, static table only.
//!
//! The dynamic table is never negotiated (QPACK_MAX_TABLE_CAPACITY stays 0),
//! so a field section is a pure function of the field list: a two-byte
//! prefix followed by indexed or literal field lines referencing the RFC
//! 9204 Appendix A static table.

use bytes::{Buf, BufMut};
use thiserror::Error;

use super::{Field, Fields};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QpackError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("invalid static table index {0}")]
    InvalidIndex(u64),

    #[error("dynamic table references are not supported")]
    DynamicTable,

    #[error("huffman-coded strings are not supported")]
    Huffman,

    #[error("string is not valid utf-8")]
    InvalidString,

    #[error("integer overflow")]
    IntegerOverflow,
}

// RFC 9204 appendix A.
static STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

/// Find an exact (name, value) match in the static table.
fn find_entry(name: &str, value: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|(n, v)| *n == name && *v == value)
        .map(|i| i as u64)
}

/// Find a name-only match in the static table.
fn find_name(name: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|(n, _)| *n == name)
        .map(|i| i as u64)
}

// Prefix integers, RFC 7541 section 5.1.

fn encode_int<B: BufMut>(value: u64, prefix: u8, first: u8, buf: &mut B) {
    let max = (1u64 << prefix) - 1;
    if value < max {
        buf.put_u8(first | value as u8);
        return;
    }

    buf.put_u8(first | max as u8);
    let mut value = value - max;
    while value >= 128 {
        buf.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn decode_int<B: Buf>(first: u8, prefix: u8, buf: &mut B) -> Result<u64, QpackError> {
    let max = (1u64 << prefix) - 1;
    let mut value = (first as u64) & max;
    if value < max {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(QpackError::UnexpectedEnd);
        }
        let byte = buf.get_u8();
        value = value
            .checked_add(((byte & 0x7f) as u64) << shift)
            .ok_or(QpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 62 {
            return Err(QpackError::IntegerOverflow);
        }
    }
}

// String literals. We never emit huffman coding; the H bit sits just above
// the length prefix.

fn encode_string<B: BufMut>(s: &str, prefix: u8, first: u8, buf: &mut B) {
    encode_int(s.len() as u64, prefix, first, buf);
    buf.put_slice(s.as_bytes());
}

fn decode_string<B: Buf>(first: u8, prefix: u8, buf: &mut B) -> Result<String, QpackError> {
    let huffman = first & (1 << prefix) != 0;
    if huffman {
        return Err(QpackError::Huffman);
    }

    let len = decode_int(first, prefix, buf)? as usize;
    if buf.remaining() < len {
        return Err(QpackError::UnexpectedEnd);
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| QpackError::InvalidString)
}

/// Encode a field list as a QPACK field section.
pub fn encode<B: BufMut>(fields: &Fields, buf: &mut B) {
    // Field section prefix: required insert count 0, delta base 0.
    buf.put_u8(0);
    buf.put_u8(0);

    for field in fields {
        encode_field(field, buf);
    }
}

fn encode_field<B: BufMut>(field: &Field, buf: &mut B) {
    let name = field.name().to_ascii_lowercase();

    if !field.never_index() {
        if let Some(index) = find_entry(&name, field.value()) {
            // Indexed field line, static table.
            encode_int(index, 6, 0b1100_0000, buf);
            return;
        }
    }

    let never = if field.never_index() { 0b0010_0000 } else { 0 };

    if let Some(index) = find_name(&name) {
        // Literal field line with static name reference.
        encode_int(index, 4, 0b0101_0000 | never, buf);
        encode_string(field.value(), 7, 0, buf);
        return;
    }

    // Literal field line with literal name.
    let never = if field.never_index() { 0b0001_0000 } else { 0 };
    encode_string(&name, 3, 0b0010_0000 | never, buf);
    encode_string(field.value(), 7, 0, buf);
}

/// Decode a QPACK field section into a field list.
pub fn decode<B: Buf>(buf: &mut B) -> Result<Fields, QpackError> {
    if !buf.has_remaining() {
        return Err(QpackError::UnexpectedEnd);
    }

    // Field section prefix. A non-zero required insert count means the
    // encoder used the dynamic table, which we never enable.
    let first = buf.get_u8();
    let required = decode_int(first, 8, buf)?;
    if required != 0 {
        return Err(QpackError::DynamicTable);
    }

    if !buf.has_remaining() {
        return Err(QpackError::UnexpectedEnd);
    }
    let first = buf.get_u8();
    let _base = decode_int(first, 7, buf)?;

    let mut fields = Fields::new();
    while buf.has_remaining() {
        let first = buf.get_u8();

        if first & 0b1000_0000 != 0 {
            // Indexed field line.
            if first & 0b0100_0000 == 0 {
                return Err(QpackError::DynamicTable);
            }
            let index = decode_int(first, 6, buf)?;
            let (name, value) = lookup(index)?;
            fields.insert(name, value);
        } else if first & 0b0100_0000 != 0 {
            // Literal field line with name reference.
            if first & 0b0001_0000 == 0 {
                return Err(QpackError::DynamicTable);
            }
            let never = first & 0b0010_0000 != 0;
            let index = decode_int(first, 4, buf)?;
            let (name, _) = lookup(index)?;

            if !buf.has_remaining() {
                return Err(QpackError::UnexpectedEnd);
            }
            let first = buf.get_u8();
            let value = decode_string(first, 7, buf)?;

            if never {
                fields.insert_never_index(name, value);
            } else {
                fields.insert(name, value);
            }
        } else if first & 0b0010_0000 != 0 {
            // Literal field line with literal name.
            let never = first & 0b0001_0000 != 0;
            let name = decode_string(first, 3, buf)?;

            if !buf.has_remaining() {
                return Err(QpackError::UnexpectedEnd);
            }
            let first = buf.get_u8();
            let value = decode_string(first, 7, buf)?;

            if never {
                fields.insert_never_index(name, value);
            } else {
                fields.insert(name, value);
            }
        } else {
            // Post-base forms only occur with a dynamic table.
            return Err(QpackError::DynamicTable);
        }
    }

    Ok(fields)
}

fn lookup(index: u64) -> Result<(&'static str, &'static str), QpackError> {
    STATIC_TABLE
        .get(index as usize)
        .copied()
        .ok_or(QpackError::InvalidIndex(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use http::{Method, StatusCode};

    fn roundtrip(fields: &Fields) -> Fields {
        let mut buf = BytesMut::new();
        encode(fields, &mut buf);
        decode(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn static_table_shape() {
        assert_eq!(STATIC_TABLE.len(), 99);
        assert_eq!(STATIC_TABLE[17], (":method", "GET"));
        assert_eq!(STATIC_TABLE[25], (":status", "200"));
        assert_eq!(STATIC_TABLE[98], ("x-frame-options", "sameorigin"));
    }

    #[test]
    fn indexed_request() {
        let fields = Fields::request(&Method::GET, "example.com", "/");
        let mut buf = BytesMut::new();
        encode(&fields, &mut buf);

        // prefix + :method GET and :scheme https and :path / are fully
        // indexed (one byte each); :authority needs a literal value.
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 0);

        let decoded = decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.method(), Some(Method::GET));
        assert_eq!(decoded.path(), Some("/"));
        assert_eq!(decoded.authority(), Some("example.com"));
    }

    #[test]
    fn literal_roundtrip() {
        let mut fields = Fields::new();
        fields.insert("x-custom", "value");
        fields.insert("server", "braid/0.1");
        fields.insert("content-type", "text/plain");

        assert_eq!(roundtrip(&fields), fields);
    }

    #[test]
    fn never_index_survives() {
        let mut fields = Fields::new();
        fields.insert_never_index("authorization", "Bearer secret");
        fields.insert_never_index("x-api-key", "12345");

        let decoded = roundtrip(&fields);
        assert!(decoded.find("authorization").unwrap().never_index());
        assert!(decoded.find("x-api-key").unwrap().never_index());
        assert_eq!(decoded.get("authorization"), Some("Bearer secret"));
    }

    #[test]
    fn response_roundtrip() {
        let mut fields = Fields::response(StatusCode::NOT_FOUND);
        fields.insert("content-length", "0");

        let decoded = roundtrip(&fields);
        assert_eq!(decoded.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(decoded.get("content-length"), Some("0"));
    }

    #[test]
    fn names_lowercased_on_the_wire() {
        let mut fields = Fields::new();
        fields.insert("X-Custom-Header", "v");

        let decoded = roundtrip(&fields);
        assert_eq!(decoded.find("x-custom-header").unwrap().name(), "x-custom-header");
    }

    #[test]
    fn duplicate_order_preserved() {
        let mut fields = Fields::new();
        fields.insert("set-cookie", "a=1");
        fields.insert("set-cookie", "b=2");

        let decoded = roundtrip(&fields);
        let values: Vec<_> = decoded.iter().map(|f| f.value()).collect();
        assert_eq!(values, ["a=1", "b=2"]);
    }

    #[test]
    fn rejects_dynamic_sections() {
        // Required insert count 1 implies dynamic table state.
        let buf: &[u8] = &[0x01, 0x00];
        assert_eq!(decode(&mut &buf[..]), Err(QpackError::DynamicTable));
    }

    #[test]
    fn rejects_huffman() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0);
        // Literal field line with literal name, huffman bit set on the name.
        buf.put_u8(0b0010_1000 | 3);
        buf.put_slice(b"abc");

        assert_eq!(decode(&mut buf.freeze()), Err(QpackError::Huffman));
    }

    #[test]
    fn truncated_section() {
        let mut full = BytesMut::new();
        let mut fields = Fields::new();
        fields.insert("x-custom", "value");
        encode(&fields, &mut full);
        let full = full.freeze();

        // len == 2 is a complete (empty) section; everything else is torn.
        for len in (1..full.len()).filter(|&len| len != 2) {
            let mut partial = full.slice(..len);
            assert!(decode(&mut partial).is_err(), "prefix length {len}");
        }
    }

    #[test]
    fn large_index_continuation() {
        // Entry 98 does not fit in a 6-bit prefix, forcing a continuation.
        let mut fields = Fields::new();
        fields.insert("x-frame-options", "sameorigin");

        let mut buf = BytesMut::new();
        encode(&fields, &mut buf);
        assert_eq!(&buf[2..], &[0b1111_1111, 98 - 63][..]);

        assert_eq!(roundtrip(&fields), fields);
    }
}
