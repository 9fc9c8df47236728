use std::sync::Arc;

use thiserror::Error;

/// An error terminating an entire connection.
///
/// Delivered to exactly one waiting operation when it occurs; if none is
/// waiting it is stored and delivered to the next operation submitted on
/// the connection or any of its streams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Local `close()` or peer abrupt close.
    #[error("connection aborted")]
    Aborted,

    /// TLS handshake failure with no more specific alert.
    #[error("connection handshake failed")]
    HandshakeFailed,

    /// Idle timeout elapsed.
    #[error("connection timed out")]
    TimedOut,

    /// Peer sent a stateless reset.
    #[error("connection reset by peer")]
    Reset,

    /// Local GOAWAY: no new streams may be initiated here.
    #[error("connection is going away")]
    GoingAway,

    /// Remote GOAWAY: the peer will not accept new streams.
    #[error("peer is going away")]
    PeerGoingAway,

    /// QUIC transport error carried by a CONNECTION_CLOSE frame.
    #[error("transport error {code:#x}: {reason}")]
    Transport { code: u64, reason: Arc<str> },

    /// TLS alert, from the crypto error range of CONNECTION_CLOSE.
    #[error("tls alert {alert}: {name}", alert = _0, name = tls_alert_name(_0))]
    Tls(u8),

    /// Application-level CONNECTION_CLOSE with an opaque code.
    #[error("application error {code:#x}")]
    Application { code: u64 },

    /// The operation was submitted on a connection that is already closed.
    #[error("connection is not open")]
    NotConnected,

    /// The engine was torn down underneath the connection.
    #[error("engine stopped")]
    EngineStopped,
}

/// An error terminating a single stream operation or stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The remote finished sending; no more data will arrive.
    #[error("end of stream")]
    Eof,

    /// An operation is already pending on this side of the stream.
    #[error("stream busy")]
    Busy,

    /// Local cancel via `shutdown`, `close`, or `reset`.
    #[error("stream aborted")]
    Aborted,

    /// The peer reset the stream.
    #[error("stream reset by peer, code {0:#x}")]
    Reset(u64),

    /// The peer told us to stop sending.
    #[error("stream stopped by peer, code {0:#x}")]
    Stopped(u64),

    /// The operation is not valid in the stream's current sub-state, e.g.
    /// reading headers after the body started.
    #[error("operation invalid in this stream state")]
    InvalidState,

    /// The stream (or this side of it) is already shut down.
    #[error("stream is closed")]
    Closed,

    /// A serialized field section exceeds the peer's advertised cap.
    #[error("field section exceeds the peer's frame size limit")]
    FrameSize,

    /// The peer sent malformed HTTP/3 framing on this stream.
    #[error("h3 framing error: {0}")]
    Frame(Arc<str>),

    /// The owning connection failed; the connection error is attached.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// TLS alert 120, the only alert tests name explicitly.
pub const TLS_NO_APPLICATION_PROTOCOL: u8 = 120;

fn tls_alert_name(alert: &u8) -> &'static str {
    // The handful that QUIC handshakes actually produce.
    match *alert {
        40 => "handshake_failure",
        42 => "bad_certificate",
        45 => "certificate_expired",
        46 => "certificate_unknown",
        48 => "unknown_ca",
        70 => "protocol_version",
        80 => "internal_error",
        109 => "missing_extension",
        112 => "unrecognized_name",
        116 => "certificate_required",
        TLS_NO_APPLICATION_PROTOCOL => "no_application_protocol",
        _ => "unknown",
    }
}

// The TLS alert range of QUIC transport error codes, RFC 9001 section 4.8.
const CRYPTO_ERROR_BASE: u64 = 0x100;
const CRYPTO_ERROR_MAX: u64 = 0x1ff;

/// Classify a transport error code: TLS alerts come out as [ConnectionError::Tls],
/// everything else as [ConnectionError::Transport].
pub(crate) fn from_transport_code(code: u64, reason: &str) -> ConnectionError {
    if (CRYPTO_ERROR_BASE..=CRYPTO_ERROR_MAX).contains(&code) {
        ConnectionError::Tls((code - CRYPTO_ERROR_BASE) as u8)
    } else {
        ConnectionError::Transport {
            code,
            reason: reason.into(),
        }
    }
}

/// Select the error a closed connection reports, preferring an explicit
/// CONNECTION_CLOSE payload over the derived status.
pub(crate) fn classify(reason: &quinn_proto::ConnectionError) -> ConnectionError {
    use quinn_proto::ConnectionError::*;
    match reason {
        ApplicationClosed(close) => ConnectionError::Application {
            code: close.error_code.into_inner(),
        },
        ConnectionClosed(close) => from_transport_code(
            close.error_code.into(),
            &String::from_utf8_lossy(&close.reason),
        ),
        TransportError(err) => {
            from_transport_code(err.code.into(), &err.reason.to_string())
        }
        TimedOut => ConnectionError::TimedOut,
        Reset => ConnectionError::Reset,
        LocallyClosed => ConnectionError::Aborted,
        VersionMismatch => ConnectionError::HandshakeFailed,
        CidsExhausted => ConnectionError::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_range_is_tls() {
        assert_eq!(
            from_transport_code(0x178, ""),
            ConnectionError::Tls(TLS_NO_APPLICATION_PROTOCOL)
        );
        assert_eq!(from_transport_code(0x100, ""), ConnectionError::Tls(0));
        assert_eq!(from_transport_code(0x1ff, ""), ConnectionError::Tls(255));
    }

    #[test]
    fn transport_range_is_transport() {
        match from_transport_code(0x0a, "protocol violation") {
            ConnectionError::Transport { code, reason } => {
                assert_eq!(code, 0x0a);
                assert_eq!(&*reason, "protocol violation");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            from_transport_code(0x200, ""),
            ConnectionError::Transport { .. }
        ));
    }

    #[test]
    fn alert_names() {
        assert_eq!(tls_alert_name(&120), "no_application_protocol");
        assert_eq!(tls_alert_name(&80), "internal_error");
        assert_eq!(tls_alert_name(&7), "unknown");
    }
}
