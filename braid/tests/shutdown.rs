//! Shutdown, reset, and graceful-close behavior between the two halves
//! of a stream.

mod common;

use std::time::Duration;

use braid::{quic, Settings, StreamError};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(10);

/// A connected (client stream, server stream) pair on an echo ALPN.
async fn stream_pair() -> (
    quic::Client,
    quic::Server,
    quic::Connection,
    quic::Stream,
    quic::Connection,
    quic::Stream,
) {
    let (server, client, addr) = common::quic_pair("echo", Settings::server());

    let cconn = client.connect(addr, "localhost").expect("connect");

    let setup = async move {
        let cstream = cconn.open_stream().await.expect("open stream");
        // The peer only learns about the stream once bytes arrive.
        cstream.write_all(b"\0").await.expect("first byte");
        let sconn = server.accept().await.expect("accept connection");
        let sstream = sconn.accept_stream().await.expect("accept stream");
        let mut buf = [0u8; 1];
        let n = sstream.read_some(&mut buf).await.expect("priming read");
        assert_eq!(n, 1);
        (server, cconn, cstream, sconn, sstream)
    };
    let (server, cconn, cstream, sconn, sstream) =
        timeout(TIMEOUT, setup).await.expect("setup timed out");

    (client, server, cconn, cstream, sconn, sstream)
}

#[tokio::test]
async fn shutdown_read_aborts_pending_read() {
    let (client, _server, _cconn, cstream, _sconn, _sstream) = stream_pair().await;

    // Park a read; the server sends nothing.
    let parked = cstream.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        parked.read_some(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());

    cstream.shutdown(quic::Shutdown::Read).expect("shutdown");

    // The pending read observes the abort...
    let result = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(StreamError::Aborted)), "got {result:?}");

    // ...and a second read observes a closed side.
    let mut buf = [0u8; 16];
    let second = cstream.read_some(&mut buf).await;
    assert!(matches!(second, Err(StreamError::Closed)), "got {second:?}");

    client.close().await;
}

#[tokio::test]
async fn remote_half_close_yields_eof() {
    let (client, _server, _cconn, cstream, _sconn, sstream) = stream_pair().await;

    // Park a client read, then let the server half-close its send side.
    let parked = cstream.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        parked.read_some(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    sstream.shutdown(quic::Shutdown::Write).expect("server half close");

    let result = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(StreamError::Eof)), "got {result:?}");

    // Eof repeats on the next read.
    let mut buf = [0u8; 16];
    let again = cstream.read_some(&mut buf).await;
    assert!(matches!(again, Err(StreamError::Eof)), "got {again:?}");

    client.close().await;
}

#[tokio::test]
async fn half_shutdown_leaves_other_side_alone() {
    let (client, _server, _cconn, cstream, _sconn, sstream) = stream_pair().await;

    cstream.shutdown(quic::Shutdown::Read).expect("shutdown read");

    // Writing still works after a read-side shutdown.
    cstream.write_all(b"still writing").await.expect("write");
    let mut buf = [0u8; 32];
    let n = timeout(TIMEOUT, sstream.read_some(&mut buf))
        .await
        .expect("server read timed out")
        .expect("server read");
    assert_eq!(&buf[..n], b"still writing");

    client.close().await;
}

#[tokio::test]
async fn graceful_close_completes_after_acks() {
    let (client, _server, _cconn, cstream, _sconn, sstream) = stream_pair().await;

    cstream.write_all(b"goodbye").await.expect("write");
    timeout(TIMEOUT, cstream.close())
        .await
        .expect("close timed out")
        .expect("close");

    // The peer still receives everything written before the close.
    let mut collected = Vec::new();
    let mut buf = [0u8; 32];
    loop {
        match timeout(TIMEOUT, sstream.read_some(&mut buf)).await.unwrap() {
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(StreamError::Eof) => break,
            Err(err) => panic!("server read: {err}"),
        }
    }
    assert_eq!(collected, b"goodbye");

    client.close().await;
}

#[tokio::test]
async fn reset_reaches_the_peer() {
    let (client, _server, _cconn, cstream, _sconn, sstream) = stream_pair().await;

    cstream.reset(42);

    let mut buf = [0u8; 16];
    let result = timeout(TIMEOUT, sstream.read_some(&mut buf))
        .await
        .expect("server read timed out");
    assert!(
        matches!(result, Err(StreamError::Reset(42))),
        "got {result:?}"
    );

    // The local stream is closed for further operations.
    let local = cstream.write_some(b"x").await;
    assert!(matches!(local, Err(StreamError::Closed)), "got {local:?}");

    client.close().await;
}

#[tokio::test]
async fn write_after_shutdown_write_fails() {
    let (client, _server, _cconn, cstream, _sconn, _sstream) = stream_pair().await;

    cstream.shutdown(quic::Shutdown::Write).expect("shutdown");
    let result = cstream.write_some(b"late").await;
    assert!(matches!(result, Err(StreamError::Closed)), "got {result:?}");

    client.close().await;
}
