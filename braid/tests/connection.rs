//! Connection-level behavior: stream caps, go-away, ALPN failures, and
//! terminal error delivery.

mod common;

use std::time::Duration;

use braid::{h3, quic, ConnectionError, Settings, StreamError, TLS_NO_APPLICATION_PROTOCOL};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn stream_cap_queues_third_stream() {
    let mut settings = Settings::server();
    settings.max_streams_per_connection = 2;
    let (server, client, addr) = common::quic_pair("echo", settings);

    // The server accepts streams and drops its handles, so closed
    // streams retire and replenish the cap.
    let server_task = tokio::spawn(async move {
        let conn = server.accept().await.expect("accept connection");
        loop {
            match conn.accept_stream().await {
                Ok(stream) => drop(stream),
                Err(_) => break,
            }
        }
        server
    });

    let conn = client.connect(addr, "localhost").expect("connect");

    let a = timeout(TIMEOUT, conn.open_stream())
        .await
        .expect("stream a timed out")
        .expect("stream a");
    let b = timeout(TIMEOUT, conn.open_stream())
        .await
        .expect("stream b timed out")
        .expect("stream b");
    a.write_all(b"a").await.expect("write a");
    b.write_all(b"b").await.expect("write b");

    // The third stream exceeds the cap and stays pending.
    let conn2 = conn.clone();
    let mut third = tokio::spawn(async move { conn2.open_stream().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!third.is_finished(), "third stream should be blocked");

    // Retiring stream A unblocks it.
    a.close().await.expect("close a");
    let c = timeout(TIMEOUT, &mut third)
        .await
        .expect("third stream never unblocked")
        .unwrap()
        .expect("stream c");
    c.write_all(b"c").await.expect("write c");

    drop(server_task);
    client.close().await;
}

#[tokio::test]
async fn alpn_mismatch_fails_first_operation() {
    let cert = common::test_cert();

    // The server only speaks "quic"; the client offers "j5".
    let server = quic::Server::builder()
        .with_bind(common::localhost())
        .with_alpn(&["quic"])
        .with_single_cert(cert.chain, cert.key)
        .expect("server build");
    let addr = server.local_endpoint().expect("server address");
    let _server = server;

    let client_bad = quic::Client::builder()
        .with_bind(common::localhost())
        .with_alpn(&["j5"])
        .with_server_certificates(vec![cert.der])
        .expect("trust anchor")
        .build()
        .expect("client build");

    let conn = client_bad.connect(addr, "localhost").expect("connect");

    // The first operation collects the TLS alert...
    let first = timeout(TIMEOUT, conn.open_stream())
        .await
        .expect("first op timed out");
    match first {
        Err(StreamError::Connection(ConnectionError::Tls(alert))) => {
            assert_eq!(alert, TLS_NO_APPLICATION_PROTOCOL);
        }
        other => panic!("expected tls alert, got {other:?}"),
    }

    // ...and later operations observe a closed connection without blocking.
    let second = timeout(TIMEOUT, conn.open_stream())
        .await
        .expect("second op timed out");
    assert!(
        matches!(
            second,
            Err(StreamError::Connection(ConnectionError::NotConnected))
        ),
        "got {second:?}"
    );

    client_bad.close().await;
}

#[tokio::test]
async fn local_goaway_rejects_new_streams() {
    let (server, client, addr) = common::quic_pair("echo", Settings::server());

    let server_task = tokio::spawn(async move {
        let _conn = server.accept().await.expect("accept connection");
        tokio::time::sleep(Duration::from_secs(5)).await;
        server
    });

    let conn = client.connect(addr, "localhost").expect("connect");

    // An existing stream, then go away.
    let existing = timeout(TIMEOUT, conn.open_stream())
        .await
        .expect("open timed out")
        .expect("open stream");
    conn.go_away().expect("go away");
    assert!(conn.is_open());

    // New local streams are refused...
    let refused = conn.open_stream().await;
    assert!(
        matches!(
            refused,
            Err(StreamError::Connection(ConnectionError::GoingAway))
        ),
        "got {refused:?}"
    );

    // ...while the existing stream still writes.
    existing.write_all(b"still here").await.expect("write");

    drop(server_task);
    client.close().await;
}

#[tokio::test]
async fn remote_goaway_rejects_client_streams() {
    let (server, client, addr) = common::h3_pair(Settings::server());

    let server_task = tokio::spawn(async move {
        let conn = server.accept().await.expect("accept connection");
        conn.go_away().expect("server go away");
        tokio::time::sleep(Duration::from_secs(5)).await;
        server
    });

    let conn = client.connect(addr, "localhost").expect("connect");

    // The GOAWAY races the connect; poll until it lands.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match conn.open_stream().await {
            Err(StreamError::Connection(ConnectionError::PeerGoingAway)) => break,
            Ok(stream) => {
                // Opened before the GOAWAY arrived; discard and retry.
                drop(stream);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "GOAWAY never observed"
        );
    }

    drop(server_task);
    client.close().await;
}

#[tokio::test]
async fn connection_error_is_terminal_for_every_operation() {
    let (server, client, addr) = common::quic_pair("echo", Settings::server());

    let server_task = tokio::spawn(async move {
        let conn = server.accept().await.expect("accept connection");
        let stream = conn.accept_stream().await.expect("accept stream");
        let mut buf = [0u8; 1];
        let _ = stream.read_some(&mut buf).await;
        // Abort the whole connection underneath the client.
        conn.close();
        server
    });

    let conn = client.connect(addr, "localhost").expect("connect");
    let stream = conn.open_stream().await.expect("open stream");
    stream.write_all(b"x").await.expect("write");

    // The pending read observes the connection error.
    let mut buf = [0u8; 16];
    let first = timeout(TIMEOUT, stream.read_some(&mut buf))
        .await
        .expect("read timed out");
    assert!(
        matches!(first, Err(StreamError::Connection(_))),
        "got {first:?}"
    );

    // Everything after that errors immediately, on the stream and on the
    // connection.
    let on_stream = timeout(Duration::from_secs(1), stream.read_some(&mut buf))
        .await
        .expect("post-error read blocked");
    assert!(on_stream.is_err());

    let on_conn = timeout(Duration::from_secs(1), conn.open_stream())
        .await
        .expect("post-error open blocked");
    assert!(on_conn.is_err());

    let again = timeout(Duration::from_secs(1), conn.open_stream())
        .await
        .expect("second post-error open blocked");
    assert!(again.is_err());

    let server = timeout(TIMEOUT, server_task).await.unwrap().unwrap();
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn is_open_reflects_lifecycle() {
    let (server, client, addr) = common::quic_pair("echo", Settings::server());

    let server_task = tokio::spawn(async move {
        let _conn = server.accept().await.expect("accept connection");
        tokio::time::sleep(Duration::from_secs(5)).await;
        server
    });

    let conn = client.connect(addr, "localhost").expect("connect");
    assert!(conn.is_open());
    assert!(conn.remote_endpoint().expect("remote").port() > 0);

    conn.close();
    assert!(!conn.is_open());

    drop(server_task);
    client.close().await;
}

#[tokio::test]
async fn h3_settings_cap_header_sections() {
    let mut settings = Settings::server();
    settings.max_field_section_size = 128;
    let (server, client, addr) = common::h3_pair(settings);

    let server_task = tokio::spawn(async move {
        let _conn = server.accept().await.expect("accept connection");
        tokio::time::sleep(Duration::from_secs(5)).await;
        server
    });

    let conn = client.connect(addr, "localhost").expect("connect");
    let stream = conn.open_stream().await.expect("open stream");

    // Give the SETTINGS exchange a moment to land.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut oversized = h3::Fields::request(&h3::Method::GET, "localhost", "/");
    oversized.insert("x-filler", "y".repeat(4096));
    let result = stream.write_headers(&oversized);
    assert!(
        matches!(result, Err(StreamError::FrameSize)),
        "got {result:?}"
    );

    // The stream is still usable with a small section.
    let small = h3::Fields::request(&h3::Method::GET, "localhost", "/");
    stream.write_headers(&small).expect("small section");

    drop(server_task);
    client.close().await;
}
