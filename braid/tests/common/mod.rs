//! Shared test plumbing: self-signed certificates and loopback
//! client/server pairs.

use std::net::SocketAddr;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub struct TestCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub der: CertificateDer<'static>,
}

pub fn test_cert() -> TestCert {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("certificate generation");
    let der = cert.der().clone();
    TestCert {
        chain: vec![der.clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        der,
    }
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A raw QUIC server + client pair sharing one ALPN, plus the server's
/// address.
pub fn quic_pair(
    alpn: &str,
    settings: braid::Settings,
) -> (braid::quic::Server, braid::quic::Client, SocketAddr) {
    let cert = test_cert();

    let server = braid::quic::Server::builder()
        .with_bind(localhost())
        .with_alpn(&[alpn])
        .with_settings(settings)
        .with_single_cert(cert.chain, cert.key)
        .expect("server build");
    let addr = server.local_endpoint().expect("server address");

    let client = braid::quic::Client::builder()
        .with_bind(localhost())
        .with_alpn(&[alpn])
        .with_server_certificates(vec![cert.der])
        .expect("trust anchor")
        .build()
        .expect("client build");

    (server, client, addr)
}

/// An HTTP/3 server + client pair.
pub fn h3_pair(settings: braid::Settings) -> (braid::h3::Server, braid::h3::Client, SocketAddr) {
    let cert = test_cert();

    let server = braid::h3::Server::builder()
        .with_bind(localhost())
        .with_settings(settings)
        .with_single_cert(cert.chain, cert.key)
        .expect("server build");
    let addr = server.local_endpoint().expect("server address");

    let client = braid::h3::Client::builder()
        .with_bind(localhost())
        .with_server_certificates(vec![cert.der])
        .expect("trust anchor")
        .build()
        .expect("client build");

    (server, client, addr)
}
