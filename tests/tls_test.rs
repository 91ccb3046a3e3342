//! TLS handshake, transfer, and verification over loopback pairs, using
//! a freshly generated self-signed certificate.

use std::fs;
use std::path::Path;
use std::time::Duration;

use boring::asn1::Asn1Time;
use boring::hash::MessageDigest;
use boring::pkey::PKey;
use boring::rsa::Rsa;
use boring::x509::{X509, X509NameBuilder};

use corosock::{
    Connection, SockError, SocketConfig, SocketKind, TimeoutValue, TlsConfig, TlsState,
};

fn write_self_signed(dir: &Path) -> (String, String) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (
        cert_path.to_str().unwrap().to_string(),
        key_path.to_str().unwrap().to_string(),
    )
}

fn test_config() -> SocketConfig {
    SocketConfig {
        connect_timeout: TimeoutValue::Finite(Duration::from_secs(5)),
        ..SocketConfig::default()
    }
}

async fn tls_pair(
    server_tls: TlsConfig,
    client_tls: TlsConfig,
) -> (Result<Connection, SockError>, Result<Connection, SockError>) {
    let mut listener = Connection::new(SocketKind::Tcp, test_config()).unwrap();
    listener.bind("127.0.0.1", 0).unwrap();
    listener.listen(4).unwrap();
    listener.set_tls(server_tls);
    let port = listener.local_addr().unwrap().port();

    let server = async {
        let mut accepted = listener.accept().await?;
        accepted.tls_accept().await?;
        Ok::<_, SockError>(accepted)
    };
    let client = async {
        let mut client = Connection::new(SocketKind::Tcp, test_config())?;
        client.set_tls(client_tls);
        client.connect("127.0.0.1", port).await?;
        Ok::<_, SockError>(client)
    };
    tokio::join!(server, client)
}

#[tokio::test]
async fn tls_echo_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());

    let server_tls = TlsConfig {
        cert_file: Some(cert),
        key_file: Some(key),
        ..TlsConfig::default()
    };
    let (server, client) = tls_pair(server_tls, TlsConfig::default()).await;
    let mut server = server.unwrap();
    let mut client = client.unwrap();
    assert_eq!(server.tls_state(), TlsState::Established);
    assert_eq!(client.tls_state(), TlsState::Established);

    client.send_all(b"over tls").await.unwrap();
    let mut buf = [0u8; 8];
    server.recv_all(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over tls");

    server.send_all(&buf).await.unwrap();
    let mut echo = [0u8; 8];
    client.recv_all(&mut echo).await.unwrap();
    assert_eq!(echo, buf);
}

#[tokio::test]
async fn tls_verify_distinguishes_self_signed() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());

    let server_tls = TlsConfig {
        cert_file: Some(cert),
        key_file: Some(key),
        ..TlsConfig::default()
    };
    let (server, client) = tls_pair(server_tls, TlsConfig::default()).await;
    let _server = server.unwrap();
    let mut client = client.unwrap();

    // Strict verification rejects the untrusted chain.
    match client.tls_verify(false) {
        Err(SockError::TlsVerify(_)) => {}
        other => panic!("expected TlsVerify failure, got {other:?}"),
    }
    // Allowing self-signed chains accepts it.
    client.tls_verify(true).unwrap();
}

#[tokio::test]
async fn connect_fails_when_verify_peer_rejects_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());

    let mut listener = Connection::new(SocketKind::Tcp, test_config()).unwrap();
    listener.bind("127.0.0.1", 0).unwrap();
    listener.listen(4).unwrap();
    listener.set_tls(TlsConfig {
        cert_file: Some(cert),
        key_file: Some(key),
        ..TlsConfig::default()
    });
    let port = listener.local_addr().unwrap().port();

    let mut client = Connection::new(SocketKind::Tcp, test_config()).unwrap();
    client.set_tls(TlsConfig {
        verify_peer: true,
        ..TlsConfig::default()
    });

    let server = async {
        let mut accepted = listener.accept().await?;
        accepted.tls_accept().await?;
        Ok::<_, SockError>(accepted)
    };
    let (server_res, client_res) = tokio::join!(server, client.connect("127.0.0.1", port));
    server_res.unwrap();
    match client_res {
        Err(SockError::TlsVerify(_)) => {}
        other => panic!("expected TlsVerify failure from connect, got {other:?}"),
    }
    // The unverified session is torn down with the connection; nothing
    // can be sent to the untrusted peer afterwards.
    assert!(client.is_closed());
    assert_eq!(client.tls_state(), TlsState::NotStarted);
    assert!(matches!(
        client.send(b"x").await,
        Err(SockError::ConnectionReset)
    ));
}

#[tokio::test]
async fn connect_succeeds_when_self_signed_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());

    let server_tls = TlsConfig {
        cert_file: Some(cert),
        key_file: Some(key),
        ..TlsConfig::default()
    };
    let client_tls = TlsConfig {
        verify_peer: true,
        allow_self_signed: true,
        ..TlsConfig::default()
    };
    let (server, client) = tls_pair(server_tls, client_tls).await;
    server.unwrap();
    client.unwrap();
}

#[tokio::test]
async fn tls_accept_requires_certificate() {
    let mut listener = Connection::new(SocketKind::Tcp, test_config()).unwrap();
    listener.bind("127.0.0.1", 0).unwrap();
    listener.listen(4).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = Connection::new(SocketKind::Tcp, test_config()).unwrap();
    let (accepted, connected) =
        tokio::join!(listener.accept(), client.connect("127.0.0.1", port));
    connected.unwrap();
    let mut server = accepted.unwrap();

    match server.tls_accept().await {
        Err(SockError::Tls(msg)) => assert!(msg.contains("certificate")),
        other => panic!("expected Tls error, got {other:?}"),
    }
}
