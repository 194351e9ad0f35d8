//! Mutual TLS between client and server, with trust loaded from CA
//! directories and identities loaded from identity directories.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{registry, Recorder, SamplePacket};
use framelink::prelude::*;
use framelink::transport::tls::{IDENTITY_CERT_FILE, IDENTITY_KEY_FILE};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tempfile::TempDir;

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// Write this CA into `dir` as the only trust anchor.
    fn write_ca_dir(&self, dir: &Path) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("ca.pem"), self.cert.pem()).unwrap();
        dir.to_path_buf()
    }

    /// Issue a leaf for `name` and write it as an identity directory.
    fn issue(&self, name: &str, dir: &Path) -> PathBuf {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(IDENTITY_CERT_FILE), cert.pem()).unwrap();
        fs::write(dir.join(IDENTITY_KEY_FILE), key.serialize_pem()).unwrap();
        dir.to_path_buf()
    }
}

struct Pki {
    _root: TempDir,
    ca_dir: PathBuf,
    server_dir: PathBuf,
    client_dir: PathBuf,
    rogue_ca_dir: PathBuf,
    rogue_client_dir: PathBuf,
}

fn pki() -> Pki {
    let root = TempDir::new().unwrap();
    let ca = Authority::new("framelink test ca");
    let rogue = Authority::new("framelink rogue ca");

    Pki {
        ca_dir: ca.write_ca_dir(&root.path().join("ca")),
        server_dir: ca.issue("localhost", &root.path().join("server")),
        client_dir: ca.issue("client", &root.path().join("client")),
        rogue_ca_dir: rogue.write_ca_dir(&root.path().join("rogue-ca")),
        rogue_client_dir: rogue.issue("intruder", &root.path().join("rogue-client")),
        _root: root,
    }
}

fn server_tls(pki: &Pki) -> TlsServerConfig {
    TlsServerConfig::new(
        pki.server_dir.join(IDENTITY_CERT_FILE),
        pki.server_dir.join(IDENTITY_KEY_FILE),
    )
    .with_client_auth(&pki.ca_dir)
}

async fn start_server(tls: TlsServerConfig, sink: Arc<Recorder>) -> NetworkServer {
    let server = ServerBuilder::new()
        .address("127.0.0.1")
        .port(0)
        .registry(registry())
        .event_sink(sink)
        .tls(tls)
        .build()
        .unwrap();
    server.start().await.unwrap();
    server
}

fn client(server: &NetworkServer, tls: TlsClientConfig, sink: Arc<Recorder>) -> Result<NetworkClient> {
    ClientBuilder::new("127.0.0.1", server.local_addr().unwrap().port())
        .registry(registry())
        .event_sink(sink)
        .tls(tls)
        .require_tls(true)
        .build()
}

#[tokio::test]
async fn mutual_tls_round_trip() {
    let pki = pki();
    let server_events = Recorder::new();
    let client_events = Recorder::new();
    let server = start_server(server_tls(&pki), server_events.clone()).await;

    let tls = TlsClientConfig::new("localhost")
        .with_ca_dir(&pki.ca_dir)
        .with_identity_dir(&pki.client_dir);
    let client = client(&server, tls, client_events.clone()).unwrap();
    assert!(client.is_tls());

    assert!(client.connect().await.unwrap());
    client_events
        .wait_for(1, |e| matches!(e, NetworkEvent::ClientIdAssigned { .. }))
        .await;
    assert_eq!(client.client_id(), 1);

    assert!(
        client
            .send_packet(SamplePacket {
                int_a: 42,
                bool_b: true,
            })
            .await
    );
    server_events.wait_for_packets::<SamplePacket>(1).await;
    assert_eq!(
        server_events.received::<SamplePacket>(),
        vec![SamplePacket {
            int_a: 42,
            bool_b: true,
        }]
    );

    assert!(client.disconnect().await);
    server_events
        .wait_for(1, |e| {
            matches!(
                e,
                NetworkEvent::Disconnected {
                    cause: DisconnectCause::Remote,
                    ..
                }
            )
        })
        .await;
    server.stop().await;
}

#[tokio::test]
async fn tls12_only_link_works() {
    let pki = pki();
    let client_events = Recorder::new();
    let server = start_server(
        server_tls(&pki).with_version(TlsVersion::TLS12),
        Recorder::new(),
    )
    .await;

    let tls = TlsClientConfig::new("localhost")
        .with_ca_dir(&pki.ca_dir)
        .with_identity_dir(&pki.client_dir)
        .with_version(TlsVersion::TLS12);
    let client = client(&server, tls, client_events.clone()).unwrap();
    client.connect().await.unwrap();
    client_events
        .wait_for(1, |e| matches!(e, NetworkEvent::ClientIdAssigned { .. }))
        .await;

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn client_from_untrusted_ca_is_rejected() {
    let pki = pki();
    let server_events = Recorder::new();
    let server = start_server(server_tls(&pki), server_events.clone()).await;

    let tls = TlsClientConfig::new("localhost")
        .with_ca_dir(&pki.ca_dir)
        .with_identity_dir(&pki.rogue_client_dir);
    let client = client(&server, tls, Recorder::new()).unwrap();

    // With TLS 1.3 the client may finish its half before the server rejects it.
    let _ = client.connect().await;

    server_events
        .wait_for(1, |e| {
            matches!(
                e,
                NetworkEvent::HandshakeFailed {
                    side: Side::Server,
                    ..
                }
            )
        })
        .await;
    assert_eq!(server.connection_count(), 0);
    assert_eq!(
        server_events.count(|e| matches!(e, NetworkEvent::Connected { .. })),
        0
    );

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn client_without_certificate_is_rejected() {
    let pki = pki();
    let server_events = Recorder::new();
    let server = start_server(server_tls(&pki), server_events.clone()).await;

    let tls = TlsClientConfig::new("localhost").with_ca_dir(&pki.ca_dir);
    let client = client(&server, tls, Recorder::new()).unwrap();
    let _ = client.connect().await;

    server_events
        .wait_for(1, |e| matches!(e, NetworkEvent::HandshakeFailed { .. }))
        .await;
    assert_eq!(server.connection_count(), 0);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn anonymous_client_admitted_when_auth_optional() {
    let pki = pki();
    let client_events = Recorder::new();
    let server = start_server(
        server_tls(&pki).require_client_auth(false),
        Recorder::new(),
    )
    .await;

    let tls = TlsClientConfig::new("localhost").with_ca_dir(&pki.ca_dir);
    let client = client(&server, tls, client_events.clone()).unwrap();
    client.connect().await.unwrap();
    client_events
        .wait_for(1, |e| matches!(e, NetworkEvent::ClientIdAssigned { .. }))
        .await;

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn untrusted_server_fails_without_retry() {
    let pki = pki();
    let server = start_server(server_tls(&pki), Recorder::new()).await;

    let client_events = Recorder::new();
    let tls = TlsClientConfig::new("localhost")
        .with_ca_dir(&pki.rogue_ca_dir)
        .with_identity_dir(&pki.client_dir);
    let client = ClientBuilder::new("127.0.0.1", server.local_addr().unwrap().port())
        .registry(registry())
        .event_sink(client_events.clone())
        .tls(tls)
        .max_reconnect_attempts(3)
        .build()
        .unwrap();

    match client.connect().await {
        Err(ProtocolError::HandshakeFailure(_)) => {}
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert_eq!(
        client_events.count(|e| matches!(
            e,
            NetworkEvent::HandshakeFailed {
                side: Side::Client,
                ..
            }
        )),
        1
    );
    assert_eq!(
        client_events.count(|e| matches!(e, NetworkEvent::ReconnectScheduled { .. })),
        0
    );
    assert!(!client.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn provisioning_errors_surface_from_builders() {
    let empty = TempDir::new().unwrap();

    let err = ClientBuilder::new("127.0.0.1", 1)
        .tls(TlsClientConfig::new("localhost").with_ca_dir(empty.path()))
        .build()
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ProvisioningFailure(_)));

    let err = ServerBuilder::new()
        .tls(TlsServerConfig::new(
            empty.path().join("missing.pem"),
            empty.path().join("missing.key"),
        ))
        .build()
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ProvisioningFailure(_)));

    let err = ClientBuilder::new("127.0.0.1", 1)
        .require_tls(true)
        .build()
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError(_)));
}
