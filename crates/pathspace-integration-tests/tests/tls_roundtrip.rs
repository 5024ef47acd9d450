//! Integration test: mutual TLS transport end to end.
//!
//! Mints a throwaway CA plus server and client certificates, runs the TLS
//! acceptor on an ephemeral port, and mounts through it:
//! 1. The handshake succeeds and the server learns the client certificate's
//!    fingerprint and subject.
//! 2. A typed insert/read round trip crosses the real framed transport.
//! 3. A factory without a client certificate is refused up front.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use pathspace_client::{
    ManagerOptions, MountManager, MountOptions, SessionFactory, TlsClientConfig,
};
use pathspace_integration_tests::{full_capabilities, test_auth};
use pathspace_server::{ExportOptions, MountServer, ServerOptions};
use pathspace_space::PathSpace;
use pathspace_transport::{TlsMountServer, TlsServerConfig, TlsSessionFactory};
use pathspace_wire::AuthContext;

struct TestPki {
    _dir: tempfile::TempDir,
    ca_path: String,
    server_cert_path: String,
    server_key_path: String,
    client_cert_path: String,
    client_key_path: String,
}

fn write_pem(dir: &tempfile::TempDir, name: &str, pem: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create pem");
    file.write_all(pem.as_bytes()).expect("write pem");
    path.to_str().expect("utf8 path").to_string()
}

fn make_pki() -> TestPki {
    let dir = tempfile::tempdir().expect("temp dir");

    let ca_key = rcgen::KeyPair::generate().expect("ca key");
    let mut ca_params = rcgen::CertificateParams::new(Vec::new()).expect("ca params");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "pathspace-test-ca");
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let server_key = rcgen::KeyPair::generate().expect("server key");
    let server_params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("server params");
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .expect("server cert");

    let client_key = rcgen::KeyPair::generate().expect("client key");
    let mut client_params =
        rcgen::CertificateParams::new(vec!["pathspace-client".to_string()]).expect("params");
    client_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "pathspace-client");
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .expect("client cert");

    TestPki {
        ca_path: write_pem(&dir, "ca.pem", &ca_cert.pem()),
        server_cert_path: write_pem(&dir, "server.pem", &server_cert.pem()),
        server_key_path: write_pem(&dir, "server.key", &server_key.serialize_pem()),
        client_cert_path: write_pem(&dir, "client.pem", &client_cert.pem()),
        client_key_path: write_pem(&dir, "client.key", &client_key.serialize_pem()),
        _dir: dir,
    }
}

#[test]
fn test_mutual_tls_mount_roundtrip() {
    let pki = make_pki();

    let server_space = PathSpace::new();
    let server = MountServer::new(ServerOptions {
        exports: vec![ExportOptions {
            alias: "demo".into(),
            export_root: "/data".into(),
            space: Some(Arc::clone(&server_space)),
            capabilities: vec!["read".into(), "wait".into(), "insert".into(), "take".into()],
            ..ExportOptions::default()
        }],
        ..ServerOptions::default()
    });
    let tls_server = TlsMountServer::new(
        TlsServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            certificate_path: pki.server_cert_path.clone(),
            private_key_path: pki.server_key_path.clone(),
            ca_cert_path: pki.ca_path.clone(),
            require_client_certificate: true,
            ..TlsServerConfig::default()
        },
        Arc::clone(&server),
    );
    assert!(tls_server.start());
    let port = tls_server.port();
    assert_ne!(port, 0);

    let client_space = PathSpace::new();
    let tls_config = TlsClientConfig {
        ca_cert_path: pki.ca_path.clone(),
        client_cert_path: pki.client_cert_path.clone(),
        client_key_path: pki.client_key_path.clone(),
        sni_host: "localhost".into(),
        ..TlsClientConfig::default()
    };
    // Auth is left for the transport: fingerprint, proof, and subject come
    // from the client certificate.
    let auth = AuthContext {
        subject: String::new(),
        proof: String::new(),
        ..test_auth()
    };
    let factory: Arc<dyn SessionFactory> = Arc::new(TlsSessionFactory::new(None));
    let manager = MountManager::new(
        ManagerOptions {
            root_space: Some(Arc::clone(&client_space)),
            mounts: vec![MountOptions {
                alias: "demo".into(),
                export_root: "/data".into(),
                host: "127.0.0.1".into(),
                port,
                capabilities: full_capabilities(),
                auth,
                tls: Some(tls_config),
                ..MountOptions::default()
            }],
            ..ManagerOptions::default()
        },
        factory,
    );
    manager.start();

    let statuses = manager.statuses();
    assert!(statuses[0].connected, "mount failed: {}", statuses[0].message);

    let inserted = client_space.insert("/remote/demo/x", &"over-tls".to_string());
    assert!(inserted.is_ok(), "insert failed: {:?}", inserted.errors);

    let on_server: String = server_space.read("/data/x").expect("server read");
    assert_eq!(on_server, "over-tls");
    let through_mount: String = client_space.read("/remote/demo/x").expect("mount read");
    assert_eq!(through_mount, "over-tls");

    manager.stop();
    tls_server.stop();
}

#[test]
fn test_factory_requires_client_certificate() {
    let factory = TlsSessionFactory::new(None);
    let result = factory.create(&MountOptions {
        alias: "demo".into(),
        export_root: "/data".into(),
        tls: Some(TlsClientConfig::default()),
        ..MountOptions::default()
    });
    assert!(result.is_err());
}
