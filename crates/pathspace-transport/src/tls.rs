//! rustls configuration and peer identity extraction.
//!
//! Both sides speak TLS 1.3 over TCP with the ring provider. The server
//! requires a client certificate when configured for mutual auth; the
//! client verifies the server chain against a configured CA unless
//! verification is explicitly disabled for tests.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use pathspace_types::{Error, Expected};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use pathspace_client::TlsClientConfig;

fn tls_error(context: &str, detail: impl std::fmt::Display) -> Error {
    Error::Unknown(format!("{context}: {detail}"))
}

/// Load a PEM certificate chain.
pub fn load_certificates(path: &str) -> Expected<Vec<CertificateDer<'static>>> {
    if path.is_empty() {
        return Err(Error::Unknown("certificate path missing".into()));
    }
    let file = File::open(path).map_err(|e| tls_error("failed to open certificate", e))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| tls_error("invalid certificate", e))?;
    if certs.is_empty() {
        return Err(tls_error("invalid certificate", path));
    }
    Ok(certs)
}

/// Load a PEM private key.
pub fn load_private_key(path: &str) -> Expected<PrivateKeyDer<'static>> {
    if path.is_empty() {
        return Err(Error::Unknown("private key path missing".into()));
    }
    let file = File::open(path).map_err(|e| tls_error("failed to open private key", e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error("invalid private key", e))?
        .ok_or_else(|| tls_error("invalid private key", path))
}

/// `sha256:<hex>` fingerprint of a DER certificate.
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    format!("sha256:{}", hex::encode(digest))
}

/// Subject DN of a DER certificate, empty when unparsable.
pub fn certificate_subject(cert: &CertificateDer<'_>) -> String {
    match x509_parser::parse_x509_certificate(cert.as_ref()) {
        Ok((_, parsed)) => parsed.subject().to_string(),
        Err(_) => String::new(),
    }
}

/// Build the client-side rustls configuration.
pub fn build_client_config(config: &TlsClientConfig) -> Expected<Arc<rustls::ClientConfig>> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("client TLS version config failed", e))?;

    let builder = if config.verify_server_certificate {
        if config.ca_cert_path.is_empty() {
            return Err(Error::Unknown("ca_cert_path required for TLS".into()));
        }
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certificates(&config.ca_cert_path)? {
            roots
                .add(cert)
                .map_err(|e| tls_error("invalid CA certificate", e))?;
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    };

    let tls_config = if !config.client_cert_path.is_empty() {
        let chain = load_certificates(&config.client_cert_path)?;
        let key = load_private_key(&config.client_key_path)?;
        builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| tls_error("client TLS config failed", e))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Arc::new(tls_config))
}

/// Build the server-side rustls configuration.
pub fn build_server_config(
    certificate_path: &str,
    private_key_path: &str,
    ca_cert_path: &str,
    require_client_certificate: bool,
) -> Expected<Arc<rustls::ServerConfig>> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("server TLS version config failed", e))?;

    let builder = if require_client_certificate {
        if ca_cert_path.is_empty() {
            return Err(Error::Unknown("ca_cert_path required for mTLS".into()));
        }
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certificates(ca_cert_path)? {
            roots
                .add(cert)
                .map_err(|e| tls_error("invalid CA certificate", e))?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| tls_error("client verifier config failed", e))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let chain = load_certificates(certificate_path)?;
    let key = load_private_key(private_key_path)?;
    let tls_config = builder
        .with_single_cert(chain, key)
        .map_err(|e| tls_error("server TLS config failed", e))?;
    Ok(Arc::new(tls_config))
}

/// Server certificate verifier that accepts anything.
///
/// Only reachable when `verify_server_certificate` is disabled, which is a
/// test-only configuration.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    fn generate_cert() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("cert")
    }

    #[test]
    fn test_load_certificates_and_key() {
        let cert = generate_cert();
        let cert_file = write_temp(&cert.cert.pem());
        let key_file = write_temp(&cert.key_pair.serialize_pem());

        let chain =
            load_certificates(cert_file.path().to_str().expect("path")).expect("chain");
        assert_eq!(chain.len(), 1);
        load_private_key(key_file.path().to_str().expect("path")).expect("key");
    }

    #[test]
    fn test_missing_paths_rejected() {
        assert!(load_certificates("").is_err());
        assert!(load_private_key("").is_err());
        assert!(load_certificates("/no/such/file.pem").is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let cert = generate_cert();
        let der = CertificateDer::from(cert.cert.der().to_vec());
        let fingerprint = certificate_fingerprint(&der);
        assert!(fingerprint.starts_with("sha256:"));
        assert_eq!(fingerprint.len(), "sha256:".len() + 64);
        // Deterministic for the same certificate.
        assert_eq!(fingerprint, certificate_fingerprint(&der));
    }

    #[test]
    fn test_subject_extraction() {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .expect("params");
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "pathspace-test");
        let key = rcgen::KeyPair::generate().expect("key");
        let cert = params.self_signed(&key).expect("cert");
        let der = CertificateDer::from(cert.der().to_vec());
        let subject = certificate_subject(&der);
        assert!(subject.contains("pathspace-test"));
    }

    #[test]
    fn test_client_config_requires_ca_when_verifying() {
        let config = TlsClientConfig::default();
        assert!(build_client_config(&config).is_err());

        let config = TlsClientConfig {
            verify_server_certificate: false,
            ..TlsClientConfig::default()
        };
        build_client_config(&config).expect("config without verification");
    }

    #[test]
    fn test_server_config_builds_with_generated_certs() {
        let ca = generate_cert();
        let server = generate_cert();
        let ca_file = write_temp(&ca.cert.pem());
        let cert_file = write_temp(&server.cert.pem());
        let key_file = write_temp(&server.key_pair.serialize_pem());

        build_server_config(
            cert_file.path().to_str().expect("path"),
            key_file.path().to_str().expect("path"),
            ca_file.path().to_str().expect("path"),
            true,
        )
        .expect("server config");
    }
}
