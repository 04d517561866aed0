//! Certificate loading and TLS server configuration.
//!
//! Certificate and key files are PEM. The server advertises `h2` first and
//! `http/1.1` second through ALPN; the accept loop serves whichever the
//! client picks.

use bevy_log::debug;
use futures_rustls::TlsAcceptor;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use super::SslConfig;
use crate::{WebServerError, WebServerResult};

pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

fn open(path: &Path) -> WebServerResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| WebServerError::certificate_load(path, e.to_string()))
}

pub(crate) fn load_certificates(path: &Path) -> WebServerResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WebServerError::certificate_load(path, e.to_string()))?;

    if certs.is_empty() {
        return Err(WebServerError::certificate_load(
            path,
            "no PEM certificate found",
        ));
    }
    Ok(certs)
}

pub(crate) fn load_private_key(path: &Path) -> WebServerResult<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| WebServerError::certificate_load(path, e.to_string()))?
        .ok_or_else(|| WebServerError::certificate_load(path, "no PEM private key found"))
}

fn load_client_roots(path: &Path) -> WebServerResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots
            .add(cert)
            .map_err(|e| WebServerError::certificate_load(path, e.to_string()))?;
    }
    Ok(roots)
}

/// Build the acceptor that upgrades accepted sockets to TLS.
///
/// Every file is read before anything is bound, so a bad path never leaves
/// a half-started server behind.
pub(crate) fn build_acceptor(ssl: &SslConfig) -> WebServerResult<TlsAcceptor> {
    let certs = load_certificates(&ssl.certificate)?;
    let key = load_private_key(&ssl.key)?;
    let provider = Arc::new(default_provider());

    let builder = RustlsServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| WebServerError::tls_config(e.to_string()))?;

    let builder = match &ssl.client_ca {
        Some(ca) => {
            let roots = load_client_roots(ca)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| WebServerError::tls_config(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| WebServerError::tls_config(e.to_string()))?;
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];

    debug!(
        "TLS acceptor built from {} (client auth: {})",
        ssl.certificate.display(),
        ssl.client_ca.is_some()
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    fn ssl(certificate: &str, key: &str) -> SslConfig {
        SslConfig {
            certificate: fixture(certificate),
            key: fixture(key),
            client_ca: None,
        }
    }

    #[test]
    fn test_loads_fixture_material() {
        assert_eq!(load_certificates(&fixture("localhost.crt")).unwrap().len(), 1);
        assert!(load_private_key(&fixture("localhost.key")).is_ok());
        assert!(build_acceptor(&ssl("localhost.crt", "localhost.key")).is_ok());
    }

    #[test]
    fn test_missing_certificate_is_a_load_error() {
        let err = build_acceptor(&ssl("missing.crt", "localhost.key")).err().unwrap();
        match err {
            WebServerError::CertificateLoad { path, .. } => {
                assert_eq!(path, fixture("missing.crt"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_key_is_a_load_error() {
        let err = build_acceptor(&ssl("localhost.crt", "missing.key")).err().unwrap();
        assert!(matches!(err, WebServerError::CertificateLoad { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_file_without_key_is_rejected() {
        // The certificate file holds no private key block.
        let err = load_private_key(&fixture("localhost.crt")).unwrap_err();
        assert!(err.to_string().contains("no PEM private key found"));

        let err = load_certificates(&fixture("localhost.key")).unwrap_err();
        assert!(err.to_string().contains("no PEM certificate found"));
    }

    #[test]
    fn test_client_ca_is_loaded() {
        let mut config = ssl("localhost.crt", "localhost.key");
        config.client_ca = Some(fixture("localhost.crt"));
        assert!(build_acceptor(&config).is_ok());

        config.client_ca = Some(fixture("missing-ca.pem"));
        assert!(matches!(
            build_acceptor(&config),
            Err(WebServerError::CertificateLoad { .. })
        ));
    }
}
