//! TLS acceptor construction from PEM text.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsPem;
use crate::error::{ServerError, ServerResult};

/// Builds a [`TlsAcceptor`] for the given key and certificate chain.
///
/// # Errors
///
/// [`ServerError::Tls`] when either PEM is malformed or empty, or when the
/// key does not fit the certificate.
pub fn acceptor(pem: &TlsPem) -> ServerResult<TlsAcceptor> {
    let certs = certificates(&pem.cert_pem)?;
    let key = private_key(&pem.key_pem)?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ServerError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn certificates(pem: &str) -> ServerResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("unreadable certificate: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificate found".into()));
    }
    Ok(certs)
}

fn private_key(pem: &str) -> ServerResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ServerError::Tls(format!("unreadable private key: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT_BLOCK: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

    fn tls_message(result: ServerResult<TlsAcceptor>) -> String {
        match result {
            Err(ServerError::Tls(msg)) => msg,
            Err(other) => panic!("expected TLS error, got {other}"),
            Ok(_) => panic!("expected TLS error, got an acceptor"),
        }
    }

    #[test]
    fn empty_certificate_is_rejected() {
        let msg = tls_message(acceptor(&TlsPem::new("", "")));
        assert!(msg.contains("certificate"));
    }

    #[test]
    fn missing_key_is_rejected() {
        let msg = tls_message(acceptor(&TlsPem::new("not a key", CERT_BLOCK)));
        assert!(msg.contains("private key"));
    }

    #[test]
    fn certificate_in_key_slot_is_not_a_key() {
        let msg = tls_message(acceptor(&TlsPem::new(CERT_BLOCK, CERT_BLOCK)));
        assert!(msg.contains("private key"));
    }
}
