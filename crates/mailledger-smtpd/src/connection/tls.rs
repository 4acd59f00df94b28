//! TLS material for STARTTLS.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Error, Result};

/// Builds a server TLS configuration from PEM files.
///
/// `cert_path` holds the certificate chain, leaf first; `key_path` holds the
/// private key (PKCS#8, PKCS#1 or SEC1). Client certificates are not
/// requested.
///
/// # Errors
///
/// Returns [`Error::Config`] if a file cannot be read or holds no usable
/// material, and [`Error::Tls`] if rustls rejects the certificate/key pair.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_key(key_path.as_ref())?;
    server_config(certs, key)
}

/// Builds a server TLS configuration from DER-encoded material.
///
/// # Errors
///
/// Returns [`Error::Tls`] if rustls rejects the certificate/key pair.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("invalid certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::Config(format!("invalid private key in {}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mailledger-smtpd-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_load_from_pem() {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = temp_path("cert.pem");
        let key_path = temp_path("key.pem");
        std::fs::write(&cert_path, key.cert.pem()).unwrap();
        std::fs::write(&key_path, key.signing_key.serialize_pem()).unwrap();

        let config = load_server_config(&cert_path, &key_path);
        std::fs::remove_file(&cert_path).ok();
        std::fs::remove_file(&key_path).ok();
        assert!(config.is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_server_config(temp_path("nope.pem"), temp_path("nope.key")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_certificate_file() {
        let cert_path = temp_path("empty.pem");
        std::fs::write(&cert_path, "").unwrap();
        let err = load_server_config(&cert_path, &cert_path).unwrap_err();
        std::fs::remove_file(&cert_path).ok();
        assert!(matches!(err, Error::Config(msg) if msg.contains("no certificate")));
    }
}
