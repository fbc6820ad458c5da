//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

use crate::error::ConfigError;

/// Picks the TLS material for a serve call.
///
/// A non-empty certificate/key pair wins and produces a fresh config;
/// two empty paths fall back to `preset`. Anything else is
/// [`ConfigError::MissingTlsMaterial`].
pub fn select_config(
    preset: Option<&Arc<ServerConfig>>,
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<ServerConfig>, ConfigError> {
    match (cert_file.is_empty(), key_file.is_empty(), preset) {
        (false, false, _) => Ok(Arc::new(server_config_from_pem(cert_file, key_file)?)),
        (true, true, Some(preset)) => Ok(Arc::clone(preset)),
        _ => Err(ConfigError::MissingTlsMaterial),
    }
}

pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

/// Builds a server config from a PEM certificate chain and private key.
pub fn server_config_from_pem(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<ServerConfig, ConfigError> {
    let certs = load_certs(cert_file.as_ref())?;
    let key = load_private_key(key_file.as_ref())?;

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::InvalidTls(e.to_string()))
}

/// Reads every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, ConfigError> {
    let mut reader = open(path)?;
    let chain = certs(&mut reader).map_err(|source| ConfigError::TlsFile {
        path: path.to_owned(),
        source,
    })?;
    if chain.is_empty() {
        return Err(ConfigError::InvalidTls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Reads the first PKCS#8 key in a PEM file, falling back to PKCS#1 RSA.
pub fn load_private_key(path: &Path) -> Result<PrivateKey, ConfigError> {
    let file_err = |source| ConfigError::TlsFile {
        path: path.to_owned(),
        source,
    };

    let mut reader = open(path)?;
    if let Some(key) = pkcs8_private_keys(&mut reader).map_err(file_err)?.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let mut reader = open(path)?;
    rsa_private_keys(&mut reader)
        .map_err(file_err)?
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ConfigError::NoPrivateKey(path.to_owned()))
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::TlsFile {
            path: path.to_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/cert.pem");
    const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/key.pem");

    #[test]
    fn loads_pem_pair() {
        assert_eq!(load_certs(Path::new(CERT)).unwrap().len(), 1);
        assert!(load_private_key(Path::new(KEY)).is_ok());
        assert!(server_config_from_pem(CERT, KEY).is_ok());
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        assert!(matches!(
            load_private_key(Path::new(CERT)),
            Err(ConfigError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn cert_file_without_certs_is_rejected() {
        assert!(matches!(
            load_certs(Path::new(KEY)),
            Err(ConfigError::InvalidTls(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            load_certs(Path::new("/definitely/not/here.pem")),
            Err(ConfigError::TlsFile { .. })
        ));
    }

    #[test]
    fn selection_rules() {
        let preset = Arc::new(server_config_from_pem(CERT, KEY).unwrap());

        let chosen = select_config(Some(&preset), "", "").unwrap();
        assert!(Arc::ptr_eq(&chosen, &preset));

        let fresh = select_config(Some(&preset), CERT, KEY).unwrap();
        assert!(!Arc::ptr_eq(&fresh, &preset));

        assert!(matches!(
            select_config(None, "", ""),
            Err(ConfigError::MissingTlsMaterial)
        ));
        assert!(matches!(
            select_config(Some(&preset), CERT, ""),
            Err(ConfigError::MissingTlsMaterial)
        ));
    }
}
