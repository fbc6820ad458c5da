//! Error types produced while configuring and running a server.
//!
//! Two layers exist:
//!
//! - [`ConfigError`]: invalid settings, surfaced before any socket is opened.
//! - [`ServerError`]: everything that can end a serve invocation, including
//!   bind failures and fatal accept errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("negative size of reading buffer: {0}")]
    NegativeReadBuffer(isize),

    #[error("negative size of writing buffer: {0}")]
    NegativeWriteBuffer(isize),

    #[error("negative workers limit: {0}")]
    NegativeWorkersLimit(isize),

    #[error("unknown network {0:?} (expected \"tcp\", \"tcp4\" or \"tcp6\")")]
    UnknownNetwork(String),

    #[error("invalid address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("address {addr:?} has no {network} candidates")]
    NoAddress { addr: String, network: String },

    #[error("no TLS configuration or certificate/key pair provided")]
    MissingTlsMaterial,

    #[error("failed to read TLS file {path}: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS certificate/key: {0}")]
    InvalidTls(String),
}

/// Errors that end a serve invocation.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("serve task ended without reporting a result")]
    Aborted,
}

impl ServerError {
    /// Returns `true` for errors raised before any network activity.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_is_transparent() {
        let err = ServerError::from(ConfigError::NegativeWorkersLimit(-2));
        assert!(err.is_config());
        assert_eq!(err.to_string(), "negative workers limit: -2");
    }

    #[test]
    fn bind_error_names_address() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:80".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(!err.is_config());
        assert!(err.to_string().starts_with("failed to bind to 127.0.0.1:80"));
    }
}
