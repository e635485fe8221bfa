//! Server identity for the protocol listeners.
//!
//! Each device listener terminates TLS with its own certificate override or
//! the shared default identity. No client certificate is requested.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cardgate_devices::DeviceConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use thiserror::Error;

/// TLS identity errors.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("No server identity configured for device {0}")]
    MissingIdentity(String),

    #[error("Rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Read every certificate of a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let chain = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(chain)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) of a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Build a server config from PEM files, without client authentication.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

/// Resolves the TLS server config of a device listener.
pub trait KeystoreProvider: Send + Sync {
    fn server_config(&self, device: &DeviceConfig) -> Result<Arc<ServerConfig>, TlsError>;
}

/// PEM files on disk: the device override, else the shared default.
#[derive(Debug, Clone, Default)]
pub struct PemKeystore {
    default_identity: Option<(PathBuf, PathBuf)>,
}

impl PemKeystore {
    pub fn new(cert_path: Option<PathBuf>, key_path: Option<PathBuf>) -> Self {
        Self {
            default_identity: cert_path.zip(key_path),
        }
    }
}

impl KeystoreProvider for PemKeystore {
    fn server_config(&self, device: &DeviceConfig) -> Result<Arc<ServerConfig>, TlsError> {
        if let Some(tls) = device.tls_override() {
            return server_config(&tls.cert_path, &tls.key_path);
        }
        match &self.default_identity {
            Some((cert_path, key_path)) => server_config(cert_path, key_path),
            None => Err(TlsError::MissingIdentity(device.key().to_string())),
        }
    }
}
