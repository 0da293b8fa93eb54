//! TLS wrapping for server and client sockets, on top of rustls.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::Connection;

/// Errors produced while setting up or negotiating TLS.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid server name for TLS: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),
}

/// Paths to a PEM certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsCredentials {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsCredentials {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Credentials {
            path: path.to_owned(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Credentials {
            path: path.to_owned(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_owned()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Credentials {
            path: path.to_owned(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_owned()))
}

/// Builds a server configuration from PEM files.
pub fn load_server_config(credentials: &TlsCredentials) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(&credentials.cert_path)?;
    let key = load_key(&credentials.key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client configuration trusting the bundled Mozilla root store.
pub fn client_config() -> Arc<ClientConfig> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// Wraps an accepted socket and completes the server handshake.
///
/// Socket timeouts must be set beforehand; they bound the handshake too.
pub fn accept(config: &Arc<ServerConfig>, mut tcp: TcpStream) -> Result<Connection, TlsError> {
    let mut conn = ServerConnection::new(Arc::clone(config))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)?;
    }
    debug!(peer = ?tcp.peer_addr().ok(), "TLS handshake complete");
    Ok(Connection::TlsServer(Box::new(StreamOwned::new(conn, tcp))))
}

/// Wraps a connected socket for `host` and completes the client handshake.
pub fn connect(config: &Arc<ClientConfig>, host: &str, mut tcp: TcpStream) -> Result<Connection, TlsError> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| TlsError::InvalidServerName(host.to_owned()))?;
    let mut conn = ClientConnection::new(Arc::clone(config), server_name)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)?;
    }
    Ok(Connection::TlsClient(Box::new(StreamOwned::new(conn, tcp))))
}
