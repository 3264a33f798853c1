//! TLS boundary.
//!
//! The transport never does cryptography itself. It frames bytes between
//! the WebSocket and a [`TlsEngine`]: handshake output goes out raw, inbound
//! bytes are fed back in, and once the engine is done every application
//! chunk passes through it in both directions.

use bytes::Bytes;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::error::{ServerlessError, ServerlessResult};

/// Where the TLS session is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsPhase {
    #[default]
    Idle,
    Handshaking,
    Established,
}

/// Result of feeding ciphertext to an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOutput {
    /// Decrypted application data.
    pub plaintext: Bytes,
    /// Records the engine wants sent (handshake flights, alerts, key updates).
    pub to_send: Bytes,
}

/// Sans-IO TLS client engine.
pub trait TlsEngine: Send {
    /// Begin the handshake; returns the first flight.
    fn start(&mut self) -> ServerlessResult<Bytes>;

    /// Consume bytes received from the peer.
    fn read_tls(&mut self, data: &[u8]) -> ServerlessResult<TlsOutput>;

    /// Encrypt application data into records.
    fn encrypt(&mut self, plaintext: &[u8]) -> ServerlessResult<Bytes>;

    fn is_handshaking(&self) -> bool;

    /// Whether the peer's certificate verified.
    ///
    /// Read once, after `is_handshaking` turns false. An engine that lets a
    /// handshake finish despite a failed verification must return false
    /// here; the socket still becomes secure and reports it via
    /// [`WsSocket::authorized`](crate::socket::WsSocket::authorized).
    fn authorized(&self) -> bool;
}

/// Default engine on rustls (ring provider).
pub struct RustlsEngine {
    conn: rustls::ClientConnection,
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

fn tls_error(message: impl std::fmt::Display) -> ServerlessError {
    ServerlessError::Tls(message.to_string())
}

/// Trust store from a PEM bundle; an empty bundle means the webpki roots.
pub fn root_store(root_certs_pem: &str) -> ServerlessResult<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    if root_certs_pem.trim().is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    }

    for cert in rustls_pemfile::certs(&mut root_certs_pem.as_bytes()) {
        let cert = cert.map_err(|e| tls_error(format!("Invalid PEM in root certificates: {}", e)))?;
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("Invalid root certificate: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(tls_error("No certificates found in root certificates"));
    }
    Ok(roots)
}

impl RustlsEngine {
    pub fn new(host: &str, root_certs_pem: &str, disable_sni: bool) -> ServerlessResult<Self> {
        Self::with_roots(host, root_store(root_certs_pem)?, disable_sni)
    }

    pub fn with_roots(
        host: &str,
        roots: rustls::RootCertStore,
        disable_sni: bool,
    ) -> ServerlessResult<Self> {
        let provider = rustls::crypto::ring::default_provider();
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error(format!("Failed to set protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.enable_sni = !disable_sni;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| tls_error(format!("Invalid hostname for TLS: {}", host)))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(tls_error)?;
        Ok(Self { conn })
    }

    fn drain_records(&mut self) -> ServerlessResult<Bytes> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out).map_err(tls_error)?;
        }
        Ok(Bytes::from(out))
    }
}

impl TlsEngine for RustlsEngine {
    fn start(&mut self) -> ServerlessResult<Bytes> {
        self.drain_records()
    }

    fn read_tls(&mut self, data: &[u8]) -> ServerlessResult<TlsOutput> {
        let mut input = data;
        let mut plaintext = Vec::new();

        while !input.is_empty() {
            if self.conn.read_tls(&mut input).map_err(tls_error)? == 0 {
                break;
            }
            let state = self.conn.process_new_packets().map_err(tls_error)?;

            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plaintext.len();
                plaintext.resize(start + available, 0);
                self.conn
                    .reader()
                    .read_exact(&mut plaintext[start..])
                    .map_err(tls_error)?;
            }
        }

        Ok(TlsOutput {
            plaintext: Bytes::from(plaintext),
            to_send: self.drain_records()?,
        })
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> ServerlessResult<Bytes> {
        self.conn.writer().write_all(plaintext).map_err(tls_error)?;
        self.drain_records()
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn authorized(&self) -> bool {
        // a failed verification aborts the handshake with an error, so a
        // finished one is verified
        !self.conn.is_handshaking()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_carries_sni() {
        let mut engine = RustlsEngine::new("db.example.com", "", false).unwrap();
        assert!(engine.is_handshaking());
        let hello = engine.start().unwrap();
        // TLS handshake record
        assert_eq!(hello[0], 0x16);
        assert!(hello.windows(14).any(|w| w == b"db.example.com"));
    }

    #[test]
    fn test_client_hello_without_sni() {
        let mut engine = RustlsEngine::new("db.example.com", "", true).unwrap();
        let hello = engine.start().unwrap();
        assert!(!hello.windows(14).any(|w| w == b"db.example.com"));
    }

    #[test]
    fn test_bad_pem_rejected() {
        let err = root_store("not a certificate").unwrap_err();
        assert!(matches!(err, ServerlessError::Tls(_)));
    }

    #[test]
    fn test_garbage_from_peer_is_tls_error() {
        let mut engine = RustlsEngine::new("db.example.com", "", false).unwrap();
        engine.start().unwrap();
        let err = engine.read_tls(b"NOT TLS AT ALL").unwrap_err();
        assert!(matches!(err, ServerlessError::Tls(_)));
        assert!(!engine.authorized());
    }

    #[test]
    fn test_not_authorized_while_handshaking() {
        let mut engine = RustlsEngine::new("db.example.com", "", false).unwrap();
        engine.start().unwrap();
        assert!(!engine.authorized());
    }
}
