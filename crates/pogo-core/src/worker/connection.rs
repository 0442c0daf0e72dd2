//! Worker session transport
//!
//! The dispatcher initiates a long-lived, mutually-authenticated TLS
//! connection to each worker and speaks the length-prefixed JSON protocol
//! over it. Worker certificates are validated against the configured CA
//! and, when configured, pinned by SHA-256 fingerprint. Plain TCP is
//! supported for tests only.

use crate::config::TlsConfig;
use crate::worker::protocol::Codec;
use crate::{Error, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::debug;

/// Hex SHA-256 fingerprint of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Accepts only certificates whose SHA-256 fingerprint is pinned
struct FingerprintVerifier {
    pinned: HashSet<String>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint(&end_entity.0);
        if self.pinned.contains(&fp) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "worker certificate fingerprint not pinned: {}",
                fp
            )))
        }
    }
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("Cannot open {}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| Error::Config(format!("Cannot parse {}: {}", path, e)))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("Cannot open {}: {}", path, e)))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .map_err(|e| Error::Config(format!("Cannot parse {}: {}", path, e)))?;
    keys.pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::Config(format!("No private key in {}", path)))
}

/// Build the rustls client config from the workers TLS section
pub fn build_tls_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let cert_file = tls
        .cert_file
        .as_ref()
        .ok_or_else(|| Error::Config("workers.tls.cert_file missing".to_string()))?;
    let key_file = tls
        .key_file
        .as_ref()
        .ok_or_else(|| Error::Config("workers.tls.key_file missing".to_string()))?;

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let builder = ClientConfig::builder().with_safe_defaults();

    let config = if tls.pinned_sha256.is_empty() {
        let ca_file = tls
            .ca_file
            .as_ref()
            .ok_or_else(|| Error::Config("workers.tls.ca_file missing".to_string()))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(&cert)
                .map_err(|e| Error::Config(format!("Bad CA certificate: {}", e)))?;
        }
        builder
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Config(format!("Bad client certificate: {}", e)))?
    } else {
        let verifier = FingerprintVerifier {
            pinned: tls.pinned_sha256.iter().map(|s| s.to_lowercase()).collect(),
        };
        let mut config = builder
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Config(format!("Bad client certificate: {}", e)))?;
        config.enable_sni = false;
        config
    };

    Ok(Arc::new(config))
}

/// Either side of the worker transport
pub enum WorkerStream {
    /// Plain TCP, tests only
    Plain(TcpStream),

    /// Mutually-authenticated TLS
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for WorkerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            WorkerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WorkerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            WorkerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            WorkerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            WorkerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            WorkerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Framed protocol stream over the worker transport
pub type WorkerFramed = Framed<WorkerStream, Codec>;

/// Connect to a worker address, with TLS when configured
pub async fn connect(address: &str, tls: Option<Arc<ClientConfig>>) -> Result<WorkerFramed> {
    let tcp = TcpStream::connect(address)
        .await
        .map_err(|e| Error::WorkerLost(format!("connect {}: {}", address, e)))?;
    tcp.set_nodelay(true).ok();

    let stream = match tls {
        Some(config) => {
            let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
            let server_name = ServerName::try_from(host)
                .unwrap_or_else(|_| ServerName::try_from("worker").unwrap());
            let connector = TlsConnector::from(config);
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::WorkerLost(format!("TLS handshake {}: {}", address, e)))?;
            debug!("TLS session established: address={}", address);
            WorkerStream::Tls(Box::new(tls_stream))
        }
        None => WorkerStream::Plain(tcp),
    };

    Ok(Framed::new(stream, Codec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint(b"not really a cert");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic
        assert_eq!(fp, fingerprint(b"not really a cert"));
    }

    #[test]
    fn test_verifier_rejects_unpinned() {
        let verifier = FingerprintVerifier {
            pinned: HashSet::from([fingerprint(b"good cert")]),
        };
        let good = Certificate(b"good cert".to_vec());
        let bad = Certificate(b"evil cert".to_vec());
        let name = ServerName::try_from("worker").unwrap();

        assert!(verifier
            .verify_server_cert(&good, &[], &name, &mut std::iter::empty(), &[], std::time::SystemTime::now())
            .is_ok());
        assert!(verifier
            .verify_server_cert(&bad, &[], &name, &mut std::iter::empty(), &[], std::time::SystemTime::now())
            .is_err());
    }
}
