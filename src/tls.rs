//! TLS wrapping for session streams
//!
//! Clients try TLS before plain TCP. Servers only offer TLS when the
//! certificate, key and CA files are all present and load cleanly.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

pub const DEFAULT_CERT: &str = "cert.pem";
pub const DEFAULT_KEY: &str = "key.pem";
pub const DEFAULT_CA: &str = "ca.pem";

/// First byte of a TLS handshake record
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Load private key from a PEM file
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

fn load_root_store(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store.add(cert)?;
    }
    Ok(root_store)
}

/// TLS configuration for the server
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub enabled: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    /// Require client certificates signed by the CA
    pub verify_client: bool,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: PathBuf::from(DEFAULT_CERT),
            key_path: PathBuf::from(DEFAULT_KEY),
            ca_path: PathBuf::from(DEFAULT_CA),
            verify_client: false,
        }
    }
}

impl TlsServerConfig {
    /// The first of the certificate, key and CA files that does not exist.
    pub fn missing_file(&self) -> Option<&Path> {
        [&self.cert_path, &self.key_path, &self.ca_path]
            .into_iter()
            .find(|p| !p.exists())
            .map(PathBuf::as_path)
    }

    /// Create a TLS acceptor from this configuration
    pub fn create_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.enabled {
            return Ok(None);
        }
        if let Some(missing) = self.missing_file() {
            anyhow::bail!("TLS file {} not found", missing.display());
        }

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;
        let root_store = load_root_store(&self.ca_path)?;

        let config = if self.verify_client {
            let verifier =
                rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store)).build()?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        } else {
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)?
        };

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    /// Acceptor for a server run, or `None` with a log line when TLS is off.
    pub fn acceptor_for_run(&self) -> Option<TlsAcceptor> {
        match self.create_acceptor() {
            Ok(Some(acceptor)) => {
                info!(
                    "TLS enabled: cert={} key={} ca={}",
                    self.cert_path.display(),
                    self.key_path.display(),
                    self.ca_path.display()
                );
                Some(acceptor)
            }
            Ok(None) => {
                info!("TLS disabled by configuration");
                None
            }
            Err(e) => {
                info!("TLS disabled: {:#}", e);
                None
            }
        }
    }
}

/// TLS configuration for the client
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    pub enabled: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Extra trust anchor added to the system roots
    pub ca_path: Option<PathBuf>,
    pub verify_server: bool,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: PathBuf::from(DEFAULT_CERT),
            key_path: PathBuf::from(DEFAULT_KEY),
            ca_path: None,
            verify_server: true,
        }
    }
}

impl TlsClientConfig {
    /// Create a TLS connector from this configuration
    ///
    /// A missing client key pair or CA file is logged and skipped; the
    /// connection is attempted with what remains.
    pub fn create_connector(&self) -> anyhow::Result<Option<TlsConnector>> {
        if !self.enabled {
            return Ok(None);
        }

        let builder = if self.verify_server {
            ClientConfig::builder().with_root_certificates(self.root_store())
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
        };

        let config = match self.client_identity() {
            Ok((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            Err(e) => {
                warn!(
                    "Failed to load TLS key pair, connecting without client certificate: {:#}",
                    e
                );
                builder.with_no_client_auth()
            }
        };

        Ok(Some(TlsConnector::from(Arc::new(config))))
    }

    fn client_identity(
        &self,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        Ok((
            load_certs(&self.cert_path)?,
            load_private_key(&self.key_path)?,
        ))
    }

    fn root_store(&self) -> RootCertStore {
        let mut root_store = RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs();
        for e in &native_certs.errors {
            warn!("Failed to load system certificate: {}", e);
        }
        for cert in native_certs.certs {
            root_store.add(cert).ok();
        }

        if let Some(ca_path) = &self.ca_path {
            match load_certs(ca_path) {
                Ok(ca_certs) => {
                    for cert in ca_certs {
                        if let Err(e) = root_store.add(cert) {
                            warn!("Skipping CA certificate from {}: {}", ca_path.display(), e);
                        }
                    }
                }
                Err(e) => warn!("Failed to read CA file: {:#}", e),
            }
        }
        root_store
    }
}

/// Insecure certificate verifier that accepts any certificate
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
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
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// A session stream that may or may not be TLS-encrypted
#[allow(clippy::large_enum_variant)]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    pub fn label(&self) -> &'static str {
        if self.is_tls() { "TLS" } else { "TCP" }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Run the client side of a TLS handshake over an established TCP stream
pub async fn connect_tls(
    stream: TcpStream,
    connector: &TlsConnector,
    server_name: &str,
) -> anyhow::Result<MaybeTlsStream> {
    let name = ServerName::try_from(server_name.to_string())
        .with_context(|| format!("Invalid TLS server name {:?}", server_name))?;
    let tls_stream = connector.connect(name, stream).await?;
    let tls_stream = TlsStream::from(tls_stream);
    log_peer_certificates("server", &tls_stream);
    Ok(MaybeTlsStream::Tls(tls_stream))
}

/// Run the server side of a TLS handshake
pub async fn accept_tls(
    stream: TcpStream,
    acceptor: &TlsAcceptor,
) -> anyhow::Result<MaybeTlsStream> {
    let tls_stream = acceptor.accept(stream).await?;
    let tls_stream = TlsStream::from(tls_stream);
    log_peer_certificates("client", &tls_stream);
    Ok(MaybeTlsStream::Tls(tls_stream))
}

/// SHA-256 of a DER certificate as lowercase hex
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

fn log_peer_certificates(peer: &str, stream: &TlsStream<TcpStream>) {
    let (_, state) = stream.get_ref();
    if let Some(version) = state.protocol_version() {
        debug!("TLS {:?} established with {}", version, peer);
    }
    match state.peer_certificates() {
        Some(certs) => {
            for (i, cert) in certs.iter().enumerate() {
                info!(
                    "TLS {} certificate {}: {} bytes, sha256 {}",
                    peer,
                    i,
                    cert.as_ref().len(),
                    fingerprint(cert)
                );
            }
        }
        None => debug!("TLS {} presented no certificate", peer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reports_first_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "x").unwrap();

        let config = TlsServerConfig {
            cert_path: cert,
            key_path: dir.path().join("key.pem"),
            ca_path: dir.path().join("ca.pem"),
            ..Default::default()
        };
        assert_eq!(config.missing_file(), Some(config.key_path.as_path()));
        assert!(config.create_acceptor().is_err());
        assert!(config.acceptor_for_run().is_none());
    }

    #[test]
    fn test_acceptor_from_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.signing_key.serialize_pem()).unwrap();

        let config = TlsServerConfig {
            enabled: true,
            cert_path: cert.clone(),
            key_path: key,
            ca_path: cert,
            verify_client: false,
        };
        assert!(config.missing_file().is_none());
        assert!(config.create_acceptor().unwrap().is_some());
    }

    #[test]
    fn test_disabled_configs() {
        let server = TlsServerConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(server.create_acceptor().unwrap().is_none());

        let client = TlsClientConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(client.create_connector().unwrap().is_none());
    }

    #[test]
    fn test_connector_without_client_cert() {
        let dir = tempfile::tempdir().unwrap();
        let client = TlsClientConfig {
            cert_path: dir.path().join("absent-cert.pem"),
            key_path: dir.path().join("absent-key.pem"),
            ca_path: Some(dir.path().join("absent-ca.pem")),
            ..Default::default()
        };
        assert!(client.create_connector().unwrap().is_some());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let fp = fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert_eq!(
            fp,
            "039058c6f2c0cb492c533b0a4d14ef77cc0f78abccced5287d84a1a2011cfb81"
        );
    }
}
