//! TLS support for node data connections.
//!
//! Data channels follow the FTP convention where the side that opens the TCP
//! connection plays the TLS *server* and the side that listens plays the TLS
//! *client*. [`EncryptionContext`] carries the key material together with the
//! role for one connection.

use crate::error::{Result, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// PEM material for the cluster CA and this node.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA certificate for verifying peer certificates.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain (node cert + intermediates).
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key for this node.
    pub private_key_pem: Vec<u8>,
    /// Whether the TLS server side demands a client certificate.
    pub require_client_auth: bool,
}

impl TlsConfig {
    /// Creates a new TLS configuration.
    pub fn new(
        ca_cert_pem: Vec<u8>,
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        require_client_auth: bool,
    ) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
            require_client_auth,
        }
    }
}

/// Which side of the TLS handshake a connection performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Performs the handshake as TLS client.
    Client,
    /// Performs the handshake as TLS server.
    Server,
}

/// Encryption settings for a single data connection.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    tls: Arc<TlsConfig>,
    role: Option<TlsRole>,
    server_name: Option<String>,
}

impl EncryptionContext {
    /// Wraps shared TLS material; the role defaults per connection kind.
    pub fn new(tls: Arc<TlsConfig>) -> Self {
        Self {
            tls,
            role: None,
            server_name: None,
        }
    }

    /// Forces a handshake role instead of the connection kind's default.
    pub fn with_role(mut self, role: TlsRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Name the TLS client verifies the server certificate against.
    /// Without one, the peer's IP address is used.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Returns the effective role, falling back to `default`.
    pub fn role_or(&self, default: TlsRole) -> TlsRole {
        self.role.unwrap_or(default)
    }

    /// Runs the handshake over `stream` in the given role.
    pub async fn handshake<IO>(&self, stream: IO, role: TlsRole, peer: IpAddr) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match role {
            TlsRole::Server => TlsAcceptor::new(&self.tls)?.accept(stream).await,
            TlsRole::Client => {
                let name = self
                    .server_name
                    .clone()
                    .unwrap_or_else(|| peer.to_string());
                TlsConnector::new(&self.tls)?.connect(&name, stream).await
            }
        }
    }
}

/// Client-side TLS connector.
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a connector trusting the configured CA. A client certificate is
    /// presented when the config carries one.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let root_store = root_store_from_pem(&config.ca_cert_pem)?;
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

        let client_config = if config.cert_chain_pem.is_empty() {
            builder.with_no_client_auth()
        } else {
            let certs = load_certs_from_pem(&config.cert_chain_pem)?;
            let key = load_private_key_from_pem(&config.private_key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to create client config: {}", e),
                })?
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Establishes a TLS session over an existing stream.
    pub async fn connect<IO>(&self, domain: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let domain = if let Ok(ip) = domain.parse::<IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| TransportError::TlsError {
                reason: format!("invalid domain: {}", e),
            })?
        };
        let stream = self
            .inner
            .connect(domain, stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("client handshake failed: {}", e),
            })?;
        Ok(TlsStream::Client(stream))
    }
}

/// Server-side TLS acceptor.
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates an acceptor presenting this node's certificate.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let builder = if config.require_client_auth {
            let roots = root_store_from_pem(&config.ca_cert_pem)?;
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to build client verifier: {}", e),
                })?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            rustls::ServerConfig::builder().with_no_client_auth()
        };

        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to set server cert: {}", e),
            })?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Accepts a TLS session over an existing stream.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let stream = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("server handshake failed: {}", e),
            })?;
        Ok(TlsStream::Server(stream))
    }
}

/// A TLS stream from either side of the handshake.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Client-side TLS stream.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Server-side TLS stream.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> TlsStream<IO> {
    /// The role this end played in the handshake.
    pub fn role(&self) -> TlsRole {
        match self {
            TlsStream::Client(_) => TlsRole::Client,
            TlsStream::Server(_) => TlsRole::Server,
        }
    }

    /// The underlying transport stream.
    pub fn get_ref(&self) -> &IO {
        match self {
            TlsStream::Client(s) => s.get_ref().0,
            TlsStream::Server(s) => s.get_ref().0,
        }
    }
}

impl<IO> tokio::io::AsyncRead for TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> tokio::io::AsyncWrite for TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

fn root_store_from_pem(pem: &[u8]) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in load_certs_from_pem(pem)? {
        root_store.add(cert).map_err(|e| TransportError::TlsError {
            reason: format!("failed to add CA cert: {}", e),
        })?;
    }
    Ok(root_store)
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError {
            reason: format!("malformed certificate PEM: {}", e),
        })?;

    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| TransportError::TlsError {
            reason: format!("malformed key PEM: {}", e),
        })?
        .ok_or_else(|| TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        })
}

/// Generates a self-signed cluster CA. Returns (certificate PEM, key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "fleetfs cluster CA");

    let cert = params.self_signed(&key_pair).map_err(|e| TransportError::TlsError {
        reason: format!("failed to create CA certificate: {}", e),
    })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Issues a node certificate for `node_name` signed by the cluster CA.
/// Returns (certificate PEM, key PEM).
pub fn generate_node_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    node_name: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_err = |what: &str, e: &dyn fmt::Display| TransportError::TlsError {
        reason: format!("{}: {}", what, e),
    };

    let ca_key_str = std::str::from_utf8(ca_key_pem).map_err(|e| tls_err("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_str).map_err(|e| tls_err("failed to parse CA key", &e))?;

    let ca_cert_str =
        std::str::from_utf8(ca_cert_pem).map_err(|e| tls_err("invalid CA cert PEM", &e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_str)
        .map_err(|e| tls_err("failed to parse CA certificate", &e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", &e))?;

    let node_key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate node key", &e))?;
    let node_cert = rcgen::CertificateParams::new(vec![node_name.to_string()])
        .map_err(|e| tls_err("failed to create node certificate params", &e))?
        .signed_by(&node_key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign node certificate", &e))?;

    Ok((node_cert.pem().into_bytes(), node_key.serialize_pem().into_bytes()))
}
