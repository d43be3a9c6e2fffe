//! Data-channel establishment between two nodes.
//!
//! An [`ActiveConnection`] dials a known peer, a [`PassiveConnection`] binds a
//! listener from a port range and accepts exactly one peer. Both are single
//! use: the first `connect()` consumes them, `abort()` poisons them.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::tls::{EncryptionContext, TlsRole, TlsStream};

/// Socket settings shared by both connection kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound for connect, accept and the TLS handshake, in milliseconds.
    pub timeout_ms: u64,
    /// `SO_SNDBUF` to apply, if any.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF` to apply, if any.
    pub recv_buffer_size: Option<usize>,
    /// Enable `SO_KEEPALIVE`.
    pub keepalive: bool,
    /// Enable `TCP_NODELAY`.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            send_buffer_size: None,
            recv_buffer_size: None,
            keepalive: true,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Inclusive range of ports passive listeners may bind.
///
/// `0-0` means any ephemeral port chosen by the kernel. Always `start <= end`;
/// deserialization goes through [`PortRange::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange", into = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Serialize, Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = TransportError;

    fn try_from(raw: RawPortRange) -> Result<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl From<PortRange> for RawPortRange {
    fn from(range: PortRange) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::any()
    }
}

impl PortRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start > end {
            return Err(TransportError::NoPortAvailable { start, end });
        }
        Ok(Self { start, end })
    }

    /// Lets the kernel pick the port.
    pub fn any() -> Self {
        Self { start: 0, end: 0 }
    }

    /// First port of the range.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last port of the range.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// True for the kernel-assigned range.
    pub fn is_any(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }

    /// Always false; a valid range holds at least one port.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Every port of the range once, starting at a random offset and wrapping,
    /// so concurrent transfers do not all fight over the first port.
    pub fn candidates(&self) -> Vec<u16> {
        if self.is_any() {
            return vec![0];
        }
        let len = self.len();
        let offset = rand::thread_rng().gen_range(0..len);
        (0..len)
            .map(|i| self.start + ((offset + i) % len) as u16)
            .collect()
    }
}

/// An established data socket, optionally wrapped in TLS.
#[derive(Debug)]
pub enum DataStream {
    /// Cleartext TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl DataStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            DataStream::Plain(s) => s,
            DataStream::Tls(s) => s.get_ref(),
        }
    }

    /// Remote address of the data socket.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp().peer_addr()?)
    }

    /// Local address of the data socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp().local_addr()?)
    }

    /// Returns the handshake role when the stream is encrypted.
    pub fn tls_role(&self) -> Option<TlsRole> {
        match self {
            DataStream::Plain(_) => None,
            DataStream::Tls(s) => Some(s.role()),
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut *self {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn buffer_size(size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| {
        TransportError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("socket buffer size {} out of range", size),
        ))
    })
}

fn new_socket(addr: &SocketAddr, config: &ConnectionConfig) -> Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // Buffer sizes must be set before connect/listen to affect the TCP window.
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(buffer_size(size)?)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(buffer_size(size)?)?;
    }
    Ok(socket)
}

fn tune_stream(stream: &TcpStream, config: &ConnectionConfig) -> Result<()> {
    stream.set_nodelay(config.nodelay)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(config.keepalive)?;
    if let Some(size) = config.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    Ok(())
}

async fn finish(
    stream: TcpStream,
    config: &ConnectionConfig,
    encryption: Option<&EncryptionContext>,
    default_role: TlsRole,
    cancel: &CancellationToken,
) -> Result<DataStream> {
    tune_stream(&stream, config)?;
    let Some(ctx) = encryption else {
        return Ok(DataStream::Plain(stream));
    };

    let peer = stream.peer_addr()?;
    let role = ctx.role_or(default_role);
    let handshake = tokio::time::timeout(config.timeout(), ctx.handshake(stream, role, peer.ip()));
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Aborted),
        res = handshake => match res {
            Err(_) => Err(TransportError::ConnectionTimeout {
                addr: peer.to_string(),
                timeout_ms: config.timeout_ms,
            }),
            Ok(stream) => {
                debug!(peer = %peer, ?role, "TLS handshake complete");
                Ok(DataStream::Tls(Box::new(stream?)))
            }
        },
    }
}

/// Outbound data connection to a known peer.
#[derive(Debug)]
pub struct ActiveConnection {
    addr: SocketAddr,
    bind_ip: Option<IpAddr>,
    encryption: Option<EncryptionContext>,
    config: ConnectionConfig,
    used: AtomicBool,
    cancel: CancellationToken,
}

impl ActiveConnection {
    /// Prepares a connection to `addr`; nothing is opened until `connect()`.
    pub fn new(
        addr: SocketAddr,
        encryption: Option<EncryptionContext>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            addr,
            bind_ip: None,
            encryption,
            config,
            used: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Binds the outbound socket to a specific local interface.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    /// Peer this connection dials.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Dials the peer within the configured timeout. When encrypted, this end
    /// acts as TLS server unless the context overrides the role.
    pub async fn connect(&self) -> Result<DataStream> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }

        let socket = new_socket(&self.addr, &self.config)?;
        if let Some(ip) = self.bind_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let addr = self.addr.to_string();
        let dial = tokio::time::timeout(self.config.timeout(), socket.connect(self.addr));
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Aborted),
            res = dial => match res {
                Err(_) => {
                    return Err(TransportError::ConnectionTimeout {
                        addr,
                        timeout_ms: self.config.timeout_ms,
                    })
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(TransportError::ConnectionRefused { addr })
                }
                Ok(Err(e)) => return Err(TransportError::IoError(e)),
                Ok(Ok(stream)) => stream,
            },
        };
        debug!(addr = %self.addr, "active data connection established");

        finish(
            stream,
            &self.config,
            self.encryption.as_ref(),
            TlsRole::Server,
            &self.cancel,
        )
        .await
    }

    /// Cancels any in-flight connect and forbids further ones. Idempotent.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Listening data connection that accepts exactly one peer.
#[derive(Debug)]
pub struct PassiveConnection {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    encryption: Option<EncryptionContext>,
    config: ConnectionConfig,
    cancel: CancellationToken,
}

impl PassiveConnection {
    /// Binds a listener on `ip` using the first free port of `range`.
    /// Must be called from within a tokio runtime.
    pub fn bind(
        ip: IpAddr,
        range: &PortRange,
        encryption: Option<EncryptionContext>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        for port in range.candidates() {
            let addr = SocketAddr::new(ip, port);
            let socket = new_socket(&addr, &config)?;
            match socket.bind(addr) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(TransportError::IoError(e)),
            }
            let listener = socket.listen(1)?;
            let local_addr = listener.local_addr()?;
            debug!(addr = %local_addr, "passive listener bound");
            return Ok(Self {
                listener: Mutex::new(Some(listener)),
                local_addr,
                encryption,
                config,
                cancel: CancellationToken::new(),
            });
        }
        warn!(start = range.start, end = range.end, "passive port range exhausted");
        Err(TransportError::NoPortAvailable {
            start: range.start,
            end: range.end,
        })
    }

    /// Port the listener is bound to, to be advertised to the peer.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Full bound address of the listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True while the listening socket is still open.
    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Accepts one peer within the timeout and closes the listener right away.
    /// When encrypted, this end acts as TLS client unless overridden.
    pub async fn connect(&self) -> Result<DataStream> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::AlreadyConnected)?;

        let accept = tokio::time::timeout(self.config.timeout(), listener.accept());
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Aborted),
            res = accept => match res {
                Err(_) => Err(TransportError::ConnectionTimeout {
                    addr: self.local_addr.to_string(),
                    timeout_ms: self.config.timeout_ms,
                }),
                Ok(res) => res.map_err(TransportError::IoError),
            },
        };
        drop(listener);
        let (stream, peer) = result?;
        debug!(local = %self.local_addr, peer = %peer, "passive data connection accepted");

        finish(
            stream,
            &self.config,
            self.encryption.as_ref(),
            TlsRole::Client,
            &self.cancel,
        )
        .await
    }

    /// Closes the listener, cancels a pending accept, and forbids further
    /// connects. Idempotent.
    pub fn abort(&self) {
        self.cancel.cancel();
        if self.listener.lock().take().is_some() {
            debug!(addr = %self.local_addr, "passive listener closed by abort");
        }
    }
}

impl Drop for PassiveConnection {
    fn drop(&mut self) {
        if self.listener.get_mut().take().is_some() {
            debug!(addr = %self.local_addr, "releasing unused passive listener");
        }
    }
}

/// Either connection kind, as handed to a transfer.
#[derive(Debug)]
pub enum DataConnection {
    /// Node dials out.
    Active(ActiveConnection),
    /// Node listens and accepts.
    Passive(PassiveConnection),
}

impl DataConnection {
    /// Establishes the data socket.
    pub async fn connect(&self) -> Result<DataStream> {
        match self {
            DataConnection::Active(c) => c.connect().await,
            DataConnection::Passive(c) => c.connect().await,
        }
    }

    /// Aborts the connection. Idempotent.
    pub fn abort(&self) {
        match self {
            DataConnection::Active(c) => c.abort(),
            DataConnection::Passive(c) => c.abort(),
        }
    }

    /// Listening port for passive connections.
    pub fn local_port(&self) -> Option<u16> {
        match self {
            DataConnection::Active(_) => None,
            DataConnection::Passive(c) => Some(c.local_port()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{generate_node_cert, generate_self_signed_ca, TlsConfig};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            timeout_ms: 2_000,
            ..ConnectionConfig::default()
        }
    }

    fn passive() -> PassiveConnection {
        PassiveConnection::bind(LOCALHOST, &PortRange::any(), None, fast_config()).unwrap()
    }

    #[test]
    fn test_port_range_candidates_cover_range() {
        let range = PortRange::new(40000, 40009).unwrap();
        let mut ports = range.candidates();
        assert_eq!(ports.len(), 10);
        ports.sort_unstable();
        assert_eq!(ports, (40000..=40009).collect::<Vec<_>>());
        assert!(PortRange::new(10, 5).is_err());
        assert_eq!(PortRange::any().candidates(), vec![0]);
    }

    #[test]
    fn test_port_range_deserialize_validates() {
        let range: PortRange = serde_json::from_str(r#"{"start":50000,"end":50002}"#).unwrap();
        assert_eq!((range.start(), range.end(), range.len()), (50000, 50002, 3));
        let inverted = serde_json::from_str::<PortRange>(r#"{"start":9,"end":1}"#);
        assert!(inverted.is_err());
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let config = ConnectionConfig {
            send_buffer_size: Some(usize::MAX),
            ..fast_config()
        };
        let addr = SocketAddr::new(LOCALHOST, 0);
        assert!(new_socket(&addr, &config).is_err());
    }

    #[tokio::test]
    async fn test_active_binds_local_interface() {
        let passive = passive();
        let addr = passive.local_addr();
        let server = tokio::spawn(async move { passive.connect().await.unwrap().peer_addr().unwrap() });

        let active = ActiveConnection::new(addr, None, fast_config()).with_bind_ip(LOCALHOST);
        let stream = active.connect().await.unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), LOCALHOST);
        assert_eq!(server.await.unwrap(), stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_active_to_passive_plain() {
        let passive = passive();
        let addr = passive.local_addr();

        let server = tokio::spawn(async move {
            let mut stream = passive.connect().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"RETR");
            assert!(!passive.is_listening());
        });

        let active = ActiveConnection::new(addr, None, fast_config());
        let mut stream = active.connect().await.unwrap();
        assert!(stream.tls_role().is_none());
        stream.write_all(b"RETR").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_passive_single_use() {
        let passive = Arc::new(passive());
        let addr = passive.local_addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let _stream = passive.connect().await.unwrap();
        let _peer = client.await.unwrap();

        assert!(!passive.is_listening());
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(matches!(
            passive.connect().await,
            Err(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_dropped_passive_releases_port() {
        let passive = passive();
        let addr = passive.local_addr();
        assert!(passive.is_listening());
        drop(passive);

        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok(), "listener leaked after drop");
    }

    #[tokio::test]
    async fn test_passive_abort_is_idempotent() {
        let passive = passive();
        let addr = passive.local_addr();
        passive.abort();
        passive.abort();
        assert!(!passive.is_listening());
        assert!(matches!(passive.connect().await, Err(TransportError::Aborted)));
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }

    #[tokio::test]
    async fn test_abort_cancels_pending_accept() {
        let passive = Arc::new(passive());
        let waiter = {
            let passive = passive.clone();
            tokio::spawn(async move { passive.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        passive.abort();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(TransportError::Aborted)));
    }

    #[tokio::test]
    async fn test_passive_accept_timeout() {
        let config = ConnectionConfig {
            timeout_ms: 50,
            ..ConnectionConfig::default()
        };
        let passive = PassiveConnection::bind(LOCALHOST, &PortRange::any(), None, config).unwrap();
        let err = passive.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionTimeout { timeout_ms: 50, .. }));
        assert!(!passive.is_listening());
    }

    #[tokio::test]
    async fn test_active_refused() {
        let port = {
            let l = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let active = ActiveConnection::new(SocketAddr::new(LOCALHOST, port), None, fast_config());
        let err = active.connect().await.unwrap_err();
        assert!(err.is_node_unreachable());
        assert!(matches!(
            active.connect().await,
            Err(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_active_abort_before_connect() {
        let active = ActiveConnection::new(SocketAddr::new(LOCALHOST, 1), None, fast_config());
        active.abort();
        active.abort();
        assert!(matches!(active.connect().await, Err(TransportError::Aborted)));
    }

    #[tokio::test]
    async fn test_passive_port_range_exhausted() {
        let held = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let range = PortRange::new(port, port).unwrap();
        let err = PassiveConnection::bind(LOCALHOST, &range, None, fast_config()).unwrap_err();
        assert!(matches!(err, TransportError::NoPortAvailable { .. }));
    }

    #[tokio::test]
    async fn test_tls_roles_follow_data_channel_convention() {
        let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
        let (cert, key) = generate_node_cert(&ca_cert, &ca_key, "localhost").unwrap();
        let tls = Arc::new(TlsConfig::new(ca_cert, cert, key, false));
        let ctx = EncryptionContext::new(tls).with_server_name("localhost");

        let passive =
            PassiveConnection::bind(LOCALHOST, &PortRange::any(), Some(ctx.clone()), fast_config())
                .unwrap();
        let addr = passive.local_addr();

        let server = tokio::spawn(async move {
            let mut stream = passive.connect().await.unwrap();
            assert_eq!(stream.tls_role(), Some(TlsRole::Client));
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let active = ActiveConnection::new(addr, Some(ctx), fast_config());
        let mut stream = active.connect().await.unwrap();
        assert_eq!(stream.tls_role(), Some(TlsRole::Server));
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        server.await.unwrap();
    }

    fn node_tls(require_client_auth: bool) -> (Vec<u8>, Arc<TlsConfig>) {
        let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
        let (cert, key) = generate_node_cert(&ca_cert, &ca_key, "localhost").unwrap();
        let tls = Arc::new(TlsConfig::new(ca_cert.clone(), cert, key, require_client_auth));
        (ca_cert, tls)
    }

    #[tokio::test]
    async fn test_tls_role_override_swaps_sides() {
        let (_, tls) = node_tls(false);
        let listen_ctx = EncryptionContext::new(tls.clone()).with_role(TlsRole::Server);
        let dial_ctx = EncryptionContext::new(tls)
            .with_role(TlsRole::Client)
            .with_server_name("localhost");

        let passive =
            PassiveConnection::bind(LOCALHOST, &PortRange::any(), Some(listen_ctx), fast_config())
                .unwrap();
        let addr = passive.local_addr();
        let server = tokio::spawn(async move {
            let mut stream = passive.connect().await.unwrap();
            assert_eq!(stream.tls_role(), Some(TlsRole::Server));
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"STOR");
        });

        let active = ActiveConnection::new(addr, Some(dial_ctx), fast_config());
        let mut stream = active.connect().await.unwrap();
        assert_eq!(stream.tls_role(), Some(TlsRole::Client));
        stream.write_all(b"STOR").await.unwrap();
        stream.flush().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mutual_tls_with_client_cert() {
        let (_, tls) = node_tls(true);
        let ctx = EncryptionContext::new(tls).with_server_name("localhost");

        let passive =
            PassiveConnection::bind(LOCALHOST, &PortRange::any(), Some(ctx.clone()), fast_config())
                .unwrap();
        let addr = passive.local_addr();
        let server = tokio::spawn(async move {
            let mut stream = passive.connect().await.unwrap();
            stream.write_all(b"ok").await.unwrap();
            stream.flush().await.unwrap();
        });

        let active = ActiveConnection::new(addr, Some(ctx), fast_config());
        let mut stream = active.connect().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mutual_tls_rejects_missing_client_cert() {
        let (ca_cert, tls) = node_tls(true);
        let server_ctx = EncryptionContext::new(tls);
        let anonymous = Arc::new(TlsConfig::new(ca_cert, Vec::new(), Vec::new(), false));
        let client_ctx = EncryptionContext::new(anonymous).with_server_name("localhost");

        let passive =
            PassiveConnection::bind(LOCALHOST, &PortRange::any(), Some(client_ctx), fast_config())
                .unwrap();
        let addr = passive.local_addr();
        let client = tokio::spawn(async move {
            if let Ok(mut stream) = passive.connect().await {
                let mut buf = [0u8; 1];
                let _ = stream.read(&mut buf).await;
            }
        });

        let active = ActiveConnection::new(addr, Some(server_ctx), fast_config());
        let err = active.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::TlsError { .. }), "got {:?}", err);
        client.await.unwrap();
    }
}
