//! Node-side control service.
//!
//! Every accepted control connection is one session: the coordinator first
//! sends [`TransferRequest::Open`] to pick a passive or active data channel,
//! the node replies with its listening port (if passive), and from then on the
//! session is served by [`serve`] over one [`FileTransfer`].

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ActiveConnection, ConnectionConfig, DataConnection, PassiveConnection, PortRange};
use crate::error::{RemoteErrorKind, Result};
use crate::rpc::{read_message, serve, write_message, DataChannel, RequestFrame, ResponseFrame, TransferRequest, TransferResponse};
use crate::tls::EncryptionContext;
use crate::transfer::{FileTransfer, SlaveTransfer};

/// Serves transfer sessions for one storage root.
#[derive(Debug)]
pub struct NodeService {
    root: PathBuf,
    bind_ip: IpAddr,
    ports: PortRange,
    config: ConnectionConfig,
    encryption: Option<EncryptionContext>,
}

impl NodeService {
    /// Creates a service storing under `root`. Data channels bind to
    /// `bind_ip`; passive ones take a port from `ports`.
    pub fn new(root: impl Into<PathBuf>, bind_ip: IpAddr, ports: PortRange, config: ConnectionConfig) -> Self {
        Self {
            root: root.into(),
            bind_ip,
            ports,
            config,
            encryption: None,
        }
    }

    /// Encrypts every data channel opened by this service.
    pub fn with_encryption(mut self, encryption: EncryptionContext) -> Self {
        self.encryption = Some(encryption);
        self
    }

    fn open(&self, channel: DataChannel) -> Result<DataConnection> {
        match channel {
            DataChannel::Passive => PassiveConnection::bind(
                self.bind_ip,
                &self.ports,
                self.encryption.clone(),
                self.config.clone(),
            )
            .map(DataConnection::Passive),
            DataChannel::Active { addr } => {
                let conn = ActiveConnection::new(addr, self.encryption.clone(), self.config.clone());
                let conn = if self.bind_ip.is_unspecified() {
                    conn
                } else {
                    conn.with_bind_ip(self.bind_ip)
                };
                Ok(DataConnection::Active(conn))
            }
        }
    }

    /// Runs one session on an accepted control stream.
    pub async fn session<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(RequestFrame { id, request }) = read_message::<_, RequestFrame>(&mut stream).await? else {
            return Ok(());
        };
        let channel = match request {
            TransferRequest::Open { channel } => channel,
            other => {
                warn!(?other, "session did not start with open");
                let response = TransferResponse::Error {
                    kind: RemoteErrorKind::Other,
                    message: "session not open".into(),
                };
                return write_message(&mut stream, &ResponseFrame { id, response }).await;
            }
        };

        let connection = match self.open(channel) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(?channel, error = %e, "data channel setup failed");
                let response = TransferResponse::error(&e);
                return write_message(&mut stream, &ResponseFrame { id, response }).await;
            }
        };
        let transfer = FileTransfer::new(&self.root, connection);
        let response = TransferResponse::LocalPort(transfer.local_port());
        write_message(&mut stream, &ResponseFrame { id, response }).await?;
        debug!(?channel, port = ?transfer.local_port(), "session open");

        serve(&mut stream, &transfer).await
    }

    /// Accepts control connections until `shutdown` fires, one task per session.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr()?, root = %self.root.display(), "node service listening");
        loop {
            let (stream, peer): (_, SocketAddr) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "control accept failed");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(self.config.nodelay) {
                debug!(peer = %peer, error = %e, "set_nodelay failed");
            }
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.session(stream).await {
                    warn!(peer = %peer, error = %e, "session ended with error");
                }
            });
        }
    }
}
