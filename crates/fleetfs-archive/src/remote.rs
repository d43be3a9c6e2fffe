//! Job runner that moves data between storage nodes through their control
//! services.
//!
//! For each job the destination opens a passive data channel, the first live
//! source dials it, and both transfers run to completion. A failed send aborts
//! the pending receive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetfs_transport::{
    DataChannel, TransferClient, TransferMode, TransferRequest, TransferResponse, TransferStatus,
    TransportError,
};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::error::{ArchiveError, Result};
use crate::job::{Job, JobRunner};
use crate::node::{Fleet, SlaveHandle};

/// Runs copy jobs against nodes serving [`fleetfs_transport::NodeService`].
pub struct RemoteJobRunner {
    fleet: Arc<dyn Fleet>,
    config: TransferConfig,
}

impl std::fmt::Debug for RemoteJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteJobRunner")
            .field("timeout_ms", &self.config.connection.timeout_ms)
            .finish()
    }
}

impl RemoteJobRunner {
    /// Creates a runner resolving source nodes through `fleet`.
    pub fn new(fleet: Arc<dyn Fleet>, config: TransferConfig) -> Self {
        Self { fleet, config }
    }

    async fn connect(&self, slave: &SlaveHandle) -> Result<TransferClient<TcpStream>> {
        let addr = slave.addr().ok_or_else(|| ArchiveError::NodeUnavailable {
            node: slave.name().to_string(),
        })?;
        let timeout_ms = self.config.connection.timeout_ms;
        let stream = match tokio::time::timeout(Duration::from_millis(timeout_ms), TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms,
                }
                .into())
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                }
                .into())
            }
            Ok(Err(e)) => return Err(TransportError::IoError(e).into()),
            Ok(Ok(stream)) => stream,
        };
        stream
            .set_nodelay(self.config.connection.nodelay)
            .map_err(TransportError::from)?;
        Ok(TransferClient::new(slave.name(), stream))
    }

    /// Opens the session's data channel and returns the passive port, if any.
    async fn open(client: &mut TransferClient<TcpStream>, channel: DataChannel) -> Result<Option<u16>> {
        match client.call(&TransferRequest::Open { channel }).await? {
            TransferResponse::LocalPort(port) => Ok(port),
            TransferResponse::Error { kind, message } => Err(TransportError::Remote {
                node: client.node().to_string(),
                kind,
                message,
            }
            .into()),
            other => Err(ArchiveError::InvalidState {
                msg: format!("unexpected open reply from {}: {:?}", client.node(), other),
            }),
        }
    }

    fn source_for(&self, job: &Job) -> Result<Arc<SlaveHandle>> {
        let dest = job.destination().name();
        job.sources()
            .iter()
            .filter(|name| name.as_str() != dest)
            .filter_map(|name| self.fleet.slave(name))
            .find(|slave| slave.is_available() && slave.addr().is_some())
            .ok_or_else(|| ArchiveError::NodeUnavailable {
                node: job.sources().join(","),
            })
    }
}

#[async_trait]
impl JobRunner for RemoteJobRunner {
    async fn run(&self, job: &Job) -> Result<TransferStatus> {
        let dest = job.destination().clone();
        let source = self.source_for(job)?;

        let mut receiver = self.connect(&dest).await?;
        let port = Self::open(&mut receiver, DataChannel::Passive)
            .await?
            .ok_or_else(|| ArchiveError::InvalidState {
                msg: format!("{} opened a passive channel without a port", dest.name()),
            })?;
        let dest_ip = dest
            .addr()
            .map(|a| a.ip())
            .ok_or_else(|| ArchiveError::NodeUnavailable {
                node: dest.name().to_string(),
            })?;

        let mut sender = self.connect(&source).await?;
        Self::open(
            &mut sender,
            DataChannel::Active {
                addr: SocketAddr::new(dest_ip, port),
            },
        )
        .await?;

        let file = job.file();
        let directory = file.directory();
        debug!(job = job.id(), file = %file.path, from = source.name(), to = dest.name(), port, "copy starting");
        let pending = receiver
            .begin(&TransferRequest::ReceiveFile {
                directory: directory.as_str().to_string(),
                mode: TransferMode::Binary,
                filename: file.name().to_string(),
                offset: 0,
            })
            .await?;
        let sent = sender
            .transfer(&TransferRequest::SendFile {
                path: file.path.clone(),
                mode: TransferMode::Binary,
                resume_position: 0,
                want_checksum: true,
            })
            .await;
        if let Err(e) = &sent {
            warn!(job = job.id(), slave = source.name(), error = %e, "send failed, aborting receive");
            let abort = TransferRequest::Abort {
                reason: format!("sender failed: {}", e),
            };
            if let Err(e) = receiver.call(&abort).await {
                debug!(job = job.id(), error = %e, "abort not delivered");
            }
        }
        let received = receiver.finish(pending).await;
        let sent = sent?;
        let received = received?;

        if sent.checksum != received.checksum {
            return Err(ArchiveError::InvalidState {
                msg: format!(
                    "checksum mismatch for {}: sent {:08x}, stored {:08x}",
                    file.path, sent.checksum, received.checksum
                ),
            });
        }
        Ok(received)
    }
}
