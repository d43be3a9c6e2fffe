//! Request/response messages for driving a [`SlaveTransfer`] remotely.
//!
//! Messages are bincode-encoded and framed with a 4-byte big-endian length.
//! Every request carries an id that its reply echoes, so a node can answer
//! `Abort` and `Status` while a transfer on the same stream is still running.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RemoteErrorKind, Result, TransportError};
use crate::transfer::{SlaveTransfer, TransferMode, TransferStatus};

/// Largest accepted message body.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Control frames buffered between the reader and the request handler.
const CONTROL_QUEUE: usize = 16;

/// How a node session reaches its data-channel peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannel {
    /// Listen on a port from the node's passive range.
    Passive,
    /// Dial the given peer.
    Active {
        /// Peer data address.
        addr: SocketAddr,
    },
}

/// Operations the coordinator asks a node to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRequest {
    /// Opens the session's data channel. First request of a node session.
    Open {
        /// Passive or active data channel.
        channel: DataChannel,
    },
    /// Stream a stored file to the peer.
    SendFile {
        /// Path under the node's storage root.
        path: String,
        /// Representation type.
        mode: TransferMode,
        /// Byte offset to start reading from.
        resume_position: u64,
        /// Whether to compute a CRC-32.
        want_checksum: bool,
    },
    /// Store the peer's data.
    ReceiveFile {
        /// Directory under the node's storage root.
        directory: String,
        /// Representation type.
        mode: TransferMode,
        /// File name inside `directory`.
        filename: String,
        /// Byte offset to start writing at.
        offset: u64,
    },
    /// Abort the running transfer.
    Abort {
        /// Why the transfer is being aborted.
        reason: String,
    },
    /// Progress snapshot.
    Status,
    /// Listening port of a passive transfer.
    LocalPort,
}

/// Node replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferResponse {
    /// Transfer result or progress.
    Status(TransferStatus),
    /// Passive listening port, if any.
    LocalPort(Option<u16>),
    /// Abort acknowledged.
    Aborted,
    /// The operation failed on the node.
    Error {
        /// Class of the node-side error.
        kind: RemoteErrorKind,
        /// Display form of the node-side error.
        message: String,
    },
}

impl TransferResponse {
    /// Error reply carrying the class of `err`.
    pub fn error(err: &TransportError) -> Self {
        TransferResponse::Error {
            kind: err.remote_kind(),
            message: err.to_string(),
        }
    }
}

/// A request and the id its reply will carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Caller-chosen id, echoed in the reply.
    pub id: u64,
    /// The request.
    pub request: TransferRequest,
}

/// A reply to the request with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request answered.
    pub id: u64,
    /// The reply.
    pub response: TransferResponse,
}

/// Serialize any message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Writes one length-prefixed message.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serialize_message(msg)?;
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max_size: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed message. `Ok(None)` on a clean EOF before the
/// length prefix.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max_size: MAX_MESSAGE_SIZE,
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    deserialize_message(&body).map(Some)
}

type TransferFuture<'a> = Pin<Box<dyn Future<Output = Result<TransferStatus>> + Send + 'a>>;

/// The transfer currently running on a control stream.
type Running<'a> = Option<(u64, TransferFuture<'a>)>;

fn progress<T: SlaveTransfer + ?Sized>(transfer: &T) -> TransferStatus {
    TransferStatus {
        elapsed_ms: transfer.elapsed().as_millis() as u64,
        transferred: transfer.transferred_bytes(),
        checksum: transfer.checksum(),
        finished: false,
    }
}

fn outcome(result: Result<TransferStatus>) -> TransferResponse {
    match result {
        Ok(status) => TransferResponse::Status(status),
        Err(e) => {
            warn!(error = %e, "transfer request failed");
            TransferResponse::error(&e)
        }
    }
}

/// Answers control requests right away and starts transfers in `running`.
/// Returns the reply to write now, if any.
fn handle_frame<'a, T>(transfer: &'a T, running: &mut Running<'a>, frame: RequestFrame) -> Option<ResponseFrame>
where
    T: SlaveTransfer + ?Sized,
{
    let RequestFrame { id, request } = frame;
    debug!(id, ?request, "transfer request");
    let reply = |response| Some(ResponseFrame { id, response });

    let job: TransferFuture<'a> = match request {
        TransferRequest::SendFile {
            path,
            mode,
            resume_position,
            want_checksum,
        } => Box::pin(async move {
            transfer
                .send_file(&path, mode, resume_position, want_checksum)
                .await
        }),
        TransferRequest::ReceiveFile {
            directory,
            mode,
            filename,
            offset,
        } => Box::pin(async move {
            transfer
                .receive_file(&directory, mode, &filename, offset)
                .await
        }),
        TransferRequest::Abort { reason } => {
            transfer.abort(&reason);
            return reply(TransferResponse::Aborted);
        }
        TransferRequest::Status => return reply(TransferResponse::Status(progress(transfer))),
        TransferRequest::LocalPort => return reply(TransferResponse::LocalPort(transfer.local_port())),
        TransferRequest::Open { .. } => {
            return reply(TransferResponse::Error {
                kind: RemoteErrorKind::Other,
                message: "data channel already open".into(),
            })
        }
    };
    if let Some((busy, _)) = running {
        return reply(TransferResponse::Error {
            kind: RemoteErrorKind::Busy,
            message: format!("request {} is still transferring", busy),
        });
    }
    *running = Some((id, job));
    None
}

/// Resolves when the running transfer does; never while none is running.
async fn completion(running: &mut Running<'_>) -> (u64, Result<TransferStatus>) {
    match running {
        Some((id, job)) => (*id, job.await),
        None => std::future::pending().await,
    }
}

async fn read_frames<R>(reader: &mut R, frames: mpsc::Sender<RequestFrame>, stop: &CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            frame = read_message::<_, RequestFrame>(reader) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        if frames.send(frame).await.is_err() {
            return Ok(());
        }
    }
}

async fn handle_frames<W, T>(writer: &mut W, transfer: &T, mut frames: mpsc::Receiver<RequestFrame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: SlaveTransfer + ?Sized,
{
    let mut running: Running<'_> = None;
    loop {
        let reply = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => handle_frame(transfer, &mut running, frame),
                None => {
                    if running.is_some() {
                        transfer.abort("control stream closed");
                    }
                    return Ok(());
                }
            },
            (id, result) = completion(&mut running) => {
                running = None;
                Some(ResponseFrame { id, response: outcome(result) })
            }
        };
        if let Some(reply) = reply {
            write_message(writer, &reply).await?;
        }
    }
}

/// Node side: answers requests on a control stream until the peer hangs up.
///
/// Transfers run while further frames are read, so `Abort`, `Status` and
/// `LocalPort` are answered immediately. A second transfer request while
/// one is running is refused as busy. Hanging up aborts a running transfer.
pub async fn serve<S, T>(stream: &mut S, transfer: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: SlaveTransfer + ?Sized,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
    let stop = CancellationToken::new();
    let (read, handled) = tokio::join!(read_frames(&mut reader, tx, &stop), async {
        let handled = handle_frames(&mut writer, transfer, rx).await;
        stop.cancel();
        handled
    });
    handled?;
    read
}

/// Coordinator side of the control stream to one node.
#[derive(Debug)]
pub struct TransferClient<S> {
    node: String,
    stream: S,
    next_id: u64,
    parked: HashMap<u64, TransferResponse>,
}

impl<S> TransferClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a control stream to the named node.
    pub fn new(node: impl Into<String>, stream: S) -> Self {
        Self {
            node: node.into(),
            stream,
            next_id: 1,
            parked: HashMap::new(),
        }
    }

    /// Name of the node on the other end.
    pub fn node(&self) -> &str {
        &self.node
    }

    fn unavailable(&self) -> TransportError {
        TransportError::NodeUnavailable {
            node: self.node.clone(),
        }
    }

    async fn send(&mut self, request: &TransferRequest) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let frame = RequestFrame {
            id,
            request: request.clone(),
        };
        if let Err(e) = write_message(&mut self.stream, &frame).await {
            debug!(node = %self.node, error = %e, "request write failed");
            return Err(self.unavailable());
        }
        Ok(id)
    }

    /// Reads replies until the one for `id`, parking the others.
    async fn reply(&mut self, id: u64) -> Result<TransferResponse> {
        if let Some(response) = self.parked.remove(&id) {
            return Ok(response);
        }
        loop {
            match read_message::<_, ResponseFrame>(&mut self.stream).await {
                Ok(Some(frame)) if frame.id == id => return Ok(frame.response),
                Ok(Some(frame)) => {
                    self.parked.insert(frame.id, frame.response);
                }
                Ok(None) => return Err(self.unavailable()),
                Err(TransportError::IoError(e)) => {
                    debug!(node = %self.node, error = %e, "response read failed");
                    return Err(self.unavailable());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends a request and waits for its reply. Losing the stream mid-call
    /// reports the node as unavailable.
    pub async fn call(&mut self, request: &TransferRequest) -> Result<TransferResponse> {
        let id = self.send(request).await?;
        self.reply(id).await
    }

    /// Starts a transfer without waiting for it; pair with [`finish`](Self::finish).
    /// Control calls may be made in between.
    pub async fn begin(&mut self, request: &TransferRequest) -> Result<u64> {
        self.send(request).await
    }

    /// Waits for the transfer started as `id` and unwraps its final status.
    pub async fn finish(&mut self, id: u64) -> Result<TransferStatus> {
        match self.reply(id).await? {
            TransferResponse::Status(status) => Ok(status),
            TransferResponse::Error {
                kind: RemoteErrorKind::Aborted,
                ..
            } => Err(TransportError::Aborted),
            TransferResponse::Error { kind, message } => Err(TransportError::Remote {
                node: self.node.clone(),
                kind,
                message,
            }),
            other => Err(TransportError::SerializationError(format!(
                "unexpected response {:?}",
                other
            ))),
        }
    }

    /// Runs a transfer request to completion.
    pub async fn transfer(&mut self, request: &TransferRequest) -> Result<TransferStatus> {
        let id = self.begin(request).await?;
        self.finish(id).await
    }
}
