//! File transfer contract a storage node exposes over a data connection.
//!
//! [`SlaveTransfer`] is the operation set; [`FileTransfer`] implements it on
//! top of a node's local storage root and one [`DataConnection`].

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::DataConnection;
use crate::error::{Result, TransportError};

const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Representation type of the transferred data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Text; line endings travel as CRLF.
    Ascii,
    /// Bytes verbatim.
    Binary,
}

impl TransferMode {
    /// Maps an FTP `TYPE` code (`A` or `I`).
    pub fn from_type_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'A' => Some(TransferMode::Ascii),
            'I' => Some(TransferMode::Binary),
            _ => None,
        }
    }
}

/// Result of a finished transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Wall time spent moving data, in milliseconds.
    pub elapsed_ms: u64,
    /// Bytes written to (send) or read from (receive) the data socket.
    pub transferred: u64,
    /// CRC-32 of the file bytes covered by the transfer, 0 when not computed.
    pub checksum: u32,
    /// False while the transfer is still running.
    pub finished: bool,
}

impl TransferStatus {
    /// Average bytes per second.
    pub fn throughput(&self) -> u64 {
        throughput(self.transferred, Duration::from_millis(self.elapsed_ms))
    }
}

fn throughput(bytes: u64, elapsed: Duration) -> u64 {
    let ms = elapsed.as_millis() as u64;
    if ms == 0 {
        return 0;
    }
    bytes.saturating_mul(1000) / ms
}

/// Operations a storage node performs for the coordinator.
#[async_trait]
pub trait SlaveTransfer: Send + Sync {
    /// Streams the file at `path` to the peer, starting at `resume_position`.
    async fn send_file(
        &self,
        path: &str,
        mode: TransferMode,
        resume_position: u64,
        want_checksum: bool,
    ) -> Result<TransferStatus>;

    /// Stores the peer's data as `directory/filename`, writing from `offset`.
    async fn receive_file(
        &self,
        directory: &str,
        mode: TransferMode,
        filename: &str,
        offset: u64,
    ) -> Result<TransferStatus>;

    /// Stops the transfer and its connection. Idempotent.
    fn abort(&self, reason: &str);

    /// Time since the transfer started moving data.
    fn elapsed(&self) -> Duration;

    /// Bytes moved so far.
    fn transferred_bytes(&self) -> u64;

    /// Bytes per second so far.
    fn throughput(&self) -> u64;

    /// Running CRC-32.
    fn checksum(&self) -> u32;

    /// Listening port when the data connection is passive.
    fn local_port(&self) -> Option<u16>;
}

/// Rejects absolute paths and `..` so transfers stay under the storage root.
fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(rel.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(TransportError::InvalidPath {
                    path: rel.to_string(),
                })
            }
        }
    }
    Ok(out)
}

/// Rewrites bare LF as CRLF.
#[derive(Debug, Default)]
struct AsciiEncoder {
    last_was_cr: bool,
}

impl AsciiEncoder {
    fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.clear();
        for &b in input {
            if b == b'\n' && !self.last_was_cr {
                out.push(b'\r');
            }
            out.push(b);
            self.last_was_cr = b == b'\r';
        }
    }
}

/// Rewrites CRLF as LF, holding a trailing CR across buffer boundaries.
#[derive(Debug, Default)]
struct AsciiDecoder {
    pending_cr: bool,
}

impl AsciiDecoder {
    fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.clear();
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                if b != b'\n' {
                    out.push(b'\r');
                }
            }
            if b == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        out.clear();
        if std::mem::take(&mut self.pending_cr) {
            out.push(b'\r');
        }
    }
}

/// One transfer on a storage node: a local file on one side, a data
/// connection on the other.
#[derive(Debug)]
pub struct FileTransfer {
    root: PathBuf,
    connection: DataConnection,
    transferred: AtomicU64,
    checksum: AtomicU32,
    started: Mutex<Option<Instant>>,
    finished_after: Mutex<Option<Duration>>,
    cancel: CancellationToken,
}

impl FileTransfer {
    /// Creates a transfer rooted at the node's storage directory.
    pub fn new(root: impl Into<PathBuf>, connection: DataConnection) -> Self {
        Self {
            root: root.into(),
            connection,
            transferred: AtomicU64::new(0),
            checksum: AtomicU32::new(0),
            started: Mutex::new(None),
            finished_after: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn begin(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        let mut started = self.started.lock();
        if started.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        *started = Some(Instant::now());
        Ok(())
    }

    fn complete(&self) -> TransferStatus {
        let elapsed = self.elapsed();
        *self.finished_after.lock() = Some(elapsed);
        TransferStatus {
            elapsed_ms: elapsed.as_millis() as u64,
            transferred: self.transferred_bytes(),
            checksum: self.checksum(),
            finished: true,
        }
    }

    /// Snapshot of progress, finished or not.
    pub fn status(&self) -> TransferStatus {
        TransferStatus {
            elapsed_ms: self.elapsed().as_millis() as u64,
            transferred: self.transferred_bytes(),
            checksum: self.checksum(),
            finished: self.finished_after.lock().is_some(),
        }
    }

    async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Aborted),
            res = fut => res.map_err(TransportError::IoError),
        }
    }
}

#[async_trait]
impl SlaveTransfer for FileTransfer {
    async fn send_file(
        &self,
        path: &str,
        mode: TransferMode,
        resume_position: u64,
        want_checksum: bool,
    ) -> Result<TransferStatus> {
        let file_path = resolve_under(&self.root, path)?;
        let mut file = tokio::fs::File::open(&file_path).await?;
        if resume_position > 0 {
            file.seek(std::io::SeekFrom::Start(resume_position)).await?;
        }

        let mut stream = self.connection.connect().await?;
        self.begin()?;
        debug!(path = %file_path.display(), ?mode, resume_position, "sending file");

        let mut hasher = crc32fast::Hasher::new();
        let mut encoder = AsciiEncoder::default();
        let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut encoded = Vec::with_capacity(TRANSFER_BUFFER_SIZE * 2);
        loop {
            let n = self.cancellable(file.read(&mut buf)).await?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            if want_checksum {
                hasher.update(chunk);
                self.checksum.store(hasher.clone().finalize(), Ordering::Relaxed);
            }
            let wire = match mode {
                TransferMode::Binary => chunk,
                TransferMode::Ascii => {
                    encoder.encode(chunk, &mut encoded);
                    &encoded[..]
                }
            };
            self.cancellable(stream.write_all(wire)).await?;
            self.transferred.fetch_add(wire.len() as u64, Ordering::Relaxed);
        }
        self.cancellable(stream.shutdown()).await?;

        let status = self.complete();
        info!(
            path = %file_path.display(),
            bytes = status.transferred,
            speed = status.throughput(),
            "file sent"
        );
        Ok(status)
    }

    async fn receive_file(
        &self,
        directory: &str,
        mode: TransferMode,
        filename: &str,
        offset: u64,
    ) -> Result<TransferStatus> {
        if filename.is_empty() || filename.contains('/') || filename == ".." {
            return Err(TransportError::InvalidPath {
                path: filename.to_string(),
            });
        }
        let dir = resolve_under(&self.root, directory)?;
        tokio::fs::create_dir_all(&dir).await?;
        let file_path = dir.join(filename);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&file_path)
            .await?;
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut stream = self.connection.connect().await?;
        self.begin()?;
        debug!(path = %file_path.display(), ?mode, offset, "receiving file");

        let mut hasher = crc32fast::Hasher::new();
        let mut decoder = AsciiDecoder::default();
        let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut decoded = Vec::with_capacity(TRANSFER_BUFFER_SIZE);
        loop {
            let n = self.cancellable(stream.read(&mut buf)).await?;
            if n == 0 {
                break;
            }
            self.transferred.fetch_add(n as u64, Ordering::Relaxed);
            let data = match mode {
                TransferMode::Binary => &buf[..n],
                TransferMode::Ascii => {
                    decoder.decode(&buf[..n], &mut decoded);
                    &decoded[..]
                }
            };
            hasher.update(data);
            self.checksum.store(hasher.clone().finalize(), Ordering::Relaxed);
            self.cancellable(file.write_all(data)).await?;
        }
        if mode == TransferMode::Ascii {
            decoder.finish(&mut decoded);
            if !decoded.is_empty() {
                hasher.update(&decoded);
                self.checksum.store(hasher.finalize(), Ordering::Relaxed);
                file.write_all(&decoded).await?;
            }
        }
        file.sync_all().await?;

        let status = self.complete();
        info!(
            path = %file_path.display(),
            bytes = status.transferred,
            speed = status.throughput(),
            "file received"
        );
        Ok(status)
    }

    fn abort(&self, reason: &str) {
        if !self.cancel.is_cancelled() {
            warn!(reason, "transfer aborted");
        }
        self.cancel.cancel();
        self.connection.abort();
    }

    fn elapsed(&self) -> Duration {
        if let Some(done) = *self.finished_after.lock() {
            return done;
        }
        self.started
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn throughput(&self) -> u64 {
        throughput(self.transferred_bytes(), self.elapsed())
    }

    fn checksum(&self) -> u32 {
        self.checksum.load(Ordering::Relaxed)
    }

    fn local_port(&self) -> Option<u16> {
        self.connection.local_port()
    }
}
