use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse class of a failure reported by a remote node, carried on the wire
/// so the coordinator can still tell an unreachable peer from a bad request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The node could not reach its data-channel peer.
    Unreachable,
    /// The transfer was aborted.
    Aborted,
    /// The request named a path outside the node's storage root.
    InvalidPath,
    /// A transfer is already running on this session.
    Busy,
    /// Anything else.
    Other,
}

/// Failures raised while establishing a data connection or moving file data over it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer actively refused the outbound connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that refused the connection.
        addr: String,
    },

    /// Connect or accept did not complete within the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Peer (active) or listening (passive) address.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The connection was aborted before or while it was being established.
    #[error("connection aborted")]
    Aborted,

    /// `connect()` was already called on this single-use connection.
    #[error("connection already used")]
    AlreadyConnected,

    /// No port in the configured passive range could be bound.
    #[error("no free port in range {start}-{end}")]
    NoPortAvailable {
        /// First port of the range.
        start: u16,
        /// Last port of the range.
        end: u16,
    },

    /// The storage node serving the transfer is unreachable.
    #[error("node {node} unavailable")]
    NodeUnavailable {
        /// Name of the unreachable node.
        node: String,
    },

    /// A transfer path escaped the node's storage root.
    #[error("invalid transfer path: {path}")]
    InvalidPath {
        /// Offending path.
        path: String,
    },

    /// A node reported a failure over the control stream.
    #[error("node {node}: {message}")]
    Remote {
        /// Node that reported the failure.
        node: String,
        /// Class of the node-side failure.
        kind: RemoteErrorKind,
        /// Display form of the node-side error.
        message: String,
    },

    #[error("TLS handshake failed: {reason}")]
    TlsError { reason: String },

    #[error("message too large: {size} bytes (max {max_size})")]
    MessageTooLarge { size: u32, max_size: u32 },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// True when the failure means the remote node could not be reached at all,
    /// as opposed to a failure while data was already flowing.
    pub fn is_node_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused { .. }
                | TransportError::ConnectionTimeout { .. }
                | TransportError::NodeUnavailable { .. }
                | TransportError::Remote {
                    kind: RemoteErrorKind::Unreachable,
                    ..
                }
        )
    }

    /// Class this error travels as when reported to a remote coordinator.
    pub fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            e if e.is_node_unreachable() => RemoteErrorKind::Unreachable,
            TransportError::Aborted => RemoteErrorKind::Aborted,
            TransportError::InvalidPath { .. } => RemoteErrorKind::InvalidPath,
            TransportError::Remote { kind, .. } => *kind,
            _ => RemoteErrorKind::Other,
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
