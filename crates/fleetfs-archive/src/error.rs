//! Error types for the archive subsystem.

use fleetfs_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while selecting, registering or archiving a directory.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Another handler already archives this directory.
    #[error("directory {directory} is already being archived")]
    DuplicateArchive {
        /// The contested directory.
        directory: String,
    },

    /// A job's destination node went away.
    #[error("slave {node} unavailable")]
    NodeUnavailable {
        /// Name of the unreachable node.
        node: String,
    },

    /// Connection or transfer failure.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Bookkeeping that should be impossible, e.g. removing an unregistered
    /// directory. Indicates a defect.
    #[error("internal consistency fault: {msg}")]
    InternalConsistency {
        /// What was found inconsistent.
        msg: String,
    },

    /// An operation was called out of lifecycle order.
    #[error("invalid policy state: {msg}")]
    InvalidState {
        /// What was missing.
        msg: String,
    },

    /// The namespace could not answer a query.
    #[error("namespace error: {msg}")]
    Namespace {
        /// Error message describing the issue.
        msg: String,
    },

    /// Invalid archive configuration.
    #[error("config error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },
}

impl ArchiveError {
    /// True for defects, which observability output keeps apart from
    /// ordinary operational failures.
    pub fn is_internal_fault(&self) -> bool {
        matches!(self, ArchiveError::InternalConsistency { .. })
    }

    /// True when the error means a node could not be reached.
    pub fn is_node_unavailable(&self) -> bool {
        match self {
            ArchiveError::NodeUnavailable { .. } => true,
            ArchiveError::Transport(e) => e.is_node_unreachable(),
            _ => false,
        }
    }
}

/// Result alias for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;
