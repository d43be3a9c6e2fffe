#![warn(missing_docs)]

//! FleetFS archive subsystem: placement policies, archive registry, archive handlers and copy jobs

pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod namespace;
pub mod node;
pub mod policy;
pub mod registry;
pub mod remote;
pub mod snapshot;

pub use config::{ArchiveConfig, ArchiveKind, SectionConfig, TransferConfig};
pub use error::{ArchiveError, Result};
pub use handler::{ArchiveHandler, HandlerOutcome, HandlerState};
pub use job::{Job, JobExecutor, JobFailure, JobId, JobManager, JobRunner, JobStatus};
pub use namespace::{DirRef, FileEntry, MemoryNamespace, Namespace};
pub use node::{Fleet, MemoryFleet, SlaveHandle};
pub use policy::{
    archive_type_for, AffinityArchive, ArchiveReport, ArchiveType, ArchiveTypeBase, MostFreeArchive,
    PolicyContext,
};
pub use registry::{ArchiveRegistry, ArchiveSlot, HandlerInfo};
pub use remote::RemoteJobRunner;
pub use snapshot::Snapshot;
