//! Process-wide table of directories being archived.
//!
//! Registration is a single check-and-insert under one lock, so two handlers
//! can never both own a directory. Ownership is held through an
//! [`ArchiveSlot`], which unregisters when dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{ArchiveError, Result};
use crate::namespace::DirRef;

/// Registry entry describing the owning handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    /// Handler id.
    pub id: Uuid,
    /// Section the directory belongs to.
    pub section: String,
    /// Directory being archived.
    pub directory: DirRef,
    /// When the handler registered.
    pub started_at: SystemTime,
}

/// Directories currently being archived, keyed by path.
#[derive(Debug, Default)]
pub struct ArchiveRegistry {
    entries: Mutex<HashMap<DirRef, HandlerInfo>>,
}

impl ArchiveRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `info.directory`, failing with `DuplicateArchive` when some
    /// handler already owns it. The returned slot unregisters on drop.
    pub fn add_archive_handler(self: &Arc<Self>, info: HandlerInfo) -> Result<ArchiveSlot> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&info.directory) {
            return Err(ArchiveError::DuplicateArchive {
                directory: info.directory.to_string(),
            });
        }
        let slot = ArchiveSlot {
            registry: Arc::clone(self),
            directory: info.directory.clone(),
            owner: info.id,
            released: false,
        };
        debug!(directory = %info.directory, handler = %info.id, "archive handler registered");
        entries.insert(info.directory.clone(), info);
        Ok(slot)
    }

    /// Unregisters `directory` owned by `owner`. A missing entry or a foreign
    /// owner is a defect: it is logged at error level and returned as
    /// `InternalConsistency`.
    pub fn remove_archive_handler(&self, directory: &DirRef, owner: Uuid) -> Result<HandlerInfo> {
        let mut entries = self.entries.lock();
        let fault = match entries.get(directory) {
            Some(info) if info.id == owner => None,
            Some(info) => Some(format!(
                "{} is owned by handler {}, not {}",
                directory, info.id, owner
            )),
            None => Some(format!("{} is not registered (handler {})", directory, owner)),
        };
        if let Some(msg) = fault {
            drop(entries);
            error!(fault = "internal_consistency", %msg, "archive registry removal failed");
            return Err(ArchiveError::InternalConsistency { msg });
        }
        let info = entries
            .remove(directory)
            .ok_or_else(|| ArchiveError::InternalConsistency {
                msg: format!("{} vanished during removal", directory),
            })?;
        debug!(directory = %directory, handler = %owner, "archive handler unregistered");
        Ok(info)
    }

    /// True if `directory` is registered.
    pub fn contains(&self, directory: &DirRef) -> bool {
        self.entries.lock().contains_key(directory)
    }

    /// True if `path` is a registered directory or lies beneath one. The
    /// namespace uses this to refuse deleting directories mid-archive.
    pub fn is_path_archiving(&self, path: &str) -> bool {
        self.entries
            .lock()
            .keys()
            .any(|dir| dir.contains_path(path))
    }

    /// Snapshot of all entries.
    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.entries.lock().values().cloned().collect()
    }

    /// Number of registered directories.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is being archived.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Ownership of one registry entry. Dropping it unregisters the directory,
/// including during unwinding.
#[derive(Debug)]
pub struct ArchiveSlot {
    registry: Arc<ArchiveRegistry>,
    directory: DirRef,
    owner: Uuid,
    released: bool,
}

impl ArchiveSlot {
    /// Directory this slot owns.
    pub fn directory(&self) -> &DirRef {
        &self.directory
    }

    /// Unregisters now, reporting any consistency fault to the caller.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.registry
            .remove_archive_handler(&self.directory, self.owner)
            .map(|_| ())
    }
}

impl Drop for ArchiveSlot {
    fn drop(&mut self) {
        if !self.released {
            // Fault, if any, is already logged by the registry.
            let _ = self
                .registry
                .remove_archive_handler(&self.directory, self.owner);
        }
    }
}
