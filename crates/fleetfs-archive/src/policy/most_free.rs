use std::sync::Arc;

use tracing::debug;

use super::{ArchiveType, ArchiveTypeBase, PolicyContext};
use crate::config::{ArchiveKind, SectionConfig};
use crate::error::Result;
use crate::node::SlaveHandle;

/// Keeps nodes that already hold the whole directory and fills the rest of
/// the replication target with the nodes that have the most free space.
#[derive(Debug)]
pub struct MostFreeArchive {
    base: ArchiveTypeBase,
}

impl MostFreeArchive {
    /// Creates the policy for `section`.
    pub fn new(section: SectionConfig, ctx: PolicyContext) -> Self {
        Self {
            base: ArchiveTypeBase::new(section, ctx),
        }
    }
}

impl ArchiveType for MostFreeArchive {
    fn base(&self) -> &ArchiveTypeBase {
        &self.base
    }

    fn kind(&self) -> ArchiveKind {
        ArchiveKind::MostFree
    }

    fn find_destination_slaves(&self) -> Result<Option<Vec<Arc<SlaveHandle>>>> {
        let dir = self.base.require_directory()?;
        let wanted = self.base.section().num_of_slaves;
        let files = self.base.files(&dir)?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut destinations = self.base.complete_holders(&files);
        destinations.truncate(wanted);
        let missing = wanted.saturating_sub(destinations.len());
        let extra = self.base.most_free(&destinations, missing);
        if extra.len() < missing {
            debug!(directory = %dir, wanted, found = destinations.len() + extra.len(), "not enough slaves");
            return Ok(None);
        }
        destinations.extend(extra);
        Ok(Some(destinations))
    }
}
