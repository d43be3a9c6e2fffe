//! Placement policies deciding what to archive and where.
//!
//! Every policy implements [`ArchiveType`]. Shared logic (candidate scan,
//! archived check, job emission, cleanup) lives in [`ArchiveTypeBase`], which
//! each variant embeds; variants differ only in destination selection.

mod affinity;
mod most_free;

pub use affinity::AffinityArchive;
pub use most_free::MostFreeArchive;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ArchiveKind, SectionConfig};
use crate::error::{ArchiveError, Result};
use crate::job::{Job, JobStatus};
use crate::namespace::{DirRef, FileEntry, Namespace};
use crate::node::{Fleet, SlaveHandle};
use crate::registry::ArchiveRegistry;

/// Collaborators a policy queries.
#[derive(Clone)]
pub struct PolicyContext {
    /// Namespace service.
    pub namespace: Arc<dyn Namespace>,
    /// Fleet registry.
    pub fleet: Arc<dyn Fleet>,
    /// Directories currently being archived.
    pub registry: Arc<ArchiveRegistry>,
}

impl std::fmt::Debug for PolicyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyContext")
            .field("archiving", &self.registry.len())
            .finish()
    }
}

/// What one run achieved, produced by cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Section name.
    pub section: String,
    /// Directory archived.
    pub directory: DirRef,
    /// Jobs that completed.
    pub jobs_done: usize,
    /// Jobs that failed.
    pub jobs_failed: usize,
    /// Whether the directory now meets its replication target.
    pub archived: bool,
    /// New location when the directory was moved after archiving.
    pub moved_to: Option<DirRef>,
}

#[derive(Debug, Default)]
struct RunState {
    directory: Option<DirRef>,
    destinations: Option<Vec<Arc<SlaveHandle>>>,
}

/// State and helpers shared by all policies.
#[derive(Debug)]
pub struct ArchiveTypeBase {
    section: SectionConfig,
    ctx: PolicyContext,
    state: Mutex<RunState>,
}

impl ArchiveTypeBase {
    /// Creates the base for one section.
    pub fn new(section: SectionConfig, ctx: PolicyContext) -> Self {
        Self {
            section,
            ctx,
            state: Mutex::new(RunState::default()),
        }
    }

    /// Section parameters.
    pub fn section(&self) -> &SectionConfig {
        &self.section
    }

    /// Collaborators.
    pub fn context(&self) -> &PolicyContext {
        &self.ctx
    }

    /// Directory assigned to the current run.
    pub fn directory(&self) -> Option<DirRef> {
        self.state.lock().directory.clone()
    }

    /// Assigns (or clears) the run's directory. Changing the directory drops
    /// destinations resolved for the previous one.
    pub fn set_directory(&self, directory: Option<DirRef>) {
        let mut state = self.state.lock();
        if state.directory != directory {
            state.destinations = None;
        }
        state.directory = directory;
    }

    /// Frozen destination set, if resolved.
    pub fn destinations(&self) -> Option<Vec<Arc<SlaveHandle>>> {
        self.state.lock().destinations.clone()
    }

    /// Freezes the destination set. It cannot change for the rest of the run.
    pub fn freeze_destinations(&self, slaves: Vec<Arc<SlaveHandle>>) -> Result<()> {
        if slaves.is_empty() {
            return Err(ArchiveError::InvalidState {
                msg: "empty destination set".to_string(),
            });
        }
        let mut state = self.state.lock();
        if state.destinations.is_some() {
            return Err(ArchiveError::InvalidState {
                msg: "destinations already frozen".to_string(),
            });
        }
        state.destinations = Some(slaves);
        Ok(())
    }

    fn clear(&self) {
        *self.state.lock() = RunState::default();
    }

    /// Assigned directory or `InvalidState`.
    pub fn require_directory(&self) -> Result<DirRef> {
        self.directory().ok_or_else(|| ArchiveError::InvalidState {
            msg: "no directory assigned".to_string(),
        })
    }

    /// Files of `dir` considered by this section.
    pub fn files(&self, dir: &DirRef) -> Result<Vec<FileEntry>> {
        self.ctx.namespace.files(dir, self.section.scan_subdirs)
    }

    /// Reachable nodes this section may place copies on, in fleet order.
    pub fn eligible_slaves(&self) -> Vec<Arc<SlaveHandle>> {
        self.ctx
            .fleet
            .available_slaves()
            .into_iter()
            .filter(|s| self.section.is_eligible(s.name()))
            .collect()
    }

    /// Per-node file counts over `files`, in order of first encounter:
    /// files in listing order, each file's nodes in placement order.
    /// Only eligible, reachable nodes are counted.
    pub fn placement_counts(&self, files: &[FileEntry]) -> Vec<(Arc<SlaveHandle>, usize)> {
        let eligible = self.eligible_slaves();
        let mut counts: Vec<(Arc<SlaveHandle>, usize)> = Vec::new();
        for file in files {
            for name in &file.slaves {
                if let Some(entry) = counts.iter_mut().find(|(s, _)| s.name() == name) {
                    entry.1 += 1;
                } else if let Some(slave) = eligible.iter().find(|s| s.name() == name) {
                    counts.push((slave.clone(), 1));
                }
            }
        }
        counts
    }

    /// Nodes holding every one of `files`.
    pub fn complete_holders(&self, files: &[FileEntry]) -> Vec<Arc<SlaveHandle>> {
        if files.is_empty() {
            return Vec::new();
        }
        self.placement_counts(files)
            .into_iter()
            .filter(|(_, n)| *n == files.len())
            .map(|(s, _)| s)
            .collect()
    }

    /// Up to `count` eligible nodes not in `exclude`, most free space first.
    /// Equal free space keeps fleet order.
    pub fn most_free(&self, exclude: &[Arc<SlaveHandle>], count: usize) -> Vec<Arc<SlaveHandle>> {
        let mut pool: Vec<_> = self
            .eligible_slaves()
            .into_iter()
            .filter(|s| !exclude.iter().any(|e| e.name() == s.name()))
            .collect();
        pool.sort_by_key(|s| std::cmp::Reverse(s.free_space()));
        pool.truncate(count);
        pool
    }

    /// A directory is archived once `num_of_slaves` nodes each hold all of
    /// its files. Empty directories count as archived.
    pub fn is_archived(&self, dir: &DirRef) -> Result<bool> {
        let files = self.files(dir)?;
        if files.is_empty() {
            return Ok(true);
        }
        Ok(self.complete_holders(&files).len() >= self.section.num_of_slaves)
    }

    /// Section subdirectories old enough to archive, oldest first, skipping
    /// ignored names and directories other handlers own.
    pub fn candidates(&self) -> Result<Vec<DirRef>> {
        let now = SystemTime::now();
        let min_age = Duration::from_secs(self.section.archive_after_secs);
        let mut dirs = Vec::new();
        for dir in self.ctx.namespace.subdirectories(&self.section.path)? {
            if self.section.ignore.iter().any(|i| i == dir.name()) {
                continue;
            }
            if self.ctx.registry.is_path_archiving(dir.as_str()) {
                debug!(directory = %dir, "skipping directory being archived");
                continue;
            }
            let created = self.ctx.namespace.created_at(&dir)?;
            if now.duration_since(created).unwrap_or_default() < min_age {
                continue;
            }
            dirs.push((created, dir));
        }
        dirs.sort();
        Ok(dirs.into_iter().map(|(_, d)| d).collect())
    }

    /// One job per (file, destination) pair the destination lacks.
    pub fn emit_jobs(&self) -> Result<Vec<Arc<Job>>> {
        let dir = self.require_directory()?;
        let destinations = self.destinations().ok_or_else(|| ArchiveError::InvalidState {
            msg: "destinations not resolved".to_string(),
        })?;
        let mut jobs = Vec::new();
        for file in self.files(&dir)? {
            for dest in &destinations {
                if !file.is_on(dest.name()) {
                    jobs.push(Arc::new(Job::new(file.clone(), dest.clone(), self.section.priority)));
                }
            }
        }
        debug!(directory = %dir, jobs = jobs.len(), "jobs emitted");
        Ok(jobs)
    }

    /// Waits for every job to reach a terminal state.
    pub async fn wait_for(&self, jobs: &[Arc<Job>]) {
        for job in jobs {
            job.wait().await;
        }
    }

    /// Tallies the run, moves a fully archived directory if configured, and
    /// clears run state.
    pub fn finish(&self, jobs: &[Arc<Job>]) -> Result<ArchiveReport> {
        let dir = self.require_directory()?;
        let jobs_done = jobs.iter().filter(|j| j.status() == JobStatus::Done).count();
        let jobs_failed = jobs
            .iter()
            .filter(|j| matches!(j.status(), JobStatus::Failed(_)))
            .count();
        let archived = self.is_archived(&dir)?;

        let mut moved_to = None;
        if archived {
            if let Some(dest_root) = &self.section.move_to {
                let target = dest_root.join(dir.name());
                match self.ctx.namespace.rename(&dir, &target) {
                    Ok(()) => moved_to = Some(target),
                    Err(e) => warn!(directory = %dir, error = %e, "archived directory not moved"),
                }
            }
        }

        if jobs_failed > 0 {
            warn!(directory = %dir, jobs_failed, "archive run finished with failed jobs");
        }
        info!(
            section = %self.section.name,
            directory = %dir,
            jobs_done,
            jobs_failed,
            archived,
            "archive run finished"
        );
        self.clear();
        Ok(ArchiveReport {
            section: self.section.name.clone(),
            directory: dir,
            jobs_done,
            jobs_failed,
            archived,
            moved_to,
        })
    }
}

/// A placement policy driven by an archive handler.
#[async_trait]
pub trait ArchiveType: Send + Sync {
    /// Shared state and helpers.
    fn base(&self) -> &ArchiveTypeBase;

    /// Which heuristic this is.
    fn kind(&self) -> ArchiveKind;

    /// Destination set for the assigned directory; `None` when no eligible
    /// destination exists right now.
    ///
    /// The set names every node that should hold a complete copy once the
    /// run is done, including nodes that already do. Jobs are only emitted
    /// for the files a destination lacks.
    fn find_destination_slaves(&self) -> Result<Option<Vec<Arc<SlaveHandle>>>>;

    /// Section parameters.
    fn section(&self) -> &SectionConfig {
        self.base().section()
    }

    /// Directory assigned to the current run.
    fn directory(&self) -> Option<DirRef> {
        self.base().directory()
    }

    /// Assigns or clears the run's directory.
    fn set_directory(&self, directory: Option<DirRef>) {
        self.base().set_directory(directory)
    }

    /// Frozen destinations, if resolved.
    fn destinations(&self) -> Option<Vec<Arc<SlaveHandle>>> {
        self.base().destinations()
    }

    /// Freezes the destination set.
    fn set_destinations(&self, slaves: Vec<Arc<SlaveHandle>>) -> Result<()> {
        self.base().freeze_destinations(slaves)
    }

    /// Whether `dir` meets the section's replication target.
    fn is_archived_dir(&self, dir: &DirRef) -> Result<bool> {
        self.base().is_archived(dir)
    }

    /// Oldest candidate not yet archived.
    fn get_oldest_non_archived_dir(&self) -> Result<Option<DirRef>> {
        for dir in self.base().candidates()? {
            if !self.is_archived_dir(&dir)? {
                return Ok(Some(dir));
            }
        }
        Ok(None)
    }

    /// Jobs copying the directory to the frozen destinations.
    fn send(&self) -> Result<Vec<Arc<Job>>> {
        self.base().emit_jobs()
    }

    /// Blocks until every job finished or failed.
    async fn wait_for_send_of_files(&self, jobs: &[Arc<Job>]) {
        self.base().wait_for(jobs).await
    }

    /// Records completion and releases run state.
    fn cleanup(&self, jobs: &[Arc<Job>]) -> Result<ArchiveReport> {
        self.base().finish(jobs)
    }
}

/// Builds the policy configured for `section`.
pub fn archive_type_for(section: SectionConfig, ctx: PolicyContext) -> Arc<dyn ArchiveType> {
    match section.archive_type {
        ArchiveKind::MostFree => Arc::new(MostFreeArchive::new(section, ctx)),
        ArchiveKind::Affinity => Arc::new(AffinityArchive::new(section, ctx)),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::namespace::MemoryNamespace;
    use crate::node::MemoryFleet;

    pub(crate) struct Fixture {
        pub ns: Arc<MemoryNamespace>,
        pub fleet: Arc<MemoryFleet>,
        pub registry: Arc<ArchiveRegistry>,
    }

    impl Fixture {
        pub fn new(slaves: &[(&str, u64)]) -> Self {
            let fleet = MemoryFleet::new();
            for (name, free) in slaves {
                fleet.add(SlaveHandle::new(*name, *free));
            }
            Self {
                ns: Arc::new(MemoryNamespace::new()),
                fleet: Arc::new(fleet),
                registry: Arc::new(ArchiveRegistry::new()),
            }
        }

        pub fn ctx(&self) -> PolicyContext {
            PolicyContext {
                namespace: self.ns.clone(),
                fleet: self.fleet.clone(),
                registry: self.registry.clone(),
            }
        }

        pub fn dir(&self, path: &str, age_secs: u64) {
            self.ns
                .mkdirs(&DirRef::new(path), SystemTime::now() - Duration::from_secs(age_secs));
        }

        pub fn file(&self, path: &str, slaves: &[&str]) {
            self.ns.add_file(path, 100, slaves);
        }
    }
}
