//! Per-file copy jobs and the executor that runs them.
//!
//! A [`Job`] copies one file to one destination node. Once submitted it is
//! driven by a [`JobExecutor`]; everyone else only observes its status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetfs_transport::TransferStatus;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
use crate::namespace::{FileEntry, Namespace};
use crate::node::SlaveHandle;

/// Job identifier, unique within the process.
pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// The destination (or source) node was unreachable.
    NodeUnavailable {
        /// Node that went away.
        node: String,
    },
    /// The transfer itself failed.
    Transport(String),
    /// The executor could not run the job.
    Executor(String),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::NodeUnavailable { node } => write!(f, "slave {} unavailable", node),
            JobFailure::Transport(msg) => write!(f, "transfer failed: {}", msg),
            JobFailure::Executor(msg) => write!(f, "executor: {}", msg),
        }
    }
}

/// Lifecycle of a job. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Submitted, waiting for a slot.
    Queued,
    /// Data is moving.
    Transferring,
    /// Copy completed and recorded.
    Done,
    /// Copy failed.
    Failed(JobFailure),
}

impl JobStatus {
    /// True for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed(_))
    }
}

/// One file copied to one destination.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    file: FileEntry,
    destination: Arc<SlaveHandle>,
    priority: u32,
    status: watch::Sender<JobStatus>,
    transfer: Mutex<Option<TransferStatus>>,
}

impl Job {
    /// Creates a queued job.
    pub fn new(file: FileEntry, destination: Arc<SlaveHandle>, priority: u32) -> Self {
        let (status, _) = watch::channel(JobStatus::Queued);
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            file,
            destination,
            priority,
            status,
            transfer: Mutex::new(None),
        }
    }

    /// Job id.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// File being copied.
    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    /// Nodes the file can be read from.
    pub fn sources(&self) -> &[String] {
        &self.file.slaves
    }

    /// Node receiving the copy.
    pub fn destination(&self) -> &Arc<SlaveHandle> {
        &self.destination
    }

    /// Scheduling priority; higher runs first where the executor cares.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// True once the job reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Transfer statistics of a completed copy.
    pub fn transfer_status(&self) -> Option<TransferStatus> {
        self.transfer.lock().clone()
    }

    fn transition(&self, next: JobStatus) -> bool {
        self.status.send_if_modified(|cur| {
            if cur.is_terminal() {
                return false;
            }
            *cur = next;
            true
        })
    }

    /// Moves a queued job to `Transferring`. Returns false if already terminal.
    pub fn mark_transferring(&self) -> bool {
        self.transition(JobStatus::Transferring)
    }

    /// Marks the job done. Terminal states are sticky.
    pub fn mark_done(&self, transfer: TransferStatus) -> bool {
        *self.transfer.lock() = Some(transfer);
        self.transition(JobStatus::Done)
    }

    /// Marks the job failed. Terminal states are sticky.
    pub fn mark_failed(&self, failure: JobFailure) -> bool {
        self.transition(JobStatus::Failed(failure))
    }

    /// Waits until the job is `Done` or `Failed`.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(JobStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }
}

/// The substrate jobs are handed to.
pub trait JobExecutor: Send + Sync {
    /// Takes ownership of driving `job` to a terminal state.
    fn submit(&self, job: Arc<Job>) -> Result<()>;
}

/// Performs the actual copy of one job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Copies `job.file()` from one of its sources to its destination.
    async fn run(&self, job: &Job) -> Result<TransferStatus>;
}

/// Executor running jobs as tokio tasks, at most `max_concurrent` at a time.
pub struct JobManager {
    runner: Arc<dyn JobRunner>,
    namespace: Arc<dyn Namespace>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl JobManager {
    /// Creates an executor. `max_concurrent` is clamped to at least one.
    pub fn new(runner: Arc<dyn JobRunner>, namespace: Arc<dyn Namespace>, max_concurrent: usize) -> Self {
        Self {
            runner,
            namespace,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    fn failure_for(job: &Job, err: &ArchiveError) -> JobFailure {
        if err.is_node_unavailable() {
            let node = match err {
                ArchiveError::NodeUnavailable { node } => node.clone(),
                _ => job.destination().name().to_string(),
            };
            JobFailure::NodeUnavailable { node }
        } else {
            JobFailure::Transport(err.to_string())
        }
    }

    async fn execute(
        job: Arc<Job>,
        runner: Arc<dyn JobRunner>,
        namespace: Arc<dyn Namespace>,
    ) {
        let dest = job.destination().clone();
        let unavailable = || JobFailure::NodeUnavailable {
            node: dest.name().to_string(),
        };

        if !dest.is_available() {
            warn!(job = job.id(), slave = dest.name(), "destination offline before transfer");
            job.mark_failed(unavailable());
            return;
        }
        job.mark_transferring();
        debug!(job = job.id(), file = %job.file().path, slave = dest.name(), "transfer started");

        let task = {
            let job = job.clone();
            tokio::spawn(async move { runner.run(&job).await })
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(job = job.id(), error = %e, "job runner panicked");
                job.mark_failed(JobFailure::Executor(format!("runner panicked: {}", e)));
                return;
            }
        };

        // The node may have dropped out while data was moving.
        if !dest.is_available() {
            warn!(job = job.id(), slave = dest.name(), "destination went offline during transfer");
            job.mark_failed(unavailable());
            return;
        }

        match result {
            Ok(status) => match namespace.add_replica(&job.file().path, dest.name()) {
                Ok(()) => {
                    info!(
                        job = job.id(),
                        file = %job.file().path,
                        slave = dest.name(),
                        bytes = status.transferred,
                        "job done"
                    );
                    job.mark_done(status);
                }
                Err(e) => {
                    warn!(job = job.id(), error = %e, "copy finished but placement not recorded");
                    job.mark_failed(JobFailure::Executor(e.to_string()));
                }
            },
            Err(e) => {
                let failure = Self::failure_for(&job, &e);
                warn!(job = job.id(), error = %e, "job failed");
                job.mark_failed(failure);
            }
        }
    }
}

impl JobExecutor for JobManager {
    fn submit(&self, job: Arc<Job>) -> Result<()> {
        let runner = self.runner.clone();
        let namespace = self.namespace.clone();
        let permits = self.permits.clone();
        let handle = tokio::runtime::Handle::try_current().map_err(|e| ArchiveError::InvalidState {
            msg: format!("job executor needs a runtime: {}", e),
        })?;
        handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                job.mark_failed(JobFailure::Executor("executor closed".into()));
                return;
            };
            Self::execute(job, runner, namespace).await;
        });
        Ok(())
    }
}
