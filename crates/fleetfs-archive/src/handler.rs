//! Drives one archive run of one directory.
//!
//! A handler selects a directory (unless one was pre-assigned), registers it,
//! resolves destinations, submits jobs, waits for them and cleans up. The
//! registry entry is held through an [`ArchiveSlot`], so every exit path,
//! unwinding included, unregisters the directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SectionConfig;
use crate::error::ArchiveError;
use crate::job::{Job, JobExecutor, JobFailure};
use crate::namespace::DirRef;
use crate::policy::{ArchiveReport, ArchiveType};
use crate::registry::{ArchiveRegistry, ArchiveSlot, HandlerInfo};

/// Progress of a handler. Early exits jump straight to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Not started.
    Start,
    /// A directory is assigned.
    DirectorySelected,
    /// The directory is registered to this handler.
    Registered,
    /// Destinations are frozen.
    DestinationsResolved,
    /// Jobs were handed to the executor.
    JobsSubmitted,
    /// Waiting for jobs to finish.
    Waiting,
    /// Recording the result.
    Cleanup,
    /// Finished.
    Done,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Nothing left to archive in the section.
    NoDirectory,
    /// Another handler owns the directory.
    Duplicate {
        /// Contested directory.
        directory: DirRef,
    },
    /// No eligible destinations; the directory is retried on a later cycle.
    NoDestination {
        /// Directory that was released.
        directory: DirRef,
    },
    /// All jobs reached a terminal state and cleanup ran.
    Completed(ArchiveReport),
    /// The run stopped on an error or panic.
    Failed {
        /// Directory involved, if one was selected.
        directory: Option<DirRef>,
        /// What went wrong.
        reason: String,
    },
}

/// One archive run.
pub struct ArchiveHandler {
    id: Uuid,
    policy: Arc<dyn ArchiveType>,
    executor: Arc<dyn JobExecutor>,
    started: AtomicBool,
    state: Mutex<HandlerState>,
    directory: Mutex<Option<DirRef>>,
    jobs: Mutex<Vec<Arc<Job>>>,
    done: watch::Sender<Option<HandlerOutcome>>,
}

impl std::fmt::Debug for ArchiveHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandler")
            .field("id", &self.id)
            .field("section", &self.policy.section().name)
            .field("state", &self.state())
            .finish()
    }
}

/// Publishes the outcome when the run ends, however it ends.
struct DoneGuard<'a> {
    handler: &'a ArchiveHandler,
    outcome: Option<HandlerOutcome>,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            let reason = if std::thread::panicking() {
                "archive handler panicked"
            } else {
                "archive handler cancelled"
            };
            warn!(handler = %self.handler.id, reason, "archive run aborted");
            HandlerOutcome::Failed {
                directory: self.handler.directory.lock().clone(),
                reason: reason.to_string(),
            }
        });
        self.handler.set_state(HandlerState::Done);
        self.handler.done.send_replace(Some(outcome));
    }
}

impl ArchiveHandler {
    /// Creates a handler running `policy`'s section, submitting to `executor`.
    pub fn new(policy: Arc<dyn ArchiveType>, executor: Arc<dyn JobExecutor>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            policy,
            executor,
            started: AtomicBool::new(false),
            state: Mutex::new(HandlerState::Start),
            directory: Mutex::new(None),
            jobs: Mutex::new(Vec::new()),
            done,
        }
    }

    /// Handler id, as recorded in the registry.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Policy driving this run.
    pub fn policy(&self) -> Arc<dyn ArchiveType> {
        self.policy.clone()
    }

    /// Section being archived.
    pub fn section(&self) -> &SectionConfig {
        self.policy.section()
    }

    /// Jobs submitted so far.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().clone()
    }

    /// Current state.
    pub fn state(&self) -> HandlerState {
        *self.state.lock()
    }

    /// Outcome, once the run finished.
    pub fn outcome(&self) -> Option<HandlerOutcome> {
        self.done.borrow().clone()
    }

    /// Waits for the run to finish and returns its outcome.
    pub async fn wait_done(&self) -> HandlerOutcome {
        let mut rx = self.done.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| HandlerOutcome::Failed {
            directory: None,
            reason: "archive handler dropped".to_string(),
        })
    }

    /// Runs the handler on its own task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<HandlerOutcome> {
        let handler = Arc::clone(self);
        tokio::spawn(async move { handler.run().await })
    }

    /// Runs the archive cycle to completion. A handler runs once; later
    /// calls fail without touching the registry.
    pub async fn run(&self) -> HandlerOutcome {
        if self.started.swap(true, Ordering::AcqRel) {
            return HandlerOutcome::Failed {
                directory: None,
                reason: "archive handler already ran".to_string(),
            };
        }
        let mut guard = DoneGuard {
            handler: self,
            outcome: None,
        };
        let outcome = self.archive().await;
        guard.outcome = Some(outcome.clone());
        outcome
    }

    fn set_state(&self, state: HandlerState) {
        *self.state.lock() = state;
        debug!(handler = %self.id, ?state, "archive handler state");
    }

    fn registry(&self) -> &Arc<ArchiveRegistry> {
        &self.policy.base().context().registry
    }

    fn fail(&self, directory: Option<DirRef>, err: ArchiveError) -> HandlerOutcome {
        warn!(handler = %self.id, directory = ?directory, error = %err, "archive run failed");
        self.policy.set_directory(None);
        HandlerOutcome::Failed {
            directory,
            reason: err.to_string(),
        }
    }

    async fn archive(&self) -> HandlerOutcome {
        let directory = match self.policy.directory() {
            Some(dir) => dir,
            None => match self.policy.get_oldest_non_archived_dir() {
                Ok(Some(dir)) => {
                    self.policy.set_directory(Some(dir.clone()));
                    dir
                }
                Ok(None) => {
                    debug!(section = %self.section().name, "nothing to archive");
                    return HandlerOutcome::NoDirectory;
                }
                Err(e) => return self.fail(None, e),
            },
        };
        *self.directory.lock() = Some(directory.clone());
        self.set_state(HandlerState::DirectorySelected);

        let info = HandlerInfo {
            id: self.id,
            section: self.section().name.clone(),
            directory: directory.clone(),
            started_at: SystemTime::now(),
        };
        let slot = match self.registry().add_archive_handler(info) {
            Ok(slot) => slot,
            Err(ArchiveError::DuplicateArchive { .. }) => {
                info!(handler = %self.id, directory = %directory, "directory already being archived");
                return HandlerOutcome::Duplicate { directory };
            }
            Err(e) => return self.fail(Some(directory), e),
        };
        self.set_state(HandlerState::Registered);

        let outcome = self.archive_registered(&slot).await;
        // A release fault is logged by the registry and does not change the outcome.
        let _ = slot.release();
        outcome
    }

    async fn archive_registered(&self, slot: &ArchiveSlot) -> HandlerOutcome {
        let directory = slot.directory().clone();
        if self.policy.destinations().is_none() {
            match self.policy.find_destination_slaves() {
                Ok(Some(slaves)) => {
                    if let Err(e) = self.policy.set_destinations(slaves) {
                        return self.fail(Some(directory), e);
                    }
                }
                Ok(None) => {
                    info!(handler = %self.id, directory = %directory, "no destination slaves, retrying later");
                    self.policy.set_directory(None);
                    return HandlerOutcome::NoDestination { directory };
                }
                Err(e) => return self.fail(Some(directory), e),
            }
        }
        self.set_state(HandlerState::DestinationsResolved);

        let jobs = match self.policy.send() {
            Ok(jobs) => jobs,
            Err(e) => return self.fail(Some(directory), e),
        };
        *self.jobs.lock() = jobs.clone();
        for job in &jobs {
            if let Err(e) = self.executor.submit(job.clone()) {
                warn!(job = job.id(), error = %e, "job submission failed");
                job.mark_failed(JobFailure::Executor(e.to_string()));
            }
        }
        info!(handler = %self.id, directory = %directory, jobs = jobs.len(), "archive jobs submitted");
        self.set_state(HandlerState::JobsSubmitted);

        self.set_state(HandlerState::Waiting);
        self.policy.wait_for_send_of_files(&jobs).await;

        self.set_state(HandlerState::Cleanup);
        match self.policy.cleanup(&jobs) {
            Ok(report) => HandlerOutcome::Completed(report),
            Err(e) => self.fail(Some(directory), e),
        }
    }
}
