//! Fixtures shared by the archive integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fleetfs_archive::{
    archive_type_for, ArchiveError, ArchiveKind, ArchiveRegistry, ArchiveType, DirRef, Fleet, Job,
    JobExecutor, JobRunner, MemoryFleet, MemoryNamespace, Namespace, PolicyContext, Result,
    SectionConfig, SlaveHandle,
};
use fleetfs_transport::{
    ActiveConnection, ConnectionConfig, DataConnection, FileTransfer, NodeService, PassiveConnection,
    PortRange, SlaveTransfer, TransferMode, TransferStatus,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// An in-process fleet where every node has its own storage root on disk.
pub struct TestCluster {
    pub ns: Arc<MemoryNamespace>,
    pub fleet: Arc<MemoryFleet>,
    pub registry: Arc<ArchiveRegistry>,
    roots: HashMap<String, TempDir>,
}

impl TestCluster {
    pub fn new(slaves: &[(&str, u64)]) -> Self {
        let fleet = MemoryFleet::new();
        let mut roots = HashMap::new();
        for (name, free) in slaves {
            fleet.add(SlaveHandle::new(*name, *free));
            roots.insert(name.to_string(), tempfile::tempdir().unwrap());
        }
        Self {
            ns: Arc::new(MemoryNamespace::new()),
            fleet: Arc::new(fleet),
            registry: Arc::new(ArchiveRegistry::new()),
            roots,
        }
    }

    /// Starts a node service per node and gives each handle its control
    /// address. Handles obtained before this call are replaced.
    pub async fn start_services(&self) -> CancellationToken {
        let shutdown = CancellationToken::new();
        for slave in self.fleet.slaves() {
            let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            let addr = listener.local_addr().unwrap();
            let service = Arc::new(NodeService::new(
                self.root(slave.name()),
                LOCALHOST,
                PortRange::any(),
                ConnectionConfig::default(),
            ));
            tokio::spawn(service.run(listener, shutdown.clone()));

            let handle = SlaveHandle::new(slave.name(), slave.free_space()).with_addr(addr);
            handle.set_available(slave.is_available());
            self.fleet.add(handle);
        }
        shutdown
    }

    pub fn ctx(&self) -> PolicyContext {
        PolicyContext {
            namespace: self.ns.clone(),
            fleet: self.fleet.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn slave(&self, name: &str) -> Arc<SlaveHandle> {
        self.fleet.slave(name).unwrap()
    }

    pub fn root(&self, node: &str) -> &Path {
        self.roots[node].path()
    }

    pub fn roots(&self) -> HashMap<String, PathBuf> {
        self.roots
            .iter()
            .map(|(name, dir)| (name.clone(), dir.path().to_path_buf()))
            .collect()
    }

    /// Stores `contents` at `path` on each of `slaves` and records the placement.
    pub fn put(&self, path: &str, contents: &[u8], slaves: &[&str]) {
        for node in slaves {
            let local = self.root(node).join(path.trim_start_matches('/'));
            std::fs::create_dir_all(local.parent().unwrap()).unwrap();
            std::fs::write(local, contents).unwrap();
        }
        self.ns.add_file(path, contents.len() as u64, slaves);
    }

    pub fn policy(&self, kind: ArchiveKind, num_of_slaves: usize) -> Arc<dyn ArchiveType> {
        let mut section = SectionConfig::new("rls", "/rls", kind);
        section.num_of_slaves = num_of_slaves;
        archive_type_for(section, self.ctx())
    }

    pub fn dir(&self, path: &str) -> DirRef {
        DirRef::new(path)
    }
}

/// Copies files between node roots over real data connections: a passive
/// receiver on the destination and an active sender on the first live source.
pub struct LocalCopyRunner {
    roots: HashMap<String, PathBuf>,
    fleet: Arc<MemoryFleet>,
}

impl LocalCopyRunner {
    pub fn new(cluster: &TestCluster) -> Self {
        Self {
            roots: cluster.roots(),
            fleet: cluster.fleet.clone(),
        }
    }
}

#[async_trait]
impl JobRunner for LocalCopyRunner {
    async fn run(&self, job: &Job) -> Result<TransferStatus> {
        let dest = job.destination().name().to_string();
        let dst_root = self
            .roots
            .get(&dest)
            .ok_or(ArchiveError::NodeUnavailable { node: dest.clone() })?;
        let source = job
            .sources()
            .iter()
            .find(|s| {
                self.roots.contains_key(*s)
                    && self.fleet.slave(s).is_some_and(|h| h.is_available())
            })
            .ok_or_else(|| ArchiveError::NodeUnavailable {
                node: job.sources().join(","),
            })?;

        let passive = PassiveConnection::bind(LOCALHOST, &PortRange::any(), None, ConnectionConfig::default())?;
        let port = passive.local_port();
        let receiver = FileTransfer::new(dst_root, DataConnection::Passive(passive));
        let sender = FileTransfer::new(
            &self.roots[source],
            DataConnection::Active(ActiveConnection::new(
                (Ipv4Addr::LOCALHOST, port).into(),
                None,
                ConnectionConfig::default(),
            )),
        );

        let file = job.file();
        let directory = file.directory();
        let (received, sent) = tokio::join!(
            receiver.receive_file(directory.as_str(), TransferMode::Binary, file.name(), 0),
            sender.send_file(&file.path, TransferMode::Binary, 0, true),
        );
        let received = received?;
        let sent = sent?;
        if received.checksum != sent.checksum {
            return Err(ArchiveError::InvalidState {
                msg: format!("checksum mismatch for {}", file.path),
            });
        }
        Ok(received)
    }
}

/// Holds submitted jobs until the test releases them.
#[derive(Default)]
pub struct GatedExecutor {
    held: Mutex<Vec<Arc<Job>>>,
}

impl GatedExecutor {
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Completes every held job and records the new placements.
    pub fn release_all(&self, ns: &MemoryNamespace) {
        for job in self.held.lock().drain(..) {
            ns.add_replica(&job.file().path, job.destination().name()).unwrap();
            job.mark_done(TransferStatus {
                elapsed_ms: 1,
                transferred: job.file().size,
                checksum: 0,
                finished: true,
            });
        }
    }
}

impl JobExecutor for GatedExecutor {
    fn submit(&self, job: Arc<Job>) -> Result<()> {
        job.mark_transferring();
        self.held.lock().push(job);
        Ok(())
    }
}
