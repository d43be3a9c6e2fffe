//! Storage node handles and the fleet view.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A storage node as seen by the coordinator.
///
/// Liveness and free space are updated by external monitoring at any time;
/// readers must tolerate them changing between two calls.
#[derive(Debug)]
pub struct SlaveHandle {
    name: String,
    addr: Option<SocketAddr>,
    online: AtomicBool,
    free_space: AtomicU64,
}

impl SlaveHandle {
    /// Creates an online node handle.
    pub fn new(name: impl Into<String>, free_space: u64) -> Self {
        Self {
            name: name.into(),
            addr: None,
            online: AtomicBool::new(true),
            free_space: AtomicU64::new(free_space),
        }
    }

    /// Sets the node's control address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Node name, unique within the fleet.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Control address, when known.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// True if the node is currently reachable.
    pub fn is_available(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Marks the node reachable or not.
    pub fn set_available(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Free bytes reported by the node.
    pub fn free_space(&self) -> u64 {
        self.free_space.load(Ordering::Relaxed)
    }

    /// Updates the reported free bytes.
    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::Relaxed);
    }
}

/// Fleet membership queries.
pub trait Fleet: Send + Sync {
    /// Every known node in stable fleet order.
    fn slaves(&self) -> Vec<Arc<SlaveHandle>>;

    /// Node by name.
    fn slave(&self, name: &str) -> Option<Arc<SlaveHandle>> {
        self.slaves().into_iter().find(|s| s.name() == name)
    }

    /// Nodes currently reachable, in fleet order.
    fn available_slaves(&self) -> Vec<Arc<SlaveHandle>> {
        self.slaves()
            .into_iter()
            .filter(|s| s.is_available())
            .collect()
    }
}

/// In-memory fleet.
#[derive(Debug, Default)]
pub struct MemoryFleet {
    slaves: RwLock<Vec<Arc<SlaveHandle>>>,
}

impl MemoryFleet {
    /// Creates an empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a node, returning the shared handle.
    pub fn add(&self, slave: SlaveHandle) -> Arc<SlaveHandle> {
        let slave = Arc::new(slave);
        let mut slaves = self.slaves.write();
        match slaves.iter_mut().find(|s| s.name() == slave.name()) {
            Some(existing) => *existing = slave.clone(),
            None => slaves.push(slave.clone()),
        }
        slave
    }
}

impl Fleet for MemoryFleet {
    fn slaves(&self) -> Vec<Arc<SlaveHandle>> {
        self.slaves.read().clone()
    }
}
