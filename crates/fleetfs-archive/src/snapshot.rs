//! JSON snapshot of a namespace and fleet, loaded into the in-memory
//! implementations for dry runs.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::namespace::{DirRef, MemoryNamespace};
use crate::node::{MemoryFleet, SlaveHandle};

fn default_online() -> bool {
    true
}

/// A node in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveSnapshot {
    /// Node name.
    pub name: String,
    /// Free bytes.
    #[serde(default)]
    pub free_space: u64,
    /// Reachable or not.
    #[serde(default = "default_online")]
    pub online: bool,
    /// Control address.
    #[serde(default)]
    pub addr: Option<SocketAddr>,
}

/// A directory and its age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// Directory path.
    pub path: DirRef,
    /// Seconds since creation.
    #[serde(default)]
    pub age_secs: u64,
}

/// A file and its placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// File path.
    pub path: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Nodes holding the file.
    #[serde(default)]
    pub slaves: Vec<String>,
}

/// Snapshot file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Fleet, in fleet order.
    pub slaves: Vec<SlaveSnapshot>,
    /// Directories with explicit ages; others are created as they are
    /// referenced by files.
    pub directories: Vec<DirectorySnapshot>,
    /// Files in listing order.
    pub files: Vec<FileSnapshot>,
}

impl Snapshot {
    /// Reads a snapshot from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        Ok(snapshot)
    }

    /// Builds the in-memory namespace and fleet. Directory ages are taken
    /// relative to now.
    pub fn build(&self) -> (Arc<MemoryNamespace>, Arc<MemoryFleet>) {
        let now = SystemTime::now();
        let ns = MemoryNamespace::new();
        for dir in &self.directories {
            let created = now
                .checked_sub(Duration::from_secs(dir.age_secs))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            ns.mkdirs(&dir.path, created);
        }
        for file in &self.files {
            let slaves: Vec<&str> = file.slaves.iter().map(String::as_str).collect();
            ns.add_file(&file.path, file.size, &slaves);
        }

        let fleet = MemoryFleet::new();
        for slave in &self.slaves {
            let mut handle = SlaveHandle::new(slave.name.clone(), slave.free_space);
            if let Some(addr) = slave.addr {
                handle = handle.with_addr(addr);
            }
            handle.set_available(slave.online);
            fleet.add(handle);
        }
        (Arc::new(ns), Arc::new(fleet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::node::Fleet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_and_build() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "slaves": [
                    {{"name": "n1", "free_space": 100}},
                    {{"name": "n2", "free_space": 500, "online": false, "addr": "10.0.0.2:7000"}}
                ],
                "directories": [{{"path": "/rls/TITLE", "age_secs": 7200}}],
                "files": [
                    {{"path": "/rls/TITLE/a.rar", "size": 10, "slaves": ["n1"]}},
                    {{"path": "/rls/TITLE/CD1/b.rar", "size": 20, "slaves": ["n1", "n2"]}}
                ]
            }}"#
        )
        .unwrap();

        let snapshot = Snapshot::load(file.path()).unwrap();
        let (ns, fleet) = snapshot.build();

        let dir = DirRef::new("/rls/TITLE");
        let age = SystemTime::now()
            .duration_since(ns.created_at(&dir).unwrap())
            .unwrap();
        assert!(age >= Duration::from_secs(7200));
        assert_eq!(ns.files(&dir, true).unwrap().len(), 2);
        assert_eq!(ns.files(&dir, false).unwrap().len(), 1);

        assert_eq!(fleet.available_slaves().len(), 1);
        let n2 = fleet.slave("n2").unwrap();
        assert!(!n2.is_available());
        assert_eq!(n2.addr(), Some("10.0.0.2:7000".parse().unwrap()));
    }

    #[test]
    fn test_load_reports_bad_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{{not json").unwrap();
        let err = Snapshot::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing snapshot"));
    }
}
