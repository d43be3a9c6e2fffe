//! Narrow view of the virtual filesystem the archiver needs.
//!
//! The real namespace lives in the coordinator's VFS; [`MemoryNamespace`] is
//! an in-process implementation used by the dry-run CLI and tests.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// Normalized absolute directory path, e.g. `/rls/TITLE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DirRef(String);

impl DirRef {
    /// Normalizes `path`: leading slash, no trailing or repeated slashes.
    pub fn new(path: &str) -> Self {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        DirRef(format!("/{}", parts.join("/")))
    }

    /// The namespace root.
    pub fn root() -> Self {
        DirRef("/".to_string())
    }

    /// Path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component; empty for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Parent directory; `None` for the root.
    pub fn parent(&self) -> Option<DirRef> {
        if self.0 == "/" {
            return None;
        }
        let idx = self.0.rfind('/').unwrap_or(0);
        Some(DirRef::new(&self.0[..idx]))
    }

    /// Child directory named `name`.
    pub fn join(&self, name: &str) -> DirRef {
        DirRef::new(&format!("{}/{}", self.0, name))
    }

    /// True if `path` is this directory or lies beneath it.
    pub fn contains_path(&self, path: &str) -> bool {
        let path = DirRef::new(path);
        if self.0 == "/" || path.0 == self.0 {
            return true;
        }
        path.0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl From<String> for DirRef {
    fn from(s: String) -> Self {
        DirRef::new(&s)
    }
}

impl From<DirRef> for String {
    fn from(d: DirRef) -> Self {
        d.0
    }
}

impl fmt::Display for DirRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file and the nodes currently holding a copy of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute file path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Node names holding the file, in placement order.
    pub slaves: Vec<String>,
}

impl FileEntry {
    /// Directory containing the file.
    pub fn directory(&self) -> DirRef {
        DirRef::new(&self.path).parent().unwrap_or_else(DirRef::root)
    }

    /// File name without its directory.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// True if `node` holds a copy.
    pub fn is_on(&self, node: &str) -> bool {
        self.slaves.iter().any(|s| s == node)
    }
}

/// Namespace queries and updates consumed by the archiver.
pub trait Namespace: Send + Sync {
    /// Immediate subdirectories of `dir`, in stable order.
    fn subdirectories(&self, dir: &DirRef) -> Result<Vec<DirRef>>;

    /// Files of `dir` in listing order; with `recursive`, followed by the
    /// files of each subdirectory, depth first.
    fn files(&self, dir: &DirRef, recursive: bool) -> Result<Vec<FileEntry>>;

    /// Creation time of `dir`.
    fn created_at(&self, dir: &DirRef) -> Result<SystemTime>;

    /// Records that `node` now holds `file`.
    fn add_replica(&self, file: &str, node: &str) -> Result<()>;

    /// Moves a directory tree.
    fn rename(&self, from: &DirRef, to: &DirRef) -> Result<()>;
}

#[derive(Debug, Clone)]
struct DirMeta {
    created_at: SystemTime,
    files: Vec<FileEntry>,
}

/// In-memory namespace keyed by directory path.
#[derive(Debug, Default)]
pub struct MemoryNamespace {
    dirs: RwLock<BTreeMap<DirRef, DirMeta>>,
}

fn not_found(what: &str) -> ArchiveError {
    ArchiveError::Namespace {
        msg: format!("{} not found", what),
    }
}

impl MemoryNamespace {
    /// Creates an empty namespace containing only the root.
    pub fn new() -> Self {
        let ns = Self::default();
        ns.mkdirs(&DirRef::root(), SystemTime::UNIX_EPOCH);
        ns
    }

    /// Creates `dir` and missing ancestors. Existing directories keep their
    /// creation time.
    pub fn mkdirs(&self, dir: &DirRef, created_at: SystemTime) {
        let mut dirs = self.dirs.write();
        let mut cur = Some(dir.clone());
        while let Some(d) = cur {
            cur = d.parent();
            dirs.entry(d).or_insert_with(|| DirMeta {
                created_at,
                files: Vec::new(),
            });
        }
    }

    /// Adds a file, creating its directory if needed.
    pub fn add_file(&self, path: &str, size: u64, slaves: &[&str]) {
        let entry = FileEntry {
            path: DirRef::new(path).to_string(),
            size,
            slaves: slaves.iter().map(|s| s.to_string()).collect(),
        };
        let dir = entry.directory();
        self.mkdirs(&dir, SystemTime::now());
        if let Some(meta) = self.dirs.write().get_mut(&dir) {
            meta.files.retain(|f| f.path != entry.path);
            meta.files.push(entry);
        }
    }

    /// Drops `node` from every placement, as when a node loses its disk.
    pub fn remove_slave(&self, node: &str) {
        for meta in self.dirs.write().values_mut() {
            for file in &mut meta.files {
                file.slaves.retain(|s| s != node);
            }
        }
    }

    /// True if `dir` exists.
    pub fn exists(&self, dir: &DirRef) -> bool {
        self.dirs.read().contains_key(dir)
    }

    fn collect_files(dirs: &BTreeMap<DirRef, DirMeta>, dir: &DirRef, recursive: bool, out: &mut Vec<FileEntry>) {
        let Some(meta) = dirs.get(dir) else {
            return;
        };
        out.extend(meta.files.iter().cloned());
        if recursive {
            for child in dirs.keys().filter(|k| k.parent().as_ref() == Some(dir)) {
                Self::collect_files(dirs, child, true, out);
            }
        }
    }
}

impl Namespace for MemoryNamespace {
    fn subdirectories(&self, dir: &DirRef) -> Result<Vec<DirRef>> {
        let dirs = self.dirs.read();
        if !dirs.contains_key(dir) {
            return Err(not_found(dir.as_str()));
        }
        Ok(dirs
            .keys()
            .filter(|k| k.parent().as_ref() == Some(dir))
            .cloned()
            .collect())
    }

    fn files(&self, dir: &DirRef, recursive: bool) -> Result<Vec<FileEntry>> {
        let dirs = self.dirs.read();
        if !dirs.contains_key(dir) {
            return Err(not_found(dir.as_str()));
        }
        let mut out = Vec::new();
        Self::collect_files(&dirs, dir, recursive, &mut out);
        Ok(out)
    }

    fn created_at(&self, dir: &DirRef) -> Result<SystemTime> {
        self.dirs
            .read()
            .get(dir)
            .map(|m| m.created_at)
            .ok_or_else(|| not_found(dir.as_str()))
    }

    fn add_replica(&self, file: &str, node: &str) -> Result<()> {
        let path = DirRef::new(file);
        let dir = path.parent().unwrap_or_else(DirRef::root);
        let mut dirs = self.dirs.write();
        let entry = dirs
            .get_mut(&dir)
            .and_then(|m| m.files.iter_mut().find(|f| f.path == path.as_str()))
            .ok_or_else(|| not_found(file))?;
        if !entry.is_on(node) {
            entry.slaves.push(node.to_string());
        }
        Ok(())
    }

    fn rename(&self, from: &DirRef, to: &DirRef) -> Result<()> {
        let mut dirs = self.dirs.write();
        if !dirs.contains_key(from) {
            return Err(not_found(from.as_str()));
        }
        if dirs.contains_key(to) {
            return Err(ArchiveError::Namespace {
                msg: format!("{} already exists", to),
            });
        }
        let moved: Vec<DirRef> = dirs
            .keys()
            .filter(|k| from.contains_path(k.as_str()))
            .cloned()
            .collect();
        for old in moved {
            if let Some(mut meta) = dirs.remove(&old) {
                let suffix = &old.as_str()[from.as_str().len()..];
                let new = DirRef::new(&format!("{}{}", to, suffix));
                for file in &mut meta.files {
                    file.path = format!("{}/{}", new, file.name());
                }
                dirs.insert(new, meta);
            }
        }
        drop(dirs);
        if let Some(parent) = to.parent() {
            self.mkdirs(&parent, SystemTime::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_ref_normalization() {
        let d = DirRef::new("rls//TITLE/");
        assert_eq!(d.as_str(), "/rls/TITLE");
        assert_eq!(d.name(), "TITLE");
        assert_eq!(d.parent(), Some(DirRef::new("/rls")));
        assert_eq!(DirRef::new("/rls").parent(), Some(DirRef::root()));
        assert_eq!(DirRef::root().parent(), None);
        assert!(d.contains_path("/rls/TITLE/CD1/a.rar"));
        assert!(d.contains_path("/rls/TITLE"));
        assert!(!d.contains_path("/rls/TITLE2"));
    }

    #[test]
    fn test_recursive_listing_order() {
        let ns = MemoryNamespace::new();
        ns.add_file("/rls/T/b.rar", 1, &["n1"]);
        ns.add_file("/rls/T/a.rar", 1, &["n2"]);
        ns.add_file("/rls/T/CD1/c.rar", 1, &["n1"]);

        let top = ns.files(&DirRef::new("/rls/T"), false).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].name(), "b.rar");

        let all = ns.files(&DirRef::new("/rls/T"), true).unwrap();
        let names: Vec<_> = all.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["b.rar", "a.rar", "c.rar"]);
        assert_eq!(
            ns.subdirectories(&DirRef::new("/rls")).unwrap(),
            vec![DirRef::new("/rls/T")]
        );
    }

    #[test]
    fn test_add_replica_and_rename() {
        let ns = MemoryNamespace::new();
        ns.add_file("/incoming/T/a.rar", 1, &["n1"]);
        ns.add_replica("/incoming/T/a.rar", "n2").unwrap();
        ns.add_replica("/incoming/T/a.rar", "n2").unwrap();
        assert!(ns.add_replica("/incoming/T/zz.rar", "n2").is_err());

        ns.rename(&DirRef::new("/incoming/T"), &DirRef::new("/archive/T")).unwrap();
        assert!(!ns.exists(&DirRef::new("/incoming/T")));
        let files = ns.files(&DirRef::new("/archive/T"), true).unwrap();
        assert_eq!(files[0].path, "/archive/T/a.rar");
        assert_eq!(files[0].slaves, vec!["n1", "n2"]);
    }
}
