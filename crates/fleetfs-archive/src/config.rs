use std::collections::HashSet;
use std::path::Path;

use fleetfs_transport::{ConnectionConfig, PortRange};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;
use crate::namespace::DirRef;

/// Placement heuristic used for a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// Destinations with the most free space.
    MostFree,
    /// Anchor on the node already holding most of the directory.
    Affinity,
}

fn default_num_of_slaves() -> usize {
    1
}

fn default_priority() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Archive parameters of one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionConfig {
    /// Section name.
    pub name: String,
    /// Section root; its immediate subdirectories are archive candidates.
    pub path: DirRef,
    /// Placement heuristic.
    #[serde(rename = "type")]
    pub archive_type: ArchiveKind,
    /// Target number of nodes holding a complete copy.
    #[serde(default = "default_num_of_slaves")]
    pub num_of_slaves: usize,
    /// Minimum directory age before it is archived.
    #[serde(default)]
    pub archive_after_secs: u64,
    /// Priority given to emitted jobs.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Include files of subdirectories.
    #[serde(default = "default_true")]
    pub scan_subdirs: bool,
    /// Eligible destination nodes; empty means every node.
    #[serde(default)]
    pub slaves: Vec<String>,
    /// Directory names never archived.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Where fully archived directories are moved on cleanup.
    #[serde(default)]
    pub move_to: Option<DirRef>,
}

impl SectionConfig {
    /// A section with default parameters.
    pub fn new(name: &str, path: &str, archive_type: ArchiveKind) -> Self {
        Self {
            name: name.to_string(),
            path: DirRef::new(path),
            archive_type,
            num_of_slaves: default_num_of_slaves(),
            archive_after_secs: 0,
            priority: default_priority(),
            scan_subdirs: true,
            slaves: Vec::new(),
            ignore: Vec::new(),
            move_to: None,
        }
    }

    /// True if `node` may receive copies for this section.
    pub fn is_eligible(&self, node: &str) -> bool {
        self.slaves.is_empty() || self.slaves.iter().any(|s| s == node)
    }
}

/// Data-connection settings for transfers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Socket tuning and timeouts.
    pub connection: ConnectionConfig,
    /// Ports passive listeners may bind.
    pub passive_ports: PortRange,
}

/// Archive service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Seconds between archive cycles of `fleetfs-archive run`.
    pub cycle_time_secs: u64,
    /// Jobs the executor runs at once.
    pub max_concurrent_jobs: usize,
    /// Data-connection settings.
    pub transfer: TransferConfig,
    /// Archived sections.
    pub sections: Vec<SectionConfig>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            cycle_time_secs: 600,
            max_concurrent_jobs: 4,
            transfer: TransferConfig::default(),
            sections: Vec::new(),
        }
    }
}

impl ArchiveConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ArchiveConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the archiver cannot run with.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        let invalid = |msg: String| Err(ArchiveError::Config { msg });
        if self.cycle_time_secs == 0 {
            return invalid("cycle_time_secs must be positive".to_string());
        }
        if self.max_concurrent_jobs == 0 {
            return invalid("max_concurrent_jobs must be at least 1".to_string());
        }
        if self.transfer.connection.timeout_ms == 0 {
            return invalid("transfer timeout must be positive".to_string());
        }
        let mut names = HashSet::new();
        for section in &self.sections {
            if !names.insert(section.name.as_str()) {
                return invalid(format!("section {} configured twice", section.name));
            }
            if section.num_of_slaves == 0 {
                return invalid(format!("section {}: num_of_slaves must be at least 1", section.name));
            }
            if let Some(dest) = &section.move_to {
                if section.path.contains_path(dest.as_str()) {
                    return invalid(format!(
                        "section {}: move_to {} lies inside the section",
                        section.name, dest
                    ));
                }
            }
        }
        Ok(())
    }

    /// Section by name.
    pub fn section(&self, name: &str) -> Option<&SectionConfig> {
        self.sections.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
cycle_time_secs = 300

[transfer.connection]
timeout_ms = 5000
send_buffer_size = 65536

[transfer.passive_ports]
start = 50000
end = 50100

[[sections]]
name = "mp3"
path = "/mp3"
type = "affinity"
num_of_slaves = 2
archive_after_secs = 86400
ignore = ["_PRE"]

[[sections]]
name = "tv"
path = "/tv/"
type = "most_free"
slaves = ["slave1", "slave2"]
move_to = "/archive/tv"
            "#
        )
        .unwrap();

        let config = ArchiveConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cycle_time_secs, 300);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.transfer.connection.timeout_ms, 5000);
        assert_eq!(config.transfer.connection.send_buffer_size, Some(65536));
        assert!(config.transfer.connection.keepalive);
        assert_eq!(config.transfer.passive_ports, PortRange::new(50000, 50100).unwrap());

        let mp3 = config.section("mp3").unwrap();
        assert_eq!(mp3.archive_type, ArchiveKind::Affinity);
        assert_eq!(mp3.num_of_slaves, 2);
        assert_eq!(mp3.priority, 3);
        assert!(mp3.scan_subdirs);
        assert!(mp3.is_eligible("anything"));

        let tv = config.section("tv").unwrap();
        assert_eq!(tv.path.as_str(), "/tv");
        assert_eq!(tv.num_of_slaves, 1);
        assert!(tv.is_eligible("slave2"));
        assert!(!tv.is_eligible("slave3"));
        assert_eq!(tv.move_to, Some(DirRef::new("/archive/tv")));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"sections": [{{"name": "rls", "path": "/rls", "type": "most_free"}}]}}"#
        )
        .unwrap();
        let config = ArchiveConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sections.len(), 1);
        assert_eq!(config.cycle_time_secs, 600);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ArchiveConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config = ArchiveConfig::default();
        config.sections.push(SectionConfig::new("a", "/a", ArchiveKind::MostFree));
        assert!(config.validate().is_ok());

        config.sections.push(SectionConfig::new("a", "/b", ArchiveKind::MostFree));
        assert!(config.validate().is_err());
        config.sections.pop();

        config.sections[0].num_of_slaves = 0;
        assert!(config.validate().is_err());
        config.sections[0].num_of_slaves = 1;

        config.sections[0].move_to = Some(DirRef::new("/a/old"));
        assert!(config.validate().is_err());
        config.sections[0].move_to = None;

        config.max_concurrent_jobs = 0;
        assert!(matches!(config.validate(), Err(ArchiveError::Config { .. })));
    }

    #[test]
    fn test_inverted_port_range_rejected_on_load() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[transfer.passive_ports]\nstart = 9\nend = 1").unwrap();
        let err = ArchiveConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("no free port in range 9-1"), "{}", err);
    }
}
