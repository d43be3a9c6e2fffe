use std::sync::Arc;

use tracing::debug;

use super::{ArchiveType, ArchiveTypeBase, PolicyContext};
use crate::config::{ArchiveKind, SectionConfig};
use crate::error::Result;
use crate::namespace::FileEntry;
use crate::node::SlaveHandle;

/// Anchors the directory on the node that already holds most of its files,
/// so the fewest bytes move.
#[derive(Debug)]
pub struct AffinityArchive {
    base: ArchiveTypeBase,
}

impl AffinityArchive {
    /// Creates the policy for `section`.
    pub fn new(section: SectionConfig, ctx: PolicyContext) -> Self {
        Self {
            base: ArchiveTypeBase::new(section, ctx),
        }
    }

    /// Eligible, reachable node holding the most of `files`. Ties go to the
    /// node encountered first; `None` if no such node holds any file.
    pub fn anchor(&self, files: &[FileEntry]) -> Option<Arc<SlaveHandle>> {
        let mut best: Option<(Arc<SlaveHandle>, usize)> = None;
        for (slave, count) in self.base.placement_counts(files) {
            if best.as_ref().map_or(true, |(_, max)| count > *max) {
                best = Some((slave, count));
            }
        }
        best.map(|(slave, _)| slave)
    }
}

impl ArchiveType for AffinityArchive {
    fn base(&self) -> &ArchiveTypeBase {
        &self.base
    }

    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Affinity
    }

    /// The anchor plus the most-free eligible nodes, `num_of_slaves` in all.
    /// The anchor usually holds the directory already, so it stays in the set
    /// but receives no jobs: `send` only targets nodes lacking a file.
    fn find_destination_slaves(&self) -> Result<Option<Vec<Arc<SlaveHandle>>>> {
        let dir = self.base.require_directory()?;
        let wanted = self.base.section().num_of_slaves;
        if self.base.eligible_slaves().len() < wanted {
            return Ok(None);
        }
        let files = self.base.files(&dir)?;
        let Some(anchor) = self.anchor(&files) else {
            debug!(directory = %dir, "no eligible slave holds any file");
            return Ok(None);
        };

        let mut destinations = vec![anchor];
        let missing = wanted.saturating_sub(1);
        let extra = self.base.most_free(&destinations, missing);
        if extra.len() < missing {
            return Ok(None);
        }
        destinations.extend(extra);
        Ok(Some(destinations))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Fixture;
    use super::*;
    use crate::namespace::DirRef;
    use crate::node::Fleet;
    use proptest::prelude::*;

    fn policy(fx: &Fixture, num_of_slaves: usize) -> AffinityArchive {
        let mut section = SectionConfig::new("mp3", "/mp3", ArchiveKind::Affinity);
        section.num_of_slaves = num_of_slaves;
        let p = AffinityArchive::new(section, fx.ctx());
        p.set_directory(Some(DirRef::new("/mp3/T")));
        p
    }

    /// Places `count` files per node, node by node.
    fn spread(fx: &Fixture, layout: &[(&str, usize)]) {
        let mut i = 0;
        for (node, count) in layout {
            for _ in 0..*count {
                fx.file(&format!("/mp3/T/f{:03}", i), &[*node]);
                i += 1;
            }
        }
    }

    #[test]
    fn test_anchor_tie_goes_to_first_encountered() {
        let fx = Fixture::new(&[("a", 1), ("b", 1), ("c", 1)]);
        spread(&fx, &[("a", 3), ("b", 3), ("c", 1)]);
        let dests = policy(&fx, 1).find_destination_slaves().unwrap().unwrap();
        assert_eq!(dests[0].name(), "a");
    }

    #[test]
    fn test_anchor_is_max_holder() {
        let fx = Fixture::new(&[("a", 1), ("b", 1), ("c", 1)]);
        spread(&fx, &[("a", 2), ("b", 5), ("c", 1)]);
        let dests = policy(&fx, 1).find_destination_slaves().unwrap().unwrap();
        assert_eq!(dests.len(), 1);
        assert_eq!(dests[0].name(), "b");
    }

    #[test]
    fn test_unavailable_holder_is_not_anchor() {
        let fx = Fixture::new(&[("a", 1), ("b", 1)]);
        spread(&fx, &[("a", 5), ("b", 1)]);
        fx.fleet.slave("a").unwrap().set_available(false);
        let dests = policy(&fx, 1).find_destination_slaves().unwrap().unwrap();
        assert_eq!(dests[0].name(), "b");
    }

    #[test]
    fn test_no_held_files_means_no_destination() {
        let fx = Fixture::new(&[("a", 1), ("b", 1)]);
        fx.file("/mp3/T/orphan", &[]);
        assert!(policy(&fx, 1).find_destination_slaves().unwrap().is_none());
    }

    #[test]
    fn test_fills_with_most_free() {
        let fx = Fixture::new(&[("a", 10), ("b", 50), ("c", 90)]);
        spread(&fx, &[("a", 3)]);
        let dests = policy(&fx, 2).find_destination_slaves().unwrap().unwrap();
        let names: Vec<_> = dests.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_complete_anchor_gets_no_jobs() {
        let fx = Fixture::new(&[("a", 10), ("b", 50), ("c", 90)]);
        spread(&fx, &[("a", 3)]);
        let p = policy(&fx, 2);
        assert_eq!(p.kind(), ArchiveKind::Affinity);

        let dests = p.find_destination_slaves().unwrap().unwrap();
        p.set_destinations(dests).unwrap();
        let jobs = p.send().unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.destination().name() == "c"));
        assert!(jobs.iter().all(|j| j.sources().to_vec() == vec!["a"]));
    }

    #[test]
    fn test_too_few_available() {
        let fx = Fixture::new(&[("a", 10), ("b", 50)]);
        spread(&fx, &[("a", 3)]);
        fx.fleet.slave("b").unwrap().set_available(false);
        assert!(policy(&fx, 2).find_destination_slaves().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_anchor_holds_max(counts in proptest::collection::vec(0usize..6, 1..5)) {
            let names = ["a", "b", "c", "d", "e"];
            let slaves: Vec<(&str, u64)> = names.iter().take(counts.len()).map(|n| (*n, 1)).collect();
            let fx = Fixture::new(&slaves);
            fx.dir("/mp3/T", 0);
            let layout: Vec<(&str, usize)> = names.iter().copied().zip(counts.iter().copied()).collect();
            spread(&fx, &layout);

            let p = policy(&fx, 1);
            let max = counts.iter().copied().max().unwrap_or(0);
            match p.find_destination_slaves().unwrap() {
                None => {
                    prop_assert_eq!(max, 0);
                }
                Some(dests) => {
                    let idx = names.iter().position(|n| *n == dests[0].name()).unwrap();
                    prop_assert_eq!(counts[idx], max);
                    prop_assert!(counts[..idx].iter().all(|c| *c < max));
                }
            }
        }
    }
}
