//! Partition-wide snapshot sequence and version history.
//!
//! Sequence 0 is the live working version and is always present; every other
//! entry is an immutable snapshot. The partition's `ver_seq` equals the
//! highest committed sequence.

use serde::{Deserialize, Serialize};

use crate::types::OpStatus;

/// Lifecycle state of one version entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerStatus {
    /// Announced by the coordinator, not yet readable.
    Preparing,
    /// Committed; readable at its sequence.
    Committed,
    /// Marked for deletion; per-entity layers are spliced out lazily.
    Deleted,
}

/// One entry of the version history.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerInfo {
    /// Snapshot sequence.
    pub seq: u64,
    /// Lifecycle state.
    pub status: VerStatus,
    /// Creation time, seconds.
    pub created_at: i64,
}

/// Ordered version history of a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionList {
    items: Vec<VerInfo>,
}

impl VersionList {
    /// Creates a history holding only the live working version.
    pub fn new() -> Self {
        Self {
            items: vec![VerInfo {
                seq: 0,
                status: VerStatus::Committed,
                created_at: 0,
            }],
        }
    }

    /// Entries in ascending sequence order.
    pub fn items(&self) -> &[VerInfo] {
        &self.items
    }

    /// Highest committed sequence.
    pub fn committed_seq(&self) -> u64 {
        self.items
            .iter()
            .filter(|v| v.status == VerStatus::Committed)
            .map(|v| v.seq)
            .max()
            .unwrap_or(0)
    }

    /// Highest sequence in the history regardless of state.
    pub fn max_seq(&self) -> u64 {
        self.items.last().map(|v| v.seq).unwrap_or(0)
    }

    /// Announces a new snapshot sequence. The sequence must grow
    /// monotonically; a replayed prepare of the current tail is idempotent.
    pub fn prepare(&mut self, seq: u64, created_at: i64) -> OpStatus {
        match self.max_seq().cmp(&seq) {
            std::cmp::Ordering::Less => {
                self.items.push(VerInfo {
                    seq,
                    status: VerStatus::Preparing,
                    created_at,
                });
                OpStatus::Ok
            }
            std::cmp::Ordering::Equal => OpStatus::Ok,
            std::cmp::Ordering::Greater => OpStatus::Exists,
        }
    }

    /// Commits a prepared sequence, making it readable.
    pub fn commit(&mut self, seq: u64) -> OpStatus {
        match self.items.iter_mut().find(|v| v.seq == seq) {
            None => OpStatus::NotExist,
            Some(v) => {
                v.status = VerStatus::Committed;
                OpStatus::Ok
            }
        }
    }

    /// Removes a snapshot from the history. The live working version cannot
    /// be deleted.
    pub fn delete(&mut self, seq: u64) -> OpStatus {
        if seq == 0 {
            return OpStatus::NotPerm;
        }
        let before = self.items.len();
        self.items.retain(|v| v.seq != seq);
        if self.items.len() == before {
            OpStatus::NotExist
        } else {
            OpStatus::Ok
        }
    }

    /// Returns true when the sequence is a committed snapshot or the live
    /// version.
    pub fn is_readable(&self, seq: u64) -> bool {
        if seq == 0 {
            return true;
        }
        self.items
            .iter()
            .any(|v| v.seq == seq && v.status == VerStatus::Committed)
    }
}

impl Default for VersionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_holds_live_version() {
        let vl = VersionList::new();
        assert_eq!(vl.items().len(), 1);
        assert_eq!(vl.committed_seq(), 0);
        assert!(vl.is_readable(0));
    }

    #[test]
    fn test_prepare_commit_flow() {
        let mut vl = VersionList::new();
        assert!(vl.prepare(5, 100).is_ok());
        assert_eq!(vl.committed_seq(), 0);
        assert!(!vl.is_readable(5));

        assert!(vl.commit(5).is_ok());
        assert_eq!(vl.committed_seq(), 5);
        assert!(vl.is_readable(5));
    }

    #[test]
    fn test_prepare_monotonic() {
        let mut vl = VersionList::new();
        vl.prepare(5, 100);
        assert_eq!(vl.prepare(3, 100), OpStatus::Exists);
        // replay of the tail is idempotent
        assert!(vl.prepare(5, 100).is_ok());
        assert_eq!(vl.items().len(), 2);
    }

    #[test]
    fn test_commit_unknown_seq() {
        let mut vl = VersionList::new();
        assert_eq!(vl.commit(9), OpStatus::NotExist);
    }

    #[test]
    fn test_delete_live_version_refused() {
        let mut vl = VersionList::new();
        assert_eq!(vl.delete(0), OpStatus::NotPerm);
        assert_eq!(vl.items().len(), 1);
    }

    #[test]
    fn test_delete_snapshot() {
        let mut vl = VersionList::new();
        vl.prepare(5, 100);
        vl.commit(5);
        assert!(vl.delete(5).is_ok());
        assert!(!vl.is_readable(5));
        assert_eq!(vl.delete(5), OpStatus::NotExist);
    }
}
