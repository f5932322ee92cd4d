//! Directory entry entity: a `(parent inode, name) → child inode` binding
//! with its own version chain.
//!
//! Deletion under snapshots never removes the node outright; the live layer
//! gets a delete marker and the pre-image migrates into the chain so readers
//! at prior sequences still resolve the entry.

use serde::{Deserialize, Serialize};

use crate::types::{FileType, InodeId};

/// Index key of a dentry: parent inode first, then name, so one directory's
/// entries form a contiguous, name-ordered key range.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DentryKey {
    /// Parent directory inode.
    pub parent_id: InodeId,
    /// Entry name, UTF-8.
    pub name: String,
}

impl DentryKey {
    /// Creates a dentry key.
    pub fn new(parent_id: InodeId, name: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
        }
    }

    /// Lowest key of the given parent's range, optionally starting at a marker.
    pub fn range_start(parent_id: InodeId, marker: &str) -> Self {
        Self::new(parent_id, marker)
    }

    /// Exclusive upper bound of the given parent's range.
    pub fn range_end(parent_id: InodeId) -> Self {
        Self::new(parent_id.next(), "")
    }
}

/// Index key of a dentry tombstone. The sequence disambiguates repeated
/// delete/recreate cycles of the same name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DentryTombKey {
    /// Parent directory inode.
    pub parent_id: InodeId,
    /// Entry name.
    pub name: String,
    /// Sequence the deletion was applied at.
    pub seq: u64,
}

/// Record of a fully removed dentry, kept until the background pass prunes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DentryTombstone {
    /// Parent directory inode.
    pub parent_id: InodeId,
    /// Entry name.
    pub name: String,
    /// Child inode the entry bound to.
    pub inode: InodeId,
    /// Child type.
    pub file_type: FileType,
    /// Sequence the deletion was applied at.
    pub seq: u64,
    /// Deletion time, seconds.
    pub deleted_at: i64,
}

impl DentryTombstone {
    /// Index key of this tombstone.
    pub fn key(&self) -> DentryTombKey {
        DentryTombKey {
            parent_id: self.parent_id,
            name: self.name.clone(),
            seq: self.seq,
        }
    }
}

/// One frozen layer of a dentry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DentryVersion {
    /// Sequence this layer belongs to.
    pub ver_seq: u64,
    /// Child inode recorded at this layer.
    pub inode: InodeId,
    /// Child type recorded at this layer.
    pub file_type: FileType,
    /// Deletion marker recorded at this layer.
    pub delete_mark: bool,
}

/// Outcome of a version-aware dentry deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DentryDelete {
    /// The removed layer's pre-image, if a layer matched.
    pub found: Option<DentryVersion>,
    /// True when the mutation affected the top (live) layer; the caller
    /// applies parent-link accounting iff this is set.
    pub do_more: bool,
    /// True when no layer remains and the node can leave the tree.
    pub clean: bool,
}

impl DentryDelete {
    pub(crate) fn none() -> Self {
        Self {
            found: None,
            do_more: false,
            clean: false,
        }
    }
}

/// A directory entry with optional version chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    /// Parent directory inode.
    pub parent_id: InodeId,
    /// Entry name.
    pub name: String,
    /// Child inode the live layer binds to.
    pub inode: InodeId,
    /// Child type; must match the referenced inode's type.
    pub file_type: FileType,
    /// Sequence of the live layer.
    pub ver_seq: u64,
    /// Deletion marker on the live layer.
    pub delete_mark: bool,
    /// Historical layers, newest first, sequences strictly descending.
    pub versions: Vec<DentryVersion>,
}

impl Dentry {
    /// Creates a live dentry at the given sequence.
    pub fn new(
        parent_id: InodeId,
        name: impl Into<String>,
        inode: InodeId,
        file_type: FileType,
        ver_seq: u64,
    ) -> Self {
        Self {
            parent_id,
            name: name.into(),
            inode,
            file_type,
            ver_seq,
            delete_mark: false,
            versions: Vec::new(),
        }
    }

    /// Index key of this entry.
    pub fn key(&self) -> DentryKey {
        DentryKey::new(self.parent_id, self.name.clone())
    }

    /// True once the live layer carries the deletion marker.
    pub fn is_deleted(&self) -> bool {
        self.delete_mark
    }

    /// Snapshot of the live layer as a version record.
    pub fn top_layer(&self) -> DentryVersion {
        DentryVersion {
            ver_seq: self.ver_seq,
            inode: self.inode,
            file_type: self.file_type,
            delete_mark: self.delete_mark,
        }
    }

    /// Resolves the binding effective at `seq` (0 means latest).
    pub fn effective_at(&self, seq: u64) -> Option<(InodeId, FileType)> {
        if seq == 0 || self.ver_seq <= seq {
            if self.delete_mark {
                return None;
            }
            return Some((self.inode, self.file_type));
        }
        let layer = self.versions.iter().find(|v| v.ver_seq <= seq)?;
        if layer.delete_mark {
            return None;
        }
        Some((layer.inode, layer.file_type))
    }

    /// Freezes the live layer into the chain if the partition moved past it.
    pub(crate) fn migrate_if_stale(&mut self, partition_ver_seq: u64) {
        if partition_ver_seq <= self.ver_seq {
            return;
        }
        self.versions.insert(0, self.top_layer());
        self.ver_seq = partition_ver_seq;
    }

    /// Overwrites a tombstoned live layer with fresh binding fields.
    pub fn resurrect(&mut self, inode: InodeId, file_type: FileType, ver_seq: u64) {
        self.migrate_if_stale(ver_seq);
        self.inode = inode;
        self.file_type = file_type;
        self.delete_mark = false;
    }

    /// Deletes the layer addressed by `req_seq` (0 targets the live layer).
    ///
    /// Returns the `(found, do_more, clean)` triplet: the caller updates
    /// parent link accounting iff `do_more`, and drops the node from the tree
    /// iff `clean`.
    pub fn delete_version(&mut self, req_seq: u64, partition_ver_seq: u64) -> DentryDelete {
        if req_seq == 0 || req_seq >= self.ver_seq {
            return self.delete_live(partition_ver_seq);
        }
        let Some(idx) = self.versions.iter().position(|v| v.ver_seq <= req_seq) else {
            return DentryDelete::none();
        };
        let removed = self.versions.remove(idx);
        DentryDelete {
            found: Some(removed),
            do_more: false,
            clean: self.versions.is_empty() && self.delete_mark,
        }
    }

    fn delete_live(&mut self, partition_ver_seq: u64) -> DentryDelete {
        if self.delete_mark {
            return DentryDelete::none();
        }
        let pre = self.top_layer();
        if partition_ver_seq == 0 || (self.ver_seq == partition_ver_seq && self.versions.is_empty())
        {
            // nothing older can observe this entry
            return DentryDelete {
                found: Some(pre),
                do_more: true,
                clean: true,
            };
        }
        self.migrate_if_stale(partition_ver_seq);
        self.delete_mark = true;
        DentryDelete {
            found: Some(pre),
            do_more: true,
            clean: false,
        }
    }
}
