//! Inode entity: file/dir/symlink metadata with a multi-version chain.
//!
//! The version chain keeps historical snapshots of the inode newest-first,
//! with strictly descending sequences. Mutations always land on the live
//! layer; if the live layer is older than the partition sequence, its current
//! contents are migrated into the chain first so prior snapshots stay
//! readable.

use serde::{Deserialize, Serialize};

use crate::extent::{ExtentKey, SortedExtents, SortedObjExtents};
use crate::types::{FileType, InodeId, OpStatus, QuotaId};

/// One historical layer of an inode, frozen when a newer version began.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeVersion {
    /// Sequence this layer's content belongs to.
    pub ver_seq: u64,
    /// File size at freeze time.
    pub size: u64,
    /// Modification time at freeze time.
    pub mtime: i64,
    /// Change time at freeze time.
    pub ctime: i64,
    /// Data extents at freeze time.
    pub extents: SortedExtents,
    /// Deletion marker recorded at this layer.
    pub delete_mark: bool,
}

/// Marker kept in the tombstoned-inode index while a delete-marked inode
/// waits out its grace period on the free-list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstonedInode {
    /// The delete-marked inode.
    pub inode: InodeId,
    /// When the deletion marker was applied, seconds.
    pub deleted_at: i64,
}

/// Attribute view of an inode as seen at some snapshot sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeView {
    /// Inode id.
    pub id: InodeId,
    /// File type.
    pub file_type: FileType,
    /// Permission bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Link count of the live layer.
    pub nlink: u32,
    /// Size at the requested sequence.
    pub size: u64,
    /// Access time.
    pub atime: i64,
    /// Modification time at the requested sequence.
    pub mtime: i64,
    /// Change time at the requested sequence.
    pub ctime: i64,
    /// Symlink target bytes, for symlinks.
    pub symlink_target: Option<Vec<u8>>,
}

/// File, directory or symlink metadata owned by one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Unique id within the partition range. Immutable.
    pub id: InodeId,
    /// High-level type; decides which fields apply.
    pub file_type: FileType,
    /// Permission bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Bytes for regular files; informational for directories.
    pub size: u64,
    /// Hard-link count. Directories start at 2 (self + parent).
    pub nlink: u32,
    /// Access time, seconds.
    pub atime: i64,
    /// Modification time, seconds.
    pub mtime: i64,
    /// Change time, seconds.
    pub ctime: i64,
    /// Target bytes, iff symlink.
    pub symlink_target: Option<Vec<u8>>,
    /// Live data extents, strictly sorted and non-overlapping.
    pub extents: SortedExtents,
    /// Object-backed cold ranges, append-only.
    pub obj_extents: SortedObjExtents,
    /// Sequence the live layer's content belongs to.
    pub ver_seq: u64,
    /// Deletion marker on the live layer.
    pub delete_mark: bool,
    /// Quota ids bound to this inode.
    pub quota_ids: Vec<QuotaId>,
    /// Historical layers, newest first, sequences strictly descending.
    pub versions: Vec<InodeVersion>,
}

impl Inode {
    /// Creates a fresh inode. Link count follows the type: 2 for directories,
    /// 1 otherwise.
    pub fn new(
        id: InodeId,
        file_type: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        time: i64,
    ) -> Self {
        let nlink = if file_type.is_dir() { 2 } else { 1 };
        Self {
            id,
            file_type,
            mode,
            uid,
            gid,
            size: 0,
            nlink,
            atime: time,
            mtime: time,
            ctime: time,
            symlink_target: None,
            extents: SortedExtents::new(),
            obj_extents: SortedObjExtents::new(),
            ver_seq: 0,
            delete_mark: false,
            quota_ids: Vec::new(),
            versions: Vec::new(),
        }
    }

    /// True once the live layer carries the deletion marker.
    pub fn should_delete(&self) -> bool {
        self.delete_mark
    }

    /// A zero-linked non-directory awaiting teardown.
    pub fn is_temp_file(&self) -> bool {
        !self.file_type.is_dir() && self.nlink == 0
    }

    /// True when the version chain is empty.
    pub fn no_snapshots(&self) -> bool {
        self.versions.is_empty()
    }

    /// Directory link-count emptiness: 2 means no children reference it.
    pub fn is_empty_dir_nlink(&self) -> bool {
        self.file_type.is_dir() && self.nlink <= 2
    }

    /// Freezes the live layer into the version chain if the partition has
    /// moved past it. Must run before any live-layer mutation.
    pub fn migrate_if_stale(&mut self, partition_ver_seq: u64) {
        if partition_ver_seq <= self.ver_seq {
            return;
        }
        self.versions.insert(
            0,
            InodeVersion {
                ver_seq: self.ver_seq,
                size: self.size,
                mtime: self.mtime,
                ctime: self.ctime,
                extents: self.extents.clone(),
                delete_mark: self.delete_mark,
            },
        );
        self.ver_seq = partition_ver_seq;
    }

    /// Bumps the link count on the live layer.
    pub fn inc_nlink(&mut self, partition_ver_seq: u64) {
        self.migrate_if_stale(partition_ver_seq);
        self.nlink += 1;
    }

    /// Drops the link count on the live layer, saturating at zero.
    pub fn dec_nlink(&mut self) {
        self.nlink = self.nlink.saturating_sub(1);
    }

    /// Removes one link on the live layer.
    ///
    /// A non-directory reaching zero links is delete-marked and its access
    /// time stamped; the returned extents (non-empty only when no snapshot
    /// layer still needs them) are due for reclamation.
    pub fn unlink_live(&mut self, partition_ver_seq: u64, time: i64) -> (OpStatus, Vec<ExtentKey>) {
        if self.delete_mark {
            return (OpStatus::NotExist, Vec::new());
        }
        self.migrate_if_stale(partition_ver_seq);
        self.dec_nlink();
        let mut reclaim = Vec::new();
        if !self.file_type.is_dir() && self.nlink == 0 {
            self.delete_mark = true;
            self.atime = time;
            if self.versions.is_empty() {
                reclaim = self.extents.as_slice().to_vec();
            }
        }
        (OpStatus::Ok, reclaim)
    }

    /// Removes the chain layer effective at `req_seq`.
    ///
    /// Extents unique to that layer (not referenced by the immediately newer
    /// layer) are returned for reclamation. `do_more` is true only when the
    /// request actually targeted the live layer, so the caller applies
    /// parent-link accounting at most once.
    pub fn unlink_version(&mut self, req_seq: u64, time: i64) -> (OpStatus, Vec<ExtentKey>, bool) {
        if req_seq >= self.ver_seq {
            // the live layer is the effective one at this sequence
            let (status, reclaim) = self.unlink_live(self.ver_seq, time);
            return (status, reclaim, true);
        }
        let Some(idx) = self.versions.iter().position(|v| v.ver_seq <= req_seq) else {
            return (OpStatus::NotExist, Vec::new(), false);
        };
        let removed = self.versions.remove(idx);
        let newer_extents: Vec<ExtentKey> = if idx == 0 {
            self.extents.as_slice().to_vec()
        } else {
            self.versions[idx - 1].extents.as_slice().to_vec()
        };
        let reclaim: Vec<ExtentKey> = removed
            .extents
            .as_slice()
            .iter()
            .filter(|e| !newer_extents.iter().any(|n| n.same_blob(e)))
            .copied()
            .collect();
        (OpStatus::Ok, reclaim, false)
    }

    /// Keys displaced from the live list stay reachable through the newest
    /// snapshot layer when one exists; reclamation is deferred to that
    /// layer's deletion. Without snapshots they are returned for immediate
    /// reclamation.
    fn defer_to_snapshot_layer(&mut self, dropped: Vec<ExtentKey>) -> Vec<ExtentKey> {
        if dropped.is_empty() {
            return dropped;
        }
        if let Some(layer) = self.versions.first_mut() {
            for ek in &dropped {
                layer.extents.insert_unmerged(*ek);
            }
            return Vec::new();
        }
        dropped
    }

    /// Splices a batch of extents into the live layer, returning evicted keys
    /// due for reclamation.
    pub fn append_extents(
        &mut self,
        eks: &[ExtentKey],
        partition_ver_seq: u64,
        time: i64,
    ) -> Vec<ExtentKey> {
        self.migrate_if_stale(partition_ver_seq);
        let mut deleted = Vec::new();
        for ek in eks {
            deleted.extend(self.extents.append(*ek));
        }
        self.size = self.size.max(self.extents.byte_size());
        self.mtime = time;
        self.ctime = time;
        self.defer_to_snapshot_layer(deleted)
    }

    /// Conflict-checked append of one proposed extent.
    pub fn append_extent_checked(
        &mut self,
        ek: ExtentKey,
        discard: &[ExtentKey],
        partition_ver_seq: u64,
        time: i64,
    ) -> (Vec<ExtentKey>, OpStatus) {
        self.migrate_if_stale(partition_ver_seq);
        let (deleted, status) = self.extents.append_with_check(ek, discard);
        if !status.is_ok() {
            return (deleted, status);
        }
        self.size = self.size.max(self.extents.byte_size());
        self.mtime = time;
        self.ctime = time;
        (self.defer_to_snapshot_layer(deleted), status)
    }

    /// Records a split extent into the newest snapshot layer without merging.
    /// Falls back to the live list when no snapshot layer exists.
    pub fn append_extent_split(
        &mut self,
        ek: ExtentKey,
        partition_ver_seq: u64,
        time: i64,
    ) -> Vec<ExtentKey> {
        self.migrate_if_stale(partition_ver_seq);
        let deleted = match self.versions.first_mut() {
            Some(layer) => layer.extents.insert_unmerged(ek),
            None => self.extents.insert_unmerged(ek),
        };
        self.mtime = time;
        deleted
    }

    /// Appends object-backed extents; overlap is refused.
    pub fn append_obj_extents(&mut self, eks: &[crate::extent::ObjExtentKey], time: i64) -> OpStatus {
        let status = self.obj_extents.append(eks);
        if status.is_ok() {
            self.size = self.size.max(self.obj_extents.byte_size());
            self.mtime = time;
        }
        status
    }

    /// Cuts the file at `new_size`.
    ///
    /// With an active snapshot layer the dropped ranges migrate into it and
    /// reclamation is deferred to that layer's deletion; otherwise they are
    /// returned for immediate reclamation.
    pub fn truncate(
        &mut self,
        new_size: u64,
        partition_ver_seq: u64,
        time: i64,
    ) -> (OpStatus, Vec<ExtentKey>) {
        if !self.file_type.is_regular() {
            return (OpStatus::ArgMismatch, Vec::new());
        }
        self.migrate_if_stale(partition_ver_seq);
        let dropped = self.extents.truncate(new_size);
        self.size = new_size;
        self.mtime = time;
        self.ctime = time;
        (OpStatus::Ok, self.defer_to_snapshot_layer(dropped))
    }

    /// Drains the live extent list, returning the dropped keys. With
    /// `reset_size` the file size drops to zero; the cache-eviction path
    /// keeps it, since the bytes remain reachable through `obj_extents`.
    pub fn clear_extents(&mut self, time: i64, reset_size: bool) -> Vec<ExtentKey> {
        let dropped = self.extents.drain_all();
        if reset_size {
            self.size = 0;
        }
        self.mtime = time;
        dropped
    }

    /// Applies the non-None attribute fields.
    #[allow(clippy::too_many_arguments)]
    pub fn set_attr(
        &mut self,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        atime: Option<i64>,
        mtime: Option<i64>,
        time: i64,
    ) {
        if let Some(m) = mode {
            self.mode = m;
        }
        if let Some(u) = uid {
            self.uid = u;
        }
        if let Some(g) = gid {
            self.gid = g;
        }
        if let Some(a) = atime {
            self.atime = a;
        }
        if let Some(m) = mtime {
            self.mtime = m;
        }
        self.ctime = time;
    }

    /// Resolves the attribute view effective at `seq` (0 means latest).
    /// Returns `None` when the effective layer is delete-marked or no layer
    /// existed yet at that sequence.
    pub fn view_at(&self, seq: u64) -> Option<InodeView> {
        if seq == 0 || self.ver_seq <= seq {
            if self.delete_mark {
                return None;
            }
            return Some(self.make_view(self.size, self.mtime, self.ctime));
        }
        let layer = self.versions.iter().find(|v| v.ver_seq <= seq)?;
        if layer.delete_mark {
            return None;
        }
        Some(self.make_view(layer.size, layer.mtime, layer.ctime))
    }

    /// Extent list effective at `seq` (0 means latest).
    pub fn extents_at(&self, seq: u64) -> Option<&SortedExtents> {
        if seq == 0 || self.ver_seq <= seq {
            if self.delete_mark {
                return None;
            }
            return Some(&self.extents);
        }
        let layer = self.versions.iter().find(|v| v.ver_seq <= seq)?;
        if layer.delete_mark {
            return None;
        }
        Some(&layer.extents)
    }

    fn make_view(&self, size: u64, mtime: i64, ctime: i64) -> InodeView {
        InodeView {
            id: self.id,
            file_type: self.file_type,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlink: self.nlink,
            size,
            atime: self.atime,
            mtime,
            ctime,
            symlink_target: self.symlink_target.clone(),
        }
    }
}
