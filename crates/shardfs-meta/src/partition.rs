//! The metadata partition: owner of the six ordered indexes, the snapshot
//! sequence, the free-list, the reclaim conveyor and the transaction state.
//!
//! A process hosts many partitions; nothing here is global. Writes flow in
//! through the dispatcher (see [`crate::fsm`]); the read operations below run
//! concurrently under the per-index reader locks.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::btree::OrderedIndex;
use crate::config::PartitionConfig;
use crate::dentry::{Dentry, DentryKey, DentryTombKey, DentryTombstone};
use crate::extent::ExtentKey;
use crate::inode::{Inode, InodeView, TombstonedInode};
use crate::multipart::{Multipart, MultipartKey};
use crate::quota::QuotaManager;
use crate::reclaim::{FreeList, ReclaimChannel, ReclaimEvent};
use crate::transaction::TransactionManager;
use crate::types::{FileType, InodeId, OpStatus};
use crate::version::VersionList;
use crate::xattr::XAttr;

/// One readdir result row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    /// Entry name.
    pub name: String,
    /// Child inode.
    pub ino: InodeId,
    /// Child type.
    pub file_type: FileType,
}

/// Sliding window of recently seen client retry ids.
pub(crate) struct UniqChecker {
    window: usize,
    seen: HashSet<u64>,
    order: VecDeque<u64>,
}

impl UniqChecker {
    fn new(window: usize) -> Self {
        Self {
            window,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when the id has not been seen inside the window. Id 0
    /// disables suppression.
    fn legal_in(&mut self, id: u64) -> bool {
        if id == 0 {
            return true;
        }
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.window {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub(crate) fn export(&self) -> Vec<u64> {
        self.order.iter().copied().collect()
    }

    pub(crate) fn import(&mut self, ids: Vec<u64>) {
        self.seen.clear();
        self.order.clear();
        for id in ids {
            self.seen.insert(id);
            self.order.push_back(id);
        }
    }
}

/// A shard of the namespace: its state machine and derived bookkeeping.
pub struct MetaPartition {
    pub(crate) config: PartitionConfig,
    pub(crate) inodes: OrderedIndex<InodeId, Inode>,
    pub(crate) dentries: OrderedIndex<DentryKey, Dentry>,
    pub(crate) xattrs: OrderedIndex<InodeId, XAttr>,
    pub(crate) multiparts: OrderedIndex<MultipartKey, Multipart>,
    pub(crate) tomb_inodes: OrderedIndex<InodeId, TombstonedInode>,
    pub(crate) tomb_dentries: OrderedIndex<DentryTombKey, DentryTombstone>,
    pub(crate) versions: Mutex<VersionList>,
    ver_seq: AtomicU64,
    pub(crate) free_list: FreeList,
    pub(crate) reclaim: ReclaimChannel,
    pub(crate) quotas: QuotaManager,
    pub(crate) txs: TransactionManager,
    pub(crate) uniq: Mutex<UniqChecker>,
    applied: AtomicU64,
}

impl MetaPartition {
    /// Creates an empty partition, returning the consumer end of its reclaim
    /// conveyor.
    pub fn new(config: PartitionConfig) -> (Arc<Self>, mpsc::Receiver<ReclaimEvent>) {
        let (reclaim, rx) =
            ReclaimChannel::new(config.partition_id, config.reclaim_channel_capacity);
        let uniq_window = config.uniq_id_window;
        let partition = Arc::new(Self {
            config,
            inodes: OrderedIndex::new(),
            dentries: OrderedIndex::new(),
            xattrs: OrderedIndex::new(),
            multiparts: OrderedIndex::new(),
            tomb_inodes: OrderedIndex::new(),
            tomb_dentries: OrderedIndex::new(),
            versions: Mutex::new(VersionList::new()),
            ver_seq: AtomicU64::new(0),
            free_list: FreeList::new(),
            reclaim,
            quotas: QuotaManager::new(),
            txs: TransactionManager::new(),
            uniq: Mutex::new(UniqChecker::new(uniq_window)),
            applied: AtomicU64::new(0),
        });
        (partition, rx)
    }

    /// Static configuration of this partition.
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Current snapshot sequence.
    pub fn ver_seq(&self) -> u64 {
        self.ver_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ver_seq(&self, seq: u64) {
        self.ver_seq.store(seq, Ordering::SeqCst);
    }

    /// Index of the last applied command.
    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub(crate) fn set_applied_index(&self, idx: u64) {
        self.applied.store(idx, Ordering::SeqCst);
    }

    pub(crate) fn bump_applied(&self) -> u64 {
        self.applied.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Quota accounting of this partition.
    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    /// Transaction state of this partition.
    pub fn transactions(&self) -> &TransactionManager {
        &self.txs
    }

    /// Free-list of inodes pending hard-delete.
    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Number of live inode records (tombstoned included until hard-delete).
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Number of dentry records.
    pub fn dentry_count(&self) -> usize {
        self.dentries.len()
    }

    pub(crate) fn uniq_legal(&self, id: u64) -> bool {
        self.uniq.lock().unwrap().legal_in(id)
    }

    /// Emits extent keys to the reclaim conveyor (never blocks).
    pub(crate) fn emit_reclaim(&self, extents: Vec<ExtentKey>) {
        self.reclaim.send(extents);
    }

    /// Retries reclaim events parked in the overflow queue.
    pub fn flush_reclaim_overflow(&self) -> usize {
        self.reclaim.flush_overflow()
    }

    /// Full inode record, any state. Mostly for the reclaimer and tests.
    pub fn inode_record(&self, ino: InodeId) -> Option<Arc<Inode>> {
        self.inodes.get(&ino)
    }

    /// Visits every dentry tombstone; the visitor returns false to stop.
    pub fn scan_dentry_tombstones(&self, mut visit: impl FnMut(&DentryTombKey, i64) -> bool) {
        let start = DentryTombKey {
            parent_id: InodeId::new(0),
            name: String::new(),
            seq: 0,
        };
        self.tomb_dentries
            .ascend_from(&start, |key, tomb| visit(key, tomb.deleted_at));
    }

    /// Attribute view of an inode at `seq` (0 means latest).
    pub fn get_inode(&self, ino: InodeId, seq: u64) -> Option<InodeView> {
        self.inodes.get(&ino).and_then(|i| i.view_at(seq))
    }

    /// Extent list of a regular file at `seq` (0 means latest).
    pub fn get_extents(&self, ino: InodeId, seq: u64) -> Option<Vec<ExtentKey>> {
        self.inodes
            .get(&ino)
            .and_then(|i| i.extents_at(seq).map(|se| se.as_slice().to_vec()))
    }

    /// Returns true when the inode exists and is not delete-marked.
    pub fn has_inode(&self, ino: InodeId) -> bool {
        self.inodes
            .get(&ino)
            .map(|i| !i.should_delete())
            .unwrap_or(false)
    }

    /// Resolves `(parent, name)` at `seq` (0 means latest).
    pub fn lookup(&self, parent: InodeId, name: &str, seq: u64) -> Option<(InodeId, FileType)> {
        let key = DentryKey::new(parent, name);
        self.dentries.get(&key).and_then(|d| d.effective_at(seq))
    }

    /// One extended attribute value.
    pub fn get_xattr(&self, ino: InodeId, name: &str) -> Option<Vec<u8>> {
        self.xattrs
            .get(&ino)
            .and_then(|x| x.get(name).map(|v| v.to_vec()))
    }

    /// All attribute names on an inode, sorted.
    pub fn list_xattr(&self, ino: InodeId) -> Vec<String> {
        self.xattrs
            .get(&ino)
            .map(|x| x.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// A multipart record.
    pub fn get_multipart(&self, path: &str, id: &str) -> Option<Arc<Multipart>> {
        self.multiparts.get(&MultipartKey::new(path, id))
    }

    /// Ordered children of `parent` strictly after `marker`, up to `limit`
    /// (0 means no cap), resolved through the version chain at `seq`.
    /// `dirs_only` restricts the listing to directory entries.
    pub fn read_dir(
        &self,
        parent: InodeId,
        marker: &str,
        limit: u64,
        seq: u64,
        dirs_only: bool,
    ) -> Vec<DirEntryInfo> {
        let lo = DentryKey::range_start(parent, marker);
        let hi = DentryKey::range_end(parent);
        let mut out = Vec::new();
        self.dentries.ascend_range(&lo, &hi, |key, dentry| {
            if !marker.is_empty() && key.name == marker {
                return true;
            }
            let Some((ino, file_type)) = dentry.effective_at(seq) else {
                return true;
            };
            if dirs_only && !file_type.is_dir() {
                return true;
            }
            out.push(DirEntryInfo {
                name: key.name.clone(),
                ino,
                file_type,
            });
            limit == 0 || (out.len() as u64) < limit
        });
        out
    }

    /// Returns true when the directory has no children visible at any live
    /// layer or snapshot layer.
    pub fn dir_is_empty(&self, parent: InodeId) -> bool {
        let lo = DentryKey::range_start(parent, "");
        let hi = DentryKey::range_end(parent);
        let mut empty = true;
        self.dentries.ascend_range(&lo, &hi, |_, dentry| {
            if !dentry.is_deleted() || !dentry.versions.is_empty() {
                empty = false;
                return false;
            }
            true
        });
        empty
    }

    /// Records a dentry tombstone for the background pruner.
    pub(crate) fn record_dentry_tombstone(&self, tomb: DentryTombstone) {
        let key = tomb.key();
        let _ = self.tomb_dentries.insert_or_replace(key, tomb, true);
    }

    /// Drops every tombstone of `(parent, name)` regardless of sequence.
    pub(crate) fn remove_dentry_tombstones(&self, parent: InodeId, name: &str) {
        let lo = DentryTombKey {
            parent_id: parent,
            name: name.to_string(),
            seq: 0,
        };
        let hi = DentryTombKey {
            parent_id: parent,
            name: name.to_string(),
            seq: u64::MAX,
        };
        let mut stale = Vec::new();
        self.tomb_dentries.ascend_range(&lo, &hi, |key, _| {
            stale.push(key.clone());
            true
        });
        for key in stale {
            self.tomb_dentries.remove(&key);
        }
    }

    /// Rebuilds the free-list and quota aggregates from the indexes. Runs
    /// after bootstrap; the scan order is the index order, so every replica
    /// derives identical state.
    pub(crate) fn rebuild_derived_state(&self) {
        self.quotas.reset_usage();

        let inode_snap = self.inodes.clone_snapshot();
        for (ino, inode) in &inode_snap {
            if inode.should_delete() && inode.nlink == 0 && !inode.file_type.is_dir() {
                let deleted_at = self
                    .tomb_inodes
                    .get(ino)
                    .map(|t| t.deleted_at)
                    .unwrap_or(inode.atime);
                self.free_list.push(*ino, deleted_at);
                continue;
            }
            if inode.file_type.is_regular() && !inode.should_delete() {
                let _ = self.quotas.charge_uid(inode.uid, inode.extents.stored_bytes());
            }
        }

        for (ino, xattr) in self.xattrs.clone_snapshot() {
            let Ok(map) = xattr.quota_map() else {
                continue;
            };
            if map.is_empty() {
                continue;
            }
            let Some(inode) = inode_snap.get(&ino) else {
                continue;
            };
            if inode.should_delete() {
                continue;
            }
            for quota_id in map.keys() {
                self.quotas.update_used(*quota_id, inode.size as i64, 1);
            }
        }

        tracing::debug!(
            partition = %self.config.partition_id,
            free_list = self.free_list.len(),
            "derived state rebuilt"
        );
    }

    /// Status shorthand used by handlers checking the inode range.
    pub(crate) fn check_inode_range(&self, ino: InodeId) -> OpStatus {
        if self.config.owns_inode(ino) {
            OpStatus::Ok
        } else {
            OpStatus::InodeFull
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionId;

    fn partition() -> Arc<MetaPartition> {
        let cfg = PartitionConfig::new(PartitionId::new(1), InodeId::new(1), InodeId::new(10_000));
        MetaPartition::new(cfg).0
    }

    fn seed_dentry(p: &MetaPartition, parent: u64, name: &str, child: u64, ft: FileType) {
        let d = Dentry::new(InodeId::new(parent), name, InodeId::new(child), ft, 0);
        p.dentries.insert_or_replace(d.key(), d, false).unwrap();
    }

    #[test]
    fn test_uniq_checker_window() {
        let mut uc = UniqChecker::new(2);
        assert!(uc.legal_in(0));
        assert!(uc.legal_in(0));
        assert!(uc.legal_in(1));
        assert!(!uc.legal_in(1));
        assert!(uc.legal_in(2));
        assert!(uc.legal_in(3));
        // id 1 slid out of the window
        assert!(uc.legal_in(1));
    }

    #[test]
    fn test_read_dir_ordered_with_marker_and_limit() {
        let p = partition();
        for name in ["b", "d", "a", "c"] {
            seed_dentry(&p, 100, name, 200, FileType::Regular);
        }
        seed_dentry(&p, 101, "zz", 300, FileType::Regular);

        let all = p.read_dir(InodeId::new(100), "", 0, 0, false);
        let names: Vec<&str> = all.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);

        let after_b = p.read_dir(InodeId::new(100), "b", 0, 0, false);
        let names: Vec<&str> = after_b.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["c", "d"]);

        let capped = p.read_dir(InodeId::new(100), "", 2, 0, false);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].name, "b");
    }

    #[test]
    fn test_read_dir_dirs_only() {
        let p = partition();
        seed_dentry(&p, 100, "f", 200, FileType::Regular);
        seed_dentry(&p, 100, "sub", 201, FileType::Directory);
        let dirs = p.read_dir(InodeId::new(100), "", 0, 0, true);
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].name, "sub");
    }

    #[test]
    fn test_dir_is_empty_sees_snapshot_layers() {
        let p = partition();
        assert!(p.dir_is_empty(InodeId::new(100)));
        seed_dentry(&p, 100, "f", 200, FileType::Regular);
        assert!(!p.dir_is_empty(InodeId::new(100)));

        // tombstoned live layer with a surviving snapshot layer still blocks
        p.dentries
            .with_mut(&DentryKey::new(InodeId::new(100), "f"), |d| {
                d.delete_version(0, 5);
            });
        assert!(!p.dir_is_empty(InodeId::new(100)));
    }

    #[test]
    fn test_check_inode_range() {
        let p = partition();
        assert!(p.check_inode_range(InodeId::new(5)).is_ok());
        assert_eq!(
            p.check_inode_range(InodeId::new(10_000)),
            OpStatus::InodeFull
        );
    }
}
