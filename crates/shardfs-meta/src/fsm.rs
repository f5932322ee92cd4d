//! The state-machine dispatcher: maps replicated commands to typed handlers.
//!
//! Handlers are pure functions of (partition state, command): time always
//! comes from the command payload, there is no randomness, and iteration that
//! affects output runs over sorted indexes. An `Err` escaping `apply` means a
//! serialization invariant was violated and the replica must halt rather than
//! diverge; every expected outcome travels as an in-band [`OpStatus`].

use std::sync::Arc;

use crate::command::{
    AppendExtentsCheckedReq, AppendExtentsReq, AppendMultipartReq, AppendObjExtentsReq,
    BatchInodeReq, Command, CreateDentryReq, CreateInodeReq, DeleteDentryReq, DeleteQuotaBatchReq,
    EvictInodeReq, InitMultipartReq, InodeOnlyReq, InternalDeleteBatchReq, LinkInodeReq,
    RemoveMultipartReq, RemoveXattrReq, SetAttrReq, SetQuotaBatchReq, SetXattrReq, TruncateReq,
    TxOp, TxPrepareReq, TxSettleReq, UnlinkInodeReq, UpdateDentryReq, VersionPrepareReq,
    VersionSeqReq,
};
use crate::dentry::{Dentry, DentryDelete, DentryKey, DentryTombstone};
use crate::inode::{Inode, TombstonedInode};
use crate::multipart::{Multipart, MultipartKey};
use crate::partition::MetaPartition;
use crate::transaction::{RollbackKind, RollbackRecord, TxInfo, TxRollbackDentry, TxRollbackInode, TxType};
use crate::types::{InodeId, MetaError, OpStatus, QuotaId};
use crate::xattr::{QuotaBinding, XAttr};

/// Outcome of one applied command.
#[derive(Clone, Debug, Default)]
pub struct ApplyResult {
    /// Status of the command (for batches: `Ok` wrapping per-op statuses).
    pub status: OpStatus,
    /// Per-op statuses of a batch command, in request order.
    pub batch: Vec<OpStatus>,
    /// Prior child binding returned by dentry delete/update for caller
    /// bookkeeping (orphaned-inode policy).
    pub old_child: Option<InodeId>,
}

impl ApplyResult {
    fn of(status: OpStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

impl MetaPartition {
    /// Decodes and applies one command envelope.
    pub fn apply_envelope(&self, bytes: &[u8]) -> Result<ApplyResult, MetaError> {
        let cmd = Command::decode(bytes)?;
        self.apply(&cmd)
    }

    /// Applies one replicated command, returning its status. The applied
    /// index advances for every command, success or not, since the log entry
    /// itself is consumed either way.
    pub fn apply(&self, cmd: &Command) -> Result<ApplyResult, MetaError> {
        let result = match cmd {
            Command::CreateInode(req) => self.fsm_create_inode(req).map(ApplyResult::of)?,
            Command::LinkInode(req) => ApplyResult::of(self.fsm_link_inode(req)),
            Command::UnlinkInode(req) => ApplyResult::of(self.fsm_unlink_inode(req)),
            Command::EvictInode(req) => ApplyResult::of(self.fsm_evict_inode(req)),
            Command::Truncate(req) => ApplyResult::of(self.fsm_truncate(req)),
            Command::AppendExtents(req) => ApplyResult::of(self.fsm_append_extents(req)),
            Command::AppendExtentsChecked(req) => {
                ApplyResult::of(self.fsm_append_extents_checked(req))
            }
            Command::AppendObjExtents(req) => ApplyResult::of(self.fsm_append_obj_extents(req)),
            Command::ClearInodeCache(req) => ApplyResult::of(self.fsm_clear_inode_cache(req)),
            Command::SetAttr(req) => ApplyResult::of(self.fsm_set_attr(req)),
            Command::BatchUnlink(req) => self.fsm_batch_unlink(req),
            Command::BatchEvict(req) => self.fsm_batch_evict(req),
            Command::InternalDelete(req) => {
                self.hard_delete_inode(req.ino);
                ApplyResult::of(OpStatus::Ok)
            }
            Command::InternalDeleteBatch(req) => self.fsm_internal_delete_batch(req),
            Command::ExtentsEmpty(req) => ApplyResult::of(self.fsm_extents_empty(req, true)),
            Command::DelVerExtents(req) => ApplyResult::of(self.fsm_extents_empty(req, false)),
            Command::CreateDentry(req) => ApplyResult::of(self.fsm_create_dentry(req)),
            Command::DeleteDentry(req) => {
                let (status, old_child) = self.fsm_delete_dentry(req);
                ApplyResult {
                    status,
                    batch: Vec::new(),
                    old_child,
                }
            }
            Command::UpdateDentry(req) => {
                let (status, old_child) = self.fsm_update_dentry(req);
                ApplyResult {
                    status,
                    batch: Vec::new(),
                    old_child,
                }
            }
            Command::BatchDeleteDentry(reqs) => self.fsm_batch_delete_dentry(reqs),
            Command::SetXattr(req) => ApplyResult::of(self.fsm_set_xattr(req)),
            Command::RemoveXattr(req) => ApplyResult::of(self.fsm_remove_xattr(req)),
            Command::InitMultipart(req) => ApplyResult::of(self.fsm_init_multipart(req)),
            Command::AppendMultipart(req) => ApplyResult::of(self.fsm_append_multipart(req)),
            Command::RemoveMultipart(req) => ApplyResult::of(self.fsm_remove_multipart(req)),
            Command::VersionPrepare(req) => ApplyResult::of(self.fsm_version_prepare(req)),
            Command::VersionCommit(req) => ApplyResult::of(self.fsm_version_commit(req)),
            Command::VersionDelete(req) => ApplyResult::of(self.fsm_version_delete(req)),
            Command::TxPrepare(req) => self.fsm_tx_prepare(req).map(ApplyResult::of)?,
            Command::TxCommit(req) => ApplyResult::of(self.fsm_tx_commit(req)),
            Command::TxAbort(req) => ApplyResult::of(self.fsm_tx_abort(req)),
            Command::SetQuotaBatch(req) => self.fsm_set_quota_batch(req)?,
            Command::DeleteQuotaBatch(req) => self.fsm_delete_quota_batch(req)?,
        };
        self.bump_applied();
        Ok(result)
    }

    fn inode_from_req(&self, req: &CreateInodeReq) -> Inode {
        let mut inode = Inode::new(req.ino, req.file_type, req.mode, req.uid, req.gid, req.time);
        inode.symlink_target = req.symlink_target.clone();
        inode.quota_ids = req.quota_ids.clone();
        inode.ver_seq = self.ver_seq();
        inode
    }

    // ---- inode family ----------------------------------------------------

    fn fsm_create_inode(&self, req: &CreateInodeReq) -> Result<OpStatus, MetaError> {
        let range = self.check_inode_range(req.ino);
        if !range.is_ok() {
            return Ok(range);
        }
        if self.quotas.any_exhausted(&req.quota_ids) {
            return Ok(OpStatus::DirQuotaExceeded);
        }
        if self.quotas.uid_exhausted(req.uid) {
            return Ok(OpStatus::NoSpace);
        }
        let inode = self.inode_from_req(req);
        if self.inodes.insert_or_replace(req.ino, inode, false).is_err() {
            return Ok(OpStatus::Exists);
        }
        if !req.quota_ids.is_empty() {
            self.bind_quota_xattr(req.ino, &req.quota_ids)?;
            for qid in &req.quota_ids {
                self.quotas.update_used(*qid, 0, 1);
            }
        }
        tracing::debug!(ino = %req.ino, "inode created");
        Ok(OpStatus::Ok)
    }

    fn bind_quota_xattr(&self, ino: InodeId, quota_ids: &[QuotaId]) -> Result<(), MetaError> {
        self.xattrs.execute_atomically(|tree| {
            let entry = tree.entry(ino).or_insert_with(|| Arc::new(XAttr::new(ino)));
            let record = Arc::make_mut(entry);
            let mut map = record.quota_map()?;
            for qid in quota_ids {
                map.entry(*qid).or_insert(QuotaBinding { root: false });
            }
            record.set_quota_map(&map)
        })
    }

    fn fsm_link_inode(&self, req: &LinkInodeReq) -> OpStatus {
        if !self.uniq_legal(req.uniq_id) {
            tracing::debug!(ino = %req.ino, uniq = req.uniq_id, "link replay suppressed");
            return OpStatus::Ok;
        }
        let ver_seq = self.ver_seq();
        self.inodes
            .with_mut(&req.ino, |i| {
                if i.should_delete() {
                    return OpStatus::NotExist;
                }
                i.inc_nlink(ver_seq);
                i.ctime = req.time;
                OpStatus::Ok
            })
            .unwrap_or(OpStatus::NotExist)
    }

    fn fsm_unlink_inode(&self, req: &UnlinkInodeReq) -> OpStatus {
        if !self.uniq_legal(req.uniq_id) {
            tracing::debug!(ino = %req.ino, uniq = req.uniq_id, "unlink replay suppressed");
            return OpStatus::Ok;
        }
        let Some(inode) = self.inodes.get(&req.ino) else {
            return OpStatus::NotExist;
        };
        if req.seq == 0 && inode.should_delete() {
            return OpStatus::NotExist;
        }

        if inode.file_type.is_dir() {
            if req.seq == 0 && !self.dir_is_empty(req.ino) {
                return OpStatus::NotEmpty;
            }
            let no_snapshots = inode.no_snapshots();
            self.inodes.with_mut(&req.ino, |i| {
                i.dec_nlink();
                i.mtime = req.time;
            });
            if no_snapshots {
                self.inodes.remove(&req.ino);
                self.xattrs.remove(&req.ino);
                tracing::debug!(ino = %req.ino, "empty directory removed");
            }
            return OpStatus::Ok;
        }

        let ver_seq = self.ver_seq();
        let was_dead = inode.should_delete();
        let Some((status, reclaim)) = self.inodes.with_mut(&req.ino, |i| {
            if req.seq == 0 {
                i.unlink_live(ver_seq, req.time)
            } else {
                let (status, reclaim, _do_more) = i.unlink_version(req.seq, req.time);
                (status, reclaim)
            }
        }) else {
            return OpStatus::NotExist;
        };
        if !status.is_ok() {
            return status;
        }

        // teardown bookkeeping fires once, when the live layer died
        if let Some(after) = self.inodes.get(&req.ino) {
            if !was_dead && after.should_delete() && after.nlink == 0 {
                for qid in &after.quota_ids {
                    self.quotas.update_used(*qid, -(after.size as i64), -1);
                }
                self.quotas
                    .release_uid(after.uid, after.extents.stored_bytes());
                self.free_list.push(req.ino, req.time);
                let _ = self.tomb_inodes.insert_or_replace(
                    req.ino,
                    TombstonedInode {
                        inode: req.ino,
                        deleted_at: req.time,
                    },
                    true,
                );
                tracing::debug!(ino = %req.ino, "inode pushed to free-list");
            }
        }
        self.emit_reclaim(reclaim);
        OpStatus::Ok
    }

    fn fsm_evict_inode(&self, req: &EvictInodeReq) -> OpStatus {
        let Some(inode) = self.inodes.get(&req.ino) else {
            return OpStatus::NotExist;
        };
        if inode.should_delete() {
            return OpStatus::Ok;
        }
        if inode.file_type.is_dir() {
            if inode.no_snapshots() && self.dir_is_empty(req.ino) {
                self.inodes.with_mut(&req.ino, |i| i.delete_mark = true);
            }
            return OpStatus::Ok;
        }
        if inode.nlink == 0 {
            self.inodes.with_mut(&req.ino, |i| {
                i.delete_mark = true;
                i.atime = req.time;
            });
            if inode.no_snapshots() {
                self.free_list.push(req.ino, req.time);
                let _ = self.tomb_inodes.insert_or_replace(
                    req.ino,
                    TombstonedInode {
                        inode: req.ino,
                        deleted_at: req.time,
                    },
                    true,
                );
            }
        }
        OpStatus::Ok
    }

    fn fsm_truncate(&self, req: &TruncateReq) -> OpStatus {
        let ver_seq = self.ver_seq();
        let Some((status, dropped, old_size, new_size, stored_delta, uid, quota_ids)) =
            self.inodes.with_mut(&req.ino, |i| {
                if i.should_delete() {
                    return (OpStatus::NotExist, Vec::new(), 0, 0, 0, 0, Vec::new());
                }
                let old_size = i.size;
                let stored_before = i.extents.stored_bytes();
                let (status, dropped) = i.truncate(req.size, ver_seq, req.time);
                let stored_delta = stored_before - i.extents.stored_bytes();
                (
                    status,
                    dropped,
                    old_size,
                    i.size,
                    stored_delta,
                    i.uid,
                    i.quota_ids.clone(),
                )
            })
        else {
            return OpStatus::NotExist;
        };
        if !status.is_ok() {
            return status;
        }
        let byte_delta = new_size as i64 - old_size as i64;
        for qid in &quota_ids {
            self.quotas.update_used(*qid, byte_delta, 0);
        }
        self.quotas.release_uid(uid, stored_delta);
        self.emit_reclaim(dropped);
        OpStatus::Ok
    }

    fn fsm_append_extents(&self, req: &AppendExtentsReq) -> OpStatus {
        let Some(pre) = self.inodes.get(&req.ino) else {
            return OpStatus::NotExist;
        };
        if pre.should_delete() {
            return OpStatus::NotExist;
        }
        let add: u64 = req.extents.iter().map(|e| e.size as u64).sum();
        let charge = self.quotas.charge_uid(pre.uid, add);
        if !charge.is_ok() {
            return charge;
        }
        let ver_seq = self.ver_seq();
        let Some((deleted, old_size, new_size, stored_delta, quota_ids)) =
            self.inodes.with_mut(&req.ino, |i| {
                let old_size = i.size;
                let stored_before = i.extents.stored_bytes();
                let deleted = i.append_extents(&req.extents, ver_seq, req.time);
                let stored_delta = i.extents.stored_bytes().saturating_sub(stored_before);
                (deleted, old_size, i.size, stored_delta, i.quota_ids.clone())
            })
        else {
            self.quotas.release_uid(pre.uid, add);
            return OpStatus::NotExist;
        };
        // uid space follows the live list: give back whatever the splice displaced
        self.quotas.release_uid(pre.uid, add.saturating_sub(stored_delta));
        let byte_delta = new_size as i64 - old_size as i64;
        for qid in &quota_ids {
            self.quotas.update_used(*qid, byte_delta, 0);
        }
        self.emit_reclaim(deleted);
        OpStatus::Ok
    }

    fn fsm_append_extents_checked(&self, req: &AppendExtentsCheckedReq) -> OpStatus {
        let Some(pre) = self.inodes.get(&req.ino) else {
            return OpStatus::NotExist;
        };
        if pre.should_delete() {
            return OpStatus::NotExist;
        }
        let add = req.extent.size as u64;
        let charge = self.quotas.charge_uid(pre.uid, add);
        if !charge.is_ok() {
            return charge;
        }
        let ver_seq = self.ver_seq();

        if req.is_split {
            let deleted = self
                .inodes
                .with_mut(&req.ino, |i| {
                    i.append_extent_split(req.extent, ver_seq, req.time)
                })
                .unwrap_or_default();
            // the split key lives in the snapshot layer, outside the live list
            self.quotas.release_uid(pre.uid, add);
            self.emit_reclaim(deleted);
            return OpStatus::Ok;
        }

        let Some((deleted, status, old_size, new_size, stored_delta, quota_ids)) =
            self.inodes.with_mut(&req.ino, |i| {
                let old_size = i.size;
                let stored_before = i.extents.stored_bytes();
                let (deleted, status) =
                    i.append_extent_checked(req.extent, &req.discard, ver_seq, req.time);
                let stored_delta = i.extents.stored_bytes().saturating_sub(stored_before);
                (deleted, status, old_size, i.size, stored_delta, i.quota_ids.clone())
            })
        else {
            self.quotas.release_uid(pre.uid, add);
            return OpStatus::NotExist;
        };

        match status {
            OpStatus::Ok => {
                self.quotas.release_uid(pre.uid, add.saturating_sub(stored_delta));
                let byte_delta = new_size as i64 - old_size as i64;
                for qid in &quota_ids {
                    self.quotas.update_used(*qid, byte_delta, 0);
                }
                self.emit_reclaim(deleted);
                OpStatus::Ok
            }
            OpStatus::ConflictExtents => {
                // the proposed key's on-disk bytes are garbage; tear them down
                self.quotas.release_uid(pre.uid, add);
                self.emit_reclaim(vec![req.extent]);
                OpStatus::ConflictExtents
            }
            other => {
                self.quotas.release_uid(pre.uid, add);
                other
            }
        }
    }

    fn fsm_append_obj_extents(&self, req: &AppendObjExtentsReq) -> OpStatus {
        self.inodes
            .with_mut(&req.ino, |i| {
                if i.should_delete() {
                    return OpStatus::NotExist;
                }
                i.append_obj_extents(&req.extents, req.time)
            })
            .unwrap_or(OpStatus::NotExist)
    }

    fn fsm_clear_inode_cache(&self, req: &InodeOnlyReq) -> OpStatus {
        let Some((status, dropped, uid)) = self.inodes.with_mut(&req.ino, |i| {
            if i.should_delete() {
                return (OpStatus::NotExist, Vec::new(), 0);
            }
            let dropped = i.clear_extents(req.time, false);
            (OpStatus::Ok, dropped, i.uid)
        }) else {
            return OpStatus::NotExist;
        };
        if status.is_ok() {
            let freed: u64 = dropped.iter().map(|e| e.size as u64).sum();
            self.quotas.release_uid(uid, freed);
            self.emit_reclaim(dropped);
        }
        status
    }

    /// Shared body of `ExtentsEmpty` (releases quota) and `DelVerExtents`
    /// (does not). The asymmetry matches the datalake vs snapshot paths.
    fn fsm_extents_empty(&self, req: &InodeOnlyReq, release_quota: bool) -> OpStatus {
        let Some((status, dropped, old_size, uid, quota_ids)) =
            self.inodes.with_mut(&req.ino, |i| {
                if i.should_delete() {
                    return (OpStatus::NotExist, Vec::new(), 0, 0, Vec::new());
                }
                if i.file_type.is_dir() {
                    return (OpStatus::ArgMismatch, Vec::new(), 0, 0, Vec::new());
                }
                let old_size = i.size;
                let dropped = i.clear_extents(req.time, true);
                (OpStatus::Ok, dropped, old_size, i.uid, i.quota_ids.clone())
            })
        else {
            return OpStatus::NotExist;
        };
        if !status.is_ok() {
            return status;
        }
        if release_quota {
            for qid in &quota_ids {
                self.quotas.update_used(*qid, -(old_size as i64), 0);
            }
            let freed: u64 = dropped.iter().map(|e| e.size as u64).sum();
            self.quotas.release_uid(uid, freed);
        }
        self.emit_reclaim(dropped);
        OpStatus::Ok
    }

    fn fsm_set_attr(&self, req: &SetAttrReq) -> OpStatus {
        self.inodes
            .with_mut(&req.ino, |i| {
                if i.should_delete() {
                    return OpStatus::NotExist;
                }
                i.set_attr(req.mode, req.uid, req.gid, req.atime, req.mtime, req.time);
                OpStatus::Ok
            })
            .unwrap_or(OpStatus::NotExist)
    }

    fn fsm_batch_unlink(&self, req: &BatchInodeReq) -> ApplyResult {
        let mut batch = Vec::with_capacity(req.inos.len());
        for ino in &req.inos {
            if self.txs.inode_claimed_by(*ino).is_some() {
                batch.push(OpStatus::TxConflict);
                continue;
            }
            batch.push(self.fsm_unlink_inode(&UnlinkInodeReq {
                ino: *ino,
                seq: 0,
                uniq_id: 0,
                time: req.time,
            }));
        }
        ApplyResult {
            status: OpStatus::Ok,
            batch,
            old_child: None,
        }
    }

    fn fsm_batch_evict(&self, req: &BatchInodeReq) -> ApplyResult {
        let mut batch = Vec::with_capacity(req.inos.len());
        for ino in &req.inos {
            if self.txs.inode_claimed_by(*ino).is_some() {
                batch.push(OpStatus::TxConflict);
                continue;
            }
            batch.push(self.fsm_evict_inode(&EvictInodeReq {
                ino: *ino,
                time: req.time,
            }));
        }
        ApplyResult {
            status: OpStatus::Ok,
            batch,
            old_child: None,
        }
    }

    fn hard_delete_inode(&self, ino: InodeId) {
        self.inodes.remove(&ino);
        self.xattrs.remove(&ino);
        self.tomb_inodes.remove(&ino);
        self.free_list.remove(ino);
        tracing::debug!(ino = %ino, "inode hard-deleted");
    }

    fn fsm_internal_delete_batch(&self, req: &InternalDeleteBatchReq) -> ApplyResult {
        for ino in &req.inos {
            self.hard_delete_inode(*ino);
        }
        for key in &req.dentry_tombstones {
            self.tomb_dentries.remove(key);
        }
        if req.prune_settled_before > 0 {
            self.txs.prune_settled_before(req.prune_settled_before);
        }
        ApplyResult::of(OpStatus::Ok)
    }

    // ---- dentry family ---------------------------------------------------

    fn fsm_create_dentry(&self, req: &CreateDentryReq) -> OpStatus {
        let Some(parent) = self.inodes.get(&req.parent) else {
            return OpStatus::NotExist;
        };
        if parent.should_delete() {
            return OpStatus::NotExist;
        }
        if !parent.file_type.is_dir() {
            return OpStatus::ArgMismatch;
        }

        let key = DentryKey::new(req.parent, req.name.clone());
        let ver_seq = self.ver_seq();
        if let Some(existing) = self.dentries.get(&key) {
            if existing.is_deleted() {
                self.dentries
                    .with_mut(&key, |d| d.resurrect(req.ino, req.file_type, ver_seq));
            } else if existing.file_type.is_dir() != req.file_type.is_dir() {
                // directories and files must not overwrite each other
                return OpStatus::ArgMismatch;
            } else if existing.inode == req.ino && existing.file_type == req.file_type {
                return OpStatus::Ok;
            } else {
                return OpStatus::Exists;
            }
        } else {
            let dentry = Dentry::new(req.parent, req.name.clone(), req.ino, req.file_type, ver_seq);
            let _ = self.dentries.insert_or_replace(key, dentry, false);
        }

        self.inodes.with_mut(&req.parent, |p| {
            p.inc_nlink(ver_seq);
            p.mtime = req.time;
        });
        OpStatus::Ok
    }

    fn fsm_delete_dentry(&self, req: &DeleteDentryReq) -> (OpStatus, Option<InodeId>) {
        let key = DentryKey::new(req.parent, req.name.clone());
        let Some(current) = self.dentries.get(&key) else {
            return (OpStatus::NotExist, None);
        };
        if let Some(expected) = req.expected_ino {
            if current.inode != expected {
                tracing::warn!(
                    parent = %req.parent,
                    name = %req.name,
                    "delete guard mismatch: bound {} expected {}",
                    current.inode,
                    expected
                );
                return (OpStatus::NotExist, None);
            }
        }

        let ver_seq = self.ver_seq();
        let out = self
            .dentries
            .with_mut(&key, |d| d.delete_version(req.seq, ver_seq))
            .unwrap_or_else(DentryDelete::none);
        let Some(found) = out.found else {
            return (OpStatus::NotExist, None);
        };
        if out.clean {
            self.dentries.remove(&key);
            self.record_dentry_tombstone(DentryTombstone {
                parent_id: req.parent,
                name: req.name.clone(),
                inode: found.inode,
                file_type: found.file_type,
                seq: ver_seq,
                deleted_at: req.time,
            });
        }
        if out.do_more {
            self.inodes.with_mut(&req.parent, |p| {
                if !p.should_delete() {
                    if req.seq == 0 {
                        p.dec_nlink();
                    }
                    p.mtime = req.time;
                }
            });
        }
        (OpStatus::Ok, Some(found.inode))
    }

    fn fsm_update_dentry(&self, req: &UpdateDentryReq) -> (OpStatus, Option<InodeId>) {
        let ver_seq = self.ver_seq();
        self.dentries
            .with_mut(&DentryKey::new(req.parent, req.name.clone()), |d| {
                if d.is_deleted() {
                    return (OpStatus::NotExist, None);
                }
                if d.inode == req.ino {
                    return (OpStatus::Ok, Some(d.inode));
                }
                d.migrate_if_stale(ver_seq);
                let old = d.inode;
                d.inode = req.ino;
                (OpStatus::Ok, Some(old))
            })
            .unwrap_or((OpStatus::NotExist, None))
    }

    fn fsm_batch_delete_dentry(&self, reqs: &[DeleteDentryReq]) -> ApplyResult {
        let mut batch = Vec::with_capacity(reqs.len());
        for req in reqs {
            if self.txs.dentry_claimed_by(req.parent, &req.name).is_some() {
                batch.push(OpStatus::TxConflict);
                continue;
            }
            batch.push(self.fsm_delete_dentry(req).0);
        }
        ApplyResult {
            status: OpStatus::Ok,
            batch,
            old_child: None,
        }
    }

    // ---- xattr family ----------------------------------------------------

    fn fsm_set_xattr(&self, req: &SetXattrReq) -> OpStatus {
        if !self.inodes.contains(&req.ino) {
            return OpStatus::NotExist;
        }
        self.xattrs.execute_atomically(|tree| {
            let entry = tree
                .entry(req.ino)
                .or_insert_with(|| Arc::new(XAttr::new(req.ino)));
            Arc::make_mut(entry).set(req.name.clone(), req.value.clone());
        });
        OpStatus::Ok
    }

    fn fsm_remove_xattr(&self, req: &RemoveXattrReq) -> OpStatus {
        // absence is equivalent to an empty map
        self.xattrs.execute_atomically(|tree| {
            if let Some(entry) = tree.get_mut(&req.ino) {
                let record = Arc::make_mut(entry);
                record.remove(&req.name);
                if record.is_empty() {
                    tree.remove(&req.ino);
                }
            }
        });
        OpStatus::Ok
    }

    // ---- multipart family ------------------------------------------------

    fn fsm_init_multipart(&self, req: &InitMultipartReq) -> OpStatus {
        let record = Multipart::new(req.path.clone(), req.id.clone(), req.time);
        match self.multiparts.insert_or_replace(record.key(), record, false) {
            Ok(_) => OpStatus::Ok,
            Err(_) => OpStatus::Exists,
        }
    }

    fn fsm_append_multipart(&self, req: &AppendMultipartReq) -> OpStatus {
        self.multiparts
            .with_mut(&MultipartKey::new(req.path.clone(), req.id.clone()), |m| {
                if m.insert_part(req.part.clone()) {
                    OpStatus::Ok
                } else {
                    OpStatus::Exists
                }
            })
            .unwrap_or(OpStatus::NotExist)
    }

    fn fsm_remove_multipart(&self, req: &RemoveMultipartReq) -> OpStatus {
        match self
            .multiparts
            .remove(&MultipartKey::new(req.path.clone(), req.id.clone()))
        {
            Some(_) => OpStatus::Ok,
            None => OpStatus::NotExist,
        }
    }

    // ---- version family --------------------------------------------------

    fn fsm_version_prepare(&self, req: &VersionPrepareReq) -> OpStatus {
        self.versions.lock().unwrap().prepare(req.seq, req.time)
    }

    fn fsm_version_commit(&self, req: &VersionSeqReq) -> OpStatus {
        let mut versions = self.versions.lock().unwrap();
        let status = versions.commit(req.seq);
        if status.is_ok() {
            // ver_seq is a monotonic high-water mark
            let committed = versions.committed_seq();
            if committed > self.ver_seq() {
                self.set_ver_seq(committed);
                tracing::info!(seq = committed, "snapshot sequence committed");
            }
        }
        status
    }

    fn fsm_version_delete(&self, req: &VersionSeqReq) -> OpStatus {
        self.versions.lock().unwrap().delete(req.seq)
    }

    // ---- transaction family ----------------------------------------------

    fn fsm_tx_prepare(&self, req: &TxPrepareReq) -> Result<OpStatus, MetaError> {
        if self.txs.is_settled(req.info.tx_id) {
            tracing::warn!(tx = %req.info.tx_id, "prepare for settled transaction");
            return Ok(OpStatus::TxInfoNotExist);
        }
        if req.info.expired_at(req.time) {
            return Ok(OpStatus::TxTimeout);
        }
        for op in &req.ops {
            let status = self.apply_tx_op(&req.info, op)?;
            if !status.is_ok() {
                tracing::warn!(tx = %req.info.tx_id, status = %status, "tx prepare op failed");
                return Ok(status);
            }
        }
        Ok(OpStatus::Ok)
    }

    fn apply_tx_op(&self, info: &TxInfo, op: &TxOp) -> Result<OpStatus, MetaError> {
        match op {
            TxOp::CreateInode(req) => {
                let rb = TxRollbackInode {
                    tx_id: info.tx_id,
                    kind: RollbackKind::Delete,
                    ledger_seq: self.txs.next_ledger_seq(),
                    inode: self.inode_from_req(req),
                    quota_ids: req.quota_ids.clone(),
                };
                match self.txs.add_rollback_inode(rb)? {
                    OpStatus::Exists => return Ok(OpStatus::Ok),
                    OpStatus::Ok => {}
                    other => return Ok(other),
                }
                let status = self.fsm_create_inode(req)?;
                if !status.is_ok() {
                    self.txs.delete_rollback_inode(req.ino, info.tx_id);
                }
                Ok(status)
            }
            TxOp::LinkInode(req) => {
                let Some(pre) = self.inodes.get(&req.ino) else {
                    return Ok(OpStatus::TxInodeInfoNotExist);
                };
                if pre.should_delete() {
                    return Ok(OpStatus::NotExist);
                }
                let rb = TxRollbackInode {
                    tx_id: info.tx_id,
                    kind: RollbackKind::Update,
                    ledger_seq: self.txs.next_ledger_seq(),
                    inode: (*pre).clone(),
                    quota_ids: Vec::new(),
                };
                match self.txs.add_rollback_inode(rb)? {
                    OpStatus::Exists => return Ok(OpStatus::Ok),
                    OpStatus::Ok => {}
                    other => return Ok(other),
                }
                let status = self.fsm_link_inode(req);
                if !status.is_ok() {
                    self.txs.delete_rollback_inode(req.ino, info.tx_id);
                }
                Ok(status)
            }
            TxOp::UnlinkInode(req) => {
                let Some(pre) = self.inodes.get(&req.ino) else {
                    return Ok(OpStatus::TxInodeInfoNotExist);
                };
                if pre.file_type.is_dir() && !self.dir_is_empty(req.ino) {
                    return Ok(OpStatus::NotEmpty);
                }
                let rb = TxRollbackInode {
                    tx_id: info.tx_id,
                    kind: RollbackKind::Add,
                    ledger_seq: self.txs.next_ledger_seq(),
                    inode: (*pre).clone(),
                    quota_ids: pre.quota_ids.clone(),
                };
                match self.txs.add_rollback_inode(rb)? {
                    OpStatus::Exists => return Ok(OpStatus::Ok),
                    OpStatus::Ok => {}
                    other => return Ok(other),
                }
                let status = self.fsm_unlink_inode(req);
                if !status.is_ok() {
                    self.txs.delete_rollback_inode(req.ino, info.tx_id);
                    return Ok(status);
                }
                if info.tx_type == TxType::Rename {
                    self.fsm_evict_inode(&EvictInodeReq {
                        ino: req.ino,
                        time: req.time,
                    });
                }
                Ok(status)
            }
            TxOp::CreateDentry(req) => {
                let Some((parent_nlink, parent_mtime, parent_ctime)) = self.parent_pre(req.parent)
                else {
                    return Ok(OpStatus::NotExist);
                };
                let key = DentryKey::new(req.parent, req.name.clone());
                let (kind, pre_dentry) = match self.dentries.get(&key) {
                    Some(existing) => (RollbackKind::Update, (*existing).clone()),
                    None => (
                        RollbackKind::Delete,
                        Dentry::new(
                            req.parent,
                            req.name.clone(),
                            req.ino,
                            req.file_type,
                            self.ver_seq(),
                        ),
                    ),
                };
                let rb = TxRollbackDentry {
                    tx_id: info.tx_id,
                    kind,
                    ledger_seq: self.txs.next_ledger_seq(),
                    dentry: pre_dentry,
                    parent_nlink,
                    parent_mtime,
                    parent_ctime,
                };
                match self.txs.add_rollback_dentry(rb)? {
                    OpStatus::Exists => return Ok(OpStatus::Ok),
                    OpStatus::Ok => {}
                    other => return Ok(other),
                }
                let status = self.fsm_create_dentry(req);
                if !status.is_ok() {
                    self.txs
                        .delete_rollback_dentry(req.parent, &req.name, info.tx_id);
                }
                Ok(status)
            }
            TxOp::DeleteDentry(req) => {
                let key = DentryKey::new(req.parent, req.name.clone());
                let Some(existing) = self.dentries.get(&key) else {
                    return Ok(OpStatus::TxDentryInfoNotExist);
                };
                if let Some(expected) = req.expected_ino {
                    if existing.inode != expected {
                        return Ok(OpStatus::NotExist);
                    }
                }
                let Some((parent_nlink, parent_mtime, parent_ctime)) = self.parent_pre(req.parent)
                else {
                    return Ok(OpStatus::NotExist);
                };
                let rb = TxRollbackDentry {
                    tx_id: info.tx_id,
                    kind: RollbackKind::Add,
                    ledger_seq: self.txs.next_ledger_seq(),
                    dentry: (*existing).clone(),
                    parent_nlink,
                    parent_mtime,
                    parent_ctime,
                };
                match self.txs.add_rollback_dentry(rb)? {
                    OpStatus::Exists => return Ok(OpStatus::Ok),
                    OpStatus::Ok => {}
                    other => return Ok(other),
                }
                let (status, _) = self.fsm_delete_dentry(req);
                if !status.is_ok() {
                    self.txs
                        .delete_rollback_dentry(req.parent, &req.name, info.tx_id);
                }
                Ok(status)
            }
            TxOp::UpdateDentry(req) => {
                let key = DentryKey::new(req.parent, req.name.clone());
                let Some(existing) = self.dentries.get(&key) else {
                    return Ok(OpStatus::TxDentryInfoNotExist);
                };
                if existing.is_deleted() {
                    return Ok(OpStatus::NotExist);
                }
                let Some((parent_nlink, parent_mtime, parent_ctime)) = self.parent_pre(req.parent)
                else {
                    return Ok(OpStatus::NotExist);
                };
                let rb = TxRollbackDentry {
                    tx_id: info.tx_id,
                    kind: RollbackKind::Update,
                    ledger_seq: self.txs.next_ledger_seq(),
                    dentry: (*existing).clone(),
                    parent_nlink,
                    parent_mtime,
                    parent_ctime,
                };
                match self.txs.add_rollback_dentry(rb)? {
                    OpStatus::Exists => return Ok(OpStatus::Ok),
                    OpStatus::Ok => {}
                    other => return Ok(other),
                }
                let (status, _) = self.fsm_update_dentry(req);
                if !status.is_ok() {
                    self.txs
                        .delete_rollback_dentry(req.parent, &req.name, info.tx_id);
                }
                Ok(status)
            }
        }
    }

    fn parent_pre(&self, parent: InodeId) -> Option<(u32, i64, i64)> {
        self.inodes
            .get(&parent)
            .map(|p| (p.nlink, p.mtime, p.ctime))
    }

    fn fsm_tx_commit(&self, req: &TxSettleReq) -> OpStatus {
        if self.txs.is_settled(req.tx_id) {
            return OpStatus::TxInfoNotExist;
        }
        let dropped = self.txs.take_rollbacks(req.tx_id);
        self.txs.mark_settled(req.tx_id, req.time);
        tracing::info!(tx = %req.tx_id, records = dropped.len(), "transaction committed");
        OpStatus::Ok
    }

    fn fsm_tx_abort(&self, req: &TxSettleReq) -> OpStatus {
        if self.txs.is_settled(req.tx_id) {
            return OpStatus::TxInfoNotExist;
        }
        let records = self.txs.take_rollbacks(req.tx_id);
        let count = records.len();
        for record in records {
            self.apply_rollback(record);
        }
        self.txs.mark_settled(req.tx_id, req.time);
        tracing::info!(tx = %req.tx_id, records = count, "transaction aborted");
        OpStatus::Ok
    }

    fn apply_rollback(&self, record: RollbackRecord) {
        match record {
            RollbackRecord::Inode(rb) => match rb.kind {
                RollbackKind::Delete => {
                    self.inodes.remove(&rb.inode.id);
                    self.xattrs.remove(&rb.inode.id);
                    self.free_list.remove(rb.inode.id);
                    self.tomb_inodes.remove(&rb.inode.id);
                    for qid in &rb.quota_ids {
                        self.quotas.update_used(*qid, 0, -1);
                    }
                }
                RollbackKind::Add | RollbackKind::Update => {
                    // an unlink that killed the file released its accounting
                    let killed = rb.kind == RollbackKind::Add
                        && !rb.inode.file_type.is_dir()
                        && rb.inode.nlink == 1;
                    if killed {
                        self.free_list.remove(rb.inode.id);
                        self.tomb_inodes.remove(&rb.inode.id);
                        for qid in &rb.quota_ids {
                            self.quotas.update_used(*qid, rb.inode.size as i64, 1);
                        }
                        let _ = self
                            .quotas
                            .charge_uid(rb.inode.uid, rb.inode.extents.stored_bytes());
                    }
                    let id = rb.inode.id;
                    let _ = self.inodes.insert_or_replace(id, rb.inode, true);
                }
            },
            RollbackRecord::Dentry(rb) => {
                let parent = rb.dentry.parent_id;
                let key = rb.dentry.key();
                match rb.kind {
                    RollbackKind::Delete => {
                        self.dentries.remove(&key);
                    }
                    RollbackKind::Add | RollbackKind::Update => {
                        self.remove_dentry_tombstones(parent, &rb.dentry.name);
                        let _ = self.dentries.insert_or_replace(key, rb.dentry, true);
                    }
                }
                self.inodes.with_mut(&parent, |p| {
                    p.nlink = rb.parent_nlink;
                    p.mtime = rb.parent_mtime;
                    p.ctime = rb.parent_ctime;
                });
            }
        }
    }

    // ---- quota family ----------------------------------------------------

    fn fsm_set_quota_batch(&self, req: &SetQuotaBatchReq) -> Result<ApplyResult, MetaError> {
        let mut batch = Vec::with_capacity(req.inos.len());
        let mut files = 0i64;
        let mut bytes = 0i64;
        for ino in &req.inos {
            let Some(inode) = self.inodes.get(ino) else {
                batch.push(OpStatus::NotExist);
                continue;
            };
            if inode.should_delete() {
                batch.push(OpStatus::NotExist);
                continue;
            }
            self.xattrs.execute_atomically(|tree| {
                let entry = tree
                    .entry(*ino)
                    .or_insert_with(|| Arc::new(XAttr::new(*ino)));
                let record = Arc::make_mut(entry);
                let mut map = record.quota_map()?;
                let fresh = map
                    .insert(req.quota_id, QuotaBinding { root: req.root })
                    .is_none();
                record.set_quota_map(&map)?;
                if fresh {
                    files += 1;
                    bytes += inode.size as i64;
                }
                Ok::<(), MetaError>(())
            })?;
            self.inodes.with_mut(ino, |i| {
                if !i.quota_ids.contains(&req.quota_id) {
                    i.quota_ids.push(req.quota_id);
                }
            });
            batch.push(OpStatus::Ok);
        }
        self.quotas.update_used(req.quota_id, bytes, files);
        Ok(ApplyResult {
            status: OpStatus::Ok,
            batch,
            old_child: None,
        })
    }

    fn fsm_delete_quota_batch(&self, req: &DeleteQuotaBatchReq) -> Result<ApplyResult, MetaError> {
        let mut batch = Vec::with_capacity(req.inos.len());
        let mut files = 0i64;
        let mut bytes = 0i64;
        for ino in &req.inos {
            let Some(inode) = self.inodes.get(ino) else {
                batch.push(OpStatus::NotExist);
                continue;
            };
            self.xattrs.execute_atomically(|tree| {
                if let Some(entry) = tree.get_mut(ino) {
                    let record = Arc::make_mut(entry);
                    let mut map = record.quota_map()?;
                    if map.remove(&req.quota_id).is_some() {
                        record.set_quota_map(&map)?;
                        files -= 1;
                        bytes -= inode.size as i64;
                    }
                    if record.is_empty() {
                        tree.remove(ino);
                    }
                }
                Ok::<(), MetaError>(())
            })?;
            self.inodes.with_mut(ino, |i| {
                i.quota_ids.retain(|q| *q != req.quota_id);
            });
            batch.push(OpStatus::Ok);
        }
        self.quotas.update_used(req.quota_id, bytes, files);
        Ok(ApplyResult {
            status: OpStatus::Ok,
            batch,
            old_child: None,
        })
    }
}
