//! Two-phase transaction overlay: rollback ledger and idempotency table.
//!
//! A participant's prepare applies the forward mutation speculatively and
//! stages the inverse action here, keyed by entity and transaction id. Commit
//! drops the records; abort replays them newest-first. The settled table makes
//! every phase replay-safe under log replay and peer retransmission.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::dentry::Dentry;
use crate::inode::Inode;
use crate::types::{InodeId, MetaError, OpStatus, QuotaId, TxId};

/// What kind of cross-partition operation the transaction performs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    /// Create an entity with a parent update elsewhere.
    Create,
    /// Add a hard link across shards.
    Link,
    /// Remove an entity with a parent update elsewhere.
    Remove,
    /// Move an entry between directories.
    Rename,
}

/// Coordinator-issued transaction metadata shipped with every phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInfo {
    /// Globally unique transaction id.
    pub tx_id: TxId,
    /// Operation class.
    pub tx_type: TxType,
    /// Creation time at the coordinator, seconds.
    pub created_at: i64,
    /// Seconds the prepare stays acceptable after creation.
    pub timeout_secs: i64,
}

impl TxInfo {
    /// True when a prepare arriving at `now` is past the coordinator deadline.
    pub fn expired_at(&self, now: i64) -> bool {
        now - self.created_at > self.timeout_secs
    }
}

/// Inverse action staged for one entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackKind {
    /// Re-insert the stored pre-image (forward op removed the entity).
    Add,
    /// Restore the stored prior binding (forward op updated it).
    Update,
    /// Remove the entity (forward op created it).
    Delete,
}

/// Rollback record for an inode mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRollbackInode {
    /// Owning transaction.
    pub tx_id: TxId,
    /// Inverse action.
    pub kind: RollbackKind,
    /// Position in the partition-wide ledger; abort replays descending.
    pub ledger_seq: u64,
    /// Pre-image of the inode.
    pub inode: Inode,
    /// Quota ids charged at the time of the forward op.
    pub quota_ids: Vec<QuotaId>,
}

/// Rollback record for a dentry mutation, including the parent pre-image
/// needed to restore link accounting exactly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRollbackDentry {
    /// Owning transaction.
    pub tx_id: TxId,
    /// Inverse action.
    pub kind: RollbackKind,
    /// Position in the partition-wide ledger; abort replays descending.
    pub ledger_seq: u64,
    /// Pre-image of the dentry.
    pub dentry: Dentry,
    /// Parent link count before the forward op.
    pub parent_nlink: u32,
    /// Parent mtime before the forward op.
    pub parent_mtime: i64,
    /// Parent ctime before the forward op.
    pub parent_ctime: i64,
}

/// A staged rollback of either entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackRecord {
    /// Inode rollback.
    Inode(TxRollbackInode),
    /// Dentry rollback.
    Dentry(TxRollbackDentry),
}

impl RollbackRecord {
    fn ledger_seq(&self) -> u64 {
        match self {
            RollbackRecord::Inode(r) => r.ledger_seq,
            RollbackRecord::Dentry(r) => r.ledger_seq,
        }
    }
}

/// Terminal record of a settled transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledTx {
    /// When the commit or abort was applied, seconds.
    pub settled_at: i64,
}

/// Serializable image of the transaction state, for partition snapshots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxSnapshot {
    /// Next ledger sequence.
    pub ledger_seq: u64,
    /// Staged inode rollbacks.
    pub inodes: Vec<TxRollbackInode>,
    /// Staged dentry rollbacks.
    pub dentries: Vec<TxRollbackDentry>,
    /// Settled transaction ids.
    pub settled: Vec<(TxId, SettledTx)>,
}

/// Per-partition transaction state: rollback ledger plus idempotency table.
pub struct TransactionManager {
    ledger_seq: AtomicU64,
    rb_inodes: Mutex<BTreeMap<(InodeId, TxId), TxRollbackInode>>,
    rb_dentries: Mutex<BTreeMap<(InodeId, String, TxId), TxRollbackDentry>>,
    settled: Mutex<BTreeMap<TxId, SettledTx>>,
}

impl TransactionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            ledger_seq: AtomicU64::new(0),
            rb_inodes: Mutex::new(BTreeMap::new()),
            rb_dentries: Mutex::new(BTreeMap::new()),
            settled: Mutex::new(BTreeMap::new()),
        }
    }

    /// Claims the next ledger position. Called in apply order only, so the
    /// sequence is deterministic across replicas.
    pub fn next_ledger_seq(&self) -> u64 {
        self.ledger_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// True once the transaction has committed or aborted here.
    pub fn is_settled(&self, tx_id: TxId) -> bool {
        self.settled.lock().unwrap().contains_key(&tx_id)
    }

    /// Records the terminal state of a transaction.
    pub fn mark_settled(&self, tx_id: TxId, settled_at: i64) {
        self.settled
            .lock()
            .unwrap()
            .insert(tx_id, SettledTx { settled_at });
    }

    /// Returns the transaction currently claiming the inode, if any.
    pub fn inode_claimed_by(&self, ino: InodeId) -> Option<TxId> {
        let rbs = self.rb_inodes.lock().unwrap();
        rbs.range((ino, TxId::new(0))..=(ino, TxId::new(u64::MAX)))
            .next()
            .map(|((_, tx), _)| *tx)
    }

    /// Returns the transaction currently claiming the dentry, if any.
    pub fn dentry_claimed_by(&self, parent: InodeId, name: &str) -> Option<TxId> {
        let rbs = self.rb_dentries.lock().unwrap();
        rbs.range(
            (parent, name.to_string(), TxId::new(0))..=(parent, name.to_string(), TxId::new(u64::MAX)),
        )
        .next()
        .map(|((_, _, tx), _)| *tx)
    }

    /// Stages an inode rollback.
    ///
    /// A byte-identical record already present means the prepare is a replay
    /// (`Exists`); the same slot holding different content is a serialization
    /// invariant violation and fatal. A different transaction claiming the
    /// inode yields `TxConflict`.
    pub fn add_rollback_inode(&self, rb: TxRollbackInode) -> Result<OpStatus, MetaError> {
        if let Some(other) = self.inode_claimed_by(rb.inode.id) {
            if other != rb.tx_id {
                return Ok(OpStatus::TxConflict);
            }
        }
        let mut rbs = self.rb_inodes.lock().unwrap();
        let key = (rb.inode.id, rb.tx_id);
        if let Some(existing) = rbs.get(&key) {
            if existing.kind == rb.kind && existing.inode == rb.inode {
                return Ok(OpStatus::Exists);
            }
            return Err(MetaError::Fatal(format!(
                "rollback ledger double-entry for inode {} {}",
                rb.inode.id, rb.tx_id
            )));
        }
        rbs.insert(key, rb);
        Ok(OpStatus::Ok)
    }

    /// Stages a dentry rollback; same contract as [`Self::add_rollback_inode`].
    pub fn add_rollback_dentry(&self, rb: TxRollbackDentry) -> Result<OpStatus, MetaError> {
        if let Some(other) = self.dentry_claimed_by(rb.dentry.parent_id, &rb.dentry.name) {
            if other != rb.tx_id {
                return Ok(OpStatus::TxConflict);
            }
        }
        let mut rbs = self.rb_dentries.lock().unwrap();
        let key = (rb.dentry.parent_id, rb.dentry.name.clone(), rb.tx_id);
        if let Some(existing) = rbs.get(&key) {
            if existing.kind == rb.kind && existing.dentry == rb.dentry {
                return Ok(OpStatus::Exists);
            }
            return Err(MetaError::Fatal(format!(
                "rollback ledger double-entry for dentry ({}, {}) {}",
                rb.dentry.parent_id, rb.dentry.name, rb.tx_id
            )));
        }
        rbs.insert(key, rb);
        Ok(OpStatus::Ok)
    }

    /// Deletes one staged inode rollback (deferred cleanup after a failed
    /// forward op, or selective commit).
    pub fn delete_rollback_inode(&self, ino: InodeId, tx_id: TxId) {
        self.rb_inodes.lock().unwrap().remove(&(ino, tx_id));
    }

    /// Deletes one staged dentry rollback.
    pub fn delete_rollback_dentry(&self, parent: InodeId, name: &str, tx_id: TxId) {
        self.rb_dentries
            .lock()
            .unwrap()
            .remove(&(parent, name.to_string(), tx_id));
    }

    /// Removes and returns every record of the transaction, newest-first
    /// (LIFO replay order for abort).
    pub fn take_rollbacks(&self, tx_id: TxId) -> Vec<RollbackRecord> {
        let mut records = Vec::new();
        {
            let mut rbs = self.rb_inodes.lock().unwrap();
            let keys: Vec<_> = rbs
                .iter()
                .filter(|((_, tx), _)| *tx == tx_id)
                .map(|(k, _)| k.clone())
                .collect();
            for k in keys {
                if let Some(rb) = rbs.remove(&k) {
                    records.push(RollbackRecord::Inode(rb));
                }
            }
        }
        {
            let mut rbs = self.rb_dentries.lock().unwrap();
            let keys: Vec<_> = rbs
                .iter()
                .filter(|((_, _, tx), _)| *tx == tx_id)
                .map(|(k, _)| k.clone())
                .collect();
            for k in keys {
                if let Some(rb) = rbs.remove(&k) {
                    records.push(RollbackRecord::Dentry(rb));
                }
            }
        }
        records.sort_by(|a, b| b.ledger_seq().cmp(&a.ledger_seq()));
        records
    }

    /// Number of staged records across both ledgers.
    pub fn staged_count(&self) -> usize {
        self.rb_inodes.lock().unwrap().len() + self.rb_dentries.lock().unwrap().len()
    }

    /// Prunes settled entries older than `ttl_secs`, keeping the table bounded.
    pub fn prune_settled(&self, now: i64, ttl_secs: i64) -> usize {
        self.prune_settled_before(now - ttl_secs)
    }

    /// Drops settled entries whose terminal state is older than `cutoff`.
    /// Driven through the log so every replica prunes identically.
    pub fn prune_settled_before(&self, cutoff: i64) -> usize {
        let mut settled = self.settled.lock().unwrap();
        let before = settled.len();
        settled.retain(|_, s| s.settled_at > cutoff);
        let removed = before - settled.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned settled transactions");
        }
        removed
    }

    /// Exports the full state for a partition snapshot.
    pub fn export(&self) -> TxSnapshot {
        TxSnapshot {
            ledger_seq: self.ledger_seq.load(Ordering::SeqCst),
            inodes: self.rb_inodes.lock().unwrap().values().cloned().collect(),
            dentries: self.rb_dentries.lock().unwrap().values().cloned().collect(),
            settled: self
                .settled
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
        }
    }

    /// Replaces the full state from a partition snapshot.
    pub fn import(&self, snap: TxSnapshot) {
        self.ledger_seq.store(snap.ledger_seq, Ordering::SeqCst);
        let mut inodes = self.rb_inodes.lock().unwrap();
        inodes.clear();
        for rb in snap.inodes {
            inodes.insert((rb.inode.id, rb.tx_id), rb);
        }
        let mut dentries = self.rb_dentries.lock().unwrap();
        dentries.clear();
        for rb in snap.dentries {
            dentries.insert((rb.dentry.parent_id, rb.dentry.name.clone(), rb.tx_id), rb);
        }
        let mut settled = self.settled.lock().unwrap();
        settled.clear();
        settled.extend(snap.settled);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileType;

    fn rb_inode(tx: u64, ino: u64, seq: u64) -> TxRollbackInode {
        TxRollbackInode {
            tx_id: TxId::new(tx),
            kind: RollbackKind::Delete,
            ledger_seq: seq,
            inode: Inode::new(InodeId::new(ino), FileType::Regular, 0o644, 0, 0, 100),
            quota_ids: Vec::new(),
        }
    }

    fn rb_dentry(tx: u64, parent: u64, name: &str, seq: u64) -> TxRollbackDentry {
        TxRollbackDentry {
            tx_id: TxId::new(tx),
            kind: RollbackKind::Add,
            ledger_seq: seq,
            dentry: Dentry::new(
                InodeId::new(parent),
                name,
                InodeId::new(42),
                FileType::Regular,
                0,
            ),
            parent_nlink: 3,
            parent_mtime: 100,
            parent_ctime: 100,
        }
    }

    #[test]
    fn test_add_rollback_then_replay_is_exists() {
        let tm = TransactionManager::new();
        let rb = rb_inode(1, 10, 1);
        assert_eq!(tm.add_rollback_inode(rb.clone()).unwrap(), OpStatus::Ok);
        assert_eq!(tm.add_rollback_inode(rb).unwrap(), OpStatus::Exists);
        assert_eq!(tm.staged_count(), 1);
    }

    #[test]
    fn test_double_entry_with_different_content_is_fatal() {
        let tm = TransactionManager::new();
        tm.add_rollback_inode(rb_inode(1, 10, 1)).unwrap();
        let mut other = rb_inode(1, 10, 2);
        other.kind = RollbackKind::Add;
        assert!(tm.add_rollback_inode(other).is_err());
    }

    #[test]
    fn test_foreign_tx_claim_conflicts() {
        let tm = TransactionManager::new();
        tm.add_rollback_inode(rb_inode(1, 10, 1)).unwrap();
        assert_eq!(
            tm.add_rollback_inode(rb_inode(2, 10, 2)).unwrap(),
            OpStatus::TxConflict
        );
        assert_eq!(tm.inode_claimed_by(InodeId::new(10)), Some(TxId::new(1)));
    }

    #[test]
    fn test_dentry_claim_lookup() {
        let tm = TransactionManager::new();
        tm.add_rollback_dentry(rb_dentry(5, 1, "x", 1)).unwrap();
        assert_eq!(tm.dentry_claimed_by(InodeId::new(1), "x"), Some(TxId::new(5)));
        assert!(tm.dentry_claimed_by(InodeId::new(1), "y").is_none());
    }

    #[test]
    fn test_take_rollbacks_lifo() {
        let tm = TransactionManager::new();
        tm.add_rollback_inode(rb_inode(7, 10, 1)).unwrap();
        tm.add_rollback_dentry(rb_dentry(7, 1, "x", 2)).unwrap();
        tm.add_rollback_inode(rb_inode(7, 11, 3)).unwrap();

        let records = tm.take_rollbacks(TxId::new(7));
        let seqs: Vec<u64> = records.iter().map(|r| r.ledger_seq()).collect();
        assert_eq!(seqs, vec![3, 2, 1]);
        assert_eq!(tm.staged_count(), 0);
    }

    #[test]
    fn test_take_rollbacks_only_named_tx() {
        let tm = TransactionManager::new();
        tm.add_rollback_inode(rb_inode(1, 10, 1)).unwrap();
        tm.add_rollback_inode(rb_inode(2, 11, 2)).unwrap();
        let records = tm.take_rollbacks(TxId::new(1));
        assert_eq!(records.len(), 1);
        assert_eq!(tm.staged_count(), 1);
    }

    #[test]
    fn test_settled_and_prune() {
        let tm = TransactionManager::new();
        tm.mark_settled(TxId::new(1), 100);
        tm.mark_settled(TxId::new(2), 900);
        assert!(tm.is_settled(TxId::new(1)));

        let removed = tm.prune_settled(1000, 500);
        assert_eq!(removed, 1);
        assert!(!tm.is_settled(TxId::new(1)));
        assert!(tm.is_settled(TxId::new(2)));
    }

    #[test]
    fn test_export_import_roundtrip() {
        let tm = TransactionManager::new();
        tm.next_ledger_seq();
        tm.add_rollback_inode(rb_inode(1, 10, 1)).unwrap();
        tm.add_rollback_dentry(rb_dentry(1, 2, "n", 2)).unwrap();
        tm.mark_settled(TxId::new(9), 100);

        let snap = tm.export();
        let other = TransactionManager::new();
        other.import(snap);

        assert_eq!(other.staged_count(), 2);
        assert!(other.is_settled(TxId::new(9)));
        assert_eq!(other.next_ledger_seq(), 2);
    }

    #[test]
    fn test_tx_info_expiry() {
        let info = TxInfo {
            tx_id: TxId::new(1),
            tx_type: TxType::Rename,
            created_at: 100,
            timeout_secs: 60,
        };
        assert!(!info.expired_at(160));
        assert!(info.expired_at(161));
    }
}
