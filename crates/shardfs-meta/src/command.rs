//! Replicated command set and its stable binary envelope.
//!
//! A command on the wire is `{op_tag: u8} ++ {bincode payload}`. The tag
//! values are frozen; payload schemas evolve only by appending commands. The
//! dispatcher matches exhaustively on the decoded tagged union, so a new
//! command cannot be silently ignored.

use serde::{Deserialize, Serialize};

use crate::dentry::DentryTombKey;
use crate::extent::{ExtentKey, ObjExtentKey};
use crate::multipart::MultipartPart;
use crate::transaction::TxInfo;
use crate::types::{FileType, InodeId, MetaError, QuotaId, TxId};

/// Payload of `CreateInode`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInodeReq {
    /// Master-allocated inode id; uniqueness is the allocator's invariant.
    pub ino: InodeId,
    /// Type of the new inode.
    pub file_type: FileType,
    /// Permission bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Target bytes, iff symlink.
    pub symlink_target: Option<Vec<u8>>,
    /// Quota ids the new inode is born into.
    pub quota_ids: Vec<QuotaId>,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `LinkInode`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInodeReq {
    /// Target inode.
    pub ino: InodeId,
    /// Client retry id; 0 disables replay suppression.
    pub uniq_id: u64,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `UnlinkInode`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkInodeReq {
    /// Target inode.
    pub ino: InodeId,
    /// 0 unlinks the live layer; a snapshot sequence splices that layer out.
    pub seq: u64,
    /// Client retry id; 0 disables replay suppression.
    pub uniq_id: u64,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `EvictInode`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictInodeReq {
    /// Target inode.
    pub ino: InodeId,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `Truncate`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateReq {
    /// Target inode.
    pub ino: InodeId,
    /// New size in bytes.
    pub size: u64,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `AppendExtents`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendExtentsReq {
    /// Target inode.
    pub ino: InodeId,
    /// Extents to splice into the live layer.
    pub extents: Vec<ExtentKey>,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `AppendExtentsChecked`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendExtentsCheckedReq {
    /// Target inode.
    pub ino: InodeId,
    /// The proposed extent.
    pub extent: ExtentKey,
    /// Prior keys the writer claims to supersede.
    pub discard: Vec<ExtentKey>,
    /// Record into the current snapshot layer without merging.
    pub is_split: bool,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `AppendObjExtents`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendObjExtentsReq {
    /// Target inode.
    pub ino: InodeId,
    /// Object-backed extents to append.
    pub extents: Vec<ObjExtentKey>,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `ClearInodeCache`, `ExtentsEmpty` and `DelVerExtents`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeOnlyReq {
    /// Target inode.
    pub ino: InodeId,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `SetAttr`; `None` fields stay untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttrReq {
    /// Target inode.
    pub ino: InodeId,
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner uid.
    pub uid: Option<u32>,
    /// New owner gid.
    pub gid: Option<u32>,
    /// New access time.
    pub atime: Option<i64>,
    /// New modification time.
    pub mtime: Option<i64>,
    /// Proposer-captured time, seconds (ctime stamp).
    pub time: i64,
}

/// Payload of the batch inode commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInodeReq {
    /// Target inodes, applied in order.
    pub inos: Vec<InodeId>,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `InternalDeleteBatch`: hard-delete work discovered by the
/// reclaimer and routed back through the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalDeleteBatchReq {
    /// Inodes whose grace period elapsed.
    pub inos: Vec<InodeId>,
    /// Dentry tombstones past their TTL.
    pub dentry_tombstones: Vec<DentryTombKey>,
    /// Settled transactions older than this are dropped from the idempotency
    /// table; 0 skips pruning.
    pub prune_settled_before: i64,
}

/// Payload of `CreateDentry`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDentryReq {
    /// Parent directory inode.
    pub parent: InodeId,
    /// Entry name.
    pub name: String,
    /// Child inode to bind.
    pub ino: InodeId,
    /// Child type.
    pub file_type: FileType,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `DeleteDentry`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDentryReq {
    /// Parent directory inode.
    pub parent: InodeId,
    /// Entry name.
    pub name: String,
    /// Guard against races: the delete only applies if the entry still binds
    /// this child.
    pub expected_ino: Option<InodeId>,
    /// 0 deletes the live layer; a snapshot sequence splices that layer out.
    pub seq: u64,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `UpdateDentry`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDentryReq {
    /// Parent directory inode.
    pub parent: InodeId,
    /// Entry name.
    pub name: String,
    /// New child inode.
    pub ino: InodeId,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `SetXattr`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetXattrReq {
    /// Target inode.
    pub ino: InodeId,
    /// Attribute name.
    pub name: String,
    /// Attribute value bytes.
    pub value: Vec<u8>,
}

/// Payload of `RemoveXattr`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveXattrReq {
    /// Target inode.
    pub ino: InodeId,
    /// Attribute name.
    pub name: String,
}

/// Payload of `InitMultipart`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMultipartReq {
    /// Object path.
    pub path: String,
    /// Upload id.
    pub id: String,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `AppendMultipart`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendMultipartReq {
    /// Object path.
    pub path: String,
    /// Upload id.
    pub id: String,
    /// The uploaded part.
    pub part: MultipartPart,
}

/// Payload of `RemoveMultipart`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMultipartReq {
    /// Object path.
    pub path: String,
    /// Upload id.
    pub id: String,
}

/// Payload of `VersionPrepare`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPrepareReq {
    /// The announced snapshot sequence.
    pub seq: u64,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `VersionCommit` and `VersionDelete`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSeqReq {
    /// Target snapshot sequence.
    pub seq: u64,
}

/// One forward mutation inside a transaction prepare.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    /// Create an inode; rollback stages a delete.
    CreateInode(CreateInodeReq),
    /// Add a link; rollback stages the pre-image.
    LinkInode(LinkInodeReq),
    /// Remove a link; rollback stages the pre-image.
    UnlinkInode(UnlinkInodeReq),
    /// Create a dentry; rollback stages a delete.
    CreateDentry(CreateDentryReq),
    /// Delete a dentry; rollback stages the pre-image.
    DeleteDentry(DeleteDentryReq),
    /// Rebind a dentry; rollback stages the prior child.
    UpdateDentry(UpdateDentryReq),
}

/// Payload of `TxPrepare`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPrepareReq {
    /// Coordinator-issued transaction metadata.
    pub info: TxInfo,
    /// Forward mutations this participant applies speculatively.
    pub ops: Vec<TxOp>,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `TxCommit` and `TxAbort`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSettleReq {
    /// Target transaction.
    pub tx_id: TxId,
    /// Proposer-captured time, seconds.
    pub time: i64,
}

/// Payload of `SetQuotaBatch`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetQuotaBatchReq {
    /// Quota to bind.
    pub quota_id: QuotaId,
    /// Inodes to bind it to.
    pub inos: Vec<InodeId>,
    /// Whether these inodes are quota-subtree roots.
    pub root: bool,
}

/// Payload of `DeleteQuotaBatch`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteQuotaBatchReq {
    /// Quota to unbind.
    pub quota_id: QuotaId,
    /// Inodes to unbind it from.
    pub inos: Vec<InodeId>,
}

/// The replicated command set, one variant per op tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Create an inode.
    CreateInode(CreateInodeReq),
    /// Increment an inode's link count.
    LinkInode(LinkInodeReq),
    /// Decrement an inode's link count / splice a snapshot layer.
    UnlinkInode(UnlinkInodeReq),
    /// Mark a zero-linked inode for teardown.
    EvictInode(EvictInodeReq),
    /// Cut a regular file at a new size.
    Truncate(TruncateReq),
    /// Splice extents into the live layer.
    AppendExtents(AppendExtentsReq),
    /// Conflict-checked extent append.
    AppendExtentsChecked(AppendExtentsCheckedReq),
    /// Append object-backed extents.
    AppendObjExtents(AppendObjExtentsReq),
    /// Drop the cached extent list, reclaiming the keys.
    ClearInodeCache(InodeOnlyReq),
    /// Apply attribute changes.
    SetAttr(SetAttrReq),
    /// Unlink several inodes.
    BatchUnlink(BatchInodeReq),
    /// Evict several inodes.
    BatchEvict(BatchInodeReq),
    /// Hard-delete one inode after its grace period.
    InternalDelete(InodeOnlyReq),
    /// Hard-delete a reclaimer batch.
    InternalDeleteBatch(InternalDeleteBatchReq),
    /// Datalake path: drop all live extents, releasing quota.
    ExtentsEmpty(InodeOnlyReq),
    /// Snapshot path: drop all live extents without touching quota.
    DelVerExtents(InodeOnlyReq),
    /// Create a directory entry.
    CreateDentry(CreateDentryReq),
    /// Delete a directory entry.
    DeleteDentry(DeleteDentryReq),
    /// Rebind a directory entry to a new child.
    UpdateDentry(UpdateDentryReq),
    /// Delete several directory entries.
    BatchDeleteDentry(Vec<DeleteDentryReq>),
    /// Set one extended attribute.
    SetXattr(SetXattrReq),
    /// Remove one extended attribute.
    RemoveXattr(RemoveXattrReq),
    /// Start a multipart upload.
    InitMultipart(InitMultipartReq),
    /// Record an uploaded part.
    AppendMultipart(AppendMultipartReq),
    /// Drop a multipart upload record.
    RemoveMultipart(RemoveMultipartReq),
    /// Announce a snapshot sequence.
    VersionPrepare(VersionPrepareReq),
    /// Commit a snapshot sequence.
    VersionCommit(VersionSeqReq),
    /// Delete a snapshot sequence.
    VersionDelete(VersionSeqReq),
    /// Transaction prepare: forward ops + rollback staging.
    TxPrepare(TxPrepareReq),
    /// Transaction commit: drop rollback records.
    TxCommit(TxSettleReq),
    /// Transaction abort: replay rollback records LIFO.
    TxAbort(TxSettleReq),
    /// Bind a quota to inodes.
    SetQuotaBatch(SetQuotaBatchReq),
    /// Unbind a quota from inodes.
    DeleteQuotaBatch(DeleteQuotaBatchReq),
}

macro_rules! op_tags {
    ($(($variant:ident, $tag:literal)),+ $(,)?) => {
        impl Command {
            /// Stable wire tag of this command.
            pub fn op_tag(&self) -> u8 {
                match self {
                    $(Command::$variant(_) => $tag,)+
                }
            }

            /// Encodes the command as `{op_tag} ++ {bincode payload}`.
            pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
                let payload = match self {
                    $(Command::$variant(req) => {
                        bincode::serialize(req).map_err(|e| MetaError::Codec(e.to_string()))?
                    })+
                };
                let mut buf = Vec::with_capacity(payload.len() + 1);
                buf.push(self.op_tag());
                buf.extend_from_slice(&payload);
                Ok(buf)
            }

            /// Decodes a command envelope.
            pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
                let (&tag, payload) = bytes
                    .split_first()
                    .ok_or_else(|| MetaError::Codec("empty command envelope".to_string()))?;
                match tag {
                    $($tag => {
                        let req = bincode::deserialize(payload)
                            .map_err(|e| MetaError::Codec(e.to_string()))?;
                        Ok(Command::$variant(req))
                    })+
                    other => Err(MetaError::UnknownOp(other)),
                }
            }
        }
    };
}

op_tags! {
    (CreateInode, 1),
    (LinkInode, 2),
    (UnlinkInode, 3),
    (EvictInode, 4),
    (Truncate, 5),
    (AppendExtents, 6),
    (AppendExtentsChecked, 7),
    (AppendObjExtents, 8),
    (ClearInodeCache, 9),
    (SetAttr, 10),
    (BatchUnlink, 11),
    (BatchEvict, 12),
    (InternalDelete, 13),
    (InternalDeleteBatch, 14),
    (ExtentsEmpty, 15),
    (DelVerExtents, 16),
    (CreateDentry, 20),
    (DeleteDentry, 21),
    (UpdateDentry, 22),
    (BatchDeleteDentry, 23),
    (SetXattr, 30),
    (RemoveXattr, 31),
    (InitMultipart, 35),
    (AppendMultipart, 36),
    (RemoveMultipart, 37),
    (VersionPrepare, 40),
    (VersionCommit, 41),
    (VersionDelete, 42),
    (TxPrepare, 50),
    (TxCommit, 51),
    (TxAbort, 52),
    (SetQuotaBatch, 60),
    (DeleteQuotaBatch, 61),
}
