//! Core identifier types, the per-operation status set and the crate error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an inode within the filesystem namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// Creates a new InodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next inode id, used as an exclusive range bound.
    pub fn next(&self) -> Self {
        InodeId(self.0 + 1)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a metadata partition (a shard of the namespace).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(u64);

impl PartitionId {
    /// Creates a new PartitionId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        PartitionId(id)
    }

    /// Returns the raw u64 value of this partition ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a cross-partition transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(u64);

impl TxId {
    /// Creates a new TxId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        TxId(id)
    }

    /// Returns the raw u64 value of this transaction ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Identifier of a directory quota.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaId(u32);

impl QuotaId {
    /// Creates a new QuotaId from a raw u32 value.
    pub fn new(id: u32) -> Self {
        QuotaId(id)
    }

    /// Returns the raw u32 value of this quota ID.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for QuotaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// High-level file type stored in inodes and directory entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file with data extents.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Device nodes, fifos, sockets — carried but not interpreted.
    Other,
}

impl FileType {
    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true for regular files.
    pub fn is_regular(&self) -> bool {
        matches!(self, FileType::Regular)
    }
}

/// Per-operation status byte returned by every state-machine handler.
///
/// This is a closed set; the replication layer ships the raw byte back to the
/// caller unchanged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpStatus {
    /// Success, including idempotent replays that found nothing to do.
    #[default]
    Ok = 0,
    /// Target already exists with different content.
    Exists = 1,
    /// Target does not exist or is marked deleted.
    NotExist = 2,
    /// Directory is not empty.
    NotEmpty = 3,
    /// Request is inconsistent with the target's type or fields.
    ArgMismatch = 4,
    /// Inode id falls outside the partition's allocation range.
    InodeFull = 5,
    /// Owner's space accounting limit exhausted.
    NoSpace = 6,
    /// Operation not permitted on this target.
    NotPerm = 7,
    /// Proposed extent overlaps an existing extent with a different key.
    ConflictExtents = 8,
    /// A bound directory quota is exhausted.
    DirQuotaExceeded = 9,
    /// Transaction already settled; nothing to do.
    TxInfoNotExist = 10,
    /// Transaction metadata does not name this dentry.
    TxDentryInfoNotExist = 11,
    /// Transaction metadata does not name this inode.
    TxInodeInfoNotExist = 12,
    /// Entity is claimed by a different in-flight transaction.
    TxConflict = 13,
    /// Transaction expired before the participant saw the prepare.
    TxTimeout = 14,
    /// Extent overlaps itself at a different range; retry with a fresh extent.
    TryOtherExtent = 15,
    /// Invariant violation; the replica must halt.
    Internal = 16,
}

impl OpStatus {
    /// Returns the wire byte for this status.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Decodes a wire byte back into a status.
    pub fn from_u8(b: u8) -> Option<Self> {
        use OpStatus::*;
        Some(match b {
            0 => Ok,
            1 => Exists,
            2 => NotExist,
            3 => NotEmpty,
            4 => ArgMismatch,
            5 => InodeFull,
            6 => NoSpace,
            7 => NotPerm,
            8 => ConflictExtents,
            9 => DirQuotaExceeded,
            10 => TxInfoNotExist,
            11 => TxDentryInfoNotExist,
            12 => TxInodeInfoNotExist,
            13 => TxConflict,
            14 => TxTimeout,
            15 => TryOtherExtent,
            16 => Internal,
            _ => return None,
        })
    }

    /// Returns true for `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, OpStatus::Ok)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors raised outside the per-operation status channel.
///
/// These are infrastructure or invariant failures: an `Err` from the FSM means
/// the replica can no longer guarantee convergence and must halt.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Payload or snapshot bytes failed to (de)serialize.
    #[error("codec error: {0}")]
    Codec(String),

    /// Snapshot stream is structurally invalid.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// A serialization invariant was violated by handler logic.
    #[error("fsm invariant violated: {0}")]
    Fatal(String),

    /// Command carried an op tag outside the known set.
    #[error("unknown op tag {0}")]
    UnknownOp(u8),
}
