//! Partition configuration and tuned constants.

use serde::{Deserialize, Serialize};

use crate::types::{InodeId, PartitionId};

/// Static configuration of a metadata partition.
///
/// A process hosts many partitions; each carries its own config and owns its
/// own locks, indexes and channels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Identifier of this partition.
    pub partition_id: PartitionId,
    /// First inode id owned by this partition (inclusive).
    pub start_ino: InodeId,
    /// End of the owned inode range (exclusive).
    pub end_ino: InodeId,
    /// Capacity of the bounded extent-reclaim channel.
    pub reclaim_channel_capacity: usize,
    /// Minimum age of a free-list entry before its extents are torn down.
    pub free_list_min_age_secs: i64,
    /// Age after which a dentry tombstone becomes prunable.
    pub dentry_tombstone_ttl_secs: i64,
    /// Age after which a settled transaction id may be pruned.
    pub tx_settled_ttl_secs: i64,
    /// Seconds a prepared transaction stays acceptable after creation.
    pub tx_timeout_secs: i64,
    /// Maximum free-list entries handled per reclaimer pass.
    pub reclaim_max_items_per_pass: usize,
    /// Window of client retry ids remembered for link/unlink replay detection.
    pub uniq_id_window: usize,
}

impl PartitionConfig {
    /// Creates a config for the given partition and inode range with default tuning.
    pub fn new(partition_id: PartitionId, start_ino: InodeId, end_ino: InodeId) -> Self {
        Self {
            partition_id,
            start_ino,
            end_ino,
            ..Self::default()
        }
    }

    /// Returns true if the inode id belongs to this partition's range.
    pub fn owns_inode(&self, ino: InodeId) -> bool {
        ino >= self.start_ino && ino < self.end_ino
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_id: PartitionId::new(0),
            start_ino: InodeId::new(1),
            end_ino: InodeId::new(u64::MAX),
            reclaim_channel_capacity: 4096,
            free_list_min_age_secs: 7 * 24 * 3600,
            dentry_tombstone_ttl_secs: 24 * 3600,
            tx_settled_ttl_secs: 3600,
            tx_timeout_secs: 60,
            reclaim_max_items_per_pass: 10_000,
            uniq_id_window: 4096,
        }
    }
}
