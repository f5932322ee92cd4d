//! Deferred inode teardown: the free-list, the async extent-reclaim conveyor
//! and the background reclaimer pass.
//!
//! Reclaim events are best-effort hints; the receiver deduplicates by extent
//! key and the free-list is re-derived from the inode index on restart, so
//! dropping events under pressure is safe. The channel therefore never blocks
//! the state machine: on overflow events divert to a side queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::config::PartitionConfig;
use crate::dentry::DentryTombKey;
use crate::extent::ExtentKey;
use crate::partition::MetaPartition;
use crate::types::{InodeId, PartitionId};

/// One batch of extent keys whose data bytes may be freed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimEvent {
    /// Partition that owned the extents.
    pub partition_id: PartitionId,
    /// Extent keys to tear down.
    pub extents: Vec<ExtentKey>,
}

/// Bounded MPSC conveyor toward the data-store client.
pub struct ReclaimChannel {
    partition_id: PartitionId,
    tx: mpsc::Sender<ReclaimEvent>,
    overflow: Mutex<VecDeque<ReclaimEvent>>,
}

impl ReclaimChannel {
    /// Creates the channel with the given capacity, returning the consumer end.
    pub fn new(partition_id: PartitionId, capacity: usize) -> (Self, mpsc::Receiver<ReclaimEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                partition_id,
                tx,
                overflow: Mutex::new(VecDeque::new()),
            },
            rx,
        )
    }

    /// Emits a batch of extent keys without ever blocking the caller.
    pub fn send(&self, extents: Vec<ExtentKey>) {
        if extents.is_empty() {
            return;
        }
        let event = ReclaimEvent {
            partition_id: self.partition_id,
            extents,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event))
            | Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(
                    partition = %self.partition_id,
                    extents = event.extents.len(),
                    "reclaim channel saturated, diverting to overflow queue"
                );
                self.overflow.lock().unwrap().push_back(event);
            }
        }
    }

    /// Retries queued overflow events; returns how many were delivered.
    pub fn flush_overflow(&self) -> usize {
        let mut overflow = self.overflow.lock().unwrap();
        let mut delivered = 0;
        while let Some(event) = overflow.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(event))
                | Err(mpsc::error::TrySendError::Closed(event)) => {
                    overflow.push_front(event);
                    break;
                }
            }
        }
        delivered
    }

    /// Number of events parked in the overflow queue.
    pub fn overflow_len(&self) -> usize {
        self.overflow.lock().unwrap().len()
    }
}

struct FreeEntry {
    ino: InodeId,
    enqueued_at: i64,
}

/// In-memory FIFO of inode ids pending hard-delete.
pub struct FreeList {
    inner: Mutex<FreeInner>,
}

struct FreeInner {
    queue: VecDeque<FreeEntry>,
    members: HashSet<InodeId>,
}

impl FreeList {
    /// Creates an empty free-list.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FreeInner {
                queue: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }

    /// Enqueues an inode id; already-present ids are ignored.
    pub fn push(&self, ino: InodeId, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.members.insert(ino) {
            inner.queue.push_back(FreeEntry {
                ino,
                enqueued_at: now,
            });
        }
    }

    /// Removes an inode id, returning whether it was queued.
    pub fn remove(&self, ino: InodeId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.members.remove(&ino) {
            inner.queue.retain(|e| e.ino != ino);
            true
        } else {
            false
        }
    }

    /// Returns true if the inode id is queued.
    pub fn contains(&self, ino: InodeId) -> bool {
        self.inner.lock().unwrap().members.contains(&ino)
    }

    /// Number of queued ids.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops up to `max` ids whose age has reached `min_age_secs`. Entries are
    /// enqueued in apply order, so the scan stops at the first young entry.
    pub fn drain_ready(&self, now: i64, min_age_secs: i64, max: usize) -> Vec<InodeId> {
        let mut inner = self.inner.lock().unwrap();
        let mut ready = Vec::new();
        while ready.len() < max {
            let due = matches!(inner.queue.front(), Some(front) if now - front.enqueued_at >= min_age_secs);
            if !due {
                break;
            }
            if let Some(entry) = inner.queue.pop_front() {
                inner.members.remove(&entry.ino);
                ready.push(entry.ino);
            }
        }
        ready
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Work discovered by one reclaimer pass, to be proposed through the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReclaimPass {
    /// Inodes whose grace period elapsed; ready for internal deletion.
    pub ready_inodes: Vec<InodeId>,
    /// Dentry tombstones past their TTL.
    pub stale_dentry_tombstones: Vec<DentryTombKey>,
    /// Cutoff for pruning the settled-transaction table.
    pub prune_settled_before: i64,
}

impl ReclaimPass {
    /// True when the pass found nothing to delete.
    pub fn is_empty(&self) -> bool {
        self.ready_inodes.is_empty() && self.stale_dentry_tombstones.is_empty()
    }
}

/// Age-gated background drain of the free-list and tombstone indexes.
pub struct Reclaimer {
    min_age_secs: i64,
    tombstone_ttl_secs: i64,
    tx_settled_ttl_secs: i64,
    max_items: usize,
}

impl Reclaimer {
    /// Creates a reclaimer from the partition's tuning.
    pub fn from_config(config: &PartitionConfig) -> Self {
        Self {
            min_age_secs: config.free_list_min_age_secs,
            tombstone_ttl_secs: config.dentry_tombstone_ttl_secs,
            tx_settled_ttl_secs: config.tx_settled_ttl_secs,
            max_items: config.reclaim_max_items_per_pass,
        }
    }

    /// Runs one pass: re-emits extents of aged free-list inodes and collects
    /// the ids plus stale dentry tombstones for the host to propose as an
    /// internal-delete command.
    pub fn run_pass(&self, partition: &MetaPartition, now: i64) -> ReclaimPass {
        let ready_inodes = partition
            .free_list()
            .drain_ready(now, self.min_age_secs, self.max_items);

        for ino in &ready_inodes {
            if let Some(inode) = partition.inode_record(*ino) {
                partition.emit_reclaim(inode.extents.as_slice().to_vec());
            }
        }

        let mut stale = Vec::new();
        partition.scan_dentry_tombstones(|key, deleted_at| {
            if now - deleted_at >= self.tombstone_ttl_secs {
                stale.push(key.clone());
            }
            stale.len() < self.max_items
        });

        partition.flush_reclaim_overflow();

        if !ready_inodes.is_empty() || !stale.is_empty() {
            tracing::debug!(
                ready = ready_inodes.len(),
                stale_tombstones = stale.len(),
                "reclaimer pass"
            );
        }

        ReclaimPass {
            ready_inodes,
            stale_dentry_tombstones: stale,
            prune_settled_before: now - self.tx_settled_ttl_secs,
        }
    }

    /// Periodic drive loop. Non-empty passes are handed to `out`; the host
    /// turns them into internal-delete proposals. Ends when `out` closes.
    pub async fn run_loop(
        self,
        partition: Arc<MetaPartition>,
        interval: Duration,
        out: mpsc::Sender<ReclaimPass>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if out.is_closed() {
                return;
            }
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let pass = self.run_pass(&partition, now);
            if pass.is_empty() {
                continue;
            }
            if out.send(pass).await.is_err() {
                return;
            }
        }
    }
}
