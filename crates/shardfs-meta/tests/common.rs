//! Shared helpers for the end-to-end partition tests.
#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use shardfs_meta::command::{
    AppendExtentsReq, Command, CreateDentryReq, CreateInodeReq, DeleteDentryReq, UnlinkInodeReq,
};
use shardfs_meta::config::PartitionConfig;
use shardfs_meta::extent::ExtentKey;
use shardfs_meta::partition::MetaPartition;
use shardfs_meta::reclaim::ReclaimEvent;
use shardfs_meta::types::{FileType, InodeId, PartitionId};

/// Installs a test-writer subscriber so failing tests show handler traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Builds an empty partition with a wide inode range.
pub fn new_partition() -> (Arc<MetaPartition>, mpsc::Receiver<ReclaimEvent>) {
    let config = PartitionConfig::new(PartitionId::new(1), InodeId::new(1), InodeId::new(1 << 40));
    MetaPartition::new(config)
}

/// Builds a partition with custom tuning.
pub fn new_partition_with(config: PartitionConfig) -> (Arc<MetaPartition>, mpsc::Receiver<ReclaimEvent>) {
    MetaPartition::new(config)
}

pub fn mkdir_cmd(ino: u64, time: i64) -> Command {
    Command::CreateInode(CreateInodeReq {
        ino: InodeId::new(ino),
        file_type: FileType::Directory,
        mode: 0o755,
        uid: 0,
        gid: 0,
        symlink_target: None,
        quota_ids: Vec::new(),
        time,
    })
}

pub fn mkfile_cmd(ino: u64, time: i64) -> Command {
    Command::CreateInode(CreateInodeReq {
        ino: InodeId::new(ino),
        file_type: FileType::Regular,
        mode: 0o644,
        uid: 1000,
        gid: 1000,
        symlink_target: None,
        quota_ids: Vec::new(),
        time,
    })
}

pub fn dentry_cmd(parent: u64, name: &str, child: u64, ft: FileType, time: i64) -> Command {
    Command::CreateDentry(CreateDentryReq {
        parent: InodeId::new(parent),
        name: name.to_string(),
        ino: InodeId::new(child),
        file_type: ft,
        time,
    })
}

pub fn rmdentry_cmd(parent: u64, name: &str, seq: u64, time: i64) -> Command {
    Command::DeleteDentry(DeleteDentryReq {
        parent: InodeId::new(parent),
        name: name.to_string(),
        expected_ino: None,
        seq,
        time,
    })
}

pub fn unlink_cmd(ino: u64, time: i64) -> Command {
    Command::UnlinkInode(UnlinkInodeReq {
        ino: InodeId::new(ino),
        seq: 0,
        uniq_id: 0,
        time,
    })
}

pub fn extent(file_offset: u64, size: u32, extent_id: u64) -> ExtentKey {
    ExtentKey {
        file_offset,
        size,
        partition_id: PartitionId::new(7),
        extent_id,
        extent_offset: 0,
        crc: 0,
        snap_seq: 0,
    }
}

pub fn append_cmd(ino: u64, extents: Vec<ExtentKey>, time: i64) -> Command {
    Command::AppendExtents(AppendExtentsReq {
        ino: InodeId::new(ino),
        extents,
        time,
    })
}

/// Applies a command script in order, panicking on infrastructure errors.
pub fn run(p: &MetaPartition, script: &[Command]) {
    for cmd in script {
        p.apply(cmd).expect("apply failed");
    }
}

/// Drains every pending reclaim event.
pub fn drain_events(rx: &mut mpsc::Receiver<ReclaimEvent>) -> Vec<ReclaimEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
