//! End-to-end partition scenarios: command scripts applied through the
//! dispatcher, verified against reads, reclaim events and snapshots.

mod common;

use common::*;

use shardfs_meta::command::{
    AppendExtentsCheckedReq, Command, CreateDentryReq, DeleteDentryReq, InternalDeleteBatchReq,
    TxOp, TxPrepareReq, TxSettleReq, UnlinkInodeReq, VersionPrepareReq, VersionSeqReq,
};
use shardfs_meta::config::PartitionConfig;
use shardfs_meta::reclaim::Reclaimer;
use shardfs_meta::transaction::{TxInfo, TxType};
use shardfs_meta::types::{FileType, InodeId, OpStatus, PartitionId, TxId};

#[test]
fn test_s1_create_then_lookup() {
    let (p, _rx) = new_partition();
    run(
        &p,
        &[
            mkdir_cmd(100, 1000),
            mkfile_cmd(101, 1000),
            dentry_cmd(100, "a", 101, FileType::Regular, 1001),
        ],
    );

    let listing = p.read_dir(InodeId::new(100), "", 0, 0, false);
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "a");
    assert_eq!(listing[0].ino, InodeId::new(101));
    assert_eq!(listing[0].file_type, FileType::Regular);

    let parent = p.get_inode(InodeId::new(100), 0).unwrap();
    assert_eq!(parent.nlink, 3);
}

#[test]
fn test_s2_unlink_releases_extent() {
    let (p, mut rx) = new_partition();
    run(
        &p,
        &[
            mkdir_cmd(100, 1000),
            mkfile_cmd(101, 1000),
            dentry_cmd(100, "a", 101, FileType::Regular, 1001),
            append_cmd(101, vec![extent(0, 4096, 1)], 1002),
            unlink_cmd(101, 2000),
        ],
    );

    let inode = p.inode_record(InodeId::new(101)).unwrap();
    assert_eq!(inode.nlink, 0);
    assert!(inode.should_delete());
    assert!(p.free_list().contains(InodeId::new(101)));

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].extents, vec![extent(0, 4096, 1)]);
}

fn rename_prepare(tx_id: u64) -> Command {
    Command::TxPrepare(TxPrepareReq {
        info: TxInfo {
            tx_id: TxId::new(tx_id),
            tx_type: TxType::Rename,
            created_at: 2000,
            timeout_secs: 60,
        },
        ops: vec![
            TxOp::DeleteDentry(DeleteDentryReq {
                parent: InodeId::new(10),
                name: "x".to_string(),
                expected_ino: Some(InodeId::new(42)),
                seq: 0,
                time: 2000,
            }),
            TxOp::CreateDentry(CreateDentryReq {
                parent: InodeId::new(20),
                name: "y".to_string(),
                ino: InodeId::new(42),
                file_type: FileType::Regular,
                time: 2000,
            }),
        ],
        time: 2000,
    })
}

fn rename_fixture() -> (std::sync::Arc<shardfs_meta::partition::MetaPartition>, tokio::sync::mpsc::Receiver<shardfs_meta::reclaim::ReclaimEvent>) {
    let (p, rx) = new_partition();
    run(
        &p,
        &[
            mkdir_cmd(10, 1000),
            mkdir_cmd(20, 1000),
            mkfile_cmd(42, 1000),
            dentry_cmd(10, "x", 42, FileType::Regular, 1001),
        ],
    );
    (p, rx)
}

#[test]
fn test_s3_rename_via_tx() {
    let (p, _rx) = rename_fixture();

    let prepare = rename_prepare(77);
    let commit = Command::TxCommit(TxSettleReq {
        tx_id: TxId::new(77),
        time: 2001,
    });
    assert!(p.apply(&prepare).unwrap().status.is_ok());
    assert!(p.apply(&commit).unwrap().status.is_ok());

    assert!(p.lookup(InodeId::new(10), "x", 0).is_none());
    assert_eq!(
        p.lookup(InodeId::new(20), "y", 0),
        Some((InodeId::new(42), FileType::Regular))
    );
    assert_eq!(p.get_inode(InodeId::new(10), 0).unwrap().nlink, 2);
    assert_eq!(p.get_inode(InodeId::new(20), 0).unwrap().nlink, 3);

    // replaying the settled transaction is a no-op
    let replay_prepare = p.apply(&prepare).unwrap();
    assert_eq!(replay_prepare.status, OpStatus::TxInfoNotExist);
    let replay_commit = p.apply(&commit).unwrap();
    assert_eq!(replay_commit.status, OpStatus::TxInfoNotExist);

    assert!(p.lookup(InodeId::new(10), "x", 0).is_none());
    assert_eq!(
        p.lookup(InodeId::new(20), "y", 0),
        Some((InodeId::new(42), FileType::Regular))
    );
    assert_eq!(p.get_inode(InodeId::new(10), 0).unwrap().nlink, 2);
    assert_eq!(p.get_inode(InodeId::new(20), 0).unwrap().nlink, 3);
}

#[test]
fn test_s3_prepare_retransmission_is_idempotent() {
    let (p, _rx) = rename_fixture();

    let prepare = rename_prepare(77);
    assert!(p.apply(&prepare).unwrap().status.is_ok());
    // peer retransmission before the commit arrives
    assert!(p.apply(&prepare).unwrap().status.is_ok());
    assert!(p
        .apply(&Command::TxCommit(TxSettleReq {
            tx_id: TxId::new(77),
            time: 2001,
        }))
        .unwrap()
        .status
        .is_ok());

    assert!(p.lookup(InodeId::new(10), "x", 0).is_none());
    assert_eq!(
        p.lookup(InodeId::new(20), "y", 0),
        Some((InodeId::new(42), FileType::Regular))
    );
    assert_eq!(p.get_inode(InodeId::new(10), 0).unwrap().nlink, 2);
    assert_eq!(p.get_inode(InodeId::new(20), 0).unwrap().nlink, 3);
}

#[test]
fn test_s4_abort_restores_pre_prepare_state() {
    let (p, _rx) = rename_fixture();

    let parent10_before = p.get_inode(InodeId::new(10), 0).unwrap();
    let parent20_before = p.get_inode(InodeId::new(20), 0).unwrap();

    assert!(p.apply(&rename_prepare(78)).unwrap().status.is_ok());
    // speculative state is visible between prepare and the decision
    assert!(p.lookup(InodeId::new(10), "x", 0).is_none());

    assert!(p
        .apply(&Command::TxAbort(TxSettleReq {
            tx_id: TxId::new(78),
            time: 2002,
        }))
        .unwrap()
        .status
        .is_ok());

    assert_eq!(
        p.lookup(InodeId::new(10), "x", 0),
        Some((InodeId::new(42), FileType::Regular))
    );
    assert!(p.lookup(InodeId::new(20), "y", 0).is_none());
    assert_eq!(p.get_inode(InodeId::new(10), 0).unwrap(), parent10_before);
    assert_eq!(p.get_inode(InodeId::new(20), 0).unwrap(), parent20_before);

    let mut tombs = 0;
    p.scan_dentry_tombstones(|_, _| {
        tombs += 1;
        true
    });
    assert_eq!(tombs, 0);
}

#[test]
fn test_s5_snapshot_read() {
    let (p, _rx) = new_partition();
    run(
        &p,
        &[
            mkdir_cmd(1, 1000),
            mkfile_cmd(7, 1000),
            dentry_cmd(1, "f", 7, FileType::Regular, 1001),
            Command::VersionPrepare(VersionPrepareReq { seq: 5, time: 1500 }),
            Command::VersionCommit(VersionSeqReq { seq: 5 }),
            rmdentry_cmd(1, "f", 0, 2000),
        ],
    );

    let at_four = p.read_dir(InodeId::new(1), "", 0, 4, false);
    assert_eq!(at_four.len(), 1);
    assert_eq!(at_four[0].name, "f");
    assert_eq!(at_four[0].ino, InodeId::new(7));

    let latest = p.read_dir(InodeId::new(1), "", 0, 0, false);
    assert!(latest.is_empty());
}

#[test]
fn test_s6_conflicting_append() {
    let (p, mut rx) = new_partition();
    run(
        &p,
        &[
            mkfile_cmd(9, 1000),
            append_cmd(9, vec![extent(0, 4096, 1)], 1001),
        ],
    );
    drain_events(&mut rx);

    let result = p
        .apply(&Command::AppendExtentsChecked(AppendExtentsCheckedReq {
            ino: InodeId::new(9),
            extent: extent(0, 4096, 2),
            discard: Vec::new(),
            is_split: false,
            time: 1002,
        }))
        .unwrap();
    assert_eq!(result.status, OpStatus::ConflictExtents);

    // the rejected key's bytes are garbage and must be torn down
    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].extents, vec![extent(0, 4096, 2)]);

    // stored extent is untouched
    let extents = p.get_extents(InodeId::new(9), 0).unwrap();
    assert_eq!(extents, vec![extent(0, 4096, 1)]);
}

#[test]
fn test_determinism_identical_snapshots() {
    let script = vec![
        mkdir_cmd(100, 1000),
        mkfile_cmd(101, 1000),
        mkfile_cmd(102, 1000),
        dentry_cmd(100, "b", 102, FileType::Regular, 1001),
        dentry_cmd(100, "a", 101, FileType::Regular, 1001),
        append_cmd(101, vec![extent(0, 4096, 1), extent(4096, 4096, 2)], 1002),
        Command::VersionPrepare(VersionPrepareReq { seq: 3, time: 1500 }),
        Command::VersionCommit(VersionSeqReq { seq: 3 }),
        rmdentry_cmd(100, "b", 0, 1600),
        unlink_cmd(102, 1601),
    ];

    let (a, _rx_a) = new_partition();
    let (b, _rx_b) = new_partition();
    run(&a, &script);
    run(&b, &script);

    assert_eq!(a.take_snapshot().unwrap(), b.take_snapshot().unwrap());
    assert_eq!(a.applied_index(), b.applied_index());
}

#[test]
fn test_readdir_paging_contract() {
    let (p, _rx) = new_partition();
    let mut script = vec![mkdir_cmd(100, 1000)];
    for (i, name) in ["cherry", "apple", "banana", "date"].iter().enumerate() {
        let ino = 200 + i as u64;
        script.push(mkfile_cmd(ino, 1000));
        script.push(dentry_cmd(100, name, ino, FileType::Regular, 1001));
    }
    run(&p, &script);

    let page1 = p.read_dir(InodeId::new(100), "", 2, 0, false);
    let names: Vec<&str> = page1.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["apple", "banana"]);

    let page2 = p.read_dir(InodeId::new(100), "banana", 2, 0, false);
    let names: Vec<&str> = page2.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["cherry", "date"]);

    let page3 = p.read_dir(InodeId::new(100), "date", 2, 0, false);
    assert!(page3.is_empty());
}

#[test]
fn test_reclaimer_end_to_end() {
    let mut config =
        PartitionConfig::new(PartitionId::new(1), InodeId::new(1), InodeId::new(1 << 40));
    config.free_list_min_age_secs = 100;
    config.dentry_tombstone_ttl_secs = 100;
    let (p, mut rx) = new_partition_with(config);

    run(
        &p,
        &[
            mkdir_cmd(100, 1000),
            mkfile_cmd(101, 1000),
            dentry_cmd(100, "a", 101, FileType::Regular, 1001),
            append_cmd(101, vec![extent(0, 4096, 1)], 1002),
            rmdentry_cmd(100, "a", 0, 1500),
            unlink_cmd(101, 1500),
        ],
    );
    drain_events(&mut rx);

    let reclaimer = Reclaimer::from_config(p.config());

    // too young: nothing drains
    let early = reclaimer.run_pass(&p, 1550);
    assert!(early.ready_inodes.is_empty());
    // the dentry tombstone is also still inside its TTL
    assert!(early.stale_dentry_tombstones.is_empty());

    let pass = reclaimer.run_pass(&p, 1700);
    assert_eq!(pass.ready_inodes, vec![InodeId::new(101)]);
    assert_eq!(pass.stale_dentry_tombstones.len(), 1);
    assert_eq!(pass.stale_dentry_tombstones[0].name, "a");

    // extents re-emitted for the aged inode (receiver deduplicates)
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| e.extents == vec![extent(0, 4096, 1)]));

    // the host routes the pass back through the log
    let result = p
        .apply(&Command::InternalDeleteBatch(InternalDeleteBatchReq {
            inos: pass.ready_inodes.clone(),
            dentry_tombstones: pass.stale_dentry_tombstones.clone(),
            prune_settled_before: pass.prune_settled_before,
        }))
        .unwrap();
    assert!(result.status.is_ok());
    assert!(p.inode_record(InodeId::new(101)).is_none());
    assert!(!p.free_list().contains(InodeId::new(101)));

    let mut tombs = 0;
    p.scan_dentry_tombstones(|_, _| {
        tombs += 1;
        true
    });
    assert_eq!(tombs, 0);
}

#[test]
fn test_snapshot_unlink_splices_layer() {
    let (p, mut rx) = new_partition();
    run(
        &p,
        &[
            mkfile_cmd(9, 1000),
            append_cmd(9, vec![extent(0, 4096, 1)], 1001),
            Command::VersionPrepare(VersionPrepareReq { seq: 5, time: 1500 }),
            Command::VersionCommit(VersionSeqReq { seq: 5 }),
            // live layer rewrites the range with a new blob, freezing the old one
            append_cmd(9, vec![extent(0, 4096, 2)], 1600),
        ],
    );
    drain_events(&mut rx);

    // drop the snapshot layer; its unique blob is reclaimed
    let status = p
        .apply(&Command::UnlinkInode(UnlinkInodeReq {
            ino: InodeId::new(9),
            seq: 3,
            uniq_id: 0,
            time: 2000,
        }))
        .unwrap()
        .status;
    assert!(status.is_ok());

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].extents, vec![extent(0, 4096, 1)]);

    // the live layer is untouched
    let inode = p.inode_record(InodeId::new(9)).unwrap();
    assert_eq!(inode.nlink, 1);
    assert!(!inode.should_delete());
    assert_eq!(p.get_extents(InodeId::new(9), 0).unwrap(), vec![extent(0, 4096, 2)]);
}

#[tokio::test]
async fn test_reclaimer_loop_reports_passes() {
    let mut config =
        PartitionConfig::new(PartitionId::new(1), InodeId::new(1), InodeId::new(1 << 40));
    config.free_list_min_age_secs = 0;
    let (p, mut rx) = new_partition_with(config);
    run(&p, &[mkfile_cmd(101, 0), unlink_cmd(101, 0)]);
    drain_events(&mut rx);

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(4);
    let reclaimer = Reclaimer::from_config(p.config());
    let handle = tokio::spawn(reclaimer.run_loop(
        p.clone(),
        std::time::Duration::from_millis(10),
        out_tx,
    ));

    let pass = out_rx.recv().await.unwrap();
    assert_eq!(pass.ready_inodes, vec![InodeId::new(101)]);

    // closing the outlet stops the loop
    drop(out_rx);
    handle.await.unwrap();
}

#[test]
fn test_tx_timeout_refused() {
    let (p, _rx) = rename_fixture();
    let mut cmd = rename_prepare(79);
    if let Command::TxPrepare(req) = &mut cmd {
        req.info.created_at = 100;
        req.time = 2000;
    }
    let result = p.apply(&cmd).unwrap();
    assert_eq!(result.status, OpStatus::TxTimeout);
    // nothing was staged or applied
    assert_eq!(p.transactions().staged_count(), 0);
    assert!(p.lookup(InodeId::new(10), "x", 0).is_some());
}

#[test]
fn test_snapshot_survives_disk_roundtrip() {
    init_tracing();
    let (p, _rx) = new_partition();
    run(
        &p,
        &[
            mkdir_cmd(100, 1000),
            mkfile_cmd(101, 1000),
            dentry_cmd(100, "a", 101, FileType::Regular, 1001),
        ],
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partition.snap");
    std::fs::write(&path, p.take_snapshot().unwrap()).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let (q, _rx_q) = new_partition();
    q.bootstrap(&bytes).unwrap();
    assert_eq!(
        q.lookup(InodeId::new(100), "a", 0),
        Some((InodeId::new(101), FileType::Regular))
    );
}

#[test]
fn test_bootstrap_after_snapshot_serves_reads() {
    let (p, _rx) = new_partition();
    run(
        &p,
        &[
            mkdir_cmd(100, 1000),
            mkfile_cmd(101, 1000),
            dentry_cmd(100, "a", 101, FileType::Regular, 1001),
            append_cmd(101, vec![extent(0, 4096, 1)], 1002),
        ],
    );

    let snap = p.take_snapshot().unwrap();
    let (q, _rx_q) = new_partition();
    q.bootstrap(&snap).unwrap();

    assert_eq!(
        q.lookup(InodeId::new(100), "a", 0),
        Some((InodeId::new(101), FileType::Regular))
    );
    assert_eq!(q.get_inode(InodeId::new(101), 0).unwrap().size, 4096);
    assert_eq!(q.applied_index(), p.applied_index());

    // the bootstrapped replica keeps applying commands deterministically
    run(&q, &[unlink_cmd(101, 2000)]);
    assert!(q.free_list().contains(InodeId::new(101)));
}
