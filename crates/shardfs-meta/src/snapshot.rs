//! Partition snapshot encode/decode for cold-replica bootstrap.
//!
//! The stream is a header followed by one section per index, written in key
//! order with a length-prefixed bincode record per entity, and the
//! transaction state last. Derived state (free-list, quota aggregates) is not
//! serialized; it is rebuilt by a scan after load, so every replica derives
//! it from the same index contents.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::partition::MetaPartition;
use crate::types::MetaError;
use crate::version::VersionList;

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    applied_index: u64,
    ver_seq: u64,
    versions: VersionList,
    uniq_ids: Vec<u64>,
}

fn put_record<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> Result<(), MetaError> {
    let bytes = bincode::serialize(value).map_err(|e| MetaError::Codec(e.to_string()))?;
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn put_count(buf: &mut Vec<u8>, count: usize) {
    buf.extend_from_slice(&(count as u32).to_le_bytes());
}

struct SnapshotReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_u32(&mut self) -> Result<u32, MetaError> {
        let end = self.pos + 4;
        if end > self.bytes.len() {
            return Err(MetaError::CorruptSnapshot(
                "truncated length field".to_string(),
            ));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        Ok(u32::from_le_bytes(raw))
    }

    fn take_record<T: DeserializeOwned>(&mut self) -> Result<T, MetaError> {
        let len = self.take_u32()? as usize;
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(MetaError::CorruptSnapshot("truncated record".to_string()));
        }
        let value = bincode::deserialize(&self.bytes[self.pos..end])
            .map_err(|e| MetaError::Codec(e.to_string()))?;
        self.pos = end;
        Ok(value)
    }

    fn take_section<T: DeserializeOwned>(&mut self) -> Result<Vec<T>, MetaError> {
        let count = self.take_u32()? as usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(self.take_record()?);
        }
        Ok(records)
    }

    fn finish(&self) -> Result<(), MetaError> {
        if self.pos != self.bytes.len() {
            return Err(MetaError::CorruptSnapshot(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

impl MetaPartition {
    /// Serializes the full replicated state of this partition.
    pub fn take_snapshot(&self) -> Result<Vec<u8>, MetaError> {
        let mut buf = Vec::new();

        let header = SnapshotHeader {
            applied_index: self.applied_index(),
            ver_seq: self.ver_seq(),
            versions: self.versions.lock().unwrap().clone(),
            uniq_ids: self.uniq.lock().unwrap().export(),
        };
        put_record(&mut buf, &header)?;

        let inodes = self.inodes.clone_snapshot();
        put_count(&mut buf, inodes.len());
        for inode in inodes.values() {
            put_record(&mut buf, inode.as_ref())?;
        }

        let dentries = self.dentries.clone_snapshot();
        put_count(&mut buf, dentries.len());
        for dentry in dentries.values() {
            put_record(&mut buf, dentry.as_ref())?;
        }

        let xattrs = self.xattrs.clone_snapshot();
        put_count(&mut buf, xattrs.len());
        for xattr in xattrs.values() {
            put_record(&mut buf, xattr.as_ref())?;
        }

        let multiparts = self.multiparts.clone_snapshot();
        put_count(&mut buf, multiparts.len());
        for multipart in multiparts.values() {
            put_record(&mut buf, multipart.as_ref())?;
        }

        let tomb_inodes = self.tomb_inodes.clone_snapshot();
        put_count(&mut buf, tomb_inodes.len());
        for tomb in tomb_inodes.values() {
            put_record(&mut buf, tomb.as_ref())?;
        }

        let tomb_dentries = self.tomb_dentries.clone_snapshot();
        put_count(&mut buf, tomb_dentries.len());
        for tomb in tomb_dentries.values() {
            put_record(&mut buf, tomb.as_ref())?;
        }

        put_record(&mut buf, &self.txs.export())?;

        tracing::debug!(
            partition = %self.config.partition_id,
            bytes = buf.len(),
            inodes = inodes.len(),
            "snapshot taken"
        );
        Ok(buf)
    }

    /// Replaces this partition's state from snapshot bytes and rebuilds the
    /// derived bookkeeping.
    pub fn bootstrap(&self, bytes: &[u8]) -> Result<(), MetaError> {
        let mut reader = SnapshotReader::new(bytes);
        let header: SnapshotHeader = reader.take_record()?;
        let inodes: Vec<crate::inode::Inode> = reader.take_section()?;
        let dentries: Vec<crate::dentry::Dentry> = reader.take_section()?;
        let xattrs: Vec<crate::xattr::XAttr> = reader.take_section()?;
        let multiparts: Vec<crate::multipart::Multipart> = reader.take_section()?;
        let tomb_inodes: Vec<crate::inode::TombstonedInode> = reader.take_section()?;
        let tomb_dentries: Vec<crate::dentry::DentryTombstone> = reader.take_section()?;
        let txs: crate::transaction::TxSnapshot = reader.take_record()?;
        reader.finish()?;

        self.set_applied_index(header.applied_index);
        self.set_ver_seq(header.ver_seq);
        *self.versions.lock().unwrap() = header.versions;
        self.uniq.lock().unwrap().import(header.uniq_ids);
        self.txs.import(txs);

        self.inodes.execute_atomically(|tree| {
            tree.clear();
            for inode in inodes {
                tree.insert(inode.id, std::sync::Arc::new(inode));
            }
        });
        self.dentries.execute_atomically(|tree| {
            tree.clear();
            for dentry in dentries {
                tree.insert(dentry.key(), std::sync::Arc::new(dentry));
            }
        });
        self.xattrs.execute_atomically(|tree| {
            tree.clear();
            for xattr in xattrs {
                tree.insert(xattr.inode, std::sync::Arc::new(xattr));
            }
        });
        self.multiparts.execute_atomically(|tree| {
            tree.clear();
            for multipart in multiparts {
                tree.insert(multipart.key(), std::sync::Arc::new(multipart));
            }
        });
        self.tomb_inodes.execute_atomically(|tree| {
            tree.clear();
            for tomb in tomb_inodes {
                tree.insert(tomb.inode, std::sync::Arc::new(tomb));
            }
        });
        self.tomb_dentries.execute_atomically(|tree| {
            tree.clear();
            for tomb in tomb_dentries {
                tree.insert(tomb.key(), std::sync::Arc::new(tomb));
            }
        });

        self.rebuild_derived_state();
        tracing::info!(
            partition = %self.config.partition_id,
            applied = self.applied_index(),
            "partition bootstrapped from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::command::{AppendExtentsReq, Command, CreateDentryReq, CreateInodeReq, UnlinkInodeReq};
    use crate::config::PartitionConfig;
    use crate::extent::ExtentKey;
    use crate::partition::MetaPartition;
    use crate::types::{FileType, InodeId, PartitionId};

    fn partition() -> Arc<MetaPartition> {
        let cfg = PartitionConfig::new(PartitionId::new(1), InodeId::new(1), InodeId::new(100_000));
        MetaPartition::new(cfg).0
    }

    fn seed(p: &MetaPartition) {
        p.apply(&Command::CreateInode(CreateInodeReq {
            ino: InodeId::new(100),
            file_type: FileType::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            symlink_target: None,
            quota_ids: Vec::new(),
            time: 1000,
        }))
        .unwrap();
        p.apply(&Command::CreateInode(CreateInodeReq {
            ino: InodeId::new(101),
            file_type: FileType::Regular,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            symlink_target: None,
            quota_ids: Vec::new(),
            time: 1000,
        }))
        .unwrap();
        p.apply(&Command::CreateDentry(CreateDentryReq {
            parent: InodeId::new(100),
            name: "a".to_string(),
            ino: InodeId::new(101),
            file_type: FileType::Regular,
            time: 1001,
        }))
        .unwrap();
        p.apply(&Command::AppendExtents(AppendExtentsReq {
            ino: InodeId::new(101),
            extents: vec![ExtentKey {
                file_offset: 0,
                size: 4096,
                partition_id: PartitionId::new(2),
                extent_id: 9,
                extent_offset: 0,
                crc: 7,
                snap_seq: 0,
            }],
            time: 1002,
        }))
        .unwrap();
    }

    #[test]
    fn test_snapshot_roundtrip_identity() {
        let p = partition();
        seed(&p);
        let snap = p.take_snapshot().unwrap();

        let q = partition();
        q.bootstrap(&snap).unwrap();

        assert_eq!(q.take_snapshot().unwrap(), snap);
        assert_eq!(q.applied_index(), p.applied_index());
        assert_eq!(q.ver_seq(), p.ver_seq());
        assert_eq!(
            q.read_dir(InodeId::new(100), "", 0, 0, false),
            p.read_dir(InodeId::new(100), "", 0, 0, false)
        );
    }

    #[test]
    fn test_bootstrap_rebuilds_free_list() {
        let p = partition();
        seed(&p);
        p.apply(&Command::UnlinkInode(UnlinkInodeReq {
            ino: InodeId::new(101),
            seq: 0,
            uniq_id: 0,
            time: 2000,
        }))
        .unwrap();
        assert!(p.free_list().contains(InodeId::new(101)));

        let snap = p.take_snapshot().unwrap();
        let q = partition();
        q.bootstrap(&snap).unwrap();
        assert!(q.free_list().contains(InodeId::new(101)));
    }

    #[test]
    fn test_bootstrap_rebuilds_uid_usage() {
        let p = partition();
        seed(&p);
        assert_eq!(p.quotas().uid_used(1000), 4096);

        let snap = p.take_snapshot().unwrap();
        let q = partition();
        q.bootstrap(&snap).unwrap();
        assert_eq!(q.quotas().uid_used(1000), 4096);
    }

    #[test]
    fn test_bootstrap_refuses_truncated_stream() {
        let p = partition();
        seed(&p);
        let snap = p.take_snapshot().unwrap();

        let q = partition();
        assert!(q.bootstrap(&snap[..snap.len() - 3]).is_err());
    }

    #[test]
    fn test_bootstrap_refuses_trailing_garbage() {
        let p = partition();
        seed(&p);
        let mut snap = p.take_snapshot().unwrap();
        snap.push(0);

        let q = partition();
        assert!(q.bootstrap(&snap).is_err());
    }
}
