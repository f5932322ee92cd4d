//! Extent keys and the per-inode sorted extent lists.
//!
//! An extent key points into the external data-extent store; the metadata
//! layer only tracks which byte range of the file each key covers. The live
//! list keeps strictly non-overlapping, offset-sorted entries.

use serde::{Deserialize, Serialize};

use crate::types::{OpStatus, PartitionId};

/// Pointer into the data-extent store covering one contiguous file range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Byte offset of the covered range within the file.
    pub file_offset: u64,
    /// Length of the covered range in bytes.
    pub size: u32,
    /// Data partition holding the extent.
    pub partition_id: PartitionId,
    /// Extent id within the data partition.
    pub extent_id: u64,
    /// Offset within the extent where this range begins.
    pub extent_offset: u64,
    /// Checksum of the covered bytes.
    pub crc: u32,
    /// Snapshot sequence the range was written at.
    pub snap_seq: u64,
}

impl ExtentKey {
    /// Exclusive end of the covered file range.
    pub fn end(&self) -> u64 {
        self.file_offset + self.size as u64
    }

    /// Returns true if the two keys cover overlapping file ranges.
    pub fn overlaps(&self, other: &ExtentKey) -> bool {
        self.file_offset < other.end() && other.file_offset < self.end()
    }

    /// Returns true if both keys point at the same stored bytes.
    pub fn same_blob(&self, other: &ExtentKey) -> bool {
        self.partition_id == other.partition_id
            && self.extent_id == other.extent_id
            && self.extent_offset == other.extent_offset
    }
}

/// Offset-sorted, non-overlapping list of data extents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedExtents {
    eks: Vec<ExtentKey>,
}

impl SortedExtents {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self { eks: Vec::new() }
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.eks.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.eks.is_empty()
    }

    /// Read-only view of the extents in file-offset order.
    pub fn as_slice(&self) -> &[ExtentKey] {
        &self.eks
    }

    /// File size implied by the extents (end of the last one).
    pub fn byte_size(&self) -> u64 {
        self.eks.last().map(ExtentKey::end).unwrap_or(0)
    }

    /// Sum of extent lengths, ignoring holes.
    pub fn stored_bytes(&self) -> u64 {
        self.eks.iter().map(|e| e.size as u64).sum()
    }

    /// Removes every extent and returns them.
    pub fn drain_all(&mut self) -> Vec<ExtentKey> {
        std::mem::take(&mut self.eks)
    }

    /// Splices `ek` into the list.
    ///
    /// Prior extents fully covered by the new range are removed and returned
    /// for reclamation; partially overlapped neighbors are trimmed in place.
    /// Contiguous entries of the same blob are merged.
    pub fn append(&mut self, ek: ExtentKey) -> Vec<ExtentKey> {
        let deleted = self.splice(ek);
        self.merge_adjacent();
        deleted
    }

    /// Splices `ek` without merging neighbors, used when a split extent must
    /// stay addressable as its own record inside a snapshot layer.
    pub fn insert_unmerged(&mut self, ek: ExtentKey) -> Vec<ExtentKey> {
        self.splice(ek)
    }

    fn splice(&mut self, ek: ExtentKey) -> Vec<ExtentKey> {
        let mut deleted = Vec::new();
        let mut kept = Vec::with_capacity(self.eks.len() + 1);

        for e in self.eks.drain(..) {
            if !e.overlaps(&ek) {
                kept.push(e);
                continue;
            }
            if ek.file_offset <= e.file_offset && ek.end() >= e.end() {
                deleted.push(e);
                continue;
            }
            if e.file_offset < ek.file_offset {
                // keep the head of the old extent
                let mut head = e;
                head.size = (ek.file_offset - e.file_offset) as u32;
                kept.push(head);
            }
            if e.end() > ek.end() {
                // keep the tail, shifted past the new range
                let cut = ek.end() - e.file_offset;
                let mut tail = e;
                tail.file_offset = ek.end();
                tail.extent_offset += cut;
                tail.size = (e.end() - ek.end()) as u32;
                kept.push(tail);
            }
        }

        let pos = kept
            .iter()
            .position(|e| e.file_offset > ek.file_offset)
            .unwrap_or(kept.len());
        kept.insert(pos, ek);
        self.eks = kept;
        deleted
    }

    /// Conflict-checked append used by the client write path.
    ///
    /// `discard` names prior keys the writer believes it supersedes; each must
    /// match a stored extent exactly. Overlap with a foreign blob is a
    /// conflict; overlap with the same blob at a different range asks the
    /// writer to allocate a fresh extent. An identical key is an idempotent
    /// replay.
    pub fn append_with_check(
        &mut self,
        ek: ExtentKey,
        discard: &[ExtentKey],
    ) -> (Vec<ExtentKey>, OpStatus) {
        if !discard.is_empty() {
            for d in discard {
                if !self.eks.contains(d) {
                    return (Vec::new(), OpStatus::ConflictExtents);
                }
            }
        }

        for e in self.eks.iter().filter(|e| !discard.contains(e)) {
            if !e.overlaps(&ek) {
                continue;
            }
            if *e == ek {
                return (Vec::new(), OpStatus::Ok);
            }
            if e.same_blob(&ek) {
                return (Vec::new(), OpStatus::TryOtherExtent);
            }
            return (Vec::new(), OpStatus::ConflictExtents);
        }

        let mut deleted: Vec<ExtentKey> = Vec::with_capacity(discard.len());
        self.eks.retain(|e| {
            if discard.contains(e) {
                deleted.push(*e);
                false
            } else {
                true
            }
        });
        deleted.extend(self.append(ek));
        (deleted, OpStatus::Ok)
    }

    /// Cuts the list at `new_size`, returning the dropped ranges.
    ///
    /// An extent straddling the boundary is trimmed; the cut tail is returned
    /// as a derived key so its bytes can be reclaimed.
    pub fn truncate(&mut self, new_size: u64) -> Vec<ExtentKey> {
        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.eks.len());

        for e in self.eks.drain(..) {
            if e.end() <= new_size {
                kept.push(e);
            } else if e.file_offset >= new_size {
                dropped.push(e);
            } else {
                let keep = new_size - e.file_offset;
                let mut head = e;
                head.size = keep as u32;
                kept.push(head);

                let mut tail = e;
                tail.file_offset = new_size;
                tail.extent_offset += keep;
                tail.size = (e.end() - new_size) as u32;
                dropped.push(tail);
            }
        }
        self.eks = kept;
        dropped
    }

    fn merge_adjacent(&mut self) {
        let mut merged: Vec<ExtentKey> = Vec::with_capacity(self.eks.len());
        for e in self.eks.drain(..) {
            if let Some(prev) = merged.last_mut() {
                let contiguous = prev.end() == e.file_offset
                    && prev.partition_id == e.partition_id
                    && prev.extent_id == e.extent_id
                    && prev.extent_offset + prev.size as u64 == e.extent_offset
                    && prev.snap_seq == e.snap_seq;
                if contiguous {
                    prev.size += e.size;
                    continue;
                }
            }
            merged.push(e);
        }
        self.eks = merged;
    }
}

/// Pointer into the object store for a cold file range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjExtentKey {
    /// Byte offset of the covered range within the file.
    pub file_offset: u64,
    /// Length of the covered range in bytes.
    pub size: u64,
    /// Object id in the external object store.
    pub object_id: u64,
    /// Offset inside the stored object.
    pub blob_offset: u64,
}

impl ObjExtentKey {
    /// Exclusive end of the covered file range.
    pub fn end(&self) -> u64 {
        self.file_offset + self.size
    }
}

/// Append-only sorted list of object-backed extents; overlap is refused.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedObjExtents {
    eks: Vec<ObjExtentKey>,
}

impl SortedObjExtents {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self { eks: Vec::new() }
    }

    /// Read-only view in file-offset order.
    pub fn as_slice(&self) -> &[ObjExtentKey] {
        &self.eks
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.eks.is_empty()
    }

    /// Appends the keys, refusing any that overlap existing or new ranges.
    pub fn append(&mut self, new: &[ObjExtentKey]) -> OpStatus {
        let mut candidate = self.eks.clone();
        for ek in new {
            if candidate
                .iter()
                .any(|e| e.file_offset < ek.end() && ek.file_offset < e.end())
            {
                return OpStatus::ConflictExtents;
            }
            let pos = candidate
                .iter()
                .position(|e| e.file_offset > ek.file_offset)
                .unwrap_or(candidate.len());
            candidate.insert(pos, *ek);
        }
        self.eks = candidate;
        OpStatus::Ok
    }

    /// File size implied by the extents.
    pub fn byte_size(&self) -> u64 {
        self.eks.last().map(ObjExtentKey::end).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ek(file_offset: u64, size: u32, extent_id: u64) -> ExtentKey {
        ExtentKey {
            file_offset,
            size,
            partition_id: PartitionId::new(1),
            extent_id,
            extent_offset: 0,
            crc: 0,
            snap_seq: 0,
        }
    }

    #[test]
    fn test_append_keeps_sorted_order() {
        let mut se = SortedExtents::new();
        se.append(ek(8192, 4096, 3));
        se.append(ek(0, 4096, 1));
        se.append(ek(4096, 4096, 2));
        let offs: Vec<u64> = se.as_slice().iter().map(|e| e.file_offset).collect();
        assert_eq!(offs, vec![0, 4096, 8192]);
        assert_eq!(se.byte_size(), 12288);
    }

    #[test]
    fn test_append_evicts_covered() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        se.append(ek(4096, 4096, 2));
        let deleted = se.append(ek(0, 8192, 3));
        assert_eq!(deleted.len(), 2);
        assert_eq!(se.len(), 1);
        assert_eq!(se.as_slice()[0].extent_id, 3);
    }

    #[test]
    fn test_append_trims_partial_overlap() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 8192, 1));
        let deleted = se.append(ek(4096, 8192, 2));
        assert!(deleted.is_empty());
        assert_eq!(se.len(), 2);
        assert_eq!(se.as_slice()[0].size, 4096);
        assert_eq!(se.as_slice()[1].file_offset, 4096);
        assert_eq!(se.byte_size(), 12288);
    }

    #[test]
    fn test_append_splits_middle_overwrite() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 12288, 1));
        se.append(ek(4096, 4096, 2));
        let offs: Vec<(u64, u32, u64)> = se
            .as_slice()
            .iter()
            .map(|e| (e.file_offset, e.size, e.extent_id))
            .collect();
        assert_eq!(offs, vec![(0, 4096, 1), (4096, 4096, 2), (8192, 4096, 1)]);
        // tail of the split extent points past the cut
        assert_eq!(se.as_slice()[2].extent_offset, 8192);
    }

    #[test]
    fn test_append_merges_contiguous_same_blob() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        let mut next = ek(4096, 4096, 1);
        next.extent_offset = 4096;
        se.append(next);
        assert_eq!(se.len(), 1);
        assert_eq!(se.as_slice()[0].size, 8192);
    }

    #[test]
    fn test_checked_append_conflict_foreign_blob() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        let (deleted, status) = se.append_with_check(ek(0, 4096, 2), &[]);
        assert_eq!(status, OpStatus::ConflictExtents);
        assert!(deleted.is_empty());
        assert_eq!(se.as_slice()[0].extent_id, 1);
    }

    #[test]
    fn test_checked_append_idempotent_replay() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        let (deleted, status) = se.append_with_check(ek(0, 4096, 1), &[]);
        assert_eq!(status, OpStatus::Ok);
        assert!(deleted.is_empty());
        assert_eq!(se.len(), 1);
    }

    #[test]
    fn test_checked_append_same_blob_other_range() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 8192, 1));
        let (_, status) = se.append_with_check(ek(4096, 8192, 1), &[]);
        assert_eq!(status, OpStatus::TryOtherExtent);
    }

    #[test]
    fn test_checked_append_discard_mismatch() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        let (_, status) = se.append_with_check(ek(0, 4096, 3), &[ek(0, 4096, 2)]);
        assert_eq!(status, OpStatus::ConflictExtents);
    }

    #[test]
    fn test_checked_append_discard_superseded() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        let (deleted, status) = se.append_with_check(ek(0, 4096, 2), &[ek(0, 4096, 1)]);
        assert_eq!(status, OpStatus::Ok);
        assert_eq!(deleted, vec![ek(0, 4096, 1)]);
        assert_eq!(se.as_slice()[0].extent_id, 2);
    }

    #[test]
    fn test_truncate_drops_and_splits() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        se.append(ek(4096, 4096, 2));
        se.append(ek(8192, 4096, 3));
        let dropped = se.truncate(6144);
        assert_eq!(dropped.len(), 2);
        // the straddler's tail carries the shifted extent offset
        let tail = dropped.iter().find(|e| e.extent_id == 2).unwrap();
        assert_eq!(tail.file_offset, 6144);
        assert_eq!(tail.extent_offset, 2048);
        assert_eq!(tail.size, 2048);
        assert_eq!(se.byte_size(), 6144);
    }

    #[test]
    fn test_truncate_noop_past_end() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 4096, 1));
        assert!(se.truncate(8192).is_empty());
        assert_eq!(se.len(), 1);
    }

    #[test]
    fn test_obj_append_refuses_overlap() {
        let mut oe = SortedObjExtents::new();
        let a = ObjExtentKey {
            file_offset: 0,
            size: 100,
            object_id: 1,
            blob_offset: 0,
        };
        let b = ObjExtentKey {
            file_offset: 50,
            size: 100,
            object_id: 2,
            blob_offset: 0,
        };
        assert_eq!(oe.append(&[a]), OpStatus::Ok);
        assert_eq!(oe.append(&[b]), OpStatus::ConflictExtents);
        assert_eq!(oe.as_slice().len(), 1);
    }

    #[test]
    fn test_obj_append_rejects_overlap_within_batch() {
        let mut oe = SortedObjExtents::new();
        let a = ObjExtentKey {
            file_offset: 0,
            size: 100,
            object_id: 1,
            blob_offset: 0,
        };
        let b = ObjExtentKey {
            file_offset: 60,
            size: 10,
            object_id: 2,
            blob_offset: 0,
        };
        assert_eq!(oe.append(&[a, b]), OpStatus::ConflictExtents);
        assert!(oe.is_empty());
    }
}
