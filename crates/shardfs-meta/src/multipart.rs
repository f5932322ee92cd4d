//! Multipart upload records: staged object uploads awaiting completion.

use serde::{Deserialize, Serialize};

use crate::types::InodeId;

/// Index key of a multipart record: path first so one prefix's uploads form a
/// contiguous key range, then the upload id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MultipartKey {
    /// Object path the upload targets.
    pub path: String,
    /// Unique upload id.
    pub id: String,
}

impl MultipartKey {
    /// Creates a multipart key.
    pub fn new(path: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: id.into(),
        }
    }
}

/// One uploaded part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartPart {
    /// Part number, unique within the upload.
    pub number: u16,
    /// Inode holding the part's staged data.
    pub inode: InodeId,
    /// Part size in bytes.
    pub size: u64,
    /// Upload time, seconds.
    pub mtime: i64,
    /// Content fingerprint reported by the uploader.
    pub etag: String,
}

/// A multipart upload in progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multipart {
    /// Unique upload id.
    pub id: String,
    /// Object path the upload targets.
    pub path: String,
    /// Initiation time, seconds.
    pub init_time: i64,
    /// Uploaded parts, sorted by part number.
    parts: Vec<MultipartPart>,
}

impl Multipart {
    /// Creates a fresh upload record with no parts.
    pub fn new(path: impl Into<String>, id: impl Into<String>, init_time: i64) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            init_time,
            parts: Vec::new(),
        }
    }

    /// Index key of this record.
    pub fn key(&self) -> MultipartKey {
        MultipartKey::new(self.path.clone(), self.id.clone())
    }

    /// Parts in part-number order.
    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    /// Inserts a part, keeping number order. Returns false when the part
    /// number is already taken.
    pub fn insert_part(&mut self, part: MultipartPart) -> bool {
        match self.parts.binary_search_by_key(&part.number, |p| p.number) {
            Ok(_) => false,
            Err(pos) => {
                self.parts.insert(pos, part);
                true
            }
        }
    }

    /// Total bytes across all parts.
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}
