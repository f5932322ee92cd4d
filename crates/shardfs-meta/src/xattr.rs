//! Extended attributes: a small per-inode name→value map.
//!
//! Absence of the record is equivalent to an empty map. Quota bindings live
//! in the same record under a reserved name so they replicate and snapshot
//! with the rest of the inode's metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{InodeId, MetaError, QuotaId};

/// Reserved xattr name carrying the serialized quota-binding map.
pub const QUOTA_XATTR_NAME: &str = "sys.quota";

/// A quota binding attached to one inode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBinding {
    /// True when this inode is the root of the quota subtree.
    pub root: bool,
}

/// Per-inode extended attribute record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XAttr {
    /// Owning inode.
    pub inode: InodeId,
    /// Name→value pairs, kept sorted for deterministic iteration.
    pub attrs: BTreeMap<String, Vec<u8>>,
}

impl XAttr {
    /// Creates an empty record for the inode.
    pub fn new(inode: InodeId) -> Self {
        Self {
            inode,
            attrs: BTreeMap::new(),
        }
    }

    /// Sets or replaces one attribute.
    pub fn set(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.attrs.insert(name.into(), value);
    }

    /// Returns the value of one attribute.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.attrs.get(name).map(Vec::as_slice)
    }

    /// Removes one attribute, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.attrs.remove(name).is_some()
    }

    /// Returns true when no attributes remain.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Attribute names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(String::as_str)
    }

    /// Decodes the quota-binding map from the reserved attribute.
    pub fn quota_map(&self) -> Result<BTreeMap<QuotaId, QuotaBinding>, MetaError> {
        match self.attrs.get(QUOTA_XATTR_NAME) {
            None => Ok(BTreeMap::new()),
            Some(raw) => bincode::deserialize(raw).map_err(|e| MetaError::Codec(e.to_string())),
        }
    }

    /// Encodes the quota-binding map into the reserved attribute. An empty
    /// map removes the attribute entirely.
    pub fn set_quota_map(
        &mut self,
        map: &BTreeMap<QuotaId, QuotaBinding>,
    ) -> Result<(), MetaError> {
        if map.is_empty() {
            self.attrs.remove(QUOTA_XATTR_NAME);
            return Ok(());
        }
        let raw = bincode::serialize(map).map_err(|e| MetaError::Codec(e.to_string()))?;
        self.attrs.insert(QUOTA_XATTR_NAME.to_string(), raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut x = XAttr::new(InodeId::new(42));
        x.set("user.author", b"alice".to_vec());
        assert_eq!(x.get("user.author"), Some(&b"alice"[..]));
        assert!(x.remove("user.author"));
        assert!(!x.remove("user.author"));
        assert!(x.is_empty());
    }

    #[test]
    fn test_names_sorted() {
        let mut x = XAttr::new(InodeId::new(42));
        x.set("user.b", vec![2]);
        x.set("user.a", vec![1]);
        let names: Vec<&str> = x.names().collect();
        assert_eq!(names, vec!["user.a", "user.b"]);
    }

    #[test]
    fn test_quota_map_roundtrip() {
        let mut x = XAttr::new(InodeId::new(42));
        assert!(x.quota_map().unwrap().is_empty());

        let mut map = BTreeMap::new();
        map.insert(QuotaId::new(3), QuotaBinding { root: true });
        map.insert(QuotaId::new(9), QuotaBinding { root: false });
        x.set_quota_map(&map).unwrap();

        let decoded = x.quota_map().unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_empty_quota_map_clears_attr() {
        let mut x = XAttr::new(InodeId::new(42));
        let mut map = BTreeMap::new();
        map.insert(QuotaId::new(3), QuotaBinding::default());
        x.set_quota_map(&map).unwrap();
        assert!(x.get(QUOTA_XATTR_NAME).is_some());

        x.set_quota_map(&BTreeMap::new()).unwrap();
        assert!(x.get(QUOTA_XATTR_NAME).is_none());
        assert!(x.is_empty());
    }
}
