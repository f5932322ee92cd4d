//! Generic ordered index shared by every entity tree in a partition.
//!
//! One abstraction replaces the per-entity wrapper zoo: each entity module
//! contributes only its key type and serde impls. Values live behind `Arc` so
//! a snapshot clone shares them copy-on-write with the live tree.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Range-scannable key→value map with snapshot-clone under a single writer lock.
pub struct OrderedIndex<K, V> {
    inner: RwLock<BTreeMap<K, Arc<V>>>,
}

impl<K: Ord + Clone, V: Clone> OrderedIndex<K, V> {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns a shared handle to the value at `key`.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.read().unwrap().get(key).cloned()
    }

    /// Runs `f` against a mutable copy-on-write handle of the value at `key`,
    /// holding the writer lock for the duration.
    pub fn with_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut tree = self.inner.write().unwrap();
        tree.get_mut(key).map(|v| f(Arc::make_mut(v)))
    }

    /// Inserts `value` at `key`.
    ///
    /// With `replace == false` an occupied key is refused and the existing
    /// value is returned in `Err`. With `replace == true` the previous value
    /// (if any) is returned in `Ok`.
    pub fn insert_or_replace(&self, key: K, value: V, replace: bool) -> Result<Option<Arc<V>>, Arc<V>> {
        let mut tree = self.inner.write().unwrap();
        if !replace {
            if let Some(existing) = tree.get(&key) {
                return Err(existing.clone());
            }
        }
        Ok(tree.insert(key, Arc::new(value)))
    }

    /// Removes and returns the value at `key`.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.write().unwrap().remove(key)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Returns true if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Visits entries in ascending key order starting at `from` (inclusive).
    /// The visitor returns `false` to stop the scan.
    pub fn ascend_from(&self, from: &K, mut visit: impl FnMut(&K, &Arc<V>) -> bool) {
        let tree = self.inner.read().unwrap();
        for (k, v) in tree.range((Bound::Included(from.clone()), Bound::Unbounded)) {
            if !visit(k, v) {
                break;
            }
        }
    }

    /// Visits entries with keys in `[lo, hi)` in ascending order.
    /// The visitor returns `false` to stop the scan.
    pub fn ascend_range(&self, lo: &K, hi: &K, mut visit: impl FnMut(&K, &Arc<V>) -> bool) {
        let tree = self.inner.read().unwrap();
        for (k, v) in tree.range((Bound::Included(lo.clone()), Bound::Excluded(hi.clone()))) {
            if !visit(k, v) {
                break;
            }
        }
    }

    /// Clones the tree for read-only iteration outside the partition lock.
    ///
    /// Values are shared with the live index; later mutations copy-on-write
    /// and never surface in the snapshot.
    pub fn clone_snapshot(&self) -> BTreeMap<K, Arc<V>> {
        self.inner.read().unwrap().clone()
    }

    /// Runs a compound lookup-then-mutate sequence as one critical section.
    pub fn execute_atomically<R>(&self, f: impl FnOnce(&mut BTreeMap<K, Arc<V>>) -> R) -> R {
        let mut tree = self.inner.write().unwrap();
        f(&mut tree)
    }
}

impl<K: Ord + Clone, V: Clone> Default for OrderedIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> OrderedIndex<u64, String> {
        let idx = OrderedIndex::new();
        for i in [5u64, 1, 9, 3, 7] {
            idx.insert_or_replace(i, format!("v{}", i), false).unwrap();
        }
        idx
    }

    #[test]
    fn test_insert_refuses_existing() {
        let idx = seeded();
        let err = idx.insert_or_replace(5, "other".to_string(), false);
        assert!(err.is_err());
        assert_eq!(*err.unwrap_err(), "v5");
        assert_eq!(*idx.get(&5).unwrap(), "v5");
    }

    #[test]
    fn test_insert_replace_returns_previous() {
        let idx = seeded();
        let prev = idx.insert_or_replace(5, "new".to_string(), true).unwrap();
        assert_eq!(*prev.unwrap(), "v5");
        assert_eq!(*idx.get(&5).unwrap(), "new");
    }

    #[test]
    fn test_remove() {
        let idx = seeded();
        assert_eq!(*idx.remove(&3).unwrap(), "v3");
        assert!(!idx.contains(&3));
        assert!(idx.remove(&3).is_none());
        assert_eq!(idx.len(), 4);
    }

    #[test]
    fn test_ascend_from_is_ordered() {
        let idx = seeded();
        let mut seen = Vec::new();
        idx.ascend_from(&3, |k, _| {
            seen.push(*k);
            true
        });
        assert_eq!(seen, vec![3, 5, 7, 9]);
    }

    #[test]
    fn test_ascend_range_half_open() {
        let idx = seeded();
        let mut seen = Vec::new();
        idx.ascend_range(&3, &9, |k, _| {
            seen.push(*k);
            true
        });
        assert_eq!(seen, vec![3, 5, 7]);
    }

    #[test]
    fn test_ascend_stops_on_false() {
        let idx = seeded();
        let mut seen = Vec::new();
        idx.ascend_from(&0, |k, _| {
            seen.push(*k);
            seen.len() < 2
        });
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn test_snapshot_unaffected_by_mutation() {
        let idx = seeded();
        let snap = idx.clone_snapshot();
        idx.with_mut(&5, |v| *v = "mutated".to_string());
        idx.remove(&1);
        idx.insert_or_replace(11, "v11".to_string(), false).unwrap();

        assert_eq!(*snap.get(&5).unwrap().as_ref(), "v5");
        assert!(snap.contains_key(&1));
        assert!(!snap.contains_key(&11));
        assert_eq!(*idx.get(&5).unwrap(), "mutated");
    }

    #[test]
    fn test_with_mut_missing_key() {
        let idx = seeded();
        assert!(idx.with_mut(&42, |_| ()).is_none());
    }

    #[test]
    fn test_execute_atomically_compound() {
        let idx = seeded();
        let moved = idx.execute_atomically(|tree| {
            if let Some(v) = tree.remove(&1) {
                tree.insert(100, v);
                true
            } else {
                false
            }
        });
        assert!(moved);
        assert!(!idx.contains(&1));
        assert_eq!(*idx.get(&100).unwrap(), "v1");
    }
}
