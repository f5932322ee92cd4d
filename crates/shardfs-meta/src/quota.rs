//! Quota accounting: per-quota file/byte aggregates and per-uid space usage.
//!
//! Bindings live in inode xattrs (see [`crate::xattr`]); the aggregates here
//! are derived state kept in RAM and rebuilt by a one-pass scan on bootstrap.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::types::{OpStatus, QuotaId};

/// Limit for one quota; `u64::MAX` means unlimited.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Maximum number of files.
    pub max_files: u64,
    /// Maximum number of bytes.
    pub max_bytes: u64,
}

impl QuotaLimit {
    /// A limit that never triggers.
    pub fn unlimited() -> Self {
        Self {
            max_files: u64::MAX,
            max_bytes: u64::MAX,
        }
    }

    /// Creates a limit with the given caps.
    pub fn new(max_files: u64, max_bytes: u64) -> Self {
        Self {
            max_files,
            max_bytes,
        }
    }
}

/// Current usage of one quota.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Files currently counted against the quota.
    pub files: u64,
    /// Bytes currently counted against the quota.
    pub bytes: u64,
}

impl QuotaUsage {
    /// Applies signed deltas, saturating at zero.
    pub fn add(&mut self, bytes: i64, files: i64) {
        if bytes >= 0 {
            self.bytes = self.bytes.saturating_add(bytes as u64);
        } else {
            self.bytes = self.bytes.saturating_sub(bytes.unsigned_abs());
        }
        if files >= 0 {
            self.files = self.files.saturating_add(files as u64);
        } else {
            self.files = self.files.saturating_sub(files.unsigned_abs());
        }
    }
}

struct QuotaEntry {
    limit: QuotaLimit,
    usage: QuotaUsage,
}

/// Tracks quota aggregates and per-uid space for one partition.
pub struct QuotaManager {
    quotas: RwLock<HashMap<QuotaId, QuotaEntry>>,
    uid_used: RwLock<HashMap<u32, u64>>,
    uid_limits: RwLock<HashMap<u32, u64>>,
}

impl QuotaManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            quotas: RwLock::new(HashMap::new()),
            uid_used: RwLock::new(HashMap::new()),
            uid_limits: RwLock::new(HashMap::new()),
        }
    }

    /// Sets or replaces the limit for a quota, keeping its usage.
    pub fn set_limit(&self, id: QuotaId, limit: QuotaLimit) {
        let mut quotas = self.quotas.write().unwrap();
        quotas
            .entry(id)
            .and_modify(|e| e.limit = limit)
            .or_insert(QuotaEntry {
                limit,
                usage: QuotaUsage::default(),
            });
    }

    /// Applies usage deltas to a quota aggregate.
    pub fn update_used(&self, id: QuotaId, bytes: i64, files: i64) {
        let mut quotas = self.quotas.write().unwrap();
        let entry = quotas.entry(id).or_insert(QuotaEntry {
            limit: QuotaLimit::unlimited(),
            usage: QuotaUsage::default(),
        });
        entry.usage.add(bytes, files);
    }

    /// Current usage of a quota.
    pub fn usage(&self, id: QuotaId) -> QuotaUsage {
        self.quotas
            .read()
            .unwrap()
            .get(&id)
            .map(|e| e.usage)
            .unwrap_or_default()
    }

    /// Returns true when the quota's usage has reached either cap.
    pub fn is_exhausted(&self, id: QuotaId) -> bool {
        let quotas = self.quotas.read().unwrap();
        match quotas.get(&id) {
            None => false,
            Some(e) => e.usage.files >= e.limit.max_files || e.usage.bytes >= e.limit.max_bytes,
        }
    }

    /// Returns true when any of the listed quotas is exhausted.
    pub fn any_exhausted(&self, ids: &[QuotaId]) -> bool {
        ids.iter().any(|id| self.is_exhausted(*id))
    }

    /// Sets a byte cap on one uid's space.
    pub fn set_uid_limit(&self, uid: u32, max_bytes: u64) {
        self.uid_limits.write().unwrap().insert(uid, max_bytes);
    }

    /// Charges bytes against a uid, refusing the charge when a cap would be
    /// crossed.
    pub fn charge_uid(&self, uid: u32, bytes: u64) -> OpStatus {
        let limits = self.uid_limits.read().unwrap();
        let mut used = self.uid_used.write().unwrap();
        let current = used.get(&uid).copied().unwrap_or(0);
        if let Some(limit) = limits.get(&uid) {
            if current.saturating_add(bytes) > *limit {
                tracing::warn!(uid, bytes, limit, "uid space exhausted");
                return OpStatus::NoSpace;
            }
        }
        used.insert(uid, current + bytes);
        OpStatus::Ok
    }

    /// Returns true when the uid has a cap and its usage already reached it.
    pub fn uid_exhausted(&self, uid: u32) -> bool {
        let limits = self.uid_limits.read().unwrap();
        let Some(limit) = limits.get(&uid) else {
            return false;
        };
        let used = self.uid_used.read().unwrap();
        used.get(&uid).copied().unwrap_or(0) >= *limit
    }

    /// Releases previously charged uid bytes.
    pub fn release_uid(&self, uid: u32, bytes: u64) {
        let mut used = self.uid_used.write().unwrap();
        let current = used.get(&uid).copied().unwrap_or(0);
        used.insert(uid, current.saturating_sub(bytes));
    }

    /// Bytes currently charged to a uid.
    pub fn uid_used(&self, uid: u32) -> u64 {
        self.uid_used.read().unwrap().get(&uid).copied().unwrap_or(0)
    }

    /// Drops all derived usage, keeping configured limits. Used before a
    /// bootstrap rebuild scan.
    pub fn reset_usage(&self) {
        let mut quotas = self.quotas.write().unwrap();
        for entry in quotas.values_mut() {
            entry.usage = QuotaUsage::default();
        }
        self.uid_used.write().unwrap().clear();
    }
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new()
    }
}
