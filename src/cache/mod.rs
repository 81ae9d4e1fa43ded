//! The tiered cache.
//!
//! A mapping from string keys to opaque byte payloads with TTL and optional
//! encryption. Three concrete backends ([`file::FileBackend`],
//! [`remote::RemoteBackend`], [`hybrid::HybridBackend`]) share the
//! [`CacheBackend`] capability trait rather than an inheritance hierarchy,
//! giving every backend one shared method surface regardless of what is
//! plugged in behind it.
//!
//! The cache is best-effort everywhere: read errors are demoted to a miss,
//! write errors are swallowed, after logging through the `log_warn!`
//! family. No caller may depend on the cache succeeding.

pub mod encryption;
pub mod file;
pub mod hybrid;
pub mod key;
pub mod remote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub operation_kind: String,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Aggregate size/shape diagnostics for a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub approx_bytes: u64,
}

/// The capability surface every concrete backend implements.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns `None` for a missing OR expired entry; expired data is never
    /// surfaced to a reader.
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Same lookup as [`Self::get`] but returns a structurally valid entry
    /// even past its own `expires_at` -- for the narrow set of callers
    /// (the account-cache optimizer's stale-snapshot reuse path) that
    /// re-derive freshness from a separate, cheaper signal instead of this
    /// entry's own TTL. Still returns `None` for a genuinely absent key.
    async fn get_ignoring_ttl(&self, key: &str) -> Option<CacheEntry>;

    async fn put(&self, key: &str, payload: Vec<u8>, ttl: chrono::Duration, operation_kind: &str);

    async fn invalidate(&self, key: &str);

    /// Iterates the backend's *actual* stored keys (never a hard-coded
    /// list) and returns the count of entries actually removed.
    async fn invalidate_prefix(&self, prefix: &str) -> usize;

    async fn enumerate(&self) -> Vec<String>;

    async fn stats(&self) -> CacheStats;
}

/// Takes a `stats` reading before and after `invalidate_prefix` so callers
/// get the actual before/after entry delta rather than a raw removed-count.
/// Shared by every backend's `invalidate_prefix` caller and by `cache
/// clear`.
pub async fn invalidate_prefix_with_delta(
    backend: &dyn CacheBackend,
    prefix: &str,
) -> (usize, usize) {
    let before = backend.stats().await.entries;
    let removed = backend.invalidate_prefix(prefix).await;
    let after = backend.stats().await.entries;
    debug_assert!(before >= after || removed == 0);
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn entry_expiry_is_now_inclusive() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".to_string(),
            payload: vec![],
            created_at: now - Duration::seconds(10),
            expires_at: now,
            operation_kind: "test".to_string(),
        };
        assert!(entry.is_expired_at(now));
        assert!(!entry.is_expired_at(now - Duration::seconds(1)));
    }
}
