//! Hybrid cache backend: a short-TTL file tier fronting a
//! long-TTL remote tier. Reads hit the file tier first; on miss, fall
//! through to remote and refill the file tier. Writes go to remote first,
//! then file, so a crash between the two still leaves the remote copy
//! authoritative.

use async_trait::async_trait;
use chrono::Duration;

use super::{CacheBackend, CacheEntry, CacheStats};

pub struct HybridBackend {
    file: Box<dyn CacheBackend>,
    remote: Box<dyn CacheBackend>,
    /// TTL applied to the file tier's refill writes, independent of the
    /// caller's requested TTL (which always governs the remote tier).
    file_ttl: Duration,
}

impl HybridBackend {
    pub fn new(file: Box<dyn CacheBackend>, remote: Box<dyn CacheBackend>, file_ttl: Duration) -> Self {
        Self {
            file,
            remote,
            file_ttl,
        }
    }
}

#[async_trait]
impl CacheBackend for HybridBackend {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.file.get(key).await {
            return Some(entry);
        }
        let entry = self.remote.get(key).await?;
        self.file
            .put(key, entry.payload.clone(), self.file_ttl, &entry.operation_kind)
            .await;
        Some(entry)
    }

    async fn get_ignoring_ttl(&self, key: &str) -> Option<CacheEntry> {
        // The remote tier carries the caller's actual requested TTL and is
        // authoritative; the file tier's TTL is always the shorter,
        // independent refill TTL, so prefer remote for a stale-but-valid read.
        if let Some(entry) = self.remote.get_ignoring_ttl(key).await {
            return Some(entry);
        }
        self.file.get_ignoring_ttl(key).await
    }

    async fn put(&self, key: &str, payload: Vec<u8>, ttl: Duration, operation_kind: &str) {
        self.remote.put(key, payload.clone(), ttl, operation_kind).await;
        self.file.put(key, payload, self.file_ttl.min(ttl), operation_kind).await;
    }

    async fn invalidate(&self, key: &str) {
        self.remote.invalidate(key).await;
        self.file.invalidate(key).await;
    }

    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        // The remote tier is authoritative for the count; the file tier's
        // removal is best-effort refill cleanup and may already be absent
        // or stale for entries it never refilled.
        let removed = self.remote.invalidate_prefix(prefix).await;
        self.file.invalidate_prefix(prefix).await;
        removed
    }

    async fn enumerate(&self) -> Vec<String> {
        self.remote.enumerate().await
    }

    async fn stats(&self) -> CacheStats {
        self.remote.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::file::FileBackend;
    use crate::cache::remote::{InMemoryRemoteKv, RemoteBackend};
    use tempfile::tempdir;

    fn backend(dir: &std::path::Path) -> HybridBackend {
        let file = FileBackend::open(dir, None).unwrap();
        let remote = RemoteBackend::new(Box::new(InMemoryRemoteKv::default()), "dev", false).unwrap();
        HybridBackend::new(Box::new(file), Box::new(remote), Duration::seconds(5))
    }

    #[tokio::test]
    async fn write_then_read_hits_file_tier() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        backend.put("profiles/dev/k", b"v".to_vec(), Duration::seconds(120), "k").await;
        assert_eq!(backend.get("profiles/dev/k").await.unwrap().payload, b"v");
    }

    #[tokio::test]
    async fn remote_miss_repopulates_file_tier() {
        let dir = tempdir().unwrap();
        let file = FileBackend::open(dir.path(), None).unwrap();
        let remote = RemoteBackend::new(Box::new(InMemoryRemoteKv::default()), "dev", false).unwrap();
        // Write directly to remote only, bypassing the hybrid's write path.
        remote.put("profiles/dev/k", b"remote-only".to_vec(), Duration::seconds(120), "k").await;
        let hybrid = HybridBackend::new(Box::new(file), Box::new(remote), Duration::seconds(5));
        assert!(hybrid.get("profiles/dev/k").await.is_some());
        // Second read must now be served by the file tier without remote involvement --
        // verified indirectly: the value is still correct.
        assert_eq!(hybrid.get("profiles/dev/k").await.unwrap().payload, b"remote-only");
    }
}
