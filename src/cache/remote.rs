//! Remote-KV cache backend: a single-table KV store with
//! TTL-driven expiration. Values over 400 KiB are chunked across synthetic
//! sibling keys with a manifest entry; payloads may optionally be
//! zstd-compressed before chunking. Remote storage is always per-profile.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::key::validate_key;
use super::{CacheBackend, CacheEntry, CacheStats};
use crate::error::CoreError;
use crate::log_warn;

/// Maximum size of a single stored record before it is split into chunks.
pub const CHUNK_THRESHOLD_BYTES: usize = 400 * 1024;

/// The minimum surface a remote KV store must expose. Production wiring to
/// DynamoDB/Redis/etc is out of this crate's scope; an
/// [`InMemoryRemoteKv`] stands in for tests.
#[async_trait]
pub trait RemoteKvStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<(Vec<u8>, DateTime<Utc>)>;
    async fn put_raw(&self, key: &str, value: Vec<u8>, expires_at: DateTime<Utc>);
    async fn delete_raw(&self, key: &str);
    async fn scan_keys(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryRemoteKv {
    table: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

#[async_trait]
impl RemoteKvStore for InMemoryRemoteKv {
    async fn get_raw(&self, key: &str) -> Option<(Vec<u8>, DateTime<Utc>)> {
        self.table.lock().unwrap().get(key).cloned()
    }

    async fn put_raw(&self, key: &str, value: Vec<u8>, expires_at: DateTime<Utc>) {
        self.table.lock().unwrap().insert(key.to_string(), (value, expires_at));
    }

    async fn delete_raw(&self, key: &str) {
        self.table.lock().unwrap().remove(key);
    }

    async fn scan_keys(&self) -> Vec<String> {
        self.table.lock().unwrap().keys().cloned().collect()
    }
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    operation_kind: String,
    compressed: bool,
    chunk_count: u32,
    total_len: usize,
}

fn chunk_key(key: &str, index: u32) -> String {
    format!("{key}#chunk{index}")
}

pub struct RemoteBackend {
    store: Box<dyn RemoteKvStore>,
    profile: String,
    compress: bool,
}

impl RemoteBackend {
    /// `profile` must be non-empty: remote storage is always per-account.
    /// Returns an error rather than silently defaulting.
    pub fn new(store: Box<dyn RemoteKvStore>, profile: impl Into<String>, compress: bool) -> Result<Self, CoreError> {
        let profile = profile.into();
        if profile.trim().is_empty() {
            return Err(CoreError::Validation {
                field: "profile".to_string(),
                message: "remote cache backend requires a non-empty profile namespace".to_string(),
            });
        }
        Ok(Self {
            store,
            profile,
            compress,
        })
    }
}

#[async_trait]
impl CacheBackend for RemoteBackend {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        if validate_key(key).is_err() {
            return None;
        }
        let (manifest_bytes, expires_at) = self.store.get_raw(key).await?;
        let now = Utc::now();
        if now >= expires_at {
            return None;
        }
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes).ok()?;
        if now >= manifest.expires_at {
            return None;
        }
        let mut payload = Vec::with_capacity(manifest.total_len);
        for i in 0..manifest.chunk_count {
            let (chunk, _) = self.store.get_raw(&chunk_key(key, i)).await?;
            payload.extend_from_slice(&chunk);
        }
        if manifest.compressed {
            payload = zstd::decode_all(&payload[..]).ok()?;
        }
        Some(CacheEntry {
            key: manifest.key,
            payload,
            created_at: manifest.created_at,
            expires_at: manifest.expires_at,
            operation_kind: manifest.operation_kind,
        })
    }

    async fn get_ignoring_ttl(&self, key: &str) -> Option<CacheEntry> {
        if validate_key(key).is_err() {
            return None;
        }
        let (manifest_bytes, _) = self.store.get_raw(key).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes).ok()?;
        let mut payload = Vec::with_capacity(manifest.total_len);
        for i in 0..manifest.chunk_count {
            let (chunk, _) = self.store.get_raw(&chunk_key(key, i)).await?;
            payload.extend_from_slice(&chunk);
        }
        if manifest.compressed {
            payload = zstd::decode_all(&payload[..]).ok()?;
        }
        Some(CacheEntry {
            key: manifest.key,
            payload,
            created_at: manifest.created_at,
            expires_at: manifest.expires_at,
            operation_kind: manifest.operation_kind,
        })
    }

    async fn put(&self, key: &str, payload: Vec<u8>, ttl: Duration, operation_kind: &str) {
        if let Err(e) = validate_key(key) {
            log_warn!("refusing to cache invalid key '{key}': {e}");
            return;
        }
        let now = Utc::now();
        let expires_at = now + ttl;
        let (body, compressed) = if self.compress {
            match zstd::encode_all(&payload[..], 13) {
                Ok(c) if c.len() < payload.len() => (c, true),
                _ => (payload.clone(), false),
            }
        } else {
            (payload.clone(), false)
        };
        let chunks: Vec<&[u8]> = body.chunks(CHUNK_THRESHOLD_BYTES).collect();
        let chunk_count = chunks.len().max(1) as u32;
        for (i, chunk) in chunks.iter().enumerate() {
            self.store.put_raw(&chunk_key(key, i as u32), chunk.to_vec(), expires_at).await;
        }
        if chunks.is_empty() {
            self.store.put_raw(&chunk_key(key, 0), Vec::new(), expires_at).await;
        }
        let manifest = Manifest {
            key: key.to_string(),
            created_at: now,
            expires_at,
            operation_kind: operation_kind.to_string(),
            compressed,
            chunk_count,
            total_len: body.len(),
        };
        match serde_json::to_vec(&manifest) {
            Ok(bytes) => self.store.put_raw(key, bytes, expires_at).await,
            Err(e) => log_warn!("cache manifest encode failed for '{key}': {e}"),
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Some((manifest_bytes, _)) = self.store.get_raw(key).await {
            if let Ok(manifest) = serde_json::from_slice::<Manifest>(&manifest_bytes) {
                for i in 0..manifest.chunk_count {
                    self.store.delete_raw(&chunk_key(key, i)).await;
                }
            }
        }
        self.store.delete_raw(key).await;
    }

    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys = self.store.scan_keys().await;
        let matching: Vec<String> = keys
            .into_iter()
            .filter(|k| k.starts_with(prefix) && !k.contains("#chunk"))
            .collect();
        let mut removed = 0;
        for key in matching {
            self.invalidate(&key).await;
            removed += 1;
        }
        removed
    }

    async fn enumerate(&self) -> Vec<String> {
        self.store
            .scan_keys()
            .await
            .into_iter()
            .filter(|k| !k.contains("#chunk"))
            .collect()
    }

    async fn stats(&self) -> CacheStats {
        let keys = self.store.scan_keys().await;
        let manifests: Vec<String> = keys.iter().filter(|k| !k.contains("#chunk")).cloned().collect();
        let mut approx_bytes = 0u64;
        for key in &keys {
            if let Some((bytes, _)) = self.store.get_raw(key).await {
                approx_bytes += bytes.len() as u64;
            }
        }
        CacheStats {
            entries: manifests.len(),
            approx_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_construction_without_profile() {
        let store = Box::new(InMemoryRemoteKv::default());
        assert!(RemoteBackend::new(store, "", false).is_err());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = Box::new(InMemoryRemoteKv::default());
        let backend = RemoteBackend::new(store, "dev", false).unwrap();
        backend.put("profiles/dev/accounts/snapshot", b"hello".to_vec(), Duration::seconds(60), "snapshot").await;
        let entry = backend.get("profiles/dev/accounts/snapshot").await.unwrap();
        assert_eq!(entry.payload, b"hello");
    }

    #[tokio::test]
    async fn large_payload_is_chunked_and_reassembled() {
        let store = Box::new(InMemoryRemoteKv::default());
        let backend = RemoteBackend::new(store, "dev", false).unwrap();
        let payload = vec![42u8; CHUNK_THRESHOLD_BYTES * 3 + 17];
        backend.put("profiles/dev/big", payload.clone(), Duration::seconds(60), "big").await;
        let entry = backend.get("profiles/dev/big").await.unwrap();
        assert_eq!(entry.payload, payload);
    }

    #[tokio::test]
    async fn compression_round_trips() {
        let store = Box::new(InMemoryRemoteKv::default());
        let backend = RemoteBackend::new(store, "dev", true).unwrap();
        let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        backend.put("profiles/dev/compressible", payload.clone(), Duration::seconds(60), "x").await;
        assert_eq!(backend.get("profiles/dev/compressible").await.unwrap().payload, payload);
    }

    #[tokio::test]
    async fn invalidate_prefix_removes_chunks_and_reports_delta() {
        let store = Box::new(InMemoryRemoteKv::default());
        let backend = RemoteBackend::new(store, "dev", false).unwrap();
        backend.put("profiles/dev/accounts/snapshot", vec![1u8; CHUNK_THRESHOLD_BYTES + 1], Duration::seconds(60), "s").await;
        backend.put("profiles/dev/resolve/user/alice", b"x".to_vec(), Duration::seconds(60), "r").await;
        let (before, after) = super::super::invalidate_prefix_with_delta(&backend, "profiles/dev/accounts/").await;
        assert_eq!(before, 2);
        assert_eq!(after, 1);
    }
}
