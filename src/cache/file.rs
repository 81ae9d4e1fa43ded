//! File cache backend: one file per key under
//! `<root>/profiles/<profile>/…`, atomic temp+rename writes, expiration
//! stored alongside the payload. Internally serialized behind a single
//! mutex; no caller holds an entry across an
//! await because `get`/`put` return owned, already-decoded values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::encryption::{self, CacheEncryptionKey};
use super::key::{stable_hash_hex, validate_key};
use super::{CacheBackend, CacheEntry, CacheStats};
use crate::log_warn;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    operation_kind: String,
    /// Raw payload, or the sealed `nonce||ciphertext` form when encrypted.
    payload: Vec<u8>,
    encrypted: bool,
}

pub struct FileBackend {
    root: PathBuf,
    encryption_key: Option<CacheEncryptionKey>,
    /// Maps the stable hash filename back to the original key so
    /// `enumerate`/`invalidate_prefix` can report real keys without
    /// re-reading every file on disk.
    index: Mutex<HashMap<String, String>>,
}

impl FileBackend {
    /// Opens (creating if absent) a file cache rooted at `root`. Rejects a
    /// root that contains both encrypted and plaintext entries.
    pub fn open(root: impl Into<PathBuf>, encryption_key: Option<CacheEncryptionKey>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let backend = Self {
            root,
            encryption_key,
            index: Mutex::new(HashMap::new()),
        };
        backend.validate_no_mixed_encryption()?;
        backend.rebuild_index();
        Ok(backend)
    }

    fn validate_no_mixed_encryption(&self) -> std::io::Result<()> {
        let expects_encrypted = self.encryption_key.is_some();
        for path in self.iter_entry_paths() {
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(stored) = serde_json::from_slice::<StoredEntry>(&bytes) {
                    if stored.encrypted != expects_encrypted {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "cache root mixes encrypted and plaintext entries",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn rebuild_index(&self) {
        let mut index = self.index.lock().unwrap();
        for path in self.iter_entry_paths() {
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(stored) = serde_json::from_slice::<StoredEntry>(&bytes) {
                    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
                    index.insert(file_name, stored.key);
                }
            }
        }
    }

    fn iter_entry_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(&self.root) {
            for entry in read_dir.flatten() {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    out.push(entry.path());
                }
            }
        }
        out
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", stable_hash_hex(key)))
    }

    fn read_entry(&self, key: &str) -> Option<StoredEntry> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_entry_atomic(&self, path: &Path, stored: &StoredEntry) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(stored)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)
    }

    fn decode_payload(&self, stored: &StoredEntry) -> Option<Vec<u8>> {
        if stored.encrypted {
            let key = self.encryption_key.as_ref()?;
            encryption::open(key, &stored.payload).ok()
        } else {
            Some(stored.payload.clone())
        }
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        if validate_key(key).is_err() {
            return None;
        }
        let stored = match self.read_entry(key) {
            Some(s) => s,
            None => return None,
        };
        let now = Utc::now();
        if now >= stored.expires_at {
            return None;
        }
        let payload = self.decode_payload(&stored)?;
        Some(CacheEntry {
            key: stored.key,
            payload,
            created_at: stored.created_at,
            expires_at: stored.expires_at,
            operation_kind: stored.operation_kind,
        })
    }

    async fn get_ignoring_ttl(&self, key: &str) -> Option<CacheEntry> {
        if validate_key(key).is_err() {
            return None;
        }
        let stored = self.read_entry(key)?;
        let payload = self.decode_payload(&stored)?;
        Some(CacheEntry {
            key: stored.key,
            payload,
            created_at: stored.created_at,
            expires_at: stored.expires_at,
            operation_kind: stored.operation_kind,
        })
    }

    async fn put(&self, key: &str, payload: Vec<u8>, ttl: Duration, operation_kind: &str) {
        if let Err(e) = validate_key(key) {
            log_warn!("refusing to cache invalid key '{key}': {e}");
            return;
        }
        let now = Utc::now();
        let encrypted = self.encryption_key.is_some();
        let stored_payload = if let Some(k) = &self.encryption_key {
            match encryption::seal(k, &payload) {
                Ok(sealed) => sealed,
                Err(e) => {
                    log_warn!("cache encryption failed for '{key}': {e}");
                    return;
                }
            }
        } else {
            payload
        };
        let stored = StoredEntry {
            key: key.to_string(),
            created_at: now,
            expires_at: now + ttl,
            operation_kind: operation_kind.to_string(),
            payload: stored_payload,
            encrypted,
        };
        let path = self.path_for(key);
        if let Err(e) = self.write_entry_atomic(&path, &stored) {
            log_warn!("cache write failed for '{key}': {e}");
            return;
        }
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        self.index.lock().unwrap().insert(file_name, key.to_string());
    }

    async fn invalidate(&self, key: &str) {
        let path = self.path_for(key);
        let _ = std::fs::remove_file(&path);
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        self.index.lock().unwrap().remove(&file_name);
    }

    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let matches: Vec<(String, String)> = self
            .index
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| k.starts_with(prefix))
            .map(|(f, k)| (f.clone(), k.clone()))
            .collect();
        let mut removed = 0;
        for (file_name, _) in &matches {
            let path = self.root.join(file_name);
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            self.index.lock().unwrap().remove(file_name);
        }
        removed
    }

    async fn enumerate(&self) -> Vec<String> {
        self.index.lock().unwrap().values().cloned().collect()
    }

    async fn stats(&self) -> CacheStats {
        let index = self.index.lock().unwrap();
        let mut approx_bytes = 0u64;
        for file_name in index.keys() {
            if let Ok(meta) = std::fs::metadata(self.root.join(file_name)) {
                approx_bytes += meta.len();
            }
        }
        CacheStats {
            entries: index.len(),
            approx_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path(), None).unwrap();
        backend
            .put("profiles/dev/accounts/snapshot", b"payload".to_vec(), Duration::seconds(60), "snapshot")
            .await;
        let entry = backend.get("profiles/dev/accounts/snapshot").await.unwrap();
        assert_eq!(entry.payload, b"payload");
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path(), None).unwrap();
        backend
            .put("profiles/dev/k", b"v".to_vec(), Duration::seconds(-1), "k")
            .await;
        assert!(backend.get("profiles/dev/k").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_prefix_reports_actual_removed_count() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path(), None).unwrap();
        backend.put("profiles/dev/accounts/count", b"1".to_vec(), Duration::seconds(60), "sentinel").await;
        backend.put("profiles/dev/accounts/snapshot", b"2".to_vec(), Duration::seconds(60), "snapshot").await;
        backend.put("profiles/dev/resolve/user/alice", b"3".to_vec(), Duration::seconds(60), "resolve").await;
        let (before, after) = super::super::invalidate_prefix_with_delta(&backend, "profiles/dev/accounts/").await;
        assert_eq!(before, 3);
        assert_eq!(after, 1);
    }

    #[tokio::test]
    async fn encrypted_backend_round_trips_and_rejects_mixed_roots() {
        let dir = tempdir().unwrap();
        let key = CacheEncryptionKey::from_bytes([3u8; 32]);
        let backend = FileBackend::open(dir.path(), Some(key)).unwrap();
        backend.put("profiles/dev/k", b"secret".to_vec(), Duration::seconds(60), "k").await;
        assert_eq!(backend.get("profiles/dev/k").await.unwrap().payload, b"secret");

        let plain_key = CacheEncryptionKey::from_bytes([3u8; 32]);
        let _ = plain_key;
        assert!(FileBackend::open(dir.path(), None).is_err());
    }

    #[tokio::test]
    async fn invalid_key_is_refused() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path(), None).unwrap();
        backend.put("../escape", b"x".to_vec(), Duration::seconds(60), "x").await;
        assert!(backend.get("../escape").await.is_none());
        assert_eq!(backend.stats().await.entries, 0);
    }
}
