//! Typed configuration consumed by the core.
//!
//! Loading `config.yaml` and applying `AWSIDEMAN_*` environment overrides is
//! the external configuration system's job; `CoreConfig` is just
//! the value it hands the core. `apply_env_overrides` documents that seam
//! without doing the external system's job of full file loading.

use serde::{Deserialize, Serialize};

/// Selects which [`crate::cache::CacheBackend`] implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    File,
    Remote,
    Hybrid,
}

/// TTLs for the cache entries the core writes itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlTable {
    pub resolve_user_group_secs: u64,
    pub resolve_permission_set_secs: u64,
    pub resolve_account_secs: u64,
    pub account_sentinel_secs: u64,
    pub account_snapshot_secs: u64,
}

impl Default for CacheTtlTable {
    fn default() -> Self {
        Self {
            resolve_user_group_secs: 30 * 60,
            resolve_permission_set_secs: 2 * 60 * 60,
            resolve_account_secs: 2 * 60 * 60,
            account_sentinel_secs: 60 * 60,
            account_snapshot_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub ttl_table: CacheTtlTable,
    pub encrypted: bool,
    pub root_dir: Option<std::path::PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::File,
            ttl_table: CacheTtlTable::default(),
            encrypted: false,
            root_dir: None,
        }
    }
}

/// Tunable knobs for the executor, cache, and journal, gathered into one
/// explicit configuration value rather than scattered magic numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Worker pool size; 0 means auto-scale by organization size.
    pub max_concurrent_accounts: u32,
    /// Default batch size for bulk operations.
    pub batch_size: u32,
    /// Base delay between non-retried calls, for gentle pacing.
    pub rate_limit_delay_ms: u64,
    /// Per-account provisioning-poll timeout.
    pub account_timeout_s: u64,
    /// Max retry attempts for a single AWS call.
    pub max_retries: u32,
    /// Whether a multi-account run continues past per-account failures.
    pub continue_on_error: bool,
    pub cache: CacheConfig,
    /// Operation log retention, in days.
    pub retention_days: u32,
    /// Mandatory namespace for the remote cache backend.
    pub profile_namespace: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_accounts: 0,
            batch_size: 50,
            rate_limit_delay_ms: 50,
            account_timeout_s: 60,
            max_retries: 3,
            continue_on_error: true,
            cache: CacheConfig::default(),
            retention_days: 90,
            profile_namespace: "default".to_string(),
        }
    }
}

impl CoreConfig {
    /// Worker pool size for a given organization size, applying the
    /// auto-scaling table below when `max_concurrent_accounts == 0`.
    pub fn effective_concurrency(&self, account_count: usize) -> u32 {
        if self.max_concurrent_accounts != 0 {
            return self.max_concurrent_accounts;
        }
        if account_count <= 10 {
            15
        } else if account_count <= 50 {
            25
        } else {
            30
        }
    }

    /// Apply `AWSIDEMAN_*` environment overrides on top of a loaded config.
    /// Only the scalar fields listed below are overridable; nested
    /// cache/ttl configuration is the external config system's concern.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AWSIDEMAN_MAX_CONCURRENT_ACCOUNTS") {
            if let Ok(n) = v.parse() {
                self.max_concurrent_accounts = n;
            }
        }
        if let Ok(v) = std::env::var("AWSIDEMAN_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("AWSIDEMAN_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("AWSIDEMAN_CONTINUE_ON_ERROR") {
            if let Ok(b) = v.parse() {
                self.continue_on_error = b;
            }
        }
        if let Ok(v) = std::env::var("AWSIDEMAN_RETENTION_DAYS") {
            if let Ok(n) = v.parse() {
                self.retention_days = n;
            }
        }
    }
}
