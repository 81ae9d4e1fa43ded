//! The entity resolver.
//!
//! Translates `{username, group name, permission-set name, account name}` to
//! AWS identifiers, in three tiers: an in-process memo for the current run,
//! then [`crate::cache::CacheBackend`], then a paginated AWS lookup. A miss
//! at every tier surfaces as [`CoreError::UnresolvedEntity`]; callers decide
//! whether to abort (single-item commands) or continue (bulk mode).

use chrono::Duration;
use moka::sync::Cache;

use crate::aws::AwsOperations;
use crate::cache::key::namespaced;
use crate::cache::CacheBackend;
use crate::config::CacheTtlTable;
use crate::error::CoreError;
use crate::log_debug;
use crate::types::{PrincipalId, PrincipalType};

/// The kind of entity being resolved, used both as a cache-key segment and
/// in `UnresolvedEntity` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Group,
    PermissionSet,
    Account,
}

impl EntityKind {
    fn cache_segment(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::PermissionSet => "permission_set",
            EntityKind::Account => "account",
        }
    }

    fn display(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::PermissionSet => "permission set",
            EntityKind::Account => "account",
        }
    }
}

/// Upper bound on the in-process memo: a run resolving more distinct
/// entities than this falls back to C1/AWS for the overflow rather than
/// growing without bound.
const MEMO_MAX_CAPACITY: u64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    kind: EntityKind,
    name: String,
}

pub struct EntityResolver<'a> {
    aws: &'a dyn AwsOperations,
    cache: &'a dyn CacheBackend,
    profile: String,
    instance_arn: String,
    identity_store_id: String,
    ttl: CacheTtlTable,
    memo: Cache<MemoKey, String>,
}

impl<'a> EntityResolver<'a> {
    pub fn new(
        aws: &'a dyn AwsOperations,
        cache: &'a dyn CacheBackend,
        profile: impl Into<String>,
        instance_arn: impl Into<String>,
        identity_store_id: impl Into<String>,
        ttl: CacheTtlTable,
    ) -> Self {
        Self {
            aws,
            cache,
            profile: profile.into(),
            instance_arn: instance_arn.into(),
            identity_store_id: identity_store_id.into(),
            ttl,
            memo: Cache::builder().max_capacity(MEMO_MAX_CAPACITY).build(),
        }
    }

    fn ttl_for(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::User | EntityKind::Group => Duration::seconds(self.ttl.resolve_user_group_secs as i64),
            EntityKind::PermissionSet => Duration::seconds(self.ttl.resolve_permission_set_secs as i64),
            EntityKind::Account => Duration::seconds(self.ttl.resolve_account_secs as i64),
        }
    }

    fn cache_key(&self, kind: EntityKind, name: &str) -> String {
        namespaced(&self.profile, &format!("resolve/{}/{name}", kind.cache_segment()))
    }

    fn unresolved(&self, kind: EntityKind, name: &str) -> CoreError {
        CoreError::UnresolvedEntity {
            kind: kind.display().to_string(),
            name: name.to_string(),
        }
    }

    /// Looks the memo then the cache for an already-resolved id; returns
    /// `None` on a genuine miss at both tiers (caller proceeds to AWS).
    async fn lookup_memo_or_cache(&self, kind: EntityKind, name: &str) -> Option<String> {
        let memo_key = MemoKey {
            kind,
            name: name.to_string(),
        };
        if let Some(id) = self.memo.get(&memo_key) {
            log_debug!("resolver memo hit for {:?} '{name}'", kind);
            return Some(id);
        }
        let cache_key = self.cache_key(kind, name);
        if let Some(entry) = self.cache.get(&cache_key).await {
            if let Ok(id) = String::from_utf8(entry.payload) {
                self.memo.insert(memo_key, id.clone());
                return Some(id);
            }
        }
        None
    }

    /// Records a freshly resolved id into both the memo and the cache.
    async fn remember(&self, kind: EntityKind, name: &str, id: &str) {
        let cache_key = self.cache_key(kind, name);
        self.cache
            .put(&cache_key, id.as_bytes().to_vec(), self.ttl_for(kind), kind.cache_segment())
            .await;
        self.memo.insert(
            MemoKey {
                kind,
                name: name.to_string(),
            },
            id.to_string(),
        );
    }

    /// Resolves a user or group name to its identity-store id.
    pub async fn resolve_principal(
        &self,
        principal_type: PrincipalType,
        name: &str,
    ) -> Result<PrincipalId, CoreError> {
        let kind = match principal_type {
            PrincipalType::User => EntityKind::User,
            PrincipalType::Group => EntityKind::Group,
        };
        if let Some(id) = self.lookup_memo_or_cache(kind, name).await {
            return Ok(PrincipalId(id));
        }
        let found = match principal_type {
            PrincipalType::User => self
                .aws
                .list_users(&self.identity_store_id)
                .await?
                .into_iter()
                .find(|u| u.username == name)
                .map(|u| u.id),
            PrincipalType::Group => self
                .aws
                .list_groups(&self.identity_store_id)
                .await?
                .into_iter()
                .find(|g| g.display_name == name)
                .map(|g| g.id),
        };
        match found {
            Some(id) => {
                self.remember(kind, name, &id).await;
                Ok(PrincipalId(id))
            }
            None => Err(self.unresolved(kind, name)),
        }
    }

    /// Resolves a permission-set display name to its ARN.
    pub async fn resolve_permission_set(&self, name: &str) -> Result<String, CoreError> {
        let kind = EntityKind::PermissionSet;
        if let Some(arn) = self.lookup_memo_or_cache(kind, name).await {
            return Ok(arn);
        }
        let arns = self.aws.list_permission_sets(&self.instance_arn).await?;
        for arn in arns {
            if let Ok(config) = self.aws.describe_permission_set(&self.instance_arn, &arn).await {
                if config.name == name {
                    self.remember(kind, name, &arn).await;
                    return Ok(arn);
                }
            }
        }
        Err(self.unresolved(kind, name))
    }

    /// Resolves an account display name to its 12-digit id against an
    /// already-fetched account list (typically the C3 snapshot). Unlike
    /// user/group/permission-set lookups this never calls AWS directly --
    /// the caller supplies the authoritative account set so C3's caching
    /// and change-detection remain the single source of truth for accounts.
    pub async fn resolve_account_by_name(
        &self,
        accounts: &[crate::aws::RawAccount],
        name: &str,
    ) -> Result<String, CoreError> {
        let kind = EntityKind::Account;
        if let Some(id) = self.lookup_memo_or_cache(kind, name).await {
            return Ok(id);
        }
        match accounts.iter().find(|a| a.name == name) {
            Some(a) => {
                self.remember(kind, name, &a.id).await;
                Ok(a.id.clone())
            }
            None => Err(self.unresolved(kind, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mock::MockAws;
    use crate::aws::{RawAccount, RawGroup, RawUser};
    use crate::cache::file::FileBackend;
    use std::collections::HashMap as Map;
    use tempfile::tempdir;

    fn resolver<'a>(aws: &'a MockAws, cache: &'a FileBackend) -> EntityResolver<'a> {
        EntityResolver::new(
            aws,
            cache,
            "dev",
            aws.instance_arn.clone(),
            aws.identity_store_id.clone(),
            CacheTtlTable::default(),
        )
    }

    #[tokio::test]
    async fn resolves_user_by_name() {
        let aws = MockAws::new();
        aws.add_user(RawUser {
            id: "u-1".to_string(),
            username: "alice".to_string(),
        });
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = resolver(&aws, &cache);
        let id = resolver
            .resolve_principal(PrincipalType::User, "alice")
            .await
            .unwrap();
        assert_eq!(id.0, "u-1");
    }

    #[tokio::test]
    async fn unresolved_name_reports_kind_and_name() {
        let aws = MockAws::new();
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = resolver(&aws, &cache);
        let err = resolver
            .resolve_principal(PrincipalType::Group, "ghosts")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::UnresolvedEntity {
                kind: "group".to_string(),
                name: "ghosts".to_string()
            }
        );
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_memo() {
        let aws = MockAws::new();
        aws.add_group(RawGroup {
            id: "g-1".to_string(),
            display_name: "admins".to_string(),
        });
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = resolver(&aws, &cache);
        let first = resolver.resolve_principal(PrincipalType::Group, "admins").await.unwrap();
        let second = resolver.resolve_principal(PrincipalType::Group, "admins").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn resolves_account_from_supplied_snapshot() {
        let aws = MockAws::new();
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = resolver(&aws, &cache);
        let accounts = vec![RawAccount {
            id: "111122223333".to_string(),
            name: "prod".to_string(),
            email: "prod@example.com".to_string(),
            status: "ACTIVE".to_string(),
            ou_id: "ou-1".to_string(),
            tags: Map::new(),
        }];
        let id = resolver.resolve_account_by_name(&accounts, "prod").await.unwrap();
        assert_eq!(id, "111122223333");
    }
}
