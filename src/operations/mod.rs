//! The append-only operation journal.
//!
//! [`OperationStore`] is the capability trait; [`json_file::JsonFileOperationStore`]
//! is the only concrete backend this crate ships -- a JSON-Lines journal
//! file that only ever appends, never rewrites the whole file. A
//! remote-KV-backed store is a drop-in alternative behind the same trait,
//! left unimplemented here as it needs no behavior beyond what
//! [`crate::cache::remote::RemoteBackend`] already demonstrates.

pub mod json_file;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::executor::AssignmentRecord;
use crate::types::{
    AccountId, AccountName, OperationId, PermissionSetArn, PermissionSetName, PrincipalId, PrincipalName,
    PrincipalType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Assign,
    Revoke,
    Rollback,
    BulkAssign,
    BulkRevoke,
    Clone,
    TemplateApply,
}

/// An append-only journal entry. Mutated only by
/// creation and the single-shot `rolled_back` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub timestamp: DateTime<Utc>,
    pub kind: OperationKind,
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub principal_name: PrincipalName,
    pub permission_set_arn: PermissionSetArn,
    pub permission_set_name: PermissionSetName,
    pub account_ids: Vec<AccountId>,
    pub account_names: Vec<AccountName>,
    pub results: Vec<AssignmentRecord>,
    pub metadata: HashMap<String, String>,
    pub rolled_back: bool,
    pub rollback_operation_id: Option<OperationId>,
}

impl OperationRecord {
    pub fn new(
        kind: OperationKind,
        principal_id: PrincipalId,
        principal_type: PrincipalType,
        principal_name: PrincipalName,
        permission_set_arn: PermissionSetArn,
        permission_set_name: PermissionSetName,
        account_ids: Vec<AccountId>,
        account_names: Vec<AccountName>,
        results: Vec<AssignmentRecord>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            operation_id: OperationId::new(),
            timestamp: Utc::now(),
            kind,
            principal_id,
            principal_type,
            principal_name,
            permission_set_arn,
            permission_set_name,
            account_ids,
            account_names,
            results,
            metadata,
            rolled_back: false,
            rollback_operation_id: None,
        }
    }

    /// True when every account id has exactly one matching result, 1:1.
    pub fn accounts_and_results_agree(&self) -> bool {
        self.account_ids.len() == self.results.len()
            && self.results.iter().all(|r| self.account_ids.contains(&r.account_id))
    }

    pub fn successful_account_ids(&self) -> Vec<AccountId> {
        self.results
            .iter()
            .filter(|r| r.outcome == crate::executor::AssignmentOutcome::Succeeded)
            .map(|r| r.account_id.clone())
            .collect()
    }
}

/// A query over the journal's (timestamp, principal, permission-set, kind)
/// index.
#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    pub since_days: Option<u32>,
    pub principal_name: Option<String>,
    pub permission_set_name: Option<String>,
    pub kind: Option<OperationKind>,
}

impl OperationQuery {
    fn matches(&self, record: &OperationRecord) -> bool {
        if let Some(days) = self.since_days {
            if Utc::now() - record.timestamp > chrono::Duration::days(days as i64) {
                return false;
            }
        }
        if let Some(name) = &self.principal_name {
            if &record.principal_name.0 != name {
                return false;
            }
        }
        if let Some(name) = &self.permission_set_name {
            if &record.permission_set_name.0 != name {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        true
    }
}

/// The capability surface a journal backend implements.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn append(&self, record: OperationRecord) -> std::io::Result<()>;
    async fn get(&self, operation_id: OperationId) -> Option<OperationRecord>;
    async fn query(&self, query: &OperationQuery) -> Vec<OperationRecord>;

    /// Flips `rolled_back` on `operation_id` to point at `rollback_id`, via
    /// a single compare-and-set. Returns `false` if
    /// the record doesn't exist or is already rolled back.
    async fn mark_rolled_back(&self, operation_id: OperationId, rollback_id: OperationId) -> bool;

    /// Removes records older than `retention_days`. Idempotent; the only
    /// deletion path.
    async fn sweep(&self, retention_days: u32) -> usize;
}

/// Orders two records by wall-clock timestamp first, breaking ties on
/// operation-id.
pub fn order_key(record: &OperationRecord) -> (DateTime<Utc>, String) {
    (record.timestamp, record.operation_id.to_string())
}

pub fn filter_and_sort(records: Vec<OperationRecord>, query: &OperationQuery) -> Vec<OperationRecord> {
    let mut matched: Vec<OperationRecord> = records.into_iter().filter(|r| query.matches(r)).collect();
    matched.sort_by(|a, b| order_key(a).cmp(&order_key(b)));
    matched
}
