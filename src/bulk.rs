//! The bulk pipeline.
//!
//! CSV or JSON in, a sequence of `assign`/`revoke` triples out, run through
//! the same [`crate::executor::MultiAccountExecutor`] and [`crate::operations`]
//! machinery single-item commands use. Every stage collects errors instead
//! of aborting on the first one, the way `cloudformation_manager`'s
//! template validators accumulate a whole batch of diagnostics before
//! giving up.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::accounts::filter::{evaluate, FilterExpr};
use crate::accounts::Account;
use crate::aws::AwsOperations;
use crate::error::CoreError;
use crate::executor::{AssignmentRecord, ErrorPolicy, ExecutionRequest, ExecutorConfig, MultiAccountExecutor};
use crate::log_warn;
use crate::operations::{OperationKind, OperationRecord, OperationStore};
use crate::resolver::EntityResolver;
use crate::types::{AccountId, Direction, PermissionSetArn, PermissionSetName, PrincipalId, PrincipalName, PrincipalType};

/// One row of bulk input, after CSV/JSON-specific parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRecord {
    pub principal_name: String,
    #[serde(default = "default_principal_type")]
    pub principal_type: PrincipalType,
    pub permission_set_name: String,
    pub account_name: String,
    pub account_id: Option<String>,
    pub permission_set_arn: Option<String>,
    pub principal_id: Option<String>,
}

fn default_principal_type() -> PrincipalType {
    PrincipalType::User
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRowError {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct JsonBulkFile {
    assignments: Vec<JsonBulkRecord>,
}

#[derive(Debug, Deserialize)]
struct JsonBulkRecord {
    principal_name: String,
    #[serde(default)]
    principal_type: Option<String>,
    permission_set_name: String,
    account_name: String,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    permission_set_arn: Option<String>,
    #[serde(default)]
    principal_id: Option<String>,
}

/// Stage 1: parse and schema-check. Collects *all*
/// row-level errors rather than stopping at the first malformed row.
pub struct BulkParser;

impl BulkParser {
    pub fn parse_file(path: &Path) -> Result<Vec<BulkRecord>, Vec<BulkRowError>> {
        let mut contents = String::new();
        std::fs::File::open(path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|e| vec![BulkRowError { row: 0, message: format!("failed to read {}: {e}", path.display()) }])?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => Self::parse_csv(&contents),
            Some("json") => Self::parse_json(&contents),
            other => Err(vec![BulkRowError {
                row: 0,
                message: format!("unrecognized bulk file extension {other:?}, expected .csv or .json"),
            }]),
        }
    }

    /// Headers may be snake_case or kebab-case; blank lines are
    /// ignored.
    pub fn parse_csv(contents: &str) -> Result<Vec<BulkRecord>, Vec<BulkRowError>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(contents.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| vec![BulkRowError { row: 0, message: format!("invalid CSV header: {e}") }])?
            .iter()
            .map(|h| h.trim().replace('-', "_").to_ascii_lowercase())
            .collect();

        let col = |name: &str| headers.iter().position(|h| h == name);
        let required = ["principal_name", "permission_set_name", "account_name"];
        let mut errors = Vec::new();
        for name in required {
            if col(name).is_none() {
                errors.push(BulkRowError {
                    row: 0,
                    message: format!("missing required column '{name}'"),
                });
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let principal_name_col = col("principal_name").unwrap();
        let permission_set_name_col = col("permission_set_name").unwrap();
        let account_name_col = col("account_name").unwrap();
        let principal_type_col = col("principal_type");
        let account_id_col = col("account_id");
        let permission_set_arn_col = col("permission_set_arn");
        let principal_id_col = col("principal_id");

        let mut records = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let row_number = idx + 2; // header is row 1
            let row = match result {
                Ok(r) => r,
                Err(e) => {
                    errors.push(BulkRowError { row: row_number, message: e.to_string() });
                    continue;
                }
            };
            if row.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            let get = |i: usize| row.get(i).unwrap_or("").trim().to_string();
            let principal_name = get(principal_name_col);
            let permission_set_name = get(permission_set_name_col);
            let account_name = get(account_name_col);
            if principal_name.is_empty() || permission_set_name.is_empty() || account_name.is_empty() {
                errors.push(BulkRowError {
                    row: row_number,
                    message: "principal_name, permission_set_name and account_name are required".to_string(),
                });
                continue;
            }

            let principal_type = match principal_type_col.map(&get) {
                Some(s) if !s.is_empty() => match s.parse::<PrincipalType>() {
                    Ok(pt) => pt,
                    Err(e) => {
                        errors.push(BulkRowError { row: row_number, message: e.to_string() });
                        continue;
                    }
                },
                _ => PrincipalType::User,
            };

            records.push(BulkRecord {
                principal_name,
                principal_type,
                permission_set_name,
                account_name,
                account_id: account_id_col.map(&get).filter(|s| !s.is_empty()),
                permission_set_arn: permission_set_arn_col.map(&get).filter(|s| !s.is_empty()),
                principal_id: principal_id_col.map(&get).filter(|s| !s.is_empty()),
            });
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(records)
    }

    pub fn parse_json(contents: &str) -> Result<Vec<BulkRecord>, Vec<BulkRowError>> {
        let file: JsonBulkFile = serde_json::from_str(contents)
            .map_err(|e| vec![BulkRowError { row: 0, message: format!("invalid JSON bulk file: {e}") }])?;

        let mut errors = Vec::new();
        let mut records = Vec::new();
        for (idx, raw) in file.assignments.into_iter().enumerate() {
            let principal_type = match raw.principal_type {
                Some(s) => match s.parse::<PrincipalType>() {
                    Ok(pt) => pt,
                    Err(e) => {
                        errors.push(BulkRowError { row: idx, message: e.to_string() });
                        continue;
                    }
                },
                None => PrincipalType::User,
            };
            records.push(BulkRecord {
                principal_name: raw.principal_name,
                principal_type,
                permission_set_name: raw.permission_set_name,
                account_name: raw.account_name,
                account_id: raw.account_id,
                permission_set_arn: raw.permission_set_arn,
                principal_id: raw.principal_id,
            });
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(records)
    }
}

/// A fully resolved, expanded, one-account-one-principal-one-permission-set
/// triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAssignment {
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub permission_set_arn: PermissionSetArn,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewRow {
    pub assignment: ResolvedAssignment,
    pub already_satisfies_target: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BulkPreview {
    pub rows: Vec<PreviewRow>,
    pub duplicates_removed: usize,
    pub conflicts: usize,
}

pub struct BulkOutcome {
    pub operations: Vec<OperationRecord>,
    pub exit_code: u8,
}

fn looks_like_filter_expression(account_name: &str) -> bool {
    account_name == "*"
        || account_name.starts_with("id:")
        || account_name.starts_with("name:")
        || account_name.starts_with("ou:")
        || account_name.starts_with("tag:")
        || account_name.starts_with("exclude:")
        || account_name.contains(" AND ")
        || account_name.contains(" OR ")
}

pub struct BulkPipeline<'a> {
    aws: &'a dyn AwsOperations,
    resolver: &'a EntityResolver<'a>,
    store: &'a dyn OperationStore,
    instance_arn: String,
}

impl<'a> BulkPipeline<'a> {
    pub fn new(aws: &'a dyn AwsOperations, resolver: &'a EntityResolver<'a>, store: &'a dyn OperationStore, instance_arn: impl Into<String>) -> Self {
        Self {
            aws,
            resolver,
            store,
            instance_arn: instance_arn.into(),
        }
    }

    /// Resolve every unique name, expand account wildcards via the account
    /// filter, and deduplicate identical triples. Row-level resolution
    /// failures are collected rather than aborting the whole file.
    pub async fn resolve_and_expand(
        &self,
        records: &[BulkRecord],
        accounts: &[Account],
    ) -> (Vec<ResolvedAssignment>, usize, Vec<BulkRowError>) {
        let mut errors = Vec::new();
        let mut drafts = Vec::new();

        for (idx, record) in records.iter().enumerate() {
            let principal_id = match &record.principal_id {
                Some(id) => PrincipalId(id.clone()),
                None => match self.resolver.resolve_principal(record.principal_type, &record.principal_name).await {
                    Ok(id) => id,
                    Err(e) => {
                        errors.push(BulkRowError { row: idx, message: e.to_string() });
                        continue;
                    }
                },
            };

            let permission_set_arn = match &record.permission_set_arn {
                Some(arn) => PermissionSetArn(arn.clone()),
                None => match self.resolver.resolve_permission_set(&record.permission_set_name).await {
                    Ok(arn) => PermissionSetArn(arn),
                    Err(e) => {
                        errors.push(BulkRowError { row: idx, message: e.to_string() });
                        continue;
                    }
                },
            };

            let account_ids: Vec<AccountId> = if let Some(id) = &record.account_id {
                vec![AccountId(id.clone())]
            } else if looks_like_filter_expression(&record.account_name) {
                match FilterExpr::parse(&record.account_name) {
                    Ok(expr) => evaluate(&expr, accounts).into_iter().map(|a| a.id).collect(),
                    Err(e) => {
                        errors.push(BulkRowError { row: idx, message: e.to_string() });
                        continue;
                    }
                }
            } else {
                match self.resolver.resolve_account_by_name(&to_raw_accounts(accounts), &record.account_name).await {
                    Ok(id) => vec![AccountId(id)],
                    Err(e) => {
                        errors.push(BulkRowError { row: idx, message: e.to_string() });
                        continue;
                    }
                }
            };

            for account_id in account_ids {
                drafts.push(ResolvedAssignment {
                    principal_id: principal_id.clone(),
                    principal_type: record.principal_type,
                    permission_set_arn: permission_set_arn.clone(),
                    account_id,
                });
            }
        }

        let before = drafts.len();
        let mut seen = HashSet::new();
        let deduped: Vec<ResolvedAssignment> = drafts.into_iter().filter(|d| seen.insert(d.clone())).collect();
        let duplicates_removed = before - deduped.len();

        (deduped, duplicates_removed, errors)
    }

    /// Stage 5: preview. Probes current assignment state read-only so the
    /// caller can render conflicts.
    pub async fn preview(&self, resolved: Vec<ResolvedAssignment>, duplicates_removed: usize, direction: Direction) -> BulkPreview {
        let mut rows = Vec::with_capacity(resolved.len());
        let mut conflicts = 0;
        for assignment in resolved {
            let present = match self
                .aws
                .list_account_assignments(&self.instance_arn, &assignment.account_id.0, &assignment.permission_set_arn.0)
                .await
            {
                Ok(tuples) => tuples.iter().any(|t| t.principal_id == assignment.principal_id.0),
                Err(e) => {
                    log_warn!("preview probe failed for account {}: {e}", assignment.account_id);
                    false
                }
            };
            let already_satisfies_target = match direction {
                Direction::Assign => present,
                Direction::Revoke => !present,
            };
            if already_satisfies_target {
                conflicts += 1;
            }
            rows.push(PreviewRow { assignment, already_satisfies_target });
        }
        BulkPreview { rows, duplicates_removed, conflicts }
    }

    /// Execute via the multi-account executor, grouped by (principal,
    /// permission-set) since the executor's contract is one
    /// principal/permission-set pair against many accounts; a file naming
    /// several principals produces one operation record per group. `dry_run`
    /// skips every AWS call and returns a plan only -- no operation record
    /// is written.
    pub async fn execute(
        &self,
        resolved: Vec<ResolvedAssignment>,
        direction: Direction,
        concurrency: u32,
        max_retries: u32,
        error_policy: ErrorPolicy,
        dry_run: bool,
    ) -> BulkOutcome {
        if resolved.is_empty() {
            return BulkOutcome { operations: Vec::new(), exit_code: 2 };
        }
        if dry_run {
            return BulkOutcome { operations: Vec::new(), exit_code: 0 };
        }

        let mut groups: Vec<(PrincipalId, PrincipalType, PermissionSetArn, Vec<AccountId>)> = Vec::new();
        for assignment in resolved {
            if let Some(group) = groups
                .iter_mut()
                .find(|(pid, _, arn, _)| *pid == assignment.principal_id && *arn == assignment.permission_set_arn)
            {
                group.3.push(assignment.account_id);
            } else {
                groups.push((
                    assignment.principal_id,
                    assignment.principal_type,
                    assignment.permission_set_arn,
                    vec![assignment.account_id],
                ));
            }
        }

        let executor = MultiAccountExecutor::new(
            self.aws,
            ExecutorConfig {
                max_concurrent_accounts: concurrency,
                account_timeout: std::time::Duration::from_secs(60),
                max_retries,
                error_policy,
            },
        );

        let kind = match direction {
            Direction::Assign => OperationKind::BulkAssign,
            Direction::Revoke => OperationKind::BulkRevoke,
        };

        let mut operations = Vec::new();
        let mut any_failed = false;
        for (principal_id, principal_type, permission_set_arn, accounts) in groups {
            let account_ids = accounts.clone();
            let request = ExecutionRequest {
                principal_id: principal_id.clone(),
                principal_type,
                permission_set_arn: permission_set_arn.clone(),
                instance_arn: self.instance_arn.clone(),
                accounts,
                direction,
            };
            let results: Vec<AssignmentRecord> = executor
                .execute(request, std::sync::Arc::new(tokio::sync::Notify::new()), None)
                .await;
            any_failed |= results
                .iter()
                .any(|r| r.outcome == crate::executor::AssignmentOutcome::Failed);

            let record = OperationRecord::new(
                kind,
                principal_id.clone(),
                principal_type,
                PrincipalName(principal_id.0.clone()),
                permission_set_arn.clone(),
                PermissionSetName(permission_set_arn.0.clone()),
                account_ids,
                Vec::new(),
                results,
                Default::default(),
            );
            if let Err(e) = self.store.append(record.clone()).await {
                log_warn!("failed to persist bulk operation record: {e}");
            }
            operations.push(record);
        }

        BulkOutcome {
            operations,
            exit_code: if any_failed { 1 } else { 0 },
        }
    }
}

fn to_raw_accounts(accounts: &[Account]) -> Vec<crate::aws::RawAccount> {
    accounts
        .iter()
        .map(|a| crate::aws::RawAccount {
            id: a.id.0.clone(),
            name: a.name.0.clone(),
            email: a.email.clone(),
            status: match a.status {
                crate::types::AccountStatus::Active => "ACTIVE".to_string(),
                crate::types::AccountStatus::Suspended => "SUSPENDED".to_string(),
            },
            ou_id: a.ou_id.clone(),
            tags: a.tags.clone(),
        })
        .collect()
}
