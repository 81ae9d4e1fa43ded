//! The copy/clone engine.
//!
//! [`AssignmentCopier`] diffs one principal's assignments against another's
//! and executes only the delta through C6; [`PermissionSetCloner`]
//! duplicates a permission set's full configuration under a new name. Both
//! record themselves in C7 so they are rollback-eligible, the same
//! discipline as single-item assign/revoke.

use std::collections::HashMap;

use crate::accounts::filter::{evaluate, FilterExpr};
use crate::accounts::Account;
use crate::aws::{AwsOperations, ManagedPolicyRef, PermissionSetConfig};
use crate::error::CoreError;
use crate::executor::{ErrorPolicy, ExecutionRequest, ExecutorConfig, MultiAccountExecutor};
use crate::log_info;
use crate::operations::{OperationKind, OperationRecord, OperationStore};
use crate::types::{AccountId, Direction, PermissionSetArn, PermissionSetName, PrincipalId, PrincipalName, PrincipalType};

/// A `user:<name>` or `group:<name>` endpoint of a copy.
#[derive(Debug, Clone)]
pub struct CopyEndpoint {
    pub principal_type: PrincipalType,
    pub principal_id: PrincipalId,
    pub principal_name: PrincipalName,
}

/// Restricts which of the source's assignments are considered for copying.
#[derive(Debug, Clone, Default)]
pub struct CopyFilters {
    pub account_filter: Option<FilterExpr>,
    pub permission_set_name_glob: Option<String>,
}

pub struct AssignmentCopier<'a> {
    aws: &'a dyn AwsOperations,
    store: &'a dyn OperationStore,
    instance_arn: String,
}

impl<'a> AssignmentCopier<'a> {
    pub fn new(aws: &'a dyn AwsOperations, store: &'a dyn OperationStore, instance_arn: impl Into<String>) -> Self {
        Self {
            aws,
            store,
            instance_arn: instance_arn.into(),
        }
    }

    /// Enumerates `source`'s current assignments across `accounts` and
    /// `permission_sets`. The AWS surface has no per-principal reverse
    /// index, so this probes `list-account-assignments` per
    /// (account, permission-set) pair.
    async fn enumerate_assignments(
        &self,
        principal: &CopyEndpoint,
        accounts: &[Account],
        permission_sets: &[(PermissionSetArn, PermissionSetName)],
        filters: &CopyFilters,
    ) -> Result<Vec<(AccountId, PermissionSetArn)>, CoreError> {
        let candidate_accounts: Vec<Account> = match &filters.account_filter {
            Some(expr) => evaluate(expr, accounts),
            None => accounts.to_vec(),
        };
        let candidate_permission_sets: Vec<&(PermissionSetArn, PermissionSetName)> = permission_sets
            .iter()
            .filter(|(_, name)| match &filters.permission_set_name_glob {
                Some(glob) => crate::accounts::filter::glob_match(glob, &name.0),
                None => true,
            })
            .collect();

        let mut found = Vec::new();
        for account in &candidate_accounts {
            for (arn, _name) in &candidate_permission_sets {
                let tuples = self
                    .aws
                    .list_account_assignments(&self.instance_arn, &account.id.0, &arn.0)
                    .await?;
                if tuples.iter().any(|t| t.principal_id == principal.principal_id.0) {
                    found.push((account.id.clone(), (*arn).clone()));
                }
            }
        }
        Ok(found)
    }

    /// Diffs `source`'s assignments against `target`'s and executes only
    /// what `target` is missing. Groups by permission-set since C6 runs one
    /// principal/permission-set pair per invocation; a copy spanning several
    /// permission sets produces one operation record per group.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy(
        &self,
        source: &CopyEndpoint,
        target: &CopyEndpoint,
        accounts: &[Account],
        permission_sets: &[(PermissionSetArn, PermissionSetName)],
        filters: CopyFilters,
        concurrency: u32,
        max_retries: u32,
    ) -> Result<Vec<OperationRecord>, CoreError> {
        let source_assignments = self.enumerate_assignments(source, accounts, permission_sets, &filters).await?;
        log_info!(
            "copy: {} assigns found on source across {} candidate permission sets",
            source_assignments.len(),
            permission_sets.len()
        );

        let mut by_permission_set: HashMap<PermissionSetArn, Vec<AccountId>> = HashMap::new();
        for (account_id, ps_arn) in source_assignments {
            let already_on_target = self
                .aws
                .list_account_assignments(&self.instance_arn, &account_id.0, &ps_arn.0)
                .await?
                .iter()
                .any(|t| t.principal_id == target.principal_id.0);
            if !already_on_target {
                by_permission_set.entry(ps_arn).or_default().push(account_id);
            }
        }

        let executor = MultiAccountExecutor::new(
            self.aws,
            ExecutorConfig {
                max_concurrent_accounts: concurrency,
                account_timeout: std::time::Duration::from_secs(60),
                max_retries,
                error_policy: ErrorPolicy::ContinueOnError,
            },
        );

        let mut records = Vec::new();
        for (permission_set_arn, account_ids) in by_permission_set {
            let request = ExecutionRequest {
                principal_id: target.principal_id.clone(),
                principal_type: target.principal_type,
                permission_set_arn: permission_set_arn.clone(),
                instance_arn: self.instance_arn.clone(),
                accounts: account_ids.clone(),
                direction: Direction::Assign,
            };
            let results = executor
                .execute(request, std::sync::Arc::new(tokio::sync::Notify::new()), None)
                .await;

            let record = OperationRecord::new(
                OperationKind::Assign,
                target.principal_id.clone(),
                target.principal_type,
                target.principal_name.clone(),
                permission_set_arn.clone(),
                PermissionSetName(permission_set_arn.0.clone()),
                account_ids,
                Vec::new(),
                results,
                [("copied_from".to_string(), source.principal_name.0.clone())].into(),
            );
            self.store.append(record.clone()).await.map_err(|e| CoreError::System { message: e.to_string() })?;
            records.push(record);
        }

        Ok(records)
    }
}

pub struct PermissionSetCloner<'a> {
    aws: &'a dyn AwsOperations,
    store: &'a dyn OperationStore,
    instance_arn: String,
}

impl<'a> PermissionSetCloner<'a> {
    pub fn new(aws: &'a dyn AwsOperations, store: &'a dyn OperationStore, instance_arn: impl Into<String>) -> Self {
        Self {
            aws,
            store,
            instance_arn: instance_arn.into(),
        }
    }

    async fn name_already_exists(&self, name: &str) -> Result<bool, CoreError> {
        for arn in self.aws.list_permission_sets(&self.instance_arn).await? {
            if self.aws.describe_permission_set(&self.instance_arn, &arn).await?.name == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reads the source's full configuration and every attachment, creates a
    /// permission set with `target_name`, and copies every attachment over.
    /// Fails without creating anything if `target_name` is already taken.
    pub async fn clone_permission_set(
        &self,
        source_arn: &str,
        target_name: &str,
        description_override: Option<String>,
    ) -> Result<OperationRecord, CoreError> {
        if self.name_already_exists(target_name).await? {
            return Err(CoreError::AwsConflict {
                existing: target_name.to_string(),
            });
        }

        let source_config = self.aws.describe_permission_set(&self.instance_arn, source_arn).await?;
        let managed_policies: Vec<ManagedPolicyRef> = self
            .aws
            .list_managed_policies_in_permission_set(&self.instance_arn, source_arn)
            .await?;
        let inline_policy = self.aws.get_inline_policy_for_permission_set(&self.instance_arn, source_arn).await?;

        let new_config = PermissionSetConfig {
            name: target_name.to_string(),
            description: description_override.or(source_config.description),
            session_duration: source_config.session_duration,
            relay_state: source_config.relay_state,
            inline_policy: inline_policy.clone(),
            managed_policies: managed_policies.clone(),
        };
        let new_arn = self.aws.create_permission_set(&self.instance_arn, &new_config).await?;

        for policy in &managed_policies {
            self.aws
                .attach_managed_policy_to_permission_set(&self.instance_arn, &new_arn, policy)
                .await?;
        }
        if let Some(policy_json) = &inline_policy {
            self.aws
                .put_inline_policy_to_permission_set(&self.instance_arn, &new_arn, policy_json)
                .await?;
        }

        log_info!("cloned permission set {source_arn} to {new_arn} as '{target_name}'");

        // Clone records have no principal -- the sentinel marks that this
        // OperationRecord is about a permission set, not an assignment.
        let record = OperationRecord::new(
            OperationKind::Clone,
            PrincipalId("n/a".to_string()),
            PrincipalType::User,
            PrincipalName("n/a".to_string()),
            PermissionSetArn(new_arn.clone()),
            PermissionSetName(target_name.to_string()),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            [("source_arn".to_string(), source_arn.to_string())].into(),
        );
        self.store.append(record.clone()).await.map_err(|e| CoreError::System { message: e.to_string() })?;
        Ok(record)
    }

    /// Deletes the permission set a clone created, valid only while it
    /// remains unassigned.
    pub async fn rollback_clone(&self, record: &OperationRecord) -> Result<(), CoreError> {
        if record.kind != OperationKind::Clone {
            return Err(CoreError::Validation {
                field: "operation_kind".to_string(),
                message: "rollback_clone called on a non-clone operation".to_string(),
            });
        }
        self.aws.delete_permission_set(&self.instance_arn, &record.permission_set_arn.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mock::MockAws;
    use crate::operations::json_file::JsonFileOperationStore;
    use crate::types::AccountName;
    use tempfile::tempdir;

    fn account(id: &str) -> Account {
        Account {
            id: AccountId(id.to_string()),
            name: AccountName(id.to_string()),
            email: format!("{id}@example.com"),
            status: crate::types::AccountStatus::Active,
            ou_id: "ou-1".to_string(),
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn copy_assigns_only_what_target_is_missing() {
        let aws = MockAws::new();
        aws.seed_assignment("111", "arn:ps:ReadOnly", "p-source");
        aws.seed_assignment("222", "arn:ps:ReadOnly", "p-source");
        aws.seed_assignment("222", "arn:ps:ReadOnly", "p-target");
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let copier = AssignmentCopier::new(&aws, &store, aws.instance_arn.clone());

        let source = CopyEndpoint {
            principal_type: PrincipalType::User,
            principal_id: PrincipalId("p-source".to_string()),
            principal_name: PrincipalName("alice".to_string()),
        };
        let target = CopyEndpoint {
            principal_type: PrincipalType::User,
            principal_id: PrincipalId("p-target".to_string()),
            principal_name: PrincipalName("bob".to_string()),
        };
        let accounts = vec![account("111"), account("222")];
        let permission_sets = vec![(PermissionSetArn("arn:ps:ReadOnly".to_string()), PermissionSetName("ReadOnly".to_string()))];

        let records = copier
            .copy(&source, &target, &accounts, &permission_sets, CopyFilters::default(), 10, 2)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].account_ids, vec![AccountId("111".to_string())]);
        assert!(aws.has_assignment("111", "arn:ps:ReadOnly", "p-target"));
    }

    #[tokio::test]
    async fn clone_copies_config_and_attachments() {
        let aws = MockAws::new();
        aws.add_permission_set(
            "arn:ps:Source",
            PermissionSetConfig {
                name: "Source".to_string(),
                description: Some("original".to_string()),
                session_duration: Some("PT1H".to_string()),
                relay_state: None,
                inline_policy: Some("{}".to_string()),
                managed_policies: vec![ManagedPolicyRef {
                    arn: "arn:aws:iam::aws:policy/ReadOnlyAccess".to_string(),
                    name: "ReadOnlyAccess".to_string(),
                }],
            },
        );
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let cloner = PermissionSetCloner::new(&aws, &store, aws.instance_arn.clone());

        let record = cloner.clone_permission_set("arn:ps:Source", "Cloned", None).await.unwrap();
        assert_eq!(record.permission_set_name.0, "Cloned");

        let new_config = aws.describe_permission_set(&aws.instance_arn, &record.permission_set_arn.0).await.unwrap();
        assert_eq!(new_config.description, Some("original".to_string()));
        assert_eq!(new_config.managed_policies.len(), 1);
        assert_eq!(new_config.inline_policy, Some("{}".to_string()));
    }

    #[tokio::test]
    async fn clone_fails_if_target_name_exists() {
        let aws = MockAws::new();
        aws.add_permission_set("arn:ps:Source", PermissionSetConfig { name: "Source".to_string(), ..Default::default() });
        aws.add_permission_set("arn:ps:Other", PermissionSetConfig { name: "Taken".to_string(), ..Default::default() });
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let cloner = PermissionSetCloner::new(&aws, &store, aws.instance_arn.clone());

        let err = cloner.clone_permission_set("arn:ps:Source", "Taken", None).await.unwrap_err();
        assert_eq!(err, CoreError::AwsConflict { existing: "Taken".to_string() });
    }

    #[tokio::test]
    async fn rollback_clone_deletes_created_permission_set() {
        let aws = MockAws::new();
        aws.add_permission_set("arn:ps:Source", PermissionSetConfig { name: "Source".to_string(), ..Default::default() });
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let cloner = PermissionSetCloner::new(&aws, &store, aws.instance_arn.clone());

        let record = cloner.clone_permission_set("arn:ps:Source", "Cloned", None).await.unwrap();
        cloner.rollback_clone(&record).await.unwrap();
        assert!(aws.describe_permission_set(&aws.instance_arn, &record.permission_set_arn.0).await.is_err());
    }
}
