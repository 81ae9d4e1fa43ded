//! The rollback processor.
//!
//! Validates a past operation, plans the inverse of its successful results,
//! and executes that plan through [`crate::executor::MultiAccountExecutor`].
//! The resulting run is logged as a new operation of kind `rollback`,
//! cross-linked to the original via a single compare-and-set. Rollback of a
//! rollback is permitted: it is simply a new operation whose inverse is
//! planned the same way.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};

use crate::aws::AwsOperations;
use crate::error::CoreError;
use crate::executor::{AssignmentOutcome, ErrorPolicy, ExecutionRequest, ExecutorConfig, MultiAccountExecutor};
use crate::operations::{OperationId, OperationKind, OperationRecord, OperationStore};
use crate::types::{AccountId, Direction, PermissionSetArn, PrincipalId, PrincipalType};
use crate::log_info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedState {
    Present,
    Absent,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAction {
    pub principal_id: PrincipalId,
    pub permission_set_arn: PermissionSetArn,
    pub account_id: AccountId,
    pub action_kind: Direction,
    pub observed_current_state: ObservedState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub operation_id: OperationId,
    pub action_kind: Direction,
    pub actions: Vec<RollbackAction>,
    pub warnings: Vec<String>,
    pub estimated_duration_s: f64,
}

pub struct RollbackProcessor<'a> {
    aws: &'a dyn AwsOperations,
    store: &'a dyn OperationStore,
    instance_arn: String,
    avg_call_time_s: f64,
}

impl<'a> RollbackProcessor<'a> {
    pub fn new(aws: &'a dyn AwsOperations, store: &'a dyn OperationStore, instance_arn: impl Into<String>) -> Self {
        Self {
            aws,
            store,
            instance_arn: instance_arn.into(),
            avg_call_time_s: 1.0,
        }
    }

    /// Fetches the original operation and checks the preconditions for a
    /// rollback: must exist, must not already be rolled back.
    pub async fn validate(&self, operation_id: OperationId) -> Result<OperationRecord, CoreError> {
        let record = self.store.get(operation_id).await.ok_or(CoreError::Validation {
            field: "operation_id".to_string(),
            message: format!("no operation found with id {operation_id}"),
        })?;
        if record.rolled_back {
            return Err(CoreError::Validation {
                field: "operation_id".to_string(),
                message: format!("operation {operation_id} is already rolled back"),
            });
        }
        Ok(record)
    }

    /// Builds the inverse plan: assign becomes revoke and vice versa, over
    /// every successful account result, skipping actions whose observed
    /// current state already matches the post-rollback target.
    pub async fn plan(&self, original: &OperationRecord, concurrency: u32) -> RollbackPlan {
        let inverse_direction = original.kind.inverse_action_kind();
        let mut actions = Vec::new();
        let mut warnings = Vec::new();

        for result in &original.results {
            if result.outcome != AssignmentOutcome::Succeeded {
                continue;
            }
            let observed = self
                .observe_current_state(&result.account_id.0, &original.permission_set_arn.0, &original.principal_id.0)
                .await;

            let post_rollback_target_is_present = inverse_direction == Direction::Assign;
            let already_at_target = matches!(
                (post_rollback_target_is_present, observed),
                (true, ObservedState::Present) | (false, ObservedState::Absent)
            );

            if matches!(observed, ObservedState::Unknown) {
                warnings.push(format!(
                    "could not determine current assignment state for account {}",
                    result.account_id
                ));
            } else if !matches!(
                (inverse_direction, observed),
                (Direction::Revoke, ObservedState::Present) | (Direction::Assign, ObservedState::Absent)
            ) {
                warnings.push(format!(
                    "account {} state inconsistent with rollback intent (observed {:?})",
                    result.account_id, observed
                ));
            }

            if already_at_target {
                continue;
            }

            actions.push(RollbackAction {
                principal_id: original.principal_id.clone(),
                permission_set_arn: original.permission_set_arn.clone(),
                account_id: result.account_id.clone(),
                action_kind: inverse_direction,
                observed_current_state: observed,
            });
        }

        let estimated_duration_s = actions.len() as f64 / concurrency.max(1) as f64 * self.avg_call_time_s;

        RollbackPlan {
            operation_id: original.operation_id,
            action_kind: inverse_direction,
            actions,
            warnings,
            estimated_duration_s,
        }
    }

    async fn observe_current_state(&self, account_id: &str, permission_set_arn: &str, principal_id: &str) -> ObservedState {
        match self
            .aws
            .list_account_assignments(&self.instance_arn, account_id, permission_set_arn)
            .await
        {
            Ok(assignments) => {
                if assignments.iter().any(|a| a.principal_id == principal_id) {
                    ObservedState::Present
                } else {
                    ObservedState::Absent
                }
            }
            Err(_) => ObservedState::Unknown,
        }
    }

    /// Dry-run: plan plus the read-only verification above, no mutation.
    pub async fn dry_run(&self, operation_id: OperationId, concurrency: u32) -> Result<RollbackPlan, CoreError> {
        let original = self.validate(operation_id).await?;
        Ok(self.plan(&original, concurrency).await)
    }

    /// Dispatches the plan through the executor, logs the run as a new
    /// `rollback` operation cross-linked to the original, and flips the
    /// original's `rolled_back` flag via a single compare-and-set.
    pub async fn execute(
        &self,
        original: &OperationRecord,
        plan: RollbackPlan,
        concurrency: u32,
        max_retries: u32,
    ) -> Result<OperationRecord, CoreError> {
        if plan.actions.is_empty() {
            let rollback_record = OperationRecord::new(
                OperationKind::Rollback,
                original.principal_id.clone(),
                original.principal_type,
                original.principal_name.clone(),
                original.permission_set_arn.clone(),
                original.permission_set_name.clone(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                [("original".to_string(), original.operation_id.to_string())].into(),
            );
            self.store.append(rollback_record.clone()).await.map_err(|e| CoreError::System {
                message: e.to_string(),
            })?;
            self.store
                .mark_rolled_back(original.operation_id, rollback_record.operation_id)
                .await;
            return Ok(rollback_record);
        }

        let executor = MultiAccountExecutor::new(
            self.aws,
            ExecutorConfig {
                max_concurrent_accounts: concurrency,
                account_timeout: StdDuration::from_secs(60),
                max_retries,
                error_policy: ErrorPolicy::ContinueOnError,
            },
        );

        let request = ExecutionRequest {
            principal_id: original.principal_id.clone(),
            principal_type: original.principal_type,
            permission_set_arn: original.permission_set_arn.clone(),
            instance_arn: self.instance_arn.clone(),
            accounts: plan.actions.iter().map(|a| a.account_id.clone()).collect(),
            direction: plan.action_kind,
        };

        log_info!(
            "executing rollback of operation {} with {} actions",
            original.operation_id,
            plan.actions.len()
        );

        let results = executor
            .execute(request, Arc::new(tokio::sync::Notify::new()), None)
            .await;

        let account_ids: Vec<AccountId> = results.iter().map(|r| r.account_id.clone()).collect();
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("original".to_string(), original.operation_id.to_string());
        let rollback_record = OperationRecord::new(
            OperationKind::Rollback,
            original.principal_id.clone(),
            original.principal_type,
            original.principal_name.clone(),
            original.permission_set_arn.clone(),
            original.permission_set_name.clone(),
            account_ids,
            Vec::new(),
            results,
            metadata,
        );

        self.store.append(rollback_record.clone()).await.map_err(|e| CoreError::System {
            message: e.to_string(),
        })?;
        self.store
            .mark_rolled_back(original.operation_id, rollback_record.operation_id)
            .await;

        Ok(rollback_record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mock::MockAws;
    use crate::executor::AssignmentRecord;
    use crate::operations::json_file::JsonFileOperationStore;
    use crate::types::{AccountName, PermissionSetName, PrincipalName};
    use tempfile::tempdir;

    fn succeeded_operation(aws: &MockAws, account_id: &str) -> OperationRecord {
        OperationRecord::new(
            OperationKind::Assign,
            PrincipalId("p-1".to_string()),
            PrincipalType::User,
            PrincipalName("alice".to_string()),
            PermissionSetArn("arn:ps:ReadOnly".to_string()),
            PermissionSetName("ReadOnly".to_string()),
            vec![AccountId(account_id.to_string())],
            vec![AccountName("prod".to_string())],
            vec![AssignmentRecord {
                principal_id: PrincipalId("p-1".to_string()),
                principal_type: PrincipalType::User,
                permission_set_arn: PermissionSetArn("arn:ps:ReadOnly".to_string()),
                account_id: AccountId(account_id.to_string()),
                outcome: AssignmentOutcome::Succeeded,
                error: None,
                retries: 0,
                duration_ms: 5,
            }],
            Default::default(),
        )
    }

    #[tokio::test]
    async fn dry_run_builds_plan_without_mutating_aws() {
        let aws = MockAws::new();
        aws.seed_assignment("111", "arn:ps:ReadOnly", "p-1");
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let record = succeeded_operation(&aws, "111");
        let id = record.operation_id;
        store.append(record).await.unwrap();

        let processor = RollbackProcessor::new(&aws, &store, aws.instance_arn.clone());
        let plan = processor.dry_run(id, 10).await.unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].action_kind, Direction::Revoke);
        assert!(aws.has_assignment("111", "arn:ps:ReadOnly", "p-1"));

        let fetched = store.get(id).await.unwrap();
        assert!(!fetched.rolled_back);
    }

    #[tokio::test]
    async fn execute_flips_rolled_back_and_cross_links() {
        let aws = MockAws::new();
        aws.seed_assignment("111", "arn:ps:ReadOnly", "p-1");
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let record = succeeded_operation(&aws, "111");
        let id = record.operation_id;
        store.append(record.clone()).await.unwrap();

        let processor = RollbackProcessor::new(&aws, &store, aws.instance_arn.clone());
        let plan = processor.plan(&record, 10).await;
        let rollback_record = processor.execute(&record, plan, 10, 2).await.unwrap();

        assert_eq!(rollback_record.kind, OperationKind::Rollback);
        assert!(!aws.has_assignment("111", "arn:ps:ReadOnly", "p-1"));

        let original_after = store.get(id).await.unwrap();
        assert!(original_after.rolled_back);
        assert_eq!(original_after.rollback_operation_id, Some(rollback_record.operation_id));
    }

    #[tokio::test]
    async fn already_at_target_state_is_skipped_in_plan() {
        let aws = MockAws::new();
        // No seeded assignment: rollback target (revoke) is already absent.
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let record = succeeded_operation(&aws, "111");
        let processor = RollbackProcessor::new(&aws, &store, aws.instance_arn.clone());
        let plan = processor.plan(&record, 10).await;
        assert!(plan.actions.is_empty());
    }

    #[tokio::test]
    async fn rollback_of_a_rollback_is_permitted() {
        let aws = MockAws::new();
        aws.seed_assignment("111", "arn:ps:ReadOnly", "p-1");
        let dir = tempdir().unwrap();
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let record = succeeded_operation(&aws, "111");
        store.append(record.clone()).await.unwrap();

        let processor = RollbackProcessor::new(&aws, &store, aws.instance_arn.clone());
        let plan = processor.plan(&record, 10).await;
        let rollback_record = processor.execute(&record, plan, 10, 2).await.unwrap();

        // Rolling back the rollback is just planning its inverse, same as
        // any other operation kind.
        let second_plan = processor.plan(&rollback_record, 10).await;
        assert_eq!(second_plan.action_kind, Direction::Assign);
        let second_rollback = processor.execute(&rollback_record, second_plan, 10, 2).await.unwrap();
        assert!(aws.has_assignment("111", "arn:ps:ReadOnly", "p-1"));
        assert_eq!(second_rollback.kind, OperationKind::Rollback);
    }
}
