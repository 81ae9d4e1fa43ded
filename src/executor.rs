//! The multi-account executor.
//!
//! A bounded worker pool fans an assign/revoke request out across accounts.
//! Each worker consults [`crate::retry::RetryGovernor`] before every AWS
//! call, polls the returned provisioning handle to a terminal state, and
//! emits one [`AssignmentRecord`] per account. Progress events go out on a
//! separate, non-blocking channel -- the executor never waits on a slow UI
//! consumer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::aws::{AssignmentRequest, AwsOperations, ProvisioningStatus};
use crate::error::CoreError;
use crate::retry::{CallOutcome, RetryGovernor};
use crate::types::{AccountId, Direction, PermissionSetArn, PrincipalId, PrincipalType};
use crate::{log_info, log_warn};

/// The result of executing one account's assignment/revoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub permission_set_arn: PermissionSetArn,
    pub account_id: AccountId,
    pub outcome: AssignmentOutcome,
    pub error: Option<String>,
    pub retries: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Succeeded,
    SkippedAlreadyPresent,
    SkippedAlreadyAbsent,
    Failed,
}

/// Progress events the executor emits on a best-effort channel.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started { account_id: AccountId },
    Completed { account_id: AccountId, outcome: AssignmentOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    ContinueOnError,
    StopOnError,
}

pub struct ExecutorConfig {
    pub max_concurrent_accounts: u32,
    pub account_timeout: StdDuration,
    pub max_retries: u32,
    pub error_policy: ErrorPolicy,
}

/// Request driving one executor run.
pub struct ExecutionRequest {
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub permission_set_arn: PermissionSetArn,
    pub instance_arn: String,
    pub accounts: Vec<AccountId>,
    pub direction: Direction,
}

pub struct MultiAccountExecutor<'a> {
    aws: &'a dyn AwsOperations,
    config: ExecutorConfig,
}

impl<'a> MultiAccountExecutor<'a> {
    pub fn new(aws: &'a dyn AwsOperations, config: ExecutorConfig) -> Self {
        Self { aws, config }
    }

    /// Runs `request` to completion (or cancellation), returning all
    /// `AssignmentRecord`s sorted by account id. `progress_tx` is a
    /// best-effort channel: sends are dropped rather than blocking a worker
    /// when the reader falls behind.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: Arc<tokio::sync::Notify>,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Vec<AssignmentRecord> {
        let governor = Arc::new(RetryGovernor::new(self.config.max_retries));
        let initial_concurrency = self.config.max_concurrent_accounts.max(1);
        let semaphore = Arc::new(Semaphore::new(initial_concurrency as usize));
        let current_concurrency = Arc::new(AtomicU32::new(initial_concurrency));
        let stop_requested = Arc::new(AtomicBool::new(false));
        log_info!(
            "executing {:?} for {} accounts with concurrency {}",
            request.direction,
            request.accounts.len(),
            initial_concurrency
        );

        // Adapts `semaphore`'s available permits to the governor's throttling
        // signal on a 1s tick. Aborted once every account has
        // completed.
        let adapt_task = {
            let governor = governor.clone();
            let semaphore = semaphore.clone();
            let current_concurrency = current_concurrency.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(StdDuration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let prev = current_concurrency.load(Ordering::SeqCst);
                    let next = governor.adjust_concurrency(prev, Utc::now()).min(initial_concurrency);
                    if next < prev {
                        semaphore.forget_permits((prev - next) as usize);
                        current_concurrency.store(next, Ordering::SeqCst);
                        log_warn!("reducing max_concurrent_accounts from {prev} to {next} after throttling");
                    } else if next > prev {
                        semaphore.add_permits((next - prev) as usize);
                        current_concurrency.store(next, Ordering::SeqCst);
                    }
                }
            })
        };

        let mut records: Vec<AssignmentRecord> = stream::iter(request.accounts.clone())
            .map(|account_id| {
                let governor = governor.clone();
                let progress_tx = progress_tx.clone();
                let stop_requested = stop_requested.clone();
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                async move {
                    if self.config.error_policy == ErrorPolicy::StopOnError
                        && stop_requested.load(Ordering::SeqCst)
                    {
                        return None;
                    }
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    send_progress(&progress_tx, ProgressEvent::Started { account_id: account_id.clone() }).await;
                    let record = self.run_one_account(&request, &account_id, &governor, &cancel).await;
                    if record.outcome == AssignmentOutcome::Failed
                        && self.config.error_policy == ErrorPolicy::StopOnError
                    {
                        stop_requested.store(true, Ordering::SeqCst);
                    }
                    send_progress(
                        &progress_tx,
                        ProgressEvent::Completed { account_id, outcome: record.outcome },
                    )
                    .await;
                    Some(record)
                }
            })
            .buffer_unordered(initial_concurrency as usize)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        adapt_task.abort();
        records.sort_by(|a, b| a.account_id.0.cmp(&b.account_id.0));
        records
    }

    async fn run_one_account(
        &self,
        request: &ExecutionRequest,
        account_id: &AccountId,
        governor: &RetryGovernor,
        cancel: &tokio::sync::Notify,
    ) -> AssignmentRecord {
        let started = Instant::now();
        let assignment_request = AssignmentRequest {
            instance_arn: request.instance_arn.clone(),
            permission_set_arn: request.permission_set_arn.0.clone(),
            principal_id: request.principal_id.0.clone(),
            principal_type: request.principal_type.to_string(),
            account_id: account_id.0.clone(),
        };
        let is_create = request.direction == Direction::Assign;

        let outcome = tokio::select! {
            biased;
            _ = cancel.notified() => {
                log_warn!("execution cancelled before account {account_id} completed");
                return AssignmentRecord {
                    principal_id: request.principal_id.clone(),
                    principal_type: request.principal_type,
                    permission_set_arn: request.permission_set_arn.clone(),
                    account_id: account_id.clone(),
                    outcome: AssignmentOutcome::Failed,
                    error: Some("cancelled".to_string()),
                    retries: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
            result = self.submit_and_poll(&assignment_request, is_create, governor) => result,
        };

        let (call_outcome, retries) = outcome;
        let (outcome_kind, error) = match call_outcome {
            CallOutcome::Succeeded(()) => (AssignmentOutcome::Succeeded, None),
            CallOutcome::SkippedAlreadyPresent => (AssignmentOutcome::SkippedAlreadyPresent, None),
            CallOutcome::SkippedAlreadyAbsent => (AssignmentOutcome::SkippedAlreadyAbsent, None),
            CallOutcome::Failed(e) => (AssignmentOutcome::Failed, Some(e.to_string())),
        };

        AssignmentRecord {
            principal_id: request.principal_id.clone(),
            principal_type: request.principal_type,
            permission_set_arn: request.permission_set_arn.clone(),
            account_id: account_id.clone(),
            outcome: outcome_kind,
            error,
            retries,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Submits the create/delete call and polls its provisioning handle to a
    /// terminal state, summing retries spent across both phases so
    /// `AssignmentRecord::retries` reflects the account's whole attempt
    /// history.
    async fn submit_and_poll(
        &self,
        request: &AssignmentRequest,
        is_create: bool,
        governor: &RetryGovernor,
    ) -> (CallOutcome<()>, u32) {
        let timeout = self.config.account_timeout;
        let (submit_outcome, mut retries) = governor
            .call(is_create, || async {
                if is_create {
                    self.aws.create_account_assignment(request).await
                } else {
                    self.aws.delete_account_assignment(request).await
                }
            })
            .await;

        let request_id = match submit_outcome {
            CallOutcome::Succeeded(id) => id,
            CallOutcome::SkippedAlreadyPresent => return (CallOutcome::SkippedAlreadyPresent, retries),
            CallOutcome::SkippedAlreadyAbsent => return (CallOutcome::SkippedAlreadyAbsent, retries),
            CallOutcome::Failed(e) => return (CallOutcome::Failed(e), retries),
        };

        let poll_deadline = Instant::now() + timeout;
        loop {
            let (status_outcome, poll_retries) = governor
                .call(true, || async {
                    if is_create {
                        self.aws
                            .describe_account_assignment_creation_status(&request.instance_arn, &request_id)
                            .await
                    } else {
                        self.aws
                            .describe_account_assignment_deletion_status(&request.instance_arn, &request_id)
                            .await
                    }
                })
                .await;
            retries += poll_retries;
            match status_outcome {
                CallOutcome::Succeeded(ProvisioningStatus::Succeeded) => return (CallOutcome::Succeeded(()), retries),
                CallOutcome::Succeeded(ProvisioningStatus::Failed) => {
                    return (
                        CallOutcome::Failed(CoreError::System {
                            message: "provisioning failed".to_string(),
                        }),
                        retries,
                    )
                }
                CallOutcome::Succeeded(ProvisioningStatus::InProgress) => {
                    if Instant::now() >= poll_deadline {
                        return (
                            CallOutcome::Failed(CoreError::System {
                                message: format!("timed out after {:?} waiting for provisioning", timeout),
                            }),
                            retries,
                        );
                    }
                    tokio::time::sleep(StdDuration::from_millis(200)).await;
                }
                CallOutcome::SkippedAlreadyPresent => return (CallOutcome::SkippedAlreadyPresent, retries),
                CallOutcome::SkippedAlreadyAbsent => return (CallOutcome::SkippedAlreadyAbsent, retries),
                CallOutcome::Failed(e) => return (CallOutcome::Failed(e), retries),
            }
        }
    }
}

async fn send_progress(tx: &Option<mpsc::Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = tx {
        // `try_send`, not `send`: a full channel means a slow UI reader,
        // and a worker must never block on it.
        let _ = tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mock::MockAws;
    use crate::aws::RawAccount;
    use std::collections::HashMap;

    fn request(aws: &MockAws, account_ids: Vec<&str>, direction: Direction) -> ExecutionRequest {
        ExecutionRequest {
            principal_id: PrincipalId("p-1".to_string()),
            principal_type: PrincipalType::User,
            permission_set_arn: PermissionSetArn("arn:ps:ReadOnly".to_string()),
            instance_arn: aws.instance_arn.clone(),
            accounts: account_ids.into_iter().map(|s| AccountId(s.to_string())).collect(),
            direction,
        }
    }

    fn default_config() -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_accounts: 8,
            account_timeout: StdDuration::from_secs(5),
            max_retries: 2,
            error_policy: ErrorPolicy::ContinueOnError,
        }
    }

    #[tokio::test]
    async fn assigns_across_all_accounts_and_sorts_by_account_id() {
        let aws = MockAws::new();
        for id in ["333", "111", "222"] {
            aws.add_account(RawAccount {
                id: id.to_string(),
                name: id.to_string(),
                email: "a@example.com".to_string(),
                status: "ACTIVE".to_string(),
                ou_id: "ou".to_string(),
                tags: HashMap::new(),
            });
        }
        let executor = MultiAccountExecutor::new(&aws, default_config());
        let records = executor
            .execute(request(&aws, vec!["333", "111", "222"], Direction::Assign), Arc::new(tokio::sync::Notify::new()), None)
            .await;
        let ids: Vec<_> = records.iter().map(|r| r.account_id.0.clone()).collect();
        assert_eq!(ids, vec!["111", "222", "333"]);
        assert!(records.iter().all(|r| r.outcome == AssignmentOutcome::Succeeded));
        assert_eq!(aws.create_call_count(), 3);
    }

    #[tokio::test]
    async fn repeating_assign_on_already_present_is_skipped_not_failed() {
        let aws = MockAws::new();
        aws.seed_assignment("111", "arn:ps:ReadOnly", "p-1");
        let executor = MultiAccountExecutor::new(&aws, default_config());
        let records = executor
            .execute(request(&aws, vec!["111"], Direction::Assign), Arc::new(tokio::sync::Notify::new()), None)
            .await;
        assert_eq!(records[0].outcome, AssignmentOutcome::SkippedAlreadyPresent);
    }

    #[tokio::test]
    async fn revoking_absent_assignment_is_skipped_not_failed() {
        let aws = MockAws::new();
        let executor = MultiAccountExecutor::new(&aws, default_config());
        let records = executor
            .execute(request(&aws, vec!["111"], Direction::Revoke), Arc::new(tokio::sync::Notify::new()), None)
            .await;
        assert_eq!(records[0].outcome, AssignmentOutcome::SkippedAlreadyAbsent);
    }

    #[tokio::test]
    async fn continue_on_error_lets_other_accounts_complete() {
        let aws = MockAws::new();
        aws.inject(crate::aws::mock::Injected::AccessDenied { action: "x".to_string() });
        let executor = MultiAccountExecutor::new(&aws, default_config());
        let records = executor
            .execute(request(&aws, vec!["111", "222"], Direction::Assign), Arc::new(tokio::sync::Notify::new()), None)
            .await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.outcome == AssignmentOutcome::Failed));
        assert!(records.iter().any(|r| r.outcome == AssignmentOutcome::Succeeded));
    }
}
