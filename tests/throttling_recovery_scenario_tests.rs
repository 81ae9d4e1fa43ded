//! A bulk revoke across 50 accounts where a handful are throttled a few
//! times each. Every account must still reach a terminal outcome, and the
//! throttled accounts must carry a nonzero retry count on their
//! `AssignmentRecord`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use awsideman::aws::mock::MockAws;
use awsideman::aws::RawAccount;
use awsideman::executor::{AssignmentOutcome, ErrorPolicy, ExecutionRequest, ExecutorConfig, MultiAccountExecutor};
use awsideman::types::{AccountId, Direction, PermissionSetArn, PrincipalId, PrincipalType};

const PS_ARN: &str = "arn:aws:sso:::permissionSet/ssoins-0000000000000000/ReadOnlyAccess";
const PRINCIPAL: &str = "p-alice";

fn seed_org_with_existing_assignments(aws: &MockAws, count: usize) -> Vec<AccountId> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = format!("{:012}", 400000000000u64 + i as u64);
        aws.add_account(RawAccount {
            id: id.clone(),
            name: format!("account-{i}"),
            email: format!("acct{i}@example.com"),
            status: "ACTIVE".to_string(),
            ou_id: "ou-root".to_string(),
            tags: HashMap::new(),
        });
        aws.seed_assignment(&id, PS_ARN, PRINCIPAL);
        ids.push(AccountId(id));
    }
    ids
}

#[tokio::test]
async fn throttled_accounts_still_complete_with_retries_recorded() {
    let aws = MockAws::new();
    let accounts = seed_org_with_existing_assignments(&aws, 50);

    // Throttle three accounts three times each -- enough to cross the
    // governor's consecutive-throttle-within-window threshold and force
    // each of those accounts through real retry attempts before succeeding.
    let throttled_ids = [accounts[3].0.clone(), accounts[17].0.clone(), accounts[42].0.clone()];
    for id in &throttled_ids {
        aws.throttle_account(id, 3);
    }

    let executor = MultiAccountExecutor::new(
        &aws,
        ExecutorConfig {
            max_concurrent_accounts: 20,
            account_timeout: Duration::from_secs(10),
            max_retries: 5,
            error_policy: ErrorPolicy::ContinueOnError,
        },
    );

    let request = ExecutionRequest {
        principal_id: PrincipalId(PRINCIPAL.to_string()),
        principal_type: PrincipalType::User,
        permission_set_arn: PermissionSetArn(PS_ARN.to_string()),
        instance_arn: aws.instance_arn.clone(),
        accounts: accounts.clone(),
        direction: Direction::Revoke,
    };

    let records = executor
        .execute(request, Arc::new(tokio::sync::Notify::new()), None)
        .await;

    assert_eq!(records.len(), 50);
    assert!(
        records.iter().all(|r| r.outcome == AssignmentOutcome::Succeeded),
        "every account must eventually reach a terminal success despite throttling"
    );

    for id in &throttled_ids {
        let record = records.iter().find(|r| &r.account_id.0 == id).unwrap();
        assert!(
            record.retries >= 1,
            "account {id} was throttled and must show at least one retry, got {}",
            record.retries
        );
    }

    let untouched = records
        .iter()
        .find(|r| !throttled_ids.contains(&r.account_id.0))
        .unwrap();
    assert_eq!(untouched.retries, 0);
}
