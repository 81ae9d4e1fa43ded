//! In-memory [`super::AwsOperations`] double for tests.
//!
//! Rather than a hand-rolled mock per test, one configurable fake
//! organization lives here and every module's tests build on it.

use super::*;
use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Scripted failure injected for the next matching call.
#[derive(Debug, Clone)]
pub enum Injected {
    Throttle,
    Transient,
    AccessDenied { action: String },
}

#[derive(Default)]
struct MockState {
    accounts: Vec<RawAccount>,
    ous: Vec<OrgUnit>,
    permission_sets: HashMap<String, PermissionSetConfig>,
    users: Vec<RawUser>,
    groups: Vec<RawGroup>,
    group_members: HashMap<String, Vec<String>>,
    assignments: HashSet<(String, String, String)>, // (account, ps_arn, principal)
    /// (account_id, permission_set_arn) -> remaining throttle count
    throttle_accounts: HashMap<String, u32>,
    injected_queue: Vec<Injected>,
    create_calls: u32,
    delete_calls: u32,
    tag_lookup_calls: u32,
}

/// A fully in-memory AWS organization, for deterministic tests.
pub struct MockAws {
    state: Mutex<MockState>,
    pub instance_arn: String,
    pub identity_store_id: String,
}

impl MockAws {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            instance_arn: "arn:aws:sso:::instance/ssoins-0000000000000000".to_string(),
            identity_store_id: "d-0000000000".to_string(),
        }
    }

    pub fn add_account(&self, account: RawAccount) {
        self.state.lock().unwrap().accounts.push(account);
    }

    pub fn add_ou(&self, ou: OrgUnit) {
        self.state.lock().unwrap().ous.push(ou);
    }

    pub fn add_user(&self, user: RawUser) {
        self.state.lock().unwrap().users.push(user);
    }

    pub fn add_group(&self, group: RawGroup) {
        self.state.lock().unwrap().groups.push(group);
    }

    pub fn add_permission_set(&self, arn: &str, config: PermissionSetConfig) {
        self.state
            .lock()
            .unwrap()
            .permission_sets
            .insert(arn.to_string(), config);
    }

    pub fn seed_assignment(&self, account_id: &str, ps_arn: &str, principal_id: &str) {
        self.state.lock().unwrap().assignments.insert((
            account_id.to_string(),
            ps_arn.to_string(),
            principal_id.to_string(),
        ));
    }

    pub fn has_assignment(&self, account_id: &str, ps_arn: &str, principal_id: &str) -> bool {
        self.state.lock().unwrap().assignments.contains(&(
            account_id.to_string(),
            ps_arn.to_string(),
            principal_id.to_string(),
        ))
    }

    /// Throttle the next `count` calls involving this account with
    /// `ConflictException`-style transient errors.
    pub fn throttle_account(&self, account_id: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .throttle_accounts
            .insert(account_id.to_string(), count);
    }

    pub fn inject(&self, failure: Injected) {
        self.state.lock().unwrap().injected_queue.push(failure);
    }

    pub fn create_call_count(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn delete_call_count(&self) -> u32 {
        self.state.lock().unwrap().delete_calls
    }

    /// Number of `list_tags_for_resource` calls observed -- only the full
    /// per-account rebuild path pays this cost, so tests use it to assert
    /// that a cheap sentinel probe or a stale-snapshot reuse did not
    /// silently fall through to a full rebuild.
    pub fn tag_lookup_call_count(&self) -> u32 {
        self.state.lock().unwrap().tag_lookup_calls
    }

    fn take_injected(&self) -> Option<Injected> {
        let mut st = self.state.lock().unwrap();
        if !st.injected_queue.is_empty() {
            return Some(st.injected_queue.remove(0));
        }
        None
    }

    fn maybe_throttle(&self, account_id: &str) -> Option<CoreError> {
        let mut st = self.state.lock().unwrap();
        if let Some(remaining) = st.throttle_accounts.get_mut(account_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(CoreError::AwsThrottling {
                    message: format!("throttled for account {account_id}"),
                });
            }
        }
        None
    }
}

impl Default for MockAws {
    fn default() -> Self {
        Self::new()
    }
}

fn injected_to_error(injected: Injected) -> CoreError {
    match injected {
        Injected::Throttle => CoreError::AwsThrottling {
            message: "injected".to_string(),
        },
        Injected::Transient => CoreError::AwsTransient {
            message: "injected".to_string(),
        },
        Injected::AccessDenied { action } => CoreError::AwsAccessDenied {
            action,
            arn: "injected".to_string(),
        },
    }
}

#[async_trait]
impl AwsOperations for MockAws {
    async fn list_roots(&self) -> AwsResult<Vec<OrgUnit>> {
        Ok(vec![OrgUnit {
            id: "r-root".to_string(),
            name: "Root".to_string(),
        }])
    }

    async fn list_organizational_units_for_parent(&self, _parent_id: &str) -> AwsResult<Vec<OrgUnit>> {
        Ok(self.state.lock().unwrap().ous.clone())
    }

    async fn list_accounts_for_parent(&self, _parent_id: &str) -> AwsResult<Vec<RawAccount>> {
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn describe_account(&self, account_id: &str) -> AwsResult<RawAccount> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .cloned()
            .ok_or_else(|| CoreError::AwsNotFound {
                target: account_id.to_string(),
            })
    }

    async fn list_tags_for_resource(&self, resource_id: &str) -> AwsResult<Vec<(String, String)>> {
        self.state.lock().unwrap().tag_lookup_calls += 1;
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .iter()
            .find(|a| a.id == resource_id)
            .map(|a| a.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn list_permission_sets(&self, _instance_arn: &str) -> AwsResult<Vec<String>> {
        Ok(self.state.lock().unwrap().permission_sets.keys().cloned().collect())
    }

    async fn describe_permission_set(&self, _instance_arn: &str, arn: &str) -> AwsResult<PermissionSetConfig> {
        self.state
            .lock()
            .unwrap()
            .permission_sets
            .get(arn)
            .cloned()
            .ok_or_else(|| CoreError::AwsNotFound {
                target: arn.to_string(),
            })
    }

    async fn list_managed_policies_in_permission_set(
        &self,
        _instance_arn: &str,
        arn: &str,
    ) -> AwsResult<Vec<ManagedPolicyRef>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .permission_sets
            .get(arn)
            .map(|c| c.managed_policies.clone())
            .unwrap_or_default())
    }

    async fn get_inline_policy_for_permission_set(
        &self,
        _instance_arn: &str,
        arn: &str,
    ) -> AwsResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .permission_sets
            .get(arn)
            .and_then(|c| c.inline_policy.clone()))
    }

    async fn create_permission_set(&self, _instance_arn: &str, config: &PermissionSetConfig) -> AwsResult<String> {
        let mut st = self.state.lock().unwrap();
        if st.permission_sets.values().any(|c| c.name == config.name) {
            return Err(CoreError::Validation {
                field: "name".to_string(),
                message: format!("permission set '{}' already exists", config.name),
            });
        }
        let arn = format!("arn:aws:sso:::permissionSet/ssoins-0000000000000000/ps-{}", st.permission_sets.len());
        st.permission_sets.insert(arn.clone(), config.clone());
        Ok(arn)
    }

    async fn delete_permission_set(&self, _instance_arn: &str, arn: &str) -> AwsResult<()> {
        self.state.lock().unwrap().permission_sets.remove(arn);
        Ok(())
    }

    async fn attach_managed_policy_to_permission_set(
        &self,
        _instance_arn: &str,
        arn: &str,
        policy: &ManagedPolicyRef,
    ) -> AwsResult<()> {
        if let Some(cfg) = self.state.lock().unwrap().permission_sets.get_mut(arn) {
            cfg.managed_policies.push(policy.clone());
        }
        Ok(())
    }

    async fn put_inline_policy_to_permission_set(
        &self,
        _instance_arn: &str,
        arn: &str,
        policy_json: &str,
    ) -> AwsResult<()> {
        if let Some(cfg) = self.state.lock().unwrap().permission_sets.get_mut(arn) {
            cfg.inline_policy = Some(policy_json.to_string());
        }
        Ok(())
    }

    async fn list_users(&self, _identity_store_id: &str) -> AwsResult<Vec<RawUser>> {
        Ok(self.state.lock().unwrap().users.clone())
    }

    async fn describe_user(&self, _identity_store_id: &str, user_id: &str) -> AwsResult<RawUser> {
        self.state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or_else(|| CoreError::AwsNotFound {
                target: user_id.to_string(),
            })
    }

    async fn list_groups(&self, _identity_store_id: &str) -> AwsResult<Vec<RawGroup>> {
        Ok(self.state.lock().unwrap().groups.clone())
    }

    async fn describe_group(&self, _identity_store_id: &str, group_id: &str) -> AwsResult<RawGroup> {
        self.state
            .lock()
            .unwrap()
            .groups
            .iter()
            .find(|g| g.id == group_id)
            .cloned()
            .ok_or_else(|| CoreError::AwsNotFound {
                target: group_id.to_string(),
            })
    }

    async fn list_group_memberships(&self, _identity_store_id: &str, group_id: &str) -> AwsResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .group_members
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_account_assignment(&self, request: &AssignmentRequest) -> AwsResult<String> {
        if let Some(injected) = self.take_injected() {
            return Err(injected_to_error(injected));
        }
        if let Some(err) = self.maybe_throttle(&request.account_id) {
            return Err(err);
        }
        let key = (
            request.account_id.clone(),
            request.permission_set_arn.clone(),
            request.principal_id.clone(),
        );
        let mut st = self.state.lock().unwrap();
        st.create_calls += 1;
        if st.assignments.contains(&key) {
            return Err(CoreError::AwsConflict {
                existing: format!("{:?}", key),
            });
        }
        st.assignments.insert(key);
        Ok(format!("create-{}-{}", request.account_id, request.permission_set_arn))
    }

    async fn delete_account_assignment(&self, request: &AssignmentRequest) -> AwsResult<String> {
        if let Some(err) = self.maybe_throttle(&request.account_id) {
            return Err(err);
        }
        let key = (
            request.account_id.clone(),
            request.permission_set_arn.clone(),
            request.principal_id.clone(),
        );
        let mut st = self.state.lock().unwrap();
        st.delete_calls += 1;
        if !st.assignments.remove(&key) {
            return Err(CoreError::AwsNotFound {
                target: format!("{:?}", key),
            });
        }
        Ok(format!("delete-{}-{}", request.account_id, request.permission_set_arn))
    }

    async fn describe_account_assignment_creation_status(
        &self,
        _instance_arn: &str,
        _request_id: &str,
    ) -> AwsResult<ProvisioningStatus> {
        Ok(ProvisioningStatus::Succeeded)
    }

    async fn describe_account_assignment_deletion_status(
        &self,
        _instance_arn: &str,
        _request_id: &str,
    ) -> AwsResult<ProvisioningStatus> {
        Ok(ProvisioningStatus::Succeeded)
    }

    async fn list_account_assignments(
        &self,
        _instance_arn: &str,
        account_id: &str,
        permission_set_arn: &str,
    ) -> AwsResult<Vec<AssignmentTuple>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .iter()
            .filter(|(a, p, _)| a == account_id && p == permission_set_arn)
            .map(|(a, p, principal)| AssignmentTuple {
                account_id: a.clone(),
                permission_set_arn: p.clone(),
                principal_id: principal.clone(),
                principal_type: "USER".to_string(),
            })
            .collect())
    }
}
