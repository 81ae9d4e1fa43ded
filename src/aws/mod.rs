//! The AWS collaborator surface.
//!
//! Raw AWS SDK clients are treated as external collaborators; this module
//! is the seam. [`AwsOperations`] is the narrow, paginated-call surface
//! every core component is allowed to depend on -- one trait rather than a
//! concrete per-service struct, so tests can supply a fake. A production
//! binary wires a concrete `Sdk*Operations` type over
//! `aws-sdk-organizations` / `aws-sdk-ssoadmin` / `aws-sdk-identitystore`
//! to this trait; that wiring is outside this crate's scope.

pub mod mock;
pub mod types;

pub use types::*;

use crate::error::CoreError;
use async_trait::async_trait;

/// Result type for AWS collaborator calls: the closed taxonomy directly,
/// because every caller of this trait must branch on throttling vs.
/// conflict vs. not-found vs. access-denied.
pub type AwsResult<T> = Result<T, CoreError>;

/// The minimum AWS surface consumed by the core.
///
/// Paginated calls are exhaustively consumed by each method's
/// implementation and returned as a materialized `Vec` -- callers never
/// see raw pagination tokens, the same shape as the
/// `into_paginator().send()` loops in `organizations.rs`.
#[async_trait]
pub trait AwsOperations: Send + Sync {
    // --- Organizations -----------------------------------------------
    async fn list_roots(&self) -> AwsResult<Vec<OrgUnit>>;
    async fn list_organizational_units_for_parent(&self, parent_id: &str) -> AwsResult<Vec<OrgUnit>>;
    async fn list_accounts_for_parent(&self, parent_id: &str) -> AwsResult<Vec<RawAccount>>;
    async fn describe_account(&self, account_id: &str) -> AwsResult<RawAccount>;
    async fn list_tags_for_resource(&self, resource_id: &str) -> AwsResult<Vec<(String, String)>>;

    // --- Permission sets -----------------------------------------------
    async fn list_permission_sets(&self, instance_arn: &str) -> AwsResult<Vec<String>>;
    async fn describe_permission_set(&self, instance_arn: &str, arn: &str) -> AwsResult<PermissionSetConfig>;
    async fn list_managed_policies_in_permission_set(
        &self,
        instance_arn: &str,
        arn: &str,
    ) -> AwsResult<Vec<ManagedPolicyRef>>;
    async fn get_inline_policy_for_permission_set(
        &self,
        instance_arn: &str,
        arn: &str,
    ) -> AwsResult<Option<String>>;
    async fn create_permission_set(
        &self,
        instance_arn: &str,
        config: &PermissionSetConfig,
    ) -> AwsResult<String>;
    async fn delete_permission_set(&self, instance_arn: &str, arn: &str) -> AwsResult<()>;
    async fn attach_managed_policy_to_permission_set(
        &self,
        instance_arn: &str,
        arn: &str,
        policy: &ManagedPolicyRef,
    ) -> AwsResult<()>;
    async fn put_inline_policy_to_permission_set(
        &self,
        instance_arn: &str,
        arn: &str,
        policy_json: &str,
    ) -> AwsResult<()>;

    // --- Identity store -------------------------------------------------
    async fn list_users(&self, identity_store_id: &str) -> AwsResult<Vec<RawUser>>;
    async fn describe_user(&self, identity_store_id: &str, user_id: &str) -> AwsResult<RawUser>;
    async fn list_groups(&self, identity_store_id: &str) -> AwsResult<Vec<RawGroup>>;
    async fn describe_group(&self, identity_store_id: &str, group_id: &str) -> AwsResult<RawGroup>;
    async fn list_group_memberships(&self, identity_store_id: &str, group_id: &str) -> AwsResult<Vec<String>>;

    // --- Account assignments --------------------------------------------
    async fn create_account_assignment(&self, request: &AssignmentRequest) -> AwsResult<String>;
    async fn delete_account_assignment(&self, request: &AssignmentRequest) -> AwsResult<String>;
    async fn describe_account_assignment_creation_status(
        &self,
        instance_arn: &str,
        request_id: &str,
    ) -> AwsResult<ProvisioningStatus>;
    async fn describe_account_assignment_deletion_status(
        &self,
        instance_arn: &str,
        request_id: &str,
    ) -> AwsResult<ProvisioningStatus>;
    async fn list_account_assignments(
        &self,
        instance_arn: &str,
        account_id: &str,
        permission_set_arn: &str,
    ) -> AwsResult<Vec<AssignmentTuple>>;
}
