//! Plain data shapes crossing the [`super::AwsOperations`] seam.
//!
//! These are deliberately flatter than the real `aws-sdk-*` response types
//! (no builders, no `Option`-heavy generated structs) so the rest of the
//! core never depends on a specific SDK version -- per-service wrapper
//! structs funnel SDK calls down to these plain domain types instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgUnit {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAccount {
    pub id: String,
    pub name: String,
    pub email: String,
    pub status: String, // "ACTIVE" | "SUSPENDED"
    pub ou_id: String,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUser {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGroup {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedPolicyRef {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PermissionSetConfig {
    pub name: String,
    pub description: Option<String>,
    pub session_duration: Option<String>,
    pub relay_state: Option<String>,
    pub inline_policy: Option<String>,
    pub managed_policies: Vec<ManagedPolicyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub instance_arn: String,
    pub permission_set_arn: String,
    pub principal_id: String,
    pub principal_type: String, // "USER" | "GROUP"
    pub account_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentTuple {
    pub account_id: String,
    pub permission_set_arn: String,
    pub principal_id: String,
    pub principal_type: String,
}
