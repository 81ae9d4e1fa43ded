//! The account-cache optimizer and the account filter.
//!
//! [`optimizer`] owns the two-tier organization snapshot; [`filter`]
//! evaluates expressions against whatever snapshot the optimizer hands
//! back. Both are profile-scoped and both degrade to an uncached live
//! enumeration on any cache failure -- correctness never depends on either
//! succeeding.

pub mod filter;
pub mod optimizer;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, AccountName, AccountStatus};

/// An organization account, immutable within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: AccountName,
    pub email: String,
    pub status: AccountStatus,
    pub ou_id: String,
    pub tags: HashMap<String, String>,
}

impl From<crate::aws::RawAccount> for Account {
    fn from(raw: crate::aws::RawAccount) -> Self {
        Self {
            id: AccountId(raw.id),
            name: AccountName(raw.name),
            email: raw.email,
            status: if raw.status.eq_ignore_ascii_case("ACTIVE") {
                AccountStatus::Active
            } else {
                AccountStatus::Suspended
            },
            ou_id: raw.ou_id,
            tags: raw.tags,
        }
    }
}

/// The organization's account list at a point in time. Invariant: `account_count == accounts.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationSnapshot {
    pub profile: String,
    pub accounts: Vec<Account>,
    pub captured_at: DateTime<Utc>,
    pub account_count: usize,
}

impl OrganizationSnapshot {
    pub fn new(profile: impl Into<String>, accounts: Vec<Account>) -> Self {
        let account_count = accounts.len();
        Self {
            profile: profile.into(),
            accounts,
            captured_at: Utc::now(),
            account_count,
        }
    }

    /// `account_count` must always equal the length of `accounts`.
    pub fn is_consistent(&self) -> bool {
        self.account_count == self.accounts.len()
    }
}
