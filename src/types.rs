//! Identifiers and value types shared across the core.
//!
//! These are thin newtypes over `String`/`Uuid` rather than raw strings so
//! that resolver, executor, and journal signatures stay self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_newtype!(InstanceArn, "ARN of the Identity Center instance");
string_newtype!(IdentityStoreId, "ID of the backing identity store");
string_newtype!(AccountId, "12-digit AWS account id");
string_newtype!(AccountName, "Display name of an AWS account");
string_newtype!(PermissionSetArn, "ARN of a permission set");
string_newtype!(PermissionSetName, "Display name of a permission set");
string_newtype!(PrincipalId, "UUID-form identity store principal id");
string_newtype!(PrincipalName, "Username or group display name");
string_newtype!(ProfileName, "Named AWS credential profile");

impl AccountId {
    /// True if the string is exactly 12 ASCII digits.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 12 && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Whether a principal is a user or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrincipalType {
    User,
    Group,
}

impl fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalType::User => write!(f, "USER"),
            PrincipalType::Group => write!(f, "GROUP"),
        }
    }
}

impl std::str::FromStr for PrincipalType {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(PrincipalType::User),
            "GROUP" => Ok(PrincipalType::Group),
            other => Err(crate::error::CoreError::Validation {
                field: "principal_type".to_string(),
                message: format!("expected USER or GROUP, got '{other}'"),
            }),
        }
    }
}

/// Direction of an assignment operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Assign,
    Revoke,
}

impl Direction {
    pub fn inverse(self) -> Direction {
        match self {
            Direction::Assign => Direction::Revoke,
            Direction::Revoke => Direction::Assign,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Assign => write!(f, "assign"),
            Direction::Revoke => write!(f, "revoke"),
        }
    }
}

/// Account lifecycle status within the organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Active,
    Suspended,
}

/// Unique id assigned to an operation record at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Reference to a principal: either a resolved id or a human name awaiting
/// resolution by [`crate::resolver::EntityResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrincipalRef {
    Name {
        principal_type: PrincipalType,
        name: PrincipalName,
    },
    Resolved {
        principal_type: PrincipalType,
        id: PrincipalId,
        name: PrincipalName,
    },
}

impl PrincipalRef {
    pub fn principal_type(&self) -> PrincipalType {
        match self {
            PrincipalRef::Name { principal_type, .. }
            | PrincipalRef::Resolved { principal_type, .. } => *principal_type,
        }
    }
}

/// Reference to a permission set: either a name or a resolved ARN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionSetRef {
    Name(PermissionSetName),
    Arn(PermissionSetArn),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_well_formed() {
        assert!(AccountId::from("123456789012").is_well_formed());
        assert!(!AccountId::from("12345").is_well_formed());
        assert!(!AccountId::from("12345678901a").is_well_formed());
    }

    #[test]
    fn principal_type_parses_case_insensitively() {
        assert_eq!("user".parse::<PrincipalType>().unwrap(), PrincipalType::User);
        assert_eq!(
            "GROUP".parse::<PrincipalType>().unwrap(),
            PrincipalType::Group
        );
        assert!("robot".parse::<PrincipalType>().is_err());
    }

    #[test]
    fn direction_inverse_round_trips() {
        assert_eq!(Direction::Assign.inverse(), Direction::Revoke);
        assert_eq!(Direction::Revoke.inverse(), Direction::Assign);
    }
}
