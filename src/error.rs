//! The closed error taxonomy every core component reports through.
//!
//! Functions that callers must branch on (the resolver, the executor, the
//! rollback processor) return `Result<T, CoreError>` directly. `CoreError`
//! also carries `std::error::Error` so it composes cleanly wherever a
//! caller just wants to propagate a failure upward with `?`.

use std::fmt;

/// A closed taxonomy of failure kinds a caller of the core must be able to
/// match on. Each variant documents its own retry and reporting policy.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Input file or argument malformed. Never retried; surfaced before any
    /// AWS call.
    Validation { field: String, message: String },

    /// The resolver could not find an id for a name.
    UnresolvedEntity { kind: String, name: String },

    /// Throttling-class AWS error; handled by the retry governor (C5).
    AwsThrottling { message: String },

    /// Transient AWS-side error (5xx, timeout); handled by C5.
    AwsTransient { message: String },

    /// Transient network-layer error; handled by C5.
    Network { message: String },

    /// create-account-assignment hit an existing assignment.
    AwsConflict { existing: String },

    /// delete-account-assignment targeted an assignment that is already gone.
    AwsNotFound { target: String },

    /// The caller's credentials lack permission for one account.
    AwsAccessDenied { action: String, arn: String },

    /// Rollback-only: the assignment's observed state doesn't match what the
    /// rollback plan expected.
    StateMismatch { expected: String, observed: String },

    /// Best-effort cache failure, always demoted to a warning by the caller.
    Cache { message: String },

    /// Unexpected failure with no recovery path; the process should exit 3.
    System { message: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Validation { field, message } => {
                write!(f, "validation error on '{field}': {message}")
            }
            CoreError::UnresolvedEntity { kind, name } => {
                write!(f, "could not resolve {kind} '{name}'")
            }
            CoreError::AwsThrottling { message } => write!(f, "throttled: {message}"),
            CoreError::AwsTransient { message } => write!(f, "transient AWS error: {message}"),
            CoreError::Network { message } => write!(f, "network error: {message}"),
            CoreError::AwsConflict { existing } => {
                write!(f, "assignment already present: {existing}")
            }
            CoreError::AwsNotFound { target } => write!(f, "not found: {target}"),
            CoreError::AwsAccessDenied { action, arn } => {
                write!(f, "access denied for {action} on {arn}")
            }
            CoreError::StateMismatch { expected, observed } => write!(
                f,
                "state mismatch: expected {expected}, observed {observed}"
            ),
            CoreError::Cache { message } => write!(f, "cache error: {message}"),
            CoreError::System { message } => write!(f, "system error: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    /// True for errors the retry governor should back off and retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::AwsThrottling { .. } | CoreError::AwsTransient { .. } | CoreError::Network { .. }
        )
    }

    /// True for the taxonomy's non-fatal, per-account outcomes -- a failure
    /// here ends that one account's work but the batch continues.
    pub fn is_per_account_fatal(&self) -> bool {
        matches!(self, CoreError::AwsAccessDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification_matches_spec_c5() {
        assert!(CoreError::AwsThrottling { message: "x".into() }.is_retriable());
        assert!(CoreError::AwsTransient { message: "x".into() }.is_retriable());
        assert!(CoreError::Network { message: "x".into() }.is_retriable());
        assert!(!CoreError::AwsConflict { existing: "x".into() }.is_retriable());
        assert!(!CoreError::Validation { field: "f".into(), message: "m".into() }.is_retriable());
    }

    #[test]
    fn display_is_human_readable() {
        let e = CoreError::UnresolvedEntity {
            kind: "user".into(),
            name: "alice".into(),
        };
        assert_eq!(e.to_string(), "could not resolve user 'alice'");
    }
}
