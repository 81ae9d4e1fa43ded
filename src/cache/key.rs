//! Cache key discipline.

use crate::error::CoreError;

/// Keys must match `[a-zA-Z0-9._/-]+` and must not contain `..`.
pub fn validate_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() {
        return Err(CoreError::Validation {
            field: "cache_key".to_string(),
            message: "key must not be empty".to_string(),
        });
    }
    if key.contains("..") {
        return Err(CoreError::Validation {
            field: "cache_key".to_string(),
            message: format!("key '{key}' must not contain '..'"),
        });
    }
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'));
    if !valid {
        return Err(CoreError::Validation {
            field: "cache_key".to_string(),
            message: format!("key '{key}' contains characters outside [a-zA-Z0-9._/-]"),
        });
    }
    Ok(())
}

/// Every key is namespaced under the owning profile.
pub fn namespaced(profile: &str, key: &str) -> String {
    format!("profiles/{profile}/{key}")
}

/// A stable, collision-resistant 64-bit hash of a cache key, used by the
/// file backend to derive a filename that can't escape its directory.
/// FNV-1a: no extra dependency, deterministic across runs (unlike
/// `DefaultHasher`, which is randomly seeded per-process).
pub fn stable_hash_hex(key: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        assert!(validate_key("profiles/dev/../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_disallowed_characters() {
        assert!(validate_key("profiles/dev/foo bar").is_err());
        assert!(validate_key("profiles/dev/foo:bar").is_err());
    }

    #[test]
    fn accepts_well_formed_key() {
        assert!(validate_key("profiles/dev/resolve/user/alice").is_ok());
    }

    #[test]
    fn hash_is_stable_and_distinct() {
        let a = stable_hash_hex("profiles/dev/accounts/snapshot");
        let b = stable_hash_hex("profiles/dev/accounts/snapshot");
        let c = stable_hash_hex("profiles/dev/accounts/count");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
