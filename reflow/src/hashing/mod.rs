//! Structural hashing of arbitrary JSON values.
//!
//! Cache keys are derived from the SHA-256 of a value's canonical JSON
//! form, so equal values hash identically across process runs while
//! distinct values collide only with negligible probability. File names
//! embed a short fixed-width prefix of the digest.

mod canonical;

pub use canonical::to_canonical_json;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Width of the truncated digest used in artifact file names.
pub const SHORT_HASH_LEN: usize = 4;

/// Hashes a value to its full hex digest.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    let canonical = to_canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashes a value to the short digest used in element ids.
#[must_use]
pub fn short_hash(value: &Value) -> String {
    let mut digest = hash_value(value);
    digest.truncate(SHORT_HASH_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values_hash_equal() {
        let a = json!({ "file": "src/main.rs", "attempt": 1 });
        let b = json!({ "attempt": 1, "file": "src/main.rs" });
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_eq!(short_hash(&a), short_hash(&b));
    }

    #[test]
    fn test_different_values_hash_differently() {
        let a = json!({ "value": 0 });
        let b = json!({ "value": 1 });
        assert_ne!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_short_hash_width() {
        let digest = short_hash(&json!({ "value": 7 }));
        assert_eq!(digest.len(), SHORT_HASH_LEN);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stable_across_calls() {
        let value = json!([1, "two", { "three": 3.0 }]);
        assert_eq!(hash_value(&value), hash_value(&value));
    }
}
