//! Stable hashing of serializable values into short hex identifiers.
//!
//! Used wherever a Kubernetes object needs a deterministic id derived from a subset of its
//! observed state rather than from a name assigned at creation time.
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Hash the canonical JSON encoding of `value` into a lowercase hex string.
///
/// `serde_json`'s map serialization is insertion-ordered, not key-ordered, so callers that need a
/// stable hash across process restarts must serialize a struct with fixed field order (a plain
/// struct, not a `HashMap`) rather than relying on this function to canonicalize maps.
pub fn stable_hash<T: Serialize>(value: &T) -> Result<String> {
    let encoded = serde_json::to_vec(value)
        .map_err(|e| Error::SerializationError("failed to encode value for hashing".into(), e))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::stable_hash;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Example {
        a: String,
        b: u32,
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        let value = Example {
            a: "pod-0".to_string(),
            b: 7,
        };
        let h1 = stable_hash(&value).unwrap();
        let h2 = stable_hash(&value).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_stable_hash_differs_on_different_input() {
        let a = Example {
            a: "pod-0".to_string(),
            b: 7,
        };
        let b = Example {
            a: "pod-1".to_string(),
            b: 7,
        };
        assert_ne!(stable_hash(&a).unwrap(), stable_hash(&b).unwrap());
    }
}
