use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const DOMAIN: &[u8] = b"dockwright-cache-v1";

/// Identifies a step's inputs: equal keys mean the step's layer can be reused.
///
/// Each key chains its parent's, so a change in any step invalidates every
/// later step and none before it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(parent: Option<&CacheKey>, instruction_text: &str, input_digest: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN);
        // Length prefixes keep field boundaries unambiguous.
        for field in [
            parent.map(|p| p.0.as_str()).unwrap_or(""),
            instruction_text,
            input_digest,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_shape() {
        let key = CacheKey::derive(None, "FROM python:3.11.9-slim", "sha256:abc");
        assert_eq!(key.as_str().len(), 64);
        assert_eq!(key.short().len(), 12);
    }

    #[test]
    fn test_field_boundaries_matter() {
        let a = CacheKey::derive(None, "ab", "c");
        let b = CacheKey::derive(None, "a", "bc");
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_derivation_is_deterministic(text in ".*", input in ".*") {
            let parent = CacheKey::derive(None, "FROM base", "");
            prop_assert_eq!(
                CacheKey::derive(Some(&parent), &text, &input),
                CacheKey::derive(Some(&parent), &text, &input)
            );
        }

        #[test]
        fn prop_parent_change_propagates(text in ".*", p1 in "[a-z]{1,8}", p2 in "[a-z]{1,8}") {
            prop_assume!(p1 != p2);
            let k1 = CacheKey::derive(None, &p1, "");
            let k2 = CacheKey::derive(None, &p2, "");
            prop_assert_ne!(
                CacheKey::derive(Some(&k1), &text, ""),
                CacheKey::derive(Some(&k2), &text, "")
            );
        }

        #[test]
        fn prop_input_change_changes_key(a in "[0-9a-f]{8}", b in "[0-9a-f]{8}") {
            prop_assume!(a != b);
            prop_assert_ne!(
                CacheKey::derive(None, "COPY . .", &a),
                CacheKey::derive(None, "COPY . .", &b)
            );
        }
    }
}
