//! Request fingerprints used to deduplicate identical in-flight queries.
//!
//! A spreadsheet recalculation fires the same formula many times over (duplicate cells,
//! drag-fill). Two query texts that differ only in whitespace must map to the same key so
//! that only one remote call is made for all of them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a fingerprint (128 bits).
const FINGERPRINT_BYTES: usize = 16;

/// Canonical identifier for a unit of governed work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Fingerprint a query text: collapse whitespace, hash, keep a truncated hex digest.
    pub fn for_query(query: &str) -> Self {
        let normalized = normalize_query(query);
        let digest = Sha256::digest(normalized.as_bytes());
        RequestKey(hex::encode(&digest[..FINGERPRINT_BYTES]))
    }

    /// Use a caller-supplied key as is.
    ///
    /// Callers that already have a stable identity for their work (e.g. a lookup cache key)
    /// can skip hashing.
    pub fn from_raw(key: impl Into<String>) -> Self {
        RequestKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        write!(f, "{}", &self.0[..end])
    }
}

impl From<&str> for RequestKey {
    fn from(query: &str) -> Self {
        RequestKey::for_query(query)
    }
}

/// Collapse every run of whitespace to a single space and trim the ends.
///
/// Case is preserved: string literals inside the query are case sensitive.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_variants_share_a_key() {
        let a = RequestKey::for_query("SELECT id FROM account WHERE acctnumber = '4000'");
        let b = RequestKey::for_query(
            "  SELECT id\n  FROM   account\n\tWHERE acctnumber = '4000'  ",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_queries_differ() {
        let a = RequestKey::for_query("SELECT id FROM account WHERE acctnumber = '4000'");
        let b = RequestKey::for_query("SELECT id FROM account WHERE acctnumber = '4001'");
        assert_ne!(a, b);
    }

    #[test]
    fn test_case_is_significant() {
        let a = RequestKey::for_query("SELECT id FROM subsidiary WHERE name = 'Celigo'");
        let b = RequestKey::for_query("SELECT id FROM subsidiary WHERE name = 'celigo'");
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_is_truncated_hex() {
        let key = RequestKey::for_query("SELECT 1");
        assert_eq!(key.as_str().len(), FINGERPRINT_BYTES * 2);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key.to_string().len(), 8);
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  a \n\t b  c "), "a b c");
        assert_eq!(normalize_query(""), "");
    }

    #[test]
    fn test_raw_key_display_short() {
        assert_eq!(RequestKey::from_raw("abc").to_string(), "abc");
    }
}
