//! Cache key hashing using BLAKE3
//!
//! Request keys (a path and query) can be arbitrarily long and contain any
//! character, so entries are stored under the hash of their key.

/// Compute BLAKE3 hash of a cache key, returning lowercase hex (64 chars)
pub fn key_hash(key: &str) -> String {
    let hash = blake3::hash(key.as_bytes());
    hash.to_hex().to_string()
}

/// Namespace names become directory names; keep them to a safe alphabet
pub fn is_valid_namespace(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
