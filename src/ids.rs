use sha2::{Digest, Sha256};

/// Cache key for a normalized query: full untruncated SHA-256 hex. Unlike
/// the truncated short ids used for device/point identifiers elsewhere, a
/// cache key has no reason to be short, so we keep the whole digest.
pub fn cache_key(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_full_length_sha256_hex() {
        let key = cache_key("site=example|points=p1,p2|start=0|end=100");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_key_is_stable_for_identical_input() {
        assert_eq!(cache_key("a|b|c"), cache_key("a|b|c"));
    }

    #[test]
    fn cache_key_differs_for_different_input() {
        assert_ne!(cache_key("a|b|c"), cache_key("a|b|d"));
    }
}
