//! xxHash-based key hashing for cache lookups.
//!
//! `CanonicalQuery` and cached scripts are potentially long SQL strings;
//! hashing them once to a 64-bit key (xxh3, a fast non-cryptographic hash)
//! lets the pool, the pipeline cache, and the memoization tables in the
//! Formatter/Clause Extractor use the hash as the map key instead of
//! rehashing the full string on every lookup.

use xxhash_rust::xxh3::xxh3_64;

const SEED_SUFFIX: &[u8] = b"\x1Espeql\x1E";

/// Compute a 64-bit xxh3 key from a canonical string.
pub fn key_hash(input: &str) -> u64 {
    xxh3_64(input.as_bytes())
}

/// Compute a 64-bit xxh3 key from multiple string parts, joined by a
/// record separator so that `("ab", "c")` and `("a", "bc")` never collide.
pub fn key_hash_multi<'a>(parts: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut combined = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            combined.push('\u{1E}');
        }
        combined.push_str(part);
    }
    combined.push_str(std::str::from_utf8(SEED_SUFFIX).unwrap());
    xxh3_64(combined.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(key_hash("select 1"), key_hash("select 1"));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(key_hash("select 1"), key_hash("select 2"));
    }

    #[test]
    fn multi_hash_separator_prevents_collision() {
        let h1 = key_hash_multi(["ab", "c"]);
        let h2 = key_hash_multi(["a", "bc"]);
        assert_ne!(h1, h2);
    }
}
