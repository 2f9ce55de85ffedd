//! Deterministic cache keys and payload validators.
//!
//! Keys are derived from the canonical route path, never the raw URL, so
//! every alias of a route lands on the same entry. Digests are truncated
//! SHA-256 in lowercase hex, which keeps them stable across platforms and
//! safe to use as file names.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Ordered extension dimensions mixed into the key. Empty for normal routes.
pub type VaryMap = BTreeMap<String, String>;

const DIGEST_BYTES: usize = 8;

/// Derive the cache key for `(canonical_path, language, vary)`.
pub fn cache_key(canonical_path: &str, language: &str, vary: &VaryMap) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, canonical_path.as_bytes());
    update_field(&mut hasher, language.as_bytes());
    for (name, value) in vary {
        update_field(&mut hasher, name.as_bytes());
        update_field(&mut hasher, value.as_bytes());
    }
    short_hex(hasher)
}

/// Weak validator digest for a payload. Stable for identical bytes.
pub fn payload_etag(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    short_hex(hasher)
}

/// Wrap a stored digest in its HTTP header form.
pub fn etag_header(etag: &str) -> String {
    format!("W/\"{etag}\"")
}

// Length-prefixed so ("ab","c") and ("a","bc") never collide.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn short_hex(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    hex::encode(&digest[..DIGEST_BYTES])
}
