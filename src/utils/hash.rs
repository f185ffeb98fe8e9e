//! SHA-256 helpers for the trust-log chain and policy content hashing.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Chain hash for one trust-log record: `SHA256(prev_or_empty || canonical)`.
///
/// The first record in a chain passes `None` for `prev`.
#[must_use]
pub fn chain_hash(prev: Option<&str>, canonical_payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev {
        hasher.update(prev.as_bytes());
    }
    hasher.update(canonical_payload.as_bytes());
    hex::encode(hasher.finalize())
}
