//! Hashing primitives for peerchain
//!
//! Block and transaction identities are SHA-256 digests of a canonical string
//! rendering, encoded as lowercase hex so they travel unchanged through JSON
//! and URL paths.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Hash a string and return the digest as lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `s` looks like a digest produced by [`sha256_hex`].
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
