//! Checksum utilities for payload provenance

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice, hex encoded
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON payload
///
/// `serde_json::Map` keeps keys sorted, so two payloads with the same content
/// produce the same digest regardless of the key order the provider used.
pub fn payload_digest<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(digest_bytes(&bytes))
}

/// Check a payload against a previously recorded digest
pub fn verify_payload_digest<T: Serialize + ?Sized>(payload: &T, expected: &str) -> Result<bool> {
    Ok(payload_digest(payload)? == expected)
}
