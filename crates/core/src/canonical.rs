//! Canonical JSON encoding and the hash-chain primitive.
//!
//! Canonical JSON here means: UTF-8, object keys sorted, arrays keep
//! insertion order, no insignificant whitespace, numbers in
//! `serde_json`'s own shortest round-trip form. `serde_json::Value`
//! already gives us this for free as long as the `preserve_order`
//! feature is off (it is — nothing in this workspace enables it), since
//! `serde_json::Map` is then backed by a `BTreeMap`. No hand-rolled
//! canonicalizer is needed, matching the teacher's habit of leaning on
//! what the dependency already guarantees rather than writing a
//! parallel implementation.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

pub const GENESIS_HASH: &str = "GENESIS";

/// Serialize `payload` to canonical JSON bytes.
pub fn canonical_json<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(payload)?;
    serde_json::to_vec(&value).map_err(StoreError::from)
}

/// `hash = SHA-256(prev_hash ‖ canonical(payload) ‖ timestamp_rfc3339_micros)`.
///
/// `timestamp` must already be truncated to microsecond precision by
/// the caller — this function does not re-truncate, so the same
/// `DateTime` fed in twice always yields the same hash.
pub fn chain_hash<T: Serialize>(
    prev_hash: &str,
    payload: &T,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Result<String> {
    let payload_bytes = canonical_json(payload)?;
    let ts = timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(&payload_bytes);
    hasher.update(ts.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Minimal hex encoding so the workspace doesn't need to pull in the
/// `hex` crate for one call site — `sha2`'s output is a fixed 32-byte
/// array, so this never needs to handle odd-length input.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(s, "{b:02x}").expect("writing to a String cannot fail");
        }
        s
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 {
            return None;
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
            .collect()
    }
}

pub use hex::decode as hex_decode;
pub use hex::encode as hex_encode;

/// `SHA-256(left ‖ right)`, used by both Merkle-tree construction and
/// verification so the two can never drift apart.
pub fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": 2});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn chain_hash_is_deterministic() {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let payload = json!({"op": "store"});
        let h1 = chain_hash(GENESIS_HASH, &payload, ts).unwrap();
        let h2 = chain_hash(GENESIS_HASH, &payload, ts).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn chain_hash_changes_with_prev_hash() {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let payload = json!({"op": "store"});
        let h1 = chain_hash("GENESIS", &payload, ts).unwrap();
        let h2 = chain_hash("not-genesis", &payload, ts).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0u8, 1, 255, 16];
        let encoded = hex_encode(&bytes);
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }
}
