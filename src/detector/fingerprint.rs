//! Content fingerprint over a market's mutable fields.
//!
//! Fields are collected into a key-sorted map before serialization, so the
//! order in which they are produced never changes the digest.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Market;

/// Identity field, excluded from the hash.
const IDENTITY_FIELD: &str = "ticker";

/// SHA-256 hex digest of every field except `ticker`.
pub fn fingerprint(market: &Market) -> String {
    let fields = match serde_json::to_value(market) {
        Ok(Value::Object(map)) => map,
        // Market always serializes to an object; anything else hashes as empty.
        _ => serde_json::Map::new(),
    };
    fingerprint_fields(fields.into_iter().filter(|(k, _)| k != IDENTITY_FIELD))
}

/// Digest of an arbitrary field set, independent of iteration order.
pub fn fingerprint_fields<I>(fields: I) -> String
where
    I: IntoIterator<Item = (String, Value)>,
{
    let canonical: BTreeMap<String, Value> = fields.into_iter().collect();
    // BTreeMap<String, Value> cannot fail to serialize.
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    format!("{:x}", hasher.finalize())
}
