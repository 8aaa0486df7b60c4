//! Deterministic request fingerprints.
//!
//! A request parameter bundle is canonicalised (mapping entries sorted by
//! key, sequence order preserved, scalars as-is) and hashed so that two
//! bundles produce the same fingerprint exactly when they are structurally
//! equal. The fingerprint is the cache key for remote calls.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::JsonMap;

/// Compute the fingerprint of a request parameter bundle.
pub fn fingerprint(params: &JsonMap) -> String {
    let mut hasher = Sha256::new();
    hash_map(params, &mut hasher);
    hex::encode(hasher.finalize())
}

/// Compute the fingerprint of an arbitrary JSON value.
pub fn fingerprint_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(value, &mut hasher);
    hex::encode(hasher.finalize())
}

fn hash_map(map: &JsonMap, hasher: &mut Sha256) {
    // serde_json maps may preserve insertion order depending on features,
    // so entries are always visited in sorted key order.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    hasher.update(b"{");
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hash_value(&map[key.as_str()], hasher);
        hasher.update(b",");
    }
    hasher.update(b"}");
}

fn hash_value(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"null"),
        Value::Bool(b) => hasher.update(if *b { b"#t" } else { b"#f" }),
        Value::Number(n) => {
            hasher.update(b"n");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.len().to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        Value::Object(map) => hash_map(map, hasher),
    }
}
