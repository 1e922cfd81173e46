//! Cache key construction.
//!
//! Keys have the shape `namespace:query[:user:<principal>]:<hash>`. The hash is
//! taken over a canonical JSON rendering of the parameters, so two parameter
//! maps that differ only in insertion order produce the same key.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Bytes of the SHA-256 digest kept in the key (128 bits).
const HASH_BYTES: usize = 16;

/// A fully built cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-formed key, e.g. one read back from a store scan.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build the key for a query result.
///
/// Principal-scoped results carry the principal in clear text so they can be
/// invalidated per user with `namespace:*:user:<id>:*`.
pub fn build_key(namespace: &str, query_name: &str, params: &Value, principal: Option<&str>) -> CacheKey {
    let hash = params_hash(params);
    let key = match principal {
        Some(principal) => format!("{namespace}:{query_name}:user:{principal}:{hash}"),
        None => format!("{namespace}:{query_name}:{hash}"),
    };
    CacheKey(key)
}

/// Truncated hex SHA-256 of the canonical parameter encoding.
pub fn params_hash(params: &Value) -> String {
    let canonical = canonicalize(params);
    let encoded = canonical.to_string();
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(&digest[..HASH_BYTES])
}

/// Rebuild objects with keys inserted in sorted order, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parameter_order_does_not_change_key() {
        let a: Value = serde_json::from_str(r#"{"page":2,"status":"active"}"#).expect("json");
        let b: Value = serde_json::from_str(r#"{"status":"active","page":2}"#).expect("json");
        assert_eq!(build_key("query", "patients", &a, None), build_key("query", "patients", &b, None));
    }

    #[test]
    fn nested_objects_are_canonicalised() {
        let a = json!({"filter": {"b": 1, "a": [ {"y": 2, "x": 1} ]}});
        let b: Value =
            serde_json::from_str(r#"{"filter":{"a":[{"x":1,"y":2}],"b":1}}"#).expect("json");
        assert_eq!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn different_params_produce_different_keys() {
        let a = build_key("query", "patients", &json!({"page": 1}), None);
        let b = build_key("query", "patients", &json!({"page": 2}), None);
        assert_ne!(a, b);
    }

    #[test]
    fn principal_segment_is_embedded() {
        let key = build_key("query", "patient_summary", &json!({"id": 7}), Some("u-19"));
        assert!(key.as_str().starts_with("query:patient_summary:user:u-19:"));
    }

    #[test]
    fn hash_is_128_bits_of_hex() {
        let hash = params_hash(&json!({}));
        assert_eq!(hash.len(), HASH_BYTES * 2);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
