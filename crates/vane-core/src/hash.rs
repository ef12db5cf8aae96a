//! Deterministic hashing of pod templates.
//!
//! The template hash identifies a revision: two rollouts with the same
//! template produce the same hash regardless of JSON key order.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
const HASH_LEN: usize = 10;

/// Compute the revision hash for any serializable template.
pub fn template_hash<T: Serialize>(template: &T) -> String {
    let value = serde_json::to_value(template).unwrap_or(serde_json::Value::Null);
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"image": "app:v1", "labels": {"a": "1", "b": "2"}});
        let b = json!({"labels": {"b": "2", "a": "1"}, "image": "app:v1"});
        assert_eq!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn different_templates_differ() {
        let a = json!({"image": "app:v1"});
        let b = json!({"image": "app:v2"});
        assert_ne!(template_hash(&a), template_hash(&b));
        assert_eq!(template_hash(&a).len(), HASH_LEN);
    }

    #[test]
    fn canonical_escapes_strings() {
        let v = json!({"k": "quote\"d"});
        assert_eq!(canonical_json(&v), r#"{"k":"quote\"d"}"#);
    }
}
