//! Deterministic content hashing for the notification ledger.
//!
//! The hash covers `(type, entity_id, normalized_data)`. Normalization
//! replaces nulls with empty strings and sorts object keys recursively, so
//! the same logical event always produces the same hash regardless of field
//! order or optionality. Volatile display values (wait-time estimates) must
//! never be part of `data`.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Null → "" and recursive key sort.
pub fn normalize_data(value: &Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), normalize_data(&map[&k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(normalize_data).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the canonical JSON of `{type, entity_id, data?}`.
pub fn notification_hash(notification_type: &str, entity_id: &str, data: Option<&Value>) -> String {
    let mut key = Map::new();
    key.insert("type".to_string(), notification_type.into());
    key.insert("entity_id".to_string(), entity_id.into());
    if let Some(data) = data {
        key.insert("data".to_string(), normalize_data(data));
    }

    let canonical = serde_json::to_string(&normalize_data(&Value::Object(key)))
        .expect("json serialization must not fail");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_and_empty_string_hash_the_same() {
        let with_null = json!({ "manager_key": null, "reason": "x" });
        let with_empty = json!({ "manager_key": "", "reason": "x" });
        assert_eq!(
            notification_hash("redate", "42", Some(&with_null)),
            notification_hash("redate", "42", Some(&with_empty)),
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({ "a": 1, "b": { "d": 2, "c": 3 } });
        let b = json!({ "b": { "c": 3, "d": 2 }, "a": 1 });
        assert_eq!(
            notification_hash("rating", "7", Some(&a)),
            notification_hash("rating", "7", Some(&b)),
        );
    }

    #[test]
    fn type_and_entity_separate_hashes() {
        let data = json!({ "k": "v" });
        let base = notification_hash("redate", "42", Some(&data));
        assert_ne!(base, notification_hash("rating", "42", Some(&data)));
        assert_ne!(base, notification_hash("redate", "43", Some(&data)));
        assert_ne!(base, notification_hash("redate", "42", None));
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        let h = notification_hash("queue_update", "12", Some(&json!({ "p": 3 })));
        assert_eq!(h.len(), 64);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(h, notification_hash("queue_update", "12", Some(&json!({ "p": 3 }))));
    }
}
