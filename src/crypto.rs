//! Hashing helpers: canonical JSON encoding and SHA-256 hex digests.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

/// Length of a rendered digest (SHA-256 as lowercase hex).
pub const DIGEST_HEX_LEN: usize = 64;

/// Hash inputs (concatenate as bytes, SHA-256) and return lowercase hex.
pub fn hash_concat(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hex::encode(hasher.finalize())
}

/// Rebuild a JSON value with every object's keys in sorted order.
///
/// `serde_json::Map` only sorts when the `preserve_order` feature is off, and
/// any crate in the build graph can turn it on, so ordering is forced here.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize any value to its canonical, whitespace-free JSON bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, LedgerError> {
    let value = serde_json::to_value(value).map_err(|e| LedgerError::Encoding(e.to_string()))?;
    serde_json::to_vec(&canonicalize(&value)).map_err(|e| LedgerError::Encoding(e.to_string()))
}

/// SHA-256 hex digest of the canonical encoding of `value`.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String, LedgerError> {
    Ok(hash_concat(&[&canonical_bytes(value)?]))
}

/// True if `s` looks like a rendered digest.
pub fn is_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_digest() {
        let a: Value =
            serde_json::from_str(r#"{"nom":"Ferme Atlas","region":"Souss","meta":{"b":1,"a":2}}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"region":"Souss","meta":{"a":2,"b":1},"nom":"Ferme Atlas"}"#)
                .unwrap();
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn canonical_bytes_have_no_whitespace_and_sorted_keys() {
        let bytes = canonical_bytes(&json!({"z": [1, {"y": true, "x": null}], "a": "s"})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":"s","z":[1,{"x":null,"y":true}]}"#
        );
    }

    #[test]
    fn digest_is_deterministic_hex() {
        let v = json!({"index": 3, "timestamp": 1700000000.25, "payload": {"k": "v"}});
        let d1 = digest(&v).unwrap();
        let d2 = digest(&v).unwrap();
        assert_eq!(d1, d2);
        assert!(is_digest(&d1));
    }

    #[test]
    fn different_content_different_digest() {
        assert_ne!(
            digest(&json!({"a": 1})).unwrap(),
            digest(&json!({"a": 2})).unwrap()
        );
    }

    #[test]
    fn is_digest_rejects_bad_input() {
        assert!(!is_digest("abc"));
        assert!(!is_digest(&"G".repeat(64)));
        assert!(!is_digest(&"A".repeat(64)));
    }
}
