//! Canonical request hashing for idempotent replay detection.
//!
//! Two submissions count as "the same request" when their canonical JSON
//! forms are byte-identical: object keys sorted recursively, compact
//! separators, no insignificant whitespace. The digest is the base64url
//! SHA-256 of that canonical form, mirroring how JWK thumbprints are derived.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// Base64url-encoded SHA-256 digest of a canonical request body
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestHash(String);

impl RequestHash {
    /// Hash a parsed JSON request body
    pub fn of_value(body: &Value) -> Self {
        let canonical = canonical_json(body);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    /// Hash a serializable request body
    pub fn of<T: Serialize>(body: &T) -> Result<Self, GatewayError> {
        let value = serde_json::to_value(body).map_err(|e| {
            GatewayError::validation(
                "unhashable_request",
                format!("request body cannot be canonicalized: {e}"),
            )
        })?;
        Ok(Self::of_value(&value))
    }

    /// Borrow the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render a JSON value in canonical form
///
/// Object keys are emitted in lexicographic order at every depth; arrays keep
/// their order; separators are compact. Stable under key reordering and
/// formatting differences in the source document.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string escaping for the key itself
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already serialize compactly and deterministically
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"amount":100,"creditor":{"iban":"X","name":"Y"}}"#)
            .unwrap();
        let b: Value = serde_json::from_str(r#"{"creditor":{"name":"Y","iban":"X"},"amount":100}"#)
            .unwrap();
        assert_eq!(RequestHash::of_value(&a), RequestHash::of_value(&b));
    }

    #[test]
    fn test_whitespace_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"amount": 100,  "ref": "abc"}"#).unwrap();
        let b: Value = serde_json::from_str("{\"amount\":100,\"ref\":\"abc\"}").unwrap();
        assert_eq!(RequestHash::of_value(&a), RequestHash::of_value(&b));
    }

    #[test]
    fn test_value_changes_change_the_hash() {
        let a = json!({"amount": 100});
        let b = json!({"amount": 101});
        assert_ne!(RequestHash::of_value(&a), RequestHash::of_value(&b));

        // Array order is significant
        let c = json!({"items": [1, 2]});
        let d = json!({"items": [2, 1]});
        assert_ne!(RequestHash::of_value(&c), RequestHash::of_value(&d));
    }

    #[test]
    fn test_canonical_form_shape() {
        let value = json!({"b": 1, "a": {"d": null, "c": [true, "x"]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":[true,"x"],"d":null},"b":1}"#
        );
    }

    #[test]
    fn test_hash_of_serializable() {
        #[derive(Serialize)]
        struct Payment {
            amount: i64,
            reference: String,
        }
        let hash = RequestHash::of(&Payment {
            amount: 100,
            reference: "inv-1".into(),
        })
        .unwrap();
        assert_eq!(
            hash,
            RequestHash::of_value(&json!({"reference": "inv-1", "amount": 100}))
        );
    }
}
