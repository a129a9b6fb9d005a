//! Canonical JSON and content digests.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 of a value's canonical JSON form.
pub fn content_digest(value: &serde_json::Value) -> [u8; 32] {
    let canonical = canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().into()
}

/// Hex-encoded [`content_digest`].
pub fn content_digest_hex(value: &serde_json::Value) -> String {
    hex::encode(content_digest(value))
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_digest_ignores_key_order() {
        let a = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "v"}});
        let b = serde_json::json!({"a": {"x": "v", "y": [1, 2]}, "b": 2});

        assert_eq!(content_digest(&a), content_digest(&b));
    }

    #[test]
    fn test_digest_sensitive_to_array_order() {
        let a = serde_json::json!({"configmaps": ["one", "two"]});
        let b = serde_json::json!({"configmaps": ["two", "one"]});

        assert_ne!(content_digest_hex(&a), content_digest_hex(&b));
    }

    #[test]
    fn test_canonical_json_escapes() {
        let value = serde_json::json!({"k": "line\n\"quoted\"\u{1}"});
        assert_eq!(
            canonical_json(&value),
            r#"{"k":"line\n\"quoted\"\u0001"}"#
        );
    }

    #[test]
    fn test_digest_hex_length() {
        let hex = content_digest_hex(&serde_json::json!(null));
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    proptest! {
        #[test]
        fn prop_canonical_json_parses_back(key in "[a-z\"\\\\]{1,8}", text in "\\PC{0,16}") {
            let value = serde_json::json!({ key.clone(): text.clone() });
            let reparsed: serde_json::Value = serde_json::from_str(&canonical_json(&value)).unwrap();
            prop_assert_eq!(reparsed, value);
        }
    }
}
