//! Canonical JSON serialization for hashing.
//!
//! The chain hash must be stable across processes and languages, so the
//! hashed form is pinned: object keys sorted lexicographically at every
//! level, UTF-8, no whitespace, and numbers in their shortest round-trip
//! form (serde_json's default float formatting). The `sha256` and
//! `sha256_prev` fields are stripped before hashing.
//!
//! The canonicalization is written out explicitly rather than relying on
//! serde_json's map ordering, so enabling `preserve_order` anywhere in the
//! dependency graph cannot silently change hashes.

use serde_json::Value;

/// Serialize `value` into its canonical form.
///
/// Idempotent over parse: `canonical_json(parse(canonical_json(x)))`
/// equals `canonical_json(x)` for every JSON-representable `x`.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers exactly and floats via ryu, which is
        // the shortest round-trip form the chain rule requires.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json's string serialization handles escaping.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Remove the hash fields from a record object prior to hashing.
///
/// Only the top level carries `sha256` / `sha256_prev`; nested payload keys
/// with those names are caller data and stay put.
#[must_use]
pub fn strip_hash_fields(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                if key == "sha256" || key == "sha256_prev" {
                    continue;
                }
                out.insert(key.clone(), val.clone());
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_at_every_level() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn no_whitespace() {
        let value = json!({"key": [1, 2, 3], "other": "a b"});
        let canonical = canonical_json(&value);
        assert!(!canonical.contains(": "));
        assert!(!canonical.contains(", "));
    }

    #[test]
    fn parse_then_canonicalize_is_fixpoint() {
        let value = json!({"n": 0.1, "big": 12345678901234i64, "s": "héllo\n"});
        let once = canonical_json(&value);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_json(&reparsed), once);
    }

    #[test]
    fn strip_removes_only_top_level_hash_fields() {
        let value = json!({
            "sha256": "aa",
            "sha256_prev": "bb",
            "payload": {"sha256": "caller data"},
            "stage": "fuji"
        });
        let stripped = strip_hash_fields(&value);
        assert!(stripped.get("sha256").is_none());
        assert!(stripped.get("sha256_prev").is_none());
        assert_eq!(
            stripped["payload"]["sha256"],
            Value::String("caller data".into())
        );
    }

    #[test]
    fn escapes_survive_round_trip() {
        let value = json!({"s": "quote \" backslash \\ newline \n"});
        let canonical = canonical_json(&value);
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(reparsed, value);
    }
}
