//! Argument sanitization for tool-call records
//!
//! Recorded tool arguments must never leak credentials into logs or audit
//! files. Values under sensitive keys are redacted wholesale; everything
//! else is truncated so a single oversized argument cannot blow up the
//! audit trail.

use serde_json::{json, Map, Value};

/// Maximum string length kept in a sanitized record
const MAX_STRING_LEN: usize = 200;
/// Maximum array items kept in a sanitized record
const MAX_ARRAY_ITEMS: usize = 10;
/// Maximum nesting depth kept in a sanitized record
const MAX_DEPTH: usize = 3;

const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "apikey",
    "token",
    "secret",
    "auth",
    "credential",
    "private",
];

/// Whether a key names a credential-bearing field
///
/// Matching is case-insensitive and ignores `_` and `-`, so `api_key`,
/// `API-Key`, and `apiKey` all match.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_lowercase();
    SENSITIVE_FRAGMENTS.iter().any(|f| normalized.contains(f))
}

/// Produce a redacted, truncated copy of tool arguments for recording
#[must_use]
pub fn sanitize_args(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return json!("[truncated]");
    }

    match value {
        Value::String(s) if s.len() > MAX_STRING_LEN => {
            let cut: String = s.chars().take(MAX_STRING_LEN).collect();
            json!(format!("{cut}… ({} chars)", s.len()))
        }
        Value::Array(items) => {
            let mut kept: Vec<Value> = items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|v| sanitize_at(v, depth + 1))
                .collect();
            if items.len() > MAX_ARRAY_ITEMS {
                kept.push(json!(format!("… {} more items", items.len() - MAX_ARRAY_ITEMS)));
            }
            Value::Array(kept)
        }
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, val) in fields {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), json!("[redacted]"));
                } else {
                    out.insert(key.clone(), sanitize_at(val, depth + 1));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_key_variants() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("API-Key"));
        assert!(is_sensitive_key("authToken"));
        assert!(is_sensitive_key("client_secret"));
        assert!(is_sensitive_key("private_key"));
        assert!(!is_sensitive_key("path"));
        assert!(!is_sensitive_key("query"));
    }

    #[test]
    fn test_redacts_nested_credentials() {
        let args = json!({
            "query": "find foo",
            "neo4j": {"username": "neo4j", "password": "hunter2"}
        });
        let clean = sanitize_args(&args);
        assert_eq!(clean["neo4j"]["password"], json!("[redacted]"));
        assert_eq!(clean["query"], json!("find foo"));
    }

    #[test]
    fn test_truncates_long_strings() {
        let long = "x".repeat(500);
        let clean = sanitize_args(&json!({ "content": long }));
        let s = clean["content"].as_str().unwrap();
        assert!(s.len() < 300);
        assert!(s.contains("500 chars"));
    }

    #[test]
    fn test_truncates_arrays_and_depth() {
        let args = json!({
            "items": (0..25).collect::<Vec<i32>>(),
            "a": {"b": {"c": {"d": 1}}}
        });
        let clean = sanitize_args(&args);
        assert_eq!(clean["items"].as_array().unwrap().len(), MAX_ARRAY_ITEMS + 1);
        assert_eq!(clean["a"]["b"]["c"], json!("[truncated]"));
    }
}
