//! Cache key composition.
//!
//! Keys are plain strings of the form `namespace:type:identifier:version`.
//! Every function here is pure so that invalidation handlers can recompute
//! the exact key a writer used without talking to it.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

const QUERY_HASH_LEN: usize = 16;

/// Components of a four-part cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCacheKey {
    pub namespace: String,
    pub key_type: String,
    pub identifier: String,
    pub version: String,
}

/// Build a deterministic cache key.
///
/// The version segment is dropped when `version` is empty.
pub fn generate_cache_key(
    namespace: &str,
    key_type: &str,
    identifier: &str,
    version: &str,
) -> String {
    if version.is_empty() {
        format!("{namespace}:{key_type}:{identifier}")
    } else {
        format!("{namespace}:{key_type}:{identifier}:{version}")
    }
}

/// Split a four-part key back into its segments.
pub fn parse_cache_key(key: &str) -> Option<ParsedCacheKey> {
    let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    let [namespace, key_type, identifier, version] = parts.as_slice() else {
        return None;
    };

    Some(ParsedCacheKey {
        namespace: (*namespace).to_string(),
        key_type: (*key_type).to_string(),
        identifier: (*identifier).to_string(),
        version: (*version).to_string(),
    })
}

/// Digest a set of query parameters independently of their order.
pub fn hash_query_params(params: &Map<String, Value>) -> String {
    let mut pairs: Vec<(&String, &Value)> = params.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (name, value) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"&");
    }

    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(QUERY_HASH_LEN);
    digest
}

/// Build a glob covering a namespace, optionally narrowed by type and identifier.
pub fn create_cache_pattern(
    namespace: &str,
    key_type: Option<&str>,
    identifier: Option<&str>,
) -> String {
    match (key_type, identifier) {
        (Some(key_type), Some(identifier)) => format!("{namespace}:{key_type}:{identifier}:*"),
        (Some(key_type), None) => format!("{namespace}:{key_type}:*"),
        _ => format!("{namespace}:*"),
    }
}

/// Render a JSON payload field as a key identifier.
///
/// Strings are used verbatim, numbers and booleans by their display form.
/// Null, arrays and objects cannot identify a single entry.
pub fn identifier_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn generate_key_has_four_segments() {
        assert_eq!(
            generate_cache_key("content", "post", "123", "v1"),
            "content:post:123:v1"
        );
    }

    #[test]
    fn generate_key_without_version() {
        assert_eq!(
            generate_cache_key("content", "item", "42", ""),
            "content:item:42"
        );
    }

    #[test]
    fn generate_key_is_deterministic() {
        let first = generate_cache_key("user", "email", "a@example.com", "v2");
        let second = generate_cache_key("user", "email", "a@example.com", "v2");
        assert_eq!(first, second);
    }

    #[test]
    fn parse_round_trips_generated_key() {
        let key = generate_cache_key("content", "post", "123", "v1");
        let parsed = parse_cache_key(&key).expect("four-part key parses");

        assert_eq!(parsed.namespace, "content");
        assert_eq!(parsed.key_type, "post");
        assert_eq!(parsed.identifier, "123");
        assert_eq!(parsed.version, "v1");
    }

    #[test]
    fn parse_rejects_short_keys() {
        assert!(parse_cache_key("invalid:key").is_none());
        assert!(parse_cache_key("a:b:c:d:e").is_none());
    }

    #[test]
    fn query_hash_ignores_parameter_order() {
        let first = json!({ "limit": 10, "offset": 0, "sort": "asc" });
        let second = json!({ "offset": 0, "sort": "asc", "limit": 10 });

        let first = hash_query_params(first.as_object().expect("object"));
        let second = hash_query_params(second.as_object().expect("object"));

        assert_eq!(first, second);
        assert_eq!(first.len(), QUERY_HASH_LEN);
    }

    #[test]
    fn query_hash_differs_for_different_values() {
        let first = json!({ "limit": 10 });
        let second = json!({ "limit": 20 });

        assert_ne!(
            hash_query_params(first.as_object().expect("object")),
            hash_query_params(second.as_object().expect("object"))
        );
    }

    #[test]
    fn patterns_narrow_by_segment() {
        assert_eq!(create_cache_pattern("content", None, None), "content:*");
        assert_eq!(
            create_cache_pattern("content", Some("post"), None),
            "content:post:*"
        );
        assert_eq!(
            create_cache_pattern("content", Some("post"), Some("123")),
            "content:post:123:*"
        );
    }

    #[test]
    fn identifiers_from_payload_values() {
        assert_eq!(identifier_from_value(&json!("42")), Some("42".to_string()));
        assert_eq!(identifier_from_value(&json!(42)), Some("42".to_string()));
        assert_eq!(identifier_from_value(&json!("")), None);
        assert_eq!(identifier_from_value(&Value::Null), None);
        assert_eq!(identifier_from_value(&json!({ "id": 1 })), None);
    }
}
