//! Schema-free config payloads.
//!
//! Config blobs and filter constants are plain JSON trees. The storage layer
//! never knows the schema of a domain, so everything it needs (is a field
//! set, is it a struct, a list or a scalar) is answered structurally here.

use serde_json::{Map, Value};

/// Coarse kind of a value, used for type inference of filter constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    List,
    Struct,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Struct,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Struct => "struct",
        }
    }
}

/// A field counts as set when it is present and not null.
pub fn is_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

/// Looks up a dotted path (`a.b.c`) inside a struct value.
///
/// Numeric segments index into lists, so `rules.0.name` addresses the name
/// of the first rule.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Deep merges `preferred` over `fallback`.
///
/// Structs are merged key by key. Any other preferred value that is set
/// replaces the fallback wholesale, which means lists are never
/// concatenated: a child scope setting a list overrides the inherited one.
pub fn merge(fallback: &Value, preferred: &Value) -> Value {
    if fallback == preferred {
        return preferred.clone();
    }
    match (fallback, preferred) {
        (_, Value::Null) => fallback.clone(),
        (Value::Null, _) => preferred.clone(),
        (Value::Object(fallback_fields), Value::Object(preferred_fields)) => {
            Value::Object(merge_fields(fallback_fields, preferred_fields))
        }
        _ => preferred.clone(),
    }
}

fn merge_fields(fallback: &Map<String, Value>, preferred: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = fallback.clone();
    for (key, preferred_value) in preferred {
        // An explicit null in the preferred struct does not unset the fallback.
        let value = match fallback.get(key) {
            Some(fallback_value) => merge(fallback_value, preferred_value),
            None => preferred_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup() {
        let value = json!({"a": {"b": [{"c": 1}, {"c": 2}]}, "k": "v"});
        assert_eq!(lookup(&value, "k"), Some(&json!("v")));
        assert_eq!(lookup(&value, "a.b.1.c"), Some(&json!(2)));
        assert_eq!(lookup(&value, "a.x"), None);
        assert_eq!(lookup(&value, "k.deeper"), None);
        assert_eq!(lookup(&value, ""), Some(&value));
    }

    #[test]
    fn test_merge_nested_structs() {
        let fallback = json!({"a": {"x": 1, "y": 2}, "b": true});
        let preferred = json!({"a": {"y": 3, "z": 4}});
        assert_eq!(
            merge(&fallback, &preferred),
            json!({"a": {"x": 1, "y": 3, "z": 4}, "b": true})
        );
    }

    #[test]
    fn test_merge_replaces_lists() {
        let parent = json!({"tags": ["a", "b"], "name": "parent"});
        let child = json!({"tags": ["c"]});
        assert_eq!(
            merge(&parent, &child),
            json!({"tags": ["c"], "name": "parent"})
        );

        // An empty list is still set and replaces the inherited one.
        let cleared = json!({"tags": []});
        assert_eq!(merge(&parent, &cleared)["tags"], json!([]));
    }

    #[test]
    fn test_merge_nulls() {
        let value = json!({"a": 1});
        assert_eq!(merge(&Value::Null, &value), value);
        assert_eq!(merge(&value, &Value::Null), value);
        assert_eq!(merge(&value, &json!({"a": null})), value);
        assert_eq!(merge(&json!({}), &json!({"a": null})), json!({"a": null}));
    }

    #[test]
    fn test_merge_kind_mismatch_prefers_preferred() {
        assert_eq!(merge(&json!({"a": 1}), &json!("flat")), json!("flat"));
        assert_eq!(merge(&json!([1, 2]), &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_is_set() {
        assert!(!is_set(None));
        assert!(!is_set(Some(&Value::Null)));
        assert!(is_set(Some(&json!(false))));
        assert!(is_set(Some(&json!([]))));
    }
}
