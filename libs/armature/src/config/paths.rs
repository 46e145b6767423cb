//! Dotted-path access into `serde_json` object trees.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Insert `value` at a dotted path, creating intermediate objects as needed.
/// Intermediate non-objects are replaced.
pub fn insert(map: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = map;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_owned(), value);
            return;
        }
        let slot = current
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().unwrap_or_else(|| unreachable!());
    }
}

/// Look a dotted path up.
pub fn get<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Flatten a value tree into leaf paths. Objects recurse; everything else
/// (including arrays) is a leaf.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                collect(key.clone(), child, &mut out);
            }
        }
        other => {
            out.insert(String::new(), other.clone());
        }
    }
    out
}

fn collect(path: String, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                collect(format!("{path}.{key}"), child, out);
            }
        }
        other => {
            out.insert(path, other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_and_get_nested() {
        let mut map = Map::new();
        insert(&mut map, "endpoint.host", json!("localhost"));
        insert(&mut map, "endpoint.port", json!(8080));
        insert(&mut map, "name", json!("svc"));

        assert_eq!(get(&map, "endpoint.host"), Some(&json!("localhost")));
        assert_eq!(get(&map, "endpoint.port"), Some(&json!(8080)));
        assert_eq!(get(&map, "name"), Some(&json!("svc")));
        assert_eq!(get(&map, "endpoint.missing"), None);
        assert_eq!(get(&map, "ghost"), None);
    }

    #[test]
    fn flatten_produces_leaf_paths() {
        let value = json!({"a": {"b": 1, "c": {"d": true}}, "e": [1, 2]});
        let flat = flatten(&value);
        assert_eq!(flat.get("a.b"), Some(&json!(1)));
        assert_eq!(flat.get("a.c.d"), Some(&json!(true)));
        assert_eq!(flat.get("e"), Some(&json!([1, 2])));
        assert_eq!(flat.len(), 3);
    }
}
