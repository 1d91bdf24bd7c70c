//! Flattening of nested reply mappings into dotted keys

use serde_json::Value;

use crate::constants::FLATTEN_SEPARATOR;
use crate::types::Payload;

/// Flatten a nested mapping using `.` as separator.
///
/// `{"a": 1, "e": {"c": 3}}` becomes `{"a": 1, "e.c": 3}`. Keys appear in
/// depth-first order of the source mapping. When two branches produce the same
/// dotted key, the later value wins and the key keeps its first position.
pub fn flatten(map: &Payload) -> Payload {
    flatten_with(map, FLATTEN_SEPARATOR)
}

/// Flatten a nested mapping with a custom key separator.
pub fn flatten_with(map: &Payload, separator: &str) -> Payload {
    let mut flat = Payload::new();
    flatten_into(&mut flat, map, "", separator);
    flat
}

fn flatten_into(flat: &mut Payload, map: &Payload, prefix: &str, separator: &str) {
    for (key, value) in map {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}{separator}{key}")
        };

        match value {
            Value::Object(inner) => flatten_into(flat, inner, &key, separator),
            other => {
                flat.insert(key, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_flatten_nested() {
        let data = payload(json!({"a": 1, "b": 2, "e": {"c": 3, "d": 4, "e": 8}}));
        let flat = flatten(&data);

        assert_eq!(flat, payload(json!({"a": 1, "b": 2, "e.c": 3, "e.d": 4, "e.e": 8})));
        let keys: Vec<_> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, ["a", "b", "e.c", "e.d", "e.e"]);
    }

    #[test]
    fn test_flatten_deep_and_custom_separator() {
        let data = payload(json!({"north": {"camera": {"filename": "/a", "exptime": 2.5}}, "k": [1, 2]}));

        assert_eq!(
            flatten_with(&data, "/"),
            payload(json!({"north/camera/filename": "/a", "north/camera/exptime": 2.5, "k": [1, 2]}))
        );
    }

    #[test]
    fn test_flatten_empty_and_idempotent() {
        assert!(flatten(&Payload::new()).is_empty());

        let flat = payload(json!({"a": 1, "e.c": 3}));
        assert_eq!(flatten(&flat), flat);
        assert_eq!(flatten(&flatten(&flat)), flat);
    }

    #[test]
    fn test_flatten_drops_empty_branches() {
        let data = payload(json!({"a": {}, "b": null}));
        assert_eq!(flatten(&data), payload(json!({"b": null})));
    }

    #[test]
    fn test_flatten_collision_last_write_wins() {
        let data = payload(json!({"e.c": 1, "x": 0, "e": {"c": 2}}));
        let flat = flatten(&data);

        assert_eq!(flat["e.c"], 2);
        let keys: Vec<_> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, ["e.c", "x"]);
    }
}
