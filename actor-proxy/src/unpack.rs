//! Extraction of reply fields into positional values
//!
//! [`unpack`] works on a single mapping or on a batch of them and selects
//! fields either by exact key or by glob pattern. Matching is done in two
//! phases: all keys of the input are collected first, then every pattern is
//! matched against that set. This lets missing patterns be reported all at
//! once before any value is extracted.
//!
//! The result collapses: one value comes back as a bare scalar, several as a
//! list, none as [`Unpacked::None`]. Use [`UnpackOptions::as_seq`] or the typed
//! accessors on [`Unpacked`] when the arity is not known in advance.

use std::collections::HashSet;

use glob::Pattern;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::invoke::InvocationBatch;
use crate::reply::Reply;
use crate::types::Payload;

/// Outcome of an unpack
#[derive(Debug, Clone, PartialEq)]
pub enum Unpacked {
    /// Nothing matched, or the input was empty
    None,
    Scalar(Value),
    List(Vec<Value>),
}

impl Unpacked {
    fn collapse(values: Vec<Value>, as_seq: bool) -> Self {
        if as_seq {
            return Unpacked::List(values);
        }
        let mut values = values;
        match values.len() {
            0 => Unpacked::None,
            1 => Unpacked::Scalar(values.remove(0)),
            _ => Unpacked::List(values),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Unpacked::None)
    }

    pub fn len(&self) -> usize {
        match self {
            Unpacked::None => 0,
            Unpacked::Scalar(_) => 1,
            Unpacked::List(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All values, whatever the collapsed shape.
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Unpacked::None => Vec::new(),
            Unpacked::Scalar(value) => vec![value],
            Unpacked::List(values) => values,
        }
    }

    pub fn first(&self) -> Option<&Value> {
        match self {
            Unpacked::None => None,
            Unpacked::Scalar(value) => Some(value),
            Unpacked::List(values) => values.first(),
        }
    }

    /// The single value, if exactly one was extracted.
    pub fn into_scalar(self) -> Option<Value> {
        match self {
            Unpacked::Scalar(value) => Some(value),
            Unpacked::List(mut values) if values.len() == 1 => values.pop(),
            _ => None,
        }
    }

    /// Destructure into exactly `N` values.
    pub fn into_array<const N: usize>(self) -> Result<[Value; N]> {
        let values = self.into_vec();
        let found = values.len();
        values
            .try_into()
            .map_err(|_| ProxyError::Arity { expected: N, found })
    }
}

impl From<Unpacked> for Value {
    fn from(unpacked: Unpacked) -> Self {
        match unpacked {
            Unpacked::None => Value::Null,
            Unpacked::Scalar(value) => value,
            Unpacked::List(values) => Value::Array(values),
        }
    }
}

/// Flags of [`unpack_with`]
///
/// Keys containing `*`, `?` or `[` are glob patterns. A key the glob syntax
/// rejects, such as `a**b`, is matched literally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackOptions {
    /// Always return a list, even for zero or one value
    pub as_seq: bool,

    /// Fail when a key pattern matches nothing in the whole input
    pub exception_on_missing_keys: bool,
}

impl UnpackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_seq(mut self, as_seq: bool) -> Self {
        self.as_seq = as_seq;
        self
    }

    pub fn exception_on_missing_keys(mut self, strict: bool) -> Self {
        self.exception_on_missing_keys = strict;
        self
    }
}

/// Anything that can be viewed as an ordered sequence of reply mappings
pub trait UnpackSource {
    fn mappings(&self) -> Vec<&Payload>;
}

impl UnpackSource for Payload {
    fn mappings(&self) -> Vec<&Payload> {
        vec![self]
    }
}

impl UnpackSource for Reply {
    fn mappings(&self) -> Vec<&Payload> {
        vec![self.payload()]
    }
}

impl UnpackSource for [Payload] {
    fn mappings(&self) -> Vec<&Payload> {
        self.iter().collect()
    }
}

impl UnpackSource for Vec<Payload> {
    fn mappings(&self) -> Vec<&Payload> {
        self.iter().collect()
    }
}

impl UnpackSource for [Reply] {
    fn mappings(&self) -> Vec<&Payload> {
        self.iter().map(Reply::payload).collect()
    }
}

impl UnpackSource for Vec<Reply> {
    fn mappings(&self) -> Vec<&Payload> {
        self.iter().map(Reply::payload).collect()
    }
}

impl UnpackSource for InvocationBatch {
    fn mappings(&self) -> Vec<&Payload> {
        self.payloads().collect()
    }
}

/// Unpack with default options: collapsing result, missing keys ignored.
pub fn unpack<S: UnpackSource + ?Sized>(source: &S, keys: &[&str]) -> Unpacked {
    let mappings = source.mappings();
    let patterns = compile(keys);
    Unpacked::collapse(extract(&mappings, &patterns), false)
}

pub fn unpack_with<S: UnpackSource + ?Sized>(
    source: &S,
    keys: &[&str],
    options: UnpackOptions,
) -> Result<Unpacked> {
    let mappings = source.mappings();
    if mappings.iter().all(|mapping| mapping.is_empty()) {
        return Ok(Unpacked::None);
    }

    let patterns = compile(keys);
    if options.exception_on_missing_keys && !patterns.is_empty() {
        let known: HashSet<&str> = mappings
            .iter()
            .flat_map(|mapping| mapping.keys().map(String::as_str))
            .collect();
        let missing: Vec<String> = patterns
            .iter()
            .filter(|pattern| !known.iter().any(|key| pattern.matches(key)))
            .map(|pattern| pattern.source().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ProxyError::UnpackKeysNotFound(missing));
        }
    }

    Ok(Unpacked::collapse(
        extract(&mappings, &patterns),
        options.as_seq,
    ))
}

fn extract(mappings: &[&Payload], patterns: &[KeyPattern]) -> Vec<Value> {
    let mut values = Vec::new();
    for mapping in mappings {
        if patterns.is_empty() {
            values.extend(mapping.values().cloned());
            continue;
        }
        for pattern in patterns {
            values.extend(
                mapping
                    .iter()
                    .filter(|(key, _)| pattern.matches(key))
                    .map(|(_, value)| value.clone()),
            );
        }
    }
    values
}

fn compile(keys: &[&str]) -> Vec<KeyPattern> {
    keys.iter().map(|key| KeyPattern::new(key)).collect()
}

/// One requested key: exact unless it contains glob metacharacters
#[derive(Debug)]
enum KeyPattern {
    Exact(String),
    Glob { source: String, pattern: Pattern },
}

impl KeyPattern {
    fn new(key: &str) -> Self {
        if key.contains(['*', '?', '[']) {
            match Pattern::new(key) {
                Ok(pattern) => {
                    return KeyPattern::Glob {
                        source: key.to_string(),
                        pattern,
                    };
                }
                Err(e) => debug!("key `{key}` is not a valid pattern ({e}), matching it literally"),
            }
        }
        KeyPattern::Exact(key.to_string())
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => exact == key,
            KeyPattern::Glob { pattern, .. } => pattern.matches(key),
        }
    }

    fn source(&self) -> &str {
        match self {
            KeyPattern::Exact(source) | KeyPattern::Glob { source, .. } => source,
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

    fn batch() -> Vec<Payload> {
        vec![
            payload(json!({"a": 1, "b": 2, "e": 7})),
            payload(json!({"c": 3, "d": 4, "e": 8})),
        ]
    }

    #[test]
    fn test_unpack_collapses_single_mapping() {
        assert_eq!(unpack(&payload(json!({"a": 1})), &[]), Unpacked::Scalar(json!(1)));
        assert_eq!(
            unpack(&payload(json!({"a": 1, "b": "x", "c": [3]})), &[]),
            Unpacked::List(vec![json!(1), json!("x"), json!([3])])
        );
        assert!(unpack(&Payload::new(), &[]).is_none());
    }

    #[test]
    fn test_unpack_key_and_as_seq() {
        let data = payload(json!({"a": 1, "b": 2}));

        assert_eq!(unpack(&data, &["b"]), Unpacked::Scalar(json!(2)));
        assert_eq!(
            unpack_with(&data, &["b"], UnpackOptions::new().as_seq(true)).unwrap(),
            Unpacked::List(vec![json!(2)])
        );
        assert_eq!(
            unpack(&data, &["b", "a"]),
            Unpacked::List(vec![json!(2), json!(1)])
        );
    }

    #[test]
    fn test_unpack_wildcard_in_key_order() {
        let data = payload(json!({"east.filename": "/bla", "kkk": 2, "west.filename": "/foo"}));

        assert_eq!(
            unpack(&data, &["*.filename"]),
            Unpacked::List(vec![json!("/bla"), json!("/foo")])
        );
        assert_eq!(unpack(&data, &["k?k"]), Unpacked::Scalar(json!(2)));
        assert_eq!(unpack(&data, &["[ew]*.filename"]).len(), 2);
    }

    #[test]
    fn test_unpack_batch_pools_values() {
        let data = batch();

        assert_eq!(
            unpack(&data, &[]).into_vec(),
            vec![json!(1), json!(2), json!(7), json!(3), json!(4), json!(8)]
        );
        assert_eq!(unpack(&data, &["e"]), Unpacked::List(vec![json!(7), json!(8)]));
        assert_eq!(unpack(&data, &["c"]), Unpacked::Scalar(json!(3)));
        assert!(unpack(&Vec::<Payload>::new(), &["a"]).is_none());
    }

    #[test]
    fn test_unpack_missing_keys() {
        let data = batch();
        let strict = UnpackOptions::new().exception_on_missing_keys(true);

        match unpack_with(&data, &["f"], strict) {
            Err(ProxyError::UnpackKeysNotFound(missing)) => assert_eq!(missing, ["f"]),
            other => panic!("expected missing keys, got {other:?}"),
        }
        match unpack_with(&data, &["a", "f", "z*", "d"], strict) {
            Err(ProxyError::UnpackKeysNotFound(missing)) => assert_eq!(missing, ["f", "z*"]),
            other => panic!("expected missing keys, got {other:?}"),
        }

        assert!(unpack(&data, &["f"]).is_none());
        assert_eq!(
            unpack_with(&data, &["f"], UnpackOptions::new().as_seq(true)).unwrap(),
            Unpacked::List(vec![])
        );
        assert_eq!(
            unpack_with(&data, &["d", "a"], strict).unwrap(),
            Unpacked::List(vec![json!(1), json!(4)])
        );
    }

    #[test]
    fn test_empty_mappings_are_absent() {
        let seq = UnpackOptions::new().as_seq(true);

        assert_eq!(unpack_with(&Payload::new(), &[], seq).unwrap(), Unpacked::None);
        assert_eq!(unpack_with(&Vec::<Payload>::new(), &[], seq).unwrap(), Unpacked::None);
        assert_eq!(
            unpack_with(&vec![Payload::new(), Payload::new()], &["a"], seq).unwrap(),
            Unpacked::None
        );
        assert_eq!(
            unpack_with(&Reply::new("proto", Payload::new()), &[], seq).unwrap(),
            Unpacked::None
        );
        assert!(unpack(&Payload::new(), &[]).is_none());
    }

    #[test]
    fn test_invalid_glob_matches_literally() {
        let data = payload(json!({"a**b": 1, "axxb": 2}));

        assert_eq!(unpack(&data, &["a**b"]), Unpacked::Scalar(json!(1)));
        assert_eq!(unpack(&data, &["a*b"]).into_vec(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_typed_accessors() {
        let data = payload(json!({"ra_h": 1.5, "deg_d": -20.0}));

        let [ra, dec] = unpack(&data, &[]).into_array::<2>().unwrap();
        assert_eq!((ra, dec), (json!(1.5), json!(-20.0)));

        assert!(matches!(
            unpack(&data, &[]).into_array::<3>(),
            Err(ProxyError::Arity { expected: 3, found: 2 })
        ));
        assert_eq!(unpack(&data, &["deg_d"]).into_scalar(), Some(json!(-20.0)));
        assert_eq!(unpack(&data, &[]).first(), Some(&json!(1.5)));
        assert_eq!(Value::from(unpack(&data, &["nothing"])), Value::Null);
    }
}
