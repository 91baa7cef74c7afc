//! Operation model: structural diff, ordered apply, and inversion of JSON
//! document changes.
//!
//! ```text
//!   before ──diff──► [op, op, op] ──apply──► after
//!     ▲                   │
//!     └──apply── invert ◄─┘
//! ```
//!
//! Paths address a location from the document root. A segment is either an
//! object key or an array index. All-digit keys addressed against an array
//! are treated as indices; against an object they stay keys.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    fn as_key(&self) -> String {
        match self {
            PathSegment::Key(key) => key.clone(),
            PathSegment::Index(index) => index.to_string(),
        }
    }

    fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Key(key) if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) => {
                key.parse().ok()
            }
            PathSegment::Key(_) => None,
        }
    }

    /// Empty container to create when this segment addresses a missing parent.
    fn empty_container(&self) -> Value {
        match self {
            PathSegment::Index(_) => Value::Array(Vec::new()),
            PathSegment::Key(_) => Value::Object(Map::new()),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Key(key) => f.write_str(key),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

pub type Path = Vec<PathSegment>;

/// Build a path from a dotted string, e.g. `"profile.name"`.
///
/// An empty string is the document root.
pub fn path(dotted: &str) -> Path {
    if dotted.is_empty() {
        return Vec::new();
    }
    dotted.split('.').map(PathSegment::from).collect()
}

fn display_path(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("/{}", parts.join("/"))
}

/// A single change to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// `before: None` means the location did not exist (array insert).
    Set {
        path: Path,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_value"
        )]
        before: Option<Value>,
        after: Value,
    },
    /// `after` holds the removed value so the delete can be inverted.
    Delete { path: Path, after: Value },
}

/// Keeps an explicit `null` as `Some(Value::Null)` instead of `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Operation {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Operation::Set { path, .. } | Operation::Delete { path, .. } => path,
        }
    }

    /// The operation that undoes this one.
    pub fn inverse(&self) -> Operation {
        match self {
            Operation::Set {
                path,
                before: Some(before),
                after,
            } => Operation::Set {
                path: path.clone(),
                before: Some(after.clone()),
                after: before.clone(),
            },
            Operation::Set {
                path,
                before: None,
                after,
            } => Operation::Delete {
                path: path.clone(),
                after: after.clone(),
            },
            Operation::Delete { path, after } => Operation::Set {
                path: path.clone(),
                before: None,
                after: after.clone(),
            },
        }
    }
}

/// Errors raised while applying operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpsError {
    #[error("cannot address {path}: parent is not a container")]
    InvalidTarget { path: String },
    #[error("invalid array index '{segment}' at {path}")]
    InvalidIndex { path: String, segment: String },
    #[error("array index {index} at {path} is too far past the end (len {len})")]
    IndexOutOfRange { path: String, index: usize, len: usize },
}

/// How many `null`s a single set may pad an array with.
pub const MAX_INDEX_GAP: usize = 1024;

// ─── diff ────────────────────────────────────────────────────────────

/// Compute the operations that turn `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_at(&mut path, before, after, &mut ops);
    ops
}

fn diff_at(path: &mut Path, before: &Value, after: &Value, ops: &mut Vec<Operation>) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => diff_objects(path, old, new, ops),
        (Value::Array(old), Value::Array(new)) => diff_arrays(path, old, new, ops),
        _ if before == after => {}
        _ => ops.push(Operation::Set {
            path: path.clone(),
            before: Some(before.clone()),
            after: after.clone(),
        }),
    }
}

fn diff_objects(
    path: &mut Path,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    ops: &mut Vec<Operation>,
) {
    for (key, value) in old {
        if !new.contains_key(key) {
            path.push(PathSegment::Key(key.clone()));
            ops.push(Operation::Delete {
                path: path.clone(),
                after: value.clone(),
            });
            path.pop();
        }
    }
    for (key, value) in new {
        path.push(PathSegment::Key(key.clone()));
        match old.get(key) {
            Some(previous) => diff_at(path, previous, value, ops),
            None => ops.push(Operation::Set {
                path: path.clone(),
                before: None,
                after: value.clone(),
            }),
        }
        path.pop();
    }
}

fn diff_arrays(path: &mut Path, old: &[Value], new: &[Value], ops: &mut Vec<Operation>) {
    let shared = old.len().min(new.len());
    for index in 0..shared {
        path.push(PathSegment::Index(index));
        diff_at(path, &old[index], &new[index], ops);
        path.pop();
    }
    for (index, value) in new.iter().enumerate().skip(shared) {
        path.push(PathSegment::Index(index));
        ops.push(Operation::Set {
            path: path.clone(),
            before: None,
            after: value.clone(),
        });
        path.pop();
    }
    // Remove from the end so earlier indices stay valid.
    for index in (shared..old.len()).rev() {
        path.push(PathSegment::Index(index));
        ops.push(Operation::Delete {
            path: path.clone(),
            after: old[index].clone(),
        });
        path.pop();
    }
}

// ─── apply ───────────────────────────────────────────────────────────

/// Apply `ops` to `target` in order.
///
/// On error `target` may hold the effects of the operations that preceded
/// the failing one; callers that need atomicity apply to a copy.
pub fn apply(target: &mut Value, ops: &[Operation]) -> Result<(), OpsError> {
    for op in ops {
        apply_one(target, op)?;
    }
    Ok(())
}

fn apply_one(target: &mut Value, op: &Operation) -> Result<(), OpsError> {
    match op {
        Operation::Set {
            path,
            before,
            after,
        } => apply_set(target, path, before.is_none(), after.clone()),
        Operation::Delete { path, .. } => apply_delete(target, path),
    }
}

fn apply_set(target: &mut Value, path: &[PathSegment], insert: bool, value: Value) -> Result<(), OpsError> {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return Ok(());
    };

    let mut current = target;
    for (depth, segment) in parents.iter().enumerate() {
        let next = &path[depth + 1];
        current = child_or_create(current, segment, next, &path[..=depth])?;
    }

    match current {
        Value::Object(map) => {
            map.insert(last.as_key(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(last, path)?;
            if index < items.len() {
                if insert {
                    items.insert(index, value);
                } else {
                    items[index] = value;
                }
            } else {
                check_gap(index, items.len(), path)?;
                items.resize(index, Value::Null);
                items.push(value);
            }
            Ok(())
        }
        _ => Err(OpsError::InvalidTarget {
            path: display_path(path),
        }),
    }
}

fn child_or_create<'a>(
    current: &'a mut Value,
    segment: &PathSegment,
    next: &PathSegment,
    prefix: &[PathSegment],
) -> Result<&'a mut Value, OpsError> {
    match current {
        Value::Object(map) => {
            let child = map.entry(segment.as_key()).or_insert(Value::Null);
            if child.is_null() {
                *child = next.empty_container();
            }
            Ok(child)
        }
        Value::Array(items) => {
            let index = array_index(segment, prefix)?;
            if index >= items.len() {
                check_gap(index, items.len(), prefix)?;
                let len = index.checked_add(1).ok_or_else(|| OpsError::IndexOutOfRange {
                    path: display_path(prefix),
                    index,
                    len: items.len(),
                })?;
                items.resize(len, Value::Null);
            }
            let child = &mut items[index];
            if child.is_null() {
                *child = next.empty_container();
            }
            Ok(child)
        }
        _ => Err(OpsError::InvalidTarget {
            path: display_path(prefix),
        }),
    }
}

fn apply_delete(target: &mut Value, path: &[PathSegment]) -> Result<(), OpsError> {
    let Some((last, parents)) = path.split_last() else {
        *target = Value::Null;
        return Ok(());
    };

    let mut current = target;
    for (depth, segment) in parents.iter().enumerate() {
        let child = match current {
            Value::Object(map) => map.get_mut(&segment.as_key()),
            Value::Array(items) => {
                let index = array_index(segment, &path[..=depth])?;
                items.get_mut(index)
            }
            _ => None,
        };
        match child {
            Some(child) => current = child,
            None => return Ok(()),
        }
    }

    match current {
        Value::Object(map) => {
            map.remove(&last.as_key());
        }
        Value::Array(items) => {
            let index = array_index(last, path)?;
            if index < items.len() {
                items.remove(index);
            }
        }
        _ => {}
    }
    Ok(())
}

fn array_index(segment: &PathSegment, path: &[PathSegment]) -> Result<usize, OpsError> {
    segment.as_index().ok_or_else(|| OpsError::InvalidIndex {
        path: display_path(path),
        segment: segment.to_string(),
    })
}

fn check_gap(index: usize, len: usize, path: &[PathSegment]) -> Result<(), OpsError> {
    if index - len > MAX_INDEX_GAP {
        return Err(OpsError::IndexOutOfRange {
            path: display_path(path),
            index,
            len,
        });
    }
    Ok(())
}

/// Value at `path`, using the same key/index coercion as [`apply`].
pub fn lookup<'a>(document: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(&segment.as_key()),
        Value::Array(items) => items.get(segment.as_index()?),
        _ => None,
    })
}

// ─── invert / equal ──────────────────────────────────────────────────

/// The list that undoes `ops`: reversed, each operation inverted.
pub fn invert(ops: &[Operation]) -> Vec<Operation> {
    ops.iter().rev().map(Operation::inverse).collect()
}

/// Structural equality of two operation lists.
pub fn equal(a: &[Operation], b: &[Operation]) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(a: Value, b: Value) {
        let ops = diff(&a, &b);
        let mut doc = a.clone();
        apply(&mut doc, &ops).unwrap();
        assert_eq!(doc, b, "apply(diff) mismatch: {ops:?}");
        apply(&mut doc, &invert(&ops)).unwrap();
        assert_eq!(doc, a, "invert mismatch: {ops:?}");
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let doc = json!({"a": [1, {"b": true}], "c": "x"});
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_diff_object_fields() {
        let ops = diff(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(
            ops,
            vec![
                Operation::Delete { path: path("a"), after: json!(1) },
                Operation::Set { path: path("b"), before: Some(json!(2)), after: json!(3) },
                Operation::Set { path: path("c"), before: None, after: json!(4) },
            ]
        );
    }

    #[test]
    fn test_diff_array_shrink_deletes_from_end() {
        let ops = diff(&json!([1, 2, 3, 4]), &json!([1]));
        let indices: Vec<_> = ops.iter().map(|op| op.path().to_vec()).collect();
        assert_eq!(
            indices,
            vec![vec![PathSegment::Index(3)], vec![PathSegment::Index(2)], vec![PathSegment::Index(1)]]
        );
    }

    #[test]
    fn test_diff_type_change_replaces() {
        let ops = diff(&json!({"a": [1]}), &json!({"a": {"0": 1}}));
        assert_eq!(
            ops,
            vec![Operation::Set {
                path: path("a"),
                before: Some(json!([1])),
                after: json!({"0": 1}),
            }]
        );
    }

    #[test]
    fn test_diff_apply_invert_roundtrips() {
        roundtrip(json!({}), json!({"count": 1}));
        roundtrip(json!({"count": 1}), json!({}));
        roundtrip(json!({"list": [1, 2, 3]}), json!({"list": [1, 5]}));
        roundtrip(json!({"list": [1]}), json!({"list": [1, [2, {"x": null}], 3]}));
        roundtrip(json!({"a": {"b": {"c": 1}}}), json!({"a": {"b": null}}));
        roundtrip(json!([{"id": 1}, {"id": 2}]), json!([{"id": 2}]));
        roundtrip(json!("scalar"), json!({"now": "object"}));
        roundtrip(json!({"n": null}), json!({"n": 0}));
    }

    #[test]
    fn test_apply_creates_intermediates() {
        let mut doc = json!({});
        apply(
            &mut doc,
            &[
                Operation::Set { path: path("a.b"), before: None, after: json!(1) },
                Operation::Set {
                    path: vec!["list".into(), 2usize.into()],
                    before: None,
                    after: json!("x"),
                },
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"a": {"b": 1}, "list": [null, null, "x"]}));
    }

    #[test]
    fn test_apply_array_insert_vs_replace() {
        let mut doc = json!([1, 2, 3]);
        apply(&mut doc, &[Operation::Set { path: vec![1usize.into()], before: None, after: json!(9) }]).unwrap();
        assert_eq!(doc, json!([1, 9, 2, 3]));
        apply(&mut doc, &[Operation::Set { path: vec![0usize.into()], before: Some(json!(1)), after: json!(0) }]).unwrap();
        assert_eq!(doc, json!([0, 9, 2, 3]));
    }

    #[test]
    fn test_numeric_key_coercion_by_container() {
        let mut doc = json!({"list": [1, 2], "map": {}});
        apply(
            &mut doc,
            &[
                Operation::Delete { path: path("list.0"), after: json!(1) },
                Operation::Set { path: path("map.0"), before: None, after: json!("zero") },
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"list": [2], "map": {"0": "zero"}}));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let mut doc = json!({"a": 1});
        apply(&mut doc, &[Operation::Delete { path: path("x.y.z"), after: json!(0) }]).unwrap();
        apply(&mut doc, &[Operation::Delete { path: path("b"), after: json!(0) }]).unwrap();
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_apply_errors() {
        let mut doc = json!({"a": 1, "list": []});
        let err = apply(&mut doc, &[Operation::Set { path: path("a.b"), before: None, after: json!(1) }]);
        assert!(matches!(err, Err(OpsError::InvalidTarget { .. })));

        let err = apply(&mut doc, &[Operation::Set { path: path("list.first"), before: None, after: json!(1) }]);
        assert!(matches!(err, Err(OpsError::InvalidIndex { .. })));
    }

    #[test]
    fn test_far_index_is_rejected() {
        let mut doc = json!({"list": [1]});
        let leaf = Operation::Set { path: vec!["list".into(), usize::MAX.into()], before: None, after: json!(1) };
        assert!(matches!(apply(&mut doc, &[leaf]), Err(OpsError::IndexOutOfRange { .. })));

        let nested = Operation::Set {
            path: vec!["list".into(), usize::MAX.into(), "x".into()],
            before: None,
            after: json!(1),
        };
        assert!(matches!(apply(&mut doc, &[nested]), Err(OpsError::IndexOutOfRange { .. })));

        let gap = Operation::Set {
            path: vec!["list".into(), (1 + MAX_INDEX_GAP + 1).into()],
            before: None,
            after: json!(1),
        };
        assert!(matches!(apply(&mut doc, &[gap]), Err(OpsError::IndexOutOfRange { .. })));
        assert_eq!(doc, json!({"list": [1]}));

        let edge = Operation::Set { path: vec!["list".into(), (1 + MAX_INDEX_GAP).into()], before: None, after: json!(2) };
        apply(&mut doc, &[edge]).unwrap();
        assert_eq!(doc["list"].as_array().unwrap().len(), MAX_INDEX_GAP + 2);
    }

    #[test]
    fn test_lookup() {
        let doc = json!({"list": [{"name": "a"}], "map": {"0": true}});
        assert_eq!(lookup(&doc, &path("list.0.name")), Some(&json!("a")));
        assert_eq!(lookup(&doc, &path("map.0")), Some(&json!(true)));
        assert_eq!(lookup(&doc, &[]), Some(&doc));
        assert_eq!(lookup(&doc, &path("list.x")), None);
        assert_eq!(lookup(&doc, &path("missing.deep")), None);
    }

    #[test]
    fn test_invert_reverses_order() {
        let ops = vec![
            Operation::Set { path: path("a"), before: None, after: json!(1) },
            Operation::Set { path: path("a"), before: Some(json!(1)), after: json!(2) },
        ];
        let inverse = invert(&ops);
        assert_eq!(
            inverse,
            vec![
                Operation::Set { path: path("a"), before: Some(json!(2)), after: json!(1) },
                Operation::Delete { path: path("a"), after: json!(1) },
            ]
        );
    }

    #[test]
    fn test_equal() {
        let a = diff(&json!({"x": 1}), &json!({"x": 2}));
        let b = diff(&json!({"x": 1}), &json!({"x": 2}));
        let c = diff(&json!({"x": 1}), &json!({"x": 3}));
        assert!(equal(&a, &b));
        assert!(!equal(&a, &c));
        assert!(!equal(&a, &[]));
    }

    #[test]
    fn test_operation_wire_format() {
        let op = Operation::Set { path: vec!["list".into(), 0usize.into()], before: Some(Value::Null), after: json!(1) };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"op": "set", "path": ["list", 0], "before": null, "after": 1}));
        let back: Operation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);

        let insert: Operation = serde_json::from_value(json!({"op": "set", "path": ["a"], "after": 1})).unwrap();
        assert_eq!(insert, Operation::Set { path: path("a"), before: None, after: json!(1) });
    }
}
