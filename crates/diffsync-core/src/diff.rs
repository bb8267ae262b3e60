//! Structural diff engine
//!
//! The protocol treats diffs as opaque values: it only computes them, checks
//! whether they are empty, forwards them and applies them. `DiffEngine` is the
//! seam; `JsonPatchEngine` implements it with RFC 6902 patches.
//!
//! Array elements are matched by identity: their `id` field, else their `_id`
//! field, else the element value itself. Arrays whose elements are not unique
//! under that key are diffed by position.

use std::collections::{HashMap, HashSet};

use json_patch::{Patch, PatchOperation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::Document;

/// An opaque structural difference between two documents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff(Patch);

impl Diff {
    /// A diff that changes nothing
    pub fn empty() -> Self {
        Diff(Patch(Vec::new()))
    }

    /// Whether applying this diff would change nothing
    pub fn is_empty(&self) -> bool {
        self.0 .0.is_empty()
    }

    /// Number of operations in the diff
    pub fn len(&self) -> usize {
        self.0 .0.len()
    }

    fn operations(&self) -> &[PatchOperation] {
        &self.0 .0
    }
}

impl From<Patch> for Diff {
    fn from(patch: Patch) -> Self {
        Diff(patch)
    }
}

/// Computes and applies structural diffs
///
/// Implementations must satisfy the round-trip law: applying
/// `diff(a, b)` to `a` yields a document equal to `b`.
pub trait DiffEngine: Send + Sync + 'static {
    /// Compute the difference that turns `old` into `new`
    fn diff(&self, old: &Document, new: &Document) -> Diff;

    /// Apply a diff in place
    ///
    /// On error `doc` may be partially modified; callers apply to scratch
    /// copies when they need atomicity.
    fn apply(&self, doc: &mut Document, diff: &Diff) -> SyncResult<()>;

    /// Apply a diff computed against `base` to a document that may have
    /// drifted from it
    ///
    /// All or nothing: on error `doc` is left untouched. The default ignores
    /// `base` and applies the diff as is.
    fn merge(&self, doc: &mut Document, base: &Document, diff: &Diff) -> SyncResult<()> {
        let _ = base;
        let mut scratch = doc.clone();
        self.apply(&mut scratch, diff)?;
        *doc = scratch;
        Ok(())
    }
}

/// Diff engine backed by JSON Patch (RFC 6902)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPatchEngine;

impl DiffEngine for JsonPatchEngine {
    fn diff(&self, old: &Document, new: &Document) -> Diff {
        let mut builder = PatchBuilder::default();
        builder.diff("", old, new);

        match serde_json::from_value(Value::Array(builder.ops)) {
            Ok(patch) => Diff(patch),
            Err(e) => {
                warn!("Falling back to a positional diff: {}", e);
                Diff(json_patch::diff(old, new))
            }
        }
    }

    fn apply(&self, doc: &mut Document, diff: &Diff) -> SyncResult<()> {
        json_patch::patch(doc, diff.operations()).map_err(patch_error)
    }

    fn merge(&self, doc: &mut Document, base: &Document, diff: &Diff) -> SyncResult<()> {
        // Replay on the base alongside the target so every operation's array
        // indices can be mapped to the elements they meant
        let mut base = base.clone();
        let mut scratch = doc.clone();
        for op in diff.operations() {
            let rebased = rebase(op, &base, &scratch)?;
            json_patch::patch(&mut scratch, std::slice::from_ref(&rebased))
                .map_err(patch_error)?;
            json_patch::patch(&mut base, std::slice::from_ref(op)).map_err(patch_error)?;
        }
        *doc = scratch;
        Ok(())
    }
}

fn patch_error(e: json_patch::PatchError) -> SyncError {
    SyncError::Patch(e.to_string())
}

/// Collects RFC 6902 operations as JSON values
#[derive(Default)]
struct PatchBuilder {
    ops: Vec<Value>,
}

impl PatchBuilder {
    fn add(&mut self, path: &str, value: &Value) {
        self.ops.push(json!({"op": "add", "path": path, "value": value}));
    }

    fn remove(&mut self, path: &str) {
        self.ops.push(json!({"op": "remove", "path": path}));
    }

    fn replace(&mut self, path: &str, value: &Value) {
        self.ops.push(json!({"op": "replace", "path": path, "value": value}));
    }

    fn diff(&mut self, path: &str, old: &Value, new: &Value) {
        match (old, new) {
            (Value::Object(old), Value::Object(new)) => {
                for key in old.keys().filter(|key| !new.contains_key(*key)) {
                    self.remove(&child(path, key));
                }
                for (key, value) in new {
                    match old.get(key) {
                        Some(previous) => self.diff(&child(path, key), previous, value),
                        None => self.add(&child(path, key), value),
                    }
                }
            }
            (Value::Array(old), Value::Array(new)) => self.diff_arrays(path, old, new),
            _ if old != new => self.replace(path, new),
            _ => {}
        }
    }

    fn diff_arrays(&mut self, path: &str, old: &[Value], new: &[Value]) {
        let (Some(old_keys), Some(new_keys)) = (unique_identities(old), unique_identities(new))
        else {
            return self.diff_positional(path, old, new);
        };

        let wanted: HashSet<&str> = new_keys.iter().map(String::as_str).collect();
        let previous: HashMap<&str, &Value> =
            old_keys.iter().map(String::as_str).zip(old).collect();
        let mut current: Vec<&str> = old_keys.iter().map(String::as_str).collect();

        for index in (0..current.len()).rev() {
            if !wanted.contains(current[index]) {
                self.remove(&child(path, &index.to_string()));
                current.remove(index);
            }
        }

        // Slots before `index` already hold their final elements
        for (index, (key, value)) in new_keys.iter().zip(new).enumerate() {
            let key = key.as_str();
            let element = child(path, &index.to_string());
            if current.get(index) == Some(&key) {
                if let Some(previous) = previous.get(key) {
                    self.diff(&element, previous, value);
                }
                continue;
            }
            if let Some(from) = current.iter().position(|k| *k == key) {
                self.remove(&child(path, &from.to_string()));
                current.remove(from);
            }
            self.add(&element, value);
            current.insert(index, key);
        }
    }

    fn diff_positional(&mut self, path: &str, old: &[Value], new: &[Value]) {
        let common = old.len().min(new.len());
        for index in 0..common {
            self.diff(&child(path, &index.to_string()), &old[index], &new[index]);
        }
        for index in (common..old.len()).rev() {
            self.remove(&child(path, &index.to_string()));
        }
        for (index, value) in new.iter().enumerate().skip(common) {
            self.add(&child(path, &index.to_string()), value);
        }
    }
}

/// Key an array element is matched by
fn identity(value: &Value) -> String {
    for field in ["id", "_id"] {
        if let Some(id) = value.get(field).filter(|id| !id.is_null()) {
            return format!("#{}", id);
        }
    }
    format!("={}", value)
}

fn has_explicit_identity(value: &Value) -> bool {
    ["id", "_id"]
        .iter()
        .any(|field| value.get(*field).is_some_and(|id| !id.is_null()))
}

fn unique_identities(items: &[Value]) -> Option<Vec<String>> {
    let keys: Vec<String> = items.iter().map(identity).collect();
    let unique = keys.iter().collect::<HashSet<_>>().len() == keys.len();
    unique.then_some(keys)
}

/// Rewrite an operation's array indices from `base` positions to `doc` positions
fn rebase(op: &PatchOperation, base: &Value, doc: &Value) -> SyncResult<PatchOperation> {
    let mut value = serde_json::to_value(op)?;
    let inserts = matches!(value["op"].as_str(), Some("add" | "move" | "copy"));

    let path = value["path"].as_str().map(str::to_owned);
    if let Some(path) = path {
        let resolved = resolve(&path, base, doc, inserts).ok_or_else(|| stale(&path))?;
        value["path"] = Value::String(resolved);
    }
    let from = value.get("from").and_then(Value::as_str).map(str::to_owned);
    if let Some(from) = from {
        let resolved = resolve(&from, base, doc, false).ok_or_else(|| stale(&from))?;
        value["from"] = Value::String(resolved);
    }

    Ok(serde_json::from_value(value)?)
}

fn stale(path: &str) -> SyncError {
    SyncError::Patch(format!("{} no longer resolves", path))
}

/// Map a pointer into `base` onto the matching location in `doc`
///
/// With `inserts`, a final array index names the slot to insert into rather
/// than an existing element.
fn resolve(path: &str, base: &Value, doc: &Value, inserts: bool) -> Option<String> {
    let tokens = split_pointer(path)?;
    let last = tokens.len().saturating_sub(1);

    let mut base = Some(base);
    let mut doc = Some(doc);
    let mut resolved = String::new();
    for (depth, token) in tokens.iter().enumerate() {
        let (b, d) = (base?, doc?);
        let segment = match (b, d) {
            (Value::Array(b_items), Value::Array(d_items)) if depth == last && inserts => {
                insert_slot(token, b_items, d_items)?
            }
            (Value::Array(b_items), Value::Array(d_items)) => {
                let index: usize = token.parse().ok()?;
                let item = b_items.get(index)?;
                let position = locate(item, index, d_items)?;
                base = Some(item);
                doc = d_items.get(position);
                position.to_string()
            }
            (Value::Array(_), _) => return None,
            _ => {
                base = b.get(token.as_str());
                doc = d.get(token.as_str());
                token.clone()
            }
        };
        resolved = child(&resolved, &segment);
    }
    Some(resolved)
}

/// Position in `items` of the element matching `item`
///
/// Elements with an `id` or `_id` must be found by it. Others prefer an equal
/// value and fall back to the same index.
fn locate(item: &Value, index: usize, items: &[Value]) -> Option<usize> {
    let key = identity(item);
    if items.get(index).is_some_and(|other| identity(other) == key) {
        return Some(index);
    }
    if let Some(position) = items.iter().position(|other| identity(other) == key) {
        return Some(position);
    }
    (!has_explicit_identity(item) && index < items.len()).then_some(index)
}

fn insert_slot(token: &str, base: &[Value], doc: &[Value]) -> Option<String> {
    if token == "-" {
        return Some("-".to_string());
    }
    let index: usize = token.parse().ok()?;
    match base.get(index) {
        // In front of whatever held that slot in the base
        Some(next) => {
            let position = locate(next, index, doc).unwrap_or(index.min(doc.len()));
            Some(position.to_string())
        }
        None => Some("-".to_string()),
    }
}

fn child(path: &str, token: &str) -> String {
    format!("{}/{}", path, token.replace('~', "~0").replace('/', "~1"))
}

fn split_pointer(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return Some(Vec::new());
    }
    let rest = path.strip_prefix('/')?;
    Some(
        rest.split('/')
            .map(|token| token.replace("~1", "/").replace("~0", "~"))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_documents_give_empty_diff() {
        let engine = JsonPatchEngine;
        let diff = engine.diff(&json!({"test": true}), &json!({"test": true}));

        assert!(diff.is_empty());
        assert_eq!(diff.len(), 0);
    }

    #[test]
    fn test_removed_key_gives_non_empty_diff() {
        let engine = JsonPatchEngine;
        let diff = engine.diff(&json!({"test": true, "test2": true}), &json!({"test": true}));

        assert!(!diff.is_empty());
    }

    #[test]
    fn test_round_trip_nested_documents() {
        let engine = JsonPatchEngine;
        let cases = [
            (json!({"a": 1, "b": [{"c": 1}]}), json!({"a": 1, "b": [{"c": 2}]})),
            (json!({}), json!({"list": [1, 2, 3], "nested": {"x": null}})),
            (json!({"list": [1, 2, 3]}), json!({"list": [3]})),
            (json!([1, {"id": "x"}]), json!("replaced by a scalar")),
        ];

        for (old, new) in cases {
            let diff = engine.diff(&old, &new);
            let mut patched = old.clone();
            engine.apply(&mut patched, &diff).unwrap();
            assert_eq!(patched, new);
        }
    }

    #[test]
    fn test_apply_reports_invalid_diff() {
        let engine = JsonPatchEngine;
        let diff = engine.diff(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}}));

        let mut unrelated = json!({"x": 1});
        let err = engine.apply(&mut unrelated, &diff).unwrap_err();
        assert!(matches!(err, SyncError::Patch(_)));
    }

    #[test]
    fn test_merge_skips_entry_with_stale_operation() {
        let engine = JsonPatchEngine;
        let base = json!({"a": {"x": 1}, "b": 1});
        let diff = engine.diff(&base, &json!({"a": {"x": 2}, "b": 2}));
        assert_eq!(diff.len(), 2);

        // "a" was removed concurrently; "b" must not change either
        let mut drifted = json!({"b": 1});
        let err = engine.merge(&mut drifted, &base, &diff).unwrap_err();

        assert!(matches!(err, SyncError::Patch(_)));
        assert_eq!(drifted, json!({"b": 1}));
    }

    #[test]
    fn test_insert_into_keyed_array_is_one_operation() {
        let engine = JsonPatchEngine;
        let old = json!({"list": [{"id": 1}, {"id": 2}]});
        let new = json!({"list": [{"id": 3}, {"id": 1}, {"id": 2}]});

        let diff = engine.diff(&old, &new);
        assert_eq!(diff.len(), 1);

        let value = serde_json::to_value(&diff).unwrap();
        assert_eq!(value[0]["op"], "add");
        assert_eq!(value[0]["path"], "/list/0");
    }

    #[test]
    fn test_round_trip_reordered_arrays() {
        let engine = JsonPatchEngine;
        let cases = [
            (
                json!([{"id": 1}, {"id": 2}, {"id": 3}]),
                json!([{"id": 3}, {"id": 1, "x": 1}]),
            ),
            (json!([{"_id": "a"}, {"_id": "b"}]), json!([{"_id": "b", "n": 2}, {"_id": "c"}])),
            (json!(["a", "b", "c"]), json!(["c", "a", "d"])),
            (json!([1, 1, 2]), json!([2, 1])),
        ];

        for (old, new) in cases {
            let diff = engine.diff(&old, &new);
            let mut patched = old.clone();
            engine.apply(&mut patched, &diff).unwrap();
            assert_eq!(patched, new);
        }
    }

    #[test]
    fn test_merge_follows_element_identity() {
        let engine = JsonPatchEngine;
        let base = json!({"list": [{"id": 1, "v": 0}, {"id": 2, "v": 0}]});
        let diff = engine.diff(&base, &json!({"list": [{"id": 1, "v": 0}, {"id": 2, "v": 99}]}));

        // Someone else inserted at the front in the meantime
        let mut doc = json!({"list": [{"id": 3, "v": 0}, {"id": 1, "v": 0}, {"id": 2, "v": 0}]});
        engine.merge(&mut doc, &base, &diff).unwrap();

        assert_eq!(
            doc,
            json!({"list": [{"id": 3, "v": 0}, {"id": 1, "v": 0}, {"id": 2, "v": 99}]})
        );
    }

    #[test]
    fn test_merge_insert_lands_before_same_element() {
        let engine = JsonPatchEngine;
        let base = json!([{"id": "a"}, {"id": "b"}]);
        let diff = engine.diff(&base, &json!([{"id": "a"}, {"id": "new"}, {"id": "b"}]));

        let mut doc = json!([{"id": "z"}, {"id": "a"}, {"id": "b"}]);
        engine.merge(&mut doc, &base, &diff).unwrap();

        assert_eq!(doc, json!([{"id": "z"}, {"id": "a"}, {"id": "new"}, {"id": "b"}]));
    }

    #[test]
    fn test_merge_fails_for_removed_element() {
        let engine = JsonPatchEngine;
        let base = json!([{"id": 1, "v": 0}, {"id": 2, "v": 0}]);
        let diff = engine.diff(&base, &json!([{"id": 1, "v": 0}, {"id": 2, "v": 5}]));

        let mut doc = json!([{"id": 1, "v": 0}]);
        assert!(engine.merge(&mut doc, &base, &diff).is_err());
        assert_eq!(doc, json!([{"id": 1, "v": 0}]));
    }

    #[test]
    fn test_diff_serializes_as_patch_operations() {
        let engine = JsonPatchEngine;
        let diff = engine.diff(&json!({"a": 1}), &json!({"a": 2}));

        let value = serde_json::to_value(&diff).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["op"], "replace");
        assert_eq!(value[0]["path"], "/a");

        let decoded: Diff = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.len(), 1);
    }
}
