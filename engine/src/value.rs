//! Path helpers over [`serde_json::Value`].
//!
//! Every node in the graph reads through its root's backing value plus the
//! path of keys from the root. Array positions are stored as decimal strings
//! so one path type serves both objects and arrays.

use crate::change::PathType;
use serde_json::{Map, Value};

/// Look up the direct child of a container by key.
pub fn child<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Look up the value at `path`, if every segment resolves.
pub fn get_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, key| child(current, key))
}

/// Clone the value at `path`, treating anything unreachable as `Null`.
pub fn value_at(root: &Value, path: &[String]) -> Value {
    get_at(root, path).cloned().unwrap_or(Value::Null)
}

/// Whether a write at `path` can reach its target.
///
/// A write is blocked by an ancestor holding a primitive, or by an array
/// position past the end; missing or `Null` ancestors are created on the
/// way down.
pub fn can_write(root: &Value, path: &[String]) -> bool {
    let mut current = root;
    for key in path {
        match current {
            Value::Null => return true,
            Value::Object(_) => match child(current, key) {
                Some(next) => current = next,
                None => return true,
            },
            Value::Array(items) => match key.parse::<usize>() {
                Ok(index) if index < items.len() => current = &items[index],
                Ok(index) => return index == items.len(),
                Err(_) => return false,
            },
            _ => return false,
        }
    }
    true
}

/// Container kind of each path segment's parent.
///
/// Segments below the reachable part of the value default to
/// [`PathType::Object`].
pub fn path_types(root: &Value, path: &[String]) -> Vec<PathType> {
    let mut types = Vec::with_capacity(path.len());
    let mut current = Some(root);
    for key in path {
        let kind = match current {
            Some(Value::Array(_)) => PathType::Array,
            _ => PathType::Object,
        };
        types.push(kind);
        current = current.and_then(|v| child(v, key));
    }
    types
}

/// Mutable access to the slot at `path`, creating intermediate containers.
///
/// `types` chooses the container created for a missing segment; without it
/// objects are created. Arrays grow by at most one slot at the end. Returns
/// `None` when a primitive or an out-of-range position blocks the path.
pub fn slot_mut<'a>(
    root: &'a mut Value,
    path: &[String],
    types: Option<&[PathType]>,
) -> Option<&'a mut Value> {
    let mut current = root;
    for (depth, key) in path.iter().enumerate() {
        if current.is_null() {
            *current = match types.and_then(|t| t.get(depth)) {
                Some(PathType::Array) => Value::Array(Vec::new()),
                _ => Value::Object(Map::new()),
            };
        }
        current = match current {
            Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let index = key.parse::<usize>().ok()?;
                if index == items.len() {
                    items.push(Value::Null);
                }
                items.get_mut(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Remove the value at `path` from its parent container.
///
/// Removing the root replaces it with `Null`.
pub fn remove_at(root: &mut Value, path: &[String]) -> Option<Value> {
    let Some((last, parent_path)) = path.split_last() else {
        return Some(std::mem::take(root));
    };
    let mut parent = root;
    for key in parent_path {
        parent = match parent {
            Value::Object(map) => map.get_mut(key)?,
            Value::Array(items) => items.get_mut(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match parent {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Write `value` at `path`.
///
/// `Null` removes an object key instead; array slots keep their position and
/// hold `Null`.
pub fn set_at(root: &mut Value, path: &[String], types: Option<&[PathType]>, value: Value) {
    if let Some((_, parent)) = path.split_last() {
        if value.is_null() && !matches!(get_at(root, parent), Some(Value::Array(_))) {
            remove_at(root, path);
            return;
        }
    }
    if let Some(slot) = slot_mut(root, path, types) {
        *slot = value;
    }
}

/// Deep-merge `source` into `target`.
///
/// Objects merge key by key; any other value replaces the target.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Flatten a value into `(path, leaf)` pairs.
///
/// Empty containers count as leaves so that flattening never loses a key.
pub fn leaves(value: &Value, prefix: &[String]) -> Vec<(Vec<String>, Value)> {
    let mut out = Vec::new();
    collect_leaves(value, prefix.to_vec(), &mut out);
    out
}

fn collect_leaves(value: &Value, path: Vec<String>, out: &mut Vec<(Vec<String>, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let mut next = path.clone();
                next.push(key.clone());
                collect_leaves(child, next, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                let mut next = path.clone();
                next.push(index.to_string());
                collect_leaves(child, next, out);
            }
        }
        _ => out.push((path, value.clone())),
    }
}

/// Whether `prefix` is a (non-strict) prefix of `path`.
pub fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_nested_values() {
        let root = json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(get_at(&root, &p(&["a", "b", "0"])), Some(&json!(10)));
        assert_eq!(get_at(&root, &p(&["a", "b", "1", "c"])), Some(&json!(true)));
        assert_eq!(get_at(&root, &p(&["a", "x"])), None);
        assert_eq!(value_at(&root, &p(&["missing"])), Value::Null);
    }

    #[test]
    fn slot_creates_intermediates() {
        let mut root = Value::Null;
        *slot_mut(&mut root, &p(&["a", "b"]), None).unwrap() = json!(1);
        assert_eq!(root, json!({"a": {"b": 1}}));

        let mut root = json!({});
        let types = [PathType::Object, PathType::Array];
        *slot_mut(&mut root, &p(&["list", "0"]), Some(&types)).unwrap() = json!("x");
        *slot_mut(&mut root, &p(&["list", "1"]), Some(&types)).unwrap() = json!("y");
        assert_eq!(root, json!({"list": ["x", "y"]}));
    }

    #[test]
    fn array_positions_past_the_end_are_unreachable() {
        let mut root = json!({"list": [1]});
        assert!(!can_write(&root, &p(&["list", "5"])));
        assert!(!can_write(&root, &p(&["list", &usize::MAX.to_string()])));
        assert!(slot_mut(&mut root, &p(&["list", "5"]), None).is_none());
        assert!(slot_mut(&mut root, &p(&["list", &usize::MAX.to_string()]), None).is_none());
        assert_eq!(root, json!({"list": [1]}));
    }

    #[test]
    fn primitive_blocks_write() {
        let mut root = json!({"a": 5});
        assert!(!can_write(&root, &p(&["a", "b"])));
        assert!(slot_mut(&mut root, &p(&["a", "b"]), None).is_none());
        assert!(can_write(&root, &p(&["z", "y"])));
    }

    #[test]
    fn remove_from_object_and_array() {
        let mut root = json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]});
        assert_eq!(remove_at(&mut root, &p(&["a", "b"])), Some(json!(1)));
        assert_eq!(remove_at(&mut root, &p(&["list", "0"])), Some(json!(1)));
        assert_eq!(root, json!({"a": {"c": 2}, "list": [2, 3]}));
        assert_eq!(remove_at(&mut root, &p(&["nope", "x"])), None);
    }

    #[test]
    fn null_removes_keys_but_not_array_slots() {
        let mut root = json!({"a": 1, "list": [1, 2]});
        set_at(&mut root, &p(&["a"]), None, Value::Null);
        set_at(&mut root, &p(&["list", "0"]), None, Value::Null);
        assert_eq!(root, json!({"list": [null, 2]}));
    }

    #[test]
    fn path_types_follow_containers() {
        let root = json!({"items": [{"tags": {}}]});
        assert_eq!(
            path_types(&root, &p(&["items", "0", "tags"])),
            vec![PathType::Object, PathType::Array, PathType::Object]
        );
    }

    #[test]
    fn deep_merge_preserves_siblings() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "keep": true});
        deep_merge(&mut target, json!({"a": {"y": 3}, "new": [1]}));
        assert_eq!(target, json!({"a": {"x": 1, "y": 3}, "keep": true, "new": [1]}));
    }

    #[test]
    fn leaves_include_empty_containers() {
        let value = json!({"a": {"b": 1}, "c": [], "d": {}});
        let mut flat = leaves(&value, &[]);
        flat.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            flat,
            vec![
                (p(&["a", "b"]), json!(1)),
                (p(&["c"]), json!([])),
                (p(&["d"]), json!({})),
            ]
        );
    }
}
