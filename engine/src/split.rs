//! Splitting oversized save batches.
//!
//! Backends cap the size of one write. A batch over the cap is broken up by
//! subtree: a change whose value alone is too large is replaced by one change
//! per child, recursively, and the resulting changes are packed greedily into
//! chunks under the cap.
//!
//! A split `Set` first writes a shell of its container: small primitive
//! children inline, empty containers in place of the rest. The shell replaces
//! whatever the backend held, so keys and array items missing from the new
//! value are removed just as an unsplit write would remove them.

use crate::change::{Change, ChangeMode, PathType};
use serde_json::{Map, Value};

/// Serialized size of a change's path and value.
pub fn change_size(change: &Change) -> usize {
    let path: usize = change.path.iter().map(|key| key.len() + 1).sum();
    path + serde_json::to_vec(&change.value_at_path).map_or(0, |bytes| bytes.len())
}

/// Split `changes` into chunks whose total size stays under `max_bytes`.
///
/// Applied in order, the chunks leave the same value as the input. A single
/// primitive larger than the cap gets a chunk of its own.
pub fn split_changes(changes: Vec<Change>, max_bytes: usize) -> Vec<Vec<Change>> {
    let mut exploded = Vec::with_capacity(changes.len());
    for change in changes {
        explode(change, max_bytes, &mut exploded);
    }

    let mut chunks: Vec<Vec<Change>> = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0;
    for (change, size) in exploded {
        if !current.is_empty() && current_size + size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        if size > max_bytes {
            tracing::warn!(
                path = %change.path.join("/"),
                size,
                max_bytes,
                "value exceeds save size limit and cannot be split further"
            );
        }
        current_size += size;
        current.push(change);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn json_len(value: &Value) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}

fn empty_like(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(Value::Object(Map::new())),
        Value::Array(_) => Some(Value::Array(Vec::new())),
        _ => None,
    }
}

fn explode(change: Change, max_bytes: usize, out: &mut Vec<(Change, usize)>) {
    let size = change_size(&change);
    if size <= max_bytes {
        out.push((change, size));
        return;
    }
    let (children, kind): (Vec<(String, Value)>, PathType) = match &change.value_at_path {
        Value::Object(map) if !map.is_empty() => (
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            PathType::Object,
        ),
        Value::Array(items) if !items.is_empty() => (
            items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
            PathType::Array,
        ),
        _ => {
            out.push((change, size));
            return;
        }
    };

    let rest = if change.mode == ChangeMode::Set {
        let (shell, rest) = shell(&change, children, kind, max_bytes);
        let shell_size = change_size(&shell);
        out.push((shell, shell_size));
        rest
    } else {
        children
    };

    for (key, value) in rest {
        let prev = crate::value::child(&change.prev_at_path, &key)
            .cloned()
            .unwrap_or(Value::Null);
        let mut path = change.path.clone();
        path.push(key);
        let mut path_types = change.path_types.clone();
        path_types.push(kind);
        let child = Change {
            path,
            path_types,
            value_at_path: value,
            prev_at_path: prev,
            mode: change.mode,
            origin: change.origin,
        };
        explode(child, max_bytes, out);
    }
}

/// Build the container write that precedes a split `Set`, returning it with
/// the children still to be written.
fn shell(
    change: &Change,
    children: Vec<(String, Value)>,
    kind: PathType,
    max_bytes: usize,
) -> (Change, Vec<(String, Value)>) {
    let path_size: usize = change.path.iter().map(|key| key.len() + 1).sum();
    let mut used = path_size + 2;
    let mut object = Map::new();
    let mut items = Vec::new();
    let mut rest = Vec::new();
    for (key, value) in children {
        let (inline, pending) = match empty_like(&value) {
            Some(empty) => (empty, true),
            None => {
                let entry = json_len(&value) + key.len() + 4;
                if used + entry <= max_bytes {
                    used += entry;
                    (value.clone(), false)
                } else {
                    (Value::Null, true)
                }
            }
        };
        match kind {
            PathType::Object if !inline.is_null() => {
                object.insert(key.clone(), inline);
            }
            PathType::Object => {}
            PathType::Array => items.push(inline),
        }
        if pending {
            rest.push((key, value));
        }
    }
    let value = match kind {
        PathType::Object => Value::Object(object),
        PathType::Array => Value::Array(items),
    };
    let shell = Change {
        path: change.path.clone(),
        path_types: change.path_types.clone(),
        value_at_path: value,
        prev_at_path: change.prev_at_path.clone(),
        mode: ChangeMode::Set,
        origin: change.origin,
    };
    (shell, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value, ChangeMode, Origin};
    use serde_json::json;

    fn change(path: &[&str], value: Value) -> Change {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let types = vec![PathType::Object; path.len()];
        Change::at(path, types, value, ChangeMode::Set, Origin::Local)
    }

    /// Write every change of `chunks`, in order, over `base`.
    fn apply(base: &Value, chunks: &[Vec<Change>]) -> Value {
        let mut out = base.clone();
        for change in chunks.iter().flatten() {
            value::set_at(
                &mut out,
                &change.path,
                Some(&change.path_types),
                change.value_at_path.clone(),
            );
        }
        out
    }

    #[test]
    fn small_batch_is_one_chunk() {
        let chunks = split_changes(vec![change(&["a"], json!(1)), change(&["b"], json!(2))], 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2);
    }

    #[test]
    fn oversized_object_is_split_by_child() {
        let big = json!({
            "x": "a".repeat(40),
            "y": "b".repeat(40),
            "z": "c".repeat(40),
        });
        let input = vec![change(&["doc"], big)];
        let chunks = split_changes(input.clone(), 64);

        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.iter().map(change_size).sum::<usize>() <= 64);
        }
        assert_eq!(chunks[0][0].path, vec!["doc"]);
        assert_eq!(chunks[1][0].path, vec!["doc", "y"]);
        assert_eq!(apply(&Value::Null, &chunks), apply(&Value::Null, &[input]));
    }

    #[test]
    fn split_set_still_replaces() {
        let before = json!({"doc": {"old": 1, "x": "stale"}, "list": [1, 2, 3, 4]});
        let input = vec![
            change(&["doc"], json!({"x": "a".repeat(40), "y": "b".repeat(40)})),
            change(&["list"], json!(["c".repeat(40)])),
        ];
        let chunks = split_changes(input.clone(), 48);
        assert!(chunks.len() > 2);

        let after = apply(&before, &chunks);
        assert_eq!(after, apply(&before, &[input]));
        assert!(after["doc"].get("old").is_none());
        assert_eq!(after["list"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn arrays_split_with_array_path_types() {
        let input = vec![change(&["list"], json!(["a".repeat(30), "b".repeat(30)]))];
        let chunks = split_changes(input, 40);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0][0].value_at_path, json!([null, null]));
        assert_eq!(chunks[2][0].path, vec!["list", "1"]);
        assert_eq!(chunks[2][0].path_types, vec![PathType::Object, PathType::Array]);
    }

    #[test]
    fn unsplittable_leaf_gets_own_chunk() {
        let input = vec![
            change(&["small"], json!(1)),
            change(&["huge"], json!("z".repeat(200))),
            change(&["tail"], json!(2)),
        ];
        let chunks = split_changes(input, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1][0].path, vec!["huge"]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                any::<i32>().prop_map(|n| json!(n)),
                "[a-z]{0,24}".prop_map(Value::String),
                Just(json!({})),
            ];
            leaf.prop_recursive(3, 32, 6, |inner| {
                prop_oneof![
                    proptest::collection::btree_map("[a-d]{1,3}", inner.clone(), 1..5)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                    proptest::collection::vec(inner, 1..4).prop_map(Value::Array),
                ]
            })
        }

        proptest! {
            #[test]
            fn chunks_write_the_same_value(
                value in arb_value(),
                prior in arb_value(),
                max in 16usize..256,
            ) {
                let base = json!({"root": prior});
                let input = vec![change(&["root"], value)];
                let chunks = split_changes(input.clone(), max);
                prop_assert_eq!(apply(&base, &chunks), apply(&base, &[input]));
                for chunk in &chunks {
                    let size: usize = chunk.iter().map(change_size).sum();
                    prop_assert!(size <= max || chunk.len() == 1);
                }
            }
        }
    }
}
