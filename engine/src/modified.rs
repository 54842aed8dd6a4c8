//! Date-modified stamping.
//!
//! When a table is queried by modification time, every saved item carries a
//! server timestamp under the reserved `@` key. Outgoing saves are stamped
//! with a sentinel the backend replaces with its own clock.

use crate::{change::PathType, pending::PendingSave};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Reserved key holding an item's modification timestamp.
pub const DATE_MODIFIED_KEY: &str = "@";

/// Sentinel resolved by the backend to its current time.
pub fn server_timestamp() -> Value {
    json!({".sv": "timestamp"})
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value.get(".sv").and_then(Value::as_str) == Some("timestamp")
}

/// Which items of a table carry a date-modified stamp.
///
/// Deserializes from `false`, `true`, or a map of top-level field names to
/// booleans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "QueryRepr", into = "QueryRepr")]
pub enum QueryByModified {
    #[default]
    Disabled,
    /// Every direct child of the root is an item
    All,
    /// Children of the named top-level fields are items
    Fields(BTreeSet<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum QueryRepr {
    Flag(bool),
    Fields(BTreeMap<String, bool>),
}

impl From<QueryRepr> for QueryByModified {
    fn from(repr: QueryRepr) -> Self {
        match repr {
            QueryRepr::Flag(true) => QueryByModified::All,
            QueryRepr::Flag(false) => QueryByModified::Disabled,
            QueryRepr::Fields(fields) => {
                let enabled: BTreeSet<String> = fields
                    .into_iter()
                    .filter_map(|(field, on)| on.then_some(field))
                    .collect();
                if enabled.is_empty() {
                    QueryByModified::Disabled
                } else {
                    QueryByModified::Fields(enabled)
                }
            }
        }
    }
}

impl From<QueryByModified> for QueryRepr {
    fn from(query: QueryByModified) -> Self {
        match query {
            QueryByModified::Disabled => QueryRepr::Flag(false),
            QueryByModified::All => QueryRepr::Flag(true),
            QueryByModified::Fields(fields) => {
                QueryRepr::Fields(fields.into_iter().map(|f| (f, true)).collect())
            }
        }
    }
}

impl QueryByModified {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, QueryByModified::Disabled)
    }

    /// Depth of items for a path starting with `head`, if stamped.
    fn item_depth(&self, head: Option<&String>) -> Option<usize> {
        match self {
            QueryByModified::Disabled => None,
            QueryByModified::All => Some(1),
            QueryByModified::Fields(fields) => head.filter(|h| fields.contains(*h)).map(|_| 2),
        }
    }
}

/// Stamp outgoing saves with the server-timestamp sentinel.
///
/// Saves that replace whole items get the sentinel inside their value; saves
/// inside an item get one extra save at `<item>/@`. Returns the paths of the
/// stamped items.
pub fn stamp_changes(saves: &mut Vec<PendingSave>, query: &QueryByModified) -> Vec<Vec<String>> {
    if !query.is_enabled() {
        return Vec::new();
    }
    let mut stamped = BTreeSet::new();
    let mut extra = Vec::new();
    for save in saves.iter_mut() {
        if save.path.is_empty() {
            match query {
                QueryByModified::All => stamp_nested(&mut save.value, Vec::new(), 1, &mut stamped),
                QueryByModified::Fields(fields) => {
                    if let Value::Object(map) = &mut save.value {
                        for field in fields {
                            if let Some(child) = map.get_mut(field) {
                                stamp_nested(child, vec![field.clone()], 1, &mut stamped);
                            }
                        }
                    }
                }
                QueryByModified::Disabled => {}
            }
            continue;
        }
        let Some(depth) = query.item_depth(save.path.first()) else {
            continue;
        };
        let len = save.path.len();
        if len < depth {
            let prefix = save.path.clone();
            stamp_nested(&mut save.value, prefix, depth - len, &mut stamped);
        } else if len == depth {
            if let Value::Object(map) = &mut save.value {
                map.insert(DATE_MODIFIED_KEY.to_string(), server_timestamp());
                stamped.insert(save.path.clone());
            }
        } else if save.path[depth] != DATE_MODIFIED_KEY {
            let item = save.path[..depth].to_vec();
            if stamped.insert(item.clone()) {
                let mut path = item;
                path.push(DATE_MODIFIED_KEY.to_string());
                let mut types: Vec<PathType> =
                    save.path_types.iter().take(depth).copied().collect();
                types.push(PathType::Object);
                extra.push(PendingSave::new(path, types, server_timestamp(), save.queued_at));
            }
        }
    }
    saves.extend(extra);
    stamped.into_iter().collect()
}

fn stamp_nested(
    value: &mut Value,
    prefix: Vec<String>,
    remaining: usize,
    stamped: &mut BTreeSet<Vec<String>>,
) {
    let Value::Object(map) = value else {
        return;
    };
    if remaining == 0 {
        map.insert(DATE_MODIFIED_KEY.to_string(), server_timestamp());
        stamped.insert(prefix);
        return;
    }
    for (key, child) in map.iter_mut() {
        if key == DATE_MODIFIED_KEY {
            continue;
        }
        let mut path = prefix.clone();
        path.push(key.clone());
        stamp_nested(child, path, remaining - 1, stamped);
    }
}

/// Timestamp stored directly on an item.
pub fn date_modified_of(value: &Value) -> Option<u64> {
    value.get(DATE_MODIFIED_KEY).and_then(Value::as_u64)
}

/// Largest timestamp stored anywhere in `value`.
pub fn max_date_modified(value: &Value) -> Option<u64> {
    match value {
        Value::Object(map) => {
            let own = map.get(DATE_MODIFIED_KEY).and_then(Value::as_u64);
            map.iter()
                .filter(|(key, _)| key.as_str() != DATE_MODIFIED_KEY)
                .filter_map(|(_, child)| max_date_modified(child))
                .chain(own)
                .max()
        }
        Value::Array(items) => items.iter().filter_map(max_date_modified).max(),
        _ => None,
    }
}

/// Remove every `@` key from `value`.
pub fn strip_date_modified(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(DATE_MODIFIED_KEY);
            map.values_mut().for_each(strip_date_modified);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_date_modified),
        _ => {}
    }
}

/// Remove `@` keys that still hold the server-timestamp sentinel.
pub fn strip_server_timestamps(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get(DATE_MODIFIED_KEY).is_some_and(is_server_timestamp) {
                map.remove(DATE_MODIFIED_KEY);
            }
            map.values_mut().for_each(strip_server_timestamps);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_server_timestamps),
        _ => {}
    }
}

/// Replace server-timestamp sentinels with `now`.
pub fn resolve_server_timestamps(value: &mut Value, now: u64) {
    if is_server_timestamp(value) {
        *value = json!(now);
        return;
    }
    match value {
        Value::Object(map) => map
            .values_mut()
            .for_each(|child| resolve_server_timestamps(child, now)),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|child| resolve_server_timestamps(child, now)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn save(path: &[&str], value: Value) -> PendingSave {
        let path = p(path);
        let types = vec![PathType::Object; path.len()];
        PendingSave::new(path, types, value, 0)
    }

    #[test]
    fn deserialize_forms() {
        let q: QueryByModified = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(q, QueryByModified::All);
        let q: QueryByModified = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(q, QueryByModified::Disabled);
        let q: QueryByModified =
            serde_json::from_value(json!({"todos": true, "tags": false})).unwrap();
        assert_eq!(q, QueryByModified::Fields(["todos".to_string()].into()));
    }

    #[test]
    fn whole_item_gets_inline_stamp() {
        let mut saves = vec![save(&["t1"], json!({"text": "a"}))];
        let stamped = stamp_changes(&mut saves, &QueryByModified::All);
        assert_eq!(stamped, vec![p(&["t1"])]);
        assert_eq!(saves[0].value["@"], server_timestamp());
    }

    #[test]
    fn inner_write_gets_sibling_stamp_once() {
        let mut saves = vec![
            save(&["t1", "text"], json!("a")),
            save(&["t1", "done"], json!(true)),
        ];
        let stamped = stamp_changes(&mut saves, &QueryByModified::All);
        assert_eq!(stamped, vec![p(&["t1"])]);
        assert_eq!(saves.len(), 3);
        assert_eq!(saves[2].path, p(&["t1", "@"]));
        assert!(is_server_timestamp(&saves[2].value));
    }

    #[test]
    fn fields_stamp_one_level_deeper() {
        let query = QueryByModified::Fields(["todos".to_string()].into());
        let mut saves = vec![
            save(&["todos"], json!({"a": {"x": 1}, "b": {"x": 2}})),
            save(&["settings", "theme"], json!("dark")),
        ];
        let stamped = stamp_changes(&mut saves, &query);
        assert_eq!(stamped, vec![p(&["todos", "a"]), p(&["todos", "b"])]);
        assert!(is_server_timestamp(&saves[0].value["a"]["@"]));
        assert_eq!(saves.len(), 2);
    }

    #[test]
    fn deletes_are_not_stamped() {
        let mut saves = vec![save(&["t1"], Value::Null)];
        assert!(stamp_changes(&mut saves, &QueryByModified::All).is_empty());
    }

    #[test]
    fn max_and_strip() {
        let mut value = json!({"a": {"@": 5, "x": 1}, "b": {"@": 9}, "c": [{"@": 7}]});
        assert_eq!(max_date_modified(&value), Some(9));
        strip_date_modified(&mut value);
        assert_eq!(value, json!({"a": {"x": 1}, "b": {}, "c": [{}]}));
    }

    #[test]
    fn resolve_sentinels() {
        let mut value = json!({"t1": {"@": server_timestamp(), "text": "a"}});
        resolve_server_timestamps(&mut value, 42);
        assert_eq!(value, json!({"t1": {"@": 42, "text": "a"}}));
        assert_eq!(date_modified_of(&value["t1"]), Some(42));
    }

    #[test]
    fn strip_keeps_resolved_stamps() {
        let mut value = json!({
            "a": {"@": server_timestamp(), "x": 1},
            "b": {"@": 42},
            "list": [{"@": server_timestamp()}]
        });
        strip_server_timestamps(&mut value);
        assert_eq!(value, json!({"a": {"x": 1}, "b": {"@": 42}, "list": [{}]}));
    }
}
