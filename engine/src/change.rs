//! Change events delivered to listeners.

use crate::value;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Origin of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written by local code
    #[default]
    Local,
    /// Received from a remote backend
    Remote,
    /// Loaded from local persistence
    Storage,
}

/// How a change was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeMode {
    /// The whole value was replaced
    #[default]
    Set,
    /// Shallow merge of an object's keys
    Assign,
    /// Deep merge into the existing value
    Merge,
    /// The key was removed from its parent
    Delete,
    /// Only the date-modified stamp changed
    DateModified,
}

/// Container kind a path segment indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    Object,
    Array,
}

/// One mutation, relative to the node a listener is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Keys from the listening node down to the mutated location
    pub path: Vec<String>,
    /// Container kind of each segment in `path`
    pub path_types: Vec<PathType>,
    /// New value at the end of `path`
    pub value_at_path: Value,
    /// Previous value at the end of `path`
    pub prev_at_path: Value,
    pub mode: ChangeMode,
    pub origin: Origin,
}

impl Change {
    /// Create a change at the listening node itself.
    pub fn new(value_at_path: Value, prev_at_path: Value, mode: ChangeMode, origin: Origin) -> Self {
        Self {
            path: Vec::new(),
            path_types: Vec::new(),
            value_at_path,
            prev_at_path,
            mode,
            origin,
        }
    }

    /// Create a change at an explicit path.
    pub fn at(
        path: Vec<String>,
        path_types: Vec<PathType>,
        value_at_path: Value,
        mode: ChangeMode,
        origin: Origin,
    ) -> Self {
        Self {
            path,
            path_types,
            value_at_path,
            prev_at_path: Value::Null,
            mode,
            origin,
        }
    }

    /// The same change seen from the parent, one key further away.
    pub fn prefixed(&self, key: &str, path_type: PathType) -> Self {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.push(key.to_string());
        path.extend(self.path.iter().cloned());

        let mut path_types = Vec::with_capacity(self.path_types.len() + 1);
        path_types.push(path_type);
        path_types.extend(self.path_types.iter().copied());

        Self {
            path,
            path_types,
            value_at_path: self.value_at_path.clone(),
            prev_at_path: self.prev_at_path.clone(),
            mode: self.mode,
            origin: self.origin,
        }
    }

    /// Replay this change onto `target`, writing `value_at_path`.
    pub fn apply_to(&self, target: &mut Value) {
        value::set_at(
            target,
            &self.path,
            Some(&self.path_types),
            self.value_at_path.clone(),
        );
    }

    /// Undo this change on `target`, writing `prev_at_path`.
    pub fn revert_on(&self, target: &mut Value) {
        value::set_at(
            target,
            &self.path,
            Some(&self.path_types),
            self.prev_at_path.clone(),
        );
    }
}

/// Arguments passed to a change listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerParams {
    /// Current value of the node the listener is attached to
    pub value: Value,
    /// Every distinct path mutated since the last delivery, in order
    pub changes: Vec<Change>,
    /// Shared origin of all changes, or `Local` when they are mixed
    pub origin: Origin,
}

impl ListenerParams {
    pub(crate) fn new(value: Value, changes: Vec<Change>) -> Self {
        let origin = match changes.first() {
            Some(first) if changes.iter().all(|c| c.origin == first.origin) => first.origin,
            _ => Origin::Local,
        };
        Self {
            value,
            changes,
            origin,
        }
    }

    /// Value of the node before the delivered changes.
    ///
    /// Reconstructed by reverting the changes, newest first, on a copy of
    /// the current value.
    pub fn previous(&self) -> Value {
        let mut value = self.value.clone();
        for change in self.changes.iter().rev() {
            change.revert_on(&mut value);
        }
        value
    }

    /// Changes that carry the given origin.
    pub fn changes_from(&self, origin: Origin) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.origin == origin)
    }
}
