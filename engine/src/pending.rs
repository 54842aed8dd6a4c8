//! Pending-save tree.
//!
//! Local writes to a synced root accumulate here, keyed by path, until the
//! saver flushes them. A write below an already pending path folds into that
//! entry; a write above pending paths replaces them. The tree therefore never
//! holds two entries where one path is a prefix of the other.

use crate::{change::PathType, value};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One value waiting to be saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSave {
    /// Keys from the root to the saved value
    pub path: Vec<String>,
    pub path_types: Vec<PathType>,
    /// Value to write; `Null` deletes
    pub value: Value,
    /// Local time (ms) of the most recent write folded into this entry
    pub queued_at: u64,
}

impl PendingSave {
    pub fn new(path: Vec<String>, path_types: Vec<PathType>, value: Value, queued_at: u64) -> Self {
        Self {
            path,
            path_types,
            value,
            queued_at,
        }
    }
}

/// Coalesced set of pending saves for one root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTree {
    entries: BTreeMap<Vec<String>, PendingSave>,
}

impl PendingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingSave> {
        self.entries.values()
    }

    pub fn get(&self, path: &[String]) -> Option<&PendingSave> {
        self.entries.get(path)
    }

    /// Queue a save, coalescing with overlapping entries.
    pub fn insert(&mut self, save: PendingSave) {
        if let Some(ancestor) = self.ancestor_mut(&save.path) {
            let relative = &save.path[ancestor.path.len()..];
            let types = &save.path_types[ancestor.path.len().min(save.path_types.len())..];
            value::set_at(&mut ancestor.value, relative, Some(types), save.value);
            ancestor.queued_at = ancestor.queued_at.max(save.queued_at);
            return;
        }
        self.entries
            .retain(|path, _| !value::is_prefix(&save.path, path));
        self.entries.insert(save.path.clone(), save);
    }

    /// Remove and return every entry, in path order.
    pub fn take_all(&mut self) -> Vec<PendingSave> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn remove(&mut self, path: &[String]) -> Option<PendingSave> {
        self.entries.remove(path)
    }

    /// Record that `value` is now saved at `path`.
    ///
    /// Entries at or below `path` are dropped. An entry above it keeps the
    /// confirmed value, so resending that entry cannot roll the path back.
    /// Returns whether the tree changed.
    pub fn confirm(&mut self, path: &[String], confirmed: &Value) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p, _| !value::is_prefix(path, p));
        let mut changed = self.entries.len() != before;
        if let Some(ancestor) = self.ancestor_mut(path) {
            let relative = &path[ancestor.path.len()..];
            if value::value_at(&ancestor.value, relative) != *confirmed {
                value::set_at(&mut ancestor.value, relative, None, confirmed.clone());
                changed = true;
            }
        }
        changed
    }

    /// Write every pending value over `base`. Used when loading persisted
    /// state, where unsaved local edits take precedence.
    pub fn overlay(&self, base: &mut Value) {
        for save in self.entries.values() {
            value::set_at(base, &save.path, Some(&save.path_types), save.value.clone());
        }
    }

    /// Reconcile an incoming remote value at `path` with pending local saves.
    ///
    /// For every overlapping pending entry, the local value wins when the
    /// remote change carries a `date_modified` no newer than the entry's
    /// `queued_at`; it is then written into `incoming`. Otherwise the remote
    /// value wins and the pending entry is dropped, or updated where the
    /// entry covers more than the incoming path.
    ///
    /// Returns the number of leaves the local side won.
    pub fn resolve_incoming(
        &mut self,
        path: &[String],
        incoming: &mut Value,
        date_modified: Option<u64>,
    ) -> usize {
        let local_wins = |save: &PendingSave| date_modified.is_some_and(|dm| dm <= save.queued_at);
        let mut kept = 0;

        // Pending entries at or below the incoming path.
        let below: Vec<Vec<String>> = self
            .entries
            .keys()
            .filter(|p| value::is_prefix(path, p))
            .cloned()
            .collect();
        for key in below {
            let Some(save) = self.entries.get(&key) else {
                continue;
            };
            if local_wins(save) {
                let relative = &save.path[path.len()..];
                let types = &save.path_types[path.len().min(save.path_types.len())..];
                value::set_at(incoming, relative, Some(types), save.value.clone());
                kept += 1;
            } else {
                self.entries.remove(&key);
            }
        }

        // A pending entry strictly above the incoming path.
        if let Some(ancestor) = self.ancestor_mut(path) {
            let relative = &path[ancestor.path.len()..];
            if local_wins(ancestor) {
                *incoming = value::value_at(&ancestor.value, relative);
                kept += 1;
            } else {
                value::set_at(&mut ancestor.value, relative, None, incoming.clone());
            }
        }
        kept
    }

    fn ancestor_mut(&mut self, path: &[String]) -> Option<&mut PendingSave> {
        let key = self
            .entries
            .keys()
            .find(|p| p.len() < path.len() && value::is_prefix(p, path))
            .cloned()?;
        self.entries.get_mut(&key)
    }
}

impl FromIterator<PendingSave> for PendingTree {
    fn from_iter<I: IntoIterator<Item = PendingSave>>(iter: I) -> Self {
        let mut tree = PendingTree::new();
        for save in iter {
            tree.insert(save);
        }
        tree
    }
}
