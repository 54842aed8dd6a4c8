//! Observable sync status.
//!
//! Each session publishes its progress on a separate root of the same
//! store, so UI code can listen to it like any other node.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_engine::{Node, Store};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    #[default]
    Idle,
    LoadingLocal,
    LoadedLocal,
    LoadingRemote,
    LoadedRemote,
    /// Loading is done; saves are allowed
    Ready,
    Saving,
    /// The remote listen gave up
    Failed,
    Disposed,
}

/// Snapshot of a [`SyncState`] node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_loaded_local: bool,
    pub is_loaded_remote: bool,
    /// Saves handed to the remote and not yet confirmed
    pub num_pending_saves: usize,
    pub last_sync: Option<u64>,
    pub error: Option<String>,
}

/// Handle to the status node of one synced root.
#[derive(Debug, Clone)]
pub struct SyncState {
    node: Node,
}

impl SyncState {
    pub(crate) fn new(store: &Store) -> Self {
        let initial = serde_json::to_value(SyncStatus::default()).unwrap_or_else(|_| json!({}));
        Self {
            node: store.observable(initial),
        }
    }

    /// The status node, for listening.
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn status(&self) -> SyncStatus {
        serde_json::from_value(self.node.peek()).unwrap_or_default()
    }

    pub fn phase(&self) -> SyncPhase {
        self.status().phase
    }

    pub fn is_loaded_local(&self) -> bool {
        self.node.child("isLoadedLocal").peek() == Value::Bool(true)
    }

    pub fn is_loaded_remote(&self) -> bool {
        self.node.child("isLoadedRemote").peek() == Value::Bool(true)
    }

    pub fn num_pending_saves(&self) -> usize {
        self.status().num_pending_saves
    }

    pub fn last_sync(&self) -> Option<u64> {
        self.node.child("lastSync").peek().as_u64()
    }

    pub fn error(&self) -> Option<String> {
        self.node.child("error").peek().as_str().map(str::to_string)
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.write("phase", serde_json::to_value(phase).unwrap_or(Value::Null));
    }

    pub(crate) fn set_loaded_local(&self) {
        self.write("isLoadedLocal", Value::Bool(true));
    }

    pub(crate) fn set_loaded_remote(&self) {
        self.write("isLoadedRemote", Value::Bool(true));
    }

    pub(crate) fn set_last_sync(&self, millis: Option<u64>) {
        if let Some(millis) = millis {
            self.write("lastSync", json!(millis));
        }
    }

    pub(crate) fn set_error(&self, error: Option<String>) {
        self.write("error", error.map(Value::String).unwrap_or(Value::Null));
    }

    /// Adjust the in-flight save count and the phase that goes with it.
    pub(crate) fn saving(&self, delta: isize) {
        let store = self.node.store().clone();
        store.batch_with(|| {
            let count = self.num_pending_saves().saturating_add_signed(delta);
            self.write("numPendingSaves", json!(count));
            let phase = self.phase();
            if count > 0 {
                self.set_phase(SyncPhase::Saving);
            } else if phase == SyncPhase::Saving {
                self.set_phase(SyncPhase::Ready);
            }
        });
    }

    fn write(&self, key: &str, value: Value) {
        if let Err(err) = self.node.child(key).set(value) {
            tracing::debug!(%err, key, "sync state update skipped");
        }
    }
}
