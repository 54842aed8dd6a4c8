//! Storage and backend abstractions.
//!
//! A [`LocalAdapter`] persists tables on this device. A [`RemoteAdapter`]
//! talks to a backend: it streams remote changes into a [`RemoteSink`] and
//! accepts batches of local changes.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use tether_engine::{Change, ChangeMode, TableMetadata, Watermark};
use tokio::sync::mpsc;

/// Persistent storage for tables on this device.
///
/// Tables are read into memory by [`load_table`](Self::load_table); after
/// that [`get_table`](Self::get_table) and [`get_metadata`](Self::get_metadata)
/// are synchronous.
#[async_trait]
pub trait LocalAdapter: Send + Sync + 'static {
    /// One-time setup, such as opening a database. Called once per adapter
    /// instance, however many roots use it.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Make `table` and its metadata available to the synchronous getters.
    async fn load_table(&self, _table: &str) -> Result<()> {
        Ok(())
    }

    fn get_table(&self, table: &str) -> Option<Value>;

    fn get_metadata(&self, table: &str) -> TableMetadata;

    /// Apply changes, with paths relative to the table root.
    async fn set(&self, table: &str, changes: &[Change]) -> Result<()>;

    async fn set_metadata(&self, table: &str, metadata: &TableMetadata) -> Result<()>;

    async fn delete_table(&self, table: &str) -> Result<()>;

    async fn delete_metadata(&self, table: &str) -> Result<()>;
}

/// Apply a list of changes to an in-memory table value.
pub(crate) fn apply_changes(table: &mut Value, changes: &[Change]) {
    for change in changes {
        match change.mode {
            ChangeMode::Delete => {
                tether_engine::value::remove_at(table, &change.path);
            }
            _ => change.apply_to(table),
        }
    }
}

/// A change received from the backend, in stored shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Path from the table root
    pub path: Vec<String>,
    pub value: Value,
    /// [`ChangeMode::Set`], [`ChangeMode::Merge`] or [`ChangeMode::Delete`]
    pub mode: ChangeMode,
    /// Server timestamp of the change, if the backend reports one
    pub date_modified: Option<u64>,
}

impl RemoteChange {
    pub fn set(path: Vec<String>, value: Value) -> Self {
        Self {
            path,
            value,
            mode: ChangeMode::Set,
            date_modified: None,
        }
    }

    pub fn merge(path: Vec<String>, value: Value) -> Self {
        Self {
            mode: ChangeMode::Merge,
            ..Self::set(path, value)
        }
    }

    pub fn delete(path: Vec<String>) -> Self {
        Self {
            mode: ChangeMode::Delete,
            ..Self::set(path, Value::Null)
        }
    }

    pub fn modified_at(mut self, millis: u64) -> Self {
        self.date_modified = Some(millis);
        self
    }
}

/// Event delivered through a [`RemoteSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Change(RemoteChange),
    /// The initial load is complete
    Loaded,
    /// The subscription broke and must be re-established
    Error(String),
}

/// Where a remote adapter delivers what it receives.
///
/// Events are applied in the order they are sent. Dropping every clone of
/// the sink ends the subscription.
#[derive(Debug, Clone)]
pub struct RemoteSink {
    tx: mpsc::UnboundedSender<RemoteEvent>,
}

impl RemoteSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RemoteEvent>) -> Self {
        Self { tx }
    }

    /// Deliver a change. Returns `false` once the session has stopped.
    pub fn change(&self, change: RemoteChange) -> bool {
        self.tx.send(RemoteEvent::Change(change)).is_ok()
    }

    pub fn loaded(&self) -> bool {
        self.tx.send(RemoteEvent::Loaded).is_ok()
    }

    pub fn error(&self, err: impl std::fmt::Display) -> bool {
        self.tx.send(RemoteEvent::Error(err.to_string())).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Arguments to [`RemoteAdapter::get`].
#[derive(Debug, Clone)]
pub struct RemoteGetParams {
    /// Only changes newer than this are needed
    pub last_sync: Watermark,
    pub sink: RemoteSink,
}

/// Arguments to [`RemoteAdapter::set`].
#[derive(Debug, Clone)]
pub struct RemoteSetParams {
    /// Changes in stored shape, paths from the table root
    pub changes: Vec<Change>,
    /// The whole table in stored shape
    pub value: Value,
}

/// What the backend reports after a save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSetResult {
    /// Server timestamp assigned to the save
    pub date_modified: Option<u64>,
    /// Values to merge back into the table, in stored shape
    pub changes: Option<Value>,
}

/// A backend the root is kept in sync with.
#[async_trait]
pub trait RemoteAdapter: Send + Sync + 'static {
    /// Start delivering remote data into `params.sink`.
    ///
    /// Returns once the subscription is established; the adapter may keep
    /// a clone of the sink and deliver changes for as long as it likes. An
    /// error is retried with backoff.
    async fn get(&self, params: RemoteGetParams) -> Result<()>;

    /// Save one batch of changes.
    async fn set(&self, params: RemoteSetParams) -> Result<RemoteSetResult>;
}

/// A remote adapter backed by a fixed value, delivered once.
///
/// Saves are accepted and discarded. Useful for seeding a root from data
/// fetched elsewhere.
#[derive(Debug, Clone, Default)]
pub struct StaticRemote {
    value: Value,
}

impl StaticRemote {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl RemoteAdapter for StaticRemote {
    async fn get(&self, params: RemoteGetParams) -> Result<()> {
        if !params.sink.change(RemoteChange::merge(Vec::new(), self.value.clone())) {
            return Err(SyncError::Closed);
        }
        params.sink.loaded();
        Ok(())
    }

    async fn set(&self, _params: RemoteSetParams) -> Result<RemoteSetResult> {
        Ok(RemoteSetResult::default())
    }
}
