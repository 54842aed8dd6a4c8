//! # Tether Sync
//!
//! Local persistence and remote synchronization for Tether observables.
//!
//! A [`SyncEngine`] attaches a [`SyncSession`] to a root node. The session
//! loads the root from a [`LocalAdapter`], keeps it in sync with a
//! [`RemoteAdapter`], and saves local edits back:
//!
//! - **Local first**: every local write is persisted immediately
//! - **Debounced saves**: edits are coalesced by path and sent after a quiet
//!   period, split into bounded batches, with retries
//! - **No echo loops**: data loaded from storage or received from the remote
//!   is never saved back
//! - **Offline replay**: with [`OfflineBehavior::Retry`], unsaved edits are
//!   recorded in table metadata and resent on the next start
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use std::sync::Arc;
//! use tether_engine::Store;
//! use tether_sync::{JsonFileAdapter, MemoryBackend, RealtimeRemote, SyncEngine, SyncOptions};
//!
//! # async fn run() -> tether_sync::Result<()> {
//! let store = Store::new();
//! let engine = SyncEngine::new(store.clone());
//! let todos = store.observable(json!({}));
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let options = SyncOptions::default()
//!     .table("todos")
//!     .local_adapter(Arc::new(JsonFileAdapter::new("./data")))
//!     .remote(Arc::new(RealtimeRemote::new(backend)));
//! let state = engine.persist(&todos, options).await?;
//! assert!(state.is_loaded_local());
//!
//! todos.child("t1").set(json!({"text": "write docs"}))?;
//! engine.flush(&todos).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod file;
pub mod memory;
pub mod realtime;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod state;

pub use adapter::{
    LocalAdapter, RemoteAdapter, RemoteChange, RemoteEvent, RemoteGetParams, RemoteSetParams,
    RemoteSetResult, RemoteSink, StaticRemote,
};
pub use config::{
    Backoff, ErrorHook, OfflineBehavior, RetryConfig, SyncConfig, SyncHooks, SyncOptions,
};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use file::JsonFileAdapter;
pub use memory::MemoryLocalAdapter;
pub use realtime::{MemoryBackend, RealtimeBackend, RealtimeEvent, RealtimeRemote};
pub use scheduler::TokioScheduler;
pub use session::SyncSession;
pub use state::{SyncPhase, SyncState, SyncStatus};
