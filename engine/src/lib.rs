//! # Tether Engine
//!
//! An observable state graph with fine-grained change tracking.
//!
//! This crate holds the synchronous core of Tether: a tree of JSON values
//! addressed through node handles, dependency tracking for derived values,
//! batched change notification, and the pure building blocks of the sync
//! protocol (pending-save coalescing, batch splitting, date-modified
//! stamping, field transformation).
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, network, or an async runtime
//! - **Deterministic delivery**: each listener is called once per batch with
//!   every change it saw, in order
//! - **Lazy**: nodes are materialized on first access, computeds on first read
//! - **Thread-safe**: a [`Store`] is `Send + Sync` and never holds its lock
//!   while running user code
//!
//! ## Core Concepts
//!
//! ### Nodes
//!
//! A [`Store`] owns any number of roots created with [`Store::observable`].
//! [`Node::child`] navigates by key; the same path always yields the same
//! node. Reads go through [`Node::get`] (tracked) or [`Node::peek`]
//! (untracked); writes through [`Node::set`] and friends.
//!
//! ### Changes
//!
//! Listeners registered with [`Node::on_change`] receive [`ListenerParams`]:
//! the node's current value and the list of [`Change`]s relative to it. Each
//! change carries an [`Origin`] so sync code can tell local edits from data
//! that arrived from storage or a remote backend.
//!
//! ### Batches
//!
//! Writes inside [`Store::batch`] are delivered when the outermost batch
//! closes. Outside a batch every write is delivered immediately.
//!
//! ### Derived values
//!
//! - [`Store::computed`] caches a value derived from other nodes
//! - [`Store::observe`] re-runs an effect when what it read changes
//! - [`Store::linked`] defers to an [`Activator`] on first access
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::Store;
//! use serde_json::json;
//! use std::sync::{Arc, Mutex};
//!
//! let store = Store::new();
//! let state = store.observable(json!({"todos": {}, "filter": "all"}));
//!
//! // Derived count of todos
//! let todos = state.child("todos");
//! let count = {
//!     let todos = todos.clone();
//!     store.computed(move || json!(todos.get().as_object().map_or(0, |m| m.len())))
//! };
//!
//! // Listen for changes
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _sub = count.on_change(move |params| sink.lock().unwrap().push(params.value.clone()));
//!
//! // Two writes, one notification
//! store.batch_with(|| {
//!     todos.child("t1").set(json!({"text": "write docs"})).unwrap();
//!     todos.child("t2").set(json!({"text": "ship"})).unwrap();
//! });
//!
//! assert_eq!(count.get(), json!(2));
//! assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
//! ```

pub mod batch;
pub mod change;
pub mod clock;
pub mod computed;
pub mod error;
pub mod linked;
pub mod metadata;
pub mod modified;
pub mod node;
pub mod pending;
pub mod split;
pub mod store;
pub mod tracking;
pub mod transform;
pub mod value;

// Re-export main types at crate root
pub use batch::{BatchScope, Scheduler};
pub use change::{Change, ChangeMode, ListenerParams, Origin, PathType};
pub use clock::Watermark;
pub use error::{Error, Result};
pub use linked::{ActivationContext, ActivationState, Activator};
pub use metadata::{metadata_table, TableMetadata, METADATA_FORMAT_VERSION, METADATA_SUFFIX};
pub use modified::{server_timestamp, QueryByModified, DATE_MODIFIED_KEY};
pub use node::Node;
pub use pending::{PendingSave, PendingTree};
pub use split::split_changes;
pub use store::{ListenerId, ListenerOptions, NodeId, Store, Subscription};
pub use tracking::{is_tracking, untracked, Dependency, Tracked};
pub use transform::{
    invert_field_map, transform_object_fields, FieldMap, FieldRule, Nested, UnmappedKeys,
};
