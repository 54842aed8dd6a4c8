//! Sync engine.
//!
//! Owns the sessions of every synced root in a store and the local adapters
//! they share.

use crate::{
    adapter::LocalAdapter,
    config::SyncOptions,
    error::{Result, SyncError},
    memory::MemoryLocalAdapter,
    session::SyncSession,
    state::SyncState,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::{
    any::{Any, TypeId},
    sync::{Arc, Weak},
};
use tether_engine::{ActivationContext, Activator, Node, NodeId, Store};
use tokio::sync::OnceCell;

type InitCell = Arc<OnceCell<Result<()>>>;

struct EngineInner {
    store: Store,
    default_local: RwLock<Option<Arc<dyn LocalAdapter>>>,
    /// One shared instance per adapter type
    adapters: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Initialization result per adapter instance
    initialized: DashMap<usize, InitCell>,
    sessions: DashMap<NodeId, Arc<SyncSession>>,
}

/// Entry point for persisting and syncing roots of a [`Store`].
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                default_local: RwLock::new(None),
                adapters: DashMap::new(),
                initialized: DashMap::new(),
                sessions: DashMap::new(),
            }),
        }
    }

    /// Use `adapter` for roots whose options name a table but no adapter.
    pub fn with_local_adapter(self, adapter: Arc<dyn LocalAdapter>) -> Self {
        *self.inner.default_local.write() = Some(adapter);
        self
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The shared instance of adapter type `A`, created on first use.
    pub fn local_adapter<A: LocalAdapter + Default>(&self) -> Arc<A> {
        let key = TypeId::of::<A>();
        let shared = self
            .inner
            .adapters
            .entry(key)
            .or_insert_with(|| Arc::new(A::default()) as Arc<dyn Any + Send + Sync>)
            .clone();
        match shared.downcast::<A>() {
            Ok(adapter) => adapter,
            Err(_) => {
                let adapter = Arc::new(A::default());
                self.inner
                    .adapters
                    .insert(key, Arc::clone(&adapter) as Arc<dyn Any + Send + Sync>);
                adapter
            }
        }
    }

    fn default_local(&self) -> Arc<dyn LocalAdapter> {
        if let Some(adapter) = self.inner.default_local.read().clone() {
            return adapter;
        }
        self.local_adapter::<MemoryLocalAdapter>()
    }

    /// Run `adapter.initialize()` once per adapter instance.
    async fn ensure_initialized(&self, adapter: &Arc<dyn LocalAdapter>) -> Result<()> {
        let key = Arc::as_ptr(adapter) as *const () as usize;
        let cell = self.inner.initialized.entry(key).or_default().clone();
        cell.get_or_init(|| adapter.initialize()).await.clone()
    }

    async fn local_for(&self, options: &SyncOptions) -> Result<Option<Arc<dyn LocalAdapter>>> {
        let Some(table) = &options.config.local else {
            return Ok(None);
        };
        let adapter = match &options.local {
            Some(adapter) => Arc::clone(adapter),
            None => self.default_local(),
        };
        if let Err(err) = self.ensure_initialized(&adapter).await {
            tracing::error!(table = %table, %err, "local adapter failed to initialize");
            options.hooks.get_error(&err);
            return Err(err);
        }
        Ok(Some(adapter))
    }

    /// Persist and sync `node`'s root.
    ///
    /// Returns once local data has been loaded into the root. Remote data
    /// arrives in the background; watch the returned state for progress.
    /// Calling this again for the same root returns the existing state.
    pub async fn persist(&self, node: &Node, options: SyncOptions) -> Result<SyncState> {
        let root = node.root();
        if !root.is_alive() {
            return Err(SyncError::Engine(tether_engine::Error::NodeDisposed));
        }
        if let Some(session) = self.session(&root) {
            return Ok(session.state().clone());
        }

        let local = self.local_for(&options).await?;
        let session = Arc::new(SyncSession::start(root.clone(), options, local).await);
        match self.inner.sessions.entry(root.id()) {
            Entry::Occupied(existing) => Ok(existing.get().state().clone()),
            Entry::Vacant(slot) => {
                let state = session.state().clone();
                slot.insert(session);
                Ok(state)
            }
        }
    }

    /// Create a root that starts syncing the first time it is read.
    ///
    /// The root holds `initial` until local and remote data arrive. Needs a
    /// Tokio runtime at activation time.
    pub fn synced(&self, initial: Value, options: SyncOptions) -> Node {
        self.inner.store.linked(SyncActivator {
            engine: Arc::downgrade(&self.inner),
            initial,
            options: Mutex::new(Some(options)),
        })
    }

    pub fn session(&self, node: &Node) -> Option<Arc<SyncSession>> {
        self.inner
            .sessions
            .get(&node.root().id())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn sync_state(&self, node: &Node) -> Option<SyncState> {
        self.session(node).map(|session| session.state().clone())
    }

    /// Send `node`'s pending saves now.
    pub async fn flush(&self, node: &Node) -> Result<()> {
        match self.session(node) {
            Some(session) => session.flush().await,
            None => Ok(()),
        }
    }

    /// Resend batches the remote rejected for `node`'s root.
    pub async fn retry_failed(&self, node: &Node) -> Result<()> {
        match self.session(node) {
            Some(session) => session.retry_failed().await,
            None => Ok(()),
        }
    }

    /// Flush every session.
    pub async fn flush_all(&self) -> Result<()> {
        let sessions: Vec<Arc<SyncSession>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.flush().await?;
        }
        Ok(())
    }

    /// Stop syncing `node`'s root. Returns whether a session was running.
    pub fn dispose(&self, node: &Node) -> bool {
        self.inner.sessions.remove(&node.root().id()).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

/// Starts a session when a synced root is first accessed.
struct SyncActivator {
    engine: Weak<EngineInner>,
    initial: Value,
    options: Mutex<Option<SyncOptions>>,
}

impl Activator for SyncActivator {
    fn activate(&self, ctx: ActivationContext) {
        ctx.resolve(self.initial.clone());
        let (Some(inner), Some(node)) = (self.engine.upgrade(), ctx.node()) else {
            return;
        };
        let Some(options) = self.options.lock().take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("synced root activated outside a Tokio runtime; not syncing");
            return;
        };
        let engine = SyncEngine { inner };
        handle.spawn(async move {
            if let Err(err) = engine.persist(&node, options).await {
                tracing::error!(%err, "failed to start sync for linked root");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::StaticRemote, state::SyncPhase};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tether_engine::{Change, TableMetadata};

    #[derive(Default)]
    struct CountingAdapter {
        inits: AtomicUsize,
        inner: MemoryLocalAdapter,
    }

    #[async_trait]
    impl LocalAdapter for CountingAdapter {
        async fn initialize(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn get_table(&self, table: &str) -> Option<Value> {
            self.inner.get_table(table)
        }

        fn get_metadata(&self, table: &str) -> TableMetadata {
            self.inner.get_metadata(table)
        }

        async fn set(&self, table: &str, changes: &[Change]) -> Result<()> {
            self.inner.set(table, changes).await
        }

        async fn set_metadata(&self, table: &str, metadata: &TableMetadata) -> Result<()> {
            self.inner.set_metadata(table, metadata).await
        }

        async fn delete_table(&self, table: &str) -> Result<()> {
            self.inner.delete_table(table).await
        }

        async fn delete_metadata(&self, table: &str) -> Result<()> {
            self.inner.delete_metadata(table).await
        }
    }

    #[test]
    fn adapters_are_shared_by_type() {
        let engine = SyncEngine::new(Store::new());
        let a = engine.local_adapter::<MemoryLocalAdapter>();
        let b = engine.local_adapter::<MemoryLocalAdapter>();
        assert!(Arc::ptr_eq(&a, &b));

        let c = engine.local_adapter::<CountingAdapter>();
        let d = engine.local_adapter::<CountingAdapter>();
        assert!(Arc::ptr_eq(&c, &d));
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_initialized_once() {
        let store = Store::new();
        let engine = SyncEngine::new(store.clone());
        let adapter = engine.local_adapter::<CountingAdapter>();
        let shared: Arc<dyn LocalAdapter> = adapter.clone();

        for table in ["a", "b", "c"] {
            let root = store.observable(json!({}));
            engine
                .persist(&root, SyncOptions::default().table(table).local_adapter(shared.clone()))
                .await
                .unwrap();
        }
        assert_eq!(adapter.inits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.session_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_is_idempotent_per_root() {
        let store = Store::new();
        let engine = SyncEngine::new(store.clone());
        let root = store.observable(json!({"a": 1}));

        let first = engine.persist(&root, SyncOptions::default().table("x")).await.unwrap();
        let second = engine
            .persist(&root.child("a"), SyncOptions::default().table("y"))
            .await
            .unwrap();
        assert_eq!(first.node(), second.node());
        assert_eq!(engine.session_count(), 1);

        root.child("a").set(json!(2)).unwrap();
        engine.flush(&root).await.unwrap();
        let memory = engine.local_adapter::<MemoryLocalAdapter>();
        assert_eq!(memory.get_table("x"), Some(json!({"a": 2})));

        assert!(engine.dispose(&root));
        assert!(!engine.dispose(&root));
        assert_eq!(first.phase(), SyncPhase::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn synced_root_starts_on_first_read() {
        let store = Store::new();
        let engine = SyncEngine::new(store.clone());
        let node = engine.synced(
            json!({"theme": "light"}),
            SyncOptions::default().remote(Arc::new(StaticRemote::new(json!({"lang": "en"})))),
        );
        assert!(engine.sync_state(&node).is_none());

        assert_eq!(node.get(), json!({"theme": "light"}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = engine.sync_state(&node).expect("session started");
        assert!(state.is_loaded_remote());
        assert_eq!(node.get(), json!({"theme": "light", "lang": "en"}));
    }
}
