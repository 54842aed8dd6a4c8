//! Shared helpers for sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tether_engine::{ListenerParams, Node, Origin, Store, Subscription};
use tether_sync::{
    MemoryBackend, MemoryLocalAdapter, RealtimeRemote, RemoteAdapter, RemoteGetParams,
    RemoteSetParams, RemoteSetResult, Result, RetryConfig, SyncEngine, SyncError, SyncOptions,
};

/// Debounce window used by most tests.
pub const CHANGE_TIMEOUT: Duration = Duration::from_millis(50);

/// Install a tracing subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test helper to build a path.
pub fn p(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Let spawned tasks run and the debounce window pass.
pub async fn settle() {
    tokio::time::sleep(CHANGE_TIMEOUT * 4).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// A store, an engine and the backends a test syncs against.
pub struct Harness {
    pub store: Store,
    pub engine: SyncEngine,
    pub local: Arc<MemoryLocalAdapter>,
    pub backend: Arc<MemoryBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(MemoryLocalAdapter::new()), Arc::new(MemoryBackend::new()))
    }

    pub fn with_parts(local: Arc<MemoryLocalAdapter>, backend: Arc<MemoryBackend>) -> Self {
        init_tracing();
        let store = Store::new();
        Self {
            engine: SyncEngine::new(store.clone()),
            store,
            local,
            backend,
        }
    }

    /// Options syncing `table` against the harness adapters.
    pub fn options(&self, table: &str) -> SyncOptions {
        SyncOptions::default()
            .table(table)
            .local_adapter(self.local.clone())
            .remote(Arc::new(RealtimeRemote::new(Arc::clone(&self.backend))))
            .change_timeout(CHANGE_TIMEOUT)
    }
}

/// Record every change delivered to `node`.
pub fn record(node: &Node) -> (Arc<Mutex<Vec<ListenerParams>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = node.on_change(move |params| sink.lock().push(params.clone()));
    (seen, sub)
}

/// Count recorded changes from `origin`.
pub fn count_from(seen: &Mutex<Vec<ListenerParams>>, origin: Origin) -> usize {
    seen.lock()
        .iter()
        .map(|params| params.changes_from(origin).count())
        .sum()
}

/// Remote whose listen always fails and whose saves always succeed.
#[derive(Default)]
pub struct UnreachableRemote {
    pub saves: AtomicUsize,
}

#[async_trait]
impl RemoteAdapter for UnreachableRemote {
    async fn get(&self, _params: RemoteGetParams) -> Result<()> {
        Err(SyncError::Io("connection refused".into()))
    }

    async fn set(&self, _params: RemoteSetParams) -> Result<RemoteSetResult> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteSetResult::default())
    }
}

/// Fast retries for tests that exhaust them.
pub fn quick_retry() -> RetryConfig {
    RetryConfig {
        times: 2,
        delay: Duration::from_millis(10),
        ..RetryConfig::default()
    }
}

pub fn value_at(node: &Node, path: &[&str]) -> Value {
    node.at(path).peek()
}
