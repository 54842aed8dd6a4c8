//! One synced root.
//!
//! A session wires a root node to its local table and remote backend:
//!
//! - Local writes are persisted at once and queued as pending saves
//! - Remote changes are persisted locally but never saved back
//! - Values loaded from storage are neither persisted nor saved
//!
//! Pending saves are debounced, stamped, transformed, split into bounded
//! batches and sent with retries by a single saver task, so saves for one
//! root never overlap.

use crate::{
    adapter::{
        LocalAdapter, RemoteAdapter, RemoteChange, RemoteEvent, RemoteGetParams, RemoteSetParams,
        RemoteSink,
    },
    config::{OfflineBehavior, SyncConfig, SyncHooks, SyncOptions},
    error::{Result, SyncError},
    retry::with_retry,
    state::{SyncPhase, SyncState},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tether_engine::{
    invert_field_map,
    modified::{max_date_modified, stamp_changes, strip_server_timestamps},
    split_changes, transform::transform_at, transform_object_fields, Change, ChangeMode, FieldMap,
    ListenerParams, Node, Origin, PendingSave, PendingTree, Subscription, TableMetadata,
    DATE_MODIFIED_KEY,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

enum LocalWrite {
    Changes(Vec<Change>),
    Metadata(TableMetadata),
    Barrier(oneshot::Sender<()>),
}

enum SaveSignal {
    Changed,
    Flush(oneshot::Sender<Result<()>>),
    RetryFailed(oneshot::Sender<Result<()>>),
}

/// Whether saves may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// Initial remote load in progress
    Loading,
    Ready,
    /// Initial load failed, listen is being retried
    Reconnecting,
    /// Listen gave up
    Failed,
}

enum Gate {
    Open,
    Blocked(SyncError),
    Closed,
}

struct LocalTarget {
    adapter: Arc<dyn LocalAdapter>,
    table: String,
}

struct SendOutcome {
    date_modified: Option<u64>,
    result: Result<()>,
}

struct Shared {
    root: Node,
    name: String,
    config: SyncConfig,
    inverse: Option<Arc<FieldMap>>,
    local: Option<LocalTarget>,
    remote: Option<Arc<dyn RemoteAdapter>>,
    hooks: SyncHooks,
    state: SyncState,
    pending: Mutex<PendingTree>,
    /// Saves the remote rejected, pruned as later saves confirm their paths
    failed: Mutex<PendingTree>,
    metadata: Mutex<TableMetadata>,
    readiness: watch::Sender<Readiness>,
    local_tx: mpsc::UnboundedSender<LocalWrite>,
    save_tx: mpsc::UnboundedSender<SaveSignal>,
    closed: AtomicBool,
}

/// A running sync for one root. Dropping it stops all background work.
pub struct SyncSession {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    _subscription: Subscription,
}

impl SyncSession {
    /// Attach to `root`, load the local table and start the remote tasks.
    ///
    /// Returns once local data has been applied. Must be called inside a
    /// Tokio runtime.
    pub(crate) async fn start(
        root: Node,
        options: SyncOptions,
        local: Option<Arc<dyn LocalAdapter>>,
    ) -> Self {
        let SyncOptions {
            config,
            remote,
            hooks,
            ..
        } = options;
        let local = match (local, config.local.clone()) {
            (Some(adapter), Some(table)) => Some(LocalTarget { adapter, table }),
            _ => None,
        };
        let name = local
            .as_ref()
            .map(|target| target.table.clone())
            .unwrap_or_else(|| format!("{:?}", root.id()));
        let inverse = config.field_transforms.as_ref().map(invert_field_map);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let initial = if remote.is_some() {
            Readiness::Loading
        } else {
            Readiness::Ready
        };
        let (readiness, _) = watch::channel(initial);

        let shared = Arc::new(Shared {
            state: SyncState::new(root.store()),
            root: root.clone(),
            name,
            config,
            inverse,
            local,
            remote,
            hooks,
            pending: Mutex::new(PendingTree::new()),
            failed: Mutex::new(PendingTree::new()),
            metadata: Mutex::new(TableMetadata::new()),
            readiness,
            local_tx,
            save_tx,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        let subscription = root.on_change(move |params| {
            if let Some(shared) = weak.upgrade() {
                shared.on_root_change(params);
            }
        });

        let mut tasks = Vec::new();
        if shared.local.is_some() {
            tasks.push(tokio::spawn(Arc::clone(&shared).run_local_writer(local_rx)));
        }
        shared.load_local().await;
        if let Some(remote) = shared.remote.clone() {
            tasks.push(tokio::spawn(Arc::clone(&shared).listen(remote)));
            tasks.push(tokio::spawn(Arc::clone(&shared).run_saver(save_rx)));
        } else {
            shared.state.set_phase(SyncPhase::Ready);
        }
        tracing::info!(
            table = %shared.name,
            local = shared.local.is_some(),
            remote = shared.remote.is_some(),
            "sync session started"
        );

        Self {
            shared,
            tasks,
            _subscription: subscription,
        }
    }

    pub fn root(&self) -> &Node {
        &self.shared.root
    }

    pub fn state(&self) -> &SyncState {
        &self.shared.state
    }

    /// Local saves waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Saves the remote rejected after all retries.
    pub fn failed_len(&self) -> usize {
        self.shared.failed.lock().len()
    }

    /// Send pending saves now, skipping the debounce, and wait for local
    /// persistence to catch up.
    pub async fn flush(&self) -> Result<()> {
        self.flush_local().await?;
        if self.shared.remote.is_none() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .save_tx
            .send(SaveSignal::Flush(tx))
            .map_err(|_| SyncError::Closed)?;
        let result = rx.await.map_err(|_| SyncError::Closed)?;
        self.flush_local().await?;
        result
    }

    /// Queue the saves the remote rejected earlier again and send them now,
    /// together with any newer local edits.
    pub async fn retry_failed(&self) -> Result<()> {
        if self.shared.remote.is_none() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .save_tx
            .send(SaveSignal::RetryFailed(tx))
            .map_err(|_| SyncError::Closed)?;
        let result = rx.await.map_err(|_| SyncError::Closed)?;
        self.flush_local().await?;
        result
    }

    /// Delete the local table and its metadata.
    pub async fn clear_local(&self) -> Result<()> {
        self.flush_local().await?;
        let Some(local) = &self.shared.local else {
            return Ok(());
        };
        local.adapter.delete_table(&local.table).await?;
        local.adapter.delete_metadata(&local.table).await?;
        tracing::info!(table = %local.table, "local table cleared");
        Ok(())
    }

    /// Wait for queued local writes, then stop.
    pub async fn close(self) -> Result<()> {
        self.flush_local().await
    }

    async fn flush_local(&self) -> Result<()> {
        if self.shared.local.is_none() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .local_tx
            .send(LocalWrite::Barrier(tx))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.readiness.send_replace(Readiness::Failed);
        for task in &self.tasks {
            task.abort();
        }
        self.shared.state.set_phase(SyncPhase::Disposed);
        tracing::info!(table = %self.shared.name, "sync session stopped");
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("table", &self.shared.name)
            .field("root", &self.shared.root)
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn offline_retry(&self) -> bool {
        self.config.offline_behavior == OfflineBehavior::Retry
    }

    // Shape conversion

    fn to_stored(&self, value: &Value) -> Value {
        match &self.config.field_transforms {
            Some(map) => transform_object_fields(value, map, self.config.unmapped_keys),
            None => value.clone(),
        }
    }

    fn to_memory(&self, value: Value) -> Value {
        match &self.inverse {
            Some(map) => transform_object_fields(&value, map, self.config.unmapped_keys),
            None => value,
        }
    }

    fn change_to_stored(&self, change: &Change) -> Option<Change> {
        let Some(map) = &self.config.field_transforms else {
            return Some(change.clone());
        };
        let (path, value) = transform_at(
            &change.path,
            &change.value_at_path,
            map,
            self.config.unmapped_keys,
        )?;
        Some(Change {
            path,
            value_at_path: value,
            ..change.clone()
        })
    }

    // Local side

    fn on_root_change(&self, params: &ListenerParams) {
        let mut persist = Vec::new();
        let mut queued = false;
        let now = now_millis();
        for change in &params.changes {
            match change.origin {
                Origin::Storage => {}
                Origin::Remote => persist.push(change.clone()),
                Origin::Local => {
                    persist.push(change.clone());
                    if self.remote.is_some() {
                        self.pending.lock().insert(PendingSave::new(
                            change.path.clone(),
                            change.path_types.clone(),
                            change.value_at_path.clone(),
                            now,
                        ));
                        queued = true;
                    }
                }
            }
        }
        if !persist.is_empty() {
            self.persist_local(&persist);
        }
        if queued {
            if self.offline_retry() {
                self.persist_metadata();
            }
            let _ = self.save_tx.send(SaveSignal::Changed);
        }
    }

    fn persist_local(&self, changes: &[Change]) {
        if self.local.is_none() {
            return;
        }
        let stored: Vec<Change> = changes
            .iter()
            .filter_map(|change| self.change_to_stored(change))
            .collect();
        if !stored.is_empty() {
            let _ = self.local_tx.send(LocalWrite::Changes(stored));
        }
    }

    fn persist_metadata(&self) {
        if self.local.is_none() {
            return;
        }
        let mut metadata = self.metadata.lock().clone();
        if self.offline_retry() {
            let mut tree = self.failed.lock().clone();
            for save in self.pending.lock().iter() {
                tree.insert(save.clone());
            }
            metadata.set_pending(&tree);
        } else {
            metadata.pending.clear();
        }
        let _ = self.local_tx.send(LocalWrite::Metadata(metadata));
    }

    async fn run_local_writer(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LocalWrite>) {
        let Some(local) = self.local.as_ref() else {
            return;
        };
        while let Some(write) = rx.recv().await {
            let result = match write {
                LocalWrite::Changes(changes) => local.adapter.set(&local.table, &changes).await,
                LocalWrite::Metadata(metadata) => {
                    local.adapter.set_metadata(&local.table, &metadata).await
                }
                LocalWrite::Barrier(done) => {
                    let _ = done.send(());
                    continue;
                }
            };
            if let Err(err) = result {
                tracing::warn!(table = %local.table, %err, "local save failed");
                self.state.set_error(Some(err.to_string()));
                self.hooks.set_error(&err);
            }
        }
    }

    async fn load_local(&self) {
        let Some(local) = &self.local else {
            return;
        };
        self.state.set_phase(SyncPhase::LoadingLocal);
        if let Err(err) = local.adapter.load_table(&local.table).await {
            tracing::warn!(table = %local.table, %err, "local load failed");
            self.state.set_error(Some(err.to_string()));
            self.hooks.get_error(&err);
        }

        let stored = local.adapter.get_table(&local.table);
        let metadata = local.adapter.get_metadata(&local.table);
        let requeue = if self.offline_retry() {
            metadata.pending_tree()
        } else {
            PendingTree::new()
        };

        let mut value = stored.map(|value| self.to_memory(value));
        if !requeue.is_empty() {
            let mut base = value.take().unwrap_or(Value::Null);
            requeue.overlay(&mut base);
            value = Some(base);
        }
        if let Some(value) = value {
            self.apply_from(Origin::Storage, |root| root.merge(value));
        }

        {
            let mut current = self.metadata.lock();
            current.last_sync = metadata.last_sync;
        }
        self.state.set_last_sync(metadata.last_sync.get());

        if !requeue.is_empty() && self.remote.is_some() {
            tracing::info!(table = %local.table, saves = requeue.len(), "replaying offline saves");
            {
                let mut pending = self.pending.lock();
                for save in requeue.iter() {
                    pending.insert(save.clone());
                }
            }
            let _ = self.save_tx.send(SaveSignal::Changed);
        }

        self.state.set_loaded_local();
        self.state.set_phase(SyncPhase::LoadedLocal);
        tracing::debug!(table = %local.table, "local table loaded");
    }

    /// Run a write against the root under `origin`, logging failures.
    fn apply_from(&self, origin: Origin, write: impl FnOnce(&Node) -> tether_engine::Result<()>) {
        let _scope = self.root.store().batch_from(origin);
        if let Err(err) = write(&self.root) {
            tracing::warn!(table = %self.name, ?origin, %err, "write to synced root failed");
        }
    }

    // Remote listen

    async fn listen(self: Arc<Self>, remote: Arc<dyn RemoteAdapter>) {
        self.state.set_phase(SyncPhase::LoadingRemote);
        let retry = self.config.retry.incremental();
        let mut failures = 0;
        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let sink = RemoteSink::new(tx);
            let last_sync = self.metadata.lock().last_sync;
            let adapter = remote.as_ref();
            let sink_ref = &sink;
            let (result, _) = with_retry(
                &retry,
                "remote get",
                || !self.is_closed(),
                move |_| {
                    adapter.get(RemoteGetParams {
                        last_sync,
                        sink: sink_ref.clone(),
                    })
                },
            )
            .await;
            drop(sink);

            if let Err(err) = result {
                let err = SyncError::RemoteListen(err.to_string());
                self.listen_failed(&err);
                return;
            }

            let mut broken = None;
            while let Some(event) = rx.recv().await {
                match event {
                    RemoteEvent::Change(change) => self.apply_remote(change),
                    RemoteEvent::Loaded => {
                        failures = 0;
                        self.remote_loaded();
                    }
                    RemoteEvent::Error(message) => {
                        broken = Some(message);
                        break;
                    }
                }
            }

            let Some(message) = broken else {
                // Every sink was dropped: a one-shot fetch has completed.
                self.remote_loaded();
                return;
            };

            failures += 1;
            let err = SyncError::RemoteListen(message);
            tracing::warn!(table = %self.name, %err, failures, "remote listen broke");
            self.state.set_error(Some(err.to_string()));
            self.hooks.error(&err);
            if failures >= retry.times {
                self.listen_failed(&err);
                return;
            }
            if *self.readiness.borrow() == Readiness::Loading {
                self.readiness.send_replace(Readiness::Reconnecting);
            }
            tokio::time::sleep(retry.delay_for(failures)).await;
        }
    }

    fn listen_failed(&self, err: &SyncError) {
        tracing::error!(table = %self.name, %err, "remote listen failed");
        self.state.set_error(Some(err.to_string()));
        self.hooks.get_error(err);
        if *self.readiness.borrow() != Readiness::Ready {
            self.readiness.send_replace(Readiness::Failed);
            self.state.set_phase(SyncPhase::Failed);
        }
    }

    fn remote_loaded(&self) {
        if self.state.is_loaded_remote() {
            return;
        }
        let store = self.root.store().clone();
        let saving = self.state.num_pending_saves() > 0;
        store.batch_with(|| {
            self.state.set_loaded_remote();
            self.state.set_error(None);
            if !saving {
                self.state.set_phase(SyncPhase::LoadedRemote);
            }
        });
        if !saving {
            self.state.set_phase(SyncPhase::Ready);
        }
        self.readiness.send_replace(Readiness::Ready);
        tracing::debug!(table = %self.name, "remote loaded");
    }

    fn apply_remote(&self, change: RemoteChange) {
        let RemoteChange {
            path,
            value,
            mode,
            date_modified,
        } = change;
        let (path, mut value) = match &self.inverse {
            Some(map) => match transform_at(&path, &value, map, self.config.unmapped_keys) {
                Some(transformed) => transformed,
                None => return,
            },
            None => (path, value),
        };
        let date_modified = date_modified.or_else(|| max_date_modified(&value));

        let (kept, pending_changed) = {
            let mut pending = self.pending.lock();
            let before = pending.clone();
            let kept = pending.resolve_incoming(&path, &mut value, date_modified);
            (kept, *pending != before)
        };
        if kept > 0 {
            tracing::debug!(table = %self.name, kept, "local edits kept over remote change");
        }

        self.apply_from(Origin::Remote, |root| {
            let target = root.at(&path);
            match mode {
                ChangeMode::Merge => target.merge(value),
                ChangeMode::Delete if kept == 0 => target.delete(),
                _ => target.set(value),
            }
        });

        let advanced = match date_modified {
            Some(millis) => {
                let mut metadata = self.metadata.lock();
                let newer = metadata.last_sync.is_newer(millis);
                metadata.last_sync.merge(millis);
                newer
            }
            None => false,
        };
        if advanced {
            self.state.set_last_sync(date_modified);
        }
        if advanced || pending_changed {
            self.persist_metadata();
        }
    }

    // Saving

    async fn run_saver(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SaveSignal>) {
        while let Some(signal) = rx.recv().await {
            let mut flushes = Vec::new();
            let mut retries = Vec::new();
            match signal {
                SaveSignal::Changed => loop {
                    match tokio::time::timeout(self.config.change_timeout, rx.recv()).await {
                        Ok(Some(SaveSignal::Changed)) => continue,
                        Ok(Some(SaveSignal::Flush(done))) => {
                            flushes.push(done);
                            break;
                        }
                        Ok(Some(SaveSignal::RetryFailed(done))) => {
                            retries.push(done);
                            break;
                        }
                        Ok(None) => return,
                        Err(_) => break,
                    }
                },
                SaveSignal::Flush(done) => flushes.push(done),
                SaveSignal::RetryFailed(done) => retries.push(done),
            }

            match self.wait_until_ready().await {
                Gate::Open => {}
                Gate::Blocked(err) => {
                    tracing::debug!(table = %self.name, %err, "saves held until remote recovers");
                    for done in flushes.into_iter().chain(retries) {
                        let _ = done.send(Err(err.clone()));
                    }
                    continue;
                }
                Gate::Closed => return,
            }

            if !retries.is_empty() {
                let result = self.resend_failed().await;
                for done in retries {
                    let _ = done.send(result.clone());
                }
            }
            let result = self.save_pending().await;
            for done in flushes {
                let _ = done.send(result.clone());
            }
        }
    }

    async fn wait_until_ready(&self) -> Gate {
        let mut readiness = self.readiness.subscribe();
        loop {
            if self.is_closed() {
                return Gate::Closed;
            }
            let current = *readiness.borrow_and_update();
            match current {
                Readiness::Ready => return Gate::Open,
                Readiness::Reconnecting | Readiness::Failed if self.config.allow_set_if_error => {
                    return Gate::Open
                }
                Readiness::Failed => {
                    let message = self
                        .state
                        .error()
                        .unwrap_or_else(|| "remote unavailable".to_string());
                    return Gate::Blocked(SyncError::RemoteListen(message));
                }
                Readiness::Loading | Readiness::Reconnecting => {}
            }
            if readiness.changed().await.is_err() {
                return Gate::Closed;
            }
        }
    }

    async fn save_pending(&self) -> Result<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let mut saves = self.pending.lock().take_all();
        if saves.is_empty() {
            return Ok(());
        }
        self.state.saving(1);

        let stamped = stamp_changes(&mut saves, &self.config.query_by_modified);
        let changes = saves
            .into_iter()
            .map(|save| {
                let mode = if save.value.is_null() {
                    ChangeMode::Delete
                } else {
                    ChangeMode::Set
                };
                Change::at(save.path, save.path_types, save.value, mode, Origin::Local)
            })
            .collect();
        let value = self.to_stored(&self.root.peek());
        let chunks = split_changes(changes, self.config.max_batch_bytes);
        tracing::debug!(table = %self.name, batches = chunks.len(), "saving to remote");

        let outcome = self.send_chunks(remote.as_ref(), chunks, &value).await;
        if let Some(millis) = outcome.date_modified {
            self.apply_from(Origin::Remote, |root| {
                for item in &stamped {
                    let node = root.at(item);
                    if node.peek().is_object() {
                        node.stamp_modified(millis)?;
                    }
                }
                Ok(())
            });
            self.confirm_watermark(millis);
        }
        self.persist_metadata();
        self.state.saving(-1);
        outcome.result
    }

    async fn resend_failed(&self) -> Result<()> {
        let failed = std::mem::take(&mut *self.failed.lock());
        if failed.is_empty() {
            return Ok(());
        }
        tracing::info!(table = %self.name, saves = failed.len(), "requeueing failed saves");
        {
            let mut pending = self.pending.lock();
            let mut merged = failed;
            for save in pending.take_all() {
                merged.insert(save);
            }
            *pending = merged;
        }
        self.save_pending().await
    }

    /// Shape a memory-side chunk for the remote.
    fn outgoing(&self, chunk: &[Change]) -> Vec<Change> {
        chunk
            .iter()
            .filter_map(|change| self.change_to_stored(change))
            .collect()
    }

    /// Drop failed saves that `chunk` has now written.
    fn confirm_saved(&self, chunk: &[Change]) {
        let mut failed = self.failed.lock();
        if failed.is_empty() {
            return;
        }
        for change in chunk {
            failed.confirm(&change.path, &change.value_at_path);
        }
    }

    /// Keep a rejected chunk for `retry_failed` and offline replay.
    fn keep_failed(&self, chunk: Vec<Change>) {
        let now = now_millis();
        let mut failed = self.failed.lock();
        for change in chunk {
            if change.path.last().map(String::as_str) == Some(DATE_MODIFIED_KEY) {
                continue;
            }
            let mut value = change.value_at_path;
            strip_server_timestamps(&mut value);
            failed.insert(PendingSave::new(change.path, change.path_types, value, now));
        }
    }

    async fn send_chunks(
        &self,
        remote: &dyn RemoteAdapter,
        chunks: Vec<Vec<Change>>,
        value: &Value,
    ) -> SendOutcome {
        let mut date_modified = None;
        let mut first_error = None;
        for chunk in chunks {
            let outgoing = self.outgoing(&chunk);
            if outgoing.is_empty() {
                continue;
            }
            let batch = &outgoing;
            let (result, attempts) = with_retry(
                &self.config.retry,
                "remote set",
                || !self.is_closed(),
                move |_| {
                    remote.set(RemoteSetParams {
                        changes: batch.clone(),
                        value: value.clone(),
                    })
                },
            )
            .await;
            match result {
                Ok(saved) => {
                    self.confirm_saved(&chunk);
                    date_modified = date_modified.max(saved.date_modified);
                    if let Some(changes) = saved.changes {
                        let changes = self.to_memory(changes);
                        self.apply_from(Origin::Remote, |root| root.merge(changes));
                    }
                }
                Err(err) => {
                    let err = SyncError::RemoteSave {
                        attempts,
                        message: err.to_string(),
                    };
                    tracing::warn!(table = %self.name, %err, changes = chunk.len(), "batch kept for retry");
                    self.state.set_error(Some(err.to_string()));
                    self.hooks.set_error(&err);
                    self.keep_failed(chunk);
                    first_error.get_or_insert(err);
                }
            }
        }
        SendOutcome {
            date_modified,
            result: first_error.map_or(Ok(()), Err),
        }
    }

    fn confirm_watermark(&self, millis: u64) {
        let mut metadata = self.metadata.lock();
        metadata.last_sync.merge(millis);
        let last = metadata.last_sync.get();
        drop(metadata);
        self.state.set_last_sync(last);
    }
}
