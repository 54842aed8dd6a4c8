//! Remote adapter for realtime backends.
//!
//! A [`RealtimeBackend`] streams item-level value events and accepts
//! multi-path updates. [`RealtimeRemote`] turns it into a
//! [`RemoteAdapter`]: it forwards events from other clients and swallows
//! the echoes of its own writes, resolving each save with the server
//! timestamp found in the echo.

use crate::{
    adapter::{RemoteAdapter, RemoteChange, RemoteGetParams, RemoteSetParams, RemoteSetResult},
    error::{Result, SyncError},
    session::now_millis,
};
use async_trait::async_trait;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tether_engine::{
    modified::{date_modified_of, resolve_server_timestamps, strip_date_modified},
    value, ChangeMode, Watermark, DATE_MODIFIED_KEY,
};
use tokio::sync::oneshot;

/// Event emitted by a realtime backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// The value at `path` is now `value`; `Null` means removed
    Value { path: Vec<String>, value: Value },
    /// Initial data has been delivered
    Ready,
    /// The stream failed and will end
    Error(String),
}

/// A backend with push updates, in the style of a realtime database.
#[async_trait]
pub trait RealtimeBackend: Send + Sync + 'static {
    /// Stream items modified after `since`, then live updates.
    async fn listen(&self, since: Watermark) -> Result<BoxStream<'static, RealtimeEvent>>;

    /// Write several paths atomically. Server-timestamp sentinels are
    /// replaced by the backend's clock.
    async fn update(&self, writes: &[(Vec<String>, Value)]) -> Result<()>;
}

struct PendingWrite {
    id: u64,
    path: Vec<String>,
    value: Value,
    done: Option<oneshot::Sender<Option<u64>>>,
}

struct Echoes {
    next_id: AtomicU64,
    writes: Mutex<Vec<PendingWrite>>,
}

impl Echoes {
    fn register(&self, path: Vec<String>, mut value: Value) -> (u64, oneshot::Receiver<Option<u64>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        strip_date_modified(&mut value);
        self.writes.lock().push(PendingWrite {
            id,
            path,
            value,
            done: Some(tx),
        });
        (id, rx)
    }

    fn forget(&self, ids: &[u64]) {
        self.writes.lock().retain(|write| !ids.contains(&write.id));
    }

    /// Resolve every pending write satisfied by this event.
    ///
    /// Returns `None` when the event echoes none of our writes, otherwise
    /// what is left of the event once the echoed parts are removed.
    fn resolve(&self, path: &[String], value: &Value) -> Option<Value> {
        let mut stripped = value.clone();
        strip_date_modified(&mut stripped);
        let date_modified = date_modified_of(value);

        let mut writes = self.writes.lock();
        let mut matched = Vec::new();
        writes.retain_mut(|write| {
            if !value::is_prefix(path, &write.path) {
                return true;
            }
            let relative = &write.path[path.len()..];
            if value::value_at(&stripped, relative) != write.value {
                return true;
            }
            if let Some(done) = write.done.take() {
                let _ = done.send(date_modified);
            }
            matched.push(relative.to_vec());
            false
        });
        drop(writes);
        if matched.is_empty() {
            return None;
        }
        let mut rest = value.clone();
        for relative in &matched {
            value::remove_at(&mut rest, relative);
        }
        if let Value::Object(map) = &mut rest {
            map.remove(DATE_MODIFIED_KEY);
            if map.is_empty() {
                rest = Value::Null;
            }
        }
        Some(rest)
    }
}

/// [`RemoteAdapter`] over a [`RealtimeBackend`].
pub struct RealtimeRemote<B> {
    backend: Arc<B>,
    echoes: Arc<Echoes>,
    /// Open listen streams
    listening: Arc<AtomicUsize>,
    echo_timeout: Duration,
}

impl<B: RealtimeBackend> RealtimeRemote<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            echoes: Arc::new(Echoes {
                next_id: AtomicU64::new(0),
                writes: Mutex::new(Vec::new()),
            }),
            listening: Arc::new(AtomicUsize::new(0)),
            echo_timeout: Duration::from_secs(5),
        }
    }

    /// How long a save waits for its echo before resolving without a
    /// timestamp.
    pub fn echo_timeout(mut self, timeout: Duration) -> Self {
        self.echo_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Writes still waiting for their echo.
    pub fn pending_echoes(&self) -> usize {
        self.echoes.writes.lock().len()
    }
}

#[async_trait]
impl<B: RealtimeBackend> RemoteAdapter for RealtimeRemote<B> {
    async fn get(&self, params: RemoteGetParams) -> Result<()> {
        let mut stream = self.backend.listen(params.last_sync).await?;
        let sink = params.sink;
        let echoes = Arc::clone(&self.echoes);
        let listening = Arc::clone(&self.listening);
        listening.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let delivered = match event {
                    RealtimeEvent::Value { path, value } => {
                        let date_modified = date_modified_of(&value);
                        let change = match echoes.resolve(&path, &value) {
                            None if value.is_null() => RemoteChange::delete(path),
                            None => RemoteChange {
                                path,
                                value,
                                mode: ChangeMode::Set,
                                date_modified,
                            },
                            Some(Value::Null) => {
                                tracing::trace!(path = %path.join("/"), "echo suppressed");
                                continue;
                            }
                            // Fields other clients wrote alongside our echo.
                            Some(rest) => RemoteChange {
                                path,
                                value: rest,
                                mode: ChangeMode::Merge,
                                date_modified,
                            },
                        };
                        sink.change(change)
                    }
                    RealtimeEvent::Ready => sink.loaded(),
                    RealtimeEvent::Error(message) => {
                        sink.error(message);
                        break;
                    }
                };
                if !delivered {
                    break;
                }
            }
            listening.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn set(&self, params: RemoteSetParams) -> Result<RemoteSetResult> {
        let writes: Vec<(Vec<String>, Value)> = params
            .changes
            .into_iter()
            .map(|change| (change.path, change.value_at_path))
            .collect();

        let track = self.listening.load(Ordering::SeqCst) > 0;
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        if track {
            for (path, value) in &writes {
                if path.last().map(String::as_str) == Some(DATE_MODIFIED_KEY) {
                    continue;
                }
                let (id, rx) = self.echoes.register(path.clone(), value.clone());
                ids.push(id);
                receivers.push(rx);
            }
        }

        if let Err(err) = self.backend.update(&writes).await {
            self.echoes.forget(&ids);
            return Err(err);
        }

        let echoed = futures::future::join_all(receivers);
        let date_modified = match tokio::time::timeout(self.echo_timeout, echoed).await {
            Ok(results) => results.into_iter().filter_map(|r| r.ok().flatten()).max(),
            Err(_) => {
                tracing::debug!(writes = ids.len(), "save echo timed out");
                self.echoes.forget(&ids);
                None
            }
        };
        Ok(RemoteSetResult {
            date_modified,
            changes: None,
        })
    }
}

struct MemoryState {
    data: Value,
    listeners: Vec<mpsc::UnboundedSender<RealtimeEvent>>,
    clock: u64,
    update_count: usize,
    fail_next: usize,
}

/// In-process realtime backend.
///
/// Stores one JSON tree, timestamps writes with a monotonic clock and
/// broadcasts item-level events to every listener, including the writer.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_data(Value::Null)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                data,
                listeners: Vec::new(),
                clock: 0,
                update_count: 0,
                fail_next: 0,
            }),
        }
    }

    pub fn data(&self) -> Value {
        self.state.lock().data.clone()
    }

    /// Successful calls to [`RealtimeBackend::update`].
    pub fn update_count(&self) -> usize {
        self.state.lock().update_count
    }

    /// Make the next `count` updates fail.
    pub fn fail_next_updates(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Apply a write as if another client made it.
    pub fn push_external(&self, path: Vec<String>, value: Value) {
        let mut state = self.state.lock();
        Self::write(&mut state, &[(path, value)]);
    }

    /// Break every open stream.
    pub fn disconnect(&self, message: &str) {
        let mut state = self.state.lock();
        for listener in state.listeners.drain(..) {
            let _ = listener.unbounded_send(RealtimeEvent::Error(message.to_string()));
        }
    }

    fn tick(state: &mut MemoryState) -> u64 {
        state.clock = (state.clock + 1).max(now_millis());
        state.clock
    }

    fn write(state: &mut MemoryState, writes: &[(Vec<String>, Value)]) {
        let now = Self::tick(state);
        let mut items: Vec<Vec<String>> = Vec::new();
        for (path, value) in writes {
            let mut value = value.clone();
            resolve_server_timestamps(&mut value, now);
            value::set_at(&mut state.data, path, None, value);
            let item = path.iter().take(1).cloned().collect::<Vec<_>>();
            if !items.contains(&item) {
                items.push(item);
            }
        }

        let mut events = Vec::new();
        for item in items {
            if item.is_empty() {
                if let Value::Object(map) = &state.data {
                    events.extend(map.iter().map(|(key, value)| RealtimeEvent::Value {
                        path: vec![key.clone()],
                        value: value.clone(),
                    }));
                }
            } else {
                events.push(RealtimeEvent::Value {
                    value: value::value_at(&state.data, &item),
                    path: item,
                });
            }
        }
        state
            .listeners
            .retain(|listener| events.iter().all(|e| listener.unbounded_send(e.clone()).is_ok()));
    }
}

#[async_trait]
impl RealtimeBackend for MemoryBackend {
    async fn listen(&self, since: Watermark) -> Result<BoxStream<'static, RealtimeEvent>> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        if let Value::Object(map) = &state.data {
            for (key, value) in map {
                let changed = match date_modified_of(value) {
                    Some(millis) => since.is_newer(millis),
                    None => since.is_unset(),
                };
                if changed {
                    let _ = tx.unbounded_send(RealtimeEvent::Value {
                        path: vec![key.clone()],
                        value: value.clone(),
                    });
                }
            }
        }
        let _ = tx.unbounded_send(RealtimeEvent::Ready);
        state.listeners.push(tx);
        Ok(rx.boxed())
    }

    async fn update(&self, writes: &[(Vec<String>, Value)]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::Io("backend unavailable".into()));
        }
        state.update_count += 1;
        Self::write(&mut state, writes);
        Ok(())
    }
}
