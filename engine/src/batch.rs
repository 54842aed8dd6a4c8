//! Batching and deferred notification delivery.
//!
//! Writes enqueue one pending notification per listener. When the outermost
//! batch closes (or a write happens outside any batch) the queue is drained:
//! every listener is invoked once with all the changes it saw, and the drain
//! repeats while listeners cause further writes.

use crate::{
    change::{Change, ListenerParams, Origin},
    store::{ListenerId, NodeId, Store},
};
use indexmap::{map::Entry, IndexMap};
use std::collections::HashSet;

/// Defers work to a later tick of the host's event loop.
///
/// Installed with [`Store::with_scheduler`], it arms the safety timer that
/// force-closes a manual batch nobody ended.
pub trait Scheduler: Send + Sync + 'static {
    fn defer(&self, task: Box<dyn FnOnce() + Send>);
}

impl<F> Scheduler for F
where
    F: Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
{
    fn defer(&self, task: Box<dyn FnOnce() + Send>) {
        self(task)
    }
}

struct Pending {
    node: NodeId,
    changes: Vec<Change>,
}

#[derive(Default)]
pub(crate) struct BatchState {
    depth: usize,
    /// Bumped each time an outermost batch opens
    epoch: u64,
    origins: Vec<Origin>,
    pending: IndexMap<ListenerId, Pending>,
    flushing: bool,
}

impl BatchState {
    /// Origin stamped on writes made now.
    pub(crate) fn origin(&self) -> Origin {
        self.origins.last().copied().unwrap_or_default()
    }

    pub(crate) fn enqueue(&mut self, listener: ListenerId, node: NodeId, change: Change) {
        match self.pending.entry(listener) {
            Entry::Occupied(mut slot) => {
                let pending = slot.get_mut();
                pending.node = node;
                match pending.changes.iter_mut().find(|c| c.path == change.path) {
                    Some(existing) => {
                        existing.value_at_path = change.value_at_path;
                        existing.path_types = change.path_types;
                        existing.mode = change.mode;
                        existing.origin = change.origin;
                    }
                    None => pending.changes.push(change),
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    node,
                    changes: vec![change],
                });
            }
        }
    }

    pub(crate) fn forget(&mut self, listener: ListenerId) {
        self.pending.shift_remove(&listener);
    }

    pub(crate) fn forget_nodes(&mut self, released: &HashSet<NodeId>) {
        self.pending.retain(|_, pending| !released.contains(&pending.node));
    }
}

/// Open batch. Ends the batch when dropped.
#[must_use = "the batch closes as soon as the scope is dropped"]
pub struct BatchScope {
    store: Store,
    pushed_origin: bool,
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        if self.pushed_origin {
            self.store.inner.lock().batch.origins.pop();
        }
        self.store.end_batch(false);
    }
}

struct FlushGuard<'a>(&'a Store);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().batch.flushing = false;
    }
}

impl Store {
    /// Open a batch manually. Must be paired with [`Store::end_batch`].
    ///
    /// With a [`Scheduler`] installed, an outermost batch left open is
    /// force-closed on the next tick.
    pub fn begin_batch(&self) {
        let armed = {
            let mut inner = self.inner.lock();
            let epoch = Self::open(&mut inner.batch);
            epoch.zip(inner.scheduler.clone())
        };
        if let Some((epoch, scheduler)) = armed {
            let weak = self.downgrade();
            scheduler.defer(Box::new(move || {
                if let Some(store) = weak.upgrade() {
                    store.force_flush_epoch(epoch);
                }
            }));
        }
    }

    /// Close a batch. `force` closes every nesting level at once.
    pub fn end_batch(&self, force: bool) {
        let closed = {
            let mut inner = self.inner.lock();
            let batch = &mut inner.batch;
            if batch.depth == 0 {
                return;
            }
            batch.depth = if force { 0 } else { batch.depth - 1 };
            batch.depth == 0
        };
        if closed {
            self.flush();
        }
    }

    /// Open a batch that closes when the returned scope is dropped.
    pub fn batch(&self) -> BatchScope {
        Self::open(&mut self.inner.lock().batch);
        BatchScope {
            store: self.clone(),
            pushed_origin: false,
        }
    }

    /// Open a batch whose writes carry `origin`.
    pub fn batch_from(&self, origin: Origin) -> BatchScope {
        {
            let mut inner = self.inner.lock();
            Self::open(&mut inner.batch);
            inner.batch.origins.push(origin);
        }
        BatchScope {
            store: self.clone(),
            pushed_origin: true,
        }
    }

    /// Run `f` inside a batch.
    pub fn batch_with<T>(&self, f: impl FnOnce() -> T) -> T {
        let _scope = self.batch();
        f()
    }

    /// Whether a batch is open.
    pub fn in_batch(&self) -> bool {
        self.inner.lock().batch.depth > 0
    }

    /// Returns the new epoch when this opened the outermost batch.
    fn open(batch: &mut BatchState) -> Option<u64> {
        batch.depth += 1;
        if batch.depth == 1 {
            batch.epoch += 1;
            Some(batch.epoch)
        } else {
            None
        }
    }

    fn force_flush_epoch(&self, epoch: u64) {
        let stale = {
            let inner = self.inner.lock();
            inner.batch.depth > 0 && inner.batch.epoch == epoch
        };
        if stale {
            tracing::warn!(epoch, "batch was never ended, forcing flush");
            self.end_batch(true);
        }
    }

    /// Deliver pending notifications unless a batch or a drain is running.
    pub(crate) fn flush_if_idle(&self) {
        let idle = {
            let inner = self.inner.lock();
            inner.batch.depth == 0 && !inner.batch.flushing && !inner.batch.pending.is_empty()
        };
        if idle {
            self.flush();
        }
    }

    fn flush(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.batch.flushing {
                return;
            }
            inner.batch.flushing = true;
        }
        let _guard = FlushGuard(self);
        let mut rounds = 0usize;
        loop {
            let deliveries = {
                let mut inner = self.inner.lock();
                if inner.batch.pending.is_empty() {
                    break;
                }
                let pending = std::mem::take(&mut inner.batch.pending);
                pending
                    .into_iter()
                    .filter_map(|(listener, pending)| {
                        let callback = inner.callback(listener)?;
                        let value = inner.value_of(pending.node)?;
                        Some((callback, ListenerParams::new(value, pending.changes)))
                    })
                    .collect::<Vec<_>>()
            };
            rounds += 1;
            Self::deliver(deliveries);
        }
        if rounds > 1 {
            tracing::trace!(rounds, "flush drained cascading notifications");
        }
    }
}
