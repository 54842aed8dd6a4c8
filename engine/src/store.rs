//! Store - the observable state container.
//!
//! The Store owns an arena of node entries addressed by generational
//! [`NodeId`]s. Only roots hold a backing value; every other node is a path
//! into its root, materialized the first time it is accessed. All mutation
//! goes through [`Store::write`], which records the change and hands it to
//! the batcher for delivery.

use crate::{
    batch::{BatchState, Scheduler},
    change::{Change, ChangeMode, ListenerParams, PathType},
    computed::ComputedState,
    error::Result,
    linked::LinkedState,
    value, Error, Node,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Handle to an arena entry. Stale handles never resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// A handle that never resolves to a live entry.
    pub(crate) const DANGLING: NodeId = NodeId {
        index: u32::MAX,
        generation: 0,
    };
}

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Change callback.
pub type ListenerFn = dyn Fn(&ListenerParams) + Send + Sync;

/// Options for [`Node::on_change_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Only fire when the node itself is replaced or a direct child is
    /// added or removed
    pub shallow: bool,
    /// Fire at the write instead of at the end of the enclosing batch
    pub immediate: bool,
}

impl ListenerOptions {
    pub fn shallow() -> Self {
        Self {
            shallow: true,
            immediate: false,
        }
    }

    pub fn immediate() -> Self {
        Self {
            shallow: false,
            immediate: true,
        }
    }

    fn accepts(&self, change: &Change) -> bool {
        if !self.shallow {
            return true;
        }
        match change.path.len() {
            0 => true,
            1 => {
                change.mode == ChangeMode::Delete
                    || change.prev_at_path.is_null()
                    || change.value_at_path.is_null()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ListenerSlot {
    pub(crate) id: ListenerId,
    pub(crate) options: ListenerOptions,
}

/// What backs a root.
pub(crate) enum NodeKind {
    Plain,
    Computed(ComputedState),
    Linked(LinkedState),
}

pub(crate) struct Entry {
    pub(crate) key: Option<String>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) root: NodeId,
    pub(crate) children: HashMap<String, NodeId>,
    pub(crate) listeners: Vec<ListenerSlot>,
    pub(crate) read_only: bool,
    /// Meaningful on roots only
    pub(crate) kind: NodeKind,
    /// Meaningful on roots only
    pub(crate) value: Value,
}

impl Entry {
    fn root(id: NodeId, value: Value, kind: NodeKind) -> Self {
        Self {
            key: None,
            parent: None,
            root: id,
            children: HashMap::new(),
            listeners: Vec::new(),
            read_only: false,
            kind,
            value,
        }
    }

    fn child(key: String, parent: NodeId, root: NodeId) -> Self {
        Self {
            key: Some(key),
            parent: Some(parent),
            root,
            children: HashMap::new(),
            listeners: Vec::new(),
            read_only: false,
            kind: NodeKind::Plain,
            value: Value::Null,
        }
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Registered {
    callback: Arc<ListenerFn>,
    nodes: Vec<NodeId>,
}

/// A mutation applied at one node.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Set(Value),
    Assign(Map<String, Value>),
    Merge(Value),
    Delete,
    Push(Vec<Value>),
    Splice {
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    },
}

impl WriteOp {
    /// Apply the operation at `path` inside `root`.
    ///
    /// Returns the previous and new value at `path`, or `None` when the path
    /// is blocked by a primitive or the target has the wrong shape.
    pub(crate) fn apply(self, root: &mut Value, path: &[String]) -> Option<(Value, Value)> {
        if !value::can_write(root, path) {
            return None;
        }
        let prev = value::value_at(root, path);
        match self {
            WriteOp::Set(next) => {
                if next == prev {
                    return Some((prev, next));
                }
                value::set_at(root, path, None, next);
            }
            WriteOp::Assign(entries) => {
                let slot = value::slot_mut(root, path, None)?;
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(map) = slot {
                    map.extend(entries);
                }
            }
            WriteOp::Merge(incoming) => {
                let slot = value::slot_mut(root, path, None)?;
                value::deep_merge(slot, incoming);
            }
            WriteOp::Delete => {
                if value::get_at(root, path).is_none() {
                    return Some((prev, Value::Null));
                }
                value::remove_at(root, path);
            }
            WriteOp::Push(items) => {
                let slot = value::slot_mut(root, path, None)?;
                if slot.is_null() {
                    *slot = Value::Array(Vec::new());
                }
                let Value::Array(array) = slot else {
                    return None;
                };
                array.extend(items);
            }
            WriteOp::Splice {
                start,
                delete_count,
                items,
            } => {
                let slot = value::slot_mut(root, path, None)?;
                if slot.is_null() {
                    *slot = Value::Array(Vec::new());
                }
                let Value::Array(array) = slot else {
                    return None;
                };
                let start = start.min(array.len());
                let end = start.saturating_add(delete_count).min(array.len());
                array.splice(start..end, items);
            }
        }
        Some((prev, value::value_at(root, path)))
    }
}

pub(crate) type Deliveries = Vec<(Arc<ListenerFn>, ListenerParams)>;

/// Arena state guarded by the store's mutex.
pub(crate) struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    listeners: HashMap<ListenerId, Registered>,
    next_listener: u64,
    live: usize,
    pub(crate) batch: BatchState,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            live: 0,
            batch: BatchState::default(),
            scheduler: None,
        }
    }

    pub(crate) fn alloc(&mut self, make: impl FnOnce(NodeId) -> Entry) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let id = NodeId {
                index,
                generation: slot.generation,
            };
            slot.entry = Some(make(id));
            return id;
        }
        let id = NodeId {
            index: self.slots.len() as u32,
            generation: 0,
        };
        self.slots.push(Slot {
            generation: 0,
            entry: Some(make(id)),
        });
        id
    }

    fn release(&mut self, id: NodeId) -> Option<Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    pub(crate) fn entry(&self, id: NodeId) -> Option<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn entry_mut(&mut self, id: NodeId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn root_of(&self, id: NodeId) -> Option<NodeId> {
        self.entry(id).map(|entry| entry.root)
    }

    pub(crate) fn kind_mut(&mut self, root: NodeId) -> Option<&mut NodeKind> {
        self.entry_mut(root).map(|entry| &mut entry.kind)
    }

    /// Keys from the root down to `id`.
    pub(crate) fn path_of(&self, id: NodeId) -> Vec<String> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.entry(id);
        while let Some(entry) = current {
            let Some(key) = &entry.key else { break };
            path.push(key.clone());
            let Some(parent) = entry.parent else { break };
            if !visited.insert(parent) {
                break;
            }
            current = self.entry(parent);
        }
        path.reverse();
        path
    }

    pub(crate) fn value_of(&self, id: NodeId) -> Option<Value> {
        let root = self.entry(self.root_of(id)?)?;
        Some(value::value_at(&root.value, &self.path_of(id)))
    }

    pub(crate) fn child_id(&mut self, parent: NodeId, key: &str) -> Option<NodeId> {
        let entry = self.entry(parent)?;
        if let Some(existing) = entry.children.get(key) {
            return Some(*existing);
        }
        let root = entry.root;
        let id = self.alloc(|_| Entry::child(key.to_string(), parent, root));
        self.entry_mut(parent)?.children.insert(key.to_string(), id);
        Some(id)
    }

    pub(crate) fn create_root(&mut self, value: Value, kind: NodeKind) -> NodeId {
        self.alloc(|id| Entry::root(id, value, kind))
    }

    /// Whether `id` or any ancestor is read-only.
    pub(crate) fn is_read_only(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        let mut visited = HashSet::new();
        while let Some(node) = current {
            if !visited.insert(node) {
                break;
            }
            let Some(entry) = self.entry(node) else { break };
            if entry.read_only {
                return true;
            }
            current = entry.parent;
        }
        false
    }

    /// Whether any node in the tree under `id` has listeners.
    pub(crate) fn has_listeners(&self, id: NodeId) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        !entry.listeners.is_empty()
            || entry.children.values().any(|child| self.has_listeners(*child))
    }

    // ---------------------------------------------------------------------
    // Listener registry
    // ---------------------------------------------------------------------

    pub(crate) fn register_listener_with(
        &mut self,
        make: impl FnOnce(ListenerId) -> Arc<ListenerFn>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(
            id,
            Registered {
                callback: make(id),
                nodes: Vec::new(),
            },
        );
        id
    }

    pub(crate) fn attach(&mut self, id: ListenerId, node: NodeId, options: ListenerOptions) {
        let Some(registered) = self.listeners.get_mut(&id) else {
            return;
        };
        let Some(entry) = self
            .slots
            .get_mut(node.index as usize)
            .filter(|slot| slot.generation == node.generation)
            .and_then(|slot| slot.entry.as_mut())
        else {
            return;
        };
        entry.listeners.push(ListenerSlot { id, options });
        registered.nodes.push(node);
    }

    fn detach_all(&mut self, id: ListenerId) {
        let nodes = match self.listeners.get_mut(&id) {
            Some(registered) => std::mem::take(&mut registered.nodes),
            None => return,
        };
        for node in nodes {
            if let Some(entry) = self.entry_mut(node) {
                entry.listeners.retain(|slot| slot.id != id);
            }
        }
    }

    /// Replace the set of nodes a listener is attached to.
    pub(crate) fn resubscribe(&mut self, id: ListenerId, nodes: &[(NodeId, bool)]) {
        self.detach_all(id);
        for (node, shallow) in nodes {
            let options = ListenerOptions {
                shallow: *shallow,
                immediate: false,
            };
            self.attach(id, *node, options);
        }
    }

    pub(crate) fn unregister(&mut self, id: ListenerId) {
        self.detach_all(id);
        self.listeners.remove(&id);
        self.batch.forget(id);
    }

    pub(crate) fn callback(&self, id: ListenerId) -> Option<Arc<ListenerFn>> {
        self.listeners.get(&id).map(|r| Arc::clone(&r.callback))
    }

    // ---------------------------------------------------------------------
    // Notification fan-out
    // ---------------------------------------------------------------------

    /// Route a change at `id` to listeners on the node, its ancestors and
    /// the materialized descendants whose value changed.
    ///
    /// Batched listeners are queued; immediate ones are returned for the
    /// caller to invoke once the lock is released.
    pub(crate) fn collect(
        &mut self,
        id: NodeId,
        path: &[String],
        types: &[PathType],
        change: Change,
    ) -> Deliveries {
        let mut immediate = Vec::new();

        let mut visited = HashSet::new();
        let mut current = Some(id);
        let mut depth = path.len();
        while let Some(node) = current {
            if !visited.insert(node) {
                tracing::warn!(?node, "cycle in parent chain, stopping propagation");
                break;
            }
            let Some(entry) = self.entry(node) else { break };
            let slots = entry.listeners.clone();
            let parent = entry.parent;
            if !slots.is_empty() {
                let relative = Change {
                    path: path[depth..].to_vec(),
                    path_types: types[depth..].to_vec(),
                    ..change.clone()
                };
                for slot in slots {
                    self.dispatch(slot, node, relative.clone(), &mut immediate);
                }
            }
            current = parent;
            depth = depth.saturating_sub(1);
        }

        let (prev, next) = (change.prev_at_path.clone(), change.value_at_path.clone());
        self.collect_descendants(id, &prev, &next, &change, &mut immediate);
        immediate
    }

    fn collect_descendants(
        &mut self,
        id: NodeId,
        prev: &Value,
        next: &Value,
        change: &Change,
        immediate: &mut Deliveries,
    ) {
        let children: Vec<(String, NodeId)> = match self.entry(id) {
            Some(entry) => entry
                .children
                .iter()
                .map(|(key, child)| (key.clone(), *child))
                .collect(),
            None => return,
        };
        for (key, child) in children {
            let old = value::child(prev, &key).cloned().unwrap_or(Value::Null);
            let new = value::child(next, &key).cloned().unwrap_or(Value::Null);
            if old == new {
                continue;
            }
            let slots = self
                .entry(child)
                .map(|entry| entry.listeners.clone())
                .unwrap_or_default();
            for slot in slots {
                let local = Change::new(new.clone(), old.clone(), change.mode, change.origin);
                self.dispatch(slot, child, local, immediate);
            }
            self.collect_descendants(child, &old, &new, change, immediate);
        }
    }

    fn dispatch(
        &mut self,
        slot: ListenerSlot,
        node: NodeId,
        change: Change,
        immediate: &mut Deliveries,
    ) {
        if !slot.options.accepts(&change) {
            return;
        }
        if slot.options.immediate {
            if let (Some(callback), Some(value)) = (self.callback(slot.id), self.value_of(node)) {
                immediate.push((callback, ListenerParams::new(value, vec![change])));
            }
        } else {
            self.batch.enqueue(slot.id, node, change);
        }
    }
}

/// Non-owning store handle held by internal callbacks.
#[derive(Clone)]
pub(crate) struct WeakStore(Weak<Mutex<Inner>>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

/// The observable state container.
///
/// Cloning a `Store` yields another handle to the same arena.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Mutex<Inner>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Create a store whose manual batches are force-flushed by `scheduler`
    /// if they are never closed.
    pub fn with_scheduler(scheduler: impl Scheduler) -> Self {
        let store = Self::new();
        store.set_scheduler(scheduler);
        store
    }

    /// Install the scheduler used for the batch safety timer.
    pub fn set_scheduler(&self, scheduler: impl Scheduler) {
        self.inner.lock().scheduler = Some(Arc::new(scheduler));
    }

    /// Create a new root holding `initial`.
    pub fn observable(&self, initial: Value) -> Node {
        let id = self.inner.lock().create_root(initial, NodeKind::Plain);
        Node::new(self.clone(), id)
    }

    /// Handle for an existing id. The handle may be stale.
    pub fn node(&self, id: NodeId) -> Node {
        Node::new(self.clone(), id)
    }

    /// Number of live arena entries.
    pub fn node_count(&self) -> usize {
        self.inner.lock().live
    }

    /// Free the whole tree `node` belongs to.
    ///
    /// Handles into the tree become inert: reads return `Null` and writes
    /// are ignored.
    pub fn dispose(&self, node: &Node) {
        let mut inner = self.inner.lock();
        let Some(root) = inner.root_of(node.id()) else {
            return;
        };
        let mut stack = vec![root];
        let mut released = HashSet::new();
        while let Some(id) = stack.pop() {
            let Some(entry) = inner.release(id) else {
                continue;
            };
            released.insert(id);
            stack.extend(entry.children.values().copied());
            for slot in &entry.listeners {
                if let Some(registered) = inner.listeners.get_mut(&slot.id) {
                    registered.nodes.retain(|n| *n != id);
                }
            }
            let internal = match &entry.kind {
                NodeKind::Computed(state) => state.dependency_listener,
                NodeKind::Linked(state) => state.set_listener,
                NodeKind::Plain => None,
            };
            if let Some(listener) = internal {
                inner.unregister(listener);
            }
        }
        inner.batch.forget_nodes(&released);
        tracing::debug!(released = released.len(), "disposed observable tree");
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    /// Bring a computed up to date or start a linked node's activation.
    pub(crate) fn prepare(&self, id: NodeId) -> Result<()> {
        enum Prepare {
            Computed(NodeId),
            Linked(NodeId),
        }
        let action = {
            let inner = self.inner.lock();
            let root = inner.root_of(id).ok_or(Error::NodeDisposed)?;
            match inner.entry(root).map(|entry| &entry.kind) {
                Some(NodeKind::Computed(_)) => Prepare::Computed(root),
                Some(NodeKind::Linked(_)) => Prepare::Linked(root),
                _ => return Ok(()),
            }
        };
        match action {
            Prepare::Computed(root) => self.refresh_computed(root),
            Prepare::Linked(root) => {
                self.activate_linked(root);
                Ok(())
            }
        }
    }

    /// Apply a write at `id` and notify.
    pub(crate) fn write(&self, id: NodeId, mode: ChangeMode, op: WriteOp) -> Result<()> {
        enum Target {
            Plain,
            Computed(NodeId, Vec<String>),
        }
        let target = {
            let inner = self.inner.lock();
            let Some(root) = inner.root_of(id) else {
                return Ok(());
            };
            if inner.is_read_only(id) {
                return Err(Error::read_only(&inner.path_of(id)));
            }
            match inner.entry(root).map(|entry| &entry.kind) {
                Some(NodeKind::Computed(_)) => Target::Computed(root, inner.path_of(id)),
                _ => Target::Plain,
            }
        };
        match target {
            Target::Plain => {
                self.write_plain(id, mode, op);
                Ok(())
            }
            Target::Computed(root, path) => self.write_computed(root, &path, op),
        }
    }

    pub(crate) fn write_plain(&self, id: NodeId, mode: ChangeMode, op: WriteOp) {
        let immediate = {
            let mut inner = self.inner.lock();
            let Some(root) = inner.root_of(id) else {
                return;
            };
            let path = inner.path_of(id);
            let origin = inner.batch.origin();
            let Some(entry) = inner.entry_mut(root) else {
                return;
            };
            let Some((prev, next)) = op.apply(&mut entry.value, &path) else {
                tracing::trace!(path = %path.join("/"), "write blocked by an unreachable path");
                return;
            };
            if prev == next {
                return;
            }
            let types = value::path_types(&entry.value, &path);
            let change = Change::new(next, prev, mode, origin);
            inner.collect(id, &path, &types, change)
        };
        Self::deliver(immediate);
        self.flush_if_idle();
    }

    /// Notify listeners that a root's value was replaced wholesale.
    pub(crate) fn notify_root(&self, root: NodeId, prev: Value, next: Value, mode: ChangeMode) {
        let immediate = {
            let mut inner = self.inner.lock();
            let origin = inner.batch.origin();
            inner.collect(root, &[], &[], Change::new(next, prev, mode, origin))
        };
        Self::deliver(immediate);
        self.flush_if_idle();
    }

    pub(crate) fn deliver(deliveries: Deliveries) {
        for (callback, params) in deliveries {
            callback(&params);
        }
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    store: WeakStore,
    id: Option<ListenerId>,
}

impl Subscription {
    pub(crate) fn new(store: &Store, id: ListenerId) -> Self {
        Self {
            store: store.downgrade(),
            id: Some(id),
        }
    }

    /// Unsubscribe now.
    pub fn dispose(mut self) {
        self.release();
    }

    /// Keep the listener registered for the lifetime of the store.
    pub fn detach(mut self) {
        self.id = None;
    }

    fn release(&mut self) {
        if let (Some(id), Some(store)) = (self.id.take(), self.store.upgrade()) {
            store.inner.lock().unregister(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
