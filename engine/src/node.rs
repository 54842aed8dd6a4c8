//! Node handles.
//!
//! A [`Node`] is a cheap, cloneable handle to one path in a [`Store`]. All
//! reads and writes go through it.

use crate::{
    change::{ChangeMode, ListenerParams},
    error::Result,
    linked::ActivationState,
    modified::DATE_MODIFIED_KEY,
    store::{ListenerOptions, NodeId, NodeKind, Store, Subscription, WriteOp},
    tracking, Error,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Handle to a node of the observable tree.
#[derive(Clone)]
pub struct Node {
    store: Store,
    id: NodeId,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.store.key() == other.store.key()
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.store.key().hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish()
    }
}

impl Node {
    pub(crate) fn new(store: Store, id: NodeId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // Navigation

    /// Child node at `key`. Repeated calls return the same node.
    pub fn child(&self, key: impl AsRef<str>) -> Node {
        let id = self
            .store
            .inner
            .lock()
            .child_id(self.id, key.as_ref())
            .unwrap_or(NodeId::DANGLING);
        Node::new(self.store.clone(), id)
    }

    /// Array element at `index`.
    pub fn index(&self, index: usize) -> Node {
        self.child(index.to_string())
    }

    /// Descendant at a relative path.
    pub fn at<I, S>(&self, path: I) -> Node
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        path.into_iter()
            .fold(self.clone(), |node, key| node.child(key))
    }

    /// Key in the parent, `None` for roots.
    pub fn key(&self) -> Option<String> {
        self.store
            .inner
            .lock()
            .entry(self.id)
            .and_then(|entry| entry.key.clone())
    }

    /// Keys from the root down to this node.
    pub fn path(&self) -> Vec<String> {
        self.store.inner.lock().path_of(self.id)
    }

    pub fn parent(&self) -> Option<Node> {
        let parent = self.store.inner.lock().entry(self.id)?.parent?;
        Some(Node::new(self.store.clone(), parent))
    }

    pub fn root(&self) -> Node {
        let root = self
            .store
            .inner
            .lock()
            .root_of(self.id)
            .unwrap_or(NodeId::DANGLING);
        Node::new(self.store.clone(), root)
    }

    /// Whether the node's tree has not been disposed.
    pub fn is_alive(&self) -> bool {
        self.store.inner.lock().entry(self.id).is_some()
    }

    // Reads

    /// Current value, recorded as a dependency of the running tracked
    /// computation. Evaluation failures are logged and read as `Null`.
    pub fn get(&self) -> Value {
        self.try_get().unwrap_or_else(|err| {
            if err != Error::NodeDisposed {
                tracing::warn!(%err, path = %self.path().join("/"), "read failed");
            }
            Value::Null
        })
    }

    /// Current value, surfacing computed evaluation errors.
    pub fn try_get(&self) -> Result<Value> {
        tracking::record(self.store.key(), self.id, false);
        self.read()
    }

    /// Like [`get`](Self::get), but only tracks the node's shape: changes
    /// deeper than its direct children do not re-run the reader.
    pub fn get_shallow(&self) -> Value {
        tracking::record(self.store.key(), self.id, true);
        self.read().unwrap_or(Value::Null)
    }

    /// Current value without recording a dependency.
    pub fn peek(&self) -> Value {
        self.read().unwrap_or(Value::Null)
    }

    /// Deserialize the current value.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.try_get()?)?)
    }

    fn read(&self) -> Result<Value> {
        self.store.prepare(self.id)?;
        self.store
            .inner
            .lock()
            .value_of(self.id)
            .ok_or(Error::NodeDisposed)
    }

    // Writes

    /// Replace the value. Setting `Null` removes the key from its parent.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.store
            .write(self.id, ChangeMode::Set, WriteOp::Set(value.into()))
    }

    /// Remove the node from its parent.
    pub fn delete(&self) -> Result<()> {
        self.store.write(self.id, ChangeMode::Delete, WriteOp::Delete)
    }

    /// Shallow-merge the keys of `value` into this object. A non-object
    /// value replaces the node.
    pub fn assign(&self, value: Value) -> Result<()> {
        match value {
            Value::Object(entries) => {
                self.store
                    .write(self.id, ChangeMode::Assign, WriteOp::Assign(entries))
            }
            other => self.set(other),
        }
    }

    /// Deep-merge `value` into the node.
    pub fn merge(&self, value: Value) -> Result<()> {
        self.store
            .write(self.id, ChangeMode::Merge, WriteOp::Merge(value))
    }

    /// Append one element to this array.
    pub fn push(&self, item: impl Into<Value>) -> Result<()> {
        self.extend([item.into()])
    }

    /// Append elements to this array as a single change.
    pub fn extend(&self, items: impl IntoIterator<Item = Value>) -> Result<()> {
        let items: Vec<Value> = items.into_iter().collect();
        self.store
            .write(self.id, ChangeMode::Set, WriteOp::Push(items))
    }

    /// Remove `delete_count` elements at `start` and insert `items` there.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Result<()> {
        let op = WriteOp::Splice {
            start,
            delete_count,
            items,
        };
        self.store.write(self.id, ChangeMode::Set, op)
    }

    /// Record a server timestamp under this item's `@` key.
    pub fn stamp_modified(&self, millis: u64) -> Result<()> {
        let stamp = self.child(DATE_MODIFIED_KEY);
        self.store.write(
            stamp.id,
            ChangeMode::DateModified,
            WriteOp::Set(Value::from(millis)),
        )
    }

    /// Make this node and its descendants read-only.
    pub fn lock(&self) {
        self.set_read_only(true);
    }

    pub fn unlock(&self) {
        self.set_read_only(false);
    }

    fn set_read_only(&self, read_only: bool) {
        if let Some(entry) = self.store.inner.lock().entry_mut(self.id) {
            entry.read_only = read_only;
        }
    }

    /// Whether this node or an ancestor is locked.
    pub fn is_locked(&self) -> bool {
        self.store.inner.lock().is_read_only(self.id)
    }

    // Listening

    /// Call `listener` after every batch that changes this node or anything
    /// below it.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ListenerParams) + Send + Sync + 'static,
    {
        self.on_change_with(ListenerOptions::default(), listener)
    }

    pub fn on_change_with<F>(&self, options: ListenerOptions, listener: F) -> Subscription
    where
        F: Fn(&ListenerParams) + Send + Sync + 'static,
    {
        if let Err(err) = self.store.prepare(self.id) {
            tracing::debug!(%err, "listener attached to node that failed to evaluate");
        }
        let id = {
            let mut inner = self.store.inner.lock();
            let id = inner.register_listener_with(|_| Arc::new(listener));
            inner.attach(id, self.id, options);
            id
        };
        Subscription::new(&self.store, id)
    }

    // Kind

    /// Activation state of a linked root, `None` for other nodes.
    pub fn activation_state(&self) -> Option<ActivationState> {
        let inner = self.store.inner.lock();
        match &inner.entry(self.id)?.kind {
            NodeKind::Linked(linked) => Some(linked.state()),
            _ => None,
        }
    }

    pub fn is_computed(&self) -> bool {
        let inner = self.store.inner.lock();
        let root = inner.root_of(self.id);
        matches!(
            root.and_then(|root| inner.entry(root)).map(|entry| &entry.kind),
            Some(NodeKind::Computed(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Origin, PathType};
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;

    fn listen(node: &Node) -> (Arc<Mutex<Vec<ListenerParams>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = node.on_change(move |params| sink.lock().push(params.clone()));
        (seen, sub)
    }

    #[test]
    fn navigation() {
        let store = Store::new();
        let root = store.observable(json!({"todos": [{"title": "a"}]}));
        let title = root.child("todos").index(0).child("title");

        assert_eq!(title.get(), json!("a"));
        assert_eq!(title.key().as_deref(), Some("title"));
        assert_eq!(title.path(), vec!["todos", "0", "title"]);
        assert_eq!(title.root(), root);
        assert_eq!(title.parent().unwrap(), root.at(["todos", "0"]));
        assert!(root.parent().is_none());
        assert!(root.key().is_none());
    }

    #[test]
    fn set_notifies_up_with_relative_paths() {
        let store = Store::new();
        let root = store.observable(json!({"a": {"b": [{"c": 1}]}}));
        let (at_root, _s1) = listen(&root);
        let (at_a, _s2) = listen(&root.child("a"));

        root.at(["a", "b", "0", "c"]).set(json!(2)).unwrap();

        let change = &at_root.lock()[0].changes[0];
        assert_eq!(change.path, vec!["a", "b", "0", "c"]);
        assert_eq!(
            change.path_types,
            vec![
                PathType::Object,
                PathType::Object,
                PathType::Array,
                PathType::Object
            ]
        );
        assert_eq!(change.prev_at_path, json!(1));
        assert_eq!(change.value_at_path, json!(2));

        {
            let change = &at_a.lock()[0].changes[0];
            assert_eq!(change.path, vec!["b", "0", "c"]);
        }
        assert_eq!(at_a.lock()[0].value, json!({"b": [{"c": 2}]}));
    }

    #[test]
    fn replacing_object_keeps_child_identity() {
        let store = Store::new();
        let root = store.observable(json!({"user": {"name": "a", "age": 1}}));
        let name = root.at(["user", "name"]);
        let age = root.at(["user", "age"]);
        let (name_seen, _s1) = listen(&name);
        let (age_seen, _s2) = listen(&age);

        root.child("user").set(json!({"name": "b", "age": 1})).unwrap();

        assert_eq!(root.at(["user", "name"]), name);
        assert_eq!(name.get(), json!("b"));
        assert_eq!(name_seen.lock().len(), 1);
        assert!(age_seen.lock().is_empty());

        root.child("user").set(json!({"age": 2})).unwrap();
        assert_eq!(name.get(), Value::Null);
        assert_eq!(name_seen.lock().len(), 2);
        assert_eq!(age_seen.lock().len(), 1);
    }

    #[test]
    fn setting_equal_value_is_silent() {
        let store = Store::new();
        let root = store.observable(json!({"a": [1, 2]}));
        let (seen, _sub) = listen(&root);
        root.child("a").set(json!([1, 2])).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn write_through_primitive_is_a_noop() {
        let store = Store::new();
        let root = store.observable(json!({"n": 5}));
        let (seen, _sub) = listen(&root);
        root.at(["n", "deep"]).set(json!(1)).unwrap();
        assert_eq!(root.peek(), json!({"n": 5}));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn missing_ancestors_are_created() {
        let store = Store::new();
        let root = store.observable(Value::Null);
        root.at(["a", "b"]).set(json!(true)).unwrap();
        assert_eq!(root.get(), json!({"a": {"b": true}}));
    }

    #[test]
    fn delete_and_set_null_remove_keys() {
        let store = Store::new();
        let root = store.observable(json!({"a": 1, "b": 2}));
        let (seen, _sub) = listen(&root);

        root.child("a").delete().unwrap();
        root.child("b").set(Value::Null).unwrap();
        assert_eq!(root.get(), json!({}));

        let seen = seen.lock();
        assert_eq!(seen[0].changes[0].mode, ChangeMode::Delete);
        assert_eq!(seen[0].changes[0].prev_at_path, json!(1));
    }

    #[test]
    fn array_mutators_emit_one_change() {
        let store = Store::new();
        let root = store.observable(json!({"list": [1, 2]}));
        let list = root.child("list");
        let (seen, _sub) = listen(&root);

        list.extend([json!(3), json!(4)]).unwrap();
        list.splice(0, 1, vec![]).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].changes.len(), 1);
        assert_eq!(seen[0].changes[0].path, vec!["list"]);
        assert_eq!(seen[0].changes[0].prev_at_path, json!([1, 2]));
        assert_eq!(seen[1].changes[0].value_at_path, json!([2, 3, 4]));
    }

    #[test]
    fn stamp_modified_reports_date_modified_mode() {
        let store = Store::new();
        let root = store.observable(json!({"t1": {"text": "a"}}));
        let (seen, _sub) = listen(&root);

        root.child("t1").stamp_modified(1_700_000_000_000).unwrap();

        assert_eq!(root.get(), json!({"t1": {"text": "a", "@": 1_700_000_000_000u64}}));
        let seen = seen.lock();
        assert_eq!(seen[0].changes[0].path, vec!["t1", "@"]);
        assert_eq!(seen[0].changes[0].mode, ChangeMode::DateModified);
    }

    #[test]
    fn assign_and_merge_modes() {
        let store = Store::new();
        let root = store.observable(json!({"a": {"x": 1}, "b": 1}));
        let (seen, _sub) = listen(&root);

        root.assign(json!({"b": 2})).unwrap();
        root.merge(json!({"a": {"y": 2}})).unwrap();
        assert_eq!(root.get(), json!({"a": {"x": 1, "y": 2}, "b": 2}));

        let seen = seen.lock();
        assert_eq!(seen[0].changes[0].mode, ChangeMode::Assign);
        assert_eq!(seen[1].changes[0].mode, ChangeMode::Merge);
    }

    #[test]
    fn locked_subtree_rejects_writes() {
        let store = Store::new();
        let root = store.observable(json!({"config": {"theme": "dark"}}));
        let config = root.child("config");
        config.lock();

        let err = config.child("theme").set(json!("light")).unwrap_err();
        assert_eq!(err, Error::ReadOnlyViolation("config/theme".into()));
        assert!(config.child("theme").is_locked());
        assert_eq!(config.child("theme").get(), json!("dark"));

        config.unlock();
        config.child("theme").set(json!("light")).unwrap();
        assert_eq!(config.child("theme").get(), json!("light"));
    }

    #[test]
    fn shallow_listener_ignores_deep_changes() {
        let store = Store::new();
        let root = store.observable(json!({"items": {"a": {"done": false}}}));
        let items = root.child("items");
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let _sub = items.on_change_with(ListenerOptions::shallow(), move |_| *sink.lock() += 1);

        items.at(["a", "done"]).set(json!(true)).unwrap();
        assert_eq!(*seen.lock(), 0);

        items.child("b").set(json!({"done": false})).unwrap();
        assert_eq!(*seen.lock(), 1);

        items.child("a").delete().unwrap();
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn get_as_deserializes() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Todo {
            title: String,
            done: bool,
        }
        let store = Store::new();
        let todo = store.observable(json!({"title": "write", "done": false}));
        let parsed: Todo = todo.get_as().unwrap();
        assert_eq!(
            parsed,
            Todo {
                title: "write".into(),
                done: false
            }
        );
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let store = Store::new();
        let root = store.observable(json!(0));
        let (seen, sub) = listen(&root);
        root.set(json!(1)).unwrap();
        sub.dispose();
        root.set(json!(2)).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].origin, Origin::Local);
    }
}
