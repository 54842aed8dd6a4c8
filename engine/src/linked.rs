//! Lazily activated nodes fed by an external source.
//!
//! A linked node stays [`ActivationState::Inactive`] until something reads
//! or listens to it. Its [`Activator`] then receives an
//! [`ActivationContext`] used to resolve the initial value and push later
//! updates. Local writes to the node are handed back to the activator.

use crate::{
    change::{ChangeMode, ListenerParams, Origin},
    store::{ListenerId, NodeId, NodeKind, Store, WeakStore, WriteOp},
    Node,
};
use serde_json::Value;
use std::sync::Arc;

/// Source behind a linked node.
pub trait Activator: Send + Sync + 'static {
    /// Called once, on first access.
    fn activate(&self, ctx: ActivationContext);

    /// Called after a batch containing local writes to the node.
    fn on_set(&self, _params: &ListenerParams) {}
}

impl<F> Activator for F
where
    F: Fn(ActivationContext) + Send + Sync + 'static,
{
    fn activate(&self, ctx: ActivationContext) {
        self(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Inactive,
    /// Activated, waiting for the initial value
    Activating,
    Active,
}

pub(crate) struct LinkedState {
    activator: Arc<dyn Activator>,
    state: ActivationState,
    queued: Vec<Value>,
    pub(crate) set_listener: Option<ListenerId>,
}

impl LinkedState {
    pub(crate) fn state(&self) -> ActivationState {
        self.state
    }
}

/// Handle given to an [`Activator`]. Cheap to clone and safe to move into
/// async tasks.
#[derive(Clone)]
pub struct ActivationContext {
    store: WeakStore,
    node: NodeId,
}

impl ActivationContext {
    /// Set the initial value and apply any updates queued before it.
    ///
    /// On an already active node this behaves like [`update`](Self::update).
    pub fn resolve(&self, value: Value) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let queued = {
            let mut inner = store.inner.lock();
            match inner.kind_mut(self.node) {
                Some(NodeKind::Linked(linked)) => {
                    linked.state = ActivationState::Active;
                    std::mem::take(&mut linked.queued)
                }
                _ => return,
            }
        };
        let _scope = store.batch_from(Origin::Remote);
        store.write_plain(self.node, ChangeMode::Set, WriteOp::Set(value));
        for value in queued {
            store.write_plain(self.node, ChangeMode::Set, WriteOp::Set(value));
        }
    }

    /// Push a new value from the source.
    ///
    /// Updates that arrive before [`resolve`](Self::resolve) are queued.
    pub fn update(&self, value: Value) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        {
            let mut inner = store.inner.lock();
            match inner.kind_mut(self.node) {
                Some(NodeKind::Linked(linked)) if linked.state == ActivationState::Active => {}
                Some(NodeKind::Linked(linked)) => {
                    linked.queued.push(value);
                    return;
                }
                _ => return,
            }
        }
        let _scope = store.batch_from(Origin::Remote);
        store.write_plain(self.node, ChangeMode::Set, WriteOp::Set(value));
    }

    /// The linked node, if its store is still alive.
    pub fn node(&self) -> Option<Node> {
        self.store.upgrade().map(|store| store.node(self.node))
    }

    pub fn is_active(&self) -> bool {
        self.store.upgrade().is_some_and(|store| {
            matches!(
                store.inner.lock().entry(self.node).map(|e| &e.kind),
                Some(NodeKind::Linked(linked)) if linked.state == ActivationState::Active
            )
        })
    }
}

impl Store {
    /// Create a node whose value is provided by `activator`.
    pub fn linked(&self, activator: impl Activator) -> Node {
        let activator: Arc<dyn Activator> = Arc::new(activator);
        let mut inner = self.inner.lock();
        let state = LinkedState {
            activator: Arc::clone(&activator),
            state: ActivationState::Inactive,
            queued: Vec::new(),
            set_listener: None,
        };
        let root = inner.create_root(Value::Null, NodeKind::Linked(state));
        let listener = inner.register_listener_with(|_| {
            Arc::new(move |params: &ListenerParams| {
                let local: Vec<_> = params.changes_from(Origin::Local).cloned().collect();
                if !local.is_empty() {
                    activator.on_set(&ListenerParams::new(params.value.clone(), local));
                }
            })
        });
        inner.attach(listener, root, Default::default());
        if let Some(NodeKind::Linked(state)) = inner.kind_mut(root) {
            state.set_listener = Some(listener);
        }
        drop(inner);
        Node::new(self.clone(), root)
    }

    pub(crate) fn activate_linked(&self, root: NodeId) {
        let activator = {
            let mut inner = self.inner.lock();
            match inner.kind_mut(root) {
                Some(NodeKind::Linked(linked)) if linked.state == ActivationState::Inactive => {
                    linked.state = ActivationState::Activating;
                    Arc::clone(&linked.activator)
                }
                _ => return,
            }
        };
        tracing::debug!(?root, "activating linked node");
        activator.activate(ActivationContext {
            store: self.downgrade(),
            node: root,
        });
    }
}
