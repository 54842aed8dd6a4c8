//! Computed values, effects and ad-hoc tracking.
//!
//! A computed node caches the result of an evaluator. All of its
//! dependencies share one internal listener, so any number of dependency
//! writes in a batch mark it stale exactly once. Unobserved computeds stay
//! lazy; observed ones re-evaluate when the batch flushes and notify their
//! own listeners in the next drain round.

use crate::{
    change::ChangeMode,
    error::Result,
    store::{ListenerId, NodeId, NodeKind, Store, Subscription, WriteOp},
    tracking::{self, Dependency, Tracked},
    Error, Node,
};
use serde_json::Value;
use std::sync::Arc;

type ComputeFn = dyn Fn() -> Result<Value> + Send + Sync;
type SetterFn = dyn Fn(Value) -> Result<()> + Send + Sync;
type EffectFn = dyn Fn() + Send + Sync;

pub(crate) struct ComputedState {
    compute: Arc<ComputeFn>,
    setter: Option<Arc<SetterFn>>,
    stale: bool,
    evaluated: bool,
    evaluating: bool,
    pub(crate) dependency_listener: Option<ListenerId>,
}

impl Store {
    /// Create a read-only node derived from other nodes.
    ///
    /// The evaluator runs lazily on first read and again whenever a node it
    /// read changes.
    pub fn computed<F>(&self, compute: F) -> Node
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.create_computed(Arc::new(move || Ok(compute())), None)
    }

    /// Like [`Store::computed`] with a fallible evaluator.
    pub fn try_computed<F>(&self, compute: F) -> Node
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.create_computed(Arc::new(compute), None)
    }

    /// Create a two-way computed. Writes to the node are handed to `setter`,
    /// which is expected to update the dependencies.
    pub fn computed_with_setter<F, S>(&self, compute: F, setter: S) -> Node
    where
        F: Fn() -> Value + Send + Sync + 'static,
        S: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        self.create_computed(Arc::new(move || Ok(compute())), Some(Arc::new(setter)))
    }

    fn create_computed(&self, compute: Arc<ComputeFn>, setter: Option<Arc<SetterFn>>) -> Node {
        let weak = self.downgrade();
        let mut inner = self.inner.lock();
        let state = ComputedState {
            compute,
            setter,
            stale: true,
            evaluated: false,
            evaluating: false,
            dependency_listener: None,
        };
        let root = inner.create_root(Value::Null, NodeKind::Computed(state));
        let listener = inner.register_listener_with(|_| {
            Arc::new(move |_| {
                if let Some(store) = weak.upgrade() {
                    store.on_dependency_changed(root);
                }
            })
        });
        if let Some(NodeKind::Computed(state)) = inner.kind_mut(root) {
            state.dependency_listener = Some(listener);
        }
        drop(inner);
        Node::new(self.clone(), root)
    }

    /// Re-evaluate a stale computed and resubscribe to what it read.
    pub(crate) fn refresh_computed(&self, root: NodeId) -> Result<()> {
        let compute = {
            let mut inner = self.inner.lock();
            match inner.kind_mut(root) {
                Some(NodeKind::Computed(state)) if state.stale && !state.evaluating => {
                    state.evaluating = true;
                    Arc::clone(&state.compute)
                }
                _ => return Ok(()),
            }
        };

        let (result, reads) = tracking::run_tracked(self.key(), || compute());

        let mut inner = self.inner.lock();
        let dependencies: Vec<(NodeId, bool)> = reads
            .into_iter()
            .filter(|(node, _)| inner.root_of(*node) != Some(root))
            .collect();
        let Some(entry) = inner.entry_mut(root) else {
            return Ok(());
        };
        let NodeKind::Computed(state) = &mut entry.kind else {
            return Ok(());
        };
        state.evaluating = false;
        let listener = state.dependency_listener;
        let outcome = match result {
            Ok(next) => {
                state.stale = false;
                let first = !state.evaluated;
                state.evaluated = true;
                let prev = std::mem::replace(&mut entry.value, next.clone());
                Ok((!first && prev != next).then_some((prev, next)))
            }
            Err(err) => Err(err),
        };
        if let Some(listener) = listener {
            inner.resubscribe(listener, &dependencies);
        }
        drop(inner);

        match outcome {
            Ok(Some((prev, next))) => {
                self.notify_root(root, prev, next, ChangeMode::Set);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::debug!(%err, "computed evaluation failed, staying stale");
                Err(err)
            }
        }
    }

    fn on_dependency_changed(&self, root: NodeId) {
        let eager = {
            let mut inner = self.inner.lock();
            match inner.kind_mut(root) {
                Some(NodeKind::Computed(state)) => state.stale = true,
                _ => return,
            }
            inner.has_listeners(root)
        };
        if eager {
            if let Err(err) = self.refresh_computed(root) {
                tracing::warn!(%err, "computed re-evaluation failed");
            }
        }
    }

    pub(crate) fn write_computed(&self, root: NodeId, path: &[String], op: WriteOp) -> Result<()> {
        let setter = {
            let inner = self.inner.lock();
            match inner.entry(root).map(|entry| &entry.kind) {
                Some(NodeKind::Computed(state)) => state.setter.clone(),
                _ => None,
            }
        };
        let Some(setter) = setter else {
            return Err(Error::read_only(path));
        };
        self.refresh_computed(root)?;
        let mut next = {
            let inner = self.inner.lock();
            inner
                .entry(root)
                .map(|entry| entry.value.clone())
                .unwrap_or_default()
        };
        if op.apply(&mut next, path).is_none() {
            return Ok(());
        }
        self.batch_with(|| setter(next))
    }

    /// Run `effect` now and again after every batch that changes a node it
    /// read. The effect stops when the subscription is dropped.
    pub fn observe<F>(&self, effect: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect: Arc<EffectFn> = Arc::new(effect);
        let weak = self.downgrade();
        let id = {
            let mut inner = self.inner.lock();
            let effect = Arc::clone(&effect);
            inner.register_listener_with(move |id| {
                Arc::new(move |_| {
                    if let Some(store) = weak.upgrade() {
                        store.run_effect(id, &effect);
                    }
                })
            })
        };
        self.run_effect(id, &effect);
        Subscription::new(self, id)
    }

    fn run_effect(&self, id: ListenerId, effect: &Arc<EffectFn>) {
        let ((), reads) = tracking::run_tracked(self.key(), || effect());
        self.inner.lock().resubscribe(id, &reads);
    }

    /// Run `f` and report every node it read.
    pub fn track<T>(&self, f: impl FnOnce() -> T) -> Tracked<T> {
        let (value, reads) = tracking::run_tracked(self.key(), f);
        let dependencies = reads
            .into_iter()
            .map(|(id, shallow)| Dependency {
                node: self.node(id),
                shallow,
            })
            .collect();
        Tracked {
            value,
            dependencies,
        }
    }
}
