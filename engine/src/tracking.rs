//! Dependency tracking for computed values and effects.
//!
//! While a tracked closure runs, every [`Node`] read through `get` or
//! `get_shallow` is recorded in a per-thread frame. Frames nest, so a computed
//! evaluated inside another tracked closure records into its own frame only.

use crate::{Node, NodeId};
use indexmap::IndexMap;
use std::cell::RefCell;

/// A node read during a tracked computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub node: Node,
    /// Whether only the node's identity/shape was read
    pub shallow: bool,
}

/// Result of [`Store::track`](crate::Store::track).
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    pub value: T,
    /// Deduplicated dependencies in first-read order
    pub dependencies: Vec<Dependency>,
}

struct Frame {
    store: usize,
    enabled: bool,
    deps: IndexMap<NodeId, bool>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops the frame it pushed, even when the tracked closure panics.
struct FrameGuard {
    popped: bool,
}

impl FrameGuard {
    fn push(store: usize, enabled: bool) -> Self {
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                store,
                enabled,
                deps: IndexMap::new(),
            })
        });
        Self { popped: false }
    }

    fn finish(mut self) -> Vec<(NodeId, bool)> {
        self.popped = true;
        FRAMES
            .with(|frames| frames.borrow_mut().pop())
            .map(|frame| frame.deps.into_iter().collect())
            .unwrap_or_default()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.popped {
            FRAMES.with(|frames| frames.borrow_mut().pop());
        }
    }
}

/// Record a read of `node` in the innermost frame of the same store.
pub(crate) fn record(store: usize, node: NodeId, shallow: bool) {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        if let Some(frame) = frames.last_mut() {
            if frame.enabled && frame.store == store {
                let entry = frame.deps.entry(node).or_insert(shallow);
                // A deep read anywhere makes the dependency deep.
                *entry = *entry && shallow;
            }
        }
    });
}

/// Run `f` in a fresh frame and return what it read.
pub(crate) fn run_tracked<T>(store: usize, f: impl FnOnce() -> T) -> (T, Vec<(NodeId, bool)>) {
    let guard = FrameGuard::push(store, true);
    let value = f();
    (value, guard.finish())
}

/// Run `f` without recording any reads into the enclosing frame.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    let guard = FrameGuard::push(0, false);
    let value = f();
    guard.finish();
    value
}

/// Whether a tracked computation is running on this thread.
pub fn is_tracking() -> bool {
    FRAMES.with(|frames| frames.borrow().last().is_some_and(|f| f.enabled))
}

#[cfg(test)]
mod tests {
    use crate::Store;
    use serde_json::json;

    #[test]
    fn track_records_reads_once() {
        let store = Store::new();
        let state = store.observable(json!({"a": 1, "b": 2}));
        let a = state.child("a");
        let b = state.child("b");

        let tracked = store.track(|| {
            let first = a.get();
            let again = a.get();
            let other = b.get_shallow();
            (first, again, other)
        });

        assert_eq!(tracked.value, (json!(1), json!(1), json!(2)));
        assert_eq!(tracked.dependencies.len(), 2);
        assert_eq!(tracked.dependencies[0].node, a);
        assert!(!tracked.dependencies[0].shallow);
        assert!(tracked.dependencies[1].shallow);
    }

    #[test]
    fn deep_read_overrides_shallow() {
        let store = Store::new();
        let list = store.observable(json!([1, 2]));
        let tracked = store.track(|| {
            list.get_shallow();
            list.get()
        });
        assert_eq!(tracked.dependencies.len(), 1);
        assert!(!tracked.dependencies[0].shallow);
    }

    #[test]
    fn peek_and_untracked_are_invisible() {
        let store = Store::new();
        let state = store.observable(json!(5));
        let tracked = store.track(|| {
            state.peek();
            super::untracked(|| state.get());
            super::is_tracking()
        });
        assert!(tracked.value);
        assert!(tracked.dependencies.is_empty());
        assert!(!super::is_tracking());
    }

    #[test]
    fn frames_are_scoped_per_store() {
        let first = Store::new();
        let second = Store::new();
        let foreign = second.observable(json!(1));
        let tracked = first.track(|| foreign.get());
        assert!(tracked.dependencies.is_empty());
    }
}
