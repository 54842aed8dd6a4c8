//! Tokio-backed scheduler for the store's batch safety timer.

use tether_engine::Scheduler;
use tokio::runtime::Handle;

/// Runs deferred store work on a Tokio runtime, after the current task
/// yields.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn defer(&self, task: Box<dyn FnOnce() + Send>) {
        self.handle.spawn(async move {
            tokio::task::yield_now().await;
            task();
        });
    }
}
