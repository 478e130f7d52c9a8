use super::*;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

/// Owns the background workers of one component.
///
/// Shutdown happens in three phases: cancel the token, close the tracker so
/// nothing new is spawned, then wait for every spawned worker to finish.
pub struct TaskPool {
    cancel_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Spawns `task` inside a span named after the worker
    pub fn spawn<F>(&self, name: &'static str, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let span = tracing::trace_span!(parent: None, "worker", name);
        span.follows_from(tracing::Span::current());
        self.task_tracker.spawn(task.instrument(span))
    }

    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}
