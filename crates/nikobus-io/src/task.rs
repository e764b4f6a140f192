//! Handle for the long-running IO tasks.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cancellation token plus join handle of a spawned IO task.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: &'static str, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        TaskHandle { name, cancel, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        match self.task.await {
            Ok(()) => debug!(task = self.name, "task joined"),
            Err(e) => warn!(task = self.name, error = %e, "task ended abnormally"),
        }
    }
}
