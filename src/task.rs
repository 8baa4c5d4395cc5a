//! Named fire-and-forget tasks

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::CacheError;

/// Spawn a task nobody awaits. A failure is logged under `name` instead of
/// disappearing with the task.
pub fn spawn_detached<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), CacheError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Detached cache task failed");
        }
    })
}
