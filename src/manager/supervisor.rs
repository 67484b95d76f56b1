//! Task supervision.
//!
//! Every long-running task is a named [`Runnable`]. [`TaskGroup`] records
//! them and joins them in a fixed order: the election task, the messengers
//! newest first, then the Selector. Joining reports the first failure but
//! always waits for every task.

use crate::error::{RepMgrError, Result};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A named task handle.
#[derive(Debug)]
pub struct Runnable {
    name: String,
    handle: JoinHandle<Result<()>>,
}

impl Runnable {
    /// Spawn `fut` on the current runtime.
    pub fn spawn<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handle: tokio::spawn(fut),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task. A panic or cancellation becomes `ThreadJoin`.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(RepMgrError::ThreadJoin {
                task: self.name,
                message: if e.is_panic() {
                    "panicked".to_string()
                } else {
                    "cancelled".to_string()
                },
            }),
        }
    }
}

/// The manager's tasks, in creation order.
#[derive(Debug, Default)]
pub struct TaskGroup {
    pub(crate) selector: Option<Runnable>,
    pub(crate) messengers: Vec<Runnable>,
    pub(crate) election: Option<Runnable>,
}

impl TaskGroup {
    pub fn len(&self) -> usize {
        self.selector.iter().count() + self.messengers.len() + self.election.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join everything: election, messengers in reverse, Selector.
    ///
    /// Returns the first error while still joining the rest.
    pub async fn join_all(mut self) -> Result<()> {
        let mut ordered: Vec<Runnable> = Vec::with_capacity(self.len());
        ordered.extend(self.election.take());
        ordered.extend(self.messengers.drain(..).rev());
        ordered.extend(self.selector.take());
        join_in_order(ordered).await
    }
}

/// Join `tasks` one after another, keeping the first error.
pub async fn join_in_order(tasks: Vec<Runnable>) -> Result<()> {
    let mut first_error = None;
    for task in tasks {
        let name = task.name().to_string();
        match task.join().await {
            Ok(()) => debug!(task = %name, "Task joined"),
            Err(e) => {
                warn!(task = %name, error = %e, "Task failed");
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}
