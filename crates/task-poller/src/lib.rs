//! Waits for asynchronous tasks to reach a terminal state.
//!
//! A [`TaskStatusSource`] reports the status of one task; the
//! [`TaskPoller`] asks it at a fixed interval until the task finishes.
//! There is no built-in timeout: the caller decides when to give up by
//! cancelling the token.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use seqxfer_protocol::TaskStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default spacing between two status lookups.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Boxed future returned by [`TaskStatusSource::task_status`].
pub type StatusFuture<'a> = Pin<Box<dyn Future<Output = Result<TaskStatus, PollError>> + Send + 'a>>;

/// Errors produced while waiting for a task.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("task {task} failed: {state}")]
    TaskFailed { task: String, state: String },

    #[error("cancelled")]
    Cancelled,

    #[error("status lookup for task {task} failed: {message}")]
    Lookup { task: String, message: String },
}

/// Something that can report the status of a task by id.
pub trait TaskStatusSource: Send + Sync {
    type TaskId: Display + Send + Sync + ?Sized;

    fn task_status<'a>(&'a self, task: &'a Self::TaskId) -> StatusFuture<'a>;
}

/// Fixed-interval wait loop.
#[derive(Debug, Clone, Copy)]
pub struct TaskPoller {
    interval: Duration,
}

impl Default for TaskPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl TaskPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Polls `task` until it finishes.
    ///
    /// The first lookup happens immediately. Returns the final status on
    /// success, [`PollError::TaskFailed`] carrying the task's state text if
    /// it finished unsuccessfully.
    pub async fn await_completion<S>(
        &self,
        source: &S,
        task: &S::TaskId,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, PollError>
    where
        S: TaskStatusSource + ?Sized,
    {
        let mut polls: u32 = 0;
        loop {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                status = source.task_status(task) => status?,
            };
            polls += 1;

            if status.finished {
                if status.success {
                    info!(task = %task, polls, "task finished");
                    return Ok(status);
                }
                warn!(task = %task, polls, state = %status.state, "task failed");
                return Err(PollError::TaskFailed {
                    task: task.to_string(),
                    state: status.state,
                });
            }

            debug!(
                task = %task,
                polls,
                running = status.running,
                state = %status.state,
                "task not finished, waiting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Waits for every task in order. Stops at the first failure.
    pub async fn await_all<'t, S, I>(
        &self,
        source: &S,
        tasks: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskStatus>, PollError>
    where
        S: TaskStatusSource + ?Sized,
        S::TaskId: 't,
        I: IntoIterator<Item = &'t S::TaskId>,
    {
        let mut finished = Vec::new();
        for task in tasks {
            finished.push(self.await_completion(source, task, cancel).await?);
        }
        Ok(finished)
    }
}
