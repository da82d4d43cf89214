use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::crawler::task::Task;

/// Sleep between attempts of an emulated blocking operation
pub const QUEUE_BLOCK_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised by queue backends
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is empty")]
    Empty,

    #[error("task_done() called more times than tasks were queued")]
    TooManyDone,

    #[error("failed to encode or decode task: {0}")]
    Codec(#[from] bincode::Error),

    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Order in which queued tasks are handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    /// Newest first: fan-out children are drained before older siblings
    #[default]
    Lifo,

    /// Oldest first
    Fifo,
}

/// Ordered task store shared by the dispatcher and the workers.
///
/// `put`/`get` never wait: they fail with [`QueueError::Full`] or
/// [`QueueError::Empty`]. The blocking variants retry them every
/// [`poll_interval`](QueueBackend::poll_interval) until they succeed or the
/// timeout (or the backend's default timeout) expires. Every successful put
/// counts as outstanding until a matching [`task_done`](QueueBackend::task_done).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a task, failing fast when the queue is at capacity
    async fn put(&self, task: &Task) -> Result<(), QueueError>;

    /// Dequeue a task, failing fast when nothing is queued
    async fn get(&self) -> Result<Task, QueueError>;

    /// Number of queued tasks
    async fn size(&self) -> Result<usize, QueueError>;

    /// Capacity, if bounded
    fn max_size(&self) -> Option<usize>;

    /// Tasks put but not yet marked done
    async fn outstanding(&self) -> Result<usize, QueueError>;

    /// Mark one previously dequeued task as finished
    async fn task_done(&self) -> Result<(), QueueError>;

    /// Release any connections held by the backend
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        QUEUE_BLOCK_SLEEP_INTERVAL
    }

    /// Timeout used by blocking operations called without one
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    async fn empty(&self) -> Result<bool, QueueError> {
        Ok(self.size().await? == 0)
    }

    async fn full(&self) -> Result<bool, QueueError> {
        match self.max_size() {
            Some(max_size) => Ok(self.size().await? >= max_size),
            None => Ok(false),
        }
    }

    /// Enqueue a task, waiting for room
    async fn put_blocking(&self, task: &Task, timeout: Option<Duration>) -> Result<(), QueueError> {
        let deadline = deadline(timeout.or(self.default_timeout()));

        loop {
            match self.put(task).await {
                Err(QueueError::Full) => pause(self.poll_interval(), deadline, QueueError::Full).await?,
                result => return result,
            }
        }
    }

    /// Dequeue a task, waiting for one to arrive
    async fn get_blocking(&self, timeout: Option<Duration>) -> Result<Task, QueueError> {
        let deadline = deadline(timeout.or(self.default_timeout()));

        loop {
            match self.get().await {
                Err(QueueError::Empty) => pause(self.poll_interval(), deadline, QueueError::Empty).await?,
                result => return result,
            }
        }
    }

    /// Wait until every task put so far has been marked done
    async fn join(&self) -> Result<(), QueueError> {
        while self.outstanding().await? > 0 {
            tokio::time::sleep(self.poll_interval()).await;
        }
        Ok(())
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

/// Sleep one poll interval, clipped to the deadline; `expired` once it has passed
async fn pause(interval: Duration, deadline: Option<Instant>, expired: QueueError) -> Result<(), QueueError> {
    let nap = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(expired);
            }
            interval.min(deadline - now)
        }
        None => interval,
    };

    tokio::time::sleep(nap).await;
    Ok(())
}
