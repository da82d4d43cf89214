use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crawler::task::Task;
use crate::storage::queue::{QueueBackend, QueueError, QueueOrder, QUEUE_BLOCK_SLEEP_INTERVAL};

/// End of a remote list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

/// Remote ordered list holding encoded tasks, plus its outstanding counter.
///
/// Implementations must make `push` (append + counter increment) and `pop`
/// atomic on the remote side; several processes share one list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Append a payload at the tail and count it as outstanding
    async fn push(&self, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Remove and return the payload at one end
    async fn pop(&self, end: ListEnd) -> Result<Option<Vec<u8>>, QueueError>;

    /// Number of payloads in the list
    async fn len(&self) -> Result<usize, QueueError>;

    /// Current outstanding counter
    async fn outstanding(&self) -> Result<i64, QueueError>;

    /// Decrement the outstanding counter, returning the new value
    async fn task_done(&self) -> Result<i64, QueueError>;

    /// Drop any open connections
    async fn close(&self) -> Result<(), QueueError>;
}

/// Queue backend storing encoded tasks in a [`ListStore`].
///
/// Blocking operations are emulated by polling the store.
pub struct DurableQueue<S> {
    store: S,
    order: QueueOrder,
    max_size: Option<usize>,
    poll_interval: Duration,
    default_timeout: Option<Duration>,
}

impl<S: ListStore> DurableQueue<S> {
    pub fn new(store: S, order: QueueOrder) -> Self {
        Self {
            store,
            order,
            max_size: None,
            poll_interval: QUEUE_BLOCK_SLEEP_INTERVAL,
            default_timeout: None,
        }
    }

    /// Bound the queue (`0` means unbounded)
    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size.filter(|size| *size > 0);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Timeout for blocking calls that don't pass one
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn pop_end(&self) -> ListEnd {
        match self.order {
            QueueOrder::Lifo => ListEnd::Tail,
            QueueOrder::Fifo => ListEnd::Head,
        }
    }
}

#[async_trait]
impl<S: ListStore> QueueBackend for DurableQueue<S> {
    async fn put(&self, task: &Task) -> Result<(), QueueError> {
        // Size check and push are separate round trips, so the bound is best effort across processes
        if self.full().await? {
            return Err(QueueError::Full);
        }

        let payload = task.to_bytes()?;
        self.store.push(payload).await
    }

    async fn get(&self) -> Result<Task, QueueError> {
        match self.store.pop(self.pop_end()).await? {
            Some(payload) => Ok(Task::from_bytes(&payload)?),
            None => Err(QueueError::Empty),
        }
    }

    async fn size(&self) -> Result<usize, QueueError> {
        self.store.len().await
    }

    fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    async fn outstanding(&self) -> Result<usize, QueueError> {
        let count = self.store.outstanding().await?;
        Ok(count.max(0) as usize)
    }

    async fn task_done(&self) -> Result<(), QueueError> {
        let remaining = self.store.task_done().await?;
        if remaining < 0 {
            warn!("Outstanding counter went negative ({}); another process may have reset the frontier", remaining);
        } else if remaining == 0 {
            debug!("Shared frontier has no outstanding tasks");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.store.close().await
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}
