use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::crawler::task::Task;
use crate::storage::queue::{QueueBackend, QueueError, QueueOrder};

/// In-process task queue.
///
/// `put` and `get` never suspend; the blocking variants park on a [`Notify`]
/// instead of polling.
#[derive(Debug)]
pub struct LocalQueue {
    order: QueueOrder,
    max_size: Option<usize>,
    state: Mutex<State>,

    /// Signalled on every put
    item_added: Notify,

    /// Signalled on every get
    slot_freed: Notify,

    /// Signalled when the outstanding count drops to zero
    all_done: Notify,
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<Task>,
    unfinished: usize,
}

impl LocalQueue {
    /// Create an unbounded queue
    pub fn new(order: QueueOrder) -> Self {
        Self::bounded(order, None)
    }

    /// Create a queue holding at most `max_size` tasks (`None` or `0` means unbounded)
    pub fn bounded(order: QueueOrder, max_size: Option<usize>) -> Self {
        Self {
            order,
            max_size: max_size.filter(|size| *size > 0),
            state: Mutex::new(State::default()),
            item_added: Notify::new(),
            slot_freed: Notify::new(),
            all_done: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_put(&self, task: &Task) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(max_size) = self.max_size {
            if state.items.len() >= max_size {
                return Err(QueueError::Full);
            }
        }

        state.items.push_back(task.clone());
        state.unfinished += 1;
        drop(state);

        self.item_added.notify_one();
        Ok(())
    }

    fn try_get(&self) -> Result<Task, QueueError> {
        let mut state = self.state();
        let task = match self.order {
            QueueOrder::Lifo => state.items.pop_back(),
            QueueOrder::Fifo => state.items.pop_front(),
        };
        drop(state);

        match task {
            Some(task) => {
                self.slot_freed.notify_one();
                Ok(task)
            }
            None => Err(QueueError::Empty),
        }
    }
}

#[async_trait]
impl QueueBackend for LocalQueue {
    async fn put(&self, task: &Task) -> Result<(), QueueError> {
        self.try_put(task)
    }

    async fn get(&self) -> Result<Task, QueueError> {
        self.try_get()
    }

    async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.state().items.len())
    }

    fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    async fn outstanding(&self) -> Result<usize, QueueError> {
        Ok(self.state().unfinished)
    }

    async fn task_done(&self) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.unfinished == 0 {
            return Err(QueueError::TooManyDone);
        }

        state.unfinished -= 1;
        if state.unfinished == 0 {
            drop(state);
            debug!("All queued tasks are done");
            self.all_done.notify_waiters();
        }
        Ok(())
    }

    async fn put_blocking(&self, task: &Task, timeout: Option<Duration>) -> Result<(), QueueError> {
        let wait = async {
            loop {
                let freed = self.slot_freed.notified();
                match self.try_put(task) {
                    Err(QueueError::Full) => freed.await,
                    result => return result,
                }
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(Err(QueueError::Full)),
            None => wait.await,
        }
    }

    async fn get_blocking(&self, timeout: Option<Duration>) -> Result<Task, QueueError> {
        let wait = async {
            loop {
                let added = self.item_added.notified();
                match self.try_get() {
                    Err(QueueError::Empty) => added.await,
                    result => return result,
                }
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(Err(QueueError::Empty)),
            None => wait.await,
        }
    }

    async fn join(&self) -> Result<(), QueueError> {
        loop {
            let done = self.all_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            if self.state().unfinished == 0 {
                return Ok(());
            }
            done.await;
        }
    }
}
