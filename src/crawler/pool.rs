use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawler::dispatcher::Dispatcher;
use crate::crawler::executor::Executor;
use crate::crawler::task::{Target, Task};
use crate::storage::{QueueBackend, QueueError};

/// Pause after a queue backend error before the worker asks again
const WORKER_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Errors that end a run
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("start hook failed: {0:#}")]
    Start(anyhow::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Fixed number of workers pulling tasks from one queue.
///
/// Workers are spawned with [`tokio::task::spawn_local`], so the pool must
/// be driven from inside a [`tokio::task::LocalSet`].
pub struct WorkerPool {
    concurrency: usize,
    queue: Arc<dyn QueueBackend>,
    executor: Rc<Executor>,
}

/// Running workers; dropping this asks them to stop
pub struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<usize>>,
}

impl WorkerPool {
    pub fn new(concurrency: usize, queue: Arc<dyn QueueBackend>, executor: Rc<Executor>) -> Self {
        Self {
            concurrency: concurrency.max(1),
            queue,
            executor,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn exactly `concurrency` workers on the current local set
    pub fn start(&self) -> Workers {
        let cancel = CancellationToken::new();

        let handles = (0..self.concurrency)
            .map(|id| {
                let queue = Arc::clone(&self.queue);
                let executor = Rc::clone(&self.executor);
                tokio::task::spawn_local(worker(id, queue, executor, cancel.clone()))
            })
            .collect();

        debug!("Started {} workers", self.concurrency);

        Workers { cancel, handles }
    }

    /// Run the start hook, then wait until every queued task is done
    pub async fn drain<F, Fut>(&self, on_start: F) -> Result<(), PoolError>
    where
        F: FnOnce(Dispatcher) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        on_start(Dispatcher::new(Arc::clone(&self.queue)))
            .await
            .map_err(PoolError::Start)?;

        self.queue.join().await?;
        Ok(())
    }

    /// Start the workers, drain the queue, then shut the workers down
    pub async fn work<F, Fut>(&self, on_start: F) -> Result<(), PoolError>
    where
        F: FnOnce(Dispatcher) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let workers = self.start();
        let result = self.drain(on_start).await;
        workers.shutdown().await;
        result
    }
}

impl Workers {
    /// Stop every worker and wait for it to exit.
    ///
    /// Workers finish the queue call they are in, then return any task they
    /// hold to the queue and settle its outstanding count. Returns the number
    /// of tasks put back.
    pub async fn shutdown(mut self) -> usize {
        self.cancel.cancel();

        let mut returned = 0;
        for handle in std::mem::take(&mut self.handles) {
            match handle.await {
                Ok(count) => returned += count,
                Err(e) => error!("Worker ended abnormally: {}", e),
            }
        }

        if returned > 0 {
            info!("Returned {} unfinished tasks to the queue", returned);
        }
        returned
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Short label for log lines
fn describe(task: &Task) -> String {
    match &task.target {
        Target::Single(url) => format!("[{}] {}", task.method, url),
        Target::Batch(urls) => format!("[{}] batch of {}", task.method, urls.len()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

async fn mark_done(id: usize, queue: &dyn QueueBackend) {
    if let Err(e) = queue.task_done().await {
        error!("Worker {} failed to mark task done: {}", id, e);
    }
}

/// Put an unfinished task back and settle the count it held
async fn requeue(id: usize, queue: &dyn QueueBackend, task: &Task) {
    if let Err(e) = queue.put(task).await {
        warn!("Worker {} could not return unfinished task {} to the queue: {}", id, describe(task), e);
    }
    mark_done(id, queue).await;
}

/// Worker loop; returns how many tasks it put back on shutdown
async fn worker(id: usize, queue: Arc<dyn QueueBackend>, executor: Rc<Executor>, cancel: CancellationToken) -> usize {
    debug!("Worker {} started", id);
    let wait = queue.poll_interval();

    while !cancel.is_cancelled() {
        // Pops are never raced against cancellation; the short wait bounds shutdown latency
        let task = match queue.get_blocking(Some(wait)).await {
            Ok(task) => task,
            Err(QueueError::Empty) => continue,
            Err(QueueError::Codec(e)) => {
                // The payload is gone but it was counted when it was put
                error!("Worker {} dropped an undecodable task: {}", id, e);
                mark_done(id, queue.as_ref()).await;
                continue;
            }
            Err(e) => {
                error!("Worker {} failed to fetch a task: {}", id, e);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(WORKER_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        let label = describe(&task);
        debug!("Worker {} processing task: {}", id, label);

        let run = AssertUnwindSafe(executor.execute(task.clone())).catch_unwind();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Worker {} cancelled during {}", id, label);
                requeue(id, queue.as_ref(), &task).await;
                return 1;
            }
            result = run => match result {
                Ok(Ok(outcome)) => debug!("Worker {} finished {}: {:?}", id, label, outcome),
                Ok(Err(e)) => error!("Worker {} task processing error for {}: {}", id, label, e),
                Err(panic) => error!("Worker {} task panicked for {}: {}", id, label, panic_message(panic.as_ref())),
            },
        }

        mark_done(id, queue.as_ref()).await;
    }

    debug!("Worker {} stopped", id);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerSettings;
    use crate::crawler::executor::tests::RefusingTransport;
    use crate::crawler::registry::Registry;
    use crate::crawler::session::Session;
    use crate::crawler::task::HttpMethod;
    use crate::storage::durable::tests::MemoryStore;
    use crate::storage::durable::ListEnd;
    use crate::storage::{DurableQueue, ListStore, LocalQueue, QueueOrder};
    use tokio::task::LocalSet;

    fn pool(queue: Arc<dyn QueueBackend>, concurrency: usize) -> (WorkerPool, Arc<Session>) {
        let settings = CrawlerSettings {
            max_tries: 1,
            ..CrawlerSettings::default()
        };
        let session = Arc::new(Session::new("pool", &settings));
        let executor = Executor::new(
            Arc::clone(&session),
            Arc::new(RefusingTransport::default()),
            Arc::clone(&queue),
            Arc::new(Registry::new()),
        );
        (WorkerPool::new(concurrency, queue, Rc::new(executor)), session)
    }

    #[tokio::test]
    async fn test_work_drains_fan_out() {
        let queue: Arc<dyn QueueBackend> = Arc::new(LocalQueue::new(QueueOrder::Lifo));
        let (pool, session) = pool(Arc::clone(&queue), 3);

        LocalSet::new()
            .run_until(pool.work(|dispatcher| async move {
                dispatcher.get(vec!["http://a.test/", "http://b.test/", "http://c.test/"]).send().await?;
                Ok::<(), anyhow::Error>(())
            }))
            .await
            .unwrap();

        assert_eq!(queue.outstanding().await.unwrap(), 0);
        for url in ["http://a.test/", "http://b.test/", "http://c.test/"] {
            assert!(session.is_failed(url));
        }
    }

    #[tokio::test]
    async fn test_start_hook_error_ends_run() {
        let queue: Arc<dyn QueueBackend> = Arc::new(LocalQueue::new(QueueOrder::Lifo));
        let (pool, _) = pool(queue, 2);

        let result = LocalSet::new()
            .run_until(pool.work(|_| async { Err::<(), _>(anyhow::anyhow!("no seeds")) }))
            .await;
        assert!(matches!(result, Err(PoolError::Start(_))));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_counted_done() {
        let queue = Arc::new(
            DurableQueue::new(MemoryStore::default(), QueueOrder::Fifo).with_poll_interval(Duration::from_millis(5)),
        );
        queue.store().push(vec![0xff]).await.unwrap();
        queue.put(&Task::new(HttpMethod::Get, "http://ok.test/")).await.unwrap();

        let dyn_queue: Arc<dyn QueueBackend> = queue.clone();
        let (pool, session) = pool(dyn_queue, 1);

        tokio::time::timeout(Duration::from_secs(5), LocalSet::new().run_until(pool.work(|_| async { Ok::<(), anyhow::Error>(()) })))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.outstanding().await.unwrap(), 0);
        assert!(session.is_failed("http://ok.test/"));
    }

    /// Store whose pop is applied remotely before its reply arrives
    struct SlowReplyStore {
        inner: MemoryStore,
        reply_delay: Duration,
    }

    #[async_trait::async_trait]
    impl ListStore for SlowReplyStore {
        async fn push(&self, payload: Vec<u8>) -> Result<(), QueueError> {
            self.inner.push(payload).await
        }

        async fn pop(&self, end: ListEnd) -> Result<Option<Vec<u8>>, QueueError> {
            let payload = self.inner.pop(end).await?;
            tokio::time::sleep(self.reply_delay).await;
            Ok(payload)
        }

        async fn len(&self) -> Result<usize, QueueError> {
            self.inner.len().await
        }

        async fn outstanding(&self) -> Result<i64, QueueError> {
            self.inner.outstanding().await
        }

        async fn task_done(&self) -> Result<i64, QueueError> {
            self.inner.task_done().await
        }

        async fn close(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_pop_returns_the_task() {
        let store = SlowReplyStore {
            inner: MemoryStore::default(),
            reply_delay: Duration::from_millis(200),
        };
        let queue = Arc::new(DurableQueue::new(store, QueueOrder::Fifo).with_poll_interval(Duration::from_millis(5)));
        queue.put(&Task::new(HttpMethod::Get, "http://reply.test/")).await.unwrap();

        let dyn_queue: Arc<dyn QueueBackend> = queue.clone();
        let (pool, session) = pool(dyn_queue, 1);

        let returned = LocalSet::new()
            .run_until(async {
                let workers = pool.start();
                tokio::time::sleep(Duration::from_millis(50)).await;
                workers.shutdown().await
            })
            .await;

        // The popped task is back and the shared counter still matches the list
        assert_eq!(returned, 1);
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.outstanding().await.unwrap(), 1);
        assert!(!session.is_seen("http://reply.test/"));
        assert!(!session.is_failed("http://reply.test/"));
    }

    #[tokio::test]
    async fn test_idle_workers_stop_on_shutdown() {
        let queue: Arc<dyn QueueBackend> = Arc::new(LocalQueue::new(QueueOrder::Lifo));
        let (pool, _) = pool(Arc::clone(&queue), 4);

        let returned = tokio::time::timeout(
            Duration::from_secs(2),
            LocalSet::new().run_until(async { pool.start().shutdown().await }),
        )
        .await
        .unwrap();

        assert_eq!(returned, 0);
        assert_eq!(queue.outstanding().await.unwrap(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
