use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::durable::{ListEnd, ListStore};
use crate::storage::queue::QueueError;

pub const POOL_MIN_SIZE: usize = 1;
pub const POOL_MAX_SIZE: usize = 10;

/// Redis list holding a shared frontier.
///
/// Tasks live in the list `<name>`; the outstanding counter in
/// `<name>:outstanding`. Connections are opened on first use.
pub struct RedisStore {
    /// Redis client
    client: Client,

    /// List key
    queue_key: String,

    /// Outstanding counter key
    outstanding_key: String,

    /// Number of multiplexed connections to open
    pool_size: usize,

    /// Connection pool, empty until first use and after close
    pool: Mutex<Option<Arc<Vec<MultiplexedConnection>>>>,

    /// Round-robin cursor into the pool
    next: AtomicUsize,
}

impl RedisStore {
    /// Create a store for the list `name`; no connection is made yet
    pub fn new(redis_url: &str, name: &str, pool_size: usize) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;

        Ok(Self {
            client,
            queue_key: name.to_string(),
            outstanding_key: format!("{}:outstanding", name),
            pool_size: pool_size.clamp(POOL_MIN_SIZE, POOL_MAX_SIZE),
            pool: Mutex::new(None),
            next: AtomicUsize::new(0),
        })
    }

    /// Get a connection, opening the pool on first use
    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut pool = self.pool.lock().await;

        let connections = match pool.as_ref() {
            Some(connections) => Arc::clone(connections),
            None => {
                let mut opened = Vec::with_capacity(self.pool_size);
                for _ in 0..self.pool_size {
                    opened.push(self.client.get_multiplexed_async_connection().await?);
                }
                debug!("Opened {} Redis connections for queue: {}", opened.len(), self.queue_key);

                let opened = Arc::new(opened);
                *pool = Some(Arc::clone(&opened));
                opened
            }
        };
        drop(pool);

        let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        Ok(connections[index].clone())
    }
}

#[async_trait]
impl ListStore for RedisStore {
    async fn push(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        redis::pipe()
            .atomic()
            .cmd("RPUSH").arg(&self.queue_key).arg(payload).ignore()
            .cmd("INCR").arg(&self.outstanding_key).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn pop(&self, end: ListEnd) -> Result<Option<Vec<u8>>, QueueError> {
        let mut conn = self.connection().await?;

        let command = match end {
            ListEnd::Head => "LPOP",
            ListEnd::Tail => "RPOP",
        };

        let payload: Option<Vec<u8>> = redis::cmd(command)
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;

        Ok(payload)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;

        let count: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn outstanding(&self) -> Result<i64, QueueError> {
        let mut conn = self.connection().await?;

        let count: Option<i64> = redis::cmd("GET")
            .arg(&self.outstanding_key)
            .query_async(&mut conn)
            .await?;

        Ok(count.unwrap_or(0))
    }

    async fn task_done(&self) -> Result<i64, QueueError> {
        let mut conn = self.connection().await?;

        let remaining: i64 = redis::cmd("DECR")
            .arg(&self.outstanding_key)
            .query_async(&mut conn)
            .await?;

        Ok(remaining)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if let Some(connections) = self.pool.lock().await.take() {
            debug!("Closing {} Redis connections for queue: {}", connections.len(), self.queue_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_is_clamped() {
        let store = RedisStore::new("redis://localhost:6379", "q", 0).unwrap();
        assert_eq!(store.pool_size, POOL_MIN_SIZE);

        let store = RedisStore::new("redis://localhost:6379", "q", 64).unwrap();
        assert_eq!(store.pool_size, POOL_MAX_SIZE);
        assert_eq!(store.outstanding_key, "q:outstanding");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(RedisStore::new("not-a-url", "q", 1), Err(QueueError::Backend(_))));
    }
}
