pub mod durable;
pub mod local;
pub mod queue;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{QueueBackendKind, QueueSettings};

// Re-export common types
pub use durable::{DurableQueue, ListEnd, ListStore};
pub use local::LocalQueue;
pub use queue::{QueueBackend, QueueError, QueueOrder};
pub use redis_store::RedisStore;

/// Build the queue backend described by the settings.
///
/// The Redis backend connects lazily, so this never touches the network.
pub fn open_queue(settings: &QueueSettings) -> Result<Arc<dyn QueueBackend>, QueueError> {
    match settings.backend {
        QueueBackendKind::Local => Ok(Arc::new(LocalQueue::bounded(settings.order, settings.max_size))),
        QueueBackendKind::Redis => {
            let store = RedisStore::new(&settings.redis_url, &settings.name, settings.pool_size)?;
            let queue = DurableQueue::new(store, settings.order)
                .with_max_size(settings.max_size)
                .with_poll_interval(Duration::from_millis(settings.poll_interval_ms.max(1)))
                .with_default_timeout(settings.timeout_ms.map(Duration::from_millis));
            Ok(Arc::new(queue))
        }
    }
}
