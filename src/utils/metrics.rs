use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Request metrics collector shared by every worker of a run
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Transport attempts, retries included
    pub attempts: usize,

    /// Attempts that were followed by another one
    pub retries: usize,

    /// Attempts abandoned because the request timeout expired
    pub timeouts: usize,

    /// Responses received, whatever their status
    pub responses: usize,

    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,

    /// Files written by the download sink
    pub downloads: usize,

    /// Bytes downloaded
    pub bytes_downloaded: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a transport attempt
    pub async fn record_attempt(&self) {
        self.metrics.lock().await.attempts += 1;
    }

    /// Record that a failed attempt will be retried
    pub async fn record_retry(&self) {
        self.metrics.lock().await.retries += 1;
    }

    /// Record an attempt that ran out of time
    pub async fn record_timeout(&self) {
        self.metrics.lock().await.timeouts += 1;
    }

    /// Record a response and its status code
    pub async fn record_response(&self, status: u16) {
        let mut metrics = self.metrics.lock().await;
        metrics.responses += 1;
        *metrics.status_codes.entry(status).or_default() += 1;
    }

    /// Record a finished download
    pub async fn record_download(&self, bytes: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.downloads += 1;
        metrics.bytes_downloaded += bytes;
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
