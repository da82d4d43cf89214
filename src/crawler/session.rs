use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::CrawlerSettings;
use crate::utils::metrics::Metrics;

/// Per-run crawl state: limits plus the ledger of finished URLs
#[derive(Debug)]
pub struct Session {
    /// Name used in log lines and the report
    pub name: String,

    /// Number of workers
    pub concurrency: usize,

    /// Timeout applied to every attempt
    pub timeout: Duration,

    /// Attempts per task before it is recorded as failed
    pub max_tries: u32,

    /// Status codes whose responses reach a handler
    accepted_status: HashSet<u16>,

    /// URL sets, only ever grown
    ledger: Mutex<Ledger>,

    /// When the session was created
    started_at: DateTime<Utc>,
    started: Instant,
}

#[derive(Debug, Default)]
struct Ledger {
    seen: HashSet<String>,
    failed: HashSet<String>,
    cancelled: HashSet<String>,
}

impl Ledger {
    fn is_terminal(&self, url: &str) -> bool {
        self.seen.contains(url) || self.failed.contains(url)
    }
}

impl Session {
    /// Create a fresh session with empty URL sets
    pub fn new(name: impl Into<String>, settings: &CrawlerSettings) -> Self {
        Self {
            name: name.into(),
            concurrency: settings.concurrency.max(1),
            timeout: Duration::from_millis(settings.timeout_ms),
            max_tries: settings.max_tries.max(1),
            accepted_status: settings.accepted_status.iter().copied().collect(),
            ledger: Mutex::new(Ledger::default()),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a response with this status is handed to the task's handler
    pub fn accepts(&self, status: u16) -> bool {
        self.accepted_status.contains(&status)
    }

    /// Start tracking a request for `url`.
    ///
    /// The returned guard must be resolved with [`InFlight::succeed`] or
    /// [`InFlight::fail`]; dropping it unresolved records the URL as cancelled.
    pub fn begin(self: &Arc<Self>, url: impl Into<String>) -> InFlight {
        InFlight {
            session: Arc::clone(self),
            url: url.into(),
            resolved: false,
        }
    }

    /// Record a URL as successfully fetched. The first terminal outcome wins.
    pub fn record_seen(&self, url: &str) -> bool {
        let mut ledger = self.ledger();
        if ledger.is_terminal(url) {
            return false;
        }
        ledger.cancelled.remove(url);
        ledger.seen.insert(url.to_string())
    }

    /// Record a URL as failed. The first terminal outcome wins.
    pub fn record_failed(&self, url: &str) -> bool {
        let mut ledger = self.ledger();
        if ledger.is_terminal(url) {
            return false;
        }
        ledger.cancelled.remove(url);
        ledger.failed.insert(url.to_string())
    }

    fn record_cancelled(&self, url: &str) {
        let mut ledger = self.ledger();
        if !ledger.is_terminal(url) {
            ledger.cancelled.insert(url.to_string());
        }
    }

    pub fn is_seen(&self, url: &str) -> bool {
        self.ledger().seen.contains(url)
    }

    pub fn is_failed(&self, url: &str) -> bool {
        self.ledger().failed.contains(url)
    }

    /// Build the end-of-run report
    pub fn report(&self, metrics: Metrics, interrupted: bool) -> RunReport {
        let ledger = self.ledger();
        RunReport {
            name: self.name.clone(),
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
            interrupted,
            seen: ledger.seen.clone(),
            failed: ledger.failed.clone(),
            cancelled: ledger.cancelled.clone(),
            metrics,
        }
    }
}

/// Guard for one in-flight request
#[derive(Debug)]
pub struct InFlight {
    session: Arc<Session>,
    url: String,
    resolved: bool,
}

impl InFlight {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.session.record_seen(&self.url);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.session.record_failed(&self.url);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }

        // A panic mid-request is a failure, anything else is a cancellation
        if std::thread::panicking() {
            self.session.record_failed(&self.url);
        } else {
            debug!("Request cancelled before completion: {}", self.url);
            self.session.record_cancelled(&self.url);
        }
    }
}

/// Summary of a finished (or interrupted) run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub interrupted: bool,
    pub seen: HashSet<String>,
    pub failed: HashSet<String>,
    pub cancelled: HashSet<String>,
    pub metrics: Metrics,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.seen.len()
    }

    pub fn failures(&self) -> usize {
        self.failed.len()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in {:.2} seconds. Success: {}, Failure: {}, Cancelled: {}, Attempts: {}, Downloaded: {} bytes",
            self.name,
            if self.interrupted { "interrupted" } else { "finished" },
            self.elapsed.as_secs_f64(),
            self.seen.len(),
            self.failed.len(),
            self.cancelled.len(),
            self.metrics.attempts,
            self.metrics.bytes_downloaded,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<Session> {
        Arc::new(Session::new("test", &CrawlerSettings::default()))
    }

    #[test]
    fn test_first_outcome_wins() {
        let session = session();

        assert!(session.record_seen("http://a.test/"));
        assert!(!session.record_failed("http://a.test/"));
        assert!(session.record_failed("http://b.test/"));
        assert!(!session.record_seen("http://b.test/"));

        let report = session.report(Metrics::default(), false);
        assert!(report.seen.is_disjoint(&report.failed));
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failures(), 1);
    }

    #[test]
    fn test_dropped_guard_is_cancelled() {
        let session = session();

        let flight = session.begin("http://a.test/");
        drop(flight);
        session.begin("http://b.test/").succeed();

        let report = session.report(Metrics::default(), true);
        assert!(report.cancelled.contains("http://a.test/"));
        assert!(!report.seen.contains("http://a.test/"));
        assert!(!report.failed.contains("http://a.test/"));
        assert!(report.seen.contains("http://b.test/"));
    }

    #[test]
    fn test_later_success_clears_cancellation() {
        let session = session();

        drop(session.begin("http://a.test/"));
        session.begin("http://a.test/").succeed();

        let report = session.report(Metrics::default(), false);
        assert!(report.cancelled.is_empty());
        assert!(report.seen.contains("http://a.test/"));
    }

    #[test]
    fn test_fresh_sessions_are_independent() {
        let first = session();
        first.record_seen("http://a.test/");

        let second = session();
        assert!(!second.is_seen("http://a.test/"));
    }

    #[test]
    fn test_accepted_status_defaults() {
        let session = session();
        assert!(session.accepts(200));
        assert!(session.accepts(201));
        assert!(!session.accepts(204));
        assert!(!session.accepts(404));
    }
}
