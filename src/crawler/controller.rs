use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::LocalSet;
use tracing::{info, warn};

use crate::config::CrawlerConfig;
use crate::crawler::dispatcher::Dispatcher;
use crate::crawler::executor::Executor;
use crate::crawler::pool::{PoolError, WorkerPool};
use crate::crawler::registry::Registry;
use crate::crawler::session::{RunReport, Session};
use crate::crawler::task::HeaderSource;
use crate::http::fingerprint;
use crate::http::{DownloadSink, ReqwestTransport, Response, Transport, TransportError};
use crate::storage::{open_queue, QueueBackend, QueueError};
use crate::utils::metrics::MetricsCollector;

/// Errors that prevent a crawler from being built or a run from finishing
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("failed to build HTTP transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to open queue: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A named crawler: configuration, transport, queue and registered callbacks
pub struct Crawler {
    name: String,
    config: CrawlerConfig,
    transport: Arc<dyn Transport>,
    queue: Arc<dyn QueueBackend>,
    registry: Registry,
}

impl Crawler {
    /// Create a crawler with the transport and queue described by `config`
    pub fn new(name: impl Into<String>, config: CrawlerConfig) -> Result<Self, CrawlError> {
        // Initialize transport and queue
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);
        let queue = open_queue(&config.queue)?;

        // Built-in header generators are always available
        let mut registry = Registry::new();
        fingerprint::register_builtin(&mut registry, &config.http);

        Ok(Self {
            name: name.into(),
            config,
            transport,
            queue,
            registry,
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = queue;
        self
    }

    /// Register an asynchronous parser
    pub fn parser<F, Fut>(mut self, name: impl Into<String>, parser: F) -> Self
    where
        F: Fn(Response, Dispatcher) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.registry.register_parser(name, parser);
        self
    }

    /// Register a synchronous parser
    pub fn sync_parser<F>(mut self, name: impl Into<String>, parser: F) -> Self
    where
        F: Fn(Response, Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register_sync_parser(name, parser);
        self
    }

    pub fn header_generator<F>(mut self, name: impl Into<String>, generator: F) -> Self
    where
        F: Fn() -> std::collections::BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.registry.register_header_generator(name, generator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Headers applied to tasks that carry none
    fn default_headers(&self) -> Option<HeaderSource> {
        let http = &self.config.http;
        match &http.header_generator {
            Some(name) => Some(HeaderSource::Generated(name.clone())),
            None if !http.headers.is_empty() => Some(HeaderSource::Static(http.headers.clone())),
            None => None,
        }
    }

    /// Crawl until the queue drains or Ctrl-C is pressed
    pub async fn run<F, Fut>(&self, on_start: F) -> Result<RunReport, CrawlError>
    where
        F: FnOnce(Dispatcher) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        self.run_until(on_start, interrupt).await
    }

    /// Crawl until the queue drains or `shutdown` completes.
    ///
    /// Every run gets a fresh session, so URL sets never leak between runs.
    pub async fn run_until<F, Fut, S>(&self, on_start: F, shutdown: S) -> Result<RunReport, CrawlError>
    where
        F: FnOnce(Dispatcher) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
        S: Future<Output = ()>,
    {
        let session = Arc::new(Session::new(self.name.clone(), &self.config.crawler));
        let metrics = MetricsCollector::new();

        let executor = Executor::new(
            Arc::clone(&session),
            Arc::clone(&self.transport),
            Arc::clone(&self.queue),
            Arc::new(self.registry.clone()),
        )
        .with_default_headers(self.default_headers())
        .with_default_delay(self.config.crawler.politeness_delay_ms.map(Duration::from_millis))
        .with_sink(DownloadSink::new(self.config.download.chunk_size))
        .with_metrics(metrics.clone());

        let pool = WorkerPool::new(session.concurrency, Arc::clone(&self.queue), Rc::new(executor));
        info!("{} Started, Concurrency: {}", self.name, pool.concurrency());

        let local = LocalSet::new();
        let (result, interrupted) = local
            .run_until(async {
                let workers = pool.start();
                let outcome = tokio::select! {
                    result = pool.drain(on_start) => (result, false),
                    _ = shutdown => {
                        warn!("{} Shutdown requested, cancelling workers", self.name);
                        (Ok(()), true)
                    }
                };
                workers.shutdown().await;
                outcome
            })
            .await;

        if let Err(e) = self.queue.close().await {
            warn!("Failed to close queue: {}", e);
        }

        let report = session.report(metrics.get_metrics().await, interrupted);
        info!("{}", report);

        result?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{HttpMethod, Task};
    use crate::http::{PreparedRequest, RawResponse, RequestInfo};
    use crate::storage::{LocalQueue, QueueOrder};
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use reqwest::StatusCode;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that answers after a pause and tracks concurrent requests
    struct GaugeTransport {
        latency: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl GaugeTransport {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for GaugeTransport {
        async fn send(&self, request: PreparedRequest) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if request.url.host_str() == Some("down.test") {
                return Err(TransportError::Connection("connection reset".to_string()));
            }

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
            Ok(RawResponse {
                url: request.url.clone(),
                status: StatusCode::OK,
                headers,
                cookies: Vec::new(),
                request: RequestInfo {
                    method: request.method,
                    url: request.url,
                    headers: request.headers,
                },
                body: Box::new(&b"<html><title>page</title></html>"[..]),
            })
        }
    }

    fn config(concurrency: usize) -> CrawlerConfig {
        let mut config = CrawlerConfig::default();
        config.crawler.concurrency = concurrency;
        config.crawler.max_tries = 2;
        config.crawler.timeout_ms = 5_000;
        config
    }

    fn crawler(concurrency: usize, transport: Arc<GaugeTransport>) -> Crawler {
        Crawler::new("test", config(concurrency)).unwrap().with_transport(transport)
    }

    fn urls(host: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("http://{}/page/{}", host, i)).collect()
    }

    #[tokio::test]
    async fn test_in_flight_requests_never_exceed_concurrency() {
        for concurrency in [1, 3, 8] {
            let transport = Arc::new(GaugeTransport::new(Duration::from_millis(10)));
            let crawler = crawler(concurrency, Arc::clone(&transport));

            let seeds = urls("a.test", 20);
            let report = crawler
                .run_until(
                    |dispatcher| async move {
                        dispatcher.get(seeds).send().await?;
                        Ok::<(), anyhow::Error>(())
                    },
                    std::future::pending(),
                )
                .await
                .unwrap();

            assert_eq!(transport.calls.load(Ordering::SeqCst), 20);
            assert!(transport.peak.load(Ordering::SeqCst) <= concurrency);
            assert_eq!(report.succeeded(), 20);
            assert!(!report.interrupted);
        }
    }

    #[tokio::test]
    async fn test_every_url_lands_in_exactly_one_set() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(1)));
        let crawler = crawler(4, Arc::clone(&transport));

        let good = urls("up.test", 5);
        let bad = urls("down.test", 3);
        let mut seeds = good.clone();
        seeds.extend(bad.clone());

        let report = crawler
            .run_until(
                |dispatcher| async move {
                    for url in seeds {
                        dispatcher.get(url).send().await?;
                    }
                    Ok::<(), anyhow::Error>(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        assert!(report.seen.is_disjoint(&report.failed));
        assert_eq!(report.seen, good.into_iter().collect::<HashSet<_>>());
        assert_eq!(report.failed, bad.into_iter().collect::<HashSet<_>>());
        // Failed URLs used both tries
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5 + 3 * 2);
        assert_eq!(report.metrics.attempts, 11);
    }

    #[tokio::test]
    async fn test_parser_fan_out_is_joined() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(1)));
        let crawler = crawler(2, transport).sync_parser("index", |response, _dispatcher| {
            assert_eq!(response.select("title")?.len(), 1);
            Ok(())
        });
        let crawler = crawler.parser("listing", |response, dispatcher| async move {
            let base = response.url().clone();
            for i in 0..3 {
                let url = base.join(&format!("/item/{}", i))?;
                dispatcher.get(url.as_str()).parser("index").send().await?;
            }
            Ok::<(), anyhow::Error>(())
        });

        let report = crawler
            .run_until(
                |dispatcher| async move {
                    dispatcher.get("http://shop.test/list").parser("listing").send().await?;
                    Ok::<(), anyhow::Error>(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 4);
        assert!(report.seen.contains("http://shop.test/item/2"));
    }

    #[tokio::test]
    async fn test_parser_failures_do_not_stop_workers() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(1)));
        let crawler = crawler(1, transport).sync_parser("fragile", |response, _| {
            match response.url().path() {
                "/panic" => panic!("parser blew up"),
                "/error" => anyhow::bail!("parser gave up"),
                _ => Ok(()),
            }
        });

        let report = crawler
            .run_until(
                |dispatcher| async move {
                    for path in ["/panic", "/error", "/fine"] {
                        dispatcher.get(format!("http://p.test{}", path)).parser("fragile").send().await?;
                    }
                    Ok::<(), anyhow::Error>(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        // The requests themselves succeeded before the parsers ran
        assert_eq!(report.succeeded(), 3);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_requests() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_secs(30)));
        let queue = Arc::new(LocalQueue::new(QueueOrder::Lifo));
        let crawler = crawler(2, transport).with_queue(queue.clone());

        let started = std::time::Instant::now();
        let report = crawler
            .run_until(
                |dispatcher| async move {
                    dispatcher.get("http://slow.test/").send().await?;
                    Ok::<(), anyhow::Error>(())
                },
                tokio::time::sleep(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.interrupted);
        assert!(report.seen.is_empty());
        assert!(report.failed.is_empty());
        assert!(report.cancelled.contains("http://slow.test/"));

        // The unfinished task went back to the queue
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.get().await.unwrap(), Task::new(HttpMethod::Get, "http://slow.test/"));
    }

    #[tokio::test]
    async fn test_runs_get_fresh_sessions() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(1)));
        let crawler = crawler(2, transport);

        let first = crawler
            .run_until(
                |dispatcher| async move {
                    dispatcher.get("http://one.test/").send().await?;
                    Ok::<(), anyhow::Error>(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();
        let second = crawler
            .run_until(
                |dispatcher| async move {
                    dispatcher.get("http://two.test/").send().await?;
                    Ok::<(), anyhow::Error>(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        assert_eq!(first.seen, HashSet::from(["http://one.test/".to_string()]));
        assert_eq!(second.seen, HashSet::from(["http://two.test/".to_string()]));
    }

    #[tokio::test]
    async fn test_start_hook_error_is_returned() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(1)));
        let crawler = crawler(2, transport);

        let result = crawler
            .run_until(|_| async { Err::<(), _>(anyhow::anyhow!("no seeds")) }, std::future::pending())
            .await;
        assert!(matches!(result, Err(CrawlError::Pool(PoolError::Start(_)))));
    }
}
