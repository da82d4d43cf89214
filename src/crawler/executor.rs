use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::crawler::dispatcher::Dispatcher;
use crate::crawler::registry::{HeaderFn, ParserFn, Registry};
use crate::crawler::session::Session;
use crate::crawler::task::{Handler, HeaderSource, Target, Task};
use crate::crawler::url::request_url;
use crate::http::download::{filename_for, DownloadSink, DownloadSummary};
use crate::http::{resolve, PreparedRequest, Transport, TransportError};
use crate::storage::{QueueBackend, QueueError};
use crate::utils::metrics::MetricsCollector;

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A batch task was split into this many queued children
    Expanded(usize),

    /// Every attempt failed
    Failed,

    /// The response status is not accepted; nothing else ran
    Dropped(u16),

    /// The handler finished
    Completed(u16),

    /// The body was written to disk
    Downloaded(DownloadSummary),
}

/// Errors that end one task without stopping the run
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("invalid URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no parser registered as `{0}`")]
    UnknownParser(String),

    #[error("no header generator registered as `{0}`")]
    UnknownHeaderGenerator(String),

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to queue task: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to read response: {0}")]
    Resolve(#[source] TransportError),

    #[error("download failed: {0}")]
    Download(#[source] std::io::Error),

    #[error("parser failed: {0:#}")]
    Parser(anyhow::Error),
}

/// Headers to apply on each attempt
enum HeaderPlan {
    Static(HeaderMap),
    Generated(HeaderFn),
    Transport,
}

impl HeaderPlan {
    /// Headers for one attempt, and whether transport auto headers are skipped
    fn for_attempt(&self) -> Result<(HeaderMap, bool), ExecuteError> {
        match self {
            HeaderPlan::Static(headers) => Ok((headers.clone(), false)),
            HeaderPlan::Generated(generator) => Ok((header_map(&generator())?, true)),
            HeaderPlan::Transport => Ok((HeaderMap::new(), false)),
        }
    }
}

/// What runs once a response is accepted
enum Dispatch {
    Discard,
    Parse(ParserFn),
    Download { dir: PathBuf, filename: Option<String> },
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ExecuteError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let invalid = |reason: String| ExecuteError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Runs single tasks: fan-out, retries, status filtering and dispatch
pub struct Executor {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    registry: Arc<Registry>,

    /// Used by tasks that carry no headers of their own
    default_headers: Option<HeaderSource>,

    /// Used by tasks that carry no delay of their own
    default_delay: Option<Duration>,

    sink: DownloadSink,
    metrics: MetricsCollector,
}

impl Executor {
    pub fn new(
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        queue: Arc<dyn QueueBackend>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            session,
            transport,
            dispatcher: Dispatcher::new(queue),
            registry,
            default_headers: None,
            default_delay: None,
            sink: DownloadSink::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_default_headers(mut self, headers: Option<HeaderSource>) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn with_default_delay(mut self, delay: Option<Duration>) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_sink(mut self, sink: DownloadSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Fail the task before any request went out
    fn reject(&self, url: &str, err: ExecuteError) -> ExecuteError {
        self.session.record_failed(url);
        error!("[Rejected] {}: {}", url, err);
        err
    }

    fn header_plan(&self, source: Option<&HeaderSource>) -> Result<HeaderPlan, ExecuteError> {
        match source.or(self.default_headers.as_ref()) {
            None => Ok(HeaderPlan::Transport),
            Some(HeaderSource::Static(headers)) => Ok(HeaderPlan::Static(header_map(headers)?)),
            Some(HeaderSource::Generated(name)) => self
                .registry
                .header_generator(name)
                .map(HeaderPlan::Generated)
                .ok_or_else(|| ExecuteError::UnknownHeaderGenerator(name.clone())),
        }
    }

    fn dispatch_plan(&self, handler: Handler) -> Result<Dispatch, ExecuteError> {
        match handler {
            Handler::Discard => Ok(Dispatch::Discard),
            Handler::Parse(name) => match self.registry.parser(&name) {
                Some(parser) => Ok(Dispatch::Parse(parser)),
                None => Err(ExecuteError::UnknownParser(name)),
            },
            Handler::Download { dir, filename } => Ok(Dispatch::Download { dir, filename }),
        }
    }

    /// Run one task to completion.
    ///
    /// Dropping the returned future before a response arrived records the
    /// task's URL as cancelled.
    pub async fn execute(&self, task: Task) -> Result<Outcome, ExecuteError> {
        // Batches go back through the queue, one child per URL
        let target = match &task.target {
            Target::Single(url) => url.clone(),
            Target::Batch(_) => {
                let children = task.expand();
                for child in &children {
                    self.dispatcher.queue().put(child).await?;
                }
                debug!("Expanded batch into {} tasks", children.len());
                return Ok(Outcome::Expanded(children.len()));
            }
        };

        let url = match request_url(&target, &task.params) {
            Ok(url) => url,
            Err(source) => return Err(self.reject(&target, ExecuteError::InvalidUrl { url: target.clone(), source })),
        };
        let canonical = url.to_string();

        let headers = self
            .header_plan(task.headers.as_ref())
            .map_err(|e| self.reject(&canonical, e))?;
        let dispatch = self
            .dispatch_plan(task.handler)
            .map_err(|e| self.reject(&canonical, e))?;

        let method = task.method;
        let guard = self.session.begin(canonical.as_str());
        let mut response = None;

        for attempt in 1..=self.session.max_tries {
            let (header_map, skip_auto_headers) = match headers.for_attempt() {
                Ok(attempt_headers) => attempt_headers,
                Err(e) => {
                    guard.fail();
                    return Err(e);
                }
            };

            let request = PreparedRequest {
                method,
                url: url.clone(),
                headers: header_map,
                skip_auto_headers,
                body: task.body.clone(),
                allow_redirects: task.allow_redirects,
            };

            self.metrics.record_attempt().await;
            match tokio::time::timeout(self.session.timeout, self.transport.send(request)).await {
                Ok(Ok(raw)) => {
                    response = Some(raw);
                    break;
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    error!("[{}] {} [Failure][{}]", method, canonical, e);
                    guard.fail();
                    return Ok(Outcome::Failed);
                }
                Ok(Err(e)) => {
                    debug!("[{}] {} [{}][Try:{}]", method, canonical, e, attempt);
                }
                Err(_) => {
                    self.metrics.record_timeout().await;
                    debug!("[{}] {} [TimeoutError][Try:{}]", method, canonical, attempt);
                }
            }

            if attempt < self.session.max_tries {
                self.metrics.record_retry().await;
            }
        }

        let raw = match response {
            Some(raw) => raw,
            None => {
                guard.fail();
                error!("[{}] {} [Failure][Try:{}]", method, canonical, self.session.max_tries);
                return Ok(Outcome::Failed);
            }
        };
        guard.succeed();

        let status = raw.status.as_u16();
        self.metrics.record_response(status).await;
        info!(
            "[{}] {} [{} {}]",
            method,
            canonical,
            status,
            raw.status.canonical_reason().unwrap_or("")
        );

        if !self.session.accepts(status) {
            return Ok(Outcome::Dropped(status));
        }

        if let Some(delay) = task.delay.or(self.default_delay) {
            tokio::time::sleep(delay).await;
        }

        match dispatch {
            Dispatch::Discard => Ok(Outcome::Completed(status)),
            Dispatch::Download { dir, filename } => {
                let filename = filename.unwrap_or_else(|| filename_for(&url));
                let mut body = raw.body;
                let summary = self
                    .sink
                    .save(&mut body, &dir, &filename)
                    .await
                    .map_err(ExecuteError::Download)?;

                self.metrics.record_download(summary.bytes).await;
                info!("[DOWNLOAD]: {}", summary.path.display());
                Ok(Outcome::Downloaded(summary))
            }
            Dispatch::Parse(parser) => {
                let response = resolve(raw).await.map_err(ExecuteError::Resolve)?;
                parser(response, self.dispatcher.clone())
                    .await
                    .map_err(ExecuteError::Parser)?;
                Ok(Outcome::Completed(status))
            }
        }
    }
}
