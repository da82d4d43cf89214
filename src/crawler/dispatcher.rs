use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::crawler::task::{Handler, HeaderSource, HttpMethod, RequestBody, Target, Task};
use crate::storage::{QueueBackend, QueueError};

/// Entry point for submitting tasks to the queue.
///
/// Handed to the start hook and to every parser, so callbacks can fan out.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn QueueBackend>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn QueueBackend>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Start building a task with any method
    pub fn request(&self, method: HttpMethod, target: impl Into<Target>) -> TaskBuilder<'_> {
        TaskBuilder {
            dispatcher: self,
            task: Task::new(method, target),
        }
    }

    pub fn get(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Get, target)
    }

    pub fn post(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Post, target)
    }

    pub fn put(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Put, target)
    }

    pub fn patch(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Patch, target)
    }

    pub fn delete(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Delete, target)
    }

    pub fn head(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Head, target)
    }

    pub fn options(&self, target: impl Into<Target>) -> TaskBuilder<'_> {
        self.request(HttpMethod::Options, target)
    }

    /// GET a target and stream its body into `dir`
    pub fn download(&self, target: impl Into<Target>, dir: impl Into<PathBuf>) -> TaskBuilder<'_> {
        let mut builder = self.get(target);
        builder.task.handler = Handler::Download {
            dir: dir.into(),
            filename: None,
        };
        builder
    }

    /// Enqueue a ready-made task, failing fast when the queue is full
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.queue.put(&task).await
    }
}

/// Fluent builder for one task
#[must_use = "a task is only queued by send() or send_blocking()"]
pub struct TaskBuilder<'a> {
    dispatcher: &'a Dispatcher,
    task: Task,
}

impl TaskBuilder<'_> {
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.task.params.push((key.into(), value.to_string()));
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.task
            .params
            .extend(params.into_iter().map(|(key, value)| (key.into(), value.to_string())));
        self
    }

    /// URL-encoded form body
    pub fn form<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let fields = fields
            .into_iter()
            .map(|(key, value)| (key.into(), value.to_string()))
            .collect();
        self.task.body = Some(RequestBody::Form(fields));
        self
    }

    /// JSON body
    pub fn json<T: Serialize>(mut self, value: &T) -> serde_json::Result<Self> {
        self.task.body = Some(RequestBody::json(value)?);
        Ok(self)
    }

    /// Raw body bytes
    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.task.body = Some(RequestBody::Bytes(bytes.into()));
        self
    }

    /// Static headers sent on every attempt
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let headers: BTreeMap<String, String> = headers
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.task.headers = Some(HeaderSource::Static(headers));
        self
    }

    /// Fresh headers from a registered generator on every attempt
    pub fn header_generator(mut self, name: impl Into<String>) -> Self {
        self.task.headers = Some(HeaderSource::Generated(name.into()));
        self
    }

    /// Hand the response to a registered parser
    pub fn parser(mut self, name: impl Into<String>) -> Self {
        self.task.handler = Handler::Parse(name.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.task.delay = Some(delay);
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.task.allow_redirects = allow;
        self
    }

    /// Name of the downloaded file; only meaningful for download tasks
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        if let Handler::Download { filename: slot, .. } = &mut self.task.handler {
            *slot = Some(filename.into());
        }
        self
    }

    pub fn build(self) -> Task {
        self.task
    }

    /// Enqueue, failing fast when the queue is full
    pub async fn send(self) -> Result<(), QueueError> {
        self.dispatcher.queue.put(&self.task).await
    }

    /// Enqueue, waiting for room up to `timeout`
    pub async fn send_blocking(self, timeout: Option<Duration>) -> Result<(), QueueError> {
        self.dispatcher.queue.put_blocking(&self.task, timeout).await
    }
}
