use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::crawler::dispatcher::Dispatcher;
use crate::http::Response;

/// Registered response callback.
///
/// Synchronous and asynchronous parsers are both stored as functions
/// returning a boxed local future; responses are `!Send`.
pub type ParserFn = Arc<dyn Fn(Response, Dispatcher) -> LocalBoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registered header generator, invoked once per attempt
pub type HeaderFn = Arc<dyn Fn() -> BTreeMap<String, String> + Send + Sync>;

/// Parsers and header generators, addressed by name from queued tasks
#[derive(Clone, Default)]
pub struct Registry {
    parsers: HashMap<String, ParserFn>,
    header_generators: HashMap<String, HeaderFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asynchronous parser
    pub fn register_parser<F, Fut>(&mut self, name: impl Into<String>, parser: F)
    where
        F: Fn(Response, Dispatcher) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let parser: ParserFn = Arc::new(move |response: Response, dispatcher: Dispatcher| {
            parser(response, dispatcher).boxed_local()
        });
        self.parsers.insert(name.into(), parser);
    }

    /// Register a synchronous parser; it runs to completion when its future is first polled
    pub fn register_sync_parser<F>(&mut self, name: impl Into<String>, parser: F)
    where
        F: Fn(Response, Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let parser = Arc::new(parser);
        let parser: ParserFn = Arc::new(move |response: Response, dispatcher: Dispatcher| {
            let parser = Arc::clone(&parser);
            async move { parser(response, dispatcher) }.boxed_local()
        });
        self.parsers.insert(name.into(), parser);
    }

    pub fn register_header_generator<F>(&mut self, name: impl Into<String>, generator: F)
    where
        F: Fn() -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.header_generators.insert(name.into(), Arc::new(generator));
    }

    pub fn parser(&self, name: &str) -> Option<ParserFn> {
        self.parsers.get(name).cloned()
    }

    pub fn header_generator(&self, name: &str) -> Option<HeaderFn> {
        self.header_generators.get(name).cloned()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parsers: Vec<&String> = self.parsers.keys().collect();
        let mut generators: Vec<&String> = self.header_generators.keys().collect();
        parsers.sort();
        generators.sort();

        f.debug_struct("Registry")
            .field("parsers", &parsers)
            .field("header_generators", &generators)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::resolver::ContentKind;
    use crate::http::response::tests::meta;
    use crate::storage::{LocalQueue, QueueOrder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(LocalQueue::new(QueueOrder::Lifo)))
    }

    fn response() -> Response {
        Response::new(meta("http://x.test/"), "<p>hi</p>".to_string(), ContentKind::Html)
    }

    #[tokio::test]
    async fn test_sync_and_async_parsers_share_one_shape() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();

        let counter = Arc::clone(&calls);
        registry.register_sync_parser("sync", move |response, _| {
            assert_eq!(response.status(), 200);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let counter = Arc::clone(&calls);
        registry.register_parser("async", move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        for name in ["sync", "async"] {
            let parser = registry.parser(name).unwrap();
            parser(response(), dispatcher()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_names() {
        let registry = Registry::new();
        assert!(registry.parser("missing").is_none());
        assert!(registry.header_generator("missing").is_none());
    }

    #[test]
    fn test_header_generator_runs_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = Registry::new();
        registry.register_header_generator("counting", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            BTreeMap::from([("X-Call".to_string(), n.to_string())])
        });

        let generator = registry.header_generator("counting").unwrap();
        assert_eq!(generator()["X-Call"], "0");
        assert_eq!(generator()["X-Call"], "1");
    }
}
