//! Asynchronous crawling engine.
//!
//! A [`Crawler`] runs a fixed pool of workers over a LIFO (or FIFO) task
//! queue, either in-process or shared through Redis. Each task is fetched
//! with bounded retries, filtered by status, then either streamed to disk or
//! resolved into an HTML, XML or JSON [`Response`] and handed to a named
//! parser. Parsers receive a [`Dispatcher`] and may queue further tasks; the
//! run ends once every queued task is done.

pub mod config;
pub mod crawler;
pub mod http;
pub mod storage;
pub mod utils;

pub use config::CrawlerConfig;
pub use crawler::{CrawlError, Crawler, Dispatcher, RunReport, Task};
pub use http::{ContentKind, Response, ResponseError};
pub use storage::{QueueBackend, QueueError, QueueOrder};
