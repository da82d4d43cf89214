pub mod controller;
pub mod dispatcher;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod session;
pub mod task;
pub mod url;

// Re-export common types
pub use controller::{CrawlError, Crawler};
pub use dispatcher::{Dispatcher, TaskBuilder};
pub use executor::{ExecuteError, Executor, Outcome};
pub use pool::{PoolError, WorkerPool, Workers};
pub use registry::{HeaderFn, ParserFn, Registry};
pub use session::{InFlight, RunReport, Session};
pub use task::{Handler, HeaderSource, HttpMethod, RequestBody, Target, Task};
