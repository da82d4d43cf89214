use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// HTTP methods a task can be issued with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// What a task points at: one URL, or a batch that fans out into one task per URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Single(String),
    Batch(Vec<String>),
}

impl From<&str> for Target {
    fn from(url: &str) -> Self {
        Target::Single(url.to_string())
    }
}

impl From<String> for Target {
    fn from(url: String) -> Self {
        Target::Single(url)
    }
}

impl From<&String> for Target {
    fn from(url: &String) -> Self {
        Target::Single(url.clone())
    }
}

impl From<Vec<String>> for Target {
    fn from(urls: Vec<String>) -> Self {
        Target::Batch(urls)
    }
}

impl From<Vec<&str>> for Target {
    fn from(urls: Vec<&str>) -> Self {
        Target::Batch(urls.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Target {
    fn from(urls: &[&str]) -> Self {
        Target::Batch(urls.iter().map(|url| url.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Target {
    fn from(urls: [&str; N]) -> Self {
        Target::Batch(urls.iter().map(|url| url.to_string()).collect())
    }
}

/// Request payload
///
/// JSON is kept as encoded text so the task stays encodable by non
/// self-describing formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(String),
    Bytes(Vec<u8>),
}

impl RequestBody {
    /// Encode any serializable value as a JSON body
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(RequestBody::Json(serde_json::to_string(value)?))
    }
}

/// Where the headers of a request come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderSource {
    /// Applied verbatim on every attempt
    Static(BTreeMap<String, String>),

    /// Name of a registered generator, invoked fresh on every attempt
    Generated(String),
}

/// What happens with a response once the request succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handler {
    /// Nothing beyond the bookkeeping
    Discard,

    /// Resolve the response and hand it to the named parser
    Parse(String),

    /// Stream the body to a file inside `dir`
    Download {
        dir: PathBuf,
        filename: Option<String>,
    },
}

/// Represents a crawling task to be executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// URL (or URLs) to request
    pub target: Target,

    /// HTTP method
    pub method: HttpMethod,

    /// Query parameters merged into the URL, in order
    pub params: Vec<(String, String)>,

    /// Optional request payload
    pub body: Option<RequestBody>,

    /// Per-request headers (falls back to the crawler defaults when absent)
    pub headers: Option<HeaderSource>,

    /// Pause applied after a successful response, before the handler runs
    pub delay: Option<Duration>,

    /// What to do with the response
    pub handler: Handler,

    /// Whether redirects are followed
    pub allow_redirects: bool,
}

impl Task {
    /// Create a task with no payload that discards its response
    pub fn new(method: HttpMethod, target: impl Into<Target>) -> Self {
        Self {
            target: target.into(),
            method,
            params: Vec::new(),
            body: None,
            headers: None,
            delay: None,
            handler: Handler::Discard,
            allow_redirects: true,
        }
    }

    /// Split a batch task into one single-URL task per target.
    ///
    /// A single-URL task comes back unchanged as the only element.
    pub fn expand(self) -> Vec<Task> {
        let urls = match &self.target {
            Target::Single(_) => None,
            Target::Batch(urls) => Some(urls.clone()),
        };

        match urls {
            None => vec![self],
            Some(urls) => urls
                .into_iter()
                .map(|url| Task {
                    target: Target::Single(url),
                    ..self.clone()
                })
                .collect(),
        }
    }

    /// Encode the task for a durable queue
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decode a task read back from a durable queue
    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}
