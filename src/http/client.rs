use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{redirect, Client};
use std::io;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::HttpSettings;
use crate::crawler::task::RequestBody;
use crate::http::{Cookie, PreparedRequest, RawResponse, RequestInfo, Transport, TransportError};

/// [`Transport`] backed by `reqwest`
pub struct ReqwestTransport {
    /// Client that follows redirects
    follow: Client,

    /// Client that returns redirects as-is
    manual: Client,

    /// Sent unless the request opts out of automatic headers
    user_agent: HeaderValue,
}

impl ReqwestTransport {
    /// Create both clients with a shared cookie store setting
    pub fn new(settings: &HttpSettings) -> Result<Self, TransportError> {
        let follow = Client::builder()
            .cookie_store(true)
            .build()?;

        let manual = Client::builder()
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .build()?;

        let user_agent = HeaderValue::from_str(&settings.user_agent)
            .map_err(|e| TransportError::InvalidRequest(format!("user agent: {}", e)))?;

        Ok(Self {
            follow,
            manual,
            user_agent,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse, TransportError> {
        let client = if request.allow_redirects { &self.follow } else { &self.manual };
        let mut headers = request.headers;

        // Encode the body ourselves so no Content-Type sneaks in when the caller opted out
        let (body, content_type) = match request.body {
            Some(RequestBody::Form(pairs)) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter())
                    .finish();
                (Some(encoded.into_bytes()), Some("application/x-www-form-urlencoded"))
            }
            Some(RequestBody::Json(text)) => (Some(text.into_bytes()), Some("application/json")),
            Some(RequestBody::Bytes(bytes)) => (Some(bytes), None),
            None => (None, None),
        };

        if !request.skip_auto_headers {
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, self.user_agent.clone());
            }
            if let Some(content_type) = content_type {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
            }
        }

        let info = RequestInfo {
            method: request.method,
            url: request.url.clone(),
            headers: headers.clone(),
        };

        let mut builder = client
            .request(request.method.into(), request.url)
            .headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        debug!("{} {} answered {}", info.method, info.url, response.status());

        // Snapshot everything before the body is turned into a stream
        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let cookies = response
            .cookies()
            .map(|cookie| Cookie {
                name: cookie.name().to_string(),
                value: cookie.value().to_string(),
                domain: cookie.domain().map(str::to_string),
                path: cookie.path().map(str::to_string),
            })
            .collect();

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        Ok(RawResponse {
            url,
            status,
            headers,
            cookies,
            request: info,
            body: Box::new(StreamReader::new(Box::pin(stream))),
        })
    }
}
