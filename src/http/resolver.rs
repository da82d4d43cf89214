use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;
use url::Url;

use crate::http::response::{Metadata, Response};
use crate::http::{RawResponse, TransportError};

/// Body variant a response resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    Html,
    Xml,
    Json,
}

/// Known media types
const CONTENT_TYPES: &[(&str, ContentKind)] = &[
    ("text/html", ContentKind::Html),
    ("application/xhtml+xml", ContentKind::Html),
    ("application/vnd.wap.xhtml+xml", ContentKind::Html),
    ("application/xml", ContentKind::Xml),
    ("text/xml", ContentKind::Xml),
    ("application/atom+xml", ContentKind::Xml),
    ("application/rdf+xml", ContentKind::Xml),
    ("application/rss+xml", ContentKind::Xml),
    ("application/json", ContentKind::Json),
    ("application/x-json", ContentKind::Json),
    ("application/json-amazonui-streaming", ContentKind::Json),
    ("application/javascript", ContentKind::Json),
    ("application/x-javascript", ContentKind::Json),
];

/// Media types guessed from a URL path extension
const EXTENSIONS: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("shtml", "text/html"),
    ("xhtml", "application/xhtml+xml"),
    ("xml", "application/xml"),
    ("xsl", "application/xml"),
    ("rss", "application/rss+xml"),
    ("atom", "application/atom+xml"),
    ("rdf", "application/rdf+xml"),
    ("json", "application/json"),
    ("js", "application/javascript"),
];

/// Map a media type (parameters allowed) to a body variant
pub fn kind_for_media_type(media_type: &str) -> Option<ContentKind> {
    let essence = media_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

    if let Some((_, kind)) = CONTENT_TYPES.iter().find(|(known, _)| *known == essence) {
        return Some(*kind);
    }

    // Vendor feeds and scripts under other top-level types
    let (_, subtype) = essence.split_once('/')?;
    match subtype {
        "rss+xml" | "atom+xml" | "rdf+xml" => Some(ContentKind::Xml),
        "javascript" | "x-javascript" => Some(ContentKind::Json),
        _ => None,
    }
}

/// Guess a media type from the extension of the last path segment
fn guess_media_type(url: &Url) -> Option<&'static str> {
    let segment = url.path_segments()?.last()?;
    let (_, extension) = segment.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();

    EXTENSIONS
        .iter()
        .find(|(known, _)| *known == extension)
        .map(|(_, media_type)| *media_type)
}

/// Decide which variant a response resolves to.
///
/// The URL extension wins over declared `Content-Type` headers; anything
/// unrecognized is treated as HTML.
pub fn classify(url: &Url, headers: &HeaderMap) -> ContentKind {
    if let Some(kind) = guess_media_type(url).and_then(kind_for_media_type) {
        return kind;
    }

    headers
        .get_all(CONTENT_TYPE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(kind_for_media_type)
        .unwrap_or(ContentKind::Html)
}

/// Split a `Content-Type` value into its media type and charset
fn content_type_parts(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let value = match headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()) {
        Some(value) => value,
        None => return (None, None),
    };

    let mut parts = value.split(';');
    let media_type = parts
        .next()
        .map(|essence| essence.trim().to_ascii_lowercase())
        .filter(|essence| !essence.is_empty());

    let charset = parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase());

    (media_type, charset)
}

/// Decode a body in its declared charset, UTF-8 when none is declared or the label is unknown.
///
/// Malformed sequences are replaced, not rejected.
fn decode(url: &Url, bytes: &[u8], charset: Option<&str>) -> String {
    let encoding = match charset {
        Some(label) => Encoding::for_label(label.as_bytes()).unwrap_or_else(|| {
            debug!("Unknown charset {} for {}, decoding as UTF-8", label, url);
            UTF_8
        }),
        None => UTF_8,
    };

    let (text, used, malformed) = encoding.decode(bytes);
    if malformed {
        debug!("Replaced malformed {} sequences in {}", used.name(), url);
    }
    text.into_owned()
}

/// Read the whole body and wrap it in the matching [`Response`] variant
pub async fn resolve(raw: RawResponse) -> Result<Response, TransportError> {
    let RawResponse {
        url,
        status,
        headers,
        cookies,
        request,
        mut body,
    } = raw;

    let kind = classify(&url, &headers);

    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).await?;

    let (content_type, charset) = content_type_parts(&headers);
    let text = decode(&url, &bytes, charset.as_deref());

    let raw_headers = headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();

    let meta = Metadata {
        method: request.method,
        status: status.as_u16(),
        reason: status.canonical_reason().map(str::to_string),
        raw_headers,
        headers,
        cookies,
        request,
        content_type,
        charset,
        url,
    };

    Ok(Response::new(meta, text, kind))
}
