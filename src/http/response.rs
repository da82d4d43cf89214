use reqwest::header::HeaderMap;
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use sxd_document::Package;
use sxd_xpath::{evaluate_xpath, Value as XPathResult};
use thiserror::Error;
use url::Url;

use crate::crawler::task::HttpMethod;
use crate::http::resolver::ContentKind;
use crate::http::{Cookie, RequestInfo};

/// Errors raised by response accessors
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response body is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },

    #[error("invalid XPath `{expression}`: {reason}")]
    XPath { expression: String, reason: String },

    #[error("response body is not well-formed XML: {0}")]
    Xml(String),

    #[error("expected a {expected:?} response, got {found:?}")]
    WrongKind { expected: ContentKind, found: ContentKind },
}

/// Everything about a response except its body
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Final URL, after redirects
    pub url: Url,
    pub method: HttpMethod,
    pub status: u16,

    /// Canonical reason phrase for the status, if any
    pub reason: Option<String>,

    pub headers: HeaderMap,

    /// Header names and raw values, in wire order
    pub raw_headers: Vec<(String, Vec<u8>)>,

    pub cookies: Vec<Cookie>,
    pub request: RequestInfo,

    /// Declared media type, parameters stripped
    pub content_type: Option<String>,

    /// Declared charset, if any
    pub charset: Option<String>,
}

/// Markup body with its lazily parsed trees
#[derive(Default)]
pub struct Markup {
    tree: OnceCell<Html>,
    selectors: RefCell<HashMap<String, Selector>>,
    xpath_tree: OnceCell<Package>,
}

/// Owned result of an XPath expression
#[derive(Debug, Clone, PartialEq)]
pub enum XPathValue {
    /// String values of the matched nodes, in document order
    Nodes(Vec<String>),
    Boolean(bool),
    Number(f64),
    String(String),
}

impl From<XPathResult<'_>> for XPathValue {
    fn from(value: XPathResult<'_>) -> Self {
        match value {
            XPathResult::Nodeset(nodes) => XPathValue::Nodes(
                nodes.document_order().iter().map(|node| node.string_value()).collect(),
            ),
            XPathResult::Boolean(value) => XPathValue::Boolean(value),
            XPathResult::Number(value) => XPathValue::Number(value),
            XPathResult::String(value) => XPathValue::String(value),
        }
    }
}

/// JSON body with its lazily decoded value
#[derive(Default)]
pub struct JsonBody {
    value: OnceCell<Value>,
}

/// Typed body of a resolved response
pub enum Content {
    Html(Markup),
    Xml(Markup),
    Json(JsonBody),
}

/// A resolved response handed to parsers.
///
/// Parsing is deferred until the first accessor call and the result is
/// cached for the lifetime of the response.
pub struct Response {
    meta: Metadata,
    text: String,
    content: Content,
}

impl Response {
    pub fn new(meta: Metadata, text: String, kind: ContentKind) -> Self {
        let content = match kind {
            ContentKind::Html => Content::Html(Markup::default()),
            ContentKind::Xml => Content::Xml(Markup::default()),
            ContentKind::Json => Content::Json(JsonBody::default()),
        };

        Self { meta, text, content }
    }

    pub fn kind(&self) -> ContentKind {
        match self.content {
            Content::Html(_) => ContentKind::Html,
            Content::Xml(_) => ContentKind::Xml,
            Content::Json(_) => ContentKind::Json,
        }
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }

    pub fn url(&self) -> &Url {
        &self.meta.url
    }

    /// Decoded body text
    pub fn text(&self) -> &str {
        &self.text
    }

    fn markup(&self) -> Result<&Markup, ResponseError> {
        match &self.content {
            Content::Html(markup) | Content::Xml(markup) => Ok(markup),
            Content::Json(_) => Err(ResponseError::WrongKind {
                expected: ContentKind::Html,
                found: ContentKind::Json,
            }),
        }
    }

    /// Parsed document tree (HTML and XML responses)
    pub fn document(&self) -> Result<&Html, ResponseError> {
        let markup = self.markup()?;
        Ok(markup.tree.get_or_init(|| Html::parse_document(&self.text)))
    }

    /// Elements matching a CSS selector; compiled selectors are cached per expression
    pub fn select(&self, css: &str) -> Result<Vec<ElementRef<'_>>, ResponseError> {
        let document = self.document()?;
        let markup = self.markup()?;

        let mut selectors = markup.selectors.borrow_mut();
        if !selectors.contains_key(css) {
            let selector = Selector::parse(css).map_err(|e| ResponseError::Selector {
                selector: css.to_string(),
                reason: format!("{:?}", e),
            })?;
            selectors.insert(css.to_string(), selector);
        }

        let found = document.select(&selectors[css]).collect();
        Ok(found)
    }

    /// Tree used for XPath queries, built on first use.
    ///
    /// HTML goes through an HTML5 parser; XML must be well formed, and a
    /// parse failure is not cached.
    fn xpath_tree(&self) -> Result<&Package, ResponseError> {
        let markup = self.markup()?;
        if let Some(package) = markup.xpath_tree.get() {
            return Ok(package);
        }

        let package = match self.content {
            Content::Xml(_) => sxd_document::parser::parse(&self.text)
                .map_err(|e| ResponseError::Xml(format!("{:?}", e)))?,
            _ => sxd_html::parse_html(&self.text),
        };
        Ok(markup.xpath_tree.get_or_init(|| package))
    }

    /// Evaluate an XPath expression against the document (HTML and XML responses)
    pub fn xpath(&self, expression: &str) -> Result<XPathValue, ResponseError> {
        let package = self.xpath_tree()?;
        let document = package.as_document();

        let value = evaluate_xpath(&document, expression).map_err(|e| ResponseError::XPath {
            expression: expression.to_string(),
            reason: format!("{:?}", e),
        })?;
        Ok(XPathValue::from(value))
    }

    /// Decoded JSON value (JSON responses).
    ///
    /// A decode failure is not cached; every call retries and fails the same way.
    pub fn json(&self) -> Result<&Value, ResponseError> {
        let body = match &self.content {
            Content::Json(body) => body,
            other => {
                return Err(ResponseError::WrongKind {
                    expected: ContentKind::Json,
                    found: match other {
                        Content::Xml(_) => ContentKind::Xml,
                        _ => ContentKind::Html,
                    },
                })
            }
        };

        if let Some(value) = body.value.get() {
            return Ok(value);
        }

        let value = serde_json::from_str(&self.text).map_err(ResponseError::Decode)?;
        Ok(body.value.get_or_init(|| value))
    }

    /// Deserialize the JSON body into a typed value
    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        let value = self.json()?;
        T::deserialize(value).map_err(ResponseError::Decode)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;

    /// Metadata for a plain 200 response to `GET url`
    pub(crate) fn meta(url: &str) -> Metadata {
        let url = Url::parse(url).unwrap();
        Metadata {
            url: url.clone(),
            method: HttpMethod::Get,
            status: 200,
            reason: Some("OK".to_string()),
            headers: HeaderMap::new(),
            raw_headers: Vec::new(),
            cookies: Vec::new(),
            request: RequestInfo {
                method: HttpMethod::Get,
                url,
                headers: HeaderMap::new(),
            },
            content_type: None,
            charset: None,
        }
    }

    const PAGE: &str = r#"<html><head><title>Shop</title></head>
        <body><ul><li class="item">a</li><li class="item">b</li></ul></body></html>"#;

    #[test]
    fn test_document_is_parsed_once() {
        let response = Response::new(meta("http://x.test/"), PAGE.to_string(), ContentKind::Html);

        let first = response.document().unwrap();
        let second = response.document().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_select_items() {
        let response = Response::new(meta("http://x.test/"), PAGE.to_string(), ContentKind::Html);

        let items = response.select("li.item").unwrap();
        let texts: Vec<String> = items.iter().map(|item| item.text().collect()).collect();
        assert_eq!(texts, vec!["a", "b"]);

        // Cached selector gives the same answer
        assert_eq!(response.select("li.item").unwrap().len(), 2);
        assert_eq!(response.select("title").unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_selector() {
        let response = Response::new(meta("http://x.test/"), PAGE.to_string(), ContentKind::Html);
        assert!(matches!(response.select("li[[["), Err(ResponseError::Selector { .. })));
    }

    #[test]
    fn test_json_is_cached() {
        let response = Response::new(meta("http://x.test/api"), r#"{"items": [1, 2]}"#.to_string(), ContentKind::Json);

        let first = response.json().unwrap();
        let second = response.json().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first["items"][1], 2);
    }

    #[test]
    fn test_json_as_typed() {
        #[derive(Deserialize)]
        struct Page {
            items: Vec<u32>,
        }

        let response = Response::new(meta("http://x.test/api"), r#"{"items": [1, 2]}"#.to_string(), ContentKind::Json);
        let page: Page = response.json_as().unwrap();
        assert_eq!(page.items, vec![1, 2]);
    }

    #[test]
    fn test_decode_error_is_distinct() {
        let response = Response::new(meta("http://x.test/api"), "{not json".to_string(), ContentKind::Json);
        assert!(matches!(response.json(), Err(ResponseError::Decode(_))));
        assert!(matches!(response.json(), Err(ResponseError::Decode(_))));
    }

    #[test]
    fn test_wrong_kind() {
        let html = Response::new(meta("http://x.test/"), PAGE.to_string(), ContentKind::Html);
        assert!(matches!(
            html.json(),
            Err(ResponseError::WrongKind { expected: ContentKind::Json, found: ContentKind::Html })
        ));

        let json = Response::new(meta("http://x.test/api"), "{}".to_string(), ContentKind::Json);
        assert!(matches!(json.document(), Err(ResponseError::WrongKind { .. })));
    }

    #[test]
    fn test_xpath_on_html() {
        let response = Response::new(meta("http://x.test/"), PAGE.to_string(), ContentKind::Html);

        assert_eq!(
            response.xpath("//li[@class='item']").unwrap(),
            XPathValue::Nodes(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(response.xpath("count(//li)").unwrap(), XPathValue::Number(2.0));

        // Same tree on the second call
        let first = response.xpath_tree().unwrap() as *const Package;
        let second = response.xpath_tree().unwrap() as *const Package;
        assert_eq!(first, second);
    }

    #[test]
    fn test_xpath_on_xml() {
        let feed = r#"<rss><channel><item><title>one</title></item><item><title>two</title></item></channel></rss>"#;
        let response = Response::new(meta("http://x.test/feed"), feed.to_string(), ContentKind::Xml);

        assert_eq!(
            response.xpath("/rss/channel/item/title").unwrap(),
            XPathValue::Nodes(vec!["one".to_string(), "two".to_string()])
        );
        assert_eq!(response.xpath("string(//item[2]/title)").unwrap(), XPathValue::String("two".to_string()));
        assert_eq!(response.xpath("boolean(//missing)").unwrap(), XPathValue::Boolean(false));
    }

    #[test]
    fn test_xpath_errors() {
        let html = Response::new(meta("http://x.test/"), PAGE.to_string(), ContentKind::Html);
        assert!(matches!(html.xpath("//li[@"), Err(ResponseError::XPath { .. })));

        let broken = Response::new(meta("http://x.test/feed"), "<rss><channel>".to_string(), ContentKind::Xml);
        assert!(matches!(broken.xpath("//channel"), Err(ResponseError::Xml(_))));
        assert!(matches!(broken.xpath("//channel"), Err(ResponseError::Xml(_))));

        let json = Response::new(meta("http://x.test/api"), "{}".to_string(), ContentKind::Json);
        assert!(matches!(json.xpath("//a"), Err(ResponseError::WrongKind { .. })));
    }

    #[test]
    fn test_xml_uses_markup_accessors() {
        let feed = r#"<rss><channel><item><title>one</title></item></channel></rss>"#;
        let response = Response::new(meta("http://x.test/feed"), feed.to_string(), ContentKind::Xml);

        assert_eq!(response.kind(), ContentKind::Xml);
        assert_eq!(response.select("item title").unwrap().len(), 1);
    }
}
