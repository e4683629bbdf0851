//! Framework-neutral request and response shapes
//!
//! Server adapters convert their native request into an [`HttpRequest`] and write
//! the returned [`HttpResponse`] back out.

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One header's value or values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// A single value
    Single(String),
    /// Repeated header
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// First value.
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(value) => Some(value),
            Self::Multiple(values) => values.first().map(String::as_str),
        }
    }

    /// Every value, in order.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(value) => vec![value.as_str()],
            Self::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Single(existing) => {
                *self = Self::Multiple(vec![std::mem::take(existing), value]);
            }
            Self::Multiple(values) => values.push(value),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        Self::Multiple(values)
    }
}

/// Case-insensitive header map. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    /// Empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value(s) of `name`.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(&name.to_ascii_lowercase())
    }

    /// First value of `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::first)
    }

    /// Set `name`, replacing previous values.
    pub fn insert(&mut self, name: &str, value: impl Into<HeaderValue>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Add a value to `name`, keeping previous values.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.get_mut(&name.to_ascii_lowercase()) {
            Some(existing) => existing.push(value),
            None => self.insert(name, value),
        }
    }

    /// Remove `name`.
    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no header is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Request
// =============================================================================

/// Raw request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// Text body
    Text(String),
    /// Binary body
    Bytes(Vec<u8>),
}

impl RequestBody {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(text) => text.len(),
            Self::Bytes(bytes) => bytes.len(),
        }
    }

    /// Whether the body is absent or zero-length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Body as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RequestBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// Transport-neutral HTTP request.
///
/// # Example
/// ```rust,ignore
/// let req = HttpRequest::get()
///     .with_query("batch", "1")
///     .with_query("input", r#"{"0":{"x":1},"1":{"x":2}}"#)
///     .with_header("trpc-batch-mode", "stream/json");
/// ```
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// Method, e.g. `GET`
    pub method: String,
    /// Decoded query parameters
    pub query: HashMap<String, Vec<String>>,
    /// Headers
    pub headers: Headers,
    /// Body
    pub body: RequestBody,
}

impl HttpRequest {
    /// Request with the given method and nothing else.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// `GET` request.
    pub fn get() -> Self {
        Self::new("GET")
    }

    /// `POST` request.
    pub fn post() -> Self {
        Self::new("POST")
    }

    /// Add a query parameter value.
    #[must_use = "This method returns a new HttpRequest and does not modify self"]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Add a header value.
    #[must_use = "This method returns a new HttpRequest and does not modify self"]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body.
    #[must_use = "This method returns a new HttpRequest and does not modify self"]
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.first(name)
    }

    /// First value of query parameter `key`.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Media type of the body, lowercased and without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

// =============================================================================
// Response
// =============================================================================

/// Response body: nothing, a complete text, or a stream of text chunks.
pub enum ResponseBody {
    /// No body
    Empty,
    /// Complete body
    Full(String),
    /// Chunks to be written as they arrive
    Stream(BoxStream<'static, String>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(text) => f.debug_tuple("Full").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Transport-neutral HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Headers
    pub headers: Headers,
    /// Body
    pub body: ResponseBody,
}

impl HttpResponse {
    /// Response with `status`, no headers and no body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: ResponseBody::Empty,
        }
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.first(name)
    }

    /// Whether the body is streamed.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Drain the body into one string.
    pub async fn text(self) -> String {
        match self.body {
            ResponseBody::Empty => String::new(),
            ResponseBody::Full(text) => text,
            ResponseBody::Stream(stream) => stream.collect::<Vec<_>>().await.concat(),
        }
    }
}

/// Decode `%XX` escapes. Invalid escapes are kept literally.
pub(crate) fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let (Some(high), Some(low)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            )
        {
            decoded.push((high * 16 + low) as u8);
            i += 3;
            continue;
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
