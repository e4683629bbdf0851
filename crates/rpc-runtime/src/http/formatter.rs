//! Response styles and body formatting
//!
//! Four styles serialize the results of one HTTP request:
//!
//! | Style          | Order            | Body                                         |
//! |----------------|------------------|----------------------------------------------|
//! | `Single`       | n/a              | the one item                                 |
//! | `Batch`        | call index       | JSON array                                   |
//! | `JsonStream`   | completion order | `{"0":item\n,"1":item\n}` written as it goes |
//! | `EventStream`  | completion order | server-sent events between start/end events  |
//!
//! Streamed frames carry their own index, so a client can match each frame to its
//! call without waiting for the rest.

use super::types::Headers;
use crate::{Context, ErrorShape, ProcedureType, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// How the results of one request are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStyle {
    /// One call, not batched
    Single,
    /// Buffered array, index ordered
    Batch,
    /// Newline separated JSON frames, arrival ordered
    JsonStream,
    /// Server-sent events, arrival ordered
    EventStream,
}

impl ResponseStyle {
    /// `Content-Type` of a response in this style.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::EventStream => "text/event-stream",
            _ => "application/json",
        }
    }

    /// Whether frames are written as calls complete.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::JsonStream | Self::EventStream)
    }
}

/// Streaming mode requested with the `trpc-batch-mode` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    /// `stream/json`, or the older bare `stream`
    Json,
    /// `stream/sse`
    Sse,
}

impl StreamMode {
    /// Name of the negotiating header.
    pub const HEADER: &'static str = "trpc-batch-mode";

    /// Parse a header value. Unknown values request no streaming.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim() {
            "stream/json" => Some(Self::Json),
            "stream" => Some(Self::Json),
            "stream/sse" => Some(Self::Sse),
            other => {
                warn!(value = %other, "Unknown trpc-batch-mode requested");
                None
            }
        }
    }

    /// Style used to answer a streaming batch in this mode.
    pub fn style(&self) -> ResponseStyle {
        match self {
            Self::Json => ResponseStyle::JsonStream,
            Self::Sse => ResponseStyle::EventStream,
        }
    }
}

// =============================================================================
// Items
// =============================================================================

/// Successful payload of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultData {
    /// Resolver output (or one chunk of it)
    pub data: Value,
}

/// One serialized call outcome.
///
/// `id` is only set on streamed chunks, where it names the call index the chunk
/// belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseItem {
    /// `{"result":{"data":..}}`
    Result {
        /// The data
        result: ResultData,
        /// Owning call index, for chunks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<usize>,
    },
    /// `{"error":{..}}`
    Error {
        /// The shaped error
        error: ErrorShape,
        /// Owning call index, for chunks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<usize>,
    },
}

impl ResponseItem {
    /// Successful result.
    pub fn data(data: Value) -> Self {
        Self::Result {
            result: ResultData { data },
            id: None,
        }
    }

    /// One chunk of a streamed result, owned by call `owner`.
    pub fn chunk(owner: usize, data: Value) -> Self {
        Self::Result {
            result: ResultData { data },
            id: Some(owner),
        }
    }

    /// Failed result.
    pub fn error(error: ErrorShape) -> Self {
        Self::Error { error, id: None }
    }

    /// Whether this item reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// HTTP status this item alone would produce.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Result { .. } => 200,
            Self::Error { error, .. } => error.data.http_status,
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize response item");
            r#"{"error":{"code":-32603,"message":"Failed to serialize response","data":{"code":"INTERNAL_SERVER_ERROR","httpStatus":500}}}"#.to_string()
        })
    }
}

/// Overall status for a set of items.
///
/// All successes (or nothing known yet) give 200. All failures sharing one status
/// give that status. Anything else gives 207.
pub fn aggregate_status(items: &[ResponseItem]) -> u16 {
    if items.iter().all(|item| !item.is_error()) {
        return 200;
    }
    let first = items[0].http_status();
    if items
        .iter()
        .all(|item| item.is_error() && item.http_status() == first)
    {
        first
    } else {
        207
    }
}

// =============================================================================
// Response meta hook
// =============================================================================

/// Overrides returned by the response meta hook.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    /// Status to use instead of the computed one
    pub status: Option<u16>,
    /// Extra headers, set after the defaults
    pub headers: Headers,
}

/// What the response meta hook gets to see.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMetaArgs<'a> {
    /// Requested paths, in call order
    pub paths: &'a [String],
    /// Procedure type served by the request method, if it maps to one
    pub procedure_type: Option<ProcedureType>,
    /// The request context, if it was created
    pub ctx: Option<&'a Context>,
    /// Items known when the head is written; empty for streamed responses
    pub items: &'a [ResponseItem],
    /// Errors known when the head is written
    pub errors: &'a [RpcError],
    /// Whether the head is written before any result is known
    pub eager_generation: bool,
}

/// Hook deciding the status and extra headers of a response.
pub type ResponseMetaFn = Arc<dyn Fn(ResponseMetaArgs<'_>) -> ResponseMeta + Send + Sync>;

/// Box a closure as a [`ResponseMetaFn`].
///
/// ```rust,ignore
/// let meta = response_meta(|args| {
///     let mut meta = ResponseMeta::default();
///     if args.errors.is_empty() && args.procedure_type == Some(ProcedureType::Query) {
///         meta.headers.insert("cache-control", "s-maxage=1");
///     }
///     meta
/// });
/// ```
pub fn response_meta<F>(f: F) -> ResponseMetaFn
where
    F: Fn(ResponseMetaArgs<'_>) -> ResponseMeta + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Body formatter
// =============================================================================

/// Incrementally serializes items in one [`ResponseStyle`].
///
/// Call [`open`](Self::open) once before the first frame, [`format`](Self::format)
/// per item and [`end`](Self::end) at the close. Buffered styles return nothing from
/// `format` and everything from `end`.
#[derive(Debug)]
pub struct BodyFormatter {
    style: ResponseStyle,
    buffered: BTreeMap<usize, ResponseItem>,
    frames: usize,
    opened: bool,
    ended: Option<String>,
}

impl BodyFormatter {
    /// New formatter for `style`.
    pub fn new(style: ResponseStyle) -> Self {
        Self {
            style,
            buffered: BTreeMap::new(),
            frames: 0,
            opened: false,
            ended: None,
        }
    }

    /// Style this formatter writes.
    pub fn style(&self) -> ResponseStyle {
        self.style
    }

    /// Text written before any frame. Only the first call returns something.
    pub fn open(&mut self) -> String {
        if self.opened {
            return String::new();
        }
        self.opened = true;
        match self.style {
            ResponseStyle::EventStream => "data: {\"type\":\"start\"}\n\n".to_string(),
            _ => String::new(),
        }
    }

    /// Frame for `item` at `index`, or `None` for buffered styles.
    pub fn format(&mut self, index: usize, item: ResponseItem) -> Option<String> {
        match self.style {
            ResponseStyle::Single | ResponseStyle::Batch => {
                self.buffered.insert(index, item);
                None
            }
            ResponseStyle::JsonStream => {
                let prefix = if self.frames == 0 { "{" } else { "\n," };
                self.frames += 1;
                Some(format!("{prefix}\"{index}\":{}", item.to_json()))
            }
            ResponseStyle::EventStream => {
                self.frames += 1;
                Some(format!("id: {index}\ndata: {}\n\n", item.to_json()))
            }
        }
    }

    /// Closing text. Later calls return the same text again.
    pub fn end(&mut self) -> String {
        if let Some(ended) = &self.ended {
            return ended.clone();
        }
        let ended = match self.style {
            ResponseStyle::Single => self
                .buffered
                .values()
                .next()
                .map(ResponseItem::to_json)
                .unwrap_or_else(|| "{}".to_string()),
            ResponseStyle::Batch => {
                let items: Vec<String> = self.buffered.values().map(ResponseItem::to_json).collect();
                format!("[{}]", items.join(","))
            }
            ResponseStyle::JsonStream if self.frames == 0 => "{}".to_string(),
            ResponseStyle::JsonStream => "\n}".to_string(),
            ResponseStyle::EventStream => "data: {\"type\":\"end\"}\n\n".to_string(),
        };
        self.ended = Some(ended.clone());
        ended
    }
}
