//! HTTP transport
//!
//! Framework-neutral: an adapter converts its native request into an
//! [`HttpRequest`], calls [`HttpHandler::handle`] and writes the [`HttpResponse`]
//! back, streaming the body when [`HttpResponse::is_streaming`] says so.
//!
//! ```text
//! GET  /users.get?input={"id":1}                          single query
//! POST /users.create   {"name":"ada"}                     single mutation
//! GET  /a,b?batch=1&input={"0":{..},"1":{..}}             batch, JSON array
//! GET  /a,b?batch=1 + trpc-batch-mode: stream/json        batch, streamed
//! ```

mod content_type;
mod formatter;
mod resolve;
mod types;

pub use content_type::{ContentTypeDecoder, DecodedInputs, JsonDecoder, OctetStreamDecoder};
pub use formatter::{
    BodyFormatter, ResponseItem, ResponseMeta, ResponseMetaArgs, ResponseMetaFn, ResponseStyle,
    ResultData, StreamMode, aggregate_status, response_meta,
};
pub use resolve::HttpHandler;
pub use types::{HeaderValue, Headers, HttpRequest, HttpResponse, RequestBody, ResponseBody};
