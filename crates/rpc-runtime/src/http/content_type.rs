//! Content-type decoders
//!
//! A decoder turns the raw request (query string or body) into per-call inputs.
//! [`HttpHandler`](crate::http::HttpHandler) asks each registered decoder in turn
//! whether it matches and uses the first one that does.

use super::types::HttpRequest;
use crate::{RpcError, RpcResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

/// Inputs decoded from one request, keyed by call index.
///
/// A call with no entry gets `null` as its raw input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedInputs(BTreeMap<usize, Value>);

impl DecodedInputs {
    /// No inputs at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The input for a single, non-batched call.
    pub fn single(input: Value) -> Self {
        let mut inputs = BTreeMap::new();
        inputs.insert(0, input);
        Self(inputs)
    }

    /// Set the input of call `index`.
    pub fn insert(&mut self, index: usize, input: Value) {
        self.0.insert(index, input);
    }

    /// Raw input of call `index`.
    pub fn get(&self, index: usize) -> Value {
        self.0.get(&index).cloned().unwrap_or(Value::Null)
    }

    /// Number of calls with an input.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no call has an input.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decodes call inputs for one family of content types.
#[async_trait]
pub trait ContentTypeDecoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this decoder handles `req`.
    fn is_match(&self, req: &HttpRequest) -> bool;

    /// Decode the inputs of `req`.
    async fn decode_inputs(&self, req: &HttpRequest, is_batch: bool) -> RpcResult<DecodedInputs>;
}

// =============================================================================
// JSON
// =============================================================================

/// Default decoder: `?input=<json>` for GET, a JSON body otherwise.
///
/// A batch input must be an object keyed by stringified call index.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

#[async_trait]
impl ContentTypeDecoder for JsonDecoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn is_match(&self, req: &HttpRequest) -> bool {
        if req.method.eq_ignore_ascii_case("GET") {
            return true;
        }
        match req.content_type() {
            None => true,
            Some(content_type) => content_type == "application/json",
        }
    }

    async fn decode_inputs(&self, req: &HttpRequest, is_batch: bool) -> RpcResult<DecodedInputs> {
        let raw = if req.method.eq_ignore_ascii_case("GET") {
            req.query_param("input").map(str::to_owned)
        } else if req.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(req.body.as_bytes()).into_owned())
        };

        let Some(raw) = raw else {
            return Ok(DecodedInputs::empty());
        };
        trace!(size = raw.len(), is_batch, "Decoding JSON input");
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| RpcError::parse_error(format!("Failed to parse input: {e}")))?;

        if !is_batch {
            return Ok(DecodedInputs::single(value));
        }

        let Value::Object(entries) = value else {
            return Err(RpcError::bad_request(
                "\"input\" needs to be an object when doing a batch call",
            ));
        };
        let mut inputs = DecodedInputs::empty();
        for (key, input) in entries {
            let index = key.parse::<usize>().map_err(|_| {
                RpcError::bad_request(format!("Batch input key \"{key}\" is not an index"))
            })?;
            inputs.insert(index, input);
        }
        Ok(inputs)
    }
}

// =============================================================================
// Octet stream
// =============================================================================

/// Decoder for `application/octet-stream` bodies.
///
/// The bytes are handed to the procedure as a JSON array of numbers, which
/// deserializes straight into `Vec<u8>`. Batch calls are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct OctetStreamDecoder;

#[async_trait]
impl ContentTypeDecoder for OctetStreamDecoder {
    fn name(&self) -> &'static str {
        "octet-stream"
    }

    fn is_match(&self, req: &HttpRequest) -> bool {
        req.content_type().as_deref() == Some("application/octet-stream")
    }

    async fn decode_inputs(&self, req: &HttpRequest, is_batch: bool) -> RpcResult<DecodedInputs> {
        if is_batch {
            return Err(RpcError::bad_request(
                "Batching is not supported for octet-stream input",
            ));
        }
        let bytes = req.body.as_bytes();
        trace!(size = bytes.len(), "Decoding octet-stream input");
        Ok(DecodedInputs::single(Value::Array(
            bytes.iter().map(|byte| Value::from(*byte)).collect(),
        )))
    }
}
