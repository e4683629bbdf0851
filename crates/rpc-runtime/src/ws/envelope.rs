//! Socket message envelopes
//!
//! ```text
//! -> {"id":1,"method":"subscription","params":{"path":"onEvent","input":5}}
//! <- {"id":1,"result":{"type":"started"}}
//! <- {"id":1,"result":{"type":"data","data":15}}
//! -> {"id":1,"method":"subscription.stop"}
//! <- {"id":1,"result":{"type":"stopped"}}
//! <- {"id":null,"method":"reconnect"}
//! ```

use crate::{ErrorShape, ProcedureType, RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

/// Client-chosen id correlating a request with its responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeId {
    /// Numeric id, integral or not
    Number(Number),
    /// String id
    String(String),
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EnvelopeId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// The only accepted `jsonrpc` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsonRpcVersion {
    /// `"2.0"`
    #[serde(rename = "2.0")]
    V2,
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketMethod {
    /// Run a query once
    #[serde(rename = "query")]
    Query,
    /// Run a mutation once
    #[serde(rename = "mutation")]
    Mutation,
    /// Start a subscription
    #[serde(rename = "subscription")]
    Subscription,
    /// Stop the subscription with the request's id
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl SocketMethod {
    /// Procedure type served by this method; `None` for stop requests.
    pub fn procedure_type(&self) -> Option<ProcedureType> {
        match self {
            Self::Query => Some(ProcedureType::Query),
            Self::Mutation => Some(ProcedureType::Mutation),
            Self::Subscription => Some(ProcedureType::Subscription),
            Self::SubscriptionStop => None,
        }
    }
}

/// Target of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketParams {
    /// Dotted procedure path
    pub path: String,
    /// Raw input, `null` when absent
    #[serde(default)]
    pub input: Value,
}

/// One inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketRequest {
    /// Correlation id; `null` is parsed but rejected when handled
    #[serde(default)]
    pub id: Option<EnvelopeId>,
    /// Echoed on every response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<JsonRpcVersion>,
    /// What to do
    pub method: SocketMethod,
    /// Required for everything except `subscription.stop`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<SocketParams>,
}

/// Parse an inbound message: one envelope or an array of them.
pub fn parse_message(text: &str) -> RpcResult<Vec<SocketRequest>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RpcError::parse_error(format!("Failed to parse message: {e}")))?;
    let raw = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    raw.into_iter()
        .map(|item| {
            let request: SocketRequest = serde_json::from_value(item)
                .map_err(|e| RpcError::parse_error(format!("Invalid envelope: {e}")))?;
            if request.method != SocketMethod::SubscriptionStop && request.params.is_none() {
                return Err(RpcError::parse_error("`params` is required"));
            }
            Ok(request)
        })
        .collect()
}

// =============================================================================
// Outbound
// =============================================================================

/// Successful payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SocketResult {
    /// A query/mutation result or one subscription value
    Data {
        /// The value
        data: Value,
    },
    /// The subscription is live
    Started,
    /// The subscription ended
    Stopped,
}

/// Result or error of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketOutcome {
    /// `"result": {..}`
    Result(SocketResult),
    /// `"error": {..}`
    Error(ErrorShape),
}

/// One outbound response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketResponse {
    /// Id of the request this answers; `null` for connection-level errors
    pub id: Option<EnvelopeId>,
    /// Echo of the request's `jsonrpc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<JsonRpcVersion>,
    /// Outcome
    #[serde(flatten)]
    pub outcome: SocketOutcome,
}

impl SocketResponse {
    /// Success response.
    pub fn result(id: Option<EnvelopeId>, jsonrpc: Option<JsonRpcVersion>, result: SocketResult) -> Self {
        Self {
            id,
            jsonrpc,
            outcome: SocketOutcome::Result(result),
        }
    }

    /// Error response.
    pub fn error(id: Option<EnvelopeId>, jsonrpc: Option<JsonRpcVersion>, error: ErrorShape) -> Self {
        Self {
            id,
            jsonrpc,
            outcome: SocketOutcome::Error(error),
        }
    }
}

/// Server notification asking every client to reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectNotification {
    /// Always `null`
    pub id: Option<EnvelopeId>,
    /// Always `"reconnect"`
    pub method: String,
}

impl Default for ReconnectNotification {
    fn default() -> Self {
        Self {
            id: None,
            method: "reconnect".to_string(),
        }
    }
}
