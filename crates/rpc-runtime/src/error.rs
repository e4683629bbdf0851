//! Error types for RPC operations
//!
//! Every failure that crosses a transport boundary is an [`RpcError`] carrying one of
//! the [`RpcErrorCode`] variants. Each code maps to exactly one HTTP status and one
//! JSON-RPC style negative number, which is what ends up on the wire inside an
//! [`ErrorShape`].
//!
//! # Example
//! ```rust,ignore
//! use rpc_runtime::{RpcError, RpcErrorCode};
//!
//! let error = RpcError::new(RpcErrorCode::NotFound, "User not found");
//! let error = RpcError::not_found("User not found"); // Convenience method
//! assert_eq!(error.code.http_status(), 404);
//! ```

use crate::{Context, ProcedureType};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Type-safe error codes for RPC operations.
///
/// When serialized to JSON, codes are converted to SCREAMING_SNAKE_CASE
/// (e.g., `NotFound` becomes `"NOT_FOUND"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum RpcErrorCode {
    /// Invalid JSON was received
    ParseError,
    /// The request was malformed or its input failed validation
    BadRequest,
    /// Authentication is required
    Unauthorized,
    /// The authenticated caller lacks permission
    Forbidden,
    /// No procedure (or resource) exists at the requested path
    NotFound,
    /// The HTTP method cannot be served
    MethodNotSupported,
    /// The server gave up waiting
    Timeout,
    /// The request conflicts with current state
    Conflict,
    /// A precondition of the request was not met
    PreconditionFailed,
    /// The request payload exceeds size limits
    PayloadTooLarge,
    /// The input was well-formed but semantically wrong
    UnprocessableContent,
    /// Rate limit exceeded
    TooManyRequests,
    /// The client went away before the response was ready
    ClientClosedRequest,
    /// An unexpected internal error occurred
    InternalServerError,
    /// The requested functionality is not implemented
    NotImplemented,
}

impl RpcErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [RpcErrorCode; 15] = [
        Self::ParseError,
        Self::BadRequest,
        Self::Unauthorized,
        Self::Forbidden,
        Self::NotFound,
        Self::MethodNotSupported,
        Self::Timeout,
        Self::Conflict,
        Self::PreconditionFailed,
        Self::PayloadTooLarge,
        Self::UnprocessableContent,
        Self::TooManyRequests,
        Self::ClientClosedRequest,
        Self::InternalServerError,
        Self::NotImplemented,
    ];

    /// Returns the string key of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            Self::Timeout => "TIMEOUT",
            Self::Conflict => "CONFLICT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
        }
    }

    /// HTTP status used when this code is the only outcome of a response.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ParseError | Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotSupported => 405,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::UnprocessableContent => 422,
            Self::TooManyRequests => 429,
            Self::ClientClosedRequest => 499,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
        }
    }

    /// JSON-RPC 2.0 style error number.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::BadRequest => -32600,
            Self::Unauthorized => -32001,
            Self::Forbidden => -32003,
            Self::NotFound => -32004,
            Self::MethodNotSupported => -32005,
            Self::Timeout => -32008,
            Self::Conflict => -32009,
            Self::PreconditionFailed => -32012,
            Self::PayloadTooLarge => -32013,
            Self::UnprocessableContent => -32022,
            Self::TooManyRequests => -32029,
            Self::ClientClosedRequest => -32099,
            Self::InternalServerError | Self::NotImplemented => -32603,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC error with type-safe code and message.
///
/// # Example
/// ```rust,ignore
/// use rpc_runtime::RpcError;
///
/// let error = RpcError::forbidden("Admins only")
///     .with_details(serde_json::json!({"required_role": "admin"}))
///     .with_cause("role lookup returned `viewer`");
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    /// Type-safe error code
    pub code: RpcErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (JSON value)
    pub details: Option<serde_json::Value>,
    /// Optional cause for debugging
    pub cause: Option<String>,
    /// Optional stack trace (only shaped onto the wire in development mode)
    pub stack_trace: Option<String>,
}

impl RpcError {
    /// Create a new error with code and message.
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            cause: None,
            stack_trace: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }

    /// Add a cause string for debugging.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Add a stack trace for debugging.
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Capture the current backtrace if the runtime has backtraces enabled.
    pub fn capture_stack_trace(mut self) -> Self {
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            self.stack_trace = Some(backtrace.to_string());
        }
        self
    }

    /// Wrap a foreign error as `INTERNAL_SERVER_ERROR`.
    ///
    /// The message is kept and the full source chain becomes the cause.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![err.to_string()];
        let mut source = err.source();
        while let Some(inner) = source {
            chain.push(inner.to_string());
            source = inner.source();
        }
        Self::internal(err.to_string())
            .with_cause(chain.join(": "))
            .capture_stack_trace()
    }

    /// Convert a caught panic payload into an error.
    ///
    /// A payload that already is an [`RpcError`] passes through unchanged; string
    /// payloads keep their text; anything else gets a generic message.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<RpcError>() {
            Ok(error) => return *error,
            Err(other) => other,
        };
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            Some((*text).to_string())
        } else {
            payload.downcast_ref::<String>().cloned()
        };
        let error = match message {
            Some(message) => Self::internal(message.clone()).with_cause(message),
            None => Self::internal(RpcErrorCode::InternalServerError.as_str()),
        };
        error.capture_stack_trace()
    }

    /// Apply error configuration before the error is shaped for a client.
    pub fn apply_config(mut self, config: &ErrorConfig) -> Self {
        trace!(
            code = %self.code,
            development_mode = config.development_mode,
            has_transformer = config.transformer.is_some(),
            "Applying error configuration"
        );

        if !config.development_mode {
            self.stack_trace = None;
            self.cause = None;
        }

        if let Some(transformer) = &config.transformer {
            self = transformer.transform(self);
        }

        self
    }

    /// Shape this error for the wire.
    pub fn to_shape(&self, path: Option<&str>, config: &ErrorConfig) -> ErrorShape {
        let error = self.clone().apply_config(config);
        debug!(
            code = %error.code,
            path = path.unwrap_or(""),
            "Shaping error for client response"
        );
        ErrorShape {
            code: error.code.json_rpc_code(),
            message: error.message,
            data: ErrorData {
                code: error.code,
                http_status: error.code.http_status(),
                path: path.map(str::to_string),
                stack: error.stack_trace,
                details: error.details,
            },
        }
    }

    // Convenience constructors

    /// Create a PARSE_ERROR error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ParseError, message)
    }

    /// Create a BAD_REQUEST error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::BadRequest, message)
    }

    /// Create an UNAUTHORIZED error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Unauthorized, message)
    }

    /// Create a FORBIDDEN error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Forbidden, message)
    }

    /// Create a NOT_FOUND error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::NotFound, message)
    }

    /// Create a METHOD_NOT_SUPPORTED error.
    pub fn method_not_supported(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::MethodNotSupported, message)
    }

    /// Create a TIMEOUT error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    /// Create a CONFLICT error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Conflict, message)
    }

    /// Create a PRECONDITION_FAILED error.
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::PreconditionFailed, message)
    }

    /// Create a PAYLOAD_TOO_LARGE error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::PayloadTooLarge, message)
    }

    /// Create an UNPROCESSABLE_CONTENT error.
    pub fn unprocessable_content(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::UnprocessableContent, message)
    }

    /// Create a TOO_MANY_REQUESTS error.
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::TooManyRequests, message)
    }

    /// Create a CLIENT_CLOSED_REQUEST error.
    pub fn client_closed_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ClientClosedRequest, message)
    }

    /// Create an INTERNAL_SERVER_ERROR error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalServerError, message)
    }

    /// Create a NOT_IMPLEMENTED error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::NotImplemented, message)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse_error(err.to_string())
    }
}

impl Serialize for RpcError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("RpcError", 5)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;

        if let Some(ref details) = self.details {
            state.serialize_field("details", details)?;
        }

        if let Some(ref cause) = self.cause {
            state.serialize_field("cause", cause)?;
        }

        if let Some(ref stack_trace) = self.stack_trace {
            state.serialize_field("stack_trace", stack_trace)?;
        }

        state.end()
    }
}

/// Result type alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Drive a boundary future, turning a panic inside it into an [`RpcError`].
pub(crate) async fn catch_panic<T, F>(future: F) -> RpcResult<T>
where
    F: Future<Output = RpcResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(RpcError::from_panic(payload)),
    }
}

// =============================================================================
// Wire Shape
// =============================================================================

/// Transport-agnostic error payload.
///
/// ```json
/// {"code":-32001,"message":"test","data":{"code":"UNAUTHORIZED","httpStatus":401,"path":"greeting"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// JSON-RPC style number
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Structured data
    pub data: ErrorData,
}

/// The `data` member of an [`ErrorShape`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    /// Symbolic code key
    pub code: RpcErrorCode,
    /// Mapped HTTP status
    pub http_status: u16,
    /// Procedure path, when the error belongs to a call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Stack trace, development mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Extra details attached by the thrower
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// =============================================================================
// Error Configuration
// =============================================================================

/// Configuration for error handling behavior.
///
/// # Example
/// ```rust,ignore
/// use rpc_runtime::ErrorConfig;
///
/// let dev_config = ErrorConfig::development();
/// let prod_config = ErrorConfig::production();
///
/// let config = ErrorConfig::new()
///     .with_development_mode(cfg!(debug_assertions))
///     .with_transformer(MyErrorTransformer);
/// ```
#[derive(Clone)]
pub struct ErrorConfig {
    /// Whether to include stack traces and causes in shaped errors
    pub development_mode: bool,
    /// Custom error transformer
    pub transformer: Option<Arc<dyn ErrorTransformer>>,
}

impl ErrorConfig {
    /// Create a new error configuration with default settings.
    pub fn new() -> Self {
        Self {
            development_mode: cfg!(debug_assertions),
            transformer: None,
        }
    }

    /// Create a development mode configuration.
    pub fn development() -> Self {
        Self {
            development_mode: true,
            transformer: None,
        }
    }

    /// Create a production mode configuration.
    pub fn production() -> Self {
        Self {
            development_mode: false,
            transformer: None,
        }
    }

    /// Set development mode.
    #[must_use = "This method returns a new ErrorConfig and does not modify self"]
    pub fn with_development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    /// Set a custom error transformer.
    #[must_use = "This method returns a new ErrorConfig and does not modify self"]
    pub fn with_transformer<T: ErrorTransformer + 'static>(mut self, transformer: T) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorConfig")
            .field("development_mode", &self.development_mode)
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

/// Customizes errors right before they are shaped for a client.
///
/// # Example
/// ```rust,ignore
/// struct HideForbiddenReason;
///
/// impl ErrorTransformer for HideForbiddenReason {
///     fn transform(&self, mut error: RpcError) -> RpcError {
///         if error.code == RpcErrorCode::Forbidden {
///             error.details = None;
///         }
///         error
///     }
/// }
/// ```
pub trait ErrorTransformer: Send + Sync {
    /// Transform an error before it's sent to the client.
    fn transform(&self, error: RpcError) -> RpcError;
}

// =============================================================================
// Error Observer
// =============================================================================

/// Everything known about a failure at the point it is reported.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent<'a> {
    /// The normalized error
    pub error: &'a RpcError,
    /// Procedure path, if the failure belongs to a call
    pub path: Option<&'a str>,
    /// Procedure type, if known
    pub procedure_type: Option<ProcedureType>,
    /// Raw input of the call, if it was decoded
    pub input: Option<&'a serde_json::Value>,
    /// Context, if it was created
    pub ctx: Option<&'a Context>,
}

/// Observer hook that receives every normalized error.
pub type OnErrorFn = Arc<dyn Fn(ErrorEvent<'_>) + Send + Sync>;

/// Box a closure as an [`OnErrorFn`].
pub fn on_error<F>(f: F) -> OnErrorFn
where
    F: Fn(ErrorEvent<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config_development() {
        let config = ErrorConfig::development();
        assert!(config.development_mode);
    }

    #[test]
    fn test_error_config_production() {
        let config = ErrorConfig::production();
        assert!(!config.development_mode);
    }

    #[test]
    fn test_code_mappings() {
        assert_eq!(RpcErrorCode::ParseError.json_rpc_code(), -32700);
        assert_eq!(RpcErrorCode::ParseError.http_status(), 400);
        assert_eq!(RpcErrorCode::Unauthorized.json_rpc_code(), -32001);
        assert_eq!(RpcErrorCode::ClientClosedRequest.http_status(), 499);
        assert_eq!(RpcErrorCode::NotImplemented.json_rpc_code(), -32603);
        assert_eq!(RpcErrorCode::NotImplemented.http_status(), 501);
        assert_eq!(RpcErrorCode::TooManyRequests.as_str(), "TOO_MANY_REQUESTS");
    }

    #[test]
    fn test_shape_matches_wire_format() {
        let error = RpcError::unauthorized("test").with_stack_trace("at greeting");
        let shape = error.to_shape(Some("greeting"), &ErrorConfig::development());

        let json = serde_json::to_value(&shape).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "code": -32001,
                "message": "test",
                "data": {
                    "code": "UNAUTHORIZED",
                    "httpStatus": 401,
                    "path": "greeting",
                    "stack": "at greeting"
                }
            })
        );
    }

    #[test]
    fn test_production_shape_drops_stack() {
        let error = RpcError::internal("boom").with_stack_trace("at main");
        let shape = error.to_shape(None, &ErrorConfig::production());

        assert!(shape.data.stack.is_none());
        assert!(shape.data.path.is_none());
        assert_eq!(shape.message, "boom");
    }

    #[test]
    fn test_from_panic_passes_typed_error_through() {
        let payload: Box<dyn Any + Send> = Box::new(RpcError::forbidden("nope"));
        let error = RpcError::from_panic(payload);
        assert_eq!(error.code, RpcErrorCode::Forbidden);
        assert_eq!(error.message, "nope");
    }

    #[test]
    fn test_from_panic_keeps_string_message() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("db exploded"));
        let error = RpcError::from_panic(payload);
        assert_eq!(error.code, RpcErrorCode::InternalServerError);
        assert_eq!(error.message, "db exploded");
        assert_eq!(error.cause.as_deref(), Some("db exploded"));
    }

    #[test]
    fn test_from_panic_unknown_payload_is_generic() {
        let payload: Box<dyn Any + Send> = Box::new(42_u32);
        let error = RpcError::from_panic(payload);
        assert_eq!(error.code, RpcErrorCode::InternalServerError);
        assert_eq!(error.message, "INTERNAL_SERVER_ERROR");
    }

    #[test]
    fn test_from_error_collects_source_chain() {
        #[derive(Debug, Error)]
        #[error("query failed")]
        struct QueryError(#[source] std::io::Error);

        let err = QueryError(std::io::Error::other("socket closed"));
        let error = RpcError::from_error(&err);

        assert_eq!(error.code, RpcErrorCode::InternalServerError);
        assert_eq!(error.message, "query failed");
        assert_eq!(error.cause.as_deref(), Some("query failed: socket closed"));
    }

    #[test]
    fn test_error_config_with_transformer() {
        struct TestTransformer;
        impl ErrorTransformer for TestTransformer {
            fn transform(&self, mut error: RpcError) -> RpcError {
                error.message = "transformed".to_string();
                error
            }
        }

        let error = RpcError::not_found("original");
        let config = ErrorConfig::development().with_transformer(TestTransformer);

        let shape = error.to_shape(None, &config);
        assert_eq!(shape.message, "transformed");
    }

    #[tokio::test]
    async fn test_catch_panic_converts_panics() {
        let result: RpcResult<()> = catch_panic(async {
            if true {
                panic!("resolver blew up");
            }
            Ok(())
        })
        .await;
        let error = result.unwrap_err();
        assert_eq!(error.code, RpcErrorCode::InternalServerError);
        assert_eq!(error.message, "resolver blew up");
    }
}

// =============================================================================
// Property-Based Tests
// =============================================================================
