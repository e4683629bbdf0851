//! Structured logging
//!
//! Everything here logs through `tracing`; install any subscriber to see it.
//! [`logging_middleware`] times calls, and the `log_*` helpers record the runtime's
//! own lifecycle events with consistent field names.
//!
//! # Example
//!
//! ```rust,ignore
//! use rpc_runtime::logging::{LogConfig, logging_middleware};
//!
//! let logged = Procedure::builder()
//!     .use_middleware_fn(logging_middleware(
//!         LogConfig::new()
//!             .with_slow_call_threshold(250)
//!             .exclude_path("health")
//!             .redact_field("password"),
//!     ));
//! ```

use crate::middleware::{MiddlewareFn, Next, Request, from_fn};
use crate::{Context, RpcErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Unique identifier for a request, used for tracing and correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req_{}", self.0)
    }
}

// =============================================================================
// Middleware
// =============================================================================

/// Settings for [`logging_middleware`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Master switch (default: true)
    pub enabled: bool,
    /// Calls slower than this many milliseconds are logged at warn level
    pub slow_call_threshold_ms: Option<u64>,
    /// Paths that are never logged
    pub excluded_paths: HashSet<String>,
    /// Whether the (redacted) input is included in the completion event
    pub log_input: bool,
    /// Object keys whose values are replaced before logging (substring match, case-insensitive)
    pub redacted_fields: HashSet<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_call_threshold_ms: Some(1000),
            excluded_paths: HashSet::new(),
            log_input: false,
            redacted_fields: ["password", "token", "secret", "authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl LogConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable logging.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Warn about calls slower than `threshold_ms`.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_slow_call_threshold(mut self, threshold_ms: u64) -> Self {
        self.slow_call_threshold_ms = Some(threshold_ms);
        self
    }

    /// Never warn about slow calls.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn without_slow_call_logging(mut self) -> Self {
        self.slow_call_threshold_ms = None;
        self
    }

    /// Skip logging for `path`.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn exclude_path(mut self, path: impl Into<String>) -> Self {
        self.excluded_paths.insert(path.into());
        self
    }

    /// Include the redacted input in completion events.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_input_logging(mut self, enabled: bool) -> Self {
        self.log_input = enabled;
        self
    }

    /// Redact values under keys containing `field`.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn redact_field(mut self, field: impl Into<String>) -> Self {
        self.redacted_fields.insert(field.into().to_lowercase());
        self
    }

    /// Whether calls to `path` are logged at all.
    pub fn should_log_path(&self, path: &str) -> bool {
        self.enabled && !self.excluded_paths.contains(path)
    }

    fn is_slow(&self, duration_ms: u64) -> bool {
        self.slow_call_threshold_ms
            .is_some_and(|threshold| duration_ms > threshold)
    }
}

/// Replace the values of sensitive keys, recursively.
pub fn redact_value(value: &Value, config: &LogConfig) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let key_lower = key.to_lowercase();
                    let sensitive = config
                        .redacted_fields
                        .iter()
                        .any(|field| key_lower.contains(field.as_str()));
                    let val = if sensitive {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        redact_value(val, config)
                    };
                    (key.clone(), val)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(v, config)).collect()),
        other => other.clone(),
    }
}

/// Middleware that logs every call's outcome and duration.
///
/// Successful calls log at debug level, failures at warn (client errors) or
/// error (server errors) level, and slow calls additionally at warn level.
pub fn logging_middleware(config: LogConfig) -> MiddlewareFn {
    let config = Arc::new(config);
    from_fn(move |ctx: Context, req: Request, next: Next| {
        let config = Arc::clone(&config);
        async move {
            if !config.should_log_path(&req.path) {
                return next.run(ctx, req).await;
            }

            let request_id = RequestId::new();
            let path = req.path.clone();
            let procedure_type = req.procedure_type;
            let input = config
                .log_input
                .then(|| redact_value(&req.raw_input, &config));
            tracing::debug!(
                request_id = %request_id,
                path = %path,
                procedure_type = %procedure_type,
                "Call started"
            );

            let start = Instant::now();
            let result = next.run(ctx, req).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result.err() {
                None => tracing::debug!(
                    request_id = %request_id,
                    path = %path,
                    procedure_type = %procedure_type,
                    duration_ms,
                    input = ?input,
                    "Call succeeded"
                ),
                Some(error) if error.code.is_server_error() => tracing::error!(
                    request_id = %request_id,
                    path = %path,
                    procedure_type = %procedure_type,
                    duration_ms,
                    error_code = %error.code,
                    error_message = %error.message,
                    input = ?input,
                    "Call failed"
                ),
                Some(error) => tracing::warn!(
                    request_id = %request_id,
                    path = %path,
                    procedure_type = %procedure_type,
                    duration_ms,
                    error_code = %error.code,
                    error_message = %error.message,
                    input = ?input,
                    "Call rejected"
                ),
            }

            if config.is_slow(duration_ms) {
                tracing::warn!(
                    request_id = %request_id,
                    path = %path,
                    duration_ms,
                    threshold_ms = config.slow_call_threshold_ms,
                    "Slow call"
                );
            }

            result
        }
    })
}

// =============================================================================
// Subscription Events
// =============================================================================

/// Subscription lifecycle events for logging.
#[derive(Debug, Clone)]
pub enum SubscriptionLogEvent {
    /// Subscription was started.
    Started,
    /// A value was forwarded to the client.
    DataSent,
    /// Subscription was stopped by the client or by connection close.
    Stopped,
    /// The source ended on its own.
    Completed,
    /// A second subscription reused a live id and was refused.
    DuplicateRejected,
    /// The source failed.
    Error {
        /// Error code.
        code: RpcErrorCode,
        /// Error message.
        message: String,
    },
}

/// Log a subscription lifecycle event.
pub fn log_subscription_event(subscription_id: &str, path: &str, event: SubscriptionLogEvent) {
    match event {
        SubscriptionLogEvent::Started => {
            tracing::info!(subscription_id = %subscription_id, path = %path, "Subscription started");
        }
        SubscriptionLogEvent::DataSent => {
            tracing::trace!(subscription_id = %subscription_id, path = %path, "Subscription data sent");
        }
        SubscriptionLogEvent::Stopped => {
            tracing::info!(subscription_id = %subscription_id, path = %path, "Subscription stopped");
        }
        SubscriptionLogEvent::Completed => {
            tracing::info!(subscription_id = %subscription_id, path = %path, "Subscription completed");
        }
        SubscriptionLogEvent::DuplicateRejected => {
            tracing::warn!(subscription_id = %subscription_id, path = %path, "Duplicate subscription id rejected");
        }
        SubscriptionLogEvent::Error { code, message } => {
            tracing::warn!(
                subscription_id = %subscription_id,
                path = %path,
                error_code = %code,
                error_message = %message,
                "Subscription error"
            );
        }
    }
}

// =============================================================================
// Connection Events
// =============================================================================

/// Socket connection lifecycle events for logging.
#[derive(Debug, Clone)]
pub enum ConnectionLogEvent {
    /// A connection was opened.
    Opened,
    /// Context creation for the connection failed.
    ContextFailed {
        /// Error code.
        code: RpcErrorCode,
    },
    /// A connection was closed.
    Closed {
        /// Live subscriptions cancelled by the close.
        cancelled_subscriptions: usize,
    },
    /// A reconnect notification was queued.
    ReconnectSent,
}

/// Log a connection lifecycle event.
pub fn log_connection_event(connection_id: &str, event: ConnectionLogEvent) {
    match event {
        ConnectionLogEvent::Opened => {
            tracing::info!(connection_id = %connection_id, "Connection opened");
        }
        ConnectionLogEvent::ContextFailed { code } => {
            tracing::warn!(connection_id = %connection_id, error_code = %code, "Connection context creation failed");
        }
        ConnectionLogEvent::Closed {
            cancelled_subscriptions,
        } => {
            tracing::info!(
                connection_id = %connection_id,
                cancelled_subscriptions,
                "Connection closed"
            );
        }
        ConnectionLogEvent::ReconnectSent => {
            tracing::debug!(connection_id = %connection_id, "Reconnect notification sent");
        }
    }
}

// =============================================================================
// Request Events
// =============================================================================

/// Log a completed HTTP request.
pub fn log_batch_request(
    request_id: &RequestId,
    batch_size: usize,
    error_count: usize,
    status: u16,
    duration_ms: u64,
) {
    tracing::info!(
        request_id = %request_id,
        batch_size,
        success_count = batch_size.saturating_sub(error_count),
        error_count,
        status,
        duration_ms,
        "HTTP request completed"
    );
}

/// Log the result of flattening a router.
pub fn log_router_built(procedure_count: usize) {
    tracing::info!(procedure_count, "Router built");
}
