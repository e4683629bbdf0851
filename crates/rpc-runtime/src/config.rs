//! Configuration for the HTTP and socket transports.
//!
//! All structs deserialize with defaults for missing fields, so a partial config
//! file works, and validate with [`HttpConfig::validate`] / [`SocketConfig::validate`].
//!
//! # Example
//! ```rust,ignore
//! use rpc_runtime::{BatchConfig, HttpConfig, SocketConfig};
//!
//! let http = HttpConfig::new()
//!     .with_batching(BatchConfig::new().with_max_batch_size(50))
//!     .with_streaming(true)
//!     .with_max_body_size(512 * 1024);
//!
//! let socket = SocketConfig::new().with_max_subscriptions(64);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigValidationError {
    /// batching.max_batch_size must be greater than 0
    InvalidMaxBatchSize,
    /// max_body_size must be greater than 0
    InvalidMaxBodySize,
    /// max_message_size must be greater than 0
    InvalidMaxMessageSize,
    /// max_subscriptions_per_connection must be greater than 0
    InvalidMaxSubscriptions,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMaxBatchSize => {
                write!(f, "batching.max_batch_size must be greater than 0")
            }
            Self::InvalidMaxBodySize => write!(f, "max_body_size must be greater than 0"),
            Self::InvalidMaxMessageSize => {
                write!(f, "max_message_size must be greater than 0")
            }
            Self::InvalidMaxSubscriptions => {
                write!(f, "max_subscriptions_per_connection must be greater than 0")
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

// =============================================================================
// HTTP
// =============================================================================

/// Batch request settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Whether `?batch=1` requests are accepted (default: true)
    pub enabled: bool,
    /// Maximum number of calls in one batch (default: 100)
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 100,
        }
    }
}

impl BatchConfig {
    /// Create a new batch configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration that rejects every batch request.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Enable or disable batching.
    #[must_use = "This method returns a new BatchConfig and does not modify self"]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum batch size.
    #[must_use = "This method returns a new BatchConfig and does not modify self"]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }
}

/// Settings for [`HttpHandler`](crate::http::HttpHandler).
///
/// * `batching` - whether and how large batch calls may be. Default: enabled, 100 calls.
/// * `streaming_enabled` - whether `trpc-batch-mode` streaming is honored. When off,
///   streaming requests fall back to the buffered batch style. Default: true.
/// * `allow_method_override` - whether a POST request may call a query procedure.
///   Default: false.
/// * `max_body_size` - largest accepted request body (or `input` query value) in
///   bytes. Larger requests get `PAYLOAD_TOO_LARGE`. Default: 1MB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Batch request settings
    pub batching: BatchConfig,
    /// Whether streamed responses are allowed
    pub streaming_enabled: bool,
    /// Whether POST may serve queries as well as mutations
    pub allow_method_override: bool,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            batching: BatchConfig::default(),
            streaming_enabled: true,
            allow_method_override: false,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

impl HttpConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return an error if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.batching.max_batch_size == 0 {
            return Err(ConfigValidationError::InvalidMaxBatchSize);
        }
        if self.max_body_size == 0 {
            return Err(ConfigValidationError::InvalidMaxBodySize);
        }
        Ok(())
    }

    /// Set the batch configuration.
    #[must_use = "This method returns a new HttpConfig and does not modify self"]
    pub fn with_batching(mut self, batching: BatchConfig) -> Self {
        self.batching = batching;
        self
    }

    /// Enable or disable streamed responses.
    #[must_use = "This method returns a new HttpConfig and does not modify self"]
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming_enabled = enabled;
        self
    }

    /// Allow POST requests to call queries.
    #[must_use = "This method returns a new HttpConfig and does not modify self"]
    pub fn with_method_override(mut self, allowed: bool) -> Self {
        self.allow_method_override = allowed;
        self
    }

    /// Set the maximum request body size in bytes.
    #[must_use = "This method returns a new HttpConfig and does not modify self"]
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }
}

// =============================================================================
// Socket
// =============================================================================

/// Settings for [`SocketHandler`](crate::ws::SocketHandler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Largest accepted inbound message in bytes (default: 1MB)
    pub max_message_size: usize,
    /// Live subscriptions allowed on one connection (default: 1000)
    pub max_subscriptions_per_connection: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            max_subscriptions_per_connection: 1000,
        }
    }
}

impl SocketConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return an error if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_message_size == 0 {
            return Err(ConfigValidationError::InvalidMaxMessageSize);
        }
        if self.max_subscriptions_per_connection == 0 {
            return Err(ConfigValidationError::InvalidMaxSubscriptions);
        }
        Ok(())
    }

    /// Set the maximum inbound message size in bytes.
    #[must_use = "This method returns a new SocketConfig and does not modify self"]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the per-connection subscription cap.
    #[must_use = "This method returns a new SocketConfig and does not modify self"]
    pub fn with_max_subscriptions(mut self, count: usize) -> Self {
        self.max_subscriptions_per_connection = count;
        self
    }
}
