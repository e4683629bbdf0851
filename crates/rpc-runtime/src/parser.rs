//! Input and output parsers
//!
//! A [`Parser`] turns an untrusted JSON value into a trusted one, or explains why it
//! cannot. Procedures attach parsers with `.input(..)` and `.output(..)`; the chain
//! executor reports input failures as `BAD_REQUEST` and output failures as
//! `INTERNAL_SERVER_ERROR`.
//!
//! # Example
//! ```rust,ignore
//! use rpc_runtime::parser::{schema, validated};
//!
//! let by_shape = schema::<GetUserInput>();
//! let by_rules = validated::<CreateUserInput>();
//! let by_hand = |value: serde_json::Value| match value.as_i64() {
//!     Some(n) => Ok(serde_json::json!(n)),
//!     None => Err(ParseError::new("expected an integer")),
//! };
//! ```

use crate::validation::{FieldError, Validate};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Why a value was rejected by a [`Parser`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    /// Summary of the failure
    pub message: String,
    /// Field-level issues, if the parser reports them
    pub issues: Vec<FieldError>,
}

impl ParseError {
    /// Create a parse error with no field issues.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            issues: Vec::new(),
        }
    }

    /// Attach field-level issues.
    #[must_use = "This method returns a new ParseError and does not modify self"]
    pub fn with_issues(mut self, issues: Vec<FieldError>) -> Self {
        self.issues = issues;
        self
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// Validates and normalizes a JSON value.
pub trait Parser: Send + Sync {
    /// Parse `value`, returning the value later frames should see.
    fn parse(&self, value: Value) -> Result<Value, ParseError>;
}

impl<F> Parser for F
where
    F: Fn(Value) -> Result<Value, ParseError> + Send + Sync,
{
    fn parse(&self, value: Value) -> Result<Value, ParseError> {
        self(value)
    }
}

/// Parser that checks a value deserializes into `T`.
///
/// The parsed value is `T` serialized back, so unknown fields are dropped and
/// defaults are filled in.
pub struct SchemaParser<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for SchemaParser<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaParser")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Parser for SchemaParser<T>
where
    T: DeserializeOwned + Serialize,
{
    fn parse(&self, value: Value) -> Result<Value, ParseError> {
        let typed: T = serde_json::from_value(value)?;
        Ok(serde_json::to_value(typed)?)
    }
}

/// Parser built from the serde shape of `T`.
pub fn schema<T: DeserializeOwned + Serialize>() -> SchemaParser<T> {
    SchemaParser {
        _marker: PhantomData,
    }
}

/// Parser that deserializes into `T` and then runs its [`Validate`] rules.
pub struct ValidatedParser<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ValidatedParser<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedParser")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Parser for ValidatedParser<T>
where
    T: DeserializeOwned + Serialize + Validate,
{
    fn parse(&self, value: Value) -> Result<Value, ParseError> {
        let typed: T = serde_json::from_value(value)?;
        let result = typed.validate();
        if !result.is_valid() {
            return Err(ParseError::new("Input validation failed").with_issues(result.errors));
        }
        Ok(serde_json::to_value(typed)?)
    }
}

/// Parser built from the serde shape of `T` plus its validation rules.
pub fn validated<T: DeserializeOwned + Serialize + Validate>() -> ValidatedParser<T> {
    ValidatedParser {
        _marker: PhantomData,
    }
}
