//! Field-level validation rules
//!
//! Input types implement [`Validate`] and are attached to a procedure with
//! [`validated`](crate::parser::validated). Failures surface as the `issues` of a
//! [`ParseError`](crate::parser::ParseError) and end up in the `BAD_REQUEST` details.
//!
//! # Example
//!
//! ```rust,ignore
//! use rpc_runtime::validation::{Validate, ValidationResult, ValidationRules};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct CreateUserInput {
//!     name: String,
//!     email: String,
//!     age: i64,
//! }
//!
//! impl Validate for CreateUserInput {
//!     fn validate(&self) -> ValidationResult {
//!         ValidationRules::new()
//!             .required("name", &self.name)
//!             .max_length("name", &self.name, 100)
//!             .email("email", &self.email)
//!             .range("age", self.age, 0, 150)
//!             .build()
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Validation failure for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the offending field
    pub field: String,
    /// Human-readable message
    pub message: String,
    /// Machine-readable rule name (`required`, `email`, ...)
    pub code: String,
}

impl FieldError {
    /// Create a field error
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: code.into(),
        }
    }

    /// Create a "required" field error
    pub fn required(field: &str) -> Self {
        Self::new(field, format!("{field} is required"), "required")
    }

    /// Create a "min_length" field error
    pub fn min_length(field: &str, min: usize) -> Self {
        Self::new(
            field,
            format!("{field} must be at least {min} characters"),
            "min_length",
        )
    }

    /// Create a "max_length" field error
    pub fn max_length(field: &str, max: usize) -> Self {
        Self::new(
            field,
            format!("{field} must be at most {max} characters"),
            "max_length",
        )
    }

    /// Create a "range" field error
    pub fn range(field: &str, min: i64, max: i64) -> Self {
        Self::new(
            field,
            format!("{field} must be between {min} and {max}"),
            "range",
        )
    }

    /// Create a "pattern" field error
    pub fn pattern(field: &str, pattern: &str) -> Self {
        Self::new(
            field,
            format!("{field} must match pattern: {pattern}"),
            "pattern",
        )
    }

    /// Create an "email" field error
    pub fn email(field: &str) -> Self {
        Self::new(field, format!("{field} must be a valid email address"), "email")
    }
}

/// Outcome of validating an input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Field errors; empty means valid
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    /// A passing result
    pub fn ok() -> Self {
        Self::default()
    }

    /// A result carrying `errors` (valid when the list is empty)
    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        Self { errors }
    }

    /// Whether validation passed
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors grouped by field, in field order
    pub fn errors_by_field(&self) -> BTreeMap<&str, Vec<&FieldError>> {
        let mut map: BTreeMap<&str, Vec<&FieldError>> = BTreeMap::new();
        for error in &self.errors {
            map.entry(error.field.as_str()).or_default().push(error);
        }
        map
    }

    /// Combine two results
    #[must_use = "This method returns a new ValidationResult and does not modify self"]
    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.errors.extend(other.errors);
        self
    }
}

/// Implemented by input types that carry their own validation rules.
pub trait Validate {
    /// Check the value, returning every failed rule
    fn validate(&self) -> ValidationResult;
}

impl Validate for () {
    fn validate(&self) -> ValidationResult {
        ValidationResult::ok()
    }
}

impl Validate for serde_json::Value {
    fn validate(&self) -> ValidationResult {
        ValidationResult::ok()
    }
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> ValidationResult {
        self.as_ref().map(Validate::validate).unwrap_or_default()
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> ValidationResult {
        self.iter()
            .map(Validate::validate)
            .fold(ValidationResult::ok(), ValidationResult::merge)
    }
}

/// Fluent collector of common rules.
#[derive(Debug, Default)]
pub struct ValidationRules {
    errors: Vec<FieldError>,
}

impl ValidationRules {
    /// Start an empty rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arbitrary error
    pub fn add_error(mut self, error: FieldError) -> Self {
        self.errors.push(error);
        self
    }

    /// String must contain something besides whitespace
    pub fn required(mut self, field: &str, value: &str) -> Self {
        if value.trim().is_empty() {
            self.errors.push(FieldError::required(field));
        }
        self
    }

    /// Minimum length in characters
    pub fn min_length(mut self, field: &str, value: &str, min: usize) -> Self {
        if value.chars().count() < min {
            self.errors.push(FieldError::min_length(field, min));
        }
        self
    }

    /// Maximum length in characters
    pub fn max_length(mut self, field: &str, value: &str, max: usize) -> Self {
        if value.chars().count() > max {
            self.errors.push(FieldError::max_length(field, max));
        }
        self
    }

    /// Inclusive integer range
    pub fn range(mut self, field: &str, value: i64, min: i64, max: i64) -> Self {
        if !(min..=max).contains(&value) {
            self.errors.push(FieldError::range(field, min, max));
        }
        self
    }

    /// String must match `pattern`
    pub fn pattern(mut self, field: &str, value: &str, pattern: &str) -> Self {
        match regex::Regex::new(pattern) {
            Ok(re) if re.is_match(value) => {}
            Ok(_) => self.errors.push(FieldError::pattern(field, pattern)),
            Err(e) => {
                warn!(field = %field, pattern = %pattern, error = %e, "Invalid validation regex pattern");
                self.errors.push(FieldError::new(
                    field,
                    format!("Invalid validation pattern: {pattern}"),
                    "invalid_pattern",
                ));
            }
        }
        self
    }

    /// Loose email check: one `@`, a non-empty local part and a dotted domain
    pub fn email(mut self, field: &str, value: &str) -> Self {
        let valid = match value.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
            }
            None => false,
        };
        if !valid {
            self.errors.push(FieldError::email(field));
        }
        self
    }

    /// Record `message` unless `predicate` holds
    pub fn custom<F>(mut self, field: &str, predicate: F, message: &str) -> Self
    where
        F: FnOnce() -> bool,
    {
        if !predicate() {
            self.errors.push(FieldError::new(field, message, "custom"));
        }
        self
    }

    /// Finish the rule set
    pub fn build(self) -> ValidationResult {
        if !self.errors.is_empty() {
            let fields: Vec<_> = self.errors.iter().map(|e| e.field.as_str()).collect();
            debug!(error_count = self.errors.len(), fields = ?fields, "Validation rules failed");
        }
        ValidationResult::from_errors(self.errors)
    }
}
