//! Error types for webhook delivery operations.
//!
//! Covers failed send attempts, registry validation, storage failures and
//! dispatcher lifecycle problems. Attempt failures are transient: every one
//! of them is retried until the delivery's attempt budget is spent.

use std::fmt;

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection could not be established or broke mid-request.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// No definitive response within the per-attempt timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Endpoint answered with a non-2xx status.
    #[error("endpoint responded with HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Endpoint registration rejected.
    #[error("invalid endpoint: {message}")]
    InvalidEndpoint {
        /// Validation failure
        message: String,
    },

    /// Requested endpoint or delivery does not exist for the tenant.
    #[error("{resource} not found")]
    NotFound {
        /// What was looked up
        resource: String,
    },

    /// Storage operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// In-flight deliveries did not finish within the shutdown grace period.
    #[error("shutdown grace period of {timeout_seconds}s exceeded, {abandoned} deliveries aborted")]
    ShutdownTimeout {
        /// Grace period in seconds
        timeout_seconds: u64,
        /// Tasks aborted when the grace period ran out
        abandoned: usize,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error for a non-2xx response.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates an endpoint validation error.
    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::InvalidEndpoint { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Returns true for failures a later attempt may not hit.
    ///
    /// Any non-2xx status counts: receivers that reject a delivery get the
    /// full attempt budget before it is dead-lettered.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::DatabaseError { .. } => true,

            Self::InvalidEndpoint { .. }
            | Self::NotFound { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// HTTP status observed, if the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(resource) => Self::NotFound { resource },
            CoreError::InvalidInput(message) => Self::InvalidEndpoint { message },
            CoreError::Database(message) | CoreError::ConstraintViolation(message) => {
                Self::DatabaseError { message }
            },
        }
    }
}

/// Category of delivery error for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// Non-2xx responses.
    Http,
    /// Registry validation and lookups.
    Registry,
    /// Storage operations.
    Database,
    /// Configuration and lifecycle problems.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::InvalidEndpoint { .. } | DeliveryError::NotFound { .. } => {
                Self::Registry
            },
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl From<&CoreError> for ErrorCategory {
    fn from(error: &CoreError) -> Self {
        match error {
            CoreError::Database(_) | CoreError::ConstraintViolation(_) => Self::Database,
            CoreError::NotFound(_) | CoreError::InvalidInput(_) => Self::Registry,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Http => write!(f, "http"),
            Self::Registry => write!(f, "registry"),
            Self::Database => write!(f, "database"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_failures_are_retryable() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::http_status(500, "boom").is_retryable());
        assert!(DeliveryError::http_status(404, "missing").is_retryable());
        assert!(DeliveryError::database("connection lost").is_retryable());

        assert!(!DeliveryError::invalid_endpoint("bad url").is_retryable());
        assert!(!DeliveryError::not_found("endpoint").is_retryable());
        assert!(!DeliveryError::configuration("zero batch").is_retryable());
    }

    #[test]
    fn status_code_only_for_http_failures() {
        assert_eq!(DeliveryError::http_status(503, "").status_code(), Some(503));
        assert_eq!(DeliveryError::timeout(30).status_code(), None);
    }

    #[test]
    fn core_errors_convert() {
        assert!(matches!(
            DeliveryError::from(CoreError::NotFound("endpoint".into())),
            DeliveryError::NotFound { .. }
        ));
        assert!(matches!(
            DeliveryError::from(CoreError::InvalidInput("url".into())),
            DeliveryError::InvalidEndpoint { .. }
        ));
        assert!(matches!(
            DeliveryError::from(CoreError::Database("down".into())),
            DeliveryError::DatabaseError { .. }
        ));
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("x")), ErrorCategory::Network);
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(1)), ErrorCategory::Network);
        assert_eq!(ErrorCategory::from(&DeliveryError::http_status(500, "")), ErrorCategory::Http);
        assert_eq!(ErrorCategory::from(&DeliveryError::not_found("x")), ErrorCategory::Registry);
        assert_eq!(ErrorCategory::Database.to_string(), "database");
    }

    #[test]
    fn storage_error_categories() {
        assert_eq!(
            ErrorCategory::from(&CoreError::Database("down".into())),
            ErrorCategory::Database
        );
        assert_eq!(
            ErrorCategory::from(&CoreError::ConstraintViolation("fk".into())),
            ErrorCategory::Database
        );
        assert_eq!(
            ErrorCategory::from(&CoreError::NotFound("endpoint".into())),
            ErrorCategory::Registry
        );
        assert_eq!(
            ErrorCategory::from(&CoreError::InvalidInput("url".into())),
            ErrorCategory::Registry
        );
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::http_status(502, "bad gateway").to_string(),
            "endpoint responded with HTTP 502"
        );
        assert_eq!(DeliveryError::not_found("endpoint").to_string(), "endpoint not found");
    }
}
