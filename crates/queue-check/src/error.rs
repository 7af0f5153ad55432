//! Error types for queue driver and assertion operations.

use thiserror::Error;

/// Error type shared by every queue driver operation
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Driver for {backend} is not connected")]
    NotConnected { backend: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Check if the backend could not be reached or refused the credentials.
    ///
    /// Hosts typically skip a test rather than fail it when setup hits one of
    /// these, since the backend under test was never exercised.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::AuthenticationFailed { .. }
                | Self::NotConnected { .. }
        )
    }

    /// Check if the error reports a missing queue
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound { .. })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },

    #[error("Unsupported queue backend: {backend}")]
    UnsupportedBackend { backend: String },

    #[error("Configuration loading failed: {message}")]
    Load { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load {
            message: err.to_string(),
        }
    }
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Outcome of a failed assertion made through [`crate::QueueModule`]
#[derive(Debug, Error)]
pub enum AssertionError {
    /// The predicate was evaluated and did not hold
    #[error("Assertion failed: {message}")]
    Failed { message: String },

    /// The predicate could not be evaluated
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl AssertionError {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
