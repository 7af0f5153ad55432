//! Queue identity and statistics types.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Name of a queue (or beanstalk tube) as supplied by the test author.
///
/// Names are passed to the backend verbatim. Backends apply their own,
/// stricter rules; this type only rejects names that no backend accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_name".to_string(),
            });
        }

        if name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Whitespace would split a beanstalk command line and breaks SQS/IronMQ paths
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "whitespace and control characters are not allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a backend-reported name, ignoring ASCII case
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Live message counters for one queue.
///
/// `current` counts messages available for immediate consumption. `total`
/// adds whatever other sub-states the backend tracks (delayed, buried,
/// in-flight, or lifetime totals). Always read on demand, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub current: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn new(current: u64, total: u64) -> Self {
        Self { current, total }
    }

    pub fn is_empty(&self) -> bool {
        self.current == 0
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
