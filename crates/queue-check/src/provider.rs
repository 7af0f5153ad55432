//! Backend selection.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Enumeration of supported queue backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendType {
    /// URL-addressed cloud queues (AWS SQS and compatible endpoints)
    AwsSqs,
    /// Tube-based work queue daemon speaking the beanstalkd protocol
    Beanstalk,
    /// Hosted IronMQ service
    IronMq,
    /// Process-local queues, for tests and dry runs
    InMemory,
}

impl BackendType {
    /// Canonical name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwsSqs => "aws",
            Self::Beanstalk => "beanstalkd",
            Self::IronMq => "iron",
            Self::InMemory => "memory",
        }
    }

    /// Whether enqueueing to an unknown queue creates it
    pub fn auto_creates_queues(&self) -> bool {
        match self {
            Self::AwsSqs => false,
            Self::Beanstalk => true,
            Self::IronMq => true,
            Self::InMemory => true,
        }
    }

    /// Whether current and total counts are distinct signals on this backend
    pub fn has_independent_total(&self) -> bool {
        !matches!(self, Self::AwsSqs)
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" | "sqs" | "amazonsqs" => Ok(Self::AwsSqs),
            "beanstalk" | "beanstalkd" | "beanstalkq" => Ok(Self::Beanstalk),
            "iron" | "ironmq" => Ok(Self::IronMq),
            "memory" | "inmemory" => Ok(Self::InMemory),
            other => Err(ConfigurationError::UnsupportedBackend {
                backend: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for BackendType {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendType> for String {
    fn from(value: BackendType) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
