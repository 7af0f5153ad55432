//! Driver configuration: option maps, required/default resolution and loading.
//!
//! Hosts hand every driver a flat map of named options. Each driver declares
//! which keys it requires and which defaults fill in optional keys; the
//! [`DriverOptions::resolve`] step applies both before a connection is opened.
//!
//! Settings can be built in code or loaded with [`QueueSettings::load`]:
//!
//! ```yaml
//! type: beanstalkd
//! host: localhost
//! port: 11300
//! ```
//!
//! Environment variables prefixed `QUEUE__` override file values, e.g.
//! `QUEUE__HOST=queue.internal`.

use crate::error::ConfigurationError;
use crate::provider::BackendType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix for environment overrides, separated from keys by `__`
pub const ENV_PREFIX: &str = "QUEUE";

/// Flat map of backend options keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverOptions(BTreeMap<String, Value>);

impl DriverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Whether the key holds a usable value. Null and empty strings count as unset.
    pub fn contains(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Get a value rendered as a string; numbers and booleans are stringified
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn require_string(&self, key: &str) -> Result<String, ConfigurationError> {
        self.get_string(key).ok_or_else(|| ConfigurationError::Missing {
            key: key.to_string(),
        })
    }

    /// Get an unsigned integer, accepting string-encoded numbers from env overrides
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigurationError> {
        let invalid = |message: String| ConfigurationError::Invalid {
            key: key.to_string(),
            message,
        };

        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(format!("expected an unsigned integer, got {}", n))),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| invalid(format!("'{}' is not an unsigned integer: {}", s, e))),
            Some(other) => Err(invalid(format!("expected an unsigned integer, got {}", other))),
        }
    }

    pub fn require_u64(&self, key: &str) -> Result<u64, ConfigurationError> {
        self.get_u64(key)?.ok_or_else(|| ConfigurationError::Missing {
            key: key.to_string(),
        })
    }

    /// Fill unset keys from `defaults`, then check every `required` key is set.
    ///
    /// Required keys are checked in declaration order so the first missing key
    /// is the one reported.
    pub fn resolve(
        &self,
        required: &[&str],
        defaults: &DriverOptions,
    ) -> Result<DriverOptions, ConfigurationError> {
        let mut resolved = self.clone();
        for (key, value) in &defaults.0 {
            if !resolved.contains(key) {
                resolved.0.insert(key.clone(), value.clone());
            }
        }

        if let Some(missing) = required.iter().find(|key| !resolved.contains(key)) {
            return Err(ConfigurationError::Missing {
                key: missing.to_string(),
            });
        }

        Ok(resolved)
    }
}

impl<K, V> FromIterator<(K, V)> for DriverOptions
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Backend choice plus its options, as supplied by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(rename = "type")]
    pub backend: BackendType,

    #[serde(flatten)]
    pub options: DriverOptions,
}

impl QueueSettings {
    pub fn new(backend: BackendType) -> Self {
        Self {
            backend,
            options: DriverOptions::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key, value);
        self
    }

    /// Load settings from an optional file, overridden by `QUEUE__*` variables.
    ///
    /// The file format follows its extension (`.yaml`, `.toml`, `.json`). A
    /// named file that does not exist is an error; with no file the
    /// environment alone must supply at least `QUEUE__TYPE`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let settings: QueueSettings = settings.try_deserialize()?;
        tracing::debug!(
            backend = %settings.backend,
            keys = ?settings.options.keys().collect::<Vec<_>>(),
            "Loaded queue settings"
        );

        Ok(settings)
    }
}
