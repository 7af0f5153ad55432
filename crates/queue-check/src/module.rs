//! Assertion façade consumed by test hosts.
//!
//! A [`QueueModule`] moves through three states, each a distinct type:
//!
//! ```text
//! QueueModule<Unconfigured> --configure--> QueueModule<Configured> --connect--> QueueModule<Connected>
//!                                                   ^                                  |
//!                                                   +------------ disconnect ----------+
//! ```
//!
//! Queue operations exist only on `QueueModule<Connected>`, so using a module
//! before it is connected does not compile.
//!
//! Assertions come in `see_*` / `dont_see_*` pairs and return
//! [`AssertionError::Failed`] when the predicate does not hold, or
//! [`AssertionError::Queue`] when the backend could not answer. Pass-through
//! accessors return driver results unmodified. Nothing is retried or cached.
//!
//! # Example
//!
//! ```no_run
//! use queue_check::{BackendType, QueueModule, QueueSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = QueueSettings::new(BackendType::Beanstalk).with_option("host", "localhost");
//! let mut queue = QueueModule::new().configure(settings)?.connect().await?;
//!
//! queue.clear_queue("default").await?;
//! queue.see_empty_queue("default").await?;
//! queue.add_message_to_queue("hello", "default").await?;
//! queue.see_queue_has_current_count("default", 1).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{DriverOptions, QueueSettings};
use crate::driver::{DriverFactory, QueueDriver};
use crate::error::{AssertionError, ConfigurationError, QueueError};
use crate::message::{QueueName, QueueStats};
use crate::provider::BackendType;
use std::fmt;
use tracing::{debug, info};

#[cfg(test)]
#[path = "module_tests.rs"]
mod tests;

// ============================================================================
// States
// ============================================================================

/// Freshly constructed, no settings yet
#[derive(Debug, Default)]
pub struct Unconfigured;

/// Settings validated against the driver's declarations, no connection
pub struct Configured {
    backend: BackendType,
    options: DriverOptions,
    driver: Box<dyn QueueDriver>,
}

/// Connection open, queue operations available
pub struct Connected {
    backend: BackendType,
    options: DriverOptions,
    driver: Box<dyn QueueDriver>,
}

// ============================================================================
// Module
// ============================================================================

/// Backend-agnostic queue assertions for one test lifecycle
pub struct QueueModule<S = Unconfigured> {
    state: S,
}

impl QueueModule<Unconfigured> {
    pub fn new() -> Self {
        Self {
            state: Unconfigured,
        }
    }

    /// Select the backend named by `settings` and validate its options.
    ///
    /// Missing optional keys are filled from the driver defaults; a missing
    /// required key fails here, before any connection attempt.
    pub fn configure(
        self,
        settings: QueueSettings,
    ) -> Result<QueueModule<Configured>, ConfigurationError> {
        let driver = DriverFactory::create(settings.backend);
        Self::validated(settings, driver)
    }

    /// Like [`configure`](Self::configure), with a caller-supplied driver
    pub fn with_driver(
        settings: QueueSettings,
        driver: Box<dyn QueueDriver>,
    ) -> Result<QueueModule<Configured>, ConfigurationError> {
        Self::validated(settings, driver)
    }

    fn validated(
        settings: QueueSettings,
        driver: Box<dyn QueueDriver>,
    ) -> Result<QueueModule<Configured>, ConfigurationError> {
        let options = settings
            .options
            .resolve(driver.required_config(), &driver.default_config())?;

        debug!(backend = %settings.backend, "Queue module configured");
        Ok(QueueModule {
            state: Configured {
                backend: settings.backend,
                options,
                driver,
            },
        })
    }
}

impl Default for QueueModule<Unconfigured> {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueModule<Configured> {
    /// Open the driver connection with the resolved options.
    ///
    /// Failures are reported as-is; [`QueueError::is_connection_failure`]
    /// tells a host whether to skip rather than fail the test.
    pub async fn connect(self) -> Result<QueueModule<Connected>, QueueError> {
        let Configured {
            backend,
            options,
            mut driver,
        } = self.state;

        driver.open_connection(&options).await?;
        info!(backend = %backend, "Queue module connected");

        Ok(QueueModule {
            state: Connected {
                backend,
                options,
                driver,
            },
        })
    }

    pub fn backend(&self) -> BackendType {
        self.state.backend
    }

    /// Options after defaults were applied
    pub fn options(&self) -> &DriverOptions {
        &self.state.options
    }
}

impl QueueModule<Connected> {
    /// Close the connection, keeping the validated settings for a later reconnect
    pub fn disconnect(self) -> QueueModule<Configured> {
        let Connected {
            backend,
            options,
            mut driver,
        } = self.state;

        driver.close_connection();
        debug!(backend = %backend, "Queue module disconnected");

        QueueModule {
            state: Configured {
                backend,
                options,
                driver,
            },
        }
    }

    pub fn backend(&self) -> BackendType {
        self.state.backend
    }

    pub fn options(&self) -> &DriverOptions {
        &self.state.options
    }

    /// Direct access to the underlying driver
    pub fn driver(&mut self) -> &mut dyn QueueDriver {
        self.state.driver.as_mut()
    }

    // ------------------------------------------------------------------------
    // Pass-through accessors
    // ------------------------------------------------------------------------

    pub async fn add_message_to_queue(
        &mut self,
        message: &str,
        queue: &str,
    ) -> Result<(), QueueError> {
        let queue = QueueName::new(queue)?;
        self.state.driver.add_message_to_queue(message, &queue).await
    }

    /// Remove every message from the queue, in all of its sub-states
    pub async fn clear_queue(&mut self, queue: &str) -> Result<(), QueueError> {
        let queue = QueueName::new(queue)?;
        self.state.driver.clear_queue(&queue).await
    }

    pub async fn grab_queues(&mut self) -> Result<Vec<String>, QueueError> {
        self.state.driver.queues().await
    }

    pub async fn grab_queue_current_count(&mut self, queue: &str) -> Result<u64, QueueError> {
        let queue = QueueName::new(queue)?;
        self.state.driver.current_count(&queue).await
    }

    pub async fn grab_queue_total_count(&mut self, queue: &str) -> Result<u64, QueueError> {
        let queue = QueueName::new(queue)?;
        self.state.driver.total_count(&queue).await
    }

    pub async fn grab_queue_stats(&mut self, queue: &str) -> Result<QueueStats, QueueError> {
        let queue = QueueName::new(queue)?;
        self.state.driver.stats(&queue).await
    }

    // ------------------------------------------------------------------------
    // Assertions
    // ------------------------------------------------------------------------

    /// Pass if the backend lists the queue (names compared ignoring ASCII case)
    pub async fn see_queue_exists(&mut self, queue: &str) -> Result<(), AssertionError> {
        let (exists, known) = self.queue_exists(queue).await?;
        check(
            exists,
            format!("Queue '{}' does not exist; known queues: {:?}", queue, known),
        )
    }

    pub async fn dont_see_queue_exists(&mut self, queue: &str) -> Result<(), AssertionError> {
        let (exists, _) = self.queue_exists(queue).await?;
        check(!exists, format!("Queue '{}' exists", queue))
    }

    /// Pass if the queue has no messages ready for consumption
    pub async fn see_empty_queue(&mut self, queue: &str) -> Result<(), AssertionError> {
        let count = self.grab_queue_current_count(queue).await?;
        check(
            count == 0,
            format!("Queue '{}' is not empty; it holds {} messages", queue, count),
        )
    }

    pub async fn dont_see_empty_queue(&mut self, queue: &str) -> Result<(), AssertionError> {
        let count = self.grab_queue_current_count(queue).await?;
        check(count != 0, format!("Queue '{}' is empty", queue))
    }

    pub async fn see_queue_has_current_count(
        &mut self,
        queue: &str,
        expected: u64,
    ) -> Result<(), AssertionError> {
        let count = self.grab_queue_current_count(queue).await?;
        check(
            count == expected,
            CountMismatch::new(queue, "current", expected, count).to_string(),
        )
    }

    pub async fn dont_see_queue_has_current_count(
        &mut self,
        queue: &str,
        unexpected: u64,
    ) -> Result<(), AssertionError> {
        let count = self.grab_queue_current_count(queue).await?;
        check(
            count != unexpected,
            format!("Queue '{}' has a current count of {}", queue, unexpected),
        )
    }

    pub async fn see_queue_has_total_count(
        &mut self,
        queue: &str,
        expected: u64,
    ) -> Result<(), AssertionError> {
        let count = self.grab_queue_total_count(queue).await?;
        check(
            count == expected,
            CountMismatch::new(queue, "total", expected, count).to_string(),
        )
    }

    pub async fn dont_see_queue_has_total_count(
        &mut self,
        queue: &str,
        unexpected: u64,
    ) -> Result<(), AssertionError> {
        let count = self.grab_queue_total_count(queue).await?;
        check(
            count != unexpected,
            format!("Queue '{}' has a total count of {}", queue, unexpected),
        )
    }

    async fn queue_exists(&mut self, queue: &str) -> Result<(bool, Vec<String>), QueueError> {
        let name = QueueName::new(queue)?;
        let known = self.state.driver.queues().await?;
        let exists = known.iter().any(|candidate| name.matches(candidate));
        Ok((exists, known))
    }
}

impl<S> fmt::Debug for QueueModule<S>
where
    S: StateName,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueModule")
            .field("state", &S::NAME)
            .field("backend", &self.state.backend())
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Name and backend of a state, for diagnostics
pub trait StateName {
    const NAME: &'static str;

    fn backend(&self) -> Option<BackendType>;
}

impl StateName for Unconfigured {
    const NAME: &'static str = "unconfigured";

    fn backend(&self) -> Option<BackendType> {
        None
    }
}

impl StateName for Configured {
    const NAME: &'static str = "configured";

    fn backend(&self) -> Option<BackendType> {
        Some(self.backend)
    }
}

impl StateName for Connected {
    const NAME: &'static str = "connected";

    fn backend(&self) -> Option<BackendType> {
        Some(self.backend)
    }
}

struct CountMismatch<'a> {
    queue: &'a str,
    kind: &'static str,
    expected: u64,
    actual: u64,
}

impl<'a> CountMismatch<'a> {
    fn new(queue: &'a str, kind: &'static str, expected: u64, actual: u64) -> Self {
        Self {
            queue,
            kind,
            expected,
            actual,
        }
    }
}

impl fmt::Display for CountMismatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Expected a {} count of {} on queue '{}', found {}",
            self.kind, self.expected, self.queue, self.actual
        )
    }
}

fn check(holds: bool, message: String) -> Result<(), AssertionError> {
    if holds {
        Ok(())
    } else {
        debug!(%message, "Queue assertion failed");
        Err(AssertionError::failed(message))
    }
}
