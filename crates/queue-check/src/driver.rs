//! The capability contract every queue backend driver implements.

use crate::config::DriverOptions;
use crate::drivers::{BeanstalkDriver, InMemoryDriver, IronMqDriver, SqsDriver};
use crate::error::QueueError;
use crate::message::{QueueName, QueueStats};
use crate::provider::BackendType;
use async_trait::async_trait;

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;

/// Uniform operations over one queue backend.
///
/// A driver starts unconnected. [`open_connection`](QueueDriver::open_connection)
/// creates the connection handle, which the driver owns until it is dropped;
/// every other queue operation fails with [`QueueError::NotConnected`] before
/// that. Operations are awaited one at a time by a single owner and never
/// retried internally.
#[async_trait]
pub trait QueueDriver: Send {
    /// Connect using `options`, after filling defaults and checking required keys
    async fn open_connection(&mut self, options: &DriverOptions) -> Result<(), QueueError>;

    /// Put one message on the named queue
    async fn add_message_to_queue(
        &mut self,
        message: &str,
        queue: &QueueName,
    ) -> Result<(), QueueError>;

    /// Names of all queues known to the backend right now, in no particular order
    async fn queues(&mut self) -> Result<Vec<String>, QueueError>;

    /// Messages available for immediate consumption
    async fn current_count(&mut self, queue: &QueueName) -> Result<u64, QueueError>;

    /// Messages in every state the backend tracks for the queue
    async fn total_count(&mut self, queue: &QueueName) -> Result<u64, QueueError>;

    /// Remove every enumerable message, leaving the queue itself in place
    async fn clear_queue(&mut self, queue: &QueueName) -> Result<(), QueueError>;

    /// Option keys that must be set before connecting
    fn required_config(&self) -> &'static [&'static str];

    /// Values for optional keys the caller may omit
    fn default_config(&self) -> DriverOptions;

    fn backend_type(&self) -> BackendType;

    fn is_connected(&self) -> bool;

    /// Drop the connection handle; the driver can be opened again afterwards
    fn close_connection(&mut self);

    /// Read both counters for a queue
    async fn stats(&mut self, queue: &QueueName) -> Result<QueueStats, QueueError> {
        let current = self.current_count(queue).await?;
        let total = self.total_count(queue).await?;
        Ok(QueueStats::new(current, total))
    }

    /// Resolve `options` against this driver's declarations
    fn resolve_options(&self, options: &DriverOptions) -> Result<DriverOptions, QueueError> {
        Ok(options.resolve(self.required_config(), &self.default_config())?)
    }
}

/// Factory for creating an unconnected driver for a backend
pub struct DriverFactory;

impl DriverFactory {
    pub fn create(backend: BackendType) -> Box<dyn QueueDriver> {
        match backend {
            BackendType::AwsSqs => Box::new(SqsDriver::new()),
            BackendType::Beanstalk => Box::new(BeanstalkDriver::new()),
            BackendType::IronMq => Box::new(IronMqDriver::new()),
            BackendType::InMemory => Box::new(InMemoryDriver::new()),
        }
    }
}

pub(crate) fn not_connected(backend: BackendType) -> QueueError {
    QueueError::NotConnected {
        backend: backend.to_string(),
    }
}
