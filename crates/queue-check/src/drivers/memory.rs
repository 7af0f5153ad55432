//! In-memory queue driver for testing and development.
//!
//! Queues live inside the driver instance, so every driver starts empty and
//! nothing is shared between instances. Behaves like an auto-creating,
//! flat backend:
//! - enqueue creates the queue on first write
//! - `total` is the number of messages ever enqueued, `current` the number waiting
//! - counts and clears on an unknown queue raise `QueueNotFound`

use crate::config::DriverOptions;
use crate::driver::{not_connected, QueueDriver};
use crate::error::QueueError;
use crate::message::QueueName;
use crate::provider::BackendType;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

#[derive(Default)]
struct InMemoryQueue {
    messages: VecDeque<String>,
    total_messages: u64,
}

/// Process-local queue driver
#[derive(Default)]
pub struct InMemoryDriver {
    queues: HashMap<String, InMemoryQueue>,
    connected: bool,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver with empty queues already declared
    pub fn with_queues<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: names
                .into_iter()
                .map(|name| (name.into(), InMemoryQueue::default()))
                .collect(),
            connected: false,
        }
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected {
            Ok(())
        } else {
            Err(not_connected(BackendType::InMemory))
        }
    }

    fn queue(&self, queue: &QueueName) -> Result<&InMemoryQueue, QueueError> {
        self.ensure_connected()?;
        self.queues
            .get(queue.as_str())
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }
}

#[async_trait]
impl QueueDriver for InMemoryDriver {
    async fn open_connection(&mut self, options: &DriverOptions) -> Result<(), QueueError> {
        self.resolve_options(options)?;
        self.connected = true;
        tracing::debug!(backend = %BackendType::InMemory, "Opened in-memory queue driver");
        Ok(())
    }

    async fn add_message_to_queue(
        &mut self,
        message: &str,
        queue: &QueueName,
    ) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let entry = self.queues.entry(queue.to_string()).or_default();
        entry.messages.push_back(message.to_string());
        entry.total_messages += 1;
        Ok(())
    }

    async fn queues(&mut self) -> Result<Vec<String>, QueueError> {
        self.ensure_connected()?;
        Ok(self.queues.keys().cloned().collect())
    }

    async fn current_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.queue(queue)?.messages.len() as u64)
    }

    async fn total_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.queue(queue)?.total_messages)
    }

    async fn clear_queue(&mut self, queue: &QueueName) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let entry = self
            .queues
            .get_mut(queue.as_str())
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;
        let deleted = entry.messages.len();
        entry.messages.clear();
        tracing::debug!(queue = %queue, deleted, "Cleared in-memory queue");
        Ok(())
    }

    fn required_config(&self) -> &'static [&'static str] {
        &[]
    }

    fn default_config(&self) -> DriverOptions {
        DriverOptions::new()
    }

    fn backend_type(&self) -> BackendType {
        BackendType::InMemory
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close_connection(&mut self) {
        self.connected = false;
    }
}
