//! # Queue Check
//!
//! Backend-agnostic queue assertions for test harnesses. One capability
//! contract covers AWS SQS, beanstalkd and IronMQ, so a test can say "queue X
//! holds N messages" or "queue X is empty" without knowing which backend is
//! behind it.
//!
//! This library provides:
//! - The [`QueueDriver`] contract and one driver per backend
//! - Option resolution against each driver's required and default keys
//! - The [`QueueModule`] assertion façade used by test hosts
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for driver operations and assertions
//! - [`message`] - Queue names and statistics
//! - [`provider`] - Backend selection
//! - [`config`] - Driver options and settings loading
//! - [`driver`] - The capability contract and driver factory
//! - [`drivers`] - Backend implementations
//! - [`module`] - The assertion façade
//!
//! ## Not-found policy
//!
//! | Backend | Counting or clearing an unknown queue |
//! |---|---|
//! | SQS | `QueueNotFound` |
//! | beanstalkd | counts are `0`, clear is a no-op |
//! | IronMQ | `QueueNotFound` |
//! | in-memory | `QueueNotFound` |

// Module declarations
pub mod config;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod message;
pub mod module;
pub mod provider;

// Re-export commonly used types at crate root for convenience
pub use config::{DriverOptions, QueueSettings};
pub use driver::{DriverFactory, QueueDriver};
pub use drivers::{BeanstalkDriver, InMemoryDriver, IronMqDriver, SqsDriver};
pub use error::{AssertionError, ConfigurationError, QueueError, ValidationError};
pub use message::{QueueName, QueueStats};
pub use module::{Configured, Connected, QueueModule, Unconfigured};
pub use provider::BackendType;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
