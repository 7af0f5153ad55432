//! Queue backend drivers.
//!
//! Each module implements [`QueueDriver`](crate::driver::QueueDriver) for one
//! backend and absorbs its addressing, not-found and draining rules.

pub mod beanstalk;
pub mod iron;
pub mod memory;
pub mod sqs;

pub use beanstalk::{BeanstalkConnection, BeanstalkDriver, Job, JobState};
pub use iron::IronMqDriver;
pub use memory::InMemoryDriver;
pub use sqs::SqsDriver;
