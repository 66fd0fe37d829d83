#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Read-only HTTP dashboard over the queue.
pub mod dashboard;
mod errors;
mod queue;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod worker;

/// Error type for queue operations.
pub use self::errors::QueueError;
/// The invariant-preserving queue layer and its value types.
pub use self::queue::{NewJob, Queue, QueueMetrics, QueueStats};
/// Exponential backoff policy.
pub use self::retry::RetryPolicy;
/// The worker pool that claims and executes jobs.
pub use self::runner::{RunHandle, Runner};
/// The principal row types.
pub use self::schema::{DeadJob, Job, JobState};
