use thiserror::Error;

/// Errors surfaced by [`Queue`](crate::Queue) operations.
///
/// Store-level failures are wrapped verbatim; the queue layer never swallows
/// them. Validation failures leave the database untouched.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job command was empty or blank.
    #[error("command must not be empty")]
    EmptyCommand,

    /// No job with the given id exists in the main table.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// No dead-letter entry with the given id exists.
    #[error("dead-letter entry not found: {0}")]
    DeadJobNotFound(String),

    /// An underlying database error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
