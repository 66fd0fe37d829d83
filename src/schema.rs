//! Database schema definitions.
//!
//! This module contains the row types for the job queue tables and the pure
//! lifecycle helpers on [`Job`]. All persistence goes through
//! [`Queue`](crate::Queue); these helpers only mutate the in-memory value.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::retry::RetryPolicy;

/// Lifecycle state of a job.
///
/// `Failed` is transient: a failing job is re-queued with a retry schedule or
/// moved to the dead-letter queue within the same `fail` transition, so
/// external observers effectively never see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed (possibly not yet eligible).
    Pending,
    /// Claimed by exactly one worker, child process running.
    Processing,
    /// Finished successfully; terminal in the main table.
    Completed,
    /// Transient failure marker, never a resting state.
    Failed,
    /// Retries exhausted; the row lives in the dead-letter queue.
    Dead,
}

impl JobState {
    /// The canonical lowercase name stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Parse a state name as stored in the database or given on the CLI.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        Self::parse(s).ok_or_else(|| format!("invalid job state: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// A unit of work: one shell command plus its lifecycle bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Globally unique identifier, assigned at enqueue time.
    pub id: String,
    /// Shell command line executed through `sh -c`.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of completed execution attempts (incremented on each failure).
    pub attempts: i64,
    /// Retry ceiling; once `attempts > max_retries` the job moves to the DLQ.
    pub max_retries: i64,
    /// Claim-time sort key, higher wins.
    pub priority: i64,
    /// Per-attempt wall-clock limit on the child process.
    pub timeout_seconds: i64,
    /// Earliest time the job may be claimed. `None` means immediately.
    pub run_at: Option<DateTime<Utc>>,
    /// Earliest time a failed-and-requeued job may be reclaimed.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent mutation.
    pub updated_at: DateTime<Utc>,
    /// When the current or most recent attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed successfully.
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent failure reason; `None` while healthy.
    pub error_message: Option<String>,
    /// Captured stdout of the most recent successful run.
    pub output: Option<String>,
    /// Wall-clock duration of the most recent successful run.
    pub execution_time_ms: Option<i64>,
}

impl Job {
    /// Whether another failure would still be retried rather than promoting
    /// the job to the dead-letter queue.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_retries
    }

    /// Exponential backoff delay for the current attempt count:
    /// `base ^ attempts` seconds.
    pub fn retry_delay(&self, base: u32) -> Duration {
        RetryPolicy::new(base).delay(self.attempts)
    }

    /// Flip the in-memory value to `processing` for an attempt starting `now`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Record a successful run.
    pub fn mark_completed(&mut self, output: String, execution_time_ms: i64, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.output = Some(output);
        self.execution_time_ms = Some(execution_time_ms);
        self.completed_at = Some(now);
        self.error_message = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Record a failed attempt: bumps `attempts` and stores the reason.
    ///
    /// Whether the job is re-queued or promoted to the DLQ is decided by the
    /// caller via [`Job::can_retry`] before this increment.
    pub fn mark_failed(&mut self, error_message: String, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.attempts += 1;
        self.error_message = Some(error_message);
        self.updated_at = now;
    }

    /// Mark the job dead ahead of its migration to the dead-letter queue.
    pub fn mark_dead(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Dead;
        self.updated_at = now;
    }

    /// Re-queue the job for a retry no earlier than `next_retry_at`.
    pub fn schedule_retry(&mut self, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.next_retry_at = Some(next_retry_at);
        self.started_at = None;
        self.updated_at = now;
    }
}

/// A reduced snapshot of a job that exhausted its retries.
///
/// Append-only from the system's perspective; a manual retry re-creates a
/// fresh main-table row and removes the entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadJob {
    /// The original job id, preserved across the DLQ migration.
    pub id: String,
    /// The original command line.
    pub command: String,
    /// Attempt count at the time of exhaustion.
    pub attempts: i64,
    /// The retry ceiling the job ran out of.
    pub max_retries: i64,
    /// When the job was first enqueued.
    pub created_at: DateTime<Utc>,
    /// When the final failure promoted the job to the DLQ.
    pub failed_at: DateTime<Utc>,
    /// The final failure reason.
    pub error_message: Option<String>,
}

/// One key/value pair from the config table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConfigEntry {
    /// Config key.
    pub key: String,
    /// Raw string value; callers parse on demand.
    pub value: String,
    /// When the value was last written.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: "j1".to_string(),
            command: "echo hi".to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: 3,
            priority: 0,
            timeout_seconds: 300,
            run_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            output: None,
            execution_time_ms: None,
        }
    }

    #[test]
    fn can_retry_respects_ceiling() {
        let mut job = sample_job();
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(job.can_retry());
        job.attempts = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn retry_delay_is_exponential() {
        let mut job = sample_job();
        job.attempts = 1;
        assert_eq!(job.retry_delay(2), Duration::from_secs(2));
        job.attempts = 3;
        assert_eq!(job.retry_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn failure_then_retry_keeps_attempt_count() {
        let mut job = sample_job();
        let now = Utc::now();
        job.mark_processing(now);
        assert_eq!(job.state, JobState::Processing);

        job.mark_failed("boom".to_string(), now);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        let later = now + chrono::Duration::seconds(2);
        job.schedule_retry(later, now);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.next_retry_at, Some(later));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn completion_clears_failure_bookkeeping() {
        let mut job = sample_job();
        let now = Utc::now();
        job.error_message = Some("old".to_string());
        job.next_retry_at = Some(now);
        job.mark_completed("hi\n".to_string(), 12, now);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output.as_deref(), Some("hi\n"));
        assert_eq!(job.execution_time_ms, Some(12));
        assert_eq!(job.error_message, None);
        assert_eq!(job.next_retry_at, None);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }
}
