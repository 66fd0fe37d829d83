//! The invariant-preserving queue layer.
//!
//! [`Queue`] owns every job mutation. Workers and the dashboard hold a
//! `Queue` handle and never touch the store directly, so the lifecycle
//! invariants live in exactly one place.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::QueueError;
use crate::retry::RetryPolicy;
use crate::schema::{ConfigEntry, DeadJob, Job, JobState};
use crate::storage;

/// Default retry ceiling when neither the caller nor config supplies one.
const DEFAULT_MAX_RETRIES: i64 = 3;
/// Default per-attempt timeout when neither the caller nor config supplies one.
const DEFAULT_TIMEOUT_SECONDS: i64 = 300;
/// Default reaper threshold for stuck `processing` jobs.
const DEFAULT_REAPER_THRESHOLD_SECONDS: i64 = 600;
/// Window for the rolling average execution time.
const RECENT_COMPLETIONS_WINDOW: i64 = 100;

/// Parameters for a job to be enqueued.
///
/// Only `command` is required; everything else falls back to config values
/// or the documented defaults. Deserializes from the JSON form accepted by
/// the CLI (`queuectl enqueue '{"command": "...", "priority": 5}'`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    /// Shell command line to execute.
    pub command: String,
    /// Explicit id; one is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Claim-time priority, higher wins. Defaults to 0.
    #[serde(default)]
    pub priority: Option<i64>,
    /// Retry ceiling. Defaults to the `max_retries` config value, then 3.
    #[serde(default)]
    pub max_retries: Option<i64>,
    /// Per-attempt timeout. Defaults to the `worker_timeout` config value,
    /// then 300 seconds.
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    /// Earliest eligible run time; `None` means immediately.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// A job running `command` with all defaults.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Set the claim-time priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the retry ceiling.
    pub fn max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// Set the earliest eligible run time.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Set an explicit job id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Per-state job counts.
///
/// `dead` counts dead-letter entries; `failed` is the transient bucket and
/// reads zero outside the fail transition itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: i64,
    /// Jobs currently held by a worker.
    pub processing: i64,
    /// Successfully finished jobs.
    pub completed: i64,
    /// Transient failure bucket.
    pub failed: i64,
    /// Jobs in the dead-letter queue.
    pub dead: i64,
}

/// Execution statistics derived from the queue, as shown by the CLI
/// `metrics` command and the dashboard.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueMetrics {
    /// Per-state counts.
    pub stats: QueueStats,
    /// Total completed jobs still in the main table.
    pub total_completed: i64,
    /// Average execution time over the most recent completions, ms.
    pub avg_execution_time_ms: f64,
    /// completed / (completed + failures), as an integer percent.
    /// 100 when nothing has finished yet.
    pub success_rate: i64,
}

/// Handle to the durable job queue.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Queue {
    pool: SqlitePool,
}

impl Queue {
    /// Open (or create) the database at `path` and run schema setup.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let pool = storage::connect(path.as_ref()).await?;
        storage::setup_database(&pool).await?;
        Ok(Self { pool })
    }

    /// Persist a new `pending` job and return it.
    ///
    /// Fails with [`QueueError::EmptyCommand`] on a blank command, and with a
    /// store uniqueness error when the caller supplies a duplicate id.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job, QueueError> {
        if new.command.trim().is_empty() {
            return Err(QueueError::EmptyCommand);
        }

        let now = Utc::now();
        let max_retries = match new.max_retries {
            Some(value) => value,
            None => self.config_i64("max_retries", DEFAULT_MAX_RETRIES).await?,
        };
        let timeout_seconds = match new.timeout_seconds {
            Some(value) => value,
            None => {
                self.config_i64("worker_timeout", DEFAULT_TIMEOUT_SECONDS)
                    .await?
            }
        };

        let job = Job {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            command: new.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            priority: new.priority.unwrap_or(0),
            timeout_seconds,
            run_at: new.run_at,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            output: None,
            execution_time_ms: None,
        };

        storage::insert_job(&self.pool, &job).await?;
        debug!(job.id = %job.id, priority = job.priority, "Enqueued job");
        Ok(job)
    }

    /// Atomically claim the next eligible job, flipping it to `processing`.
    ///
    /// Eligibility at `now`: `pending`, `next_retry_at` and `run_at` unset or
    /// in the past. The best candidate is selected by `priority DESC,
    /// created_at ASC`; a guarded update is the linearization point, so out
    /// of any number of concurrent callers exactly one wins a given job.
    /// Losers get `Ok(None)` and simply poll again.
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();

        let Some(mut job) = storage::find_next_eligible_job(&self.pool, now).await? else {
            return Ok(None);
        };

        if storage::claim_job(&self.pool, &job.id, now).await? == 0 {
            // Another worker won the guarded update between our select and
            // update. Treated the same as an empty queue.
            return Ok(None);
        }

        job.mark_processing(now);
        debug!(job.id = %job.id, "Claimed job");
        Ok(Some(job))
    }

    /// Record a successful run: state `completed`, output and timing stored,
    /// failure bookkeeping cleared.
    pub async fn complete(
        &self,
        id: &str,
        output: &str,
        execution_time_ms: i64,
    ) -> Result<(), QueueError> {
        let current = storage::get_job(&self.pool, id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        if current.state != JobState::Processing {
            warn!(job.id = %id, state = %current.state, "Completing a job that is not processing");
        }

        storage::complete_job(&self.pool, id, output, execution_time_ms, Utc::now()).await?;
        debug!(job.id = %id, execution_time_ms, "Job completed");
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// While the job has retries left it returns to `pending` with
    /// `next_retry_at = now + backoff_base ^ attempts`. On exhaustion the row
    /// is migrated to the dead-letter queue and deleted from the main table
    /// in a single transaction.
    pub async fn fail(&self, id: &str, error_message: &str) -> Result<(), QueueError> {
        let mut job = storage::get_job(&self.pool, id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        let now = Utc::now();
        let retryable = job.can_retry();
        job.mark_failed(error_message.to_string(), now);

        if retryable {
            let base = self.backoff_base().await?;
            let delay = job.retry_delay(base);
            let next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            job.schedule_retry(next_retry_at, now);
            storage::persist_retry(&self.pool, &job).await?;
            debug!(
                job.id = %id,
                attempts = job.attempts,
                delay_secs = delay.as_secs(),
                "Job failed, retry scheduled"
            );
        } else {
            job.mark_dead(now);
            let mut tx = self.pool.begin().await?;
            storage::move_job_to_dead_letter(&mut tx, &job, now).await?;
            tx.commit().await?;
            warn!(
                job.id = %id,
                attempts = job.attempts,
                "Job exhausted retries, moved to dead-letter queue"
            );
        }

        Ok(())
    }

    /// Load a job by id.
    pub async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(storage::get_job(&self.pool, id).await?)
    }

    /// List jobs, optionally filtered by state, newest first.
    pub async fn list(
        &self,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(storage::list_jobs(&self.pool, state, limit).await?)
    }

    /// Per-state job counts. Dead jobs are counted from the DLQ table since
    /// exhaustion removes them from the main table.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for (state, count) in storage::count_jobs_by_state(&self.pool).await? {
            match JobState::parse(&state) {
                Some(JobState::Pending) => stats.pending = count,
                Some(JobState::Processing) => stats.processing = count,
                Some(JobState::Completed) => stats.completed = count,
                Some(JobState::Failed) => stats.failed = count,
                Some(JobState::Dead) => stats.dead += count,
                None => warn!(state = %state, "Unknown job state in store"),
            }
        }
        stats.dead += storage::dead_letter_count(&self.pool).await?;
        Ok(stats)
    }

    /// Execution statistics for the CLI `metrics` command and the dashboard.
    pub async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let stats = self.stats().await?;
        let avg = storage::avg_recent_execution_ms(&self.pool, RECENT_COMPLETIONS_WINDOW)
            .await?
            .unwrap_or(0.0);

        let failures = stats.failed + stats.dead;
        let finished = stats.completed + failures;
        let success_rate = if finished == 0 {
            100
        } else {
            stats.completed * 100 / finished
        };

        Ok(QueueMetrics {
            stats,
            total_completed: stats.completed,
            avg_execution_time_ms: avg,
            success_rate,
        })
    }

    /// List dead-letter entries, most recently failed first.
    pub async fn dead_jobs(&self, limit: i64) -> Result<Vec<DeadJob>, QueueError> {
        Ok(storage::list_dead_jobs(&self.pool, limit).await?)
    }

    /// Revive a dead-letter entry: re-create a fresh `pending` job with the
    /// same id and command, attempts reset to zero, and remove the DLQ entry.
    /// Both writes happen in one transaction.
    pub async fn retry_dead(&self, id: &str) -> Result<Job, QueueError> {
        let mut tx = self.pool.begin().await?;

        let dead = storage::get_dead_job_tx(&mut tx, id)
            .await?
            .ok_or_else(|| QueueError::DeadJobNotFound(id.to_string()))?;

        let now = Utc::now();
        let job = Job {
            id: dead.id,
            command: dead.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: dead.max_retries,
            priority: 0,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            run_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            output: None,
            execution_time_ms: None,
        };

        storage::insert_job(&mut *tx, &job).await?;
        storage::delete_dead_job_tx(&mut tx, id).await?;
        tx.commit().await?;

        debug!(job.id = %job.id, "Revived job from dead-letter queue");
        Ok(job)
    }

    /// Return `processing` jobs whose attempt started more than `threshold`
    /// ago back to `pending`, without charging an attempt. Covers workers
    /// that crashed between claim and report.
    pub async fn requeue_stale(&self, threshold: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(storage::requeue_stale_jobs(&self.pool, cutoff, now).await?)
    }

    /// Read one config value. Unknown keys are not errors.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(storage::get_config(&self.pool, key).await?)
    }

    /// Write one config value.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        Ok(storage::set_config(&self.pool, key, value, Utc::now()).await?)
    }

    /// All config entries, ordered by key.
    pub async fn all_config(&self) -> Result<Vec<ConfigEntry>, QueueError> {
        Ok(storage::all_config(&self.pool).await?)
    }

    /// The configured backoff base, read on demand.
    pub(crate) async fn backoff_base(&self) -> Result<u32, QueueError> {
        let base = self
            .config_i64("backoff_base", i64::from(RetryPolicy::DEFAULT_BASE))
            .await?;
        Ok(u32::try_from(base).unwrap_or(RetryPolicy::DEFAULT_BASE))
    }

    /// The configured reaper threshold for stuck `processing` jobs.
    pub(crate) async fn reaper_threshold(&self) -> Result<Duration, QueueError> {
        let secs = self
            .config_i64("reaper_threshold", DEFAULT_REAPER_THRESHOLD_SECONDS)
            .await?;
        Ok(Duration::from_secs(u64::try_from(secs).unwrap_or(600)))
    }

    /// Best-effort numeric config read: unset or unparsable values fall back
    /// to the default.
    async fn config_i64(&self, key: &str, default: i64) -> Result<i64, QueueError> {
        let value = storage::get_config(&self.pool, key).await?;
        Ok(value.and_then(|v| v.trim().parse().ok()).unwrap_or(default))
    }
}
