//! Low-level SQL over the SQLite store.
//!
//! Every function here is a thin statement wrapper; invariants (claim
//! exclusivity, retry accounting, DLQ promotion) live in [`crate::Queue`],
//! which is the only caller.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};

use crate::schema::{ConfigEntry, DeadJob, Job, JobState};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, timeout_seconds, \
     run_at, next_retry_at, created_at, updated_at, started_at, completed_at, \
     error_message, output, execution_time_ms";

/// Open (or create) the database file and return a connection pool.
pub(crate) async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Create the schema if absent and apply additive column migrations.
pub(crate) async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS jobs (
            id                TEXT PRIMARY KEY,
            command           TEXT NOT NULL,
            state             TEXT NOT NULL DEFAULT 'pending',
            attempts          INTEGER NOT NULL DEFAULT 0,
            max_retries       INTEGER NOT NULL DEFAULT 3,
            priority          INTEGER NOT NULL DEFAULT 0,
            timeout_seconds   INTEGER NOT NULL DEFAULT 300,
            run_at            TEXT,
            next_retry_at     TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            started_at        TEXT,
            completed_at      TEXT,
            error_message     TEXT,
            output            TEXT,
            execution_time_ms INTEGER
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS dead_letter_queue (
            id            TEXT PRIMARY KEY,
            command       TEXT NOT NULL,
            attempts      INTEGER NOT NULL,
            max_retries   INTEGER NOT NULL,
            created_at    TEXT NOT NULL,
            failed_at     TEXT NOT NULL,
            error_message TEXT
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS config (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    migrate_jobs_columns(pool).await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, priority DESC, created_at ASC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Columns added after the first schema version. Databases created by older
/// builds are upgraded in place; existing rows get the documented defaults.
async fn migrate_jobs_columns(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    const ADDITIVE: &[(&str, &str)] = &[
        (
            "priority",
            "ALTER TABLE jobs ADD COLUMN priority INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "timeout_seconds",
            "ALTER TABLE jobs ADD COLUMN timeout_seconds INTEGER NOT NULL DEFAULT 300",
        ),
        ("run_at", "ALTER TABLE jobs ADD COLUMN run_at TEXT"),
        ("output", "ALTER TABLE jobs ADD COLUMN output TEXT"),
        (
            "execution_time_ms",
            "ALTER TABLE jobs ADD COLUMN execution_time_ms INTEGER",
        ),
    ];

    let existing: HashSet<String> = sqlx::query("SELECT name FROM pragma_table_info('jobs')")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    for (column, ddl) in ADDITIVE {
        if !existing.contains(*column) {
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    Ok(())
}

/// Insert a freshly built job row.
pub(crate) async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO jobs ({JOB_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
    ))
    .bind(&job.id)
    .bind(&job.command)
    .bind(job.state)
    .bind(job.attempts)
    .bind(job.max_retries)
    .bind(job.priority)
    .bind(job.timeout_seconds)
    .bind(job.run_at)
    .bind(job.next_retry_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(&job.error_message)
    .bind(&job.output)
    .bind(job.execution_time_ms)
    .execute(executor)
    .await?;

    Ok(())
}

/// Load a single job by id.
pub(crate) async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Find the best claim candidate that is eligible at `now`.
///
/// Ordering is `priority DESC, created_at ASC`; ties beyond that are broken
/// by storage order. The returned row is NOT locked; the caller must win the
/// guarded update in [`claim_job`] before owning it.
pub(crate) async fn find_next_eligible_job(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE state = 'pending'
          AND (next_retry_at IS NULL OR next_retry_at <= ?1)
          AND (run_at IS NULL OR run_at <= ?1)
        ORDER BY priority DESC, created_at ASC
        LIMIT 1
        ",
    ))
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// The claim linearization point: flip `pending` to `processing` guarded by
/// the current state. Zero rows affected means another worker won the race.
pub(crate) async fn claim_job(
    pool: &SqlitePool,
    id: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET state = 'processing', started_at = ?1, updated_at = ?1
        WHERE id = ?2 AND state = 'pending'
        ",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record a successful run and clear the failure bookkeeping.
pub(crate) async fn complete_job(
    pool: &SqlitePool,
    id: &str,
    output: &str,
    execution_time_ms: i64,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET state = 'completed', output = ?1, execution_time_ms = ?2,
            completed_at = ?3, updated_at = ?3,
            error_message = NULL, next_retry_at = NULL
        WHERE id = ?4
        ",
    )
    .bind(output)
    .bind(execution_time_ms)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Persist a failed-but-retryable job back to `pending` with its new attempt
/// count and retry schedule.
pub(crate) async fn persist_retry(pool: &SqlitePool, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET state = 'pending', attempts = ?1, error_message = ?2,
            next_retry_at = ?3, started_at = NULL, updated_at = ?4
        WHERE id = ?5
        ",
    )
    .bind(job.attempts)
    .bind(&job.error_message)
    .bind(job.next_retry_at)
    .bind(job.updated_at)
    .bind(&job.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Migrate an exhausted job to the dead-letter queue.
///
/// Inserts the DLQ snapshot and deletes the main-table row inside the
/// caller's transaction, so observers see either both writes or neither.
pub(crate) async fn move_job_to_dead_letter(
    tx: &mut Transaction<'_, Sqlite>,
    job: &Job,
    failed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO dead_letter_queue (id, command, attempts, max_retries, created_at, failed_at, error_message)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
    )
    .bind(&job.id)
    .bind(&job.command)
    .bind(job.attempts)
    .bind(job.max_retries)
    .bind(job.created_at)
    .bind(failed_at)
    .bind(&job.error_message)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM jobs WHERE id = ?1")
        .bind(&job.id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// List jobs, optionally filtered by state, newest first.
pub(crate) async fn list_jobs(
    pool: &SqlitePool,
    state: Option<JobState>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    match state {
        Some(state) => {
            sqlx::query_as::<_, Job>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 \
                 ORDER BY created_at DESC LIMIT ?2"
            ))
            .bind(state)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Job>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

/// Per-state row counts in the main table.
pub(crate) async fn count_jobs_by_state(
    pool: &SqlitePool,
) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i64)>("SELECT state, COUNT(*) FROM jobs GROUP BY state")
        .fetch_all(pool)
        .await
}

/// Number of entries in the dead-letter queue.
pub(crate) async fn dead_letter_count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letter_queue")
        .fetch_one(pool)
        .await
}

/// List dead-letter entries, most recently failed first.
pub(crate) async fn list_dead_jobs(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<DeadJob>, sqlx::Error> {
    sqlx::query_as::<_, DeadJob>(
        r"
        SELECT id, command, attempts, max_retries, created_at, failed_at, error_message
        FROM dead_letter_queue
        ORDER BY failed_at DESC
        LIMIT ?1
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Load one dead-letter entry inside a revive transaction.
pub(crate) async fn get_dead_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> Result<Option<DeadJob>, sqlx::Error> {
    sqlx::query_as::<_, DeadJob>(
        r"
        SELECT id, command, attempts, max_retries, created_at, failed_at, error_message
        FROM dead_letter_queue
        WHERE id = ?1
        ",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
}

/// Remove a dead-letter entry inside a revive transaction.
pub(crate) async fn delete_dead_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM dead_letter_queue WHERE id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Return `processing` jobs whose attempt started before `cutoff` back to
/// `pending`. The attempt counter is left untouched.
pub(crate) async fn requeue_stale_jobs(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET state = 'pending', started_at = NULL, updated_at = ?1
        WHERE state = 'processing' AND started_at IS NOT NULL AND started_at < ?2
        ",
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Average execution time over the most recent `limit` completions, in
/// milliseconds. `None` when nothing has completed yet.
pub(crate) async fn avg_recent_execution_ms(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Option<f64>, sqlx::Error> {
    sqlx::query_scalar::<_, Option<f64>>(
        r"
        SELECT AVG(execution_time_ms) FROM (
            SELECT execution_time_ms
            FROM jobs
            WHERE state = 'completed' AND execution_time_ms IS NOT NULL
            ORDER BY completed_at DESC
            LIMIT ?1
        )
        ",
    )
    .bind(limit)
    .fetch_one(pool)
    .await
}

/// Read one config value.
pub(crate) async fn get_config(
    pool: &SqlitePool,
    key: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await
}

/// Upsert one config value.
pub(crate) async fn set_config(
    pool: &SqlitePool,
    key: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO config (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// All config entries, ordered by key.
pub(crate) async fn all_config(pool: &SqlitePool) -> Result<Vec<ConfigEntry>, sqlx::Error> {
    sqlx::query_as::<_, ConfigEntry>("SELECT key, value, updated_at FROM config ORDER BY key")
        .fetch_all(pool)
        .await
}
