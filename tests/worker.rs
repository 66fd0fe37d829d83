#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::time::Duration;

use claims::{assert_none, assert_some};
use queuectl::{JobState, NewJob, Queue, Runner};

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Open a queue over a fresh database file in a temp directory.
    pub(super) async fn open_queue() -> anyhow::Result<(tempfile::TempDir, Queue)> {
        let tmp = tempfile::tempdir()?;
        let queue = Queue::open(tmp.path().join("queue.db")).await?;
        Ok((tmp, queue))
    }

    /// A runner that polls fast and drains the queue, for quick tests.
    pub(super) fn drain_runner(queue: Queue, num_workers: usize) -> Runner {
        Runner::new(queue, num_workers)
            .poll_interval(Duration::from_millis(50))
            .shutdown_when_queue_empty()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_job_completes_with_output() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue.enqueue(NewJob::command("echo hi")).await?;

    let handle = test_utils::drain_runner(queue.clone(), 1).start();
    handle.wait_for_shutdown().await;

    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Completed);
    assert!(loaded.output.as_deref().unwrap_or("").contains("hi"));
    assert!(loaded.execution_time_ms.unwrap_or(-1) >= 0);
    assert_some!(loaded.completed_at);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stdout_and_stderr_are_captured_separately() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue
        .enqueue(NewJob::command("echo out; echo err 1>&2"))
        .await?;

    let handle = test_utils::drain_runner(queue.clone(), 1).start();
    handle.wait_for_shutdown().await;

    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Completed);
    let output = loaded.output.unwrap_or_default();
    assert!(output.contains("out"));
    assert!(!output.contains("err"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shell_features_work_in_commands() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue
        .enqueue(NewJob::command("printf 'a\\nb\\nc\\n' | wc -l"))
        .await?;

    let handle = test_utils::drain_runner(queue.clone(), 1).start();
    handle.wait_for_shutdown().await;

    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Completed);
    assert_eq!(loaded.output.unwrap_or_default().trim(), "3");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_job_retries_then_moves_to_dlq() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    // Immediate retries so the drain runner sees the retry before exiting.
    queue.set_config("backoff_base", "0").await?;

    let job = queue
        .enqueue(NewJob::command("exit 1").max_retries(1))
        .await?;

    let handle = test_utils::drain_runner(queue.clone(), 1).start();
    handle.wait_for_shutdown().await;

    assert_none!(queue.get(&job.id).await?);
    let dead = queue.dead_jobs(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(
        dead[0].error_message.as_deref(),
        Some("Command failed with exit code 1")
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stderr_becomes_the_failure_message() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue
        .enqueue(NewJob::command("echo broken pipe 1>&2; exit 3").max_retries(0))
        .await?;

    let handle = test_utils::drain_runner(queue.clone(), 1).start();
    handle.wait_for_shutdown().await;

    let dead = queue.dead_jobs(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);
    assert_eq!(dead[0].error_message.as_deref(), Some("broken pipe"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_job_is_recorded_as_failure() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue
        .enqueue(
            NewJob::command("sleep 10")
                .timeout_seconds(1)
                .max_retries(0),
        )
        .await?;

    let started = std::time::Instant::now();
    let handle = test_utils::drain_runner(queue.clone(), 1).start();
    handle.wait_for_shutdown().await;

    // The watchdog must fire well before the command would have finished.
    assert!(started.elapsed() < Duration::from_secs(8));

    let dead = queue.dead_jobs(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);
    assert_eq!(
        dead[0].error_message.as_deref(),
        Some("Job timed out after 1 seconds")
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_workers_process_each_job_once() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    // Every job appends its id to a shared file; double execution would show
    // up as a duplicate line.
    let tmp = tempfile::tempdir()?;
    let log = tmp.path().join("runs.log");

    let mut ids = Vec::new();
    for i in 0..10 {
        let job = queue
            .enqueue(NewJob::command(format!(
                "echo job-{i} >> {}",
                log.display()
            )))
            .await?;
        ids.push(job.id);
    }

    let handle = test_utils::drain_runner(queue.clone(), 4).start();
    handle.wait_for_shutdown().await;

    for id in &ids {
        let loaded = assert_some!(queue.get(id).await?);
        assert_eq!(loaded.state, JobState::Completed);
    }

    let mut lines: Vec<String> = std::fs::read_to_string(&log)?
        .lines()
        .map(str::to_string)
        .collect();
    lines.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("job-{i}")).collect();
    expected.sort();
    assert_eq!(lines, expected);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_waits_for_inflight_jobs() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue
        .enqueue(NewJob::command("sleep 1 && echo done"))
        .await?;

    let handle = Runner::new(queue.clone(), 1)
        .poll_interval(Duration::from_millis(50))
        .start();

    // Give the worker time to claim and start the child.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Processing);

    handle.shutdown();
    handle.wait_for_shutdown().await;

    // The in-flight child ran to natural completion before shutdown.
    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Completed);
    assert!(loaded.output.as_deref().unwrap_or("").contains("done"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reaper_recovers_orphaned_processing_jobs() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    // Claim without ever reporting, simulating a worker crash.
    let job = queue.enqueue(NewJob::command("echo reborn")).await?;
    assert_some!(queue.claim().await?);

    queue.set_config("reaper_threshold", "0").await?;

    let handle = Runner::new(queue.clone(), 1)
        .poll_interval(Duration::from_millis(50))
        .reap_interval(Duration::from_millis(100))
        .start();

    tokio::time::sleep(Duration::from_millis(600)).await;
    handle.shutdown();
    handle.wait_for_shutdown().await;

    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Completed);
    assert!(loaded.output.as_deref().unwrap_or("").contains("reborn"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_job_is_not_run_early() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let job = queue
        .enqueue(
            NewJob::command("echo late")
                .run_at(chrono::Utc::now() + chrono::Duration::milliseconds(800)),
        )
        .await?;

    let handle = Runner::new(queue.clone(), 1)
        .poll_interval(Duration::from_millis(50))
        .start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Pending);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    handle.shutdown();
    handle.wait_for_shutdown().await;

    let loaded = assert_some!(queue.get(&job.id).await?);
    assert_eq!(loaded.state, JobState::Completed);

    Ok(())
}
