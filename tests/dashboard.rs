#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use claims::assert_some;
use http_body_util::BodyExt;
use queuectl::dashboard::create_router;
use queuectl::{NewJob, Queue};
use tower::ServiceExt;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Open a queue over a fresh database file in a temp directory.
    pub(super) async fn open_queue() -> anyhow::Result<(tempfile::TempDir, Queue)> {
        let tmp = tempfile::tempdir()?;
        let queue = Queue::open(tmp.path().join("queue.db")).await?;
        Ok((tmp, queue))
    }

    /// Issue one request against a fresh router over the queue.
    pub(super) async fn get(queue: Queue, path: &str) -> anyhow::Result<(StatusCode, String)> {
        let app = create_router(queue);
        let request = Request::builder().uri(path).body(Body::empty())?;

        let response = app.oneshot(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, String::from_utf8_lossy(&body).to_string()))
    }
}

#[tokio::test]
async fn index_page_renders() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let (status, body) = test_utils::get(queue, "/").await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("queuectl"));

    Ok(())
}

#[tokio::test]
async fn stats_endpoint_reports_counts_and_metrics() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let done = queue.enqueue(NewJob::command("echo done")).await?;
    assert_some!(queue.claim().await?);
    queue.complete(&done.id, "done\n", 40).await?;

    queue.enqueue(NewJob::command("echo waiting")).await?;

    let dead = queue
        .enqueue(NewJob::command("exit 1").max_retries(0))
        .await?;
    assert_some!(queue.claim().await?);
    queue.fail(&dead.id, "boom").await?;

    let (status, body) = test_utils::get(queue, "/api/stats").await?;
    assert_eq!(status, StatusCode::OK);

    let stats: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["dead"], 1);
    assert_eq!(stats["totalCompleted"], 1);
    assert_eq!(stats["successRate"], 50);
    assert_eq!(stats["avgExecutionTime"], 40.0);

    Ok(())
}

#[tokio::test]
async fn jobs_endpoint_filters_by_state_and_limit() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let done = queue.enqueue(NewJob::command("echo done")).await?;
    assert_some!(queue.claim().await?);
    queue.complete(&done.id, "done\n", 1).await?;

    for i in 0..3 {
        queue.enqueue(NewJob::command(format!("echo {i}"))).await?;
    }

    let (status, body) = test_utils::get(queue.clone(), "/api/jobs?state=pending").await?;
    assert_eq!(status, StatusCode::OK);
    let jobs: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(jobs.as_array().map(Vec::len), Some(3));

    let (status, body) =
        test_utils::get(queue.clone(), "/api/jobs?state=pending&limit=2").await?;
    assert_eq!(status, StatusCode::OK);
    let jobs: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(jobs.as_array().map(Vec::len), Some(2));

    let (status, body) = test_utils::get(queue.clone(), "/api/jobs?state=completed").await?;
    assert_eq!(status, StatusCode::OK);
    let jobs: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(jobs.as_array().map(Vec::len), Some(1));
    assert_eq!(jobs[0]["id"], serde_json::Value::String(done.id.clone()));
    assert_eq!(jobs[0]["state"], "completed");

    let (status, _) = test_utils::get(queue, "/api/jobs?state=bogus").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn unknown_paths_get_404() -> anyhow::Result<()> {
    let (_tmp, queue) = test_utils::open_queue().await?;

    let (status, _) = test_utils::get(queue.clone(), "/nope").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = test_utils::get(queue, "/api/other").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}
