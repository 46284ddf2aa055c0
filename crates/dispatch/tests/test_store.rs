#![allow(clippy::uninlined_format_args)]

use common::errors::{PipelineError, ProviderError, ProviderErrorKind};
use dispatch::{EnqueueRequest, JobPriority, JobStatus, JobStore, RetryPolicy};
use providers::ContentKind;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn store_in(dir: &TempDir) -> JobStore {
    let db_path = dir.path().join("jobs.db");
    JobStore::new(&db_path).await.expect("failed to open job store")
}

fn request(owner: &str) -> EnqueueRequest {
    EnqueueRequest::new(
        owner,
        ContentKind::Summary,
        serde_json::json!({"prompt": "summarize the launch notes"}),
    )
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy::new()
        .with_base_delay(Duration::ZERO)
        .with_max_delay(Duration::ZERO)
}

#[tokio::test]
async fn enqueue_rejects_empty_params() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    for params in [
        serde_json::Value::Null,
        serde_json::json!({}),
        serde_json::json!(""),
        serde_json::json!([]),
    ] {
        let err = store
            .enqueue(EnqueueRequest::new("owner-1", ContentKind::Summary, params))
            .await
            .expect_err("empty params must be rejected");
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}

#[tokio::test]
async fn enqueue_creates_queued_job_with_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    let job = store.enqueue(request("owner-1")).await.expect("enqueue");
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, 3);
    assert!(job.next_retry_at.is_none());
    assert!(job.started_at.is_none());

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.job_id, job.job_id);
    assert_eq!(fetched.owner_id, "owner-1");
    assert_eq!(fetched.priority, JobPriority::Standard);
    // Default TTL is about a day out
    let ttl = fetched.expires_at - fetched.created_at;
    assert!(ttl >= chrono::Duration::hours(23));
}

#[tokio::test]
async fn claim_orders_by_priority_then_fifo() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    let batch = store
        .enqueue(request("o").with_priority(JobPriority::Batch))
        .await
        .expect("enqueue batch");
    let standard_first = store
        .enqueue(request("o").with_priority(JobPriority::Standard))
        .await
        .expect("enqueue standard 1");
    let standard_second = store
        .enqueue(request("o").with_priority(JobPriority::Standard))
        .await
        .expect("enqueue standard 2");
    let premium = store
        .enqueue(request("o").with_priority(JobPriority::Premium))
        .await
        .expect("enqueue premium");

    let claimed = store.claim_next_batch(10).await.expect("claim");
    let ids: Vec<&str> = claimed.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            premium.job_id.as_str(),
            standard_first.job_id.as_str(),
            standard_second.job_id.as_str(),
            batch.job_id.as_str(),
        ]
    );

    for job in &claimed {
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
    }
}

#[tokio::test]
async fn claim_respects_limit() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    for _ in 0..5 {
        store.enqueue(request("o")).await.expect("enqueue");
    }

    let claimed = store.claim_next_batch(2).await.expect("claim");
    assert_eq!(claimed.len(), 2);
    let claimed = store.claim_next_batch(10).await.expect("claim rest");
    assert_eq!(claimed.len(), 3);
}

#[tokio::test]
async fn racing_claims_have_exactly_one_winner() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(store_in(&dir).await);

    let job = store.enqueue(request("o")).await.expect("enqueue");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.claim_next_batch(1).await.expect("claim").len()
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.expect("join");
    }
    assert_eq!(total, 1, "exactly one worker may win a queued job");

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.status, JobStatus::Processing);
}

#[tokio::test]
async fn failure_requeues_with_backoff_stamp() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;
    let slow_policy = RetryPolicy::new().with_base_delay(Duration::from_secs(3600));

    let job = store.enqueue(request("o")).await.expect("enqueue");
    store.claim_next_batch(1).await.expect("claim");

    let error = ProviderError::new(ProviderErrorKind::ServerError, "upstream 500");
    let status = store
        .record_failure(&job.job_id, Some("openai"), &error, &slow_policy)
        .await
        .expect("record failure")
        .expect("job was processing");
    assert_eq!(status, JobStatus::Queued);

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.retry_count, 1);
    assert_eq!(fetched.provider_used.as_deref(), Some("openai"));
    assert!(fetched.next_retry_at.expect("backoff stamp") > chrono::Utc::now());
    assert!(fetched.started_at.is_none());

    // Backoff stamp in the future keeps the job out of the claim window
    let claimed = store.claim_next_batch(1).await.expect("claim");
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn third_failure_with_three_max_retries_is_terminal() {
    // maxRetries bounds total attempts: the third consecutive failure must
    // resolve the job, with no fourth attempt possible.
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;
    let policy = no_backoff();
    let error = ProviderError::new(ProviderErrorKind::ServerError, "boom");

    let job = store
        .enqueue(request("o").with_max_retries(3))
        .await
        .expect("enqueue");

    for attempt in 1..=3u32 {
        let claimed = store.claim_next_batch(1).await.expect("claim");
        assert_eq!(claimed.len(), 1, "attempt {} must be claimable", attempt);

        let status = store
            .record_failure(&job.job_id, Some("openai"), &error, &policy)
            .await
            .expect("record failure")
            .expect("job was processing");

        let fetched = store
            .get(&job.job_id)
            .await
            .expect("get")
            .expect("job exists");
        assert!(fetched.retry_count <= fetched.max_retries);

        if attempt < 3 {
            assert_eq!(status, JobStatus::Queued);
            assert_eq!(fetched.retry_count, attempt);
        } else {
            assert_eq!(status, JobStatus::Failed);
            assert_eq!(fetched.retry_count, 3);
            assert!(fetched.error_message.is_some());
            assert!(fetched.completed_at.is_some());
        }
    }

    // Terminal: nothing left to claim
    let claimed = store.claim_next_batch(1).await.expect("claim");
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn failure_details_accumulate_attempted_providers() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;
    let policy = no_backoff();

    let job = store
        .enqueue(request("o").with_max_retries(3))
        .await
        .expect("enqueue");

    store.claim_next_batch(1).await.expect("claim");
    let error = ProviderError::from_status_code(429, "rate limited".to_string());
    store
        .record_failure(&job.job_id, Some("openai"), &error, &policy)
        .await
        .expect("first failure");

    store.claim_next_batch(1).await.expect("claim again");
    let error = ProviderError::new(ProviderErrorKind::Timeout, "slow upstream");
    store
        .record_failure(&job.job_id, Some("anthropic"), &error, &policy)
        .await
        .expect("second failure");

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    let excluded = fetched.excluded_providers();
    assert!(excluded.contains("openai"));
    assert!(excluded.contains("anthropic"));

    let details = fetched.error_details.expect("details recorded");
    assert_eq!(details["kind"], "timeout");
    assert_eq!(details["attempted_providers"].as_array().map(|a| a.len()), Some(2));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    let job = store.enqueue(request("o")).await.expect("enqueue");

    let first = store.cancel(&job.job_id).await.expect("first cancel");
    assert_eq!(first, JobStatus::Cancelled);

    let second = store.cancel(&job.job_id).await.expect("second cancel");
    assert_eq!(second, JobStatus::Cancelled);

    let err = store.cancel("missing-job").await.expect_err("unknown job");
    assert!(matches!(err, PipelineError::NotFound(_)));
}

#[tokio::test]
async fn completion_does_not_overwrite_a_cancelled_job() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    let job = store.enqueue(request("o")).await.expect("enqueue");
    store.claim_next_batch(1).await.expect("claim");

    // Advisory cancel lands while the provider call is in flight
    let status = store.cancel(&job.job_id).await.expect("cancel");
    assert_eq!(status, JobStatus::Cancelled);

    let written = store
        .complete(&job.job_id, "openai", "gpt-test", "late result", 1200, 64, 0.002)
        .await
        .expect("complete call");
    assert!(!written, "worker must not overwrite a cancelled job");

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.status, JobStatus::Cancelled);
    assert!(fetched.result_content.is_none());
    // Cancellation is an expected outcome, not a failure
    assert!(fetched.error_message.is_none());
}

#[tokio::test]
async fn expired_job_is_reaped_and_never_dispatched() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    let job = store
        .enqueue(request("o").with_ttl(Duration::ZERO))
        .await
        .expect("enqueue");

    // Already past expiry: the claim window must skip it
    let claimed = store.claim_next_batch(10).await.expect("claim");
    assert!(claimed.is_empty());

    let reaped = store.reap_expired().await.expect("reap");
    assert_eq!(reaped, vec![job.job_id.clone()]);

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.status, JobStatus::Expired);
    assert!(fetched.error_message.is_none());

    // Reaping again is a no-op
    let reaped = store.reap_expired().await.expect("reap again");
    assert!(reaped.is_empty());
}

#[tokio::test]
async fn stuck_jobs_are_requeued_until_retries_exhaust() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;
    let policy = no_backoff();

    let job = store
        .enqueue(request("o").with_max_retries(2))
        .await
        .expect("enqueue");

    // First timeout: requeued
    store.claim_next_batch(1).await.expect("claim");
    let reaped = store
        .reap_timed_out(Duration::ZERO, &policy)
        .await
        .expect("reap");
    assert_eq!(reaped, vec![(job.job_id.clone(), JobStatus::Queued)]);

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.retry_count, 1);

    // Second timeout exhausts the budget
    store.claim_next_batch(1).await.expect("claim again");
    let reaped = store
        .reap_timed_out(Duration::ZERO, &policy)
        .await
        .expect("reap again");
    assert_eq!(reaped, vec![(job.job_id.clone(), JobStatus::Failed)]);

    let fetched = store
        .get(&job.job_id)
        .await
        .expect("get")
        .expect("job exists");
    assert_eq!(fetched.status, JobStatus::Failed);
    assert_eq!(fetched.retry_count, 2);
}

#[tokio::test]
async fn retention_purges_only_old_terminal_jobs() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    let finished = store.enqueue(request("o")).await.expect("enqueue finished");
    store.claim_next_batch(1).await.expect("claim");
    store
        .complete(&finished.job_id, "openai", "gpt-test", "done", 800, 32, 0.001)
        .await
        .expect("complete");

    let pending = store.enqueue(request("o")).await.expect("enqueue pending");

    let purged = store
        .purge_terminal(Duration::ZERO)
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    assert!(store.get(&finished.job_id).await.expect("get").is_none());
    assert!(store.get(&pending.job_id).await.expect("get").is_some());
}

#[tokio::test]
async fn queue_statistics_reflect_state() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_in(&dir).await;

    store
        .enqueue(request("o").with_priority(JobPriority::Premium))
        .await
        .expect("enqueue premium");
    store
        .enqueue(request("o").with_priority(JobPriority::Batch))
        .await
        .expect("enqueue batch");
    let done = store.enqueue(request("o")).await.expect("enqueue done");

    let claimed = store.claim_next_batch(3).await.expect("claim");
    assert_eq!(claimed.len(), 3);
    store
        .complete(&done.job_id, "openai", "gpt-test", "done", 500, 16, 0.001)
        .await
        .expect("complete");

    // Re-queue the others so the priority breakdown is visible
    let policy = no_backoff();
    let error = ProviderError::new(ProviderErrorKind::ServerError, "x");
    for job in claimed.iter().filter(|j| j.job_id != done.job_id) {
        store
            .record_failure(&job.job_id, None, &error, &policy)
            .await
            .expect("requeue");
    }

    let stats = store.queue_statistics(2, 10).await.expect("stats");
    assert_eq!(stats.by_status.get("completed"), Some(&1));
    assert_eq!(stats.by_status.get("queued"), Some(&2));
    assert_eq!(stats.queued_by_priority.get("premium"), Some(&1));
    assert_eq!(stats.queued_by_priority.get("batch"), Some(&1));
    assert!(stats.avg_processing_time_ms > 0.0);
    assert_eq!(stats.active_jobs, 2);
    assert!((stats.capacity_utilization - 0.2).abs() < 1e-9);
}
