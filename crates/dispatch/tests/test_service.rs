#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use common::errors::{PipelineError, ProviderError};
use common::topics::{TOPIC_JOB_COMPLETED, TOPIC_JOB_STATUS_UPDATE};
use dispatch::{
    DispatcherConfig, EnqueueRequest, GenerationService, JobEvent, JobStatus, MaintenanceConfig,
    RetryPolicy, ServiceConfig,
};
use providers::{
    ContentKind, ContentProvider, GenerationOutcome, GenerationRequest, HealthLevel, ProbeStatus,
    ProviderCapabilities,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct FlakyProvider {
    healthy: AtomicBool,
}

impl FlakyProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_kinds: vec![ContentKind::Summary],
            max_tokens: 1024,
            cost_per_1k_tokens: 0.01,
        }
    }

    async fn health_check(&self) -> Result<ProbeStatus, ProviderError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(ProbeStatus::Ok)
        } else {
            Ok(ProbeStatus::Unavailable)
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, ProviderError> {
        Ok(GenerationOutcome {
            content: format!("summary of: {}", request.prompt_text()),
            model: "flaky-1".to_string(),
            tokens_used: 64,
            cost_estimate: 0.001,
            quality_score: 7.5,
            response_time: Duration::from_millis(25),
        })
    }
}

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        dispatcher: DispatcherConfig {
            max_concurrent_jobs: 4,
            tick_interval: Duration::from_millis(20),
            provider_call_timeout: Duration::from_secs(5),
            storage_retry_delay: Duration::from_millis(20),
        },
        maintenance: MaintenanceConfig {
            health_interval: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(1),
            ..MaintenanceConfig::default()
        },
        retry: RetryPolicy::new().with_base_delay(Duration::ZERO),
        ..ServiceConfig::default()
    }
}

#[tokio::test]
async fn enqueue_poll_and_events_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let provider = FlakyProvider::new();
    let service = GenerationService::start(
        dir.path().join("jobs.db"),
        vec![provider as Arc<dyn ContentProvider>],
        fast_config(),
    )
    .await
    .expect("service start");

    let mut status_rx = service.subscribe(TOPIC_JOB_STATUS_UPDATE).await;
    let mut completed_rx = service.subscribe(TOPIC_JOB_COMPLETED).await;

    let job_id = service
        .enqueue(EnqueueRequest::new(
            "owner-1",
            ContentKind::Summary,
            serde_json::json!({"prompt": "release announcement"}),
        ))
        .await
        .expect("enqueue");

    // The completion event arrives without the caller ever blocking on it
    let completed = tokio::time::timeout(Duration::from_secs(3), completed_rx.recv())
        .await
        .expect("completion event in time")
        .expect("event delivered");
    match completed.payload {
        JobEvent::Completed {
            job_id: event_job_id,
            result_content,
        } => {
            assert_eq!(event_job_id, job_id);
            assert!(result_content.contains("release announcement"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // At least the queued and processing transitions were announced
    let first = status_rx.recv().await.expect("status event");
    match first.payload {
        JobEvent::StatusUpdate { status, .. } => assert_eq!(status, JobStatus::Queued),
        other => panic!("unexpected event: {:?}", other),
    }

    let job = service.job_status(&job_id).await.expect("job status");
    assert_eq!(job.status, JobStatus::Completed);

    let stats = service.queue_statistics().await.expect("stats");
    assert_eq!(stats.by_status.get("completed"), Some(&1));
    assert_eq!(stats.max_concurrent_jobs, 4);

    service.shutdown().await;
}

#[tokio::test]
async fn unknown_job_lookups_are_not_found() {
    let dir = TempDir::new().expect("temp dir");
    let service = GenerationService::start(
        dir.path().join("jobs.db"),
        vec![FlakyProvider::new() as Arc<dyn ContentProvider>],
        fast_config(),
    )
    .await
    .expect("service start");

    let err = service.job_status("missing").await.expect_err("not found");
    assert!(matches!(err, PipelineError::NotFound(_)));

    let err = service
        .force_health_check("missing")
        .await
        .expect_err("unknown provider");
    assert!(matches!(err, PipelineError::NotFound(_)));

    service.shutdown().await;
}

#[tokio::test]
async fn forced_health_check_records_probe_outcomes() {
    let dir = TempDir::new().expect("temp dir");
    let provider = FlakyProvider::new();
    let service = GenerationService::start(
        dir.path().join("jobs.db"),
        vec![Arc::clone(&provider) as Arc<dyn ContentProvider>],
        fast_config(),
    )
    .await
    .expect("service start");

    let snapshot = service
        .force_health_check("flaky")
        .await
        .expect("health check");
    assert!(snapshot.is_available);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert!(snapshot.last_success_at.is_some());

    // Five failed probes open the breaker
    provider.set_healthy(false);
    let mut snapshot = service
        .force_health_check("flaky")
        .await
        .expect("health check");
    for _ in 0..4 {
        snapshot = service
            .force_health_check("flaky")
            .await
            .expect("health check");
    }
    assert_eq!(snapshot.consecutive_failures, 5);
    assert!(!snapshot.is_available);

    // One healthy probe closes it again
    provider.set_healthy(true);
    let snapshot = service
        .force_health_check("flaky")
        .await
        .expect("health check");
    assert_eq!(snapshot.consecutive_failures, 0);
    assert!(snapshot.is_available);
    assert_eq!(snapshot.health_level, HealthLevel::Healthy);

    service.shutdown().await;
}

#[tokio::test]
async fn maintenance_tick_expires_stale_jobs() {
    let dir = TempDir::new().expect("temp dir");
    let service = GenerationService::start(
        dir.path().join("jobs.db"),
        vec![FlakyProvider::new() as Arc<dyn ContentProvider>],
        ServiceConfig {
            dispatcher: DispatcherConfig {
                // Slow ticks: the job must be expired by maintenance, not
                // raced by the dispatcher
                tick_interval: Duration::from_secs(3600),
                ..DispatcherConfig::default()
            },
            ..fast_config()
        },
    )
    .await
    .expect("service start");

    let job_id = service
        .enqueue(
            EnqueueRequest::new(
                "owner-1",
                ContentKind::Summary,
                serde_json::json!({"prompt": "x"}),
            )
            .with_ttl(Duration::ZERO),
        )
        .await
        .expect("enqueue");

    // Manual maintenance tick instead of waiting for the interval
    service.maintenance().run_expiry_reaper().await;

    let job = service.job_status(&job_id).await.expect("job status");
    assert_eq!(job.status, JobStatus::Expired);
    assert!(job.error_message.is_none());

    service.shutdown().await;
}
