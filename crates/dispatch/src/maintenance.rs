//! Periodic maintenance: provider health rollups, stuck-job reaping,
//! expiry, and retention cleanup.
//!
//! Each task body is a plain async method, so tests call them directly
//! instead of waiting on intervals; `spawn_all` wires them onto the shared
//! scheduler for production.

use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{JobEvent, JobStatus};
use chrono::Utc;
use common::event_bus::EventBus;
use common::scheduler::{ScheduledTask, Scheduler, TaskId};
use common::topics::{TOPIC_JOB_FAILED, TOPIC_JOB_STATUS_UPDATE};
use providers::{HealthStore, ProbeStatus, ProviderRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often providers are probed and health levels recomputed.
    pub health_interval: Duration,
    /// How often stuck and expired jobs are reaped.
    pub reaper_interval: Duration,
    /// How often retention cleanup runs.
    pub retention_interval: Duration,
    /// Wall-clock processing budget per job; exceeded jobs are reaped.
    pub job_timeout: Duration,
    /// Timeout for a single health probe.
    pub probe_timeout: Duration,
    /// Metrics window TTL; windows older than this reset to zero.
    pub metrics_retention: Duration,
    /// How long terminal jobs are kept before deletion.
    pub job_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            metrics_retention: Duration::from_secs(24 * 3600),
            job_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Cheaply clonable handle over the shared stores; each periodic task owns
/// a clone.
#[derive(Clone)]
pub struct Maintenance {
    store: Arc<JobStore>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthStore>,
    events: EventBus<JobEvent>,
    retry_policy: RetryPolicy,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthStore>,
        events: EventBus<JobEvent>,
        retry_policy: RetryPolicy,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            health,
            events,
            retry_policy,
            config,
        }
    }

    /// Register every maintenance task on the scheduler.
    pub async fn spawn_all(&self, scheduler: &Scheduler) {
        let this = self.clone();
        scheduler
            .spawn_periodic(
                ScheduledTask {
                    id: TaskId("providers.health_rollup"),
                    interval: self.config.health_interval,
                },
                move || {
                    let this = this.clone();
                    async move { this.run_health_rollup().await }
                },
            )
            .await;

        let this = self.clone();
        scheduler
            .spawn_periodic(
                ScheduledTask {
                    id: TaskId("jobs.timeout_reaper"),
                    interval: self.config.reaper_interval,
                },
                move || {
                    let this = this.clone();
                    async move { this.run_timeout_reaper().await }
                },
            )
            .await;

        let this = self.clone();
        scheduler
            .spawn_periodic(
                ScheduledTask {
                    id: TaskId("jobs.expiry_reaper"),
                    interval: self.config.reaper_interval,
                },
                move || {
                    let this = this.clone();
                    async move { this.run_expiry_reaper().await }
                },
            )
            .await;

        let this = self.clone();
        scheduler
            .spawn_periodic(
                ScheduledTask {
                    id: TaskId("storage.retention"),
                    interval: self.config.retention_interval,
                },
                move || {
                    let this = this.clone();
                    async move { this.run_retention().await }
                },
            )
            .await;

        info!("maintenance tasks scheduled");
    }

    /// Probe every registered provider, refresh cached health levels, and
    /// fold metrics into hourly/daily rollups. Probe successes reset an
    /// open circuit breaker, which is how an excluded provider recovers
    /// without live traffic.
    pub async fn run_health_rollup(&self) {
        for provider in self.registry.list().await {
            let name = provider.name().to_string();
            let started = Instant::now();

            match tokio::time::timeout(self.config.probe_timeout, provider.health_check()).await {
                Ok(Ok(ProbeStatus::Ok)) | Ok(Ok(ProbeStatus::Degraded)) => {
                    self.health
                        .record_probe_success(&name, started.elapsed().as_millis() as u64);
                }
                Ok(Ok(ProbeStatus::Unavailable)) => {
                    debug!(provider = %name, "health probe reported unavailable");
                    self.health.record_probe_failure(&name);
                }
                Ok(Err(e)) => {
                    debug!(provider = %name, "health probe failed: {e}");
                    self.health.record_probe_failure(&name);
                }
                Err(_) => {
                    debug!(provider = %name, "health probe timed out");
                    self.health.record_probe_failure(&name);
                }
            }
        }

        self.health.recompute_all_levels();
        self.health.metrics().rollup(Utc::now()).await;
    }

    /// Requeue or fail jobs stuck in processing past the wall-clock budget.
    pub async fn run_timeout_reaper(&self) {
        match self
            .store
            .reap_timed_out(self.config.job_timeout, &self.retry_policy)
            .await
        {
            Ok(reaped) => {
                for (job_id, status) in reaped {
                    match status {
                        JobStatus::Queued => {
                            self.events
                                .publish(
                                    TOPIC_JOB_STATUS_UPDATE,
                                    JobEvent::StatusUpdate {
                                        job_id,
                                        status: JobStatus::Queued,
                                        retry_count: 0,
                                    },
                                )
                                .await;
                        }
                        JobStatus::Failed => {
                            self.events
                                .publish(
                                    TOPIC_JOB_FAILED,
                                    JobEvent::Failed {
                                        job_id,
                                        error: "job processing timed out".to_string(),
                                    },
                                )
                                .await;
                        }
                        other => warn!(status = %other, "unexpected reap outcome"),
                    }
                }
            }
            Err(e) => error!("timeout reaper failed: {e}"),
        }
    }

    /// Expire jobs past their deadline, whatever their current state.
    pub async fn run_expiry_reaper(&self) {
        match self.store.reap_expired().await {
            Ok(expired) => {
                for job_id in expired {
                    self.events
                        .publish(
                            TOPIC_JOB_STATUS_UPDATE,
                            JobEvent::StatusUpdate {
                                job_id,
                                status: JobStatus::Expired,
                                retry_count: 0,
                            },
                        )
                        .await;
                }
            }
            Err(e) => error!("expiry reaper failed: {e}"),
        }
    }

    /// Reset stale metrics windows and purge old terminal jobs.
    pub async fn run_retention(&self) {
        self.health
            .metrics()
            .reset_expired_windows(self.config.metrics_retention);

        if let Err(e) = self.store.purge_terminal(self.config.job_retention).await {
            error!("terminal job purge failed: {e}");
        }
    }
}
