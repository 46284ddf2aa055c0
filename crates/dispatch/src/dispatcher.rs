//! Bounded-concurrency job dispatcher.
//!
//! Each tick claims as many eligible jobs as there are free worker slots
//! and launches one task per job. A worker blocks only on the outbound
//! adapter call (bounded by a per-call timeout) and on store operations;
//! no lock is held across the network call.

use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{Job, JobEvent, JobStatus};
use common::errors::{PipelineError, ProviderError};
use common::event_bus::EventBus;
use common::topics::{TOPIC_JOB_COMPLETED, TOPIC_JOB_FAILED, TOPIC_JOB_STATUS_UPDATE};
use providers::{GenerationRequest, HealthStore, ProviderSelector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Size of the worker pool; at most this many jobs are processing at
    /// once per dispatcher instance.
    pub max_concurrent_jobs: usize,
    pub tick_interval: Duration,
    /// Timeout for a single outbound provider call.
    pub provider_call_timeout: Duration,
    /// Pause after a storage failure before the next tick attempt.
    pub storage_retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            tick_interval: Duration::from_secs(1),
            provider_call_timeout: Duration::from_secs(120),
            storage_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Cheaply clonable handle; clones share the worker-slot counter and
/// shutdown channel.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<JobStore>,
    selector: Arc<ProviderSelector>,
    health: Arc<HealthStore>,
    events: EventBus<JobEvent>,
    retry_policy: RetryPolicy,
    config: DispatcherConfig,
    active_jobs: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        selector: Arc<ProviderSelector>,
        health: Arc<HealthStore>,
        events: EventBus<JobEvent>,
        retry_policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, _rx) = broadcast::channel(1);
        Self {
            store,
            selector,
            health,
            events,
            retry_policy,
            config,
            active_jobs: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start the tick loop. Storage failures are fatal to the tick only:
    /// they are logged and the loop continues after a short delay.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.tick_interval);
            info!(
                max_concurrent = this.config.max_concurrent_jobs,
                "dispatcher started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            error!("dispatcher tick failed: {e}");
                            tokio::time::sleep(this.config.storage_retry_delay).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("dispatcher stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One scheduling round: claim up to the number of free slots and
    /// launch a worker per claimed job. Public so tests can drive the
    /// dispatcher without wall-clock waiting.
    pub async fn tick(&self) -> Result<usize, PipelineError> {
        let active = self.active_jobs.load(Ordering::SeqCst);
        let available_slots = self.config.max_concurrent_jobs.saturating_sub(active);
        if available_slots == 0 {
            debug!(active, "no free worker slots this tick");
            return Ok(0);
        }

        let claimed = self.store.claim_next_batch(available_slots).await?;
        let count = claimed.len();

        for job in claimed {
            self.active_jobs.fetch_add(1, Ordering::SeqCst);
            self.events
                .publish(
                    TOPIC_JOB_STATUS_UPDATE,
                    JobEvent::StatusUpdate {
                        job_id: job.job_id.clone(),
                        status: JobStatus::Processing,
                        retry_count: job.retry_count,
                    },
                )
                .await;

            let worker = self.clone();
            tokio::spawn(async move {
                worker.process_job(job).await;
            });
        }

        Ok(count)
    }

    async fn process_job(&self, job: Job) {
        debug!(job_id = %job.job_id, retry_count = job.retry_count, "worker picked up job");

        // Prefer a provider not yet tried in this retry cycle; fall back to
        // the full candidate set when the exclusions leave nothing.
        let excluded = job.excluded_providers();
        let selection = match self.selector.select(job.content_kind, &excluded).await {
            Err(PipelineError::NoProviderAvailable { .. }) if !excluded.is_empty() => {
                debug!(job_id = %job.job_id, "all previously tried providers excluded, relaxing");
                self.selector.select(job.content_kind, &HashSet::new()).await
            }
            other => other,
        };

        match selection {
            Ok(provider) => self.execute_on_provider(&job, provider).await,
            Err(PipelineError::NoProviderAvailable { content_kind }) => {
                warn!(job_id = %job.job_id, kind = %content_kind, "no provider available, failing job");
                let message = format!("no provider available for content kind '{content_kind}'");
                match self.store.mark_failed(&job.job_id, &message).await {
                    Ok(true) => {
                        self.events
                            .publish(
                                TOPIC_JOB_FAILED,
                                JobEvent::Failed {
                                    job_id: job.job_id.clone(),
                                    error: message,
                                },
                            )
                            .await;
                    }
                    Ok(false) => {
                        debug!(job_id = %job.job_id, "job left processing before failure write")
                    }
                    Err(e) => error!(job_id = %job.job_id, "failed to mark job failed: {e}"),
                }
            }
            Err(e) => {
                error!(job_id = %job.job_id, "provider selection failed: {e}");
            }
        }

        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    async fn execute_on_provider(
        &self,
        job: &Job,
        provider: Arc<dyn providers::ContentProvider>,
    ) {
        let provider_name = provider.name().to_string();

        // A successful selection after exclusions is a fallback serve
        if job.retry_count > 0 && !job.excluded_providers().contains(&provider_name) {
            self.health.metrics().record_fallback(&provider_name);
        }

        let request = GenerationRequest::new(job.content_kind, job.request_params.clone());
        let started = Instant::now();

        let call = tokio::time::timeout(
            self.config.provider_call_timeout,
            provider.generate(&request),
        )
        .await;

        match call {
            Ok(Ok(outcome)) => {
                self.health.record_success(
                    &provider_name,
                    outcome.response_time.as_millis() as u64,
                    Some(outcome.quality_score),
                );

                let processing_time_ms = started.elapsed().as_millis() as u64;
                match self
                    .store
                    .complete(
                        &job.job_id,
                        &provider_name,
                        &outcome.model,
                        &outcome.content,
                        processing_time_ms,
                        outcome.tokens_used,
                        outcome.cost_estimate,
                    )
                    .await
                {
                    Ok(true) => {
                        info!(
                            job_id = %job.job_id,
                            provider = %provider_name,
                            processing_time_ms,
                            tokens = outcome.tokens_used,
                            "job completed"
                        );
                        self.events
                            .publish(
                                TOPIC_JOB_STATUS_UPDATE,
                                JobEvent::StatusUpdate {
                                    job_id: job.job_id.clone(),
                                    status: JobStatus::Completed,
                                    retry_count: job.retry_count,
                                },
                            )
                            .await;
                        self.events
                            .publish(
                                TOPIC_JOB_COMPLETED,
                                JobEvent::Completed {
                                    job_id: job.job_id.clone(),
                                    result_content: outcome.content,
                                },
                            )
                            .await;
                    }
                    Ok(false) => {
                        // Advisory cancel won the race; the result is dropped
                        warn!(job_id = %job.job_id, "job no longer processing, result discarded");
                    }
                    Err(e) => error!(job_id = %job.job_id, "failed to store result: {e}"),
                }
            }
            Ok(Err(provider_error)) => {
                self.health
                    .record_failure(&provider_name, provider_error.kind);
                self.handle_failure(job, &provider_name, &provider_error).await;
            }
            Err(_elapsed) => {
                let provider_error = ProviderError::timeout(format!(
                    "provider call exceeded {}s",
                    self.config.provider_call_timeout.as_secs()
                ));
                self.health
                    .record_failure(&provider_name, provider_error.kind);
                self.handle_failure(job, &provider_name, &provider_error).await;
            }
        }
    }

    async fn handle_failure(&self, job: &Job, provider_name: &str, error: &ProviderError) {
        warn!(
            job_id = %job.job_id,
            provider = provider_name,
            kind = %error.kind,
            "provider call failed: {}", error.message
        );

        match self
            .store
            .record_failure(&job.job_id, Some(provider_name), error, &self.retry_policy)
            .await
        {
            Ok(Some(JobStatus::Queued)) => {
                self.events
                    .publish(
                        TOPIC_JOB_STATUS_UPDATE,
                        JobEvent::StatusUpdate {
                            job_id: job.job_id.clone(),
                            status: JobStatus::Queued,
                            retry_count: job.retry_count + 1,
                        },
                    )
                    .await;
            }
            Ok(Some(JobStatus::Failed)) => {
                self.events
                    .publish(
                        TOPIC_JOB_FAILED,
                        JobEvent::Failed {
                            job_id: job.job_id.clone(),
                            error: error.to_string(),
                        },
                    )
                    .await;
            }
            Ok(_) => debug!(job_id = %job.job_id, "job left processing before failure write"),
            Err(e) => error!(job_id = %job.job_id, "failed to record job failure: {e}"),
        }
    }
}
