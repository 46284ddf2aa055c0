//! Operator-facing facade over the queue, dispatcher, and provider
//! orchestration. REST/WebSocket layers call into this; nothing above it
//! touches the stores directly.

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::maintenance::{Maintenance, MaintenanceConfig};
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{EnqueueRequest, Job, JobEvent, JobStatus, QueueStatistics};
use common::errors::PipelineError;
use common::event_bus::{EventBus, EventEnvelope, Topic};
use common::scheduler::Scheduler;
use common::topics::TOPIC_JOB_STATUS_UPDATE;
use providers::{
    ContentProvider, HealthConfig, HealthStore, ProbeStatus, ProviderHealthSnapshot,
    ProviderMetricsAggregate, ProviderRegistry, ProviderSelector, SelectorConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub dispatcher: DispatcherConfig,
    pub maintenance: MaintenanceConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    pub selector: SelectorConfig,
}

pub struct GenerationService {
    store: Arc<JobStore>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthStore>,
    dispatcher: Dispatcher,
    maintenance: Maintenance,
    scheduler: Scheduler,
    events: EventBus<JobEvent>,
    dispatcher_handle: JoinHandle<()>,
    config: ServiceConfig,
}

impl GenerationService {
    /// Open the store, register the providers, and start the dispatcher
    /// loop and maintenance tasks.
    pub async fn start<P: AsRef<Path>>(
        database_path: P,
        provider_list: Vec<Arc<dyn ContentProvider>>,
        config: ServiceConfig,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(JobStore::new(database_path).await?);
        let registry = Arc::new(ProviderRegistry::new());
        let health = Arc::new(HealthStore::new_with_config(config.health.clone()));
        let events: EventBus<JobEvent> = EventBus::default();
        let scheduler = Scheduler::new();

        for provider in provider_list {
            health.register(provider.name());
            registry.register(provider).await?;
        }

        let selector = Arc::new(ProviderSelector::new_with_config(
            Arc::clone(&registry),
            Arc::clone(&health),
            config.selector.clone(),
        ));

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            selector,
            Arc::clone(&health),
            events.clone(),
            config.retry.clone(),
            config.dispatcher.clone(),
        );
        let dispatcher_handle = dispatcher.spawn();

        let maintenance = Maintenance::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&health),
            events.clone(),
            config.retry.clone(),
            config.maintenance.clone(),
        );
        maintenance.spawn_all(&scheduler).await;

        info!("generation service started");
        Ok(Self {
            store,
            registry,
            health,
            dispatcher,
            maintenance,
            scheduler,
            events,
            dispatcher_handle,
            config,
        })
    }

    /// Create a queued job and return its id. The caller polls or
    /// subscribes for everything that happens after this point.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<String, PipelineError> {
        let job = self.store.enqueue(request).await?;
        self.events
            .publish(
                TOPIC_JOB_STATUS_UPDATE,
                JobEvent::StatusUpdate {
                    job_id: job.job_id.clone(),
                    status: JobStatus::Queued,
                    retry_count: 0,
                },
            )
            .await;
        Ok(job.job_id)
    }

    /// Cancel a job. Advisory for processing jobs: the in-flight provider
    /// call is not aborted, but its result will be discarded.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, PipelineError> {
        let status = self.store.cancel(job_id).await?;
        if status == JobStatus::Cancelled {
            self.events
                .publish(
                    TOPIC_JOB_STATUS_UPDATE,
                    JobEvent::StatusUpdate {
                        job_id: job_id.to_string(),
                        status: JobStatus::Cancelled,
                        retry_count: 0,
                    },
                )
                .await;
        }
        Ok(status)
    }

    pub async fn job_status(&self, job_id: &str) -> Result<Job, PipelineError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))
    }

    pub async fn queue_statistics(&self) -> Result<QueueStatistics, PipelineError> {
        Ok(self
            .store
            .queue_statistics(
                self.dispatcher.active_jobs(),
                self.config.dispatcher.max_concurrent_jobs,
            )
            .await?)
    }

    pub fn provider_health(&self, name: &str) -> Option<ProviderHealthSnapshot> {
        self.health.snapshot(name)
    }

    pub fn provider_metrics(&self, name: &str) -> Option<ProviderMetricsAggregate> {
        self.health.aggregate(name)
    }

    /// Probe one provider immediately, record the outcome, and return the
    /// refreshed health record.
    pub async fn force_health_check(
        &self,
        name: &str,
    ) -> Result<ProviderHealthSnapshot, PipelineError> {
        let provider = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| PipelineError::NotFound(format!("provider {name}")))?;

        let started = Instant::now();
        match tokio::time::timeout(
            self.config.maintenance.probe_timeout,
            provider.health_check(),
        )
        .await
        {
            Ok(Ok(ProbeStatus::Ok)) | Ok(Ok(ProbeStatus::Degraded)) => {
                self.health
                    .record_probe_success(name, started.elapsed().as_millis() as u64);
            }
            Ok(Ok(ProbeStatus::Unavailable)) | Ok(Err(_)) | Err(_) => {
                self.health.record_probe_failure(name);
            }
        }
        self.health.recompute_level(name);

        self.health
            .snapshot(name)
            .ok_or_else(|| PipelineError::NotFound(format!("provider {name}")))
    }

    /// Subscribe to job lifecycle notifications.
    pub async fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope<JobEvent>> {
        self.events.subscribe(topic).await
    }

    /// Direct handle to the maintenance tasks, mainly for tests that tick
    /// them manually.
    pub fn maintenance(&self) -> &Maintenance {
        &self.maintenance
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.dispatcher.shutdown();
        let _ = self.dispatcher_handle.await;
        info!("generation service stopped");
    }
}
