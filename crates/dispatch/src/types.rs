use chrono::{DateTime, Utc};
use providers::ContentKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a dispatcher slot (or for its next retry window).
    Queued,
    /// Claimed by a worker; an adapter call may be in flight.
    Processing,
    /// Finished with generated content.
    Completed,
    /// Exhausted its attempts; carries an error message.
    Failed,
    /// Cancelled by the caller. Not an error.
    Cancelled,
    /// Passed its expiry deadline before completing. Not an error.
    Expired,
}

impl JobStatus {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Expired
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "expired" => Ok(JobStatus::Expired),
            _ => Err(anyhow::anyhow!("unknown job status: {}", s)),
        }
    }
}

/// Scheduling tier. Lower numeric value is served first; a continuous
/// stream of premium jobs can starve batch jobs, which is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Premium = 0,
    Standard = 1,
    Batch = 2,
}

impl JobPriority {
    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => JobPriority::Premium,
            2 => JobPriority::Batch,
            _ => JobPriority::Standard,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Premium => write!(f, "premium"),
            JobPriority::Standard => write!(f, "standard"),
            JobPriority::Batch => write!(f, "batch"),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "premium" => Ok(JobPriority::Premium),
            "standard" => Ok(JobPriority::Standard),
            "batch" => Ok(JobPriority::Batch),
            _ => Err(anyhow::anyhow!("unknown job priority: {}", s)),
        }
    }
}

/// One content-generation request tracked through its lifecycle.
///
/// `max_retries` bounds the total number of delivery attempts; a job is
/// failed on the attempt that brings `retry_count` up to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub owner_id: String,
    pub request_params: serde_json::Value,
    pub content_kind: ContentKind,
    pub priority: JobPriority,
    pub status: JobStatus,

    // Resolution
    pub provider_used: Option<String>,
    pub model_used: Option<String>,
    pub result_content: Option<String>,
    pub error_message: Option<String>,
    /// Open structured map for provider-specific diagnostics
    /// (error kind, status code, attempted providers).
    pub error_details: Option<serde_json::Value>,

    // Retry bookkeeping
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,

    // Timing and accounting
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<u64>,
    pub tokens_used: Option<u32>,
    pub generation_cost: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Providers already tried within the current retry cycle, fed into the
    /// selector's excluded set so retries fail over instead of hammering
    /// the same unhealthy upstream.
    pub fn excluded_providers(&self) -> HashSet<String> {
        let mut excluded = HashSet::new();
        if let Some(name) = &self.provider_used {
            excluded.insert(name.clone());
        }
        if let Some(details) = &self.error_details {
            if let Some(attempted) = details.get("attempted_providers").and_then(|v| v.as_array())
            {
                for name in attempted.iter().filter_map(|v| v.as_str()) {
                    excluded.insert(name.to_string());
                }
            }
        }
        excluded
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub owner_id: String,
    pub content_kind: ContentKind,
    pub params: serde_json::Value,
    pub priority: JobPriority,
    pub max_retries: u32,
    pub ttl: Duration,
}

impl EnqueueRequest {
    pub fn new(owner_id: &str, content_kind: ContentKind, params: serde_json::Value) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            content_kind,
            params,
            priority: JobPriority::Standard,
            max_retries: 3,
            ttl: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn job_from(self, now: DateTime<Utc>) -> Job {
        Job {
            job_id: Uuid::new_v4().to_string(),
            owner_id: self.owner_id,
            request_params: self.params,
            content_kind: self.content_kind,
            priority: self.priority,
            status: JobStatus::Queued,
            provider_used: None,
            model_used: None,
            result_content: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_at: None,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            tokens_used: None,
            generation_cost: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Queue-level operational statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub by_status: HashMap<String, u64>,
    pub queued_by_priority: HashMap<String, u64>,
    pub avg_processing_time_ms: f64,
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub capacity_utilization: f64,
}

/// Fire-and-forget notification payloads published on the event bus.
#[derive(Debug, Clone, Serialize)]
pub enum JobEvent {
    StatusUpdate {
        job_id: String,
        status: JobStatus,
        retry_count: u32,
    },
    Completed {
        job_id: String,
        result_content: String,
    },
    Failed {
        job_id: String,
        error: String,
    },
}
