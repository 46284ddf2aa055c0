//! SQLite-backed job store.
//!
//! The claim operation is the correctness-critical piece: each transition
//! to `processing` is a conditional `UPDATE ... WHERE status = 'queued'`,
//! so with multiple dispatchers racing on the same row exactly one sees
//! `rows_affected == 1` and wins the job.

use crate::retry::RetryPolicy;
use crate::types::{EnqueueRequest, Job, JobPriority, JobStatus, QueueStatistics};
use chrono::{DateTime, SecondsFormat, Utc};
use common::errors::{PipelineError, ProviderError, StorageError, ValidationError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                request_params TEXT NOT NULL,
                content_kind TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                provider_used TEXT,
                model_used TEXT,
                result_content TEXT,
                error_message TEXT,
                error_details TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_retry_at TEXT,
                expires_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                processing_time_ms INTEGER,
                tokens_used INTEGER,
                generation_cost REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_expires ON jobs(expires_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id);
            "#,
        )
        .map_err(sql_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a queued job. The only synchronous failure a caller sees is
    /// validation; everything after enqueue is reported through job state.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, PipelineError> {
        if params_is_empty(&request.params) {
            return Err(ValidationError::InvalidInput {
                field: "request_params".to_string(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }

        let job = request.job_from(Utc::now());
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO jobs (
                job_id, owner_id, request_params, content_kind, priority, status,
                retry_count, max_retries, expires_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.job_id,
                job.owner_id,
                job.request_params.to_string(),
                job.content_kind.to_string(),
                job.priority as i64,
                job.status.to_string(),
                job.retry_count,
                job.max_retries,
                fmt_ts(job.expires_at),
                fmt_ts(job.created_at),
                fmt_ts(job.updated_at),
            ],
        )
        .map_err(sql_err)?;

        debug!(job_id = %job.job_id, kind = %job.content_kind, priority = %job.priority, "job enqueued");
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        let conn = self.conn.lock().await;
        Self::get_locked(&conn, job_id)
    }

    /// Claim up to `limit` eligible jobs, transitioning each to processing.
    ///
    /// Eligible means queued, inside its expiry window, and past any retry
    /// backoff stamp. Premium tiers drain first; FIFO within a tier.
    pub async fn claim_next_batch(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().await;

        let candidate_ids: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT job_id FROM jobs
                     WHERE status = 'queued'
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                       AND expires_at > ?1
                     ORDER BY priority ASC, created_at ASC
                     LIMIT ?2",
                )
                .map_err(sql_err)?;

            let ids = stmt
                .query_map(params![now, limit as i64], |row| row.get(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            ids
        };

        let mut claimed = Vec::new();
        for job_id in candidate_ids {
            let changed = conn
                .execute(
                    "UPDATE jobs
                     SET status = 'processing', started_at = ?2, completed_at = NULL, updated_at = ?2
                     WHERE job_id = ?1 AND status = 'queued'",
                    params![job_id, now],
                )
                .map_err(sql_err)?;

            // Another dispatcher instance may have won this row
            if changed == 1 {
                if let Some(job) = Self::get_locked(&conn, &job_id)? {
                    claimed.push(job);
                }
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    /// Resolve a processing job as completed. Returns `false` when the job
    /// left the processing state meanwhile (e.g. an advisory cancel); the
    /// result is then discarded rather than overwriting a terminal state.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        job_id: &str,
        provider: &str,
        model: &str,
        result_content: &str,
        processing_time_ms: u64,
        tokens_used: u32,
        generation_cost: f64,
    ) -> Result<bool, StorageError> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().await;

        let changed = conn
            .execute(
                "UPDATE jobs
                 SET status = 'completed', provider_used = ?2, model_used = ?3,
                     result_content = ?4, processing_time_ms = ?5, tokens_used = ?6,
                     generation_cost = ?7, completed_at = ?8, updated_at = ?8,
                     error_message = NULL, next_retry_at = NULL
                 WHERE job_id = ?1 AND status = 'processing'",
                params![
                    job_id,
                    provider,
                    model,
                    result_content,
                    processing_time_ms,
                    tokens_used,
                    generation_cost,
                    now,
                ],
            )
            .map_err(sql_err)?;

        Ok(changed == 1)
    }

    /// Feed a processing job through retry accounting after a failure.
    ///
    /// While attempts remain the job is requeued with a backoff stamp;
    /// the attempt that exhausts `max_retries` resolves it as failed.
    /// Returns the resulting status, or `None` when the job was no longer
    /// processing (lost a race with cancel or expiry).
    pub async fn record_failure(
        &self,
        job_id: &str,
        provider: Option<&str>,
        error: &ProviderError,
        policy: &RetryPolicy,
    ) -> Result<Option<JobStatus>, StorageError> {
        let now = Utc::now();
        let conn = self.conn.lock().await;

        let row: Option<(u32, u32, JobStatus, Option<String>)> = conn
            .query_row(
                "SELECT retry_count, max_retries, status, error_details FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        parse_status(row.get::<_, String>(2)?),
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        let Some((retry_count, max_retries, status, details_raw)) = row else {
            return Ok(None);
        };
        if status != JobStatus::Processing {
            return Ok(None);
        }

        let details = merge_error_details(details_raw.as_deref(), provider, error);
        let new_retry_count = (retry_count + 1).min(max_retries);

        if retry_count + 1 < max_retries {
            let next_retry = now
                + chrono::Duration::from_std(policy.backoff(new_retry_count)).unwrap_or_default();
            let changed = conn
                .execute(
                    "UPDATE jobs
                     SET status = 'queued', retry_count = ?2, next_retry_at = ?3,
                         error_message = ?4, error_details = ?5, provider_used = ?6,
                         started_at = NULL, updated_at = ?7
                     WHERE job_id = ?1 AND status = 'processing'",
                    params![
                        job_id,
                        new_retry_count,
                        fmt_ts(next_retry),
                        error.to_string(),
                        details,
                        provider,
                        fmt_ts(now),
                    ],
                )
                .map_err(sql_err)?;

            if changed == 1 {
                info!(
                    job_id,
                    retry_count = new_retry_count,
                    next_retry = %fmt_ts(next_retry),
                    "job requeued after failure"
                );
                Ok(Some(JobStatus::Queued))
            } else {
                Ok(None)
            }
        } else {
            let changed = conn
                .execute(
                    "UPDATE jobs
                     SET status = 'failed', retry_count = ?2, error_message = ?3,
                         error_details = ?4, provider_used = ?5, completed_at = ?6,
                         updated_at = ?6, next_retry_at = NULL
                     WHERE job_id = ?1 AND status = 'processing'",
                    params![
                        job_id,
                        new_retry_count,
                        error.to_string(),
                        details,
                        provider,
                        fmt_ts(now),
                    ],
                )
                .map_err(sql_err)?;

            if changed == 1 {
                warn!(job_id, retry_count = new_retry_count, "job failed, retries exhausted");
                Ok(Some(JobStatus::Failed))
            } else {
                Ok(None)
            }
        }
    }

    /// Resolve a processing job straight to failed, skipping retry
    /// accounting. Used when no provider is available - waiting would add
    /// no retry value.
    pub async fn mark_failed(
        &self,
        job_id: &str,
        error_message: &str,
    ) -> Result<bool, StorageError> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().await;

        let changed = conn
            .execute(
                "UPDATE jobs
                 SET status = 'failed', error_message = ?2, completed_at = ?3,
                     updated_at = ?3, next_retry_at = NULL
                 WHERE job_id = ?1 AND status = 'processing'",
                params![job_id, error_message, now],
            )
            .map_err(sql_err)?;

        Ok(changed == 1)
    }

    /// Cancel a queued or processing job. Idempotent: cancelling a job that
    /// already reached a terminal state returns that state unchanged.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, PipelineError> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().await;

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;

        let Some(status) = status else {
            return Err(PipelineError::NotFound(format!("job {job_id}")));
        };
        let status = parse_status(status);
        if status.is_terminal() {
            return Ok(status);
        }

        conn.execute(
            "UPDATE jobs
             SET status = 'cancelled', completed_at = ?2, updated_at = ?2, next_retry_at = NULL
             WHERE job_id = ?1 AND status IN ('queued', 'processing')",
            params![job_id, now],
        )
        .map_err(sql_err)?;

        // Re-read: a worker may have resolved the job between the check and
        // the conditional update
        let final_status: String = conn
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        let final_status = parse_status(final_status);

        if final_status == JobStatus::Cancelled {
            info!(job_id, "job cancelled");
        }
        Ok(final_status)
    }

    /// Jobs stuck in processing past the wall-clock timeout are treated as
    /// provider timeouts and fed through the same retry accounting. Covers
    /// workers that died mid-call; at-least-once execution follows.
    pub async fn reap_timed_out(
        &self,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Vec<(String, JobStatus)>, StorageError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let stuck_ids: Vec<String> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn
                .prepare(
                    "SELECT job_id FROM jobs
                     WHERE status = 'processing' AND started_at <= ?1",
                )
                .map_err(sql_err)?;
            let ids = stmt
                .query_map(params![fmt_ts(cutoff)], |row| row.get(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            ids
        };

        let mut reaped = Vec::new();
        for job_id in stuck_ids {
            let stale = ProviderError::timeout(format!(
                "processing exceeded {}s and was reaped",
                timeout.as_secs()
            ));
            if let Some(status) = self.record_failure(&job_id, None, &stale, policy).await? {
                warn!(job_id = %job_id, status = %status, "reaped stuck job");
                reaped.push((job_id, status));
            }
        }
        Ok(reaped)
    }

    /// Expire every non-terminal job past its deadline. Terminal, no
    /// retries, no error attached - an expected outcome.
    pub async fn reap_expired(&self) -> Result<Vec<String>, StorageError> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().await;

        let expired_ids: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT job_id FROM jobs
                     WHERE expires_at <= ?1 AND status IN ('queued', 'processing')",
                )
                .map_err(sql_err)?;
            let ids = stmt
                .query_map(params![now], |row| row.get(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            ids
        };

        let mut reaped = Vec::new();
        for job_id in expired_ids {
            let changed = conn
                .execute(
                    "UPDATE jobs
                     SET status = 'expired', completed_at = ?2, updated_at = ?2, next_retry_at = NULL
                     WHERE job_id = ?1 AND status IN ('queued', 'processing')",
                    params![job_id, now],
                )
                .map_err(sql_err)?;
            if changed == 1 {
                debug!(job_id = %job_id, "job expired");
                reaped.push(job_id);
            }
        }
        Ok(reaped)
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn purge_terminal(&self, retention: Duration) -> Result<usize, StorageError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let conn = self.conn.lock().await;

        let deleted = conn
            .execute(
                "DELETE FROM jobs
                 WHERE status IN ('completed', 'failed', 'cancelled', 'expired')
                   AND updated_at <= ?1",
                params![fmt_ts(cutoff)],
            )
            .map_err(sql_err)?;

        if deleted > 0 {
            info!(deleted, "purged terminal jobs past retention");
        }
        Ok(deleted)
    }

    pub async fn queue_statistics(
        &self,
        active_jobs: usize,
        max_concurrent_jobs: usize,
    ) -> Result<QueueStatistics, StorageError> {
        let conn = self.conn.lock().await;

        let mut by_status = HashMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sql_err)?;
            for row in rows {
                let (status, count) = row.map_err(sql_err)?;
                by_status.insert(status, count as u64);
            }
        }

        let mut queued_by_priority = HashMap::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT priority, COUNT(*) FROM jobs WHERE status = 'queued' GROUP BY priority",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sql_err)?;
            for row in rows {
                let (priority, count) = row.map_err(sql_err)?;
                queued_by_priority.insert(JobPriority::from_i64(priority).to_string(), count as u64);
            }
        }

        let avg_processing_time_ms: f64 = conn
            .query_row(
                "SELECT COALESCE(AVG(processing_time_ms), 0.0) FROM jobs
                 WHERE status = 'completed' AND processing_time_ms IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        Ok(QueueStatistics {
            by_status,
            queued_by_priority,
            avg_processing_time_ms,
            active_jobs,
            max_concurrent_jobs,
            capacity_utilization: if max_concurrent_jobs > 0 {
                active_jobs as f64 / max_concurrent_jobs as f64
            } else {
                0.0
            },
        })
    }

    fn get_locked(conn: &Connection, job_id: &str) -> Result<Option<Job>, StorageError> {
        conn.query_row(
            "SELECT job_id, owner_id, request_params, content_kind, priority, status,
                    provider_used, model_used, result_content, error_message, error_details,
                    retry_count, max_retries, next_retry_at, expires_at, started_at,
                    completed_at, processing_time_ms, tokens_used, generation_cost,
                    created_at, updated_at
             FROM jobs WHERE job_id = ?1",
            params![job_id],
            row_to_job,
        )
        .optional()
        .map_err(sql_err)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        job_id: row.get(0)?,
        owner_id: row.get(1)?,
        request_params: serde_json::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(serde_json::Value::Null),
        content_kind: row
            .get::<_, String>(3)?
            .parse()
            .unwrap_or(providers::ContentKind::Article),
        priority: JobPriority::from_i64(row.get(4)?),
        status: parse_status(row.get::<_, String>(5)?),
        provider_used: row.get(6)?,
        model_used: row.get(7)?,
        result_content: row.get(8)?,
        error_message: row.get(9)?,
        error_details: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        retry_count: row.get(11)?,
        max_retries: row.get(12)?,
        next_retry_at: row.get::<_, Option<String>>(13)?.and_then(parse_ts),
        expires_at: row
            .get::<_, String>(14)
            .map(|s| parse_ts(s).unwrap_or_else(Utc::now))?,
        started_at: row.get::<_, Option<String>>(15)?.and_then(parse_ts),
        completed_at: row.get::<_, Option<String>>(16)?.and_then(parse_ts),
        processing_time_ms: row.get(17)?,
        tokens_used: row.get(18)?,
        generation_cost: row.get(19)?,
        created_at: row
            .get::<_, String>(20)
            .map(|s| parse_ts(s).unwrap_or_else(Utc::now))?,
        updated_at: row
            .get::<_, String>(21)
            .map(|s| parse_ts(s).unwrap_or_else(Utc::now))?,
    })
}

/// Fixed-width UTC stamps so lexicographic comparison in SQL matches
/// chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_status(s: String) -> JobStatus {
    s.parse().unwrap_or(JobStatus::Failed)
}

fn params_is_empty(params: &serde_json::Value) -> bool {
    match params {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn merge_error_details(
    existing: Option<&str>,
    provider: Option<&str>,
    error: &ProviderError,
) -> String {
    let mut details = existing
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    let mut attempted: Vec<serde_json::Value> = details
        .get("attempted_providers")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if let Some(name) = provider {
        if !attempted.iter().any(|v| v.as_str() == Some(name)) {
            attempted.push(serde_json::Value::String(name.to_string()));
        }
    }

    details.insert(
        "attempted_providers".to_string(),
        serde_json::Value::Array(attempted),
    );
    details.insert(
        "kind".to_string(),
        serde_json::Value::String(error.kind.to_string()),
    );
    if let Some(code) = error.status_code {
        details.insert("status_code".to_string(), serde_json::json!(code));
    }
    details.insert(
        "last_error".to_string(),
        serde_json::Value::String(error.message.clone()),
    );

    serde_json::Value::Object(details).to_string()
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}
