//! Cumulative per-provider metrics.
//!
//! Counters are plain atomic increments against shared records - multiple
//! dispatcher workers update the same provider concurrently and a
//! read-modify-write cycle would lose updates. Derived rates are computed
//! only on snapshot reads.
//!
//! The live window is periodically expired by the retention task; all
//! counters then restart from zero, and readers must tolerate that.

use chrono::{DateTime, TimeZone, Utc};
use common::errors::ProviderErrorKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Quality scores are accumulated in thousandths to stay on integer atomics.
const QUALITY_SCALE: f64 = 1000.0;

const HOURLY_POINTS_KEPT: usize = 48;
const DAILY_POINTS_KEPT: usize = 30;

struct ProviderCounters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    response_time_min_ms: AtomicU64,
    response_time_max_ms: AtomicU64,
    response_time_sum_ms: AtomicU64,
    quality_score_sum_milli: AtomicU64,
    quality_score_count: AtomicU64,
    fallback_requests: AtomicU64,
    rate_limited_errors: AtomicU64,
    invalid_request_errors: AtomicU64,
    server_errors: AtomicU64,
    timeout_errors: AtomicU64,
    window_started_ms: AtomicU64,
}

impl ProviderCounters {
    fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            response_time_min_ms: AtomicU64::new(u64::MAX),
            response_time_max_ms: AtomicU64::new(0),
            response_time_sum_ms: AtomicU64::new(0),
            quality_score_sum_milli: AtomicU64::new(0),
            quality_score_count: AtomicU64::new(0),
            fallback_requests: AtomicU64::new(0),
            rate_limited_errors: AtomicU64::new(0),
            invalid_request_errors: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            window_started_ms: AtomicU64::new(now_ms()),
        }
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.response_time_min_ms.store(u64::MAX, Ordering::Relaxed);
        self.response_time_max_ms.store(0, Ordering::Relaxed);
        self.response_time_sum_ms.store(0, Ordering::Relaxed);
        self.quality_score_sum_milli.store(0, Ordering::Relaxed);
        self.quality_score_count.store(0, Ordering::Relaxed);
        self.fallback_requests.store(0, Ordering::Relaxed);
        self.rate_limited_errors.store(0, Ordering::Relaxed);
        self.invalid_request_errors.store(0, Ordering::Relaxed);
        self.server_errors.store(0, Ordering::Relaxed);
        self.timeout_errors.store(0, Ordering::Relaxed);
        self.window_started_ms.store(now_ms(), Ordering::Relaxed);
    }
}

/// Read-side snapshot of one provider's window, with derived rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetricsAggregate {
    pub provider_name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    pub total_response_time_ms: u64,
    pub quality_score_sum: f64,
    pub quality_score_count: u64,
    pub fallback_requests: u64,
    pub error_kinds: HashMap<String, u64>,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub avg_quality_score: f64,
    pub window_started_at: DateTime<Utc>,
}

/// One rollup point for trend reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupPoint {
    pub bucket_start: DateTime<Utc>,
    pub aggregates: Vec<ProviderMetricsAggregate>,
}

pub struct MetricsStore {
    counters: DashMap<String, ProviderCounters>,
    hourly: RwLock<VecDeque<RollupPoint>>,
    daily: RwLock<VecDeque<RollupPoint>>,
    last_hourly_bucket: AtomicU64,
    last_daily_bucket: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            hourly: RwLock::new(VecDeque::new()),
            daily: RwLock::new(VecDeque::new()),
            last_hourly_bucket: AtomicU64::new(0),
            last_daily_bucket: AtomicU64::new(0),
        }
    }

    pub fn initialize_provider(&self, name: &str) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(ProviderCounters::new);
    }

    pub fn record_success(&self, name: &str, response_time_ms: u64, quality_score: Option<f64>) {
        let entry = self
            .counters
            .entry(name.to_string())
            .or_insert_with(ProviderCounters::new);

        entry.total_requests.fetch_add(1, Ordering::Relaxed);
        entry.successful_requests.fetch_add(1, Ordering::Relaxed);
        entry
            .response_time_min_ms
            .fetch_min(response_time_ms, Ordering::Relaxed);
        entry
            .response_time_max_ms
            .fetch_max(response_time_ms, Ordering::Relaxed);
        entry
            .response_time_sum_ms
            .fetch_add(response_time_ms, Ordering::Relaxed);

        if let Some(score) = quality_score {
            let scaled = (score.clamp(0.0, 10.0) * QUALITY_SCALE) as u64;
            entry
                .quality_score_sum_milli
                .fetch_add(scaled, Ordering::Relaxed);
            entry.quality_score_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, name: &str, kind: ProviderErrorKind) {
        let entry = self
            .counters
            .entry(name.to_string())
            .or_insert_with(ProviderCounters::new);

        entry.total_requests.fetch_add(1, Ordering::Relaxed);
        entry.failed_requests.fetch_add(1, Ordering::Relaxed);

        let tally = match kind {
            ProviderErrorKind::RateLimited => &entry.rate_limited_errors,
            ProviderErrorKind::InvalidRequest => &entry.invalid_request_errors,
            ProviderErrorKind::ServerError => &entry.server_errors,
            ProviderErrorKind::Timeout => &entry.timeout_errors,
        };
        tally.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that was served by a non-primary provider after the
    /// previously used one was excluded.
    pub fn record_fallback(&self, name: &str) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(ProviderCounters::new)
            .fallback_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &str) -> Option<ProviderMetricsAggregate> {
        let entry = self.counters.get(name)?;
        Some(Self::aggregate_of(name, entry.value()))
    }

    pub fn snapshot_all(&self) -> Vec<ProviderMetricsAggregate> {
        self.counters
            .iter()
            .map(|e| Self::aggregate_of(e.key(), e.value()))
            .collect()
    }

    fn aggregate_of(name: &str, c: &ProviderCounters) -> ProviderMetricsAggregate {
        let total = c.total_requests.load(Ordering::Relaxed);
        let successful = c.successful_requests.load(Ordering::Relaxed);
        let failed = c.failed_requests.load(Ordering::Relaxed);
        let min = c.response_time_min_ms.load(Ordering::Relaxed);
        let sum = c.response_time_sum_ms.load(Ordering::Relaxed);
        let quality_sum = c.quality_score_sum_milli.load(Ordering::Relaxed) as f64 / QUALITY_SCALE;
        let quality_count = c.quality_score_count.load(Ordering::Relaxed);

        let mut error_kinds = HashMap::new();
        for (kind, tally) in [
            (ProviderErrorKind::RateLimited, &c.rate_limited_errors),
            (ProviderErrorKind::InvalidRequest, &c.invalid_request_errors),
            (ProviderErrorKind::ServerError, &c.server_errors),
            (ProviderErrorKind::Timeout, &c.timeout_errors),
        ] {
            let count = tally.load(Ordering::Relaxed);
            if count > 0 {
                error_kinds.insert(kind.to_string(), count);
            }
        }

        ProviderMetricsAggregate {
            provider_name: name.to_string(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            min_response_time_ms: if min == u64::MAX { 0 } else { min },
            max_response_time_ms: c.response_time_max_ms.load(Ordering::Relaxed),
            total_response_time_ms: sum,
            quality_score_sum: quality_sum,
            quality_score_count: quality_count,
            fallback_requests: c.fallback_requests.load(Ordering::Relaxed),
            error_kinds,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                1.0
            },
            avg_response_time_ms: if successful > 0 {
                sum as f64 / successful as f64
            } else {
                0.0
            },
            avg_quality_score: if quality_count > 0 {
                quality_sum / quality_count as f64
            } else {
                0.0
            },
            window_started_at: ms_to_datetime(c.window_started_ms.load(Ordering::Relaxed)),
        }
    }

    /// Fold the live window into hourly/daily trend points when the
    /// corresponding bucket has advanced since the last call.
    pub async fn rollup(&self, now: DateTime<Utc>) {
        let hour_bucket = (now.timestamp() / 3600) as u64;
        let day_bucket = (now.timestamp() / 86_400) as u64;

        let prev_hour = self.last_hourly_bucket.swap(hour_bucket, Ordering::Relaxed);
        if prev_hour != 0 && prev_hour != hour_bucket {
            let point = RollupPoint {
                bucket_start: ms_to_datetime(prev_hour * 3_600_000),
                aggregates: self.snapshot_all(),
            };
            let mut hourly = self.hourly.write().await;
            hourly.push_back(point);
            while hourly.len() > HOURLY_POINTS_KEPT {
                hourly.pop_front();
            }
            debug!(points = hourly.len(), "rolled hourly metrics");
        }

        let prev_day = self.last_daily_bucket.swap(day_bucket, Ordering::Relaxed);
        if prev_day != 0 && prev_day != day_bucket {
            let point = RollupPoint {
                bucket_start: ms_to_datetime(prev_day * 86_400_000),
                aggregates: self.snapshot_all(),
            };
            let mut daily = self.daily.write().await;
            daily.push_back(point);
            while daily.len() > DAILY_POINTS_KEPT {
                daily.pop_front();
            }
            debug!(points = daily.len(), "rolled daily metrics");
        }
    }

    pub async fn hourly_points(&self) -> Vec<RollupPoint> {
        self.hourly.read().await.iter().cloned().collect()
    }

    pub async fn daily_points(&self) -> Vec<RollupPoint> {
        self.daily.read().await.iter().cloned().collect()
    }

    /// Reset windows older than `ttl`. Returns the providers whose counters
    /// were cleared.
    pub fn reset_expired_windows(&self, ttl: Duration) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
        let mut reset = Vec::new();
        for entry in self.counters.iter() {
            if entry.value().window_started_ms.load(Ordering::Relaxed) <= cutoff {
                entry.value().reset();
                reset.push(entry.key().clone());
            }
        }
        if !reset.is_empty() {
            info!(providers = ?reset, "expired metrics windows reset");
        }
        reset
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
