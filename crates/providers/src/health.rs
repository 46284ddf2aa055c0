//! Provider health tracking and circuit breaking.
//!
//! One record per provider, shared by every dispatcher worker. All counter
//! mutations are atomic increments/stores; derived state (health level,
//! availability) is computed from the metrics window and cached for cheap
//! reads by the selector.
//!
//! The circuit breaker opens when the consecutive-failure streak reaches
//! the configured threshold and closes on any recorded success - including
//! a scheduled or forced health probe, which is how an excluded provider
//! gets the success that lets it back in.

use crate::metrics::{MetricsStore, ProviderMetricsAggregate};
use chrono::{DateTime, TimeZone, Utc};
use common::errors::ProviderErrorKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use tracing::{debug, info, warn};

/// Coarse classification of a provider's recent reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    Down,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthLevel::Healthy => write!(f, "healthy"),
            HealthLevel::Degraded => write!(f, "degraded"),
            HealthLevel::Unhealthy => write!(f, "unhealthy"),
            HealthLevel::Down => write!(f, "down"),
        }
    }
}

impl HealthLevel {
    fn encode(self) -> u8 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::Degraded => 1,
            HealthLevel::Unhealthy => 2,
            HealthLevel::Down => 3,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            0 => HealthLevel::Healthy,
            1 => HealthLevel::Degraded,
            2 => HealthLevel::Unhealthy,
            _ => HealthLevel::Down,
        }
    }
}

/// Tunable thresholds. The error-rate boundaries and breaker threshold are
/// configuration, not a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures that open the circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// Error rate at or above which a provider is Degraded.
    pub degraded_error_rate: f64,
    /// Error rate at or above which a provider is Unhealthy.
    pub unhealthy_error_rate: f64,
    /// Error rate at or above which a provider is Down.
    pub down_error_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 5,
            degraded_error_rate: 0.10,
            unhealthy_error_rate: 0.30,
            down_error_rate: 0.60,
        }
    }
}

struct HealthRecord {
    consecutive_failures: AtomicU32,
    current_response_time_ms: AtomicU64,
    // Epoch millis; 0 means "never"
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    last_checked_ms: AtomicU64,
    cached_level: AtomicU8,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            current_response_time_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_checked_ms: AtomicU64::new(0),
            cached_level: AtomicU8::new(HealthLevel::Healthy.encode()),
        }
    }
}

/// Read-side view of one provider's health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthSnapshot {
    pub provider_name: String,
    pub health_level: HealthLevel,
    pub is_available: bool,
    pub consecutive_failures: u32,
    pub current_response_time_ms: u64,
    pub error_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

pub struct HealthStore {
    records: DashMap<String, HealthRecord>,
    metrics: MetricsStore,
    config: HealthConfig,
}

impl HealthStore {
    pub fn new() -> Self {
        Self::new_with_config(HealthConfig::default())
    }

    pub fn new_with_config(config: HealthConfig) -> Self {
        Self {
            records: DashMap::new(),
            metrics: MetricsStore::new(),
            config,
        }
    }

    /// Create the health record and metrics window for a provider.
    pub fn register(&self, name: &str) {
        self.records
            .entry(name.to_string())
            .or_insert_with(HealthRecord::new);
        self.metrics.initialize_provider(name);
        debug!(provider = name, "health tracking started");
    }

    /// Record a successful call. Resets the consecutive-failure streak,
    /// which also closes an open circuit breaker.
    pub fn record_success(&self, name: &str, response_time_ms: u64, quality_score: Option<f64>) {
        self.touch_success(name, response_time_ms);
        self.metrics.record_success(name, response_time_ms, quality_score);
    }

    /// Record a failed call, tallying the error kind for diagnostics.
    pub fn record_failure(&self, name: &str, kind: ProviderErrorKind) {
        self.touch_failure(name);
        self.metrics.record_failure(name, kind);
    }

    /// Record the outcome of a health-check probe. Probes move the breaker
    /// streak and timestamps but stay out of the request metrics window, so
    /// synthetic traffic never skews success rates.
    pub fn record_probe_success(&self, name: &str, response_time_ms: u64) {
        self.touch_success(name, response_time_ms);
    }

    pub fn record_probe_failure(&self, name: &str) {
        self.touch_failure(name);
    }

    fn touch_success(&self, name: &str, response_time_ms: u64) {
        let record = self
            .records
            .entry(name.to_string())
            .or_insert_with(HealthRecord::new);

        let was_open = record.consecutive_failures.load(Ordering::Relaxed)
            >= self.config.circuit_breaker_threshold;
        record.consecutive_failures.store(0, Ordering::Relaxed);
        record
            .current_response_time_ms
            .store(response_time_ms, Ordering::Relaxed);
        let now = now_ms();
        record.last_success_ms.store(now, Ordering::Relaxed);
        record.last_checked_ms.store(now, Ordering::Relaxed);
        drop(record);

        if was_open {
            info!(provider = name, "circuit breaker closed after success");
        }
    }

    fn touch_failure(&self, name: &str) {
        let record = self
            .records
            .entry(name.to_string())
            .or_insert_with(HealthRecord::new);

        let streak = record.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_ms();
        record.last_failure_ms.store(now, Ordering::Relaxed);
        record.last_checked_ms.store(now, Ordering::Relaxed);
        drop(record);

        if streak == self.config.circuit_breaker_threshold {
            warn!(
                provider = name,
                consecutive_failures = streak,
                "circuit breaker opened"
            );
        }
    }

    /// True iff the consecutive-failure streak has reached the breaker
    /// threshold. Independent of the health level.
    pub fn circuit_open(&self, name: &str) -> bool {
        self.records
            .get(name)
            .map(|r| {
                r.consecutive_failures.load(Ordering::Relaxed)
                    >= self.config.circuit_breaker_threshold
            })
            .unwrap_or(false)
    }

    /// Cached health level, recomputed by the scheduled rollup.
    pub fn health_level(&self, name: &str) -> HealthLevel {
        self.records
            .get(name)
            .map(|r| HealthLevel::decode(r.cached_level.load(Ordering::Relaxed)))
            .unwrap_or(HealthLevel::Healthy)
    }

    /// A provider is selectable only when its breaker is closed and it is
    /// not classified Down.
    pub fn is_available(&self, name: &str) -> bool {
        !self.circuit_open(name) && self.health_level(name) != HealthLevel::Down
    }

    /// Recompute and cache the health level for one provider from its
    /// current error rate.
    pub fn recompute_level(&self, name: &str) -> HealthLevel {
        let error_rate = self
            .metrics
            .snapshot(name)
            .map(|m| 1.0 - m.success_rate)
            .unwrap_or(0.0);
        let level = self.level_for_error_rate(error_rate);

        if let Some(record) = self.records.get(name) {
            let previous = HealthLevel::decode(record.cached_level.load(Ordering::Relaxed));
            record.cached_level.store(level.encode(), Ordering::Relaxed);
            if previous != level {
                info!(provider = name, from = %previous, to = %level, "health level changed");
            }
        }
        level
    }

    /// Recompute cached levels for every tracked provider.
    pub fn recompute_all_levels(&self) {
        let names: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.recompute_level(&name);
        }
    }

    fn level_for_error_rate(&self, error_rate: f64) -> HealthLevel {
        if error_rate < self.config.degraded_error_rate {
            HealthLevel::Healthy
        } else if error_rate < self.config.unhealthy_error_rate {
            HealthLevel::Degraded
        } else if error_rate < self.config.down_error_rate {
            HealthLevel::Unhealthy
        } else {
            HealthLevel::Down
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<ProviderHealthSnapshot> {
        let record = self.records.get(name)?;
        let error_rate = self
            .metrics
            .snapshot(name)
            .map(|m| 1.0 - m.success_rate)
            .unwrap_or(0.0);

        Some(ProviderHealthSnapshot {
            provider_name: name.to_string(),
            health_level: HealthLevel::decode(record.cached_level.load(Ordering::Relaxed)),
            is_available: record.consecutive_failures.load(Ordering::Relaxed)
                < self.config.circuit_breaker_threshold
                && HealthLevel::decode(record.cached_level.load(Ordering::Relaxed))
                    != HealthLevel::Down,
            consecutive_failures: record.consecutive_failures.load(Ordering::Relaxed),
            current_response_time_ms: record.current_response_time_ms.load(Ordering::Relaxed),
            error_rate,
            last_success_at: ms_to_optional(record.last_success_ms.load(Ordering::Relaxed)),
            last_failure_at: ms_to_optional(record.last_failure_ms.load(Ordering::Relaxed)),
            last_checked_at: ms_to_optional(record.last_checked_ms.load(Ordering::Relaxed)),
        })
    }

    /// Metrics window for the selector and external monitoring.
    pub fn aggregate(&self, name: &str) -> Option<ProviderMetricsAggregate> {
        self.metrics.snapshot(name)
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }
}

impl Default for HealthStore {
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

fn ms_to_optional(ms: u64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}
