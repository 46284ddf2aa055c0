//! Weighted provider selection.
//!
//! Scores every candidate from the health store's metrics window and picks
//! the best. Providers with an open circuit breaker or a Down health level
//! never enter the candidate set.

use crate::adapters::{ContentKind, ContentProvider};
use crate::health::HealthStore;
use crate::registry::ProviderRegistry;
use common::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const SCORE_EPSILON: f64 = 1e-9;

/// Scoring weights. Defaults follow the cost/availability/quality/speed
/// 40/30/20/10 split; tune per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub cost_weight: f64,
    pub availability_weight: f64,
    pub quality_weight: f64,
    pub speed_weight: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cost_weight: 0.4,
            availability_weight: 0.3,
            quality_weight: 0.2,
            speed_weight: 0.1,
        }
    }
}

pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthStore>,
    config: SelectorConfig,
}

struct Candidate {
    provider: Arc<dyn ContentProvider>,
    cost_per_1k: f64,
    success_rate: f64,
    avg_response_time_ms: f64,
    avg_quality: f64,
}

impl ProviderSelector {
    pub fn new(registry: Arc<ProviderRegistry>, health: Arc<HealthStore>) -> Self {
        Self::new_with_config(registry, health, SelectorConfig::default())
    }

    pub fn new_with_config(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthStore>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            health,
            config,
        }
    }

    /// Pick the best available provider for `kind`, skipping `excluded`.
    ///
    /// Fails with `NoProviderAvailable` when the candidate set is empty;
    /// the caller surfaces that as a job failure rather than retrying.
    pub async fn select(
        &self,
        kind: ContentKind,
        excluded: &HashSet<String>,
    ) -> Result<Arc<dyn ContentProvider>, PipelineError> {
        let candidates = self.eligible_candidates(kind, excluded).await;

        if candidates.is_empty() {
            warn!(kind = %kind, excluded = excluded.len(), "no provider available");
            return Err(PipelineError::NoProviderAvailable {
                content_kind: kind.to_string(),
            });
        }

        // Normalize cost and speed across the candidate set; success rate
        // and quality already land in [0,1].
        let (cost_min, cost_max) = min_max(candidates.iter().map(|c| c.cost_per_1k));
        let (rt_min, rt_max) = min_max(candidates.iter().map(|c| c.avg_response_time_ms));

        let mut best: Option<(usize, f64, f64)> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let cost_score = 1.0 - normalize(candidate.cost_per_1k, cost_min, cost_max);
            let availability_score = candidate.success_rate;
            let quality_score = (candidate.avg_quality / 10.0).clamp(0.0, 1.0);
            let speed_score = 1.0 - normalize(candidate.avg_response_time_ms, rt_min, rt_max);

            let score = self.config.cost_weight * cost_score
                + self.config.availability_weight * availability_score
                + self.config.quality_weight * quality_score
                + self.config.speed_weight * speed_score;

            debug!(
                provider = candidate.provider.name(),
                score,
                cost_score,
                availability_score,
                quality_score,
                speed_score,
                "scored candidate"
            );

            // Tie-break on availability, then registration order (earlier
            // index wins because only strictly better replaces).
            let better = match best {
                None => true,
                Some((_, best_score, best_avail)) => {
                    score > best_score + SCORE_EPSILON
                        || ((score - best_score).abs() <= SCORE_EPSILON
                            && availability_score > best_avail + SCORE_EPSILON)
                }
            };
            if better {
                best = Some((idx, score, availability_score));
            }
        }

        let (idx, score, _) = best.expect("candidate set is non-empty");
        let selected = Arc::clone(&candidates[idx].provider);
        debug!(provider = selected.name(), score, kind = %kind, "selected provider");
        Ok(selected)
    }

    async fn eligible_candidates(
        &self,
        kind: ContentKind,
        excluded: &HashSet<String>,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for provider in self.registry.candidates_for(kind).await {
            let name = provider.name();
            if excluded.contains(name) {
                continue;
            }
            if !self.health.is_available(name) {
                debug!(provider = name, "skipping unavailable provider");
                continue;
            }

            let caps = provider.capabilities();
            // A provider with no recorded traffic scores as reliable but
            // quality-neutral, so new providers get traffic without
            // dominating proven ones.
            let (success_rate, avg_rt, avg_quality) = match self.health.aggregate(name) {
                Some(m) if m.total_requests > 0 => (
                    m.success_rate,
                    m.avg_response_time_ms,
                    if m.quality_score_count > 0 {
                        m.avg_quality_score
                    } else {
                        5.0
                    },
                ),
                _ => (1.0, 0.0, 5.0),
            };

            out.push(Candidate {
                provider,
                cost_per_1k: caps.cost_per_1k_tokens,
                success_rate,
                avg_response_time_ms: avg_rt,
                avg_quality,
            });
        }
        out
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    (min, max)
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max - min <= f64::EPSILON {
        0.0
    } else {
        (value - min) / (max - min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        GenerationOutcome, GenerationRequest, ProbeStatus, ProviderCapabilities,
    };
    use async_trait::async_trait;
    use common::errors::{ProviderError, ProviderErrorKind};

    struct FixedProvider {
        name: &'static str,
        cost_per_1k: f64,
    }

    #[async_trait]
    impl ContentProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                supported_kinds: vec![ContentKind::Summary],
                max_tokens: 1024,
                cost_per_1k_tokens: self.cost_per_1k,
            }
        }

        async fn health_check(&self) -> Result<ProbeStatus, ProviderError> {
            Ok(ProbeStatus::Ok)
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationOutcome, ProviderError> {
            unreachable!("fixed provider never generates")
        }
    }

    async fn setup(
        providers: Vec<(&'static str, f64)>,
    ) -> (Arc<ProviderRegistry>, Arc<HealthStore>, ProviderSelector) {
        let registry = Arc::new(ProviderRegistry::new());
        let health = Arc::new(HealthStore::new());
        for (name, cost) in providers {
            registry
                .register(Arc::new(FixedProvider {
                    name,
                    cost_per_1k: cost,
                }))
                .await
                .expect("register provider");
            health.register(name);
        }
        let selector = ProviderSelector::new(Arc::clone(&registry), Arc::clone(&health));
        (registry, health, selector)
    }

    fn seed_success_rate(health: &HealthStore, name: &str, successes: u64, failures: u64) {
        for _ in 0..successes {
            health.record_success(name, 100, Some(7.0));
        }
        for _ in 0..failures {
            // Interleave a success to keep the breaker closed
            health.record_failure(name, ProviderErrorKind::ServerError);
            health.record_success(name, 100, Some(7.0));
        }
    }

    #[tokio::test]
    async fn prefers_higher_success_rate_when_otherwise_equal() {
        let (_registry, health, selector) = setup(vec![("a", 0.01), ("b", 0.01)]).await;

        // Equal cost, quality and speed; "a" fails far more often than "b"
        seed_success_rate(&health, "a", 5, 5);
        seed_success_rate(&health, "b", 19, 1);

        let selected = selector
            .select(ContentKind::Summary, &HashSet::new())
            .await
            .expect("selection");
        assert_eq!(selected.name(), "b");
    }

    #[tokio::test]
    async fn skips_circuit_open_providers() {
        let (_registry, health, selector) = setup(vec![("a", 0.01), ("b", 0.02)]).await;

        // Cheaper provider "a" would win, but its breaker is open
        for _ in 0..5 {
            health.record_failure("a", ProviderErrorKind::Timeout);
        }

        let selected = selector
            .select(ContentKind::Summary, &HashSet::new())
            .await
            .expect("selection");
        assert_eq!(selected.name(), "b");
    }

    #[tokio::test]
    async fn excluded_set_is_honored() {
        let (_registry, _health, selector) = setup(vec![("a", 0.01), ("b", 0.02)]).await;

        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());

        let selected = selector
            .select(ContentKind::Summary, &excluded)
            .await
            .expect("selection");
        assert_eq!(selected.name(), "b");
    }

    #[tokio::test]
    async fn empty_candidate_set_is_an_error() {
        let (_registry, _health, selector) = setup(vec![("a", 0.01)]).await;

        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());

        let err = selector
            .select(ContentKind::Summary, &excluded)
            .await
            .err()
            .expect("no candidates");
        assert!(matches!(err, PipelineError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn cheaper_provider_wins_when_equally_reliable() {
        let (_registry, health, selector) = setup(vec![("expensive", 0.05), ("cheap", 0.001)]).await;
        seed_success_rate(&health, "expensive", 10, 0);
        seed_success_rate(&health, "cheap", 10, 0);

        let selected = selector
            .select(ContentKind::Summary, &HashSet::new())
            .await
            .expect("selection");
        assert_eq!(selected.name(), "cheap");
    }

    #[tokio::test]
    async fn registration_order_breaks_exact_ties() {
        let (_registry, _health, selector) = setup(vec![("first", 0.01), ("second", 0.01)]).await;

        // No traffic on either: identical scores, first registration wins
        let selected = selector
            .select(ContentKind::Summary, &HashSet::new())
            .await
            .expect("selection");
        assert_eq!(selected.name(), "first");
    }
}
