//! Multi-provider orchestration: adapter contract, registry, health
//! tracking with circuit breaking, metrics aggregation, and weighted
//! provider selection.

pub mod adapters;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod selector;

pub use adapters::{
    ContentKind, ContentProvider, GenerationOutcome, GenerationRequest, ProbeStatus,
    ProviderCapabilities, ProviderConfig, ProviderFactory,
};
pub use health::{HealthConfig, HealthLevel, HealthStore, ProviderHealthSnapshot};
pub use metrics::{MetricsStore, ProviderMetricsAggregate};
pub use registry::ProviderRegistry;
pub use selector::{ProviderSelector, SelectorConfig};
