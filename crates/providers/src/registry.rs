//! Provider registry - ordered, thread-safe storage of adapter instances.
//!
//! Registration order is preserved; the selector uses it as the final
//! deterministic tie-break.

use crate::adapters::{ContentKind, ContentProvider};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct RegisteredProvider {
    provider: Arc<dyn ContentProvider>,
    enabled: bool,
}

pub struct ProviderRegistry {
    providers: RwLock<Vec<RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Register a provider. Names must be unique.
    pub async fn register(&self, provider: Arc<dyn ContentProvider>) -> anyhow::Result<()> {
        let name = provider.name().to_string();
        let mut providers = self.providers.write().await;

        if providers.iter().any(|p| p.provider.name() == name) {
            return Err(anyhow::anyhow!("provider already registered: {}", name));
        }

        providers.push(RegisteredProvider {
            provider,
            enabled: true,
        });
        info!(provider = %name, "registered provider");
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> anyhow::Result<()> {
        let mut providers = self.providers.write().await;
        let before = providers.len();
        providers.retain(|p| p.provider.name() != name);
        if providers.len() == before {
            return Err(anyhow::anyhow!("provider not found: {}", name));
        }
        info!(provider = %name, "deregistered provider");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ContentProvider>> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.provider.name() == name)
            .map(|p| Arc::clone(&p.provider))
    }

    /// All registered providers, in registration order.
    pub async fn list(&self) -> Vec<Arc<dyn ContentProvider>> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| Arc::clone(&p.provider))
            .collect()
    }

    /// Enabled providers supporting the given kind, in registration order.
    pub async fn candidates_for(&self, kind: ContentKind) -> Vec<Arc<dyn ContentProvider>> {
        let candidates: Vec<_> = self
            .providers
            .read()
            .await
            .iter()
            .filter(|p| p.enabled && p.provider.supports(kind))
            .map(|p| Arc::clone(&p.provider))
            .collect();
        debug!(kind = %kind, count = candidates.len(), "resolved candidate providers");
        candidates
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> anyhow::Result<()> {
        let mut providers = self.providers.write().await;
        let entry = providers
            .iter_mut()
            .find(|p| p.provider.name() == name)
            .ok_or_else(|| anyhow::anyhow!("provider not found: {}", name))?;
        entry.enabled = enabled;
        info!(provider = %name, enabled, "provider availability toggled");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
