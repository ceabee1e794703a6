//! Process-wide lookup tables for pools, breakers and fallback chains
//!
//! Registries are explicit objects owned by the application root and passed
//! by reference, not ambient globals, so tests stay hermetic. The breaker
//! registry guarantees one shared [`CircuitBreaker`] per provider id, which is
//! what keeps failure counts meaningful across concurrent call sites.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics::{LogSink, MetricsSink};
use crate::pool::{
    CircuitBreaker, CircuitBreakerConfig, ConnectionPool, ProviderFallback, ResourceFactory,
};

/// Registry of circuit breakers keyed by provider id, plus named fallback
/// chains composed from them
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    metrics: Arc<dyn MetricsSink>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    chains: RwLock<HashMap<String, Arc<ProviderFallback>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_metrics(default_config, Arc::new(LogSink))
    }

    pub fn with_metrics(
        default_config: CircuitBreakerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            default_config,
            metrics,
            breakers: RwLock::new(HashMap::new()),
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for a provider id, creating it with the registry's
    /// default config on first use. Every call site for the same provider id
    /// receives the same instance.
    pub async fn breaker(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(provider_id) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().await;
        // racing registrations resolve to whichever insert won
        Arc::clone(breakers.entry(provider_id.to_string()).or_insert_with(|| {
            debug!(provider = provider_id, "registering circuit breaker");
            Arc::new(CircuitBreaker::with_metrics(
                provider_id,
                self.default_config.clone(),
                Arc::clone(&self.metrics),
            ))
        }))
    }

    /// Register a breaker with a non-default config. Fails if the provider id
    /// is already bound (the existing instance must keep its counts).
    pub async fn register_breaker(
        &self,
        provider_id: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, RegistryError> {
        let mut breakers = self.breakers.write().await;
        if breakers.contains_key(provider_id) {
            return Err(RegistryError::DuplicateProvider(provider_id.to_string()));
        }
        let breaker = Arc::new(CircuitBreaker::with_metrics(
            provider_id,
            config,
            Arc::clone(&self.metrics),
        ));
        breakers.insert(provider_id.to_string(), Arc::clone(&breaker));
        info!(provider = provider_id, "registered circuit breaker");
        Ok(breaker)
    }

    /// Build (or fetch) a named fallback chain from primary + fallback
    /// provider ids; each id resolves to its shared breaker
    pub async fn chain(
        &self,
        key: &str,
        primary_provider_id: &str,
        fallback_provider_ids: &[&str],
    ) -> Arc<ProviderFallback> {
        if let Some(chain) = self.chains.read().await.get(key) {
            return Arc::clone(chain);
        }

        let primary = self.breaker(primary_provider_id).await;
        let mut fallbacks = Vec::with_capacity(fallback_provider_ids.len());
        for id in fallback_provider_ids {
            fallbacks.push(self.breaker(id).await);
        }

        let mut chains = self.chains.write().await;
        Arc::clone(chains.entry(key.to_string()).or_insert_with(|| {
            info!(
                chain = key,
                primary = primary_provider_id,
                fallbacks = fallback_provider_ids.len(),
                "registered fallback chain"
            );
            Arc::new(ProviderFallback::new(key, primary, fallbacks))
        }))
    }

    /// Fetch a previously built chain
    pub async fn get_chain(&self, key: &str) -> Option<Arc<ProviderFallback>> {
        self.chains.read().await.get(key).map(Arc::clone)
    }

    /// Reset every breaker to closed
    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        self.breakers.read().await.keys().cloned().collect()
    }
}

/// Uniform handle over a pool regardless of its resource type, for
/// registry-wide lifecycle operations
#[async_trait]
pub trait PoolHandle: Send + Sync {
    fn pool_name(&self) -> &str;

    async fn shutdown(self: Arc<Self>);
}

#[async_trait]
impl<F: ResourceFactory> PoolHandle for ConnectionPool<F> {
    fn pool_name(&self) -> &str {
        self.name()
    }

    async fn shutdown(self: Arc<Self>) {
        self.close().await;
    }
}

struct PoolEntry {
    /// Same pool behind both: `typed` for downcast lookup, `handle` for
    /// uniform shutdown
    typed: Arc<dyn Any + Send + Sync>,
    handle: Arc<dyn PoolHandle>,
}

/// Registry of pools keyed by name, with typed lookup and uniform shutdown
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, PoolEntry>>,
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a pool named '{0}' is already registered")]
    DuplicatePool(String),

    #[error("a circuit breaker for provider '{0}' is already registered")]
    DuplicateProvider(String),
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initialized pool under its name
    pub async fn register<F: ResourceFactory>(
        &self,
        pool: Arc<ConnectionPool<F>>,
    ) -> Result<(), RegistryError> {
        let name = pool.name().to_string();
        let mut pools = self.pools.write().await;
        if pools.contains_key(&name) {
            return Err(RegistryError::DuplicatePool(name));
        }
        info!(pool = %name, "registered pool");
        pools.insert(
            name,
            PoolEntry {
                typed: Arc::clone(&pool) as Arc<dyn Any + Send + Sync>,
                handle: pool,
            },
        );
        Ok(())
    }

    /// Typed lookup; returns `None` when the name is unknown or bound to a
    /// pool of a different factory type
    pub async fn get<F: ResourceFactory>(&self, name: &str) -> Option<Arc<ConnectionPool<F>>> {
        let pools = self.pools.read().await;
        let entry = pools.get(name)?;
        match Arc::clone(&entry.typed).downcast::<ConnectionPool<F>>() {
            Ok(pool) => Some(pool),
            Err(_) => {
                warn!(pool = name, "pool registered under a different resource type");
                None
            }
        }
    }

    /// Remove a pool from the registry and close it
    pub async fn remove(&self, name: &str) -> bool {
        let entry = self.pools.write().await.remove(name);
        match entry {
            Some(entry) => {
                entry.handle.shutdown().await;
                info!(pool = name, "removed and closed pool");
                true
            }
            None => false,
        }
    }

    pub async fn names(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Close every registered pool and empty the registry
    pub async fn close_all(&self) {
        let entries: Vec<PoolEntry> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            debug!(pool = entry.handle.pool_name(), "closing pool");
            entry.handle.shutdown().await;
        }
    }
}
