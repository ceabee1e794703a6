//! Multi-provider fallback chains over circuit breakers
//!
//! A [`ProviderFallback`] binds one shared breaker per provider (primary plus
//! an ordered list of fallbacks) and tries each in declared order when the
//! previous one is open or has exhausted its retries.

use std::sync::Arc;

use tracing::{info, warn};

use super::circuit::{CircuitBreaker, CircuitError};

/// Error types for fallback chain execution
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    /// Every provider in the chain failed; holds one entry per provider
    #[error("all {} providers failed for chain '{chain}'", .failures.len())]
    AllProvidersFailed {
        chain: String,
        failures: Vec<(String, CircuitError)>,
    },

    /// A non-qualifying operation error; propagated without trying fallbacks
    #[error(transparent)]
    Operation(CircuitError),
}

impl FallbackError {
    /// Per-provider failures, in the order the chain was tried
    pub fn failures(&self) -> &[(String, CircuitError)] {
        match self {
            FallbackError::AllProvidersFailed { failures, .. } => failures,
            FallbackError::Operation(_) => &[],
        }
    }
}

/// Ordered chain of circuit-protected providers
///
/// Breaker instances are shared per provider id (via the breaker registry),
/// never per call site, so failure counts stay meaningful across concurrent
/// callers.
pub struct ProviderFallback {
    chain: String,
    primary: Arc<CircuitBreaker>,
    fallbacks: Vec<Arc<CircuitBreaker>>,
}

impl ProviderFallback {
    pub fn new(
        chain: impl Into<String>,
        primary: Arc<CircuitBreaker>,
        fallbacks: Vec<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            chain: chain.into(),
            primary,
            fallbacks,
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn primary_provider_id(&self) -> &str {
        self.primary.provider_id()
    }

    /// Provider ids in try order: primary first, then fallbacks
    pub fn provider_ids(&self) -> Vec<&str> {
        std::iter::once(self.primary.provider_id())
            .chain(self.fallbacks.iter().map(|b| b.provider_id()))
            .collect()
    }

    /// Try the primary provider, then each fallback in order
    ///
    /// The operation factory is invoked with the id of the provider being
    /// tried.
    /// Breaker-layer failures (circuit open, retries exhausted) move on to the
    /// next provider; non-qualifying operation errors propagate immediately.
    pub async fn execute<T, Op, Fut>(&self, mut op: Op) -> Result<T, FallbackError>
    where
        Op: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, super::circuit::ProviderError>>,
    {
        let mut failures: Vec<(String, CircuitError)> = Vec::new();

        for breaker in std::iter::once(&self.primary).chain(self.fallbacks.iter()) {
            let provider = breaker.provider_id().to_string();
            match breaker.execute(|| op(provider.clone())).await {
                Ok(value) => {
                    if !failures.is_empty() {
                        info!(
                            chain = %self.chain,
                            provider = %provider,
                            failed = failures.len(),
                            "fallback provider succeeded"
                        );
                    }
                    return Ok(value);
                }
                Err(CircuitError::Operation(e)) => {
                    return Err(FallbackError::Operation(CircuitError::Operation(e)));
                }
                Err(e) => {
                    warn!(
                        chain = %self.chain,
                        provider = %provider,
                        error = %e,
                        "provider failed, trying next"
                    );
                    failures.push((provider, e));
                }
            }
        }

        Err(FallbackError::AllProvidersFailed {
            chain: self.chain.clone(),
            failures,
        })
    }

    /// Like [`execute`](Self::execute), but when every provider fails the
    /// terminal fallback supplies the result instead of an error
    pub async fn execute_or_else<T, Op, Fut, Term, TFut>(
        &self,
        op: Op,
        terminal: Term,
    ) -> Result<T, FallbackError>
    where
        Op: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, super::circuit::ProviderError>>,
        Term: FnOnce() -> TFut,
        TFut: std::future::Future<Output = T>,
    {
        match self.execute(op).await {
            Ok(value) => Ok(value),
            Err(FallbackError::AllProvidersFailed { chain, failures }) => {
                warn!(chain = %chain, failed = failures.len(), "all providers failed, using terminal fallback");
                Ok(terminal().await)
            }
            Err(e) => Err(e),
        }
    }
}
