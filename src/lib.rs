//! respool - resilient resource pooling with circuit breaking and provider fallback

pub mod config;
pub mod metrics;
pub mod pool;
pub mod registry;

pub use config::{load_config, Settings};
pub use metrics::{EventLevel, LogSink, MetricKind, MetricsSink, NullSink};
pub use pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
    ConnectionPool, FailureKind, FallbackError, PoolConfig, PoolError, PoolGuard, PoolState,
    PoolStats, PooledConnection, ProviderError, ProviderFallback, ResourceFactory,
};
pub use registry::{BreakerRegistry, PoolHandle, PoolRegistry, RegistryError};
