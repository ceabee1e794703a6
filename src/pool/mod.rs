//! Resource pooling and fault-tolerance module
//!
//! This module provides:
//! - Generic pooling of opaque resources with lifecycle management
//! - Circuit breaker pattern for fault tolerance
//! - Provider fallback chains for multi-provider resilience
//! - Automatic failure detection and self-healing

pub mod circuit;
pub mod connection;
pub mod fallback;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats, FailureKind,
    ProviderError,
};
pub use connection::{
    ConnectionPool, PoolConfig, PoolError, PoolGuard, PoolState, PoolStats, PooledConnection,
    ResourceFactory,
};
pub use fallback::{FallbackError, ProviderFallback};
