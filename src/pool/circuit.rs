//! Circuit breaker with bounded retry and jittered backoff
//!
//! Implements a per-provider circuit breaker with three states:
//! - Closed: normal operation, failures are counted
//! - Open: the provider has failed, calls are rejected without being attempted
//! - HalfOpen: probing recovery, successes accumulate toward closing
//!
//! Only errors whose [`FailureKind`] is in the configured classifier set count
//! toward the circuit; anything else propagates immediately, uncounted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::{EventLevel, LogSink, MetricsSink};

/// Classification of a provider error, used by the failure classifier set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    Connection,
    Service,
    RateLimited,
    InvalidRequest,
    Other,
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureKind::Timeout),
            "connection" => Ok(FailureKind::Connection),
            "service" => Ok(FailureKind::Service),
            "rate_limited" => Ok(FailureKind::RateLimited),
            "invalid_request" => Ok(FailureKind::InvalidRequest),
            "other" => Ok(FailureKind::Other),
            _ => Err(format!("unknown failure kind: {s}")),
        }
    }
}

/// Error raised by an operation running under a circuit breaker
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::Timeout(_) => FailureKind::Timeout,
            ProviderError::Connection(_) => FailureKind::Connection,
            ProviderError::Service(_) => FailureKind::Service,
            ProviderError::RateLimited(_) => FailureKind::RateLimited,
            ProviderError::InvalidRequest(_) => FailureKind::InvalidRequest,
            ProviderError::Other(_) => FailureKind::Other,
        }
    }
}

/// Circuit breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    /// Fail-fast rejection: the operation was never invoked
    #[error("circuit open for provider '{provider}', retry in {retry_in:?}")]
    Open { provider: String, retry_in: Duration },

    /// All retries exhausted; wraps the last underlying failure
    #[error("provider '{provider}' failed after {attempts} attempts")]
    RetriesExhausted {
        provider: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    /// Non-qualifying error, propagated uncounted
    #[error(transparent)]
    Operation(ProviderError),
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls are attempted
    Closed,

    /// Provider has failed - calls are rejected until the recovery timeout
    Open,

    /// Probing recovery - calls are attempted, successes accumulate
    HalfOpen,
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures before the circuit opens
    pub failure_threshold: u32,

    /// How long the circuit stays open before a half-open probe is allowed
    pub recovery_timeout: Duration,

    /// Consecutive successes in half-open before the circuit closes
    pub success_threshold: u32,

    /// Extra attempts after a failed call
    pub max_retries: u32,

    /// Base delay between retries
    pub retry_delay: Duration,

    /// Whether the retry delay grows exponentially
    pub exponential_backoff: bool,

    /// Multiplier applied per attempt when backoff is exponential
    pub backoff_factor: f64,

    /// Upper bound on any retry delay
    pub max_retry_delay: Duration,

    /// Error kinds that count toward the circuit; others propagate uncounted
    pub failure_classifiers: HashSet<FailureKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(30),
            failure_classifiers: [
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Service,
                FailureKind::RateLimited,
            ]
            .into_iter()
            .collect(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Consecutive qualifying failures (meaningful while closed)
    pub failure_count: u32,

    /// Consecutive successes (meaningful while half-open)
    pub success_count: u32,

    /// Total calls admitted past the state check
    pub total_requests: u64,

    /// Total successful attempts
    pub total_successes: u64,

    /// Total qualifying failed attempts
    pub total_failures: u64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Time since the last state transition
    pub time_in_state: Duration,
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_transition: Instant,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    open_count: u64,
}

/// Per-provider failure/success state machine wrapping arbitrary operations
///
/// One instance must be shared per provider id across all call sites (the
/// breaker registry enforces this); failure counts are only meaningful when
/// every caller reports through the same instance.
pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_metrics(provider_id, config, Arc::new(LogSink))
    }

    pub fn with_metrics(
        provider_id: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_transition: Instant::now(),
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                open_count: 0,
            }),
            metrics,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Snapshot of the breaker statistics
    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            open_count: inner.open_count,
            time_in_state: inner.last_transition.elapsed(),
        }
    }

    /// Manually reset the circuit to closed
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        info!(provider = %self.provider_id, "manually resetting circuit to closed");
        self.transition_to_closed(&mut inner);
    }

    /// Run an operation under the circuit
    ///
    /// If the circuit is open and the recovery timeout has not elapsed, fails
    /// fast with [`CircuitError::Open`] without invoking the operation.
    /// Otherwise the operation is attempted up to `max_retries + 1` times with
    /// jittered backoff between attempts. Qualifying failures feed the state
    /// machine; non-qualifying errors propagate immediately, uncounted.
    pub async fn execute<T, Op, Fut>(&self, mut op: Op) -> Result<T, CircuitError>
    where
        Op: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        self.check_state().await?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    self.on_success().await;
                    if attempt > 1 {
                        debug!(
                            provider = %self.provider_id,
                            attempt,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !self.config.failure_classifiers.contains(&e.kind()) {
                        debug!(
                            provider = %self.provider_id,
                            kind = ?e.kind(),
                            error = %e,
                            "non-qualifying error, propagating uncounted"
                        );
                        return Err(CircuitError::Operation(e));
                    }

                    self.on_failure().await;

                    if attempt > self.config.max_retries {
                        warn!(
                            provider = %self.provider_id,
                            attempts = attempt,
                            error = %e,
                            "retries exhausted"
                        );
                        return Err(CircuitError::RetriesExhausted {
                            provider: self.provider_id.clone(),
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let delay = self.retry_delay(attempt);
                    debug!(
                        provider = %self.provider_id,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before the next attempt: a constant `retry_delay`, or exponential
    /// with ±10% jitter when backoff is enabled, capped either way
    fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.config.exponential_backoff {
            return self.config.retry_delay.min(self.config.max_retry_delay);
        }
        let factor = self.config.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let capped = self
            .config
            .retry_delay
            .mul_f64(factor)
            .min(self.config.max_retry_delay);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        capped.mul_f64(jitter).min(self.config.max_retry_delay)
    }

    async fn check_state(&self) -> Result<(), CircuitError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.total_requests += 1;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    self.transition_to_half_open(&mut inner);
                    inner.total_requests += 1;
                    Ok(())
                } else {
                    Err(CircuitError::Open {
                        provider: self.provider_id.clone(),
                        retry_in: self.config.recovery_timeout - elapsed,
                    })
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                debug!(
                    provider = %self.provider_id,
                    success_count = inner.success_count,
                    threshold = self.config.success_threshold,
                    "success while half-open"
                );
                if inner.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut inner);
                }
            }
            CircuitState::Open => {
                // A retry can land here after a half-open failure reopened the
                // circuit mid-execute
                warn!(provider = %self.provider_id, "success recorded while circuit open");
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    provider = %self.provider_id,
                    failure_count = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "qualifying failure while closed"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = %self.provider_id, "failure while half-open, reopening circuit");
                self.transition_to_open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_closed(&self, inner: &mut CircuitInner) {
        info!(provider = %self.provider_id, from = inner.state.name(), "circuit closed");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_transition = Instant::now();
        self.metrics.report_event(
            "circuit_closed",
            EventLevel::Info,
            "circuit closed",
            &[("provider", self.provider_id.as_str())],
        );
    }

    fn transition_to_open(&self, inner: &mut CircuitInner) {
        warn!(
            provider = %self.provider_id,
            from = inner.state.name(),
            failure_count = inner.failure_count,
            "circuit opened"
        );
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.open_count += 1;
        inner.last_transition = Instant::now();
        self.metrics.report_event(
            "circuit_open",
            EventLevel::Warn,
            "circuit opened",
            &[("provider", self.provider_id.as_str())],
        );
    }

    fn transition_to_half_open(&self, inner: &mut CircuitInner) {
        info!(provider = %self.provider_id, "circuit transitioning from open to half-open");
        inner.state = CircuitState::HalfOpen;
        inner.success_count = 0;
        inner.last_transition = Instant::now();
        self.metrics.report_event(
            "circuit_half_open",
            EventLevel::Info,
            "circuit half-open",
            &[("provider", self.provider_id.as_str())],
        );
    }
}
