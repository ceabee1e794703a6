use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::pool::{CircuitBreakerConfig, FailureKind, PoolConfig};

/// Pool settings as written in configuration files
///
/// Durations are plain integers (seconds unless the field name says
/// otherwise) so YAML stays readable; [`PoolSettings::to_config`] converts
/// into the runtime struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Minimum number of connections to keep warm
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Maximum number of connections
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Acquire timeout in seconds
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Idle eviction threshold in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum connection lifetime in seconds
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    /// Validate stale connections before handing them out
    #[serde(default = "default_validate_on_acquire")]
    pub validate_on_acquire: bool,

    /// Validation freshness window in seconds
    #[serde(default = "default_validate_interval_secs")]
    pub validate_interval_secs: u64,

    /// Maintenance sweep interval in seconds
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Extra creation attempts after a failed create
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between creation attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_max_lifetime_secs() -> u64 {
    3600
}

fn default_validate_on_acquire() -> bool {
    true
}

fn default_validate_interval_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            validate_on_acquire: default_validate_on_acquire(),
            validate_interval_secs: default_validate_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl PoolSettings {
    /// Convert into the runtime pool configuration
    pub fn to_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
            validate_on_acquire: self.validate_on_acquire,
            validate_interval: Duration::from_secs(self.validate_interval_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            retry_attempts: self.retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    /// Reject configurations no pool could run with
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            anyhow::bail!("pool max_size must be positive");
        }
        if self.min_size > self.max_size {
            anyhow::bail!(
                "pool min_size ({}) cannot exceed max_size ({})",
                self.min_size,
                self.max_size
            );
        }
        Ok(())
    }
}

/// Circuit breaker settings as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before a half-open probe
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Consecutive half-open successes before the circuit closes
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Extra attempts after a failed call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_circuit_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Grow the retry delay exponentially
    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,

    /// Multiplier per attempt when backoff is exponential
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on any retry delay, in seconds
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Error kinds counted as circuit failures: timeout, connection, service,
    /// rate_limited, invalid_request, other
    #[serde(default = "default_failure_classifiers")]
    pub failure_classifiers: Vec<String>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_circuit_retry_delay_ms() -> u64 {
    1000
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_retry_delay_secs() -> u64 {
    30
}

fn default_failure_classifiers() -> Vec<String> {
    vec![
        "timeout".to_string(),
        "connection".to_string(),
        "service".to_string(),
        "rate_limited".to_string(),
    ]
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_circuit_retry_delay_ms(),
            exponential_backoff: default_exponential_backoff(),
            backoff_factor: default_backoff_factor(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            failure_classifiers: default_failure_classifiers(),
        }
    }
}

impl CircuitSettings {
    /// Convert into the runtime breaker configuration
    pub fn to_config(&self) -> Result<CircuitBreakerConfig> {
        let mut classifiers = std::collections::HashSet::new();
        for name in &self.failure_classifiers {
            let kind: FailureKind = name
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("invalid failure_classifiers entry")?;
            classifiers.insert(kind);
        }
        Ok(CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            success_threshold: self.success_threshold,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            exponential_backoff: self.exponential_backoff,
            backoff_factor: self.backoff_factor,
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
            failure_classifiers: classifiers,
        })
    }
}

/// A declared fallback chain: primary provider plus ordered fallbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    pub primary: String,

    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Pool defaults
    #[serde(default)]
    pub pool: PoolSettings,

    /// Circuit breaker defaults
    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Named fallback chains
    #[serde(default)]
    pub chains: HashMap<String, ChainSettings>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.circuit.to_config().map(|_| ())
    }
}

/// Load settings from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;

    let settings: Settings =
        serde_yaml::from_str(&content).context("failed to parse YAML configuration")?;
    settings.validate()?;

    Ok(settings)
}

/// Load settings from environment variables
///
/// Starts from defaults and applies `RESPOOL_*` overrides:
/// - `RESPOOL_MIN_SIZE` / `RESPOOL_MAX_SIZE`
/// - `RESPOOL_ACQUIRE_TIMEOUT_SECS` / `RESPOOL_IDLE_TIMEOUT_SECS`
/// - `RESPOOL_FAILURE_THRESHOLD` / `RESPOOL_RECOVERY_TIMEOUT_SECS`
/// - `RESPOOL_MAX_RETRIES`
pub fn load_from_env() -> Result<Settings> {
    // Load .env if present; its absence is not an error
    let _ = dotenvy::dotenv();

    let mut settings = Settings::new();

    if let Ok(val) = std::env::var("RESPOOL_MIN_SIZE") {
        settings.pool.min_size = val.parse().context("RESPOOL_MIN_SIZE must be an integer")?;
    }
    if let Ok(val) = std::env::var("RESPOOL_MAX_SIZE") {
        settings.pool.max_size = val.parse().context("RESPOOL_MAX_SIZE must be an integer")?;
    }
    if let Ok(val) = std::env::var("RESPOOL_ACQUIRE_TIMEOUT_SECS") {
        settings.pool.acquire_timeout_secs = val
            .parse()
            .context("RESPOOL_ACQUIRE_TIMEOUT_SECS must be an integer")?;
    }
    if let Ok(val) = std::env::var("RESPOOL_IDLE_TIMEOUT_SECS") {
        settings.pool.idle_timeout_secs = val
            .parse()
            .context("RESPOOL_IDLE_TIMEOUT_SECS must be an integer")?;
    }
    if let Ok(val) = std::env::var("RESPOOL_FAILURE_THRESHOLD") {
        settings.circuit.failure_threshold = val
            .parse()
            .context("RESPOOL_FAILURE_THRESHOLD must be an integer")?;
    }
    if let Ok(val) = std::env::var("RESPOOL_RECOVERY_TIMEOUT_SECS") {
        settings.circuit.recovery_timeout_secs = val
            .parse()
            .context("RESPOOL_RECOVERY_TIMEOUT_SECS must be an integer")?;
    }
    if let Ok(val) = std::env::var("RESPOOL_MAX_RETRIES") {
        settings.circuit.max_retries = val
            .parse()
            .context("RESPOOL_MAX_RETRIES must be an integer")?;
    }

    settings.validate()?;
    Ok(settings)
}

/// Load settings from a YAML file, or from the environment when no path is
/// given
pub fn load_config(config_path: Option<&str>) -> Result<Settings> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
