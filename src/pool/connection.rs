//! Generic resource pooling with lifecycle management and self-healing
//!
//! This module provides a pool of opaque resources with:
//! - Eager warm-up to a configured minimum size
//! - FIFO-fair acquisition with a bounded wait
//! - Validation on acquire and periodic revalidation of idle resources
//! - Idle eviction, max-lifetime recycling and automatic top-up
//! - A cancellable background maintenance loop that never crashes on
//!   integrator hook failures

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics::{EventLevel, LogSink, MetricKind, MetricsSink};

/// Connection ids are drawn from a process-wide counter, so a guard can never
/// alias a connection lent out by a different pool
static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out acquiring connection from pool '{pool}' after {waited:?}")]
    Timeout { pool: String, waited: Duration },

    #[error("pool '{pool}' is not ready (state: {state})")]
    NotReady { pool: String, state: &'static str },

    #[error("failed to create connection for pool '{pool}'")]
    Create {
        pool: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("connection was not acquired from pool '{0}'")]
    UnknownConnection(String),

    #[error("pool '{0}' is already initialized")]
    AlreadyInitialized(String),
}

/// Integrator-supplied lifecycle hooks for the pooled resource
///
/// The pool treats the resource as opaque: everything it knows about creating,
/// validating and tearing one down goes through this trait.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Create a fresh resource. May fail; the pool retries per its config.
    async fn create(&self) -> anyhow::Result<Self::Resource>;

    /// Tear a resource down. Best-effort: errors are logged and counted,
    /// never propagated.
    async fn close(&self, resource: Self::Resource) -> anyhow::Result<()> {
        drop(resource);
        Ok(())
    }

    /// Check whether a resource is still usable. Invalid resources are
    /// closed and replaced transparently.
    async fn validate(&self, _resource: &mut Self::Resource) -> bool {
        true
    }
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to keep warm
    pub min_size: usize,

    /// Maximum number of connections
    pub max_size: usize,

    /// How long `acquire` waits for an idle connection before creating one
    /// (below `max_size`) or failing
    pub acquire_timeout: Duration,

    /// Maximum idle time before a connection is evicted
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection before it is recycled on release
    pub max_lifetime: Duration,

    /// Whether stale connections are validated before being handed out
    pub validate_on_acquire: bool,

    /// How long a validation result stays fresh
    pub validate_interval: Duration,

    /// Interval of the background maintenance sweep
    pub health_check_interval: Duration,

    /// Extra creation attempts after a failed `create`
    pub retry_attempts: u32,

    /// Delay between creation attempts
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(3600),
            validate_on_acquire: true,
            validate_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Statistics for a pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total connections created
    pub created: u64,

    /// Total successful acquisitions
    pub acquired: u64,

    /// Total releases back to the pool
    pub released: u64,

    /// Hook failures (create/close/validate)
    pub errors: u64,

    /// Acquire timeouts at max capacity
    pub timeouts: u64,

    /// Connections evicted for sitting idle too long
    pub idle_closed: u64,

    /// Times an acquire found the pool at max capacity
    pub max_size_reached: u64,

    /// Current number of live connections (idle + lent)
    pub current_size: usize,

    /// Connections currently lent out
    pub in_use: usize,

    /// Running average acquire wait in milliseconds
    pub wait_time_ms: f64,

    /// Last hook error message
    pub last_error: Option<String>,

    /// When the last hook error happened
    pub last_error_time: Option<Instant>,
}

/// Pool lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Initializing,
    Ready,
    Closing,
    Closed,
}

impl PoolState {
    pub fn name(&self) -> &'static str {
        match self {
            PoolState::Initializing => "initializing",
            PoolState::Ready => "ready",
            PoolState::Closing => "closing",
            PoolState::Closed => "closed",
        }
    }
}

/// A pooled resource with its bookkeeping timestamps
pub struct PooledConnection<T> {
    id: u64,
    resource: T,
    created_at: Instant,
    last_used_at: Instant,
    last_validated_at: Instant,
    in_use: bool,
}

impl<T> PooledConnection<T> {
    fn new(id: u64, resource: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            resource,
            created_at: now,
            last_used_at: now,
            last_validated_at: now,
            in_use: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }
}

/// Scoped handle to an acquired connection
///
/// Dereferences to the underlying resource. If the guard is dropped without an
/// explicit [`ConnectionPool::release`] (early return, error, cancellation),
/// the connection is sent back to the pool through a reclaim channel drained
/// by the maintenance loop, so it is never leaked.
pub struct PoolGuard<T> {
    conn: Option<PooledConnection<T>>,
    reclaim: mpsc::UnboundedSender<PooledConnection<T>>,
}

impl<T> PoolGuard<T> {
    /// Identity of the held connection
    pub fn id(&self) -> u64 {
        match &self.conn {
            Some(conn) => conn.id,
            None => 0,
        }
    }

    fn take(&mut self) -> Option<PooledConnection<T>> {
        self.conn.take()
    }
}

impl<T> std::fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("id", &self.id()).finish()
    }
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Invariant: the connection is present until release() consumes the guard
        &self.conn.as_ref().expect("connection already released").resource
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn.as_mut().expect("connection already released").resource
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.in_use = false;
            // If the pool is gone the resource is simply dropped with the message
            let _ = self.reclaim.send(conn);
        }
    }
}

struct PoolCore<T> {
    state: PoolState,
    idle: VecDeque<PooledConnection<T>>,
    lent: HashMap<u64, Instant>,
    current_size: usize,
    stats: PoolStats,
}

/// Generic connection pool over a [`ResourceFactory`]
///
/// Lifecycle: `Initializing → Ready → Closing → Closed`. `acquire`/`release`
/// are only valid while `Ready`; releases afterwards close the resource
/// instead of requeueing it.
///
/// Acquisition fairness is best-effort: waiters suspend FIFO on the idle
/// queue for up to `acquire_timeout`, and only a waiter whose own timeout
/// fires creates a fresh connection (below `max_size`). A late caller can
/// therefore obtain a fresh connection before an earlier, still-waiting one.
pub struct ConnectionPool<F: ResourceFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    core: Mutex<PoolCore<F::Resource>>,
    /// Permit count mirrors the idle-queue length
    permits: Semaphore,
    /// Taken at close; outstanding guards then hold the only senders
    reclaim_tx: Mutex<Option<mpsc::UnboundedSender<PooledConnection<F::Resource>>>>,
    reclaim_rx: Mutex<Option<mpsc::UnboundedReceiver<PooledConnection<F::Resource>>>>,
    shutdown_tx: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<PooledConnection<F::Resource>>>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<F: ResourceFactory> ConnectionPool<F> {
    /// Create a pool. It is not usable until [`initialize`](Self::initialize).
    pub fn new(name: impl Into<String>, factory: F, config: PoolConfig) -> Arc<Self> {
        Self::with_metrics(name, factory, config, Arc::new(LogSink))
    }

    /// Create a pool reporting through the given metrics sink
    pub fn with_metrics(
        name: impl Into<String>,
        factory: F,
        config: PoolConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            factory,
            config,
            core: Mutex::new(PoolCore {
                state: PoolState::Initializing,
                idle: VecDeque::new(),
                lent: HashMap::new(),
                current_size: 0,
                stats: PoolStats::default(),
            }),
            permits: Semaphore::new(0),
            reclaim_tx: Mutex::new(Some(reclaim_tx)),
            reclaim_rx: Mutex::new(Some(reclaim_rx)),
            shutdown_tx,
            maintenance: Mutex::new(None),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The integrator-supplied factory backing this pool
    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub async fn state(&self) -> PoolState {
        self.core.lock().await.state
    }

    /// Snapshot of the pool statistics
    pub async fn stats(&self) -> PoolStats {
        let core = self.core.lock().await;
        let mut stats = core.stats.clone();
        stats.current_size = core.current_size;
        stats.in_use = core.lent.len();
        stats
    }

    /// Eagerly create `min_size` connections and start the maintenance loop
    ///
    /// Fails without reaching `Ready` if any creation fails after the
    /// configured retries. No silent partial pool.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), PoolError> {
        {
            let core = self.core.lock().await;
            if core.state != PoolState::Initializing {
                return Err(PoolError::AlreadyInitialized(self.name.clone()));
            }
        }

        let mut warmed: Vec<PooledConnection<F::Resource>> =
            Vec::with_capacity(self.config.min_size);
        for _ in 0..self.config.min_size {
            match self.create_with_retry().await {
                Ok(conn) => warmed.push(conn),
                Err(e) => {
                    for conn in warmed {
                        self.close_resource(conn).await;
                    }
                    self.record_error(&e).await;
                    return Err(PoolError::Create {
                        pool: self.name.clone(),
                        source: e,
                    });
                }
            }
        }

        let warmed_count = warmed.len();
        {
            let mut core = self.core.lock().await;
            core.current_size = warmed_count;
            core.stats.created += warmed_count as u64;
            core.stats.current_size = warmed_count;
            for conn in warmed {
                core.idle.push_back(conn);
            }
            core.state = PoolState::Ready;
        }
        self.permits.add_permits(warmed_count);

        let reclaim_rx = self.reclaim_rx.lock().await.take();
        if let Some(rx) = reclaim_rx {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(Arc::clone(self).maintenance_loop(rx, shutdown_rx));
            *self.maintenance.lock().await = Some(handle);
        }

        info!(pool = %self.name, size = warmed_count, "pool initialized");
        Ok(())
    }

    /// Acquire a connection, suspending up to `acquire_timeout`
    ///
    /// When the wait times out and the pool is below `max_size`, a fresh
    /// connection is created for this caller; at max capacity the call fails
    /// with [`PoolError::Timeout`].
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard<F::Resource>, PoolError> {
        let start = Instant::now();
        {
            let core = self.core.lock().await;
            if core.state != PoolState::Ready {
                return Err(PoolError::NotReady {
                    pool: self.name.clone(),
                    state: core.state.name(),
                });
            }
        }

        let mut conn_opt = None;
        match tokio::time::timeout(self.config.acquire_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let mut core = self.core.lock().await;
                if core.state != PoolState::Ready {
                    return Err(PoolError::NotReady {
                        pool: self.name.clone(),
                        state: core.state.name(),
                    });
                }
                conn_opt = core.idle.pop_front();
            }
            Ok(Err(_)) => {
                // semaphore closed by shutdown
                return Err(PoolError::NotReady {
                    pool: self.name.clone(),
                    state: PoolState::Closing.name(),
                });
            }
            Err(_) => {}
        }

        let conn = match conn_opt {
            Some(conn) => conn,
            None => self.create_for_acquire(start).await?,
        };

        let conn = if self.config.validate_on_acquire
            && conn.last_validated_at.elapsed() > self.config.validate_interval
        {
            self.revalidate(conn).await?
        } else {
            conn
        };

        self.hand_out(conn, start.elapsed()).await
    }

    /// Timed-out (or raced-empty) acquire path: create below max, else fail
    async fn create_for_acquire(
        &self,
        start: Instant,
    ) -> Result<PooledConnection<F::Resource>, PoolError> {
        {
            let mut core = self.core.lock().await;
            if core.state != PoolState::Ready {
                return Err(PoolError::NotReady {
                    pool: self.name.clone(),
                    state: core.state.name(),
                });
            }
            if core.current_size >= self.config.max_size {
                core.stats.max_size_reached += 1;
                core.stats.timeouts += 1;
                drop(core);
                self.metrics.report_metric(
                    "timeouts",
                    1.0,
                    MetricKind::Counter,
                    &[("pool", self.name.as_str())],
                );
                return Err(PoolError::Timeout {
                    pool: self.name.clone(),
                    waited: start.elapsed(),
                });
            }
            core.current_size += 1;
            core.stats.current_size = core.current_size;
        }

        match self.create_with_retry().await {
            Ok(conn) => {
                let mut core = self.core.lock().await;
                core.stats.created += 1;
                Ok(conn)
            }
            Err(e) => {
                {
                    let mut core = self.core.lock().await;
                    core.current_size -= 1;
                    core.stats.current_size = core.current_size;
                }
                self.record_error(&e).await;
                Err(PoolError::Create {
                    pool: self.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Validate a stale connection, transparently replacing it when invalid
    async fn revalidate(
        &self,
        mut conn: PooledConnection<F::Resource>,
    ) -> Result<PooledConnection<F::Resource>, PoolError> {
        if self.factory.validate(&mut conn.resource).await {
            conn.last_validated_at = Instant::now();
            return Ok(conn);
        }

        debug!(pool = %self.name, id = conn.id, "connection failed validation on acquire, replacing");
        self.close_resource(conn).await;
        match self.create_with_retry().await {
            Ok(replacement) => {
                let mut core = self.core.lock().await;
                core.stats.created += 1;
                Ok(replacement)
            }
            Err(e) => {
                {
                    let mut core = self.core.lock().await;
                    core.current_size -= 1;
                    core.stats.current_size = core.current_size;
                }
                self.record_error(&e).await;
                Err(PoolError::Create {
                    pool: self.name.clone(),
                    source: e,
                })
            }
        }
    }

    async fn hand_out(
        &self,
        mut conn: PooledConnection<F::Resource>,
        waited: Duration,
    ) -> Result<PoolGuard<F::Resource>, PoolError> {
        let reclaim = self.reclaim_tx.lock().await.as_ref().cloned();
        let Some(reclaim) = reclaim else {
            // the pool closed while this acquire was in flight
            {
                let mut core = self.core.lock().await;
                core.current_size = core.current_size.saturating_sub(1);
                core.stats.current_size = core.current_size;
            }
            self.close_resource(conn).await;
            return Err(PoolError::NotReady {
                pool: self.name.clone(),
                state: PoolState::Closed.name(),
            });
        };
        {
            let mut core = self.core.lock().await;
            conn.in_use = true;
            conn.last_used_at = Instant::now();
            core.lent.insert(conn.id, conn.last_used_at);
            core.stats.acquired += 1;
            core.stats.in_use = core.lent.len();
            let n = core.stats.acquired as f64;
            let sample_ms = waited.as_secs_f64() * 1000.0;
            core.stats.wait_time_ms += (sample_ms - core.stats.wait_time_ms) / n;
        }
        let tags = [("pool", self.name.as_str())];
        self.metrics
            .report_metric("acquired", 1.0, MetricKind::Counter, &tags);
        self.metrics.report_metric(
            "wait_time",
            waited.as_secs_f64() * 1000.0,
            MetricKind::Timer,
            &tags,
        );
        Ok(PoolGuard {
            conn: Some(conn),
            reclaim,
        })
    }

    /// Return a connection to the pool
    ///
    /// The connection must have been acquired from this pool; anything else
    /// is a [`PoolError::UnknownConnection`]. Past `max_lifetime` the
    /// connection is closed and, below `min_size`, immediately replaced.
    pub async fn release(&self, mut guard: PoolGuard<F::Resource>) -> Result<(), PoolError> {
        match guard.take() {
            Some(conn) => self.release_inner(conn, true).await,
            None => Err(PoolError::UnknownConnection(self.name.clone())),
        }
    }

    /// Acquire, run the closure against the guard, and let the guard's drop
    /// return the connection on every exit path (success, error, cancellation)
    pub async fn with_connection<R, Fut, Func>(self: &Arc<Self>, f: Func) -> Result<R, PoolError>
    where
        Func: FnOnce(PoolGuard<F::Resource>) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let guard = self.acquire().await?;
        Ok(f(guard).await)
    }

    async fn release_inner(
        &self,
        mut conn: PooledConnection<F::Resource>,
        strict: bool,
    ) -> Result<(), PoolError> {
        let mut core = self.core.lock().await;
        if core.lent.remove(&conn.id).is_none() {
            drop(core);
            if strict {
                return Err(PoolError::UnknownConnection(self.name.clone()));
            }
            warn!(pool = %self.name, id = conn.id, "reclaimed connection unknown to pool, dropping");
            return Ok(());
        }

        conn.in_use = false;
        conn.last_used_at = Instant::now();
        core.stats.released += 1;
        core.stats.in_use = core.lent.len();

        let shutting_down = core.state != PoolState::Ready;
        let expired = conn.created_at.elapsed() > self.config.max_lifetime;

        if !shutting_down && !expired {
            core.idle.push_back(conn);
            drop(core);
            self.permits.add_permits(1);
            self.metrics.report_metric(
                "released",
                1.0,
                MetricKind::Counter,
                &[("pool", self.name.as_str())],
            );
            return Ok(());
        }

        core.current_size -= 1;
        core.stats.current_size = core.current_size;
        let replace = !shutting_down && core.current_size < self.config.min_size;
        drop(core);

        self.metrics.report_metric(
            "released",
            1.0,
            MetricKind::Counter,
            &[("pool", self.name.as_str())],
        );
        if expired && !shutting_down {
            debug!(pool = %self.name, id = conn.id, age = ?conn.age(), "recycling connection past max lifetime");
        }
        self.close_resource(conn).await;
        if replace {
            self.add_connection().await;
        }
        Ok(())
    }

    /// Cancel the maintenance loop, await its termination, then close all
    /// idle connections
    ///
    /// Connections still lent out are closed when they come back, whether
    /// through an explicit release or a dropped guard: the pool is no longer
    /// `Ready`, so both paths close instead of requeueing.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut core = self.core.lock().await;
            match core.state {
                PoolState::Closed | PoolState::Closing => return,
                PoolState::Initializing => {
                    core.state = PoolState::Closed;
                    return;
                }
                PoolState::Ready => core.state = PoolState::Closing,
            }
        }
        info!(pool = %self.name, "closing pool");

        let _ = self.shutdown_tx.send(true);
        self.permits.close();

        let handle = self.maintenance.lock().await.take();
        let reclaim_rx = match handle {
            Some(handle) => match handle.await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "maintenance task failed");
                    None
                }
            },
            None => self.reclaim_rx.lock().await.take(),
        };

        // Drop our own sender; outstanding guards now hold the only clones,
        // so the drain task below ends once the last guard is gone.
        drop(self.reclaim_tx.lock().await.take());
        if let Some(mut rx) = reclaim_rx {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(conn) = rx.recv().await {
                    if let Err(e) = pool.release_inner(conn, false).await {
                        debug!(pool = %pool.name, error = %e, "reclaim release failed");
                    }
                }
            });
        }

        loop {
            let conn = {
                let mut core = self.core.lock().await;
                let conn = core.idle.pop_front();
                if conn.is_some() {
                    core.current_size = core.current_size.saturating_sub(1);
                    core.stats.current_size = core.current_size;
                }
                conn
            };
            match conn {
                Some(conn) => self.close_resource(conn).await,
                None => break,
            }
        }

        {
            let mut core = self.core.lock().await;
            core.state = PoolState::Closed;
            core.stats.in_use = core.lent.len();
        }
        self.metrics.report_event(
            "pool_closed",
            EventLevel::Info,
            "pool closed",
            &[("pool", self.name.as_str())],
        );
        info!(pool = %self.name, "pool closed");
    }

    async fn create_with_retry(&self) -> anyhow::Result<PooledConnection<F::Resource>> {
        let mut attempt = 0u32;
        loop {
            match self.factory.create().await {
                Ok(resource) => {
                    let id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
                    self.metrics.report_metric(
                        "created",
                        1.0,
                        MetricKind::Counter,
                        &[("pool", self.name.as_str())],
                    );
                    return Ok(PooledConnection::new(id, resource));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.retry_attempts {
                        return Err(e);
                    }
                    warn!(
                        pool = %self.name,
                        attempt,
                        error = %e,
                        "connection creation failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Add one connection up to `max_size`, best-effort
    async fn add_connection(&self) -> bool {
        {
            let mut core = self.core.lock().await;
            if core.state != PoolState::Ready || core.current_size >= self.config.max_size {
                return false;
            }
            core.current_size += 1;
            core.stats.current_size = core.current_size;
        }
        match self.create_with_retry().await {
            Ok(conn) => {
                {
                    let mut core = self.core.lock().await;
                    core.stats.created += 1;
                    core.idle.push_back(conn);
                }
                self.permits.add_permits(1);
                true
            }
            Err(e) => {
                {
                    let mut core = self.core.lock().await;
                    core.current_size -= 1;
                    core.stats.current_size = core.current_size;
                }
                self.record_error(&e).await;
                warn!(pool = %self.name, error = %e, "failed to create replacement connection");
                false
            }
        }
    }

    async fn close_resource(&self, conn: PooledConnection<F::Resource>) {
        let id = conn.id;
        if let Err(e) = self.factory.close(conn.resource).await {
            warn!(pool = %self.name, id, error = %e, "error closing connection");
            self.record_error(&e).await;
        }
    }

    async fn record_error(&self, error: &anyhow::Error) {
        let mut core = self.core.lock().await;
        core.stats.errors += 1;
        core.stats.last_error = Some(error.to_string());
        core.stats.last_error_time = Some(Instant::now());
    }

    async fn maintenance_loop(
        self: Arc<Self>,
        mut reclaim: mpsc::UnboundedReceiver<PooledConnection<F::Resource>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::UnboundedReceiver<PooledConnection<F::Resource>> {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        debug!(pool = %self.name, interval = ?self.config.health_check_interval, "maintenance loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                maybe_conn = reclaim.recv() => {
                    if let Some(conn) = maybe_conn {
                        if let Err(e) = self.release_inner(conn, false).await {
                            debug!(pool = %self.name, error = %e, "reclaim release failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(pool = %self.name, "maintenance loop stopped");
        reclaim
    }

    /// One maintenance pass: evict idle connections, revalidate stale ones,
    /// then top up to `min_size`. Hook failures are logged and counted but
    /// never escape.
    async fn sweep(&self) {
        let mut to_close = Vec::new();
        let mut to_validate = Vec::new();
        {
            let mut core = self.core.lock().await;
            if core.state != PoolState::Ready {
                return;
            }
            let mut i = 0;
            while i < core.idle.len() {
                let idle_expired = core.idle[i].last_used_at.elapsed() > self.config.idle_timeout
                    && core.current_size > self.config.min_size;
                let stale =
                    core.idle[i].last_validated_at.elapsed() > self.config.validate_interval;
                if !(idle_expired || stale) {
                    i += 1;
                    continue;
                }
                // Claim the matching availability permit before removing; a
                // failed claim means a waiter already owns this slot.
                match self.permits.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        let Some(conn) = core.idle.remove(i) else {
                            self.permits.add_permits(1);
                            break;
                        };
                        if idle_expired {
                            core.current_size -= 1;
                            core.stats.current_size = core.current_size;
                            core.stats.idle_closed += 1;
                            to_close.push(conn);
                        } else {
                            to_validate.push(conn);
                        }
                    }
                    Err(_) => {
                        i += 1;
                    }
                }
            }
        }

        for conn in to_close {
            debug!(pool = %self.name, id = conn.id, idle = ?conn.idle_for(), "evicting idle connection");
            self.metrics.report_metric(
                "idle_closed",
                1.0,
                MetricKind::Counter,
                &[("pool", self.name.as_str())],
            );
            self.close_resource(conn).await;
        }

        for mut conn in to_validate {
            if self.factory.validate(&mut conn.resource).await {
                conn.last_validated_at = Instant::now();
                {
                    let mut core = self.core.lock().await;
                    core.idle.push_back(conn);
                }
                self.permits.add_permits(1);
            } else {
                warn!(pool = %self.name, id = conn.id, "idle connection failed validation, closing");
                {
                    let mut core = self.core.lock().await;
                    core.current_size -= 1;
                    core.stats.current_size = core.current_size;
                }
                self.close_resource(conn).await;
            }
        }

        loop {
            let deficit = {
                let core = self.core.lock().await;
                core.state == PoolState::Ready && core.current_size < self.config.min_size
            };
            if !deficit || !self.add_connection().await {
                break;
            }
        }
    }
}
