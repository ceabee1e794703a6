//! Integration tests for the connection pool
//!
//! These tests drive the pool through realistic acquire/release interleavings
//! with a fault-injecting factory and verify the sizing, lending and
//! self-healing guarantees.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use respool::{ConnectionPool, PoolConfig, PoolError, PoolState, ResourceFactory};

/// Factory handing out sequentially numbered resources, with switches for
/// failing creation and validation
struct TestFactory {
    created: AtomicUsize,
    closed: AtomicUsize,
    fail_creates: AtomicBool,
    fail_validation: AtomicBool,
}

impl TestFactory {
    fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
            fail_validation: AtomicBool::new(false),
        }
    }

    fn always_failing() -> Self {
        let factory = Self::new();
        factory.fail_creates.store(true, Ordering::SeqCst);
        factory
    }
}

#[async_trait]
impl ResourceFactory for TestFactory {
    type Resource = usize;

    async fn create(&self) -> anyhow::Result<usize> {
        if self.fail_creates.load(Ordering::SeqCst) {
            anyhow::bail!("injected create failure");
        }
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn close(&self, _resource: usize) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, _resource: &mut usize) -> bool {
        !self.fail_validation.load(Ordering::SeqCst)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(min: usize, max: usize) -> PoolConfig {
    init_tracing();
    PoolConfig {
        min_size: min,
        max_size: max,
        acquire_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(60),
        max_lifetime: Duration::from_secs(3600),
        validate_on_acquire: false,
        validate_interval: Duration::from_secs(60),
        health_check_interval: Duration::from_secs(60),
        retry_attempts: 0,
        retry_delay: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn test_steady_state_size_bounds() {
    let pool = ConnectionPool::new("bounds", TestFactory::new(), config(2, 5));
    pool.initialize().await.unwrap();

    for _ in 0..4 {
        let g1 = pool.acquire().await.unwrap();
        let g2 = pool.acquire().await.unwrap();
        let g3 = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert!(stats.current_size >= 2 && stats.current_size <= 5);

        pool.release(g2).await.unwrap();
        pool.release(g1).await.unwrap();
        pool.release(g3).await.unwrap();
        let stats = pool.stats().await;
        assert!(stats.current_size >= 2 && stats.current_size <= 5);
        assert_eq!(stats.in_use, 0);
    }
    pool.close().await;
}

#[tokio::test]
async fn test_no_connection_lent_twice() {
    let pool = ConnectionPool::new("exclusive", TestFactory::new(), config(3, 3));
    pool.initialize().await.unwrap();

    let g1 = pool.acquire().await.unwrap();
    let g2 = pool.acquire().await.unwrap();
    let g3 = pool.acquire().await.unwrap();

    let mut ids = HashSet::new();
    assert!(ids.insert(g1.id()));
    assert!(ids.insert(g2.id()));
    assert!(ids.insert(g3.id()));

    // a released connection may come back, but only after its release
    let released_id = g2.id();
    pool.release(g2).await.unwrap();
    let g4 = pool.acquire().await.unwrap();
    assert_eq!(g4.id(), released_id);

    pool.release(g1).await.unwrap();
    pool.release(g3).await.unwrap();
    pool.release(g4).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_initialize_fails_when_creation_always_fails() {
    let pool = ConnectionPool::new("broken", TestFactory::always_failing(), config(2, 5));

    let err = pool.initialize().await.unwrap_err();
    assert!(matches!(err, PoolError::Create { .. }));
    assert_ne!(pool.state().await, PoolState::Ready);

    // and the pool never hands anything out
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::NotReady { .. }));
}

#[tokio::test]
async fn test_acquire_times_out_at_max_capacity() {
    let pool = ConnectionPool::new("capacity", TestFactory::new(), config(2, 2));
    pool.initialize().await.unwrap();

    let g1 = pool.acquire().await.unwrap();
    let g2 = pool.acquire().await.unwrap();

    let start = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(waited >= Duration::from_millis(200), "waited {waited:?}");

    let stats = pool.stats().await;
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.max_size_reached, 1);

    pool.release(g1).await.unwrap();
    pool.release(g2).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_timed_out_waiter_gets_fresh_connection_below_max() {
    let pool = ConnectionPool::new("grow", TestFactory::new(), config(1, 3));
    pool.initialize().await.unwrap();

    let g1 = pool.acquire().await.unwrap();
    // queue is empty but the pool is below max: the waiter times out on the
    // queue, then creates a fresh connection for itself
    let g2 = pool.acquire().await.unwrap();
    assert_ne!(g1.id(), g2.id());
    assert_eq!(pool.stats().await.current_size, 2);

    pool.release(g1).await.unwrap();
    pool.release(g2).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_waiter_wakes_on_release_before_timeout() {
    let pool = ConnectionPool::new("handoff", TestFactory::new(), config(1, 1));
    pool.initialize().await.unwrap();

    let g1 = pool.acquire().await.unwrap();
    let released_id = g1.id();

    let pool_clone = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_clone.acquire().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.release(g1).await.unwrap();

    let g2 = waiter.await.unwrap().unwrap();
    assert_eq!(g2.id(), released_id);

    pool.release(g2).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_validate_on_acquire_replaces_invalid_connection() {
    let mut cfg = config(1, 2);
    cfg.validate_on_acquire = true;
    cfg.validate_interval = Duration::from_millis(0);

    let pool = ConnectionPool::new("validate", TestFactory::new(), cfg);
    pool.initialize().await.unwrap();

    let g1 = pool.acquire().await.unwrap();
    let first_id = g1.id();
    pool.release(g1).await.unwrap();

    // the idle connection now fails validation and must be replaced;
    // creation still works, only validation fails
    pool.factory().fail_validation.store(true, Ordering::SeqCst);

    let g2 = pool.acquire().await.unwrap();
    assert_ne!(g2.id(), first_id);
    assert_eq!(pool.stats().await.current_size, 1);

    pool.factory().fail_validation.store(false, Ordering::SeqCst);
    pool.release(g2).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_max_lifetime_recycles_on_release() {
    let mut cfg = config(1, 2);
    cfg.max_lifetime = Duration::from_millis(50);

    let pool = ConnectionPool::new("lifetime", TestFactory::new(), cfg);
    pool.initialize().await.unwrap();

    let g1 = pool.acquire().await.unwrap();
    let old_id = g1.id();
    tokio::time::sleep(Duration::from_millis(80)).await;
    pool.release(g1).await.unwrap();

    // the expired connection was closed and a replacement created to hold min_size
    let stats = pool.stats().await;
    assert_eq!(stats.current_size, 1);
    assert!(stats.created >= 2);

    let g2 = pool.acquire().await.unwrap();
    assert_ne!(g2.id(), old_id);
    pool.release(g2).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_idle_eviction_respects_min_size() {
    let mut cfg = config(1, 4);
    cfg.idle_timeout = Duration::from_millis(50);
    cfg.health_check_interval = Duration::from_millis(100);

    let pool = ConnectionPool::new("evict", TestFactory::new(), cfg);
    pool.initialize().await.unwrap();

    // grow the pool to 3 by holding three connections
    let g1 = pool.acquire().await.unwrap();
    let g2 = pool.acquire().await.unwrap();
    let g3 = pool.acquire().await.unwrap();
    pool.release(g1).await.unwrap();
    pool.release(g2).await.unwrap();
    pool.release(g3).await.unwrap();
    assert_eq!(pool.stats().await.current_size, 3);

    // let the sweep evict the idle surplus
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.current_size, 1);
    assert!(stats.idle_closed >= 2);
    pool.close().await;
}

#[tokio::test]
async fn test_guard_drop_reclaims_connection() {
    let pool = ConnectionPool::new("reclaim", TestFactory::new(), config(1, 2));
    pool.initialize().await.unwrap();

    {
        let _guard = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().await.in_use, 1);
        // dropped here without an explicit release
    }

    // the maintenance loop drains the reclaim channel
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.released, 1);

    // the reclaimed connection is acquirable again
    let guard = pool.acquire().await.unwrap();
    pool.release(guard).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_with_connection_releases_on_error_path() {
    let pool = ConnectionPool::new("scoped", TestFactory::new(), config(1, 1));
    pool.initialize().await.unwrap();

    let result: Result<Result<(), &str>, _> = pool
        .with_connection(|guard| async move {
            let _value = *guard;
            Err("domain failure")
        })
        .await;
    assert!(matches!(result, Ok(Err("domain failure"))));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.stats().await.in_use, 0);

    // the single connection is back, so this must not time out
    let guard = pool.acquire().await.unwrap();
    pool.release(guard).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_release_after_close_closes_resource() {
    let pool = ConnectionPool::new("late-release", TestFactory::new(), config(2, 2));
    pool.initialize().await.unwrap();

    let guard = pool.acquire().await.unwrap();
    pool.close().await;
    assert_eq!(pool.state().await, PoolState::Closed);

    // the pool is no longer ready: release closes instead of requeueing
    pool.release(guard).await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.current_size, 0);
}

#[tokio::test]
async fn test_cross_pool_release_rejected() {
    let pool_a = ConnectionPool::new("cross-a", TestFactory::new(), config(1, 2));
    let pool_b = ConnectionPool::new("cross-b", TestFactory::new(), config(1, 2));
    pool_a.initialize().await.unwrap();
    pool_b.initialize().await.unwrap();

    // both pools have a connection lent out at the same time
    let ga = pool_a.acquire().await.unwrap();
    let gb = pool_b.acquire().await.unwrap();
    assert_ne!(ga.id(), gb.id());

    let err = pool_b.release(ga).await.unwrap_err();
    assert!(matches!(err, PoolError::UnknownConnection(_)));

    // pool B's own lending is untouched by the bogus release
    assert_eq!(pool_b.stats().await.in_use, 1);
    pool_b.release(gb).await.unwrap();
    assert_eq!(pool_b.stats().await.in_use, 0);

    pool_a.close().await;
    pool_b.close().await;
}

#[tokio::test]
async fn test_guard_dropped_after_close_still_closes_resource() {
    let pool = ConnectionPool::new("late-drop", TestFactory::new(), config(1, 1));
    pool.initialize().await.unwrap();

    let guard = pool.acquire().await.unwrap();
    pool.close().await;
    assert_eq!(pool.state().await, PoolState::Closed);

    // dropped, not released: the close hook must still run
    drop(guard);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.current_size, 0);
}

#[tokio::test]
async fn test_acquire_during_close_fails() {
    let pool = ConnectionPool::new("closing", TestFactory::new(), config(1, 1));
    pool.initialize().await.unwrap();
    pool.close().await;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::NotReady { .. }));
}

#[tokio::test]
async fn test_wait_time_average_is_tracked() {
    let pool = ConnectionPool::new("waits", TestFactory::new(), config(1, 1));
    pool.initialize().await.unwrap();

    let g = pool.acquire().await.unwrap();
    pool.release(g).await.unwrap();
    let g = pool.acquire().await.unwrap();
    pool.release(g).await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.acquired, 2);
    assert!(stats.wait_time_ms >= 0.0);
    pool.close().await;
}
