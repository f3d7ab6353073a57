//! Bounded connection pool.
//!
//! The pool owns every physical connection. Capacity is a FIFO
//! `tokio::sync::Semaphore` with `max_size` permits: a checked-out
//! [`PooledConnection`] holds one permit, and a new connection is only opened
//! by a permit holder that found no idle connection, so checked-out plus idle
//! never exceeds `max_size`. The idle set, the size counter and the closed flag
//! live under one `std::sync::Mutex` that is never held across an `.await`.
//!
//! A connection that is not in the idle set is always owned by something that
//! fixes the size counter when dropped (a [`Floating`] connection or a
//! [`PooledConnection`]), so cancelling `acquire` at any await point leaks
//! nothing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConnectOptions, DatabaseConfig, PoolOptions};
use crate::db::cursor::Cursor;
use crate::db::driver::{Driver, DriverConnection, QueryOutput, driver_for};
use crate::error::{DbError, DbResult};
use crate::models::Params;

const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A physical connection with its transaction bookkeeping.
pub(crate) struct Live {
    pub(crate) id: u64,
    pub(crate) raw: Box<dyn DriverConnection>,
    /// 0 = no transaction, 1 = top-level transaction, k > 1 = k - 1 savepoints
    pub(crate) depth: u32,
    /// Depth to roll back to before the next statement
    pub(crate) pending_rollback_to: Option<u32>,
    /// Session can no longer be trusted; discarded at release
    pub(crate) broken: bool,
    created: Instant,
}

impl fmt::Debug for Live {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Live")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("pending_rollback_to", &self.pending_rollback_to)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Live {
    /// True when the connection can go back to the idle set as-is.
    fn is_clean(&self) -> bool {
        self.depth == 0 && self.pending_rollback_to.is_none() && !self.broken
    }

    fn is_beyond_max_lifetime(&self, options: &PoolOptions) -> bool {
        options
            .max_lifetime_or_default()
            .is_some_and(|max| self.created.elapsed() > max)
    }

    async fn close(self) {
        let id = self.id;
        match tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, self.raw.close()).await {
            Ok(Ok(())) => debug!(connection_id = id, "Connection closed"),
            Ok(Err(e)) => debug!(connection_id = id, error = %e, "Error closing connection"),
            Err(_) => debug!(connection_id = id, "Timed out closing connection"),
        }
    }
}

struct Idle {
    live: Live,
    since: Instant,
}

/// Decrements the pool size when dropped, unless cancelled.
struct SizeGuard {
    pool: Arc<PoolInner>,
    cancelled: bool,
}

impl SizeGuard {
    /// Guard a slot that is already counted in `size`.
    fn new(pool: &Arc<PoolInner>) -> Self {
        Self {
            pool: Arc::clone(pool),
            cancelled: false,
        }
    }

    fn cancel(mut self) {
        self.cancelled = true;
    }
}

impl Drop for SizeGuard {
    fn drop(&mut self) {
        if !self.cancelled {
            self.pool.state().size -= 1;
            self.pool.size_changed.notify_waiters();
        }
    }
}

/// A connection (or a reserved slot) on its way in or out of the pool.
struct Floating {
    live: Live,
    guard: SizeGuard,
}

impl Floating {
    fn attach(self, permit: OwnedSemaphorePermit) -> PooledConnection {
        let Floating { live, guard } = self;
        let pool = Arc::clone(&guard.pool);
        guard.cancel();
        PooledConnection {
            live: Some(live),
            permit: Some(permit),
            pool,
        }
    }

    /// Close the session; the size slot is released when `self` is dropped.
    async fn close(self) {
        self.live.close().await;
        drop(self.guard);
    }
}

struct PoolState {
    /// Oldest release first
    idle: VecDeque<Idle>,
    /// Idle + checked out + being opened (not those being discarded)
    size: u32,
    closed: bool,
}

pub(crate) struct PoolInner {
    driver: Arc<dyn Driver>,
    connect: ConnectOptions,
    options: PoolOptions,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    size_changed: Notify,
    next_id: AtomicU64,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Open a physical connection into an already reserved slot.
    async fn open(self: &Arc<Self>, guard: SizeGuard) -> DbResult<Floating> {
        let raw = self.driver.connect(&self.connect).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, database = %self.connect.masked(), "Opened connection");
        Ok(Floating {
            live: Live {
                id,
                raw,
                depth: 0,
                pending_rollback_to: None,
                broken: false,
                created: Instant::now(),
            },
            guard,
        })
    }

    /// Reserve a slot for a new connection, unless the pool is closed.
    fn reserve(self: &Arc<Self>) -> DbResult<SizeGuard> {
        let mut state = self.state();
        if state.closed {
            return Err(DbError::PoolExhausted);
        }
        state.size += 1;
        drop(state);
        Ok(SizeGuard::new(self))
    }

    /// Produce a live connection for a caller that already holds a permit.
    async fn checkout(self: &Arc<Self>) -> DbResult<Floating> {
        let max_idle_age = self.options.max_idle_age_or_default();
        let stale_after = self.options.stale_after_or_default();
        let retries = self.options.acquire_retries_or_default();
        let mut failures = 0u32;

        loop {
            let (candidate, expired) = {
                let mut state = self.state();
                if state.closed {
                    return Err(DbError::PoolExhausted);
                }
                let mut expired = Vec::new();
                while state
                    .idle
                    .front()
                    .is_some_and(|idle| idle.since.elapsed() > max_idle_age)
                {
                    if let Some(idle) = state.idle.pop_front() {
                        expired.push(idle.live);
                    }
                }
                let candidate = match state.idle.pop_back() {
                    Some(idle) => Some(idle),
                    None => {
                        state.size += 1;
                        None
                    }
                };
                (candidate, expired)
            };

            if !expired.is_empty() {
                debug!(count = expired.len(), "Closing connections past max idle age");
                for live in expired {
                    self.discard(Floating {
                        live,
                        guard: SizeGuard::new(self),
                    });
                }
                self.replenish();
            }

            let Some(idle) = candidate else {
                return self.open(SizeGuard::new(self)).await;
            };

            let idle_for = idle.since.elapsed();
            let mut floating = Floating {
                live: idle.live,
                guard: SizeGuard::new(self),
            };

            if floating.live.is_beyond_max_lifetime(&self.options) {
                debug!(connection_id = floating.live.id, "Connection past max lifetime");
                self.discard(floating);
                self.replenish();
                continue;
            }

            if idle_for < stale_after {
                return Ok(floating);
            }

            match floating.live.raw.ping().await {
                Ok(()) => return Ok(floating),
                Err(e) => {
                    failures += 1;
                    warn!(
                        connection_id = floating.live.id,
                        attempt = failures,
                        error = %e,
                        "Liveness probe failed, discarding connection"
                    );
                    self.discard(floating);
                    self.replenish();
                    if failures > retries {
                        return Err(DbError::PoolUnavailable {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Return a connection to the pool, rolling back or discarding as needed.
    fn release(self: &Arc<Self>, mut live: Live, permit: Option<OwnedSemaphorePermit>) {
        if live.broken || self.is_closed() || live.is_beyond_max_lifetime(&self.options) {
            self.discard(Floating {
                live,
                guard: SizeGuard::new(self),
            });
            drop(permit);
            self.replenish();
            return;
        }

        if live.is_clean() {
            let mut state = self.state();
            if state.closed {
                drop(state);
                self.discard(Floating {
                    live,
                    guard: SizeGuard::new(self),
                });
            } else {
                debug!(connection_id = live.id, "Connection returned to idle");
                state.idle.push_back(Idle {
                    live,
                    since: Instant::now(),
                });
            }
            // The connection is idle before its permit frees up
            drop(permit);
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                connection_id = live.id,
                "No runtime to roll back an open transaction, discarding connection"
            );
            live.broken = true;
            self.release(live, permit);
            return;
        };

        debug!(
            connection_id = live.id,
            depth = live.depth,
            "Rolling back open transaction before release"
        );
        let pool = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = live.raw.rollback().await {
                warn!(connection_id = live.id, error = %e, "Rollback at release failed");
                live.broken = true;
            }
            live.depth = 0;
            live.pending_rollback_to = None;
            pool.release(live, permit);
        });
    }

    /// Give up a connection's slot now and close the session in the
    /// background when a runtime is available.
    fn discard(self: &Arc<Self>, floating: Floating) {
        let Floating { live, guard } = floating;
        debug!(connection_id = live.id, "Discarding connection");
        drop(guard);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(live.close());
            }
            Err(_) => drop(live),
        }
    }

    /// Top the pool back up to `min_size` in the background.
    fn replenish(self: &Arc<Self>) {
        let min = self.options.min_size_or_default();
        {
            let state = self.state();
            if state.closed || state.size >= min {
                return;
            }
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(self);
        handle.spawn(async move {
            loop {
                // Only open with a free permit; busy permits will come back as idle
                let Ok(permit) = Arc::clone(&pool.semaphore).try_acquire_owned() else {
                    return;
                };
                let guard = {
                    let mut state = pool.state();
                    if state.closed || state.size >= min {
                        return;
                    }
                    state.size += 1;
                    drop(state);
                    SizeGuard::new(&pool)
                };
                match pool.open(guard).await {
                    Ok(floating) => {
                        debug!(connection_id = floating.live.id, "Replenished pool");
                        let Floating { live, guard } = floating;
                        guard.cancel();
                        pool.release(live, Some(permit));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to replenish pool");
                        return;
                    }
                }
            }
        });
    }
}

/// A pool of database connections.
///
/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.inner.connect.masked())
            .field("size", &self.size())
            .field("num_idle", &self.num_idle())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl Pool {
    /// Create a pool and open `min_size` connections eagerly.
    pub async fn connect(config: DatabaseConfig) -> DbResult<Self> {
        let driver = driver_for(config.connect.backend);
        Self::connect_with_driver(config, driver).await
    }

    /// Create a pool that opens connections on first use.
    pub fn connect_lazy(config: DatabaseConfig) -> DbResult<Self> {
        let driver = driver_for(config.connect.backend);
        Self::connect_lazy_with_driver(config, driver)
    }

    /// Like [`Pool::connect`], with an explicit driver.
    pub async fn connect_with_driver(
        config: DatabaseConfig,
        driver: Arc<dyn Driver>,
    ) -> DbResult<Self> {
        let pool = Self::connect_lazy_with_driver(config, driver)?;
        let min = pool.inner.options.min_size_or_default();

        let mut opened = Vec::with_capacity(min as usize);
        for _ in 0..min {
            let guard = pool.inner.reserve()?;
            match pool.inner.open(guard).await {
                Ok(floating) => opened.push(floating),
                Err(e) => {
                    for floating in opened {
                        floating.close().await;
                    }
                    return Err(e);
                }
            }
        }
        {
            let mut state = pool.inner.state();
            for Floating { live, guard } in opened {
                guard.cancel();
                state.idle.push_back(Idle {
                    live,
                    since: Instant::now(),
                });
            }
        }

        info!(
            database = %pool.inner.connect.masked(),
            min_size = min,
            max_size = pool.inner.options.max_size_or_default(),
            "Connection pool ready"
        );
        Ok(pool)
    }

    /// Like [`Pool::connect_lazy`], with an explicit driver.
    pub fn connect_lazy_with_driver(
        config: DatabaseConfig,
        driver: Arc<dyn Driver>,
    ) -> DbResult<Self> {
        config.pool.validate()?;
        let max = config.pool.max_size_or_default();
        let inner = PoolInner {
            driver,
            connect: config.connect,
            options: config.pool,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                size: 0,
                closed: false,
            }),
            semaphore: Arc::new(Semaphore::new(max as usize)),
            size_changed: Notify::new(),
            next_id: AtomicU64::new(1),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Acquire a connection, waiting up to the configured `acquire_timeout`.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquire_timeout(self.inner.options.acquire_timeout_or_default())
            .await
    }

    /// Acquire a connection, waiting at most `timeout`.
    ///
    /// A zero timeout never waits for a busy pool.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledConnection> {
        if self.inner.is_closed() {
            return Err(DbError::PoolExhausted);
        }
        let started = Instant::now();

        let permit = if timeout.is_zero() {
            match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(DbError::PoolExhausted),
                Err(TryAcquireError::NoPermits) => {
                    return Err(DbError::PoolTimeout { waited: timeout });
                }
            }
        } else {
            let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
            match tokio::time::timeout(timeout, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolExhausted),
                Err(_) => return Err(DbError::PoolTimeout { waited: timeout }),
            }
        };

        let floating = if timeout.is_zero() {
            self.inner.checkout().await?
        } else {
            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, self.inner.checkout()).await {
                Ok(result) => result?,
                Err(_) => return Err(DbError::PoolTimeout { waited: timeout }),
            }
        };

        let conn = floating.attach(permit);
        debug!(
            connection_id = conn.id(),
            waited_ms = started.elapsed().as_millis() as u64,
            "Acquired connection"
        );
        Ok(conn)
    }

    /// Shut the pool down.
    ///
    /// Pending and future acquires fail with `PoolExhausted`, idle connections
    /// are closed, and checked-out connections are closed as they come back,
    /// waiting up to `shutdown_timeout` for them. Idempotent.
    pub async fn close(&self) {
        let idle: Vec<Idle> = {
            let mut state = self.inner.state();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.semaphore.close();

        for idle in idle {
            Floating {
                live: idle.live,
                guard: SizeGuard::new(&self.inner),
            }
            .close()
            .await;
        }

        let wait_for_checked_out = async {
            loop {
                let notified = self.inner.size_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.state().size == 0 {
                    return;
                }
                notified.await;
            }
        };
        let timeout = self.inner.options.shutdown_timeout_or_default();
        if tokio::time::timeout(timeout, wait_for_checked_out)
            .await
            .is_err()
        {
            warn!(
                outstanding = self.size(),
                "Shutdown timed out waiting for checked-out connections"
            );
        }
        info!(database = %self.inner.connect.masked(), "Connection pool closed");
    }

    /// Number of open connections, idle or checked out.
    pub fn size(&self) -> u32 {
        self.inner.state().size
    }

    pub fn num_idle(&self) -> usize {
        self.inner.state().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn connect_options(&self) -> &ConnectOptions {
        &self.inner.connect
    }
}

/// A connection checked out of a [`Pool`].
///
/// Returned to the pool on drop. A connection left inside a transaction is
/// rolled back first, on a background task that keeps the pool slot until
/// the rollback is done.
pub struct PooledConnection {
    pub(crate) live: Option<Live>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("live", &self.live)
            .finish()
    }
}

impl PooledConnection {
    pub(crate) fn live_mut(&mut self) -> DbResult<&mut Live> {
        self.live
            .as_mut()
            .ok_or_else(|| DbError::internal("connection already released to pool"))
    }

    /// Pool-assigned connection id (0 once released).
    pub fn id(&self) -> u64 {
        self.live.as_ref().map_or(0, |live| live.id)
    }

    /// Current transaction nesting depth.
    pub fn depth(&self) -> u32 {
        self.live.as_ref().map_or(0, |live| live.depth)
    }

    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    pub fn is_broken(&self) -> bool {
        self.live.as_ref().is_none_or(|live| live.broken)
    }

    pub(crate) fn options(&self) -> &PoolOptions {
        &self.pool.options
    }

    /// Run one statement and buffer its result.
    ///
    /// A rollback left pending by an abandoned scope runs first. Errors that
    /// mean the session is gone mark the connection broken.
    pub(crate) async fn run_statement(
        &mut self,
        sql: &str,
        params: &Params,
    ) -> DbResult<QueryOutput> {
        let live = self.live_mut()?;
        live.resolve_pending().await?;
        match live.raw.execute(sql, params).await {
            Ok(output) => {
                debug!(
                    connection_id = live.id,
                    depth = live.depth,
                    rows_affected = output.rows_affected,
                    "Statement executed"
                );
                Ok(output)
            }
            Err(e) => {
                if e.is_connection_error() {
                    warn!(connection_id = live.id, error = %e, "Connection failed during statement");
                    live.broken = true;
                }
                Err(e)
            }
        }
    }

    /// A cursor running statements outside any explicit scope.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self)
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        let live = self.live_mut()?;
        let result = live.raw.ping().await;
        if result.is_err() {
            live.broken = true;
        }
        result
    }

    /// Return the connection, rolling back any open transaction first.
    pub async fn release(mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        if !live.broken && !live.is_clean() {
            if let Err(e) = live.raw.rollback().await {
                warn!(connection_id = live.id, error = %e, "Rollback at release failed");
                live.broken = true;
            }
            live.depth = 0;
            live.pending_rollback_to = None;
        }
        self.pool.release(live, self.permit.take());
    }

    /// Close the underlying session instead of returning it to the pool.
    pub async fn close(mut self) {
        if let Some(live) = self.live.take() {
            let permit = self.permit.take();
            Floating {
                live,
                guard: SizeGuard::new(&self.pool),
            }
            .close()
            .await;
            drop(permit);
            self.pool.replenish();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            self.pool.release(live, self.permit.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::{Failure, MockDriver};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn config(pool: PoolOptions) -> DatabaseConfig {
        DatabaseConfig::new(ConnectOptions::postgres("test"), pool).unwrap()
    }

    async fn pool_with(options: PoolOptions) -> (Pool, MockDriver) {
        let driver = MockDriver::new();
        let pool = Pool::connect_with_driver(config(options), Arc::new(driver.clone()))
            .await
            .unwrap();
        (pool, driver)
    }

    /// Let spawned release/close tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_opens_min_size() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(2)).await;
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.num_idle(), 2);
        assert_eq!(driver.opened(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connect_error() {
        let driver = MockDriver::new();
        driver.fail_next_connects(1);
        let err = Pool::connect_with_driver(config(PoolOptions::default()), Arc::new(driver))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_lazy_pool_opens_on_demand() {
        let driver = MockDriver::new();
        let pool =
            Pool::connect_lazy_with_driver(config(PoolOptions::default()), Arc::new(driver.clone()))
                .unwrap();
        assert_eq!(pool.size(), 0);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(driver.opened(), 1);
        drop(conn);
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn test_zero_max_size_rejected() {
        let driver = MockDriver::new();
        let config = DatabaseConfig {
            connect: ConnectOptions::postgres("test"),
            pool: PoolOptions::default().max_size(0),
        };
        let err = Pool::connect_lazy_with_driver(config, Arc::new(driver)).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_release_returns_to_idle_and_reuses() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(1).max_size(2)).await;
        let first = pool.acquire().await.unwrap();
        let id = first.id();
        drop(first);
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(driver.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_caller_waits_for_release() {
        let (pool, _driver) = pool_with(PoolOptions::default().min_size(0).max_size(2)).await;
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let a_id = a.id();
        drop(a);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, a_id);
        assert_eq!(pool.size(), 2);
        drop(b);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_fast_when_exhausted() {
        let (pool, _driver) = pool_with(PoolOptions::default().min_size(0).max_size(2)).await;
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire_timeout(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DbError::PoolTimeout { .. }));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_leaves_state_unchanged() {
        let (pool, _driver) = pool_with(PoolOptions::default().min_size(0).max_size(1)).await;
        let held = pool.acquire().await.unwrap();
        let err = pool
            .acquire_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PoolTimeout { .. }));
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.num_idle(), 0);
        drop(held);
        assert!(pool.acquire_timeout(Duration::ZERO).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_leaks_nothing() {
        let driver = MockDriver::new();
        driver.set_connect_delay(Duration::from_secs(5));
        let pool = Pool::connect_lazy_with_driver(
            config(PoolOptions::default().max_size(1)),
            Arc::new(driver.clone()),
        )
        .unwrap();

        // Cancelled while the connection is being opened
        let attempt = tokio::time::timeout(Duration::from_secs(1), pool.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(pool.size(), 0);

        driver.set_connect_delay(Duration::ZERO);
        let conn = pool.acquire_timeout(Duration::ZERO).await.unwrap();
        assert_eq!(pool.size(), 1);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_probe_failures_replace_connection() {
        let (pool, driver) = pool_with(
            PoolOptions::default()
                .min_size(2)
                .max_size(3)
                .stale_after(Duration::from_secs(1)),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        driver.fail_next_pings(2);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(driver.pings(), 2);
        // both stale connections were discarded and a fresh one opened
        assert_eq!(driver.opened(), 3);
        assert!(!conn.is_broken());
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_probe_failures_is_unavailable() {
        let (pool, driver) = pool_with(
            PoolOptions::default()
                .min_size(3)
                .max_size(3)
                .stale_after(Duration::from_secs(1))
                .acquire_retries(1),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        driver.fail_next_pings(3);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolUnavailable { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections_expire() {
        let (pool, driver) = pool_with(
            PoolOptions::default()
                .min_size(0)
                .max_size(2)
                .max_idle_age(Duration::from_secs(10)),
        )
        .await;
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.num_idle(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let conn = pool.acquire().await.unwrap();
        settle().await;
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.size(), 1);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_lifetime_discards_at_release() {
        let (pool, driver) = pool_with(
            PoolOptions::default()
                .min_size(0)
                .max_lifetime(Duration::from_secs(5)),
        )
        .await;
        let conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        drop(conn);
        settle().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(driver.closed(), 1);
    }

    #[tokio::test]
    async fn test_open_transaction_rolled_back_on_drop() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(0).max_size(1)).await;
        let mut conn = pool.acquire().await.unwrap();
        conn.live_mut().unwrap().raw.begin(&Default::default()).await.unwrap();
        conn.live_mut().unwrap().depth = 1;
        drop(conn);

        // the slot stays taken until the rollback finishes
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.depth(), 0);
        assert!(driver.log().iter().any(|e| e.ends_with("ROLLBACK")));
        assert_eq!(driver.opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_discards_connection() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(0).max_size(1)).await;
        let mut conn = pool.acquire().await.unwrap();
        conn.live_mut().unwrap().depth = 1;
        driver.fail_rollback(true);
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        settle().await;
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);
        drop(conn);
    }

    #[tokio::test]
    async fn test_broken_connection_discarded_and_replenished() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(1).max_size(2)).await;
        let mut conn = pool.acquire().await.unwrap();
        driver.fail_next_statement(Failure::Interface);
        let err = conn.run_statement("SELECT 1", &Params::None).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(conn.is_broken());
        drop(conn);
        settle().await;

        assert_eq!(driver.closed(), 1);
        assert_eq!(driver.opened(), 2);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn test_statement_error_keeps_connection() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(1).max_size(1)).await;
        let mut conn = pool.acquire().await.unwrap();
        driver.fail_next_statement(Failure::Data);
        let err = conn.run_statement("SELECT 1/0", &Params::None).await.unwrap_err();
        assert!(matches!(err, DbError::Data { .. }));
        assert!(!conn.is_broken());
        drop(conn);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(driver.closed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_waiters_and_future_acquires() {
        let (pool, driver) = pool_with(PoolOptions::default().min_size(1).max_size(1)).await;
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            waiter.await.unwrap(),
            Err(DbError::PoolExhausted)
        ));
        assert!(matches!(pool.acquire().await, Err(DbError::PoolExhausted)));

        // shutdown finishes once the checked-out connection comes back
        assert!(!closer.is_finished());
        drop(held);
        closer.await.unwrap();
        settle().await;
        assert_eq!(pool.size(), 0);
        assert_eq!(driver.closed(), 1);

        // idempotent
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_after_shutdown_timeout() {
        let (pool, _driver) = pool_with(
            PoolOptions::default()
                .min_size(1)
                .shutdown_timeout(Duration::from_secs(2)),
        )
        .await;
        let held = pool.acquire().await.unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.size(), 1);
        drop(held);
        settle().await;
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_connection_handed_out_twice() {
        let (pool, _driver) = pool_with(PoolOptions::default().min_size(0).max_size(3)).await;
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for seed in 0..12u64 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            tasks.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..20 {
                    let conn = pool.acquire().await.unwrap();
                    assert!(
                        in_use.lock().unwrap().insert(conn.id()),
                        "connection {} handed out twice",
                        conn.id()
                    );
                    let hold = rng.gen_range(0..3);
                    tokio::time::sleep(Duration::from_millis(hold)).await;
                    in_use.lock().unwrap().remove(&conn.id());
                    drop(conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(pool.size() <= 3);
    }
}
