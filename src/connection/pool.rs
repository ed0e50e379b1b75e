use super::{Connector, ResultSet, ShardConnection, TransactionStatus, config::PoolConfig};
use crate::core::{ProxyError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection acquisition cancelled")]
    Cancelled,

    #[error("connection pool is closed")]
    Closed,

    #[error("connection already returned to pool")]
    Released,
}

/// Shard connection pool
///
/// Bounds the number of live connections to one shard, recycles released
/// connections and runs a background health check that retires stale
/// connections and keeps `min_conns` open.
///
/// The membership set lives behind a single mutex that is never held across
/// an await point; waiters park on a [`Notify`] registered before the state
/// is inspected, so no wakeup is lost.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection goes idle, a slot frees up or the pool closes
    changed: Notify,
    /// Stops the health check
    shutdown: CancellationToken,
    /// Pending connection closes, awaited by `close`
    closers: TaskTracker,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Resource>,
    /// Idle + acquired + constructing
    total: usize,
    acquired: usize,
    constructing: usize,
    closed: bool,
    acquire_count: u64,
    empty_acquire_count: u64,
}

/// A connection owned by the pool
struct Resource {
    conn: Box<dyn ShardConnection>,
    created_at: Instant,
    last_used: Instant,
}

impl Resource {
    fn new(conn: Box<dyn ShardConnection>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() > config.max_conn_lifetime
    }

    fn is_idle_too_long(&self, config: &PoolConfig) -> bool {
        self.last_used.elapsed() > config.max_conn_idle_time
    }
}

enum AcquireStep {
    Idle(Resource),
    Create,
    Wait,
}

impl ConnectionPool {
    /// Create a pool and start its health check
    ///
    /// Unless `lazy_connect` is set, one connection is opened (and released)
    /// before returning so that misconfiguration surfaces immediately.
    pub async fn connect(
        name: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate().map_err(ProxyError::Config)?;

        let inner = Arc::new(PoolInner {
            name: name.into(),
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
            closers: TaskTracker::new(),
        });

        tokio::spawn(background_health_check(Arc::downgrade(&inner)));

        let pool = Self { inner };

        if !pool.inner.config.lazy_connect {
            match pool.acquire(&CancellationToken::new()).await {
                Ok(mut guard) => guard.release(),
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        }

        info!(
            pool = %pool.inner.name,
            max_conns = pool.inner.config.max_conns,
            min_conns = pool.inner.config.min_conns,
            "connection pool opened"
        );

        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get a connection from the pool
    ///
    /// Waits for an idle connection or a free slot. Returns
    /// [`PoolError::Cancelled`] as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PoolGuard> {
        let inner = &self.inner;

        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled.into());
            }

            let changed = inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let step = {
                let mut state = inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed.into());
                }
                if let Some(resource) = state.idle.pop_back() {
                    state.acquired += 1;
                    state.acquire_count += 1;
                    AcquireStep::Idle(resource)
                } else if state.total < inner.config.max_conns {
                    state.total += 1;
                    state.constructing += 1;
                    state.acquire_count += 1;
                    state.empty_acquire_count += 1;
                    AcquireStep::Create
                } else {
                    AcquireStep::Wait
                }
            };

            let resource = match step {
                AcquireStep::Idle(resource) => resource,
                AcquireStep::Create => {
                    let slot = ConstructionSlot::new(inner);
                    let conn = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(PoolError::Cancelled.into()),
                        conn = inner.open_connection() => conn,
                    }?;
                    slot.fill();

                    let resource = Resource::new(conn);
                    let mut state = inner.state.lock();
                    state.constructing -= 1;
                    if state.closed {
                        state.total -= 1;
                        drop(state);
                        inner.spawn_close(resource.conn);
                        inner.changed.notify_waiters();
                        return Err(PoolError::Closed.into());
                    }
                    state.acquired += 1;
                    resource
                }
                AcquireStep::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled.into()),
                        _ = &mut changed => continue,
                    }
                }
            };

            if let Some(check) = &inner.config.before_acquire {
                if !check(resource.conn.as_ref()) {
                    debug!(pool = %inner.name, "before_acquire rejected connection");
                    inner.destroy_acquired(resource);
                    continue;
                }
            }

            return Ok(PoolGuard {
                pool: Arc::clone(inner),
                resource: Some(resource),
            });
        }
    }

    /// Acquire a connection, run `sql` and release the connection on every path
    pub async fn exec(&self, sql: &str, cancel: &CancellationToken) -> Result<Vec<ResultSet>> {
        let mut guard = self.acquire(cancel).await?;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled.into()),
            result = guard.simple_query(sql) => result,
        };
        guard.release();
        result
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            acquired_conns: state.acquired,
            idle_conns: state.idle.len(),
            constructing_conns: state.constructing,
            total_conns: state.total,
            max_conns: self.inner.config.max_conns,
            acquire_count: state.acquire_count,
            empty_acquire_count: state.empty_acquire_count,
        }
    }

    /// Close the pool
    ///
    /// Stops the health check, closes idle connections and waits until every
    /// acquired connection has been returned and closed. Calling it again
    /// only waits for the same condition.
    pub async fn close(&self) {
        let inner = &self.inner;
        let idle = {
            let mut state = inner.state.lock();
            let first = !state.closed;
            state.closed = true;
            let idle: Vec<Resource> = state.idle.drain(..).collect();
            state.total -= idle.len();
            if first {
                info!(pool = %inner.name, acquired = state.acquired, "closing connection pool");
            }
            idle
        };

        inner.shutdown.cancel();
        inner.changed.notify_waiters();

        for resource in idle {
            inner.spawn_close(resource.conn);
        }

        loop {
            let changed = inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let state = inner.state.lock();
                if state.acquired == 0 && state.constructing == 0 {
                    break;
                }
            }
            changed.await;
        }

        inner.closers.close();
        inner.closers.wait().await;
    }
}

/// A reserved construction slot
///
/// Gives the slot back when dropped before [`ConstructionSlot::fill`], which
/// covers connect failures as well as an acquire future dropped mid-connect.
struct ConstructionSlot<'a> {
    pool: &'a PoolInner,
    filled: bool,
}

impl<'a> ConstructionSlot<'a> {
    fn new(pool: &'a PoolInner) -> Self {
        Self {
            pool,
            filled: false,
        }
    }

    /// The connection arrived; the caller now owns the slot's accounting
    fn fill(mut self) {
        self.filled = true;
    }
}

impl Drop for ConstructionSlot<'_> {
    fn drop(&mut self) {
        if self.filled {
            return;
        }
        {
            let mut state = self.pool.state.lock();
            state.constructing -= 1;
            state.total -= 1;
        }
        self.pool.changed.notify_waiters();
    }
}

impl PoolInner {
    /// Open a connection, bounded by `create_timeout`
    async fn open_connection(&self) -> Result<Box<dyn ShardConnection>> {
        match tokio::time::timeout(self.config.create_timeout, self.connector.connect()).await {
            Ok(conn) => conn,
            Err(_) => Err(ProxyError::Backend(format!(
                "timed out opening connection for pool {}",
                self.name
            ))),
        }
    }

    fn release(self: &Arc<Self>, resource: Resource) {
        let conn = resource.conn.as_ref();
        if conn.is_closed()
            || conn.is_busy()
            || conn.transaction_status() != TransactionStatus::Idle
            || resource.is_expired(&self.config)
        {
            self.destroy_acquired(resource);
            return;
        }

        if let Some(check) = self.config.after_release.clone() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = Arc::clone(self);
                handle.spawn(async move {
                    if check(resource.conn.as_ref()) {
                        pool.return_idle(resource);
                    } else {
                        debug!(pool = %pool.name, "after_release rejected connection");
                        pool.destroy_acquired(resource);
                    }
                });
                return;
            }
            if !check(resource.conn.as_ref()) {
                self.destroy_acquired(resource);
                return;
            }
        }

        self.return_idle(resource);
    }

    fn return_idle(&self, mut resource: Resource) {
        resource.last_used = Instant::now();
        let rejected = {
            let mut state = self.state.lock();
            state.acquired -= 1;
            if state.closed {
                state.total -= 1;
                Some(resource)
            } else {
                state.idle.push_back(resource);
                None
            }
        };
        if let Some(resource) = rejected {
            self.spawn_close(resource.conn);
        }
        self.changed.notify_waiters();
    }

    fn destroy_acquired(&self, resource: Resource) {
        {
            let mut state = self.state.lock();
            state.acquired -= 1;
            state.total -= 1;
        }
        debug!(pool = %self.name, "destroying connection");
        self.spawn_close(resource.conn);
        self.changed.notify_waiters();
    }

    fn spawn_close(&self, conn: Box<dyn ShardConnection>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let grace = self.config.close_grace_period;
        let name = self.name.clone();
        self.closers.spawn_on(
            async move {
                match tokio::time::timeout(grace, conn.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(pool = %name, error = %e, "error closing connection"),
                    Err(_) => warn!(pool = %name, "connection close timed out"),
                }
            },
            &handle,
        );
    }

    /// Destroy idle connections past their lifetime or idle time
    fn check_idle_health(&self) {
        let stale = {
            let mut state = self.state.lock();
            let (stale, keep): (Vec<Resource>, Vec<Resource>) = state
                .idle
                .drain(..)
                .partition(|r| r.is_expired(&self.config) || r.is_idle_too_long(&self.config));
            state.idle.extend(keep);
            state.total -= stale.len();
            stale
        };

        if !stale.is_empty() {
            debug!(pool = %self.name, count = stale.len(), "retiring stale idle connections");
            for resource in stale {
                self.spawn_close(resource.conn);
            }
            self.changed.notify_waiters();
        }
    }

    /// Open connections until `min_conns` is reached again
    fn check_min_conns(self: &Arc<Self>) {
        let missing = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let missing = self.config.min_conns.saturating_sub(state.total);
            state.total += missing;
            state.constructing += missing;
            missing
        };

        for _ in 0..missing {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.create_idle().await });
        }
    }

    async fn create_idle(self: Arc<Self>) {
        let conn = match self.open_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(pool = %self.name, error = %e, "failed to open connection");
                None
            }
        };

        let rejected = {
            let mut state = self.state.lock();
            state.constructing -= 1;
            match conn {
                Some(conn) if !state.closed => {
                    state.idle.push_back(Resource::new(conn));
                    None
                }
                other => {
                    state.total -= 1;
                    other
                }
            }
        };
        if let Some(conn) = rejected {
            self.spawn_close(conn);
        }
        self.changed.notify_waiters();
    }
}

async fn background_health_check(pool: Weak<PoolInner>) {
    let (period, shutdown) = match pool.upgrade() {
        Some(inner) => (inner.config.health_check_period, inner.shutdown.clone()),
        None => return,
    };

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else {
            return;
        };
        inner.check_idle_health();
        inner.check_min_conns();
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired_conns: usize,
    pub idle_conns: usize,
    pub constructing_conns: usize,
    pub total_conns: usize,
    pub max_conns: usize,
    pub acquire_count: u64,
    pub empty_acquire_count: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} acquired, {} idle, max {}, {} acquires ({} empty)",
            self.acquired_conns,
            self.total_conns,
            self.idle_conns,
            self.max_conns,
            self.acquire_count,
            self.empty_acquire_count
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool on [`PoolGuard::release`] or when
/// dropped, whichever comes first.
pub struct PoolGuard {
    pool: Arc<PoolInner>,
    resource: Option<Resource>,
}

impl PoolGuard {
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
        match self.resource.as_mut() {
            Some(resource) => resource.conn.simple_query(sql).await,
            None => Err(PoolError::Released.into()),
        }
    }

    /// Return the connection to the pool. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("pool", &self.pool.name)
            .field("released", &self.resource.is_none())
            .finish()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct MockConnection {
        closed: Arc<AtomicBool>,
        busy: bool,
        status: TransactionStatus,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ShardConnection for MockConnection {
        async fn simple_query(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
            self.busy = true;
            if sql == "SELECT pg_sleep(10)" {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            match sql {
                "BEGIN" => self.status = TransactionStatus::InTransaction,
                "COMMIT" => self.status = TransactionStatus::Idle,
                _ => {}
            }
            self.busy = false;
            Ok(vec![ResultSet::command(1)])
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn is_busy(&self) -> bool {
            self.busy
        }

        fn transaction_status(&self) -> TransactionStatus {
            self.status
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct MockConnector {
        opened: AtomicUsize,
        closes: Arc<AtomicUsize>,
        last_closed_flag: Mutex<Option<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Box<dyn ShardConnection>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            *self.last_closed_flag.lock() = Some(Arc::clone(&closed));
            Ok(Box::new(MockConnection {
                closed,
                busy: false,
                status: TransactionStatus::Idle,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn lazy_config() -> PoolConfig {
        PoolConfig::new().max_conns(5).lazy_connect(true)
    }

    async fn pool_with(config: PoolConfig) -> (ConnectionPool, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let pool = ConnectionPool::connect("test", config, connector.clone())
            .await
            .unwrap();
        (pool, connector)
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let (pool, connector) = pool_with(PoolConfig::new().max_conns(5)).await;
        let stats = pool.stats();

        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(stats.total_conns, 1);
        assert_eq!(stats.idle_conns, 1);
        assert_eq!(stats.max_conns, 5);
    }

    #[tokio::test]
    async fn test_lazy_pool_opens_nothing() {
        let (pool, connector) = pool_with(lazy_config()).await;

        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().total_conns, 0);
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let (pool, _) = pool_with(lazy_config()).await;

        {
            let _conn = pool.acquire(&CancellationToken::new()).await.unwrap();
            let stats = pool.stats();
            assert_eq!(stats.acquired_conns, 1);
            assert_eq!(stats.idle_conns, 0);
        }

        let stats = pool.stats();
        assert_eq!(stats.acquired_conns, 0);
        assert_eq!(stats.idle_conns, 1);
        assert_eq!(stats.total_conns, 1);
    }

    #[tokio::test]
    async fn test_release_twice_is_noop() {
        let (pool, _) = pool_with(lazy_config()).await;

        let mut conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        conn.release();
        conn.release();
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.idle_conns, 1);
        assert_eq!(stats.total_conns, 1);
        assert_eq!(stats.acquired_conns, 0);
    }

    #[tokio::test]
    async fn test_released_guard_rejects_queries() {
        let (pool, _) = pool_with(lazy_config()).await;

        let mut conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        conn.release();
        let err = conn.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, ProxyError::Pool(PoolError::Released)));
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_waiting() {
        let (pool, _) = pool_with(lazy_config().max_conns(1)).await;
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, ProxyError::Pool(PoolError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_acquire_with_cancelled_token_returns_immediately() {
        let (pool, connector) = pool_with(lazy_config()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, ProxyError::Pool(PoolError::Cancelled)));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_waiter_receives_released_connection() {
        let (pool, connector) = pool_with(lazy_config().max_conns(1)).await;
        let held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool
                .acquire(&CancellationToken::new())
                .await
                .map(|_| ())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conn_release_checks_max_conn_lifetime() {
        let (pool, _) =
            pool_with(lazy_config().max_conn_lifetime(Duration::from_millis(250))).await;

        let mut conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        conn.release();

        let stats = pool.stats();
        assert_eq!(stats.total_conns, 0);
        assert_eq!(stats.idle_conns, 0);
    }

    #[tokio::test]
    async fn test_conn_release_destroys_closed_conn() {
        let (pool, connector) = pool_with(lazy_config()).await;

        let conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        let flag = connector.last_closed_flag.lock().clone().unwrap();
        flag.store(true, Ordering::SeqCst);
        drop(conn);

        assert_eq!(pool.stats().total_conns, 0);
    }

    #[tokio::test]
    async fn test_conn_release_destroys_conn_in_transaction() {
        let (pool, _) = pool_with(lazy_config()).await;

        let mut conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        conn.simple_query("BEGIN").await.unwrap();
        conn.release();

        assert_eq!(pool.stats().total_conns, 0);
    }

    #[tokio::test]
    async fn test_pool_background_checks_min_conns() {
        let config = lazy_config()
            .min_conns(2)
            .health_check_period(Duration::from_millis(50));
        let (pool, connector) = pool_with(config).await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = pool.stats();
        assert_eq!(stats.total_conns, 2);
        assert_eq!(stats.idle_conns, 2);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_background_checks_max_conn_idle_time() {
        let config = lazy_config()
            .max_conn_idle_time(Duration::from_millis(50))
            .health_check_period(Duration::from_millis(50));
        let (pool, connector) = pool_with(config).await;

        drop(pool.acquire(&CancellationToken::new()).await.unwrap());
        assert_eq!(pool.stats().idle_conns, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(pool.stats().total_conns, 0);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_before_acquire() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let config = PoolConfig::new()
            .max_conns(5)
            .before_acquire(move |_| seen.fetch_add(1, Ordering::SeqCst) > 0);
        let (pool, connector) = pool_with(config).await;

        // The eager connection consumed the rejecting call.
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total_conns, 1);

        let _conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().acquired_conns, 1);
    }

    #[tokio::test]
    async fn test_pool_after_release() {
        let config = lazy_config().after_release(|_| false);
        let (pool, connector) = pool_with(config).await;

        drop(pool.acquire(&CancellationToken::new()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.stats().total_conns, 0);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_exec() {
        let (pool, _) = pool_with(lazy_config()).await;

        let results = pool
            .exec("DELETE FROM orders WHERE id = 1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results, vec![ResultSet::command(1)]);
        let stats = pool.stats();
        assert_eq!(stats.acquired_conns, 0);
        assert_eq!(stats.idle_conns, 1);
    }

    #[tokio::test]
    async fn test_pool_exec_cancelled_destroys_busy_conn() {
        let (pool, _) = pool_with(lazy_config()).await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = pool.exec("SELECT pg_sleep(10)", &cancel).await.unwrap_err();
        assert!(matches!(err, ProxyError::Pool(PoolError::Cancelled)));
        assert_eq!(pool.stats().total_conns, 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_acquired_connections() {
        let (pool, connector) = pool_with(lazy_config()).await;
        let idle = pool.acquire(&CancellationToken::new()).await.unwrap();
        let held = pool.acquire(&CancellationToken::new()).await.unwrap();
        drop(idle);

        let closing_pool = pool.clone();
        let closing = tokio::spawn(async move { closing_pool.close().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.stats().total_conns, 0);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);

        // Second close is a no-op.
        pool.close().await;

        let err = pool.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Pool(PoolError::Closed)));
    }

    #[derive(Debug)]
    struct SlowConnector {
        delay: Duration,
        inner: MockConnector,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(&self) -> Result<Box<dyn ShardConnection>> {
            tokio::time::sleep(self.delay).await;
            self.inner.connect().await
        }
    }

    async fn slow_pool(config: PoolConfig, delay: Duration) -> ConnectionPool {
        let connector = Arc::new(SlowConnector {
            delay,
            inner: MockConnector::default(),
        });
        ConnectionPool::connect("slow", config, connector)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dropped_acquire_gives_back_construction_slot() {
        let pool = slow_pool(
            PoolConfig::new().max_conns(1).lazy_connect(true),
            Duration::from_millis(200),
        )
        .await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), pool.acquire(&CancellationToken::new()))
                .await;
        assert!(abandoned.is_err());

        let stats = pool.stats();
        assert_eq!(stats.constructing_conns, 0);
        assert_eq!(stats.total_conns, 0);

        let guard = tokio::time::timeout(
            Duration::from_secs(1),
            pool.acquire(&CancellationToken::new()),
        )
        .await
        .expect("slot should be free again")
        .unwrap();
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), pool.close())
            .await
            .expect("close should not hang");
        assert_eq!(pool.stats().total_conns, 0);
    }

    #[tokio::test]
    async fn test_acquire_connect_is_bounded_by_create_timeout() {
        let pool = slow_pool(
            PoolConfig::new()
                .max_conns(1)
                .lazy_connect(true)
                .create_timeout(Duration::from_millis(20)),
            Duration::from_secs(5),
        )
        .await;

        let err = pool.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Backend(_)));
        assert_eq!(pool.stats().total_conns, 0);

        tokio::time::timeout(Duration::from_secs(1), pool.close())
            .await
            .expect("close should not hang");
    }
}
