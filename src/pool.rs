//! Connection pooling for backend compute servers.
//!
//! [`ConnectionPool`] owns one slot per configured endpoint. A slot lives
//! in exactly one place at any instant: the idle deque, the active map
//! (keyed by the borrowed connection), or in flight inside an `acquire`
//! call. Connections are opened lazily on first acquire and cached in the
//! slot across borrows.
//!
//! # Queue discipline
//!
//! Three insertion policies, each load-bearing under intermittent backend
//! failure:
//!
//! - first enrollment appends to the tail,
//! - a released connection goes to the head, so hot connections stay hot,
//! - a slot whose open failed rotates to the tail, so a flaky backend
//!   cannot monopolise the head.
//!
//! A slot accumulating `failure_budget` consecutive failed opens is
//! permanently removed; when the last slot goes, the pool closes itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reservoir::config::{PoolConfig, ServerConfig};
//! use reservoir::engine::qap::QapConnector;
//! use reservoir::pool::ConnectionPool;
//!
//! #[tokio::main]
//! async fn main() -> reservoir::error::Result<()> {
//!     let config = PoolConfig::single_server(ServerConfig::new("localhost"));
//!     let pool = ConnectionPool::open(config, Arc::new(QapConnector::new())).await;
//!
//!     let conn = pool.acquire().await?;
//!     let value = conn.eval("R.version.string").await?;
//!     println!("{:?}", value);
//!     pool.release(conn)?;
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OnceCell};

use crate::config::PoolConfig;
use crate::driver;
use crate::endpoint::ServerEndpoint;
use crate::engine::qap::QapConnector;
use crate::engine::{Connector, EngineConnection};
use crate::error::{Error, Result};
use crate::metrics;

/// A connection borrowed from the pool.
///
/// This is a shared handle onto the slot's live engine connection;
/// [`Deref`] exposes the engine operations directly. Handles compare
/// equal when they refer to the same underlying connection.
///
/// The borrower must hand the connection back through
/// [`ConnectionPool::release`] or [`ConnectionPool::invalidate`] and must
/// not close it directly; a handle closed behind the pool's back is
/// detected and replaced on the next acquire.
#[derive(Clone)]
pub struct PooledConnection {
    id: u64,
    endpoint: ServerEndpoint,
    engine: Arc<dyn EngineConnection>,
}

impl PooledConnection {
    /// The endpoint this connection is attached to.
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// The engine handle itself.
    pub fn engine(&self) -> &Arc<dyn EngineConnection> {
        &self.engine
    }
}

impl Deref for PooledConnection {
    type Target = dyn EngineConnection;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl PartialEq for PooledConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PooledConnection {}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.engine.is_connected())
            .finish()
    }
}

/// Per-endpoint bookkeeping record.
struct EndpointSlot {
    endpoint: ServerEndpoint,
    /// Cached live connection; `None` before the first open and after a
    /// failed probe.
    live: Option<PooledConnection>,
    /// Consecutive failed opens; reset by a successful acquire.
    failures: u32,
    /// The pool spawned this backend and owes it a shutdown on close.
    embedded: bool,
}

struct PoolState {
    idle: VecDeque<EndpointSlot>,
    active: HashMap<u64, EndpointSlot>,
    total: usize,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Serializes configure, close, and reopen.
    maintenance: tokio::sync::Mutex<()>,
    exit_handler_installed: AtomicBool,
}

/// A bounded pool of connections to backend compute servers.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

static INSTANCE: OnceCell<ConnectionPool> = OnceCell::const_new();

impl ConnectionPool {
    /// Build a pool from a configuration and a connector.
    ///
    /// Embedded entries have their server process launched and probed
    /// before enrollment. A pool that enrolls zero slots is constructed
    /// already closed; every subsequent operation fails with
    /// [`Error::PoolClosed`].
    pub async fn open(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: HashMap::new(),
                    total: 0,
                }),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                maintenance: tokio::sync::Mutex::new(()),
                exit_handler_installed: AtomicBool::new(false),
            }),
        };
        pool.configure().await;
        pool
    }

    /// The shared pool, configured on first use from the document located
    /// by [`PoolConfig::resolve`] and connected with the QAP1 client.
    ///
    /// The first caller constructs the pool; later callers get the same
    /// instance. A process-exit handler closing the pool is installed on
    /// construction.
    pub async fn instance() -> &'static ConnectionPool {
        INSTANCE
            .get_or_init(|| async {
                let config = PoolConfig::resolve().unwrap_or_else(|e| {
                    tracing::error!(error = %e, "Cannot resolve pool configuration");
                    PoolConfig::default()
                });
                Self::bootstrap(config).await
            })
            .await
    }

    /// The shared pool, configured with `config` if — and only if — no
    /// shared pool exists yet.
    ///
    /// On any later call the argument is silently ignored and the
    /// existing pool is returned; this mirrors the historical "first
    /// wins" contract. Code that needs a pool with a known configuration
    /// should construct one explicitly with [`ConnectionPool::open`].
    pub async fn instance_with(config: PoolConfig) -> &'static ConnectionPool {
        INSTANCE
            .get_or_init(|| async { Self::bootstrap(config).await })
            .await
    }

    async fn bootstrap(config: PoolConfig) -> ConnectionPool {
        let pool = Self::open(config, Arc::new(QapConnector::new())).await;
        pool.install_exit_handler();
        pool
    }

    /// Spawn a task that closes the pool when the process receives a
    /// termination signal. Installing twice is a no-op, and the handler
    /// is harmless after an explicit close.
    pub fn install_exit_handler(&self) {
        if self
            .inner
            .exit_handler_installed
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Termination signal received, closing connection pool");
                pool.close().await;
            }
        });
    }

    /// Enroll slots from the retained configuration.
    async fn configure(&self) {
        let _guard = self.inner.maintenance.lock().await;

        for server in &self.inner.config.servers {
            let endpoint = match server.endpoint() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::error!(error = %e, "Skipping invalid server entry");
                    continue;
                }
            };

            if server.embedded {
                metrics::EMBEDDED_STARTUPS.inc();
                match driver::startup(&endpoint, &server.command).await {
                    // The exit handle is deliberately dropped; the log
                    // pump tasks keep running with the child.
                    Ok(_exit) => {}
                    Err(e) => {
                        tracing::error!(endpoint = %endpoint, error = %e,
                            "Cannot launch embedded server, skipping");
                        continue;
                    }
                }
                if let Err(e) =
                    driver::wait_until_up(self.inner.connector.as_ref(), &endpoint).await
                {
                    tracing::error!(endpoint = %endpoint, error = %e,
                        "Embedded server never came up, skipping");
                    continue;
                }
            }

            tracing::info!(endpoint = %endpoint, embedded = server.embedded, "Enrolling server");
            let mut state = self.inner.state.lock().unwrap();
            state.idle.push_back(EndpointSlot {
                endpoint,
                live: None,
                failures: 0,
                embedded: server.embedded,
            });
            state.total += 1;
            metrics::POOL_SLOTS.set(state.total as i64);
        }

        let total = self.inner.state.lock().unwrap().total;
        if total == 0 {
            tracing::error!("No servers enrolled, pool is closed");
            self.inner.closed.store(true, Ordering::SeqCst);
        } else {
            self.inner.notify.notify_waiters();
        }
    }

    /// Borrow a connection, waiting as long as it takes for a slot to
    /// become available.
    ///
    /// # Errors
    /// [`Error::PoolClosed`] once the pool closes; [`Error::Connect`] (or
    /// the underlying transport error) when a slot exhausts its failure
    /// budget.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            let slot = self.inner.state.lock().unwrap().idle.pop_front();
            let Some(slot) = slot else {
                self.inner.notify.notified().await;
                continue;
            };

            let mut guard = SlotGuard {
                inner: &self.inner,
                slot: Some(slot),
            };

            match self.lease(guard.slot_mut()).await {
                Ok(connection) => {
                    let mut slot = guard.take();
                    slot.failures = 0;
                    slot.live = Some(connection.clone());

                    let closed_during_lease = {
                        let mut state = self.inner.state.lock().unwrap();
                        if self.is_closed() {
                            true
                        } else {
                            state.active.insert(connection.id, slot);
                            metrics::BORROWED_CONNECTIONS.set(state.active.len() as i64);
                            false
                        }
                    };

                    if closed_during_lease {
                        // The close pass never saw this in-flight slot;
                        // its handle is ours to clean up.
                        let _ = connection.engine.close().await;
                        return Err(Error::PoolClosed);
                    }

                    return Ok(connection);
                }
                Err(e) => {
                    let mut slot = guard.take();
                    slot.failures += 1;
                    slot.live = None;

                    if slot.failures >= self.inner.config.failure_budget {
                        tracing::warn!(endpoint = %slot.endpoint, failures = slot.failures,
                            "Failure budget exhausted, removing slot");
                        metrics::ACQUISITIONS.with_label_values(&["failed"]).inc();
                        self.discard_slot(slot).await;
                        return Err(e);
                    }

                    tracing::debug!(endpoint = %slot.endpoint, failures = slot.failures,
                        error = %e, "Open failed, rotating slot to the tail");
                    metrics::ACQUISITIONS.with_label_values(&["retried"]).inc();
                    let mut state = self.inner.state.lock().unwrap();
                    if !self.is_closed() {
                        state.idle.push_back(slot);
                        drop(state);
                        self.inner.notify.notify_one();
                    }
                }
            }
        }
    }

    /// Borrow a connection, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the wait expires without a slot becoming
    /// available. Errors are as for [`ConnectionPool::acquire`].
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Option<PooledConnection>> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                metrics::ACQUISITIONS.with_label_values(&["timeout"]).inc();
                Ok(None)
            }
        }
    }

    /// Obtain a usable connection for the slot: reuse the cached handle
    /// when it is still connected, otherwise open a fresh one.
    async fn lease(&self, slot: &mut EndpointSlot) -> Result<PooledConnection> {
        if let Some(cached) = &slot.live {
            if cached.is_connected() {
                metrics::ACQUISITIONS.with_label_values(&["reused"]).inc();
                return Ok(cached.clone());
            }
            tracing::debug!(endpoint = %slot.endpoint, "Cached connection went stale, reopening");
            let stale = slot.live.take().expect("checked above");
            let _ = stale.engine.close().await;
        }

        let engine = driver::open(self.inner.connector.as_ref(), &slot.endpoint).await?;
        metrics::ACQUISITIONS.with_label_values(&["opened"]).inc();
        Ok(PooledConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            endpoint: slot.endpoint.clone(),
            engine,
        })
    }

    /// Return a borrowed connection to the pool.
    ///
    /// The connection is not closed; its slot goes to the head of the
    /// idle deque so the warm connection is the next one handed out.
    ///
    /// # Errors
    /// [`Error::PoolClosed`] after close; [`Error::NotOwned`] when the
    /// connection is not currently checked out from this pool.
    pub fn release(&self, connection: PooledConnection) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }
            let Some(slot) = state.active.remove(&connection.id) else {
                return Err(Error::NotOwned);
            };
            state.idle.push_front(slot);
            metrics::BORROWED_CONNECTIONS.set(state.active.len() as i64);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Remove a borrowed connection from the pool permanently, closing
    /// its handle. When the last slot goes, the pool closes.
    ///
    /// # Errors
    /// [`Error::PoolClosed`] after close; [`Error::NotOwned`] when the
    /// connection is not currently checked out from this pool.
    pub async fn invalidate(&self, connection: PooledConnection) -> Result<()> {
        let slot = {
            let mut state = self.inner.state.lock().unwrap();
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }
            let Some(slot) = state.active.remove(&connection.id) else {
                return Err(Error::NotOwned);
            };
            metrics::BORROWED_CONNECTIONS.set(state.active.len() as i64);
            slot
        };

        tracing::info!(endpoint = %slot.endpoint, "Invalidating connection");
        metrics::INVALIDATED_SLOTS.inc();
        let _ = connection.engine.close().await;
        self.discard_slot(slot).await;
        Ok(())
    }

    /// Drop a slot from the accounting; closes the pool when it was the
    /// last one.
    async fn discard_slot(&self, slot: EndpointSlot) {
        if let Some(live) = &slot.live {
            let _ = live.engine.close().await;
        }
        drop(slot);

        let total = {
            let mut state = self.inner.state.lock().unwrap();
            state.total = state.total.saturating_sub(1);
            metrics::POOL_SLOTS.set(state.total as i64);
            state.total
        };
        if total == 0 {
            tracing::warn!("Last slot removed, closing pool");
            self.close().await;
        }
    }

    /// Close the pool: drain both containers, close every live handle,
    /// and send a shutdown command to every embedded backend. Idempotent;
    /// errors during cleanup are logged and swallowed.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing connection pool");

        let _guard = self.inner.maintenance.lock().await;
        let slots: Vec<EndpointSlot> = {
            let mut state = self.inner.state.lock().unwrap();
            state.total = 0;
            let mut slots: Vec<EndpointSlot> = state.idle.drain(..).collect();
            slots.extend(state.active.drain().map(|(_, slot)| slot));
            slots
        };

        for slot in slots {
            if let Some(live) = &slot.live {
                let _ = live.engine.close().await;
            }
            if slot.embedded {
                if let Err(e) =
                    driver::shutdown_server(self.inner.connector.as_ref(), &slot.endpoint).await
                {
                    tracing::warn!(endpoint = %slot.endpoint, error = %e,
                        "Could not shut down embedded server");
                }
            }
        }

        metrics::POOL_SLOTS.set(0);
        metrics::BORROWED_CONNECTIONS.set(0);
        self.inner.notify.notify_waiters();
    }

    /// Close the pool and rebuild it from the original configuration.
    ///
    /// # Errors
    /// [`Error::Config`] when the retained configuration enrolls no
    /// slots.
    pub async fn reopen(&self) -> Result<()> {
        self.close().await;
        self.inner.closed.store(false, Ordering::SeqCst);
        self.configure().await;
        if self.is_closed() {
            return Err(Error::Config(
                "configuration enrolls no servers".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of slots currently enrolled (idle + borrowed).
    pub fn total(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }

    /// Number of connections currently borrowed.
    pub fn active(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    /// Number of slots available for borrowing right now.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ConnectionPool")
            .field("total", &state.total)
            .field("idle", &state.idle.len())
            .field("active", &state.active.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Keeps an in-flight slot from being lost if the acquiring future is
/// dropped between dequeue and hand-off.
struct SlotGuard<'a> {
    inner: &'a PoolInner,
    slot: Option<EndpointSlot>,
}

impl SlotGuard<'_> {
    fn slot_mut(&mut self) -> &mut EndpointSlot {
        self.slot.as_mut().expect("slot taken")
    }

    fn take(&mut self) -> EndpointSlot {
        self.slot.take().expect("slot taken")
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let mut state = self.inner.state.lock().unwrap();
            if !self.inner.closed.load(Ordering::SeqCst) {
                state.idle.push_back(slot);
                drop(state);
                self.inner.notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::mock::MockConnector;
    use crate::engine::RValue;

    fn single_server_config() -> PoolConfig {
        PoolConfig::single_server(ServerConfig::new("localhost"))
    }

    fn two_server_config() -> PoolConfig {
        PoolConfig {
            servers: vec![ServerConfig::new("stats-01"), ServerConfig::new("stats-02")],
            ..PoolConfig::default()
        }
    }

    async fn mock_pool(config: PoolConfig) -> (ConnectionPool, MockConnector) {
        let connector = MockConnector::new();
        let pool = ConnectionPool::open(config, Arc::new(connector.clone())).await;
        (pool, connector)
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[tokio::test]
    async fn test_construction_counts() {
        let (pool, _) = mock_pool(single_server_config()).await;
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.active(), 0);
        assert!(!pool.is_closed());
    }

    #[tokio::test]
    async fn test_empty_configuration_closes_pool() {
        let (pool, _) = mock_pool(PoolConfig::default()).await;
        assert!(pool.is_closed());
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.acquire().await.unwrap_err(), Error::PoolClosed);
    }

    #[tokio::test]
    async fn test_invalid_entries_are_skipped() {
        let config = PoolConfig {
            servers: vec![ServerConfig::new("  "), ServerConfig::new("stats-01")],
            ..PoolConfig::default()
        };
        let (pool, _) = mock_pool(config).await;
        assert_eq!(pool.total(), 1);
        assert!(!pool.is_closed());
    }

    // ========================================================================
    // Acquire / release
    // ========================================================================

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (pool, connector) = mock_pool(single_server_config()).await;

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!((pool.total(), pool.idle(), pool.active()), (1, 0, 1));

        pool.release(conn).unwrap();
        assert_eq!((pool.total(), pool.idle(), pool.active()), (1, 1, 0));

        // The cached connection is reused, not reopened.
        let again = pool.acquire().await.unwrap();
        assert!(again.is_connected());
        assert_eq!(connector.connections().len(), 1);
        pool.release(again).unwrap();
    }

    #[tokio::test]
    async fn test_release_does_not_close() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();
        let watcher = conn.clone();
        pool.release(conn).unwrap();
        assert!(watcher.is_connected());
    }

    #[tokio::test]
    async fn test_timed_acquire_returns_none_when_exhausted() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        let second = pool
            .acquire_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(second.is_none());

        pool.release(conn).unwrap();
        let third = pool
            .acquire_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_blocked_acquire_wakes_on_release() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(conn).unwrap();
        let conn = waiter.await.unwrap().unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_stale_cached_connection_is_replaced() {
        let (pool, connector) = mock_pool(single_server_config()).await;

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).unwrap();

        // Kill the cached transport behind the pool's back.
        connector.connections()[0].drop_transport();

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(connector.connections().len(), 2);
        pool.release(conn).unwrap();
    }

    #[tokio::test]
    async fn test_connection_state_shared_through_handle() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        conn.assign("x", &RValue::Num(1.5)).await.unwrap();
        assert_eq!(conn.eval("x").await.unwrap(), RValue::Num(1.5));
        pool.release(conn).unwrap();
    }

    // ========================================================================
    // Ownership discipline
    // ========================================================================

    #[tokio::test]
    async fn test_double_release_is_not_owned() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();
        let duplicate = conn.clone();

        pool.release(conn).unwrap();
        assert_eq!(pool.release(duplicate).unwrap_err(), Error::NotOwned);
    }

    #[tokio::test]
    async fn test_foreign_connection_is_not_owned() {
        let (pool_a, _) = mock_pool(single_server_config()).await;
        let (pool_b, _) = mock_pool(single_server_config()).await;

        let conn = pool_a.acquire().await.unwrap();
        assert_eq!(pool_b.release(conn.clone()).unwrap_err(), Error::NotOwned);
        assert_eq!(
            pool_b.invalidate(conn.clone()).await.unwrap_err(),
            Error::NotOwned
        );
        pool_a.release(conn).unwrap();
    }

    // ========================================================================
    // Invalidate
    // ========================================================================

    #[tokio::test]
    async fn test_invalidate_last_slot_closes_pool() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        pool.invalidate(conn).await.unwrap();
        assert_eq!((pool.total(), pool.idle(), pool.active()), (0, 0, 0));
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_invalidate_with_remaining_slots_keeps_pool_open() {
        let (pool, _) = mock_pool(two_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        pool.invalidate(conn).await.unwrap();
        assert_eq!(pool.total(), 1);
        assert!(!pool.is_closed());
    }

    #[tokio::test]
    async fn test_invalidate_closes_the_handle() {
        let (pool, connector) = mock_pool(two_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        pool.invalidate(conn).await.unwrap();
        assert!(!connector.connections()[0].is_connected());
    }

    // ========================================================================
    // Failure budget and rotation
    // ========================================================================

    #[tokio::test]
    async fn test_failure_budget_demotes_slot() {
        let (pool, connector) = mock_pool(single_server_config()).await;
        connector.fail_next_connects(3);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        // Demoting the only slot closed the pool.
        assert_eq!(pool.total(), 0);
        assert!(pool.is_closed());
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_rotates_and_recovers() {
        let (pool, connector) = mock_pool(two_server_config()).await;
        connector.fail_next_connects(1);

        // First slot fails once and rotates to the tail; the second slot
        // serves the acquire.
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.endpoint().host(), "stats-02");
        assert_eq!(pool.total(), 2);
        pool.release(conn).unwrap();
    }

    #[tokio::test]
    async fn test_failure_budget_is_configurable() {
        let config = PoolConfig {
            failure_budget: 1,
            ..single_server_config()
        };
        let (pool, connector) = mock_pool(config).await;
        connector.fail_next_connects(1);

        assert!(pool.acquire().await.is_err());
        assert!(pool.is_closed());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let config = PoolConfig {
            failure_budget: 2,
            ..single_server_config()
        };
        let (pool, connector) = mock_pool(config).await;

        // One failure, then success: the counter must reset.
        connector.fail_next_connects(1);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).unwrap();

        // Cached connection dropped, plus one more failed open: still
        // under budget because the earlier success reset the counter.
        connector.connections().last().unwrap().drop_transport();
        connector.fail_next_connects(1);
        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_connected());
        pool.release(conn).unwrap();
    }

    // ========================================================================
    // Close / reopen
    // ========================================================================

    #[tokio::test]
    async fn test_close_empties_pool_and_fails_later_calls() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!((pool.total(), pool.idle(), pool.active()), (0, 0, 0));

        // The borrowed handle was closed underneath the borrower.
        assert!(!conn.is_connected());
        assert_eq!(pool.release(conn).unwrap_err(), Error::PoolClosed);
        assert_eq!(pool.acquire().await.unwrap_err(), Error::PoolClosed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (pool, _) = mock_pool(single_server_config()).await;
        pool.close().await;
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_acquirers() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await;
        assert_eq!(waiter.await.unwrap().unwrap_err(), Error::PoolClosed);
        drop(conn);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_from_configuration() {
        let (pool, _) = mock_pool(two_server_config()).await;
        pool.close().await;
        assert!(pool.is_closed());

        pool.reopen().await.unwrap();
        assert!(!pool.is_closed());
        assert_eq!(pool.total(), 2);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).unwrap();
    }

    #[tokio::test]
    async fn test_reopen_with_empty_configuration_fails() {
        let (pool, _) = mock_pool(PoolConfig::default()).await;
        assert!(matches!(pool.reopen().await, Err(Error::Config(_))));
        assert!(pool.is_closed());
    }

    // ========================================================================
    // Embedded backends
    // ========================================================================

    fn embedded_config() -> PoolConfig {
        let mut server = ServerConfig::new("localhost");
        server.embedded = true;
        // Exits immediately; the mock connector answers the probes.
        server.command = "echo Rserve-started".to_string();
        PoolConfig::single_server(server)
    }

    #[tokio::test]
    async fn test_embedded_backend_gets_exactly_one_shutdown_on_close() {
        let (pool, connector) = mock_pool(embedded_config()).await;
        assert_eq!(pool.total(), 1);

        pool.close().await;
        let shutdowns: usize = connector
            .connections()
            .iter()
            .map(|engine| engine.shutdown_count())
            .sum();
        assert_eq!(shutdowns, 1);
    }

    #[tokio::test]
    async fn test_non_embedded_backend_gets_no_shutdown_on_close() {
        let (pool, connector) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).unwrap();

        pool.close().await;
        let shutdowns: usize = connector
            .connections()
            .iter()
            .map(|engine| engine.shutdown_count())
            .sum();
        assert_eq!(shutdowns, 0);
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    #[tokio::test]
    async fn test_concurrent_borrowers_respect_bounds() {
        let config = PoolConfig {
            servers: (0..3)
                .map(|i| ServerConfig::new(format!("stats-{:02}", i)))
                .collect(),
            ..PoolConfig::default()
        };
        let (pool, _) = mock_pool(config).await;

        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let conn = pool.acquire().await.unwrap();
                    assert!(pool.active() <= 3);
                    assert!(pool.total() == 3);
                    tokio::task::yield_now().await;
                    pool.release(conn).unwrap();
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!((pool.total(), pool.idle(), pool.active()), (3, 3, 0));
    }

    #[tokio::test]
    async fn test_cancelled_timed_acquire_does_not_lose_slots() {
        let (pool, _) = mock_pool(single_server_config()).await;
        let conn = pool.acquire().await.unwrap();

        // Expire a few timed acquires while the slot is checked out.
        for _ in 0..3 {
            assert!(pool
                .acquire_timeout(Duration::from_millis(10))
                .await
                .unwrap()
                .is_none());
        }

        pool.release(conn).unwrap();
        assert_eq!(pool.idle(), 1);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).unwrap();
    }
}
