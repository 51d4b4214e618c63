use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tagrpc_common::protocol::error::{Result, RpcError};
use tagrpc_common::transport::Connection;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Interval between re-polls while waiting for a connection to come back.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Creates connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a new connection for the given pool key.
    async fn create(&self, key: &str) -> Result<Arc<Connection>>;

    /// Human readable target, used in logs.
    fn describe(&self) -> String;
}

/// Connection pool configuration.
///
/// # Fields
///
/// - `max_connections`: Maximum number of live connections per key
/// - `acquire_timeout_ms`: Maximum time in milliseconds to wait for a connection
///
/// # Default Configuration
///
/// - `max_connections`: 4
/// - `acquire_timeout_ms`: 30000 (30 seconds)
///
/// # Example
///
/// ```rust
/// use tagrpc_client::PoolConfig;
///
/// let config = PoolConfig {
///     max_connections: 8,
///     acquire_timeout_ms: 5000,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live connections per key
    pub max_connections: usize,
    /// Maximum time to wait for pool acquisition in milliseconds
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout_ms: 30000, // 30 seconds
        }
    }
}

#[derive(Default)]
struct SlotState {
    free: VecDeque<Arc<Connection>>,
    used: Vec<Arc<Connection>>,
    connecting: usize,
}

impl SlotState {
    fn live(&self) -> usize {
        self.free.len() + self.used.len() + self.connecting
    }
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    released: Notify,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a connection slot while a connection is being created. Dropping it
/// without [`Reservation::fill`] gives the slot back.
struct Reservation<'a> {
    slot: &'a Slot,
    armed: bool,
}

impl Reservation<'_> {
    fn fill(mut self, conn: &Arc<Connection>) {
        let mut state = self.slot.lock();
        state.connecting -= 1;
        state.used.push(Arc::clone(conn));
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.lock().connecting -= 1;
            self.slot.released.notify_waiters();
        }
    }
}

/// A connection borrowed with [`ConnectionPool::lease`].
///
/// Dropping the lease recycles the connection. If the exchange was not
/// marked [`complete`](Self::complete) first, for instance because the
/// caller's future was dropped mid-call, the connection is closed before
/// being handed back: a partial frame may be sitting on the socket.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Arc<Connection>,
    complete: bool,
}

impl PooledConnection<'_> {
    /// Marks the exchange as finished, so the connection may be reused.
    pub fn complete(&mut self) {
        self.complete = true;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Arc<Connection>;

    fn deref(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if !self.complete {
            tracing::debug!(
                pool = %self.pool.name,
                connection = %self.conn.name(),
                "closing connection of an interrupted call"
            );
            self.conn.close();
        }
        self.pool.recycle(Arc::clone(&self.conn));
    }
}

/// Pool of connections, grouped by purpose key.
///
/// Callers [`acquire`](Self::acquire) a connection for exclusive use and hand
/// it back with [`recycle`](Self::recycle). At most `max_connections`
/// connections are alive per key at any time, counting those being created.
///
/// # Architecture
///
/// - Each key has its own free queue and in-use list
/// - Free connections are reused most recently returned first
/// - Dead connections are dropped on acquire and closed on recycle
/// - Connections are created outside any lock
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tagrpc_client::{AddressListFactory, ConnectionPool, ConnectorConfig, PoolConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = AddressListFactory::new("localhost:4000", ConnectorConfig::default())?;
/// let pool = ConnectionPool::new("example", Arc::new(factory), PoolConfig::default());
///
/// let conn = pool.acquire("sync-tagrpc").await?;
/// // use the connection...
/// pool.recycle(conn);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Self {
        Self {
            name: name.into(),
            factory,
            config,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        Arc::clone(self.slots().entry(key.to_string()).or_default())
    }

    fn closed_error(&self) -> RpcError {
        RpcError::PoolClosed(self.name.clone())
    }

    /// Acquires a connection for exclusive use.
    ///
    /// This method implements the following strategy:
    ///
    /// 1. Take a free, open connection if there is one
    /// 2. If connections are in use, yield once and check again, since one
    ///    may be about to come back
    /// 3. If under `max_connections`, create a new connection
    /// 4. Otherwise wait for a connection to be recycled, until the acquire
    ///    timeout passes
    ///
    /// # Errors
    ///
    /// - `PoolClosed` if the pool is closed
    /// - `PoolTimeout` if no connection became available in time
    /// - Any error from the connection factory
    pub async fn acquire(&self, key: &str) -> Result<Arc<Connection>> {
        let slot = self.slot(key);
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        let mut yielded = false;

        let reservation = loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }
            let yield_first = {
                let mut state = slot.lock();
                while let Some(conn) = state.free.pop_back() {
                    if conn.is_closed() {
                        continue;
                    }
                    state.used.push(Arc::clone(&conn));
                    return Ok(conn);
                }
                if !state.used.is_empty() && !yielded {
                    true
                } else if state.live() < self.config.max_connections {
                    state.connecting += 1;
                    break Reservation {
                        slot: &slot,
                        armed: true,
                    };
                } else {
                    false
                }
            };

            if yield_first {
                yielded = true;
                tokio::task::yield_now().await;
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(pool = %self.name, key, "timed out waiting for a connection");
                return Err(RpcError::PoolTimeout(self.config.acquire_timeout_ms));
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, slot.released.notified()).await;
        };

        let conn = self.factory.create(key).await?;
        if self.is_closed() {
            conn.close();
            return Err(self.closed_error());
        }
        tracing::debug!(
            pool = %self.name,
            key,
            factory = %self.factory.describe(),
            "opened pooled connection"
        );
        reservation.fill(&conn);
        Ok(conn)
    }

    /// Acquires a connection wrapped in a guard that recycles it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub async fn lease(&self, key: &str) -> Result<PooledConnection<'_>> {
        let conn = self.acquire(key).await?;
        Ok(PooledConnection {
            pool: self,
            conn,
            complete: false,
        })
    }

    /// Returns a connection acquired from this pool.
    ///
    /// Closed connections, and any connection returned after the pool was
    /// closed, are closed instead of being kept. A connection this pool does
    /// not know is closed as well.
    pub fn recycle(&self, conn: Arc<Connection>) {
        let owner = self
            .slots()
            .values()
            .find(|slot| slot.lock().used.iter().any(|c| Arc::ptr_eq(c, &conn)))
            .cloned();
        let Some(slot) = owner else {
            tracing::debug!(pool = %self.name, connection = %conn.name(), "recycled foreign connection");
            conn.close();
            return;
        };

        let keep = {
            let mut state = slot.lock();
            state.used.retain(|c| !Arc::ptr_eq(c, &conn));
            if self.is_closed() || conn.is_closed() {
                false
            } else if state.free.len() < self.config.max_connections {
                state.free.push_back(Arc::clone(&conn));
                true
            } else {
                false
            }
        };
        if !keep {
            conn.close();
        }
        slot.released.notify_waiters();
    }

    /// Closes the pool and every connection it holds, free or in use.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        for slot in slots {
            let conns: Vec<Arc<Connection>> = {
                let mut state = slot.lock();
                let mut conns: Vec<_> = state.free.drain(..).collect();
                conns.append(&mut state.used);
                conns
            };
            for conn in conns {
                conn.close();
            }
            slot.released.notify_waiters();
        }
        tracing::debug!(pool = %self.name, "pool closed");
    }

    /// Connections of `key` currently handed out.
    pub fn in_use(&self, key: &str) -> usize {
        self.slot(key).lock().used.len()
    }

    /// Idle connections of `key` ready for reuse.
    pub fn idle(&self, key: &str) -> usize {
        self.slot(key).lock().free.len()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tagrpc_common::transport::ConnectionConfig;
    use tokio::net::TcpListener;

    /// Factory opening connections to a local listener that handshakes and
    /// then keeps every connection open.
    struct LoopbackFactory {
        addr: String,
        created: AtomicUsize,
    }

    impl LoopbackFactory {
        async fn start() -> Arc<Self> {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        if let Ok(conn) =
                            Connection::open(stream, "peer", &[], ConnectionConfig::default()).await
                        {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            conn.close();
                        }
                    });
                }
            });
            Arc::new(Self {
                addr,
                created: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectionFactory for LoopbackFactory {
        async fn create(&self, key: &str) -> Result<Arc<Connection>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Connection::connect(&self.addr, key, &[], ConnectionConfig::default()).await
        }

        fn describe(&self) -> String {
            self.addr.clone()
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl ConnectionFactory for FailingFactory {
        async fn create(&self, _key: &str) -> Result<Arc<Connection>> {
            Err(RpcError::Connect("refused".into()))
        }

        fn describe(&self) -> String {
            "nowhere".into()
        }
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout_ms, 30000);
    }

    #[tokio::test]
    async fn test_recycled_connection_is_reused() {
        let factory = LoopbackFactory::start().await;
        let pool = ConnectionPool::new("test", factory.clone(), PoolConfig::default());
        let first = pool.acquire("k").await.unwrap();
        assert_eq!(pool.in_use("k"), 1);
        pool.recycle(Arc::clone(&first));
        assert_eq!(pool.idle("k"), 1);

        let second = pool.acquire("k").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        pool.recycle(second);
    }

    #[tokio::test]
    async fn test_closed_connection_not_reused() {
        let factory = LoopbackFactory::start().await;
        let pool = ConnectionPool::new("test", factory.clone(), PoolConfig::default());
        let conn = pool.acquire("k").await.unwrap();
        conn.close();
        pool.recycle(Arc::clone(&conn));
        assert_eq!(pool.idle("k"), 0);

        let fresh = pool.acquire("k").await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keys_are_separate() {
        let factory = LoopbackFactory::start().await;
        let pool = ConnectionPool::new("test", factory, PoolConfig::default());
        let a = pool.acquire("sync").await.unwrap();
        pool.recycle(a);
        let b = pool.acquire("async").await.unwrap();
        assert_eq!(pool.idle("sync"), 1);
        assert_eq!(pool.in_use("async"), 1);
        pool.recycle(b);
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_cap() {
        let factory = LoopbackFactory::start().await;
        let config = PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 100,
        };
        let pool = ConnectionPool::new("test", factory, config);
        let held = pool.acquire("k").await.unwrap();
        let err = pool.acquire("k").await.unwrap_err();
        assert!(matches!(err, RpcError::PoolTimeout(100)));
        pool.recycle(held);
    }

    #[tokio::test]
    async fn test_waiter_gets_recycled_connection() {
        let factory = LoopbackFactory::start().await;
        let config = PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 5000,
        };
        let pool = Arc::new(ConnectionPool::new("test", factory.clone(), config));
        let held = pool.acquire("k").await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("k").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.recycle(Arc::clone(&held));

        let got = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &held));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_create_releases_slot() {
        let config = PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 100,
        };
        let pool = ConnectionPool::new("test", Arc::new(FailingFactory), config);
        for _ in 0..3 {
            assert!(matches!(pool.acquire("k").await, Err(RpcError::Connect(_))));
        }
    }

    #[tokio::test]
    async fn test_close_closes_everything() {
        let factory = LoopbackFactory::start().await;
        let pool = ConnectionPool::new("test", factory, PoolConfig::default());
        let used = pool.acquire("k").await.unwrap();
        let idle = pool.acquire("k").await.unwrap();
        pool.recycle(Arc::clone(&idle));

        pool.close();
        assert!(used.is_closed());
        assert!(idle.is_closed());
        assert!(matches!(pool.acquire("k").await, Err(RpcError::PoolClosed(_))));
        // recycling after close just closes
        pool.recycle(used);
    }

    #[tokio::test]
    async fn test_completed_lease_returns_connection() {
        let factory = LoopbackFactory::start().await;
        let pool = ConnectionPool::new("test", factory, PoolConfig::default());
        let conn = {
            let mut lease = pool.lease("k").await.unwrap();
            assert_eq!(pool.in_use("k"), 1);
            lease.complete();
            Arc::clone(&lease)
        };
        assert_eq!(pool.in_use("k"), 0);
        assert_eq!(pool.idle("k"), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_interrupted_lease_closes_connection() {
        let factory = LoopbackFactory::start().await;
        let config = PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 500,
        };
        let pool = ConnectionPool::new("test", factory.clone(), config);
        let conn = {
            let lease = pool.lease("k").await.unwrap();
            Arc::clone(&lease)
        };
        assert!(conn.is_closed());
        assert_eq!(pool.in_use("k"), 0);
        assert_eq!(pool.idle("k"), 0);

        // the slot is free again
        let next = pool.acquire("k").await.unwrap();
        assert!(!next.is_closed());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }
}
