//! Bounded per-node connection pool.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use couchbase_core::{CouchbaseError, Result};

use crate::cluster::NodeEndpoint;
use crate::config::ClientConfig;

use super::connection::KvConnection;

/// Dial attempts per acquire before the error is surfaced.
const CONNECT_RETRY_LIMIT: u32 = 3;
/// Cadence of the idle reaper.
const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// Idle window after which surplus connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll cadence while waiting for in-flight connections during disposal.
const DISPOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Point-in-time connection counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently lent out.
    pub in_flight: usize,
    /// Connections parked in the idle set.
    pub idle: usize,
}

/// A bounded pool of authenticated connections to one node.
///
/// Capacity is gated by a semaphore sized to `max_size`; an acquire waits up
/// to the configured wait timeout for a permit before failing with
/// `ConnectionPoolExhausted`. Connections are created lazily and parked in
/// an idle set on release; an idle reaper closes surplus connections back
/// down to `min_size`.
pub struct ConnectionPool {
    endpoint: NodeEndpoint,
    bucket: String,
    config: Arc<ClientConfig>,
    idle: Mutex<VecDeque<KvConnection>>,
    permits: Arc<Semaphore>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("in_flight", &stats.in_flight)
            .field("idle", &stats.idle)
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool for one node and bucket.
    pub fn new(endpoint: NodeEndpoint, bucket: impl Into<String>, config: Arc<ClientConfig>) -> Arc<Self> {
        let max = config.pool().max_size();
        Arc::new(Self {
            endpoint,
            bucket: bucket.into(),
            config,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Returns the endpoint this pool dials.
    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    /// Returns current connection counts.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_flight: self
                .config
                .pool()
                .max_size()
                .saturating_sub(self.permits.available_permits()),
            idle: self.idle.lock().len(),
        }
    }

    /// Returns `true` once the pool has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Pre-dials connections up to `min_size`.
    ///
    /// Bring-up failures are logged, not surfaced; the pool dials on demand
    /// afterwards.
    pub async fn initialize(self: &Arc<Self>) {
        self.spawn_idle_reaper();
        for _ in 0..self.config.pool().min_size() {
            match self.create_connection().await {
                Ok(conn) => self.idle.lock().push_back(conn),
                Err(e) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "pre-dial failed");
                    return;
                }
            }
        }
    }

    /// Borrows a connection, dialing one if the pool is below capacity.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_disposed() {
            return Err(CouchbaseError::Shutdown);
        }

        let wait = self.config.pool().wait_timeout();
        let permit = timeout(wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| CouchbaseError::ConnectionPoolExhausted(wait))?
            .map_err(|_| CouchbaseError::Shutdown)?;

        if self.is_disposed() {
            return Err(CouchbaseError::Shutdown);
        }

        let conn = self.idle.lock().pop_front();
        let conn = match conn {
            Some(conn) => conn,
            None => self.create_with_retries().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Disposes the pool: closes idle connections and waits out in-flight
    /// ones up to the shutdown timeout.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let max = self.config.pool().max_size();
        let deadline = Instant::now() + self.config.pool().shutdown_timeout();
        while self.permits.available_permits() < max && Instant::now() < deadline {
            tokio::time::sleep(DISPOSE_POLL_INTERVAL).await;
        }

        let drained = {
            let mut idle = self.idle.lock();
            let count = idle.len();
            idle.clear();
            count
        };
        tracing::debug!(
            endpoint = %self.endpoint,
            drained = drained,
            "connection pool disposed"
        );
    }

    async fn create_with_retries(&self) -> Result<KvConnection> {
        let mut last_error = None;
        for attempt in 1..=CONNECT_RETRY_LIMIT {
            match self.create_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        attempt = attempt,
                        error = %e,
                        "connection bring-up failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(CouchbaseError::NoAvailableNode))
    }

    async fn create_connection(&self) -> Result<KvConnection> {
        let mut conn = KvConnection::connect(&self.endpoint, &self.config).await?;
        conn.initialize(&self.bucket, &self.config).await?;
        Ok(conn)
    }

    fn release(&self, conn: KvConnection) {
        if self.is_disposed() {
            return;
        }
        self.idle.lock().push_back(conn);
    }

    fn spawn_idle_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                if pool.is_disposed() {
                    return;
                }

                let min = pool.config.pool().min_size();
                let mut idle = pool.idle.lock();
                while idle.len() > min {
                    match idle.front() {
                        Some(conn) if conn.idle_for() > IDLE_TIMEOUT => {
                            let conn = idle.pop_front();
                            drop(conn);
                        }
                        _ => break,
                    }
                }
            }
        });
    }
}

/// A connection on loan from a pool.
///
/// Release it with [`PooledConnection::release`] to park the connection for
/// reuse; dropping the loan instead closes the connection, which is the
/// right thing after an IO error left it in an unknown state.
pub struct PooledConnection {
    conn: Option<KvConnection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Returns the connection to the pool's idle set.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = KvConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("loan accessed after release"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("loan accessed after release"))
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", self.pool.endpoint())
            .field("released", &self.conn.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfigBuilder;

    fn pool_with(max: usize, wait: Duration) -> Arc<ConnectionPool> {
        let config = ClientConfig::builder()
            .pool(
                PoolConfigBuilder::new()
                    .min_size(0)
                    .max_size(max)
                    .wait_timeout(wait)
                    .shutdown_timeout(Duration::from_millis(50))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        ConnectionPool::new(
            // nothing listens here; tests that dial expect failure
            NodeEndpoint::new("127.0.0.1", 1),
            "default",
            Arc::new(config),
        )
    }

    #[tokio::test]
    async fn test_acquire_fails_against_dead_endpoint() {
        let pool = pool_with(2, Duration::from_secs(5));
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            CouchbaseError::Connect(_) | CouchbaseError::Io(_)
        ));
        // the permit must be returned on failure
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_new_acquires() {
        let pool = pool_with(1, Duration::from_millis(50));
        pool.dispose().await;
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            CouchbaseError::Shutdown
        ));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let pool = pool_with(1, Duration::from_millis(50));
        pool.dispose().await;
        pool.dispose().await;
        assert!(pool.is_disposed());
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let pool = pool_with(4, Duration::from_millis(50));
        assert_eq!(
            pool.stats(),
            PoolStats {
                in_flight: 0,
                idle: 0
            }
        );
    }
}
