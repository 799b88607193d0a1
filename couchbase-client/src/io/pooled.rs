//! Pooled IO service: one connection per in-flight operation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::time::timeout;

use couchbase_core::{CouchbaseError, OperationFrame, Result};

use crate::connection::ConnectionPool;

use super::{IoService, OpaqueCounter};

/// Dispatches each operation over a borrowed pooled connection.
///
/// Concurrency is bounded by the pool: concurrent operations need concurrent
/// connections, and an acquire past the pool's wait timeout fails with
/// `ConnectionPoolExhausted`.
#[derive(Debug)]
pub struct PooledIoService {
    pool: Arc<ConnectionPool>,
    opaque: OpaqueCounter,
}

impl PooledIoService {
    /// Creates a service over the given pool.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            opaque: OpaqueCounter::default(),
        }
    }

    /// Returns the backing pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

#[async_trait]
impl IoService for PooledIoService {
    async fn execute(&self, mut frame: OperationFrame, deadline: Instant) -> Result<OperationFrame> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| {
                CouchbaseError::OperationTimeout("deadline elapsed before dispatch".to_string())
            })?;

        let opaque = self.opaque.next();
        frame.opaque = opaque;
        let opcode = frame.opcode;

        let round_trip = async {
            let mut conn = self.pool.acquire().await?;
            conn.send(frame).await?;

            loop {
                let response = conn.receive().await?.ok_or_else(|| {
                    CouchbaseError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed awaiting a response",
                    )))
                })?;

                if response.opaque == opaque {
                    // clean round trip; park the connection for reuse
                    conn.release();
                    return Ok(response);
                }
                tracing::debug!(
                    opaque = response.opaque,
                    "discarding reply with unknown opaque"
                );
            }
        };

        timeout(remaining, round_trip).await.map_err(|_| {
            CouchbaseError::OperationTimeout(format!("{} timed out after {:?}", opcode, remaining))
        })?
    }

    async fn dispose(&self) {
        self.pool.dispose().await;
    }
}
