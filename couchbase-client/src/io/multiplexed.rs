//! Multiplexed IO service: many operations over one connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

use couchbase_core::protocol::FrameCodec;
use couchbase_core::{CouchbaseError, OperationFrame, Result};

use crate::cluster::NodeEndpoint;
use crate::config::ClientConfig;
use crate::connection::connection::RawStream;
use crate::connection::KvConnection;

use super::{IoService, OpaqueCounter};

/// In-flight table size past which submissions are rejected.
const IN_FLIGHT_HIGH_WATER: usize = 2048;
/// Cadence of the deadline sweeper.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

struct InFlightEntry {
    deadline: Instant,
    tx: oneshot::Sender<Result<OperationFrame>>,
}

type InFlightTable = DashMap<u32, InFlightEntry>;

struct WriterState {
    writer: WriteHalf<Box<dyn RawStream>>,
    receiver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    broken: Arc<AtomicBool>,
}

/// Dispatches many operations over one long-lived connection.
///
/// Writes are serialized through a single writer lock, which also fixes the
/// server-side ordering of two operations against the same key. A dedicated
/// receiver matches responses to waiters by opaque; replies with no waiter
/// (cancelled or timed-out operations) are dropped silently. A sweeper task
/// completes expired waiters with `OperationTimeout`. Submissions past the
/// in-flight high-water mark fail with `TooManyInFlight`.
pub struct MultiplexedIoService {
    endpoint: NodeEndpoint,
    bucket: String,
    config: Arc<ClientConfig>,
    writer: Mutex<Option<WriterState>>,
    in_flight: Arc<InFlightTable>,
    opaque: OpaqueCounter,
    disposed: AtomicBool,
}

impl std::fmt::Debug for MultiplexedIoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedIoService")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Removes an operation's table entry when its submit scope unwinds.
///
/// Covers cancellation (the caller dropped the future) and timeouts: once
/// the entry is gone, the eventual server reply has no waiter and is
/// discarded by the receiver.
struct InFlightGuard {
    table: Arc<InFlightTable>,
    opaque: u32,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.opaque);
    }
}

impl MultiplexedIoService {
    /// Creates a service for one node and bucket. The connection is dialed
    /// lazily on first dispatch.
    pub fn new(endpoint: NodeEndpoint, bucket: impl Into<String>, config: Arc<ClientConfig>) -> Self {
        Self {
            endpoint,
            bucket: bucket.into(),
            config,
            writer: Mutex::new(None),
            in_flight: Arc::new(DashMap::new()),
            opaque: OpaqueCounter::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns the number of operations currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    async fn ensure_connected(&self, state: &mut Option<WriterState>) -> Result<()> {
        if let Some(current) = state.as_ref() {
            if !current.broken.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(stale) = state.take() {
                stale.receiver.abort();
                stale.sweeper.abort();
            }
        }

        let mut conn = KvConnection::connect(&self.endpoint, &self.config).await?;
        conn.initialize(&self.bucket, &self.config).await?;
        let (id, stream, residual) = conn.into_parts();
        let (reader, writer) = tokio::io::split(stream);

        let broken = Arc::new(AtomicBool::new(false));
        let receiver = tokio::spawn(run_receiver(
            reader,
            residual,
            Arc::clone(&self.in_flight),
            Arc::clone(&broken),
            self.endpoint.clone(),
        ));
        let sweeper = tokio::spawn(run_sweeper(Arc::clone(&self.in_flight)));

        tracing::debug!(endpoint = %self.endpoint, id = %id, "multiplexed connection up");
        *state = Some(WriterState {
            writer,
            receiver,
            sweeper,
            broken,
        });
        Ok(())
    }
}

#[async_trait]
impl IoService for MultiplexedIoService {
    async fn execute(&self, mut frame: OperationFrame, deadline: Instant) -> Result<OperationFrame> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CouchbaseError::Shutdown);
        }
        let pending = self.in_flight.len();
        if pending >= IN_FLIGHT_HIGH_WATER {
            return Err(CouchbaseError::TooManyInFlight(pending));
        }

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| {
                CouchbaseError::OperationTimeout("deadline elapsed before dispatch".to_string())
            })?;

        let opaque = self.opaque.next();
        frame.opaque = opaque;
        let opcode = frame.opcode;

        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(opaque, InFlightEntry { deadline, tx });
        let _guard = InFlightGuard {
            table: Arc::clone(&self.in_flight),
            opaque,
        };

        // single writer: frame writes are serialized, which pins the
        // server-side ordering of same-key operations to submit order; the
        // deadline covers the whole submit path, connection bring-up
        // included
        let submit = async {
            let mut state = self.writer.lock().await;
            self.ensure_connected(&mut state).await?;

            let mut buf = BytesMut::new();
            FrameCodec::new().encode(frame, &mut buf)?;

            let writer_state = state
                .as_mut()
                .unwrap_or_else(|| unreachable!("ensure_connected left no state"));
            if let Err(e) = writer_state.writer.write_all(&buf).await {
                writer_state.broken.store(true, Ordering::Release);
                return Err(CouchbaseError::Io(Arc::new(std::io::Error::new(
                    e.kind(),
                    format!("write to {}: {}", self.endpoint, e),
                ))));
            }
            Ok(())
        };
        tokio::time::timeout(remaining, submit).await.map_err(|_| {
            CouchbaseError::OperationTimeout(format!(
                "{} against {} hit its deadline during submit",
                opcode, self.endpoint
            ))
        })??;

        tokio::select! {
            completed = rx => match completed {
                Ok(result) => result,
                Err(_) => Err(CouchbaseError::Io(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    format!("connection to {} dropped the operation", self.endpoint),
                )))),
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                Err(CouchbaseError::OperationTimeout(format!(
                    "{} against {} hit its deadline",
                    opcode, self.endpoint
                )))
            }
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let state = self.writer.lock().await.take();
        if let Some(state) = state {
            state.receiver.abort();
            state.sweeper.abort();
            drop(state.writer);
        }

        fail_all(&self.in_flight, || CouchbaseError::Shutdown);
        tracing::debug!(endpoint = %self.endpoint, "multiplexed service disposed");
    }
}

async fn run_receiver(
    mut reader: ReadHalf<Box<dyn RawStream>>,
    mut buffer: BytesMut,
    table: Arc<InFlightTable>,
    broken: Arc<AtomicBool>,
    endpoint: NodeEndpoint,
) {
    let mut codec = FrameCodec::new();

    loop {
        match codec.decode(&mut buffer) {
            Ok(Some(frame)) => {
                match table.remove(&frame.opaque) {
                    Some((_, entry)) => {
                        let _ = entry.tx.send(Ok(frame));
                    }
                    None => {
                        tracing::debug!(
                            endpoint = %endpoint,
                            opaque = frame.opaque,
                            "discarding reply with unknown opaque"
                        );
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "receiver protocol error");
                break;
            }
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                tracing::debug!(endpoint = %endpoint, "peer closed the multiplexed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "receiver read failed");
                break;
            }
        }
    }

    broken.store(true, Ordering::Release);
    fail_all(&table, || {
        CouchbaseError::Io(Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            format!("connection to {} closed with operations in flight", endpoint),
        )))
    });
}

async fn run_sweeper(table: Arc<InFlightTable>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let expired: Vec<u32> = table
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for opaque in expired {
            if let Some((_, entry)) = table.remove(&opaque) {
                let _ = entry
                    .tx
                    .send(Err(CouchbaseError::OperationTimeout(format!(
                        "opaque {} swept past its deadline",
                        opaque
                    ))));
            }
        }
    }
}

fn fail_all(table: &InFlightTable, make_error: impl Fn() -> CouchbaseError) {
    let opaques: Vec<u32> = table.iter().map(|entry| *entry.key()).collect();
    for opaque in opaques {
        if let Some((_, entry)) = table.remove(&opaque) {
            let _ = entry.tx.send(Err(make_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couchbase_core::protocol::Opcode;
    use std::time::Duration;

    fn service() -> MultiplexedIoService {
        MultiplexedIoService::new(
            NodeEndpoint::new("127.0.0.1", 1),
            "default",
            Arc::new(ClientConfig::builder().build().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_dead_endpoint_surfaces_transport_error() {
        let svc = service();
        let err = svc
            .execute(
                OperationFrame::request(Opcode::Get, 0),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CouchbaseError::Connect(_) | CouchbaseError::Io(_)
        ));
        assert_eq!(svc.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_submissions() {
        let svc = service();
        svc.dispose().await;
        let err = svc
            .execute(
                OperationFrame::request(Opcode::Get, 0),
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CouchbaseError::Shutdown));
    }

    #[tokio::test]
    async fn test_sweeper_expires_stale_entries() {
        let table: Arc<InFlightTable> = Arc::new(DashMap::new());
        let (tx, rx) = oneshot::channel();
        table.insert(
            7,
            InFlightEntry {
                deadline: Instant::now() - Duration::from_millis(1),
                tx,
            },
        );

        let sweeper = tokio::spawn(run_sweeper(Arc::clone(&table)));
        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("sweeper did not fire")
            .expect("sender dropped");
        assert!(matches!(result, Err(CouchbaseError::OperationTimeout(_))));
        assert!(table.is_empty());
        sweeper.abort();
    }

    #[test]
    fn test_guard_removes_entry() {
        let table: Arc<InFlightTable> = Arc::new(DashMap::new());
        let (tx, _rx) = oneshot::channel();
        table.insert(
            3,
            InFlightEntry {
                deadline: Instant::now(),
                tx,
            },
        );
        {
            let _guard = InFlightGuard {
                table: Arc::clone(&table),
                opaque: 3,
            };
        }
        assert!(table.is_empty());
    }
}
