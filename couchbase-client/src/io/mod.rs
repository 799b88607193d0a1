//! Per-node IO services.
//!
//! An IO service owns the dispatch of operation frames to one node. Two
//! modes exist: *pooled*, which borrows one pooled connection per operation,
//! and *multiplexed*, which runs many operations over one connection
//! correlated by the frame opaque. Both honor per-operation deadlines and
//! classify transport failures for the caller's retry logic.

pub mod multiplexed;
pub mod pooled;

pub use multiplexed::MultiplexedIoService;
pub use pooled::PooledIoService;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use couchbase_core::{OperationFrame, Result};

/// Dispatches operation frames to one node.
#[async_trait]
pub trait IoService: Send + Sync + std::fmt::Debug {
    /// Sends a request and resolves with its response.
    ///
    /// The response is returned whatever its status; classifying
    /// non-success statuses is the caller's concern. Errors are transport,
    /// pool or deadline failures. Dropping the returned future cancels the
    /// operation without tearing down the connection.
    async fn execute(&self, frame: OperationFrame, deadline: Instant) -> Result<OperationFrame>;

    /// Tears down the service's connections.
    async fn dispose(&self);
}

/// Allocates opaques for one service.
///
/// Uniqueness is only required within a connection's outstanding set, so a
/// plain wrapping counter per service is enough.
#[derive(Debug, Default)]
pub(crate) struct OpaqueCounter(AtomicU32);

impl OpaqueCounter {
    pub(crate) fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    window_start: Option<Instant>,
}

/// Rolling transport-error counter behind node quarantine.
///
/// Errors within the check interval accumulate; a count reaching the
/// threshold reports a breach. Errors past the interval start a new window.
#[derive(Debug)]
pub struct FailureWindow {
    threshold: u32,
    interval: Duration,
    state: Mutex<WindowState>,
}

impl FailureWindow {
    /// Creates a window with the given threshold and interval.
    pub fn new(threshold: u32, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: None,
            }),
        }
    }

    /// Counts one error. Returns `true` when the threshold is reached.
    pub fn record(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.window_start {
            Some(start) if now.duration_since(start) <= self.interval => {}
            _ => {
                state.count = 0;
                state.window_start = Some(now);
            }
        }

        state.count += 1;
        state.count >= self.threshold
    }

    /// Clears the window.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.count = 0;
        state.window_start = None;
    }
}
