//! Health-tracked service URIs.

use std::time::Instant;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use url::Url;

/// A service base URI with failure accounting.
///
/// A URI is healthy while its failure count stays below the retirement
/// threshold, or once it has been left alone past the rehabilitation
/// interval. Any success clears the count.
#[derive(Debug)]
pub struct FailureCountingUri {
    uri: Url,
    failures: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
}

impl FailureCountingUri {
    /// Creates a healthy URI.
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            failures: AtomicU32::new(0),
            last_failure: Mutex::new(None),
        }
    }

    /// Returns the absolute URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Returns the current failure count.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Counts a transport error or 5xx against this URI.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        *self.last_failure.lock() = Some(Instant::now());
    }

    /// Clears the failure count after a successful response.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        *self.last_failure.lock() = None;
    }

    /// Resets the accounting, used by the fail-open path when every URI of a
    /// service is unhealthy.
    pub fn reset(&self) {
        self.record_success();
    }

    /// Health predicate: below the threshold, or quiet past the
    /// rehabilitation interval.
    pub fn is_healthy(&self, threshold: u32, rehab_interval: std::time::Duration) -> bool {
        if self.failures() < threshold {
            return true;
        }
        match *self.last_failure.lock() {
            Some(at) => at.elapsed() > rehab_interval,
            None => true,
        }
    }
}
