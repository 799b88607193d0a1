//! Runtime abstraction for background tasks.
//!
//! The client spawns a handful of long-lived tasks: the topology poller and
//! the streaming configuration feed. Coding their launch against a
//! [`Runtime`] trait keeps them testable and leaves room for alternative
//! executors; [`TokioRuntime`] is the default.

use std::future::Future;

/// Abstraction over an async runtime's task spawning.
pub trait Runtime: Send + Sync + 'static {
    /// Spawns a future as a background task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// The default [`Runtime`] implementation backed by Tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}
