//! Error types for Couchbase client operations.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ResponseStatus;

/// The main error type for Couchbase client operations.
///
/// This enum covers transport failures, authentication problems, routing
/// decisions that could not be satisfied, server-reported protocol statuses
/// and client-side request construction errors.
#[derive(Debug, Error, Clone)]
pub enum CouchbaseError {
    /// TCP connect to a cluster node failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A read or write on an established connection failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The TLS handshake with a cluster node failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The operation did not complete before its deadline.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// SASL authentication was rejected by the server.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The peer certificate failed validation.
    #[error("certificate rejected: {0}")]
    Certificate(String),

    /// No live node is available to dispatch the operation to.
    #[error("no available node for dispatch")]
    NoAvailableNode,

    /// The contacted node no longer owns the partition. The routing table is
    /// stale; the caller should install the fresher topology and retry.
    #[error("partition {partition} is not owned by the contacted node")]
    NotMyVbucket {
        /// The partition the request was stamped with.
        partition: u16,
    },

    /// The node is quarantined after repeated transport errors.
    #[error("node {0} is quarantined")]
    NodeQuarantined(String),

    /// No pooled connection became available within the wait timeout.
    #[error("connection pool exhausted after {0:?}")]
    ConnectionPoolExhausted(Duration),

    /// The multiplexed in-flight table is at its high-water mark.
    #[error("too many in-flight operations ({0})")]
    TooManyInFlight(usize),

    /// A non-success status returned by the server.
    #[error("server status {status}: {message}")]
    Server {
        /// The protocol status word from the response header.
        status: ResponseStatus,
        /// Server-provided or error-map-provided description.
        message: String,
    },

    /// The peer sent bytes that do not form a valid protocol frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The request was malformed before it reached the wire.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Client configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An HTTP service request failed before a response was produced.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The client or one of its components has been shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl From<io::Error> for CouchbaseError {
    fn from(err: io::Error) -> Self {
        CouchbaseError::Io(Arc::new(err))
    }
}

impl CouchbaseError {
    /// Returns `true` if retrying the operation may succeed.
    ///
    /// Transport errors, routing staleness and the transient server statuses
    /// are retryable within the operation's deadline. Authentication and
    /// permanent server errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server { status, .. } => status.is_retryable(),
            Self::Connect(_) => true,
            Self::Io(_) => true,
            Self::NotMyVbucket { .. } => true,
            Self::NodeQuarantined(_) => true,
            Self::ConnectionPoolExhausted(_) => true,
            Self::TooManyInFlight(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the error indicates a temporary condition that is
    /// likely to clear without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Io(_) => true,
            Self::ConnectionPoolExhausted(_) | Self::TooManyInFlight(_) => true,
            Self::Server { status, .. } => matches!(
                status,
                ResponseStatus::Busy | ResponseStatus::TemporaryFailure
            ),
            _ => false,
        }
    }

    /// Returns the error category for structured error handling.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connect(_) | Self::Io(_) | Self::TlsHandshake(_) | Self::Protocol(_) => {
                ErrorCategory::Transport
            }
            Self::OperationTimeout(_) => ErrorCategory::Timeout,
            Self::Authentication(_) | Self::Certificate(_) => ErrorCategory::Auth,
            Self::NoAvailableNode
            | Self::NotMyVbucket { .. }
            | Self::NodeQuarantined(_)
            | Self::ConnectionPoolExhausted(_)
            | Self::TooManyInFlight(_) => ErrorCategory::Routing,
            Self::Server { .. } => ErrorCategory::Server,
            Self::Serialization(_) | Self::BadRequest(_) | Self::Configuration(_) => {
                ErrorCategory::Client
            }
            Self::Http(_) => ErrorCategory::Transport,
            Self::Shutdown => ErrorCategory::Client,
        }
    }

    /// Returns the server status if this is a server error.
    pub fn server_status(&self) -> Option<ResponseStatus> {
        match self {
            Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Creates a `Server` error from a status word and message.
    pub fn from_status(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }
}

/// Classification of error categories for structured error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Socket, TLS and framing failures.
    Transport,
    /// Operation deadline exceeded.
    Timeout,
    /// SASL or certificate failures.
    Auth,
    /// Node selection and partition ownership failures.
    Routing,
    /// Non-success statuses reported by the server.
    Server,
    /// Request construction, payload and configuration failures.
    Client,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "TRANSPORT"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Routing => write!(f, "ROUTING"),
            Self::Server => write!(f, "SERVER"),
            Self::Client => write!(f, "CLIENT"),
        }
    }
}

/// A specialized `Result` type for Couchbase client operations.
pub type Result<T> = std::result::Result<T, CouchbaseError>;
