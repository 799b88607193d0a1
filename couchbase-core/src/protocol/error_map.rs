//! The server's error map.
//!
//! When a connection negotiates the `Xerror` feature the server can answer
//! with statuses outside the well-known set. The error map, fetched once per
//! connection via `GetErrorMap`, describes those statuses and how the client
//! should react to them.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{CouchbaseError, Result};
use crate::protocol::status::ResponseStatus;

/// Behavioral attributes attached to an error-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAttribute {
    /// The condition is temporary; retrying later may succeed.
    Temporary,
    /// Retry immediately.
    RetryNow,
    /// Retry after a backoff.
    RetryLater,
    /// The request must be re-authenticated.
    Auth,
    /// The connection state is invalid; the connection should be dropped.
    ConnectionState,
    /// An attribute this client does not act on.
    Other,
}

impl ErrorAttribute {
    fn from_str(raw: &str) -> Self {
        match raw {
            "temp" => Self::Temporary,
            "retry-now" => Self::RetryNow,
            "retry-later" => Self::RetryLater,
            "auth" => Self::Auth,
            "conn-state-invalidated" => Self::ConnectionState,
            _ => Self::Other,
        }
    }
}

/// One entry of the error map.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDefinition {
    /// Short identifier, e.g. `ETMPFAIL`.
    pub name: String,
    /// Human-readable description.
    #[serde(rename = "desc")]
    pub description: String,
    /// Raw attribute strings as published by the server.
    #[serde(rename = "attrs", default)]
    pub attributes: Vec<String>,
}

impl ErrorDefinition {
    /// Returns the parsed attributes.
    pub fn attributes(&self) -> impl Iterator<Item = ErrorAttribute> + '_ {
        self.attributes.iter().map(|a| ErrorAttribute::from_str(a))
    }

    /// Returns `true` if the client should retry the operation.
    pub fn is_retryable(&self) -> bool {
        self.attributes().any(|a| {
            matches!(
                a,
                ErrorAttribute::Temporary | ErrorAttribute::RetryNow | ErrorAttribute::RetryLater
            )
        })
    }

    /// Returns `true` if the entry describes an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        self.attributes().any(|a| a == ErrorAttribute::Auth)
    }

    /// Returns `true` if the connection should be torn down on this status.
    pub fn invalidates_connection(&self) -> bool {
        self.attributes()
            .any(|a| a == ErrorAttribute::ConnectionState)
    }
}

/// The parsed error map document.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMap {
    /// Format version.
    pub version: u32,
    /// Monotonic revision of the map contents.
    pub revision: u32,
    /// Entries keyed by lowercase hex status without leading zeros.
    pub errors: HashMap<String, ErrorDefinition>,
}

impl ErrorMap {
    /// Parses an error map from the raw `GetErrorMap` response body.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| CouchbaseError::Protocol(format!("invalid error map: {}", e)))
    }

    /// Looks up the entry for a status word.
    pub fn lookup(&self, status: ResponseStatus) -> Option<&ErrorDefinition> {
        self.errors.get(&format!("{:x}", status.value()))
    }
}
