//! Response status model.

use std::fmt;

/// The 2-byte status word of a response frame.
///
/// Statuses outside the well-known set are preserved as `Other` so they can
/// be looked up in the server's error map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// The operation succeeded.
    Success,
    /// The key does not exist.
    KeyNotFound,
    /// The key exists (or the supplied CAS is stale).
    KeyExists,
    /// The value exceeds the server's size limit.
    ValueTooLarge,
    /// The request was malformed.
    InvalidArguments,
    /// The append/prepend target does not exist.
    NotStored,
    /// The delta for an arithmetic operation was not numeric.
    DeltaBadValue,
    /// The contacted node does not own the partition; the routing table is
    /// stale. The response body often carries a fresh topology document.
    NotMyVbucket,
    /// No bucket is selected on this connection.
    NoBucket,
    /// Authentication failed.
    AuthError,
    /// Authentication requires another SASL step.
    AuthContinue,
    /// The opcode is not recognized by the server.
    UnknownCommand,
    /// The server is out of memory.
    OutOfMemory,
    /// The opcode is recognized but not supported.
    NotSupported,
    /// An internal server error occurred.
    InternalError,
    /// The server is too busy to handle the request right now.
    Busy,
    /// A transient server-side failure; retry later.
    TemporaryFailure,
    /// A status outside the well-known set, resolvable via the error map.
    Other(u16),
}

impl ResponseStatus {
    /// Creates a `ResponseStatus` from the wire status word.
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0000 => Self::Success,
            0x0001 => Self::KeyNotFound,
            0x0002 => Self::KeyExists,
            0x0003 => Self::ValueTooLarge,
            0x0004 => Self::InvalidArguments,
            0x0005 => Self::NotStored,
            0x0006 => Self::DeltaBadValue,
            0x0007 => Self::NotMyVbucket,
            0x0008 => Self::NoBucket,
            0x0020 => Self::AuthError,
            0x0021 => Self::AuthContinue,
            0x0081 => Self::UnknownCommand,
            0x0082 => Self::OutOfMemory,
            0x0083 => Self::NotSupported,
            0x0084 => Self::InternalError,
            0x0085 => Self::Busy,
            0x0086 => Self::TemporaryFailure,
            other => Self::Other(other),
        }
    }

    /// Returns the numeric wire value.
    pub fn value(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::KeyNotFound => 0x0001,
            Self::KeyExists => 0x0002,
            Self::ValueTooLarge => 0x0003,
            Self::InvalidArguments => 0x0004,
            Self::NotStored => 0x0005,
            Self::DeltaBadValue => 0x0006,
            Self::NotMyVbucket => 0x0007,
            Self::NoBucket => 0x0008,
            Self::AuthError => 0x0020,
            Self::AuthContinue => 0x0021,
            Self::UnknownCommand => 0x0081,
            Self::OutOfMemory => 0x0082,
            Self::NotSupported => 0x0083,
            Self::InternalError => 0x0084,
            Self::Busy => 0x0085,
            Self::TemporaryFailure => 0x0086,
            Self::Other(value) => value,
        }
    }

    /// Returns `true` if this is the success status.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Returns `true` for statuses the client retries locally within the
    /// operation deadline.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NotMyVbucket | Self::Busy | Self::TemporaryFailure
        )
    }

    /// Returns `true` for statuses that indicate an authentication problem.
    pub fn is_auth_failure(self) -> bool {
        self == Self::AuthError
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::KeyNotFound => write!(f, "KEY_NOT_FOUND"),
            Self::KeyExists => write!(f, "KEY_EXISTS"),
            Self::ValueTooLarge => write!(f, "VALUE_TOO_LARGE"),
            Self::InvalidArguments => write!(f, "INVALID_ARGUMENTS"),
            Self::NotStored => write!(f, "NOT_STORED"),
            Self::DeltaBadValue => write!(f, "DELTA_BAD_VALUE"),
            Self::NotMyVbucket => write!(f, "NOT_MY_VBUCKET"),
            Self::NoBucket => write!(f, "NO_BUCKET"),
            Self::AuthError => write!(f, "AUTH_ERROR"),
            Self::AuthContinue => write!(f, "AUTH_CONTINUE"),
            Self::UnknownCommand => write!(f, "UNKNOWN_COMMAND"),
            Self::OutOfMemory => write!(f, "OUT_OF_MEMORY"),
            Self::NotSupported => write!(f, "NOT_SUPPORTED"),
            Self::InternalError => write!(f, "INTERNAL_ERROR"),
            Self::Busy => write!(f, "BUSY"),
            Self::TemporaryFailure => write!(f, "TEMPORARY_FAILURE"),
            Self::Other(value) => write!(f, "STATUS_{:#06x}", value),
        }
    }
}
