//! Core types for the Couchbase Rust client.
//!
//! This crate contains everything the data path needs to speak the memcached
//! binary protocol without knowing about sockets: the 24-byte operation frame
//! and its codec, the opcode and status models, the server error map, the
//! payload sum type, and the shared error type.
//!
//! The sibling `couchbase-client` crate builds the routing and connection
//! machinery on top of these types.

pub mod document;
pub mod error;
pub mod protocol;

pub use document::{DefaultTranscoder, PayloadValue, Transcoder};
pub use error::{CouchbaseError, ErrorCategory, Result};
pub use protocol::{FrameCodec, Magic, Opcode, OperationFrame, ResponseStatus};
