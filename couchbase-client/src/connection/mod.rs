//! Connection lifecycle: dialing, authentication and pooling.

pub mod connection;
pub mod pool;
pub mod sasl;
mod tls;

pub use connection::{ConnectionId, KvConnection};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use sasl::{SaslMechanism, SaslSession};
