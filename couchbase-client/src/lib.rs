//! Async Rust client core for [Couchbase](https://www.couchbase.com/) — the
//! distributed document database.
//!
//! This crate is the cluster-state-aware data path: it maps document keys to
//! cluster nodes, multiplexes the memcached binary protocol over pooled TCP
//! (or TLS) connections, keeps its routing state in step with the live
//! server topology, and applies the same health accounting to the cluster's
//! view, N1QL, full-text search and analytics HTTP endpoints. It is built on
//! [Tokio](https://tokio.rs/) and exposes every operation as an `async fn`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use couchbase_client::{ClientConfig, Cluster};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder().build()?;
//!     let cluster = Cluster::new(config)?;
//!
//!     let bucket = cluster.open_bucket("default").await?;
//!     let stored = bucket.upsert("greeting", &b"hello"[..], 0).await;
//!     assert!(stored.success);
//!
//!     let fetched = bucket.get("greeting").await;
//!     assert!(fetched.success && fetched.cas != 0);
//!
//!     cluster.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Routing
//!
//! Couchbase buckets hash every key onto one of `P` partitions (vBuckets)
//! through the server-published partition table; Memcached-style buckets
//! place nodes on a consistent-hash ring instead. Either way the mapping is
//! a pure function of the key and the installed topology revision, and the
//! [`cluster::ClusterMap`] swaps complete topology snapshots atomically as
//! the server publishes new revisions: over the data channel (carrier
//! publication), a streaming management feed, or periodic polls.
//!
//! A `NotMyVbucket` response marks the routing table stale: the topology it
//! carries is installed and the operation retransmits to the new owner,
//! inside its original deadline.
//!
//! # IO modes
//!
//! Two IO services are available per node, selected by
//! [`ClientConfigBuilder::use_connection_pooling`]:
//!
//! - **multiplexed** (default): one long-lived connection carries many
//!   in-flight operations, correlated by the frame opaque.
//! - **pooled**: every operation borrows one connection from a bounded
//!   per-node pool for its full round trip.
//!
//! # Configuration
//!
//! ```rust,no_run
//! use couchbase_client::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .add_server("http://10.0.0.1:8091".parse().unwrap())
//!     .credentials("app", "secret")
//!     .operation_lifespan(Duration::from_millis(2500))
//!     .query_failed_threshold(2)
//!     .build()
//!     .expect("invalid config");
//! ```
//!
//! # Feature Flags
//!
//! | Flag | Purpose |
//! |------|---------|
//! | `tls` | TLS/SSL connections via `rustls` |

#![warn(missing_docs)]

pub mod bucket;
mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod http;
pub mod io;
pub mod keymap;
pub mod ops;
pub mod provider;
pub mod runtime;

pub use bucket::{Bucket, OperationResult};
pub use client::Cluster;
pub use cluster::{ClusterMap, ClusterView, Node, NodeEndpoint, ServiceKind};
pub use config::{ClientConfig, ClientConfigBuilder, PoolConfig, PoolConfigBuilder};
pub use http::{HttpDispatcher, HttpRequest, ViewQuery};
pub use io::{IoService, MultiplexedIoService, PooledIoService};
pub use keymap::{KeyMapper, MappedKey};
pub use ops::{LookupInSpec, MutateInSpec};
pub use provider::ConfigProvider;

pub use couchbase_core::{CouchbaseError, PayloadValue, ResponseStatus, Result};
