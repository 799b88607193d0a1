//! Key-to-node mapping.
//!
//! Couchbase buckets hash keys onto a fixed partition table published by the
//! server; Memcached buckets place nodes on a consistent-hash ring. Both are
//! pure functions of the key and the installed topology revision.

mod ketama;
mod vbucket;

pub use ketama::KetamaKeyMapper;
pub use vbucket::VbucketKeyMapper;

/// The outcome of mapping a key.
///
/// Node indices reference the topology's server list. A negative index means
/// "no current owner" and is preserved verbatim for the caller's fallback
/// logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedKey {
    /// The partition the key hashes to (always 0 on ring-mapped buckets).
    pub partition_id: u16,
    /// Index of the node currently authoritative for the partition.
    pub primary: i32,
    /// Indices of the nodes holding read-only copies.
    pub replicas: Vec<i32>,
}

/// Maps document keys to partitions and node indices.
pub trait KeyMapper: Send + Sync + std::fmt::Debug {
    /// Maps a key to its partition and owning node indices.
    fn map(&self, key: &[u8]) -> MappedKey;

    /// Returns the number of partitions, or 0 for ring-mapped buckets.
    fn partition_count(&self) -> u16;
}
