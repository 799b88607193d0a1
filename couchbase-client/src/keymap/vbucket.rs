//! Hash-partitioned key mapping for Couchbase buckets.

use std::sync::Arc;

use crate::cluster::PartitionTable;

use super::{KeyMapper, MappedKey};

/// Maps keys onto the server-published partition table.
///
/// The partition index is `crc32(key) & 0xffff & (P - 1)`: the standard
/// 32-bit CRC (polynomial `0xEDB88320`) over the raw key bytes, reduced to
/// its low 16 bits, then masked by the partition count (a power of two).
#[derive(Debug, Clone)]
pub struct VbucketKeyMapper {
    table: Arc<PartitionTable>,
}

impl VbucketKeyMapper {
    /// Creates a mapper over the given partition table.
    pub fn new(table: Arc<PartitionTable>) -> Self {
        Self { table }
    }

    /// Returns the backing partition table.
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }
}

impl KeyMapper for VbucketKeyMapper {
    fn map(&self, key: &[u8]) -> MappedKey {
        let hash = crc32fast::hash(key) & 0xffff;
        let partition_id = (hash as u16) & (self.table.partition_count() - 1);
        let partition = self.table.partition(partition_id);

        MappedKey {
            partition_id,
            primary: partition.primary,
            replicas: partition.replicas.clone(),
        }
    }

    fn partition_count(&self) -> u16 {
        self.table.partition_count()
    }
}
