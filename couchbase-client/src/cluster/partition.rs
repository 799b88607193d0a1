//! Partition table published by the server.

use couchbase_core::{CouchbaseError, Result};

/// One partition's ownership entry.
///
/// Indices reference the topology's server list; `-1` means "no current
/// owner" and is resolved by the caller through the random-live-node
/// fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// The partition id.
    pub id: u16,
    /// Index of the authoritative node, or `-1`.
    pub primary: i32,
    /// Indices of the replica nodes, `-1` entries included.
    pub replicas: Vec<i32>,
}

/// The full partition-to-owner mapping for one topology revision.
///
/// The partition count is fixed per revision and is always a power of two;
/// tables are swapped wholesale on reconfiguration.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
    replica_count: usize,
}

impl PartitionTable {
    /// Builds a table from the published `partition -> [primary, replicas…]`
    /// rows.
    pub fn new(rows: Vec<Vec<i32>>, replica_count: usize) -> Result<Self> {
        if rows.is_empty() {
            return Err(CouchbaseError::Protocol(
                "partition table is empty".to_string(),
            ));
        }
        if rows.len() > u16::MAX as usize + 1 {
            return Err(CouchbaseError::Protocol(format!(
                "partition count {} exceeds 65536",
                rows.len()
            )));
        }
        if !rows.len().is_power_of_two() {
            return Err(CouchbaseError::Protocol(format!(
                "partition count {} is not a power of two",
                rows.len()
            )));
        }

        let mut partitions = Vec::with_capacity(rows.len());
        for (id, row) in rows.into_iter().enumerate() {
            if row.is_empty() {
                return Err(CouchbaseError::Protocol(format!(
                    "partition {} has no owner entry",
                    id
                )));
            }
            let primary = row[0];
            let mut replicas = row[1..].to_vec();
            // Short rows happen while the cluster rebalances; pad so every
            // partition exposes the same replica arity.
            replicas.resize(replica_count, -1);
            partitions.push(Partition {
                id: id as u16,
                primary,
                replicas,
            });
        }

        Ok(Self {
            partitions,
            replica_count,
        })
    }

    /// Returns the number of partitions.
    pub fn partition_count(&self) -> u16 {
        self.partitions.len() as u16
    }

    /// Returns the configured replica count.
    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Returns the entry for a partition.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range; callers obtain ids from the key
    /// mapper, which masks into range.
    pub fn partition(&self, id: u16) -> &Partition {
        &self.partitions[id as usize]
    }

    /// Checks the table's indices against the server list.
    ///
    /// `-1` entries are legal "no current owner" markers; anything below
    /// `-1` is a wire-format violation and rejects the table. Indices at or
    /// above `node_count` are flagged but accepted: dispatch resolves them
    /// through the random-live-node fallback, same as an absent owner.
    pub fn validate_indices(&self, node_count: usize) -> Result<()> {
        let mut out_of_range = 0usize;
        for partition in &self.partitions {
            for index in std::iter::once(partition.primary).chain(partition.replicas.iter().copied())
            {
                if index < -1 {
                    return Err(CouchbaseError::Protocol(format!(
                        "partition {} carries a malformed node index {}",
                        partition.id, index
                    )));
                }
                if index >= node_count as i32 {
                    out_of_range += 1;
                }
            }
        }
        if out_of_range > 0 {
            tracing::warn!(
                entries = out_of_range,
                node_count = node_count,
                "partition table references indices outside the server list; \
                 affected partitions resolve through the random-node fallback"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_lookup() {
        let table = PartitionTable::new(vec![vec![0, 1], vec![1, 0], vec![0, -1], vec![-1, 1]], 1)
            .unwrap();
        assert_eq!(table.partition_count(), 4);
        assert_eq!(table.replica_count(), 1);

        let p = table.partition(1);
        assert_eq!(p.id, 1);
        assert_eq!(p.primary, 1);
        assert_eq!(p.replicas, vec![0]);
    }

    #[test]
    fn test_no_owner_preserved() {
        let table = PartitionTable::new(vec![vec![-1, 0], vec![0, -1]], 1).unwrap();
        assert_eq!(table.partition(0).primary, -1);
        assert_eq!(table.partition(1).replicas, vec![-1]);
    }

    #[test]
    fn test_short_rows_padded() {
        let table = PartitionTable::new(vec![vec![0], vec![1]], 2).unwrap();
        assert_eq!(table.partition(0).replicas, vec![-1, -1]);
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(PartitionTable::new(vec![], 0).is_err());
    }

    #[test]
    fn test_non_power_of_two_rejected() {
        let rows = vec![vec![0]; 3];
        assert!(PartitionTable::new(rows, 0).is_err());
    }

    #[test]
    fn test_empty_row_rejected() {
        assert!(PartitionTable::new(vec![vec![0], vec![]], 0).is_err());
    }

    #[test]
    fn test_validate_indices() {
        let table = PartitionTable::new(vec![vec![0, 1], vec![1, -1]], 1).unwrap();
        assert!(table.validate_indices(2).is_ok());
        // out-of-range indices are flagged, not fatal; dispatch falls back
        assert!(table.validate_indices(1).is_ok());

        let malformed = PartitionTable::new(vec![vec![0, -2], vec![0, 0]], 1).unwrap();
        assert!(malformed.validate_indices(4).is_err());
    }
}
