//! Consistent-hash key mapping for Memcached buckets.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

use crate::cluster::NodeEndpoint;

use super::{KeyMapper, MappedKey};

/// Iterations of the point-generation loop per node.
const POINT_ROUNDS: usize = 40;
/// Points extracted from each MD5 digest.
const POINTS_PER_DIGEST: usize = 4;

/// Maps keys onto a ketama ring.
///
/// Each node contributes 160 virtual points: for replica 0..40 the digest of
/// `"<host>:<port>-<replica>"` yields four little-endian u32 points. A key
/// hashes to the first four bytes of its own digest and lands on the first
/// ring point at or after that value, wrapping at the top of the ring.
/// Ring-mapped buckets have no replicas.
#[derive(Debug, Clone)]
pub struct KetamaKeyMapper {
    ring: BTreeMap<u32, usize>,
}

impl KetamaKeyMapper {
    /// Builds the ring from the live node endpoints, in server-list order.
    pub fn new(endpoints: &[NodeEndpoint]) -> Self {
        let mut ring = BTreeMap::new();

        for (index, endpoint) in endpoints.iter().enumerate() {
            for replica in 0..POINT_ROUNDS {
                let digest = Md5::digest(
                    format!("{}:{}-{}", endpoint.host(), endpoint.port(), replica).as_bytes(),
                );
                for chunk in 0..POINTS_PER_DIGEST {
                    let offset = chunk * 4;
                    let point = u32::from_le_bytes([
                        digest[offset],
                        digest[offset + 1],
                        digest[offset + 2],
                        digest[offset + 3],
                    ]);
                    ring.insert(point, index);
                }
            }
        }

        Self { ring }
    }

    /// Returns the number of points on the ring.
    pub fn point_count(&self) -> usize {
        self.ring.len()
    }

    fn locate(&self, hash: u32) -> Option<usize> {
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, index)| *index)
    }
}

impl KeyMapper for KetamaKeyMapper {
    fn map(&self, key: &[u8]) -> MappedKey {
        let digest = Md5::digest(key);
        let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

        MappedKey {
            partition_id: 0,
            primary: self.locate(hash).map(|i| i as i32).unwrap_or(-1),
            replicas: Vec::new(),
        }
    }

    fn partition_count(&self) -> u16 {
        0
    }
}
