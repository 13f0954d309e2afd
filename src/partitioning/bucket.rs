//! Key to bucket mapping.

use crate::types::{BucketId, ClusterNodeAddress};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Hash a key with the cluster-wide hash function.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

/// Bucket a key falls into. Every node computes the same bucket for a key.
pub fn bucket_of(key: &[u8], bucket_count: u32) -> BucketId {
    debug_assert!(bucket_count > 0);
    (hash_key(key) % u64::from(bucket_count.max(1))) as BucketId
}

/// Ownership of one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOwnership {
    /// Node serving the bucket, `None` until assigned or after its data was lost.
    pub owner: Option<ClusterNodeAddress>,

    /// Node the bucket is being handed to.
    pub pending: Option<ClusterNodeAddress>,

    /// Nodes holding replicas, in promotion order.
    pub backups: Vec<ClusterNodeAddress>,
}

impl BucketOwnership {
    /// Owner once the handoff in flight (if any) completes.
    pub fn planned_owner(&self) -> Option<&ClusterNodeAddress> {
        self.pending.as_ref().or(self.owner.as_ref())
    }

    pub fn is_owner(&self, node: &ClusterNodeAddress) -> bool {
        self.owner.as_ref() == Some(node)
    }

    pub fn is_pending(&self, node: &ClusterNodeAddress) -> bool {
        self.pending.as_ref() == Some(node)
    }

    /// True while the bucket moves between nodes.
    pub fn in_transfer(&self) -> bool {
        self.pending.is_some()
    }
}
