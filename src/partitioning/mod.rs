//! Partitioning of each cache's keyspace into buckets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Group                             │
//! │  members (address order, leaving flag)                    │
//! │  ┌────────┬────────┬────────┬────────┬────────┬────────┐  │
//! │  │ B0: n1 │ B1: n1 │ B2: n2 │ B3: n2 │ B4: n3 │ ...    │  │
//! │  │ bk: n2 │ bk: n2 │ bk: n3 │→n3     │ bk: n1 │        │  │
//! │  └────────┴────────┴────────┴────────┴────────┴────────┘  │
//! │                                                           │
//! │  Key "user:123" → xxhash64 % bucket_count → B2 → n2       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The table lives in the replicated cluster state and changes only through
//! the functions in [`assignment`], applied in the same order on every node.

pub mod assignment;
mod bucket;
mod ownership;

pub use assignment::{BucketChange, BucketChangeKind};
pub use bucket::{bucket_of, hash_key, BucketOwnership};
pub use ownership::{Group, GroupMember, OwnershipRole};

use crate::types::{BucketId, ClusterNodeAddress};

/// Local notification that a bucket changed primary owner.
///
/// Called on the owning cache's store processor; implementations must not
/// block.
pub trait BucketEventListener: Send + Sync + 'static {
    fn bucket_transferred(
        &self,
        bucket: BucketId,
        from: Option<&ClusterNodeAddress>,
        to: Option<&ClusterNodeAddress>,
    );
}
