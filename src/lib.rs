//! Partitioned distributed in-memory cache.
//!
//! Every cache is split into a fixed number of buckets. Each bucket has one
//! primary owner in the cluster, chosen by a deterministic assignment that
//! every node computes from the same replicated state. Reads and writes go to
//! the owner of the key's bucket; when members join or leave, buckets move
//! between nodes through a handoff that commits only after the receiver holds
//! the data.
//!
//! # Features
//!
//! - Bucket ownership with balanced rebalancing and optional backups
//! - Totally ordered membership updates from a single sequencer
//! - TTL expiration, LRU or FIFO bounds, explicit invalidation
//! - Write-through, read-through and bulk loading through named extensions
//! - Scatter-gather execution with caller-side aggregation
//!
//! # Example
//!
//! ```rust,no_run
//! use cachegrid::{CacheConfig, CacheNode, NodeConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = CacheNode::builder(
//!         NodeConfig::new("127.0.0.1:7400".parse()?)
//!             .with_seeds(vec!["127.0.0.1:7401".parse()?]),
//!     )
//!     .start()
//!     .await?;
//!
//!     let orders = node
//!         .create_cache(
//!             CacheConfig::new("orders")
//!                 .with_bucket_count(17)
//!                 .with_default_ttl(Duration::from_secs(5)),
//!         )
//!         .await?;
//!
//!     orders.put("o1", "42").await?;
//!     if let Some(value) = orders.get("o1").await? {
//!         println!("Found: {:?}", value);
//!     }
//!     println!("Entries in the cluster: {}", orders.size().await?);
//!
//!     node.leave().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     DistributedCache / ScatterGather         │
//! │  owner_of(key) from the latest state         │
//! └─────────────────────────────────────────────┘
//!          │ local mailbox        │ Router
//!          ▼                      ▼
//! ┌─────────────────┐   ┌──────────────────────┐
//! │ StoreProcessor  │◄──│  Transport (TCP)      │
//! │ one per cache   │   │  Multicast (UDP)      │
//! └─────────────────┘   └──────────────────────┘
//!          ▲                      │
//!          │ Topology             ▼
//! ┌─────────────────────────────────────────────┐
//! │ ClusterProcessor: ReplicatedState, sequencer │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Single owner**: at any settled point exactly one node owns a bucket
//! - **Reads**: served by the owner, so a write is visible to the next read
//! - **Handoff**: writes to a moving bucket are refused and retried by the
//!   caller until the new owner is committed
//! - **Failures**: a failed owner's bucket is taken over by its first backup;
//!   without backups its entries are lost and `BucketLost` is published

pub mod cache;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod processor;
pub mod rebalancing;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::{
    CacheInvalidator, CacheLoader, DataSource, DataStore, DistributedCache, EntryView,
    ExtensionContext, ExtensionRegistry, InvalidatorElement, Loadable, Storable,
};
pub use clock::{Clock, ManualWallClock, Time, WallClock};
pub use config::{
    CacheConfig, DataStoreConfig, EvictionConfig, EvictionPolicy, ExecutionPolicy, ExtensionRef,
    MulticastConfig, MulticastMode, NodeConfig, TransportConfig, WriteMode,
};
pub use error::{Error, ErrorKind, Result};
pub use node::{CacheNode, CacheNodeBuilder};
pub use types::{BucketId, CacheStats, ClusterNodeAddress, GroupKey, GroupType, NodeStatus};

// Re-export cluster types
pub use cluster::{ClusterEvent, ClusterEventListener, LoggingEventListener, ReplicatedState};

// Re-export execution types
pub use executor::{Aggregator, Collect, CountEntries, EntryFilter, Executable, KeyPrefixFilter, Sum};

// Re-export partitioning types
pub use partitioning::{BucketEventListener, Group, OwnershipRole};

// Re-export metrics types
pub use metrics::{CacheMetrics, TransportMetricsSnapshot};

// Re-export testing types
pub use testing::TestCluster;
