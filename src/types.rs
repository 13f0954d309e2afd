//! Core types used throughout the distributed cache.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Index of a bucket within a group's keyspace.
pub type BucketId = u32;

/// Identity of a cluster node.
///
/// Equality, hashing and ordering consider the addresses and the port only;
/// `process_id` tells restarted processes apart in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeAddress {
    /// Addresses the node is reachable on, preferred first.
    pub addresses: Vec<IpAddr>,
    /// TCP (and UDP) port of the node.
    pub port: u16,
    /// Distinguishes processes that reuse an address.
    pub process_id: u32,
}

impl ClusterNodeAddress {
    /// Create an address for a process listening on `addr`.
    pub fn new(addr: SocketAddr, process_id: u32) -> Self {
        Self {
            addresses: vec![addr.ip()],
            port: addr.port(),
            process_id,
        }
    }

    /// Address used to contact the node.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self
            .addresses
            .first()
            .copied()
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        SocketAddr::new(ip, self.port)
    }
}

impl From<SocketAddr> for ClusterNodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr, 0)
    }
}

impl PartialEq for ClusterNodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.addresses == other.addresses
    }
}

impl Eq for ClusterNodeAddress {}

impl Hash for ClusterNodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for ClusterNodeAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterNodeAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addresses
            .cmp(&other.addresses)
            .then(self.port.cmp(&other.port))
    }
}

impl fmt::Display for ClusterNodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Kind of replicated group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupType {
    /// A partitioned cache.
    Cache,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupType::Cache => write!(f, "cache"),
        }
    }
}

/// Identifies one managed group (one configured cache).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub group_type: GroupType,
    pub name: String,
}

impl GroupKey {
    pub fn new(group_type: GroupType, name: impl Into<String>) -> Self {
        Self {
            group_type,
            name: name.into(),
        }
    }

    /// Key of the group backing the cache `name`.
    pub fn cache(name: impl Into<String>) -> Self {
        Self::new(GroupType::Cache, name)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_type, self.name)
    }
}

/// Lifecycle of a node's view of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Looking for a cluster to join.
    Joining,
    /// Receiving the full replicated state.
    Syncing,
    /// Serving reads and writes.
    Operational,
    /// Left the cluster or shut down.
    Stopped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Syncing => "syncing",
            NodeStatus::Operational => "operational",
            NodeStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Cache statistics for the local node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries held by this node, backup copies included.
    pub entry_count: u64,
    /// Approximate size of keys and values in bytes.
    pub byte_size: u64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (read-through loads included).
    pub misses: u64,
    /// Entries evicted to respect capacity limits.
    pub evictions: u64,
    /// Entries dropped because they expired.
    pub expirations: u64,
    /// Entries dropped because they were invalidated.
    pub invalidations: u64,
    /// Values fetched from the data source on a miss.
    pub read_through_loads: u64,
    /// Failed writes to the data store.
    pub write_through_failures: u64,
}

impl CacheStats {
    /// Fraction of lookups that were hits.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_identity_ignores_process_id() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let a = ClusterNodeAddress::new(addr, 1);
        let b = ClusterNodeAddress::new(addr, 2);
        assert_eq!(a, b);
        assert_eq!(a.socket_addr(), addr);

        let c = ClusterNodeAddress::from("127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        assert!(a < c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_group_key_display() {
        let key = GroupKey::cache("orders");
        assert_eq!(key.to_string(), "cache:orders");
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
