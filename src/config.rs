//! Configuration types for the distributed cache.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Default number of buckets per cache.
pub const DEFAULT_BUCKET_COUNT: u32 = 271;

/// Node-level configuration: identity, discovery and transport.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind the TCP listener and the UDP socket to.
    pub bind_addr: SocketAddr,

    /// Address announced to other nodes. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,

    /// Nodes only talk to nodes with the same cluster name.
    pub cluster_name: String,

    /// Known members to contact when joining.
    pub seeds: Vec<SocketAddr>,

    /// Point-to-point transport settings.
    pub transport: TransportConfig,

    /// Group delivery settings.
    pub multicast: MulticastConfig,

    /// Silence after which a peer is considered unreachable.
    pub network_timeout: Duration,

    /// Interval between liveness pings.
    pub ping_interval: Duration,

    /// How long to wait for a seed to answer a join request.
    pub join_timeout: Duration,

    /// Number of sequenced updates kept for retransmission.
    pub retransmit_buffer: usize,

    /// Start a new cluster when no seed answers within `join_timeout`.
    pub form_cluster_on_join_timeout: bool,

    /// Upper bound for handing off buckets on graceful leave.
    pub leave_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            advertise_addr: None,
            cluster_name: "cachegrid".to_string(),
            seeds: Vec::new(),
            transport: TransportConfig::default(),
            multicast: MulticastConfig::default(),
            network_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_millis(500),
            join_timeout: Duration::from_secs(3),
            retransmit_buffer: 1024,
            form_cluster_on_join_timeout: true,
            leave_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    /// Create a configuration bound to `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the seed addresses used to join an existing cluster.
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_multicast(mut self, multicast: MulticastConfig) -> Self {
        self.multicast = multicast;
        self
    }

    /// Set the silence threshold for failure detection.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_retransmit_buffer(mut self, updates: usize) -> Self {
        self.retransmit_buffer = updates;
        self
    }

    /// Whether to form a new cluster when no seed answers.
    pub fn with_form_cluster_on_join_timeout(mut self, enabled: bool) -> Self {
        self.form_cluster_on_join_timeout = enabled;
        self
    }

    pub fn with_leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }

    /// Address other nodes use to reach this node.
    pub fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        self.advertise_addr.unwrap_or(bound)
    }

    /// Check the settings for values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "cluster_name",
                reason: "must not be empty".into(),
            });
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.network_timeout {
            return Err(ConfigError::Invalid {
                field: "ping_interval",
                reason: format!(
                    "must be non-zero and shorter than network_timeout ({:?})",
                    self.network_timeout
                ),
            });
        }
        if self.retransmit_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "retransmit_buffer",
                reason: "must hold at least one update".into(),
            });
        }
        self.transport.validate()
    }
}

/// Point-to-point (TCP) transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection attempts per envelope before it is reported undeliverable.
    pub max_retries: usize,

    /// Delay between connection attempts.
    pub retry_delay: Duration,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for writing one frame.
    pub write_timeout: Duration,

    /// Largest frame accepted on a stream.
    pub max_frame_size: usize,

    /// Largest frame sent as a datagram.
    pub multicast_frame_size: usize,
}

/// Smallest accepted `max_frame_size`.
pub const MIN_FRAME_SIZE: usize = 4096;

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            max_frame_size: 16 * 1024 * 1024,
            multicast_frame_size: 1460,
        }
    }
}

impl TransportConfig {
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_multicast_frame_size(mut self, size: usize) -> Self {
        self.multicast_frame_size = size;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: format!("must be at least {MIN_FRAME_SIZE} bytes"),
            });
        }
        if self.multicast_frame_size > self.max_frame_size {
            return Err(ConfigError::Invalid {
                field: "multicast_frame_size",
                reason: "must not exceed max_frame_size".into(),
            });
        }
        if self.multicast_frame_size > 65_507 {
            return Err(ConfigError::Invalid {
                field: "multicast_frame_size",
                reason: "must fit a UDP datagram".into(),
            });
        }
        Ok(())
    }
}

/// How best-effort group messages reach members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MulticastMode {
    /// One datagram per member, sent to each member's own address.
    #[default]
    UdpFanout,
    /// One datagram to an IP multicast group all members joined.
    Group(SocketAddr),
}

/// Group delivery configuration.
#[derive(Debug, Clone, Default)]
pub struct MulticastConfig {
    pub mode: MulticastMode,
}

impl MulticastConfig {
    /// Use a real IP multicast group.
    pub fn group(addr: SocketAddr) -> Self {
        Self {
            mode: MulticastMode::Group(addr),
        }
    }
}

/// A pluggable component named by its registry key plus free-form properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRef {
    /// Registry key of the factory.
    pub name: String,

    /// Properties handed to the factory.
    pub properties: BTreeMap<String, String>,
}

impl ExtensionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Order in which entries are evicted once a bound is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Oldest insertion first; reads do not refresh position.
    Fifo,
}

/// Bounds for the local entry store.
#[derive(Debug, Clone, Default)]
pub struct EvictionConfig {
    pub policy: EvictionPolicy,

    /// Maximum number of entries held by this node for the cache.
    pub max_elements: Option<usize>,

    /// Maximum total size of keys and values in bytes.
    pub max_bytes: Option<u64>,
}

impl EvictionConfig {
    pub fn lru(max_elements: usize) -> Self {
        Self {
            policy: EvictionPolicy::Lru,
            max_elements: Some(max_elements),
            max_bytes: None,
        }
    }

    pub fn fifo(max_elements: usize) -> Self {
        Self {
            policy: EvictionPolicy::Fifo,
            max_elements: Some(max_elements),
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

/// When write-through reaches the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Inside the write, before the caller gets an answer.
    #[default]
    Synchronous,
    /// Queued and flushed in batches by a background task.
    Queued {
        batch_size: usize,
        flush_interval: Duration,
    },
}

/// Write-through data store and how it is driven.
#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    pub extension: ExtensionRef,
    pub mode: WriteMode,
}

/// What scatter-gather does about buckets that changed owner mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Fail with a partial-result error.
    FailOnPartial,
    /// Re-resolve owners of uncovered buckets and ask again, up to `max_rounds`
    /// times, then aggregate what was collected.
    ReissueOnChange { max_rounds: usize },
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        ExecutionPolicy::ReissueOnChange { max_rounds: 3 }
    }
}

/// Configuration of one partitioned cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name, unique within the cluster.
    pub name: String,

    /// Number of buckets the keyspace is split into. Fixed for the cache's lifetime.
    pub bucket_count: u32,

    /// Backups kept for every bucket.
    pub replica_count: u32,

    pub eviction: EvictionConfig,

    /// TTL for writes that do not carry one.
    pub default_ttl: Option<Duration>,

    pub invalidator: Option<ExtensionRef>,

    pub data_store: Option<DataStoreConfig>,

    /// Read-through source consulted on a miss.
    pub data_source: Option<ExtensionRef>,

    /// Loader run once when the cache is created.
    pub loader: Option<ExtensionRef>,

    /// Deadline for a single API call, retries included.
    pub operation_timeout: Duration,

    pub execution_policy: ExecutionPolicy,

    /// Entries per batch when handing a bucket to a new owner.
    pub transfer_batch_size: usize,

    /// Period of the background sweep of expired entries. Expired entries are
    /// always dropped on access.
    pub expiration_sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            replica_count: 0,
            eviction: EvictionConfig::default(),
            default_ttl: None,
            invalidator: None,
            data_store: None,
            data_source: None,
            loader: None,
            operation_timeout: Duration::from_secs(5),
            execution_policy: ExecutionPolicy::default(),
            transfer_batch_size: 256,
            expiration_sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Create a configuration for the cache `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_bucket_count(mut self, buckets: u32) -> Self {
        self.bucket_count = buckets;
        self
    }

    pub fn with_replica_count(mut self, replicas: u32) -> Self {
        self.replica_count = replicas;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Set default TTL for cache entries.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_invalidator(mut self, invalidator: ExtensionRef) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Attach a write-through data store.
    pub fn with_data_store(mut self, extension: ExtensionRef, mode: WriteMode) -> Self {
        self.data_store = Some(DataStoreConfig { extension, mode });
        self
    }

    pub fn with_data_source(mut self, source: ExtensionRef) -> Self {
        self.data_source = Some(source);
        self
    }

    pub fn with_loader(mut self, loader: ExtensionRef) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = policy;
        self
    }

    pub fn with_transfer_batch_size(mut self, entries: usize) -> Self {
        self.transfer_batch_size = entries;
        self
    }

    pub fn with_expiration_sweep(mut self, interval: Duration) -> Self {
        self.expiration_sweep_interval = Some(interval);
        self
    }

    /// Reject settings the cache cannot be created with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        if self.bucket_count == 0 {
            return Err(ConfigError::Invalid {
                field: "bucket_count",
                reason: "must be at least 1".into(),
            });
        }
        if self.eviction.max_elements == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_elements",
                reason: "must be at least 1".into(),
            });
        }
        if self.eviction.max_bytes == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_bytes",
                reason: "must be at least 1".into(),
            });
        }
        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigError::Invalid {
                field: "default_ttl",
                reason: "must be positive".into(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "operation_timeout",
                reason: "must be positive".into(),
            });
        }
        if self.transfer_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if let Some(DataStoreConfig {
            mode: WriteMode::Queued { batch_size, flush_interval },
            ..
        }) = &self.data_store
        {
            if *batch_size == 0 || flush_interval.is_zero() {
                return Err(ConfigError::Invalid {
                    field: "data_store.mode",
                    reason: "queued writes need a positive batch size and flush interval".into(),
                });
            }
        }
        if let ExecutionPolicy::ReissueOnChange { max_rounds: 0 } = self.execution_policy {
            return Err(ConfigError::Invalid {
                field: "execution_policy",
                reason: "max_rounds must be at least 1".into(),
            });
        }
        Ok(())
    }
}
