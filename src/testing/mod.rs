//! Testing utilities for the distributed cache.
//!
//! [`TestCluster`] starts real [`CacheNode`]s on localhost, each on an
//! OS-assigned port, the later ones seeded with the first node's address.
//! Nodes of one cluster can share a manual wall clock so expiration can be
//! tested without sleeping.
//!
//! # Example
//!
//! ```rust,ignore
//! use cachegrid::testing::TestCluster;
//! use cachegrid::CacheConfig;
//! use std::time::Duration;
//!
//! let cluster = TestCluster::builder().with_size(3).start().await?;
//! let caches = cluster.create_cache(CacheConfig::new("orders")).await?;
//! assert!(cluster.wait_stable("orders", Duration::from_secs(10)).await);
//! caches[0].put("o1", "42").await?;
//! assert_eq!(caches[2].get("o1").await?.as_deref(), Some(&b"42"[..]));
//! cluster.shutdown().await;
//! ```

mod cache_tests;
mod cluster_tests;
mod utils;

pub use utils::{local_node_config, wait_for, wait_for_result};

#[cfg(test)]
pub(crate) use utils::init_tracing;

use crate::cache::{DistributedCache, ExtensionRegistry};
use crate::clock::{Clock, ManualWallClock};
use crate::config::{CacheConfig, NodeConfig};
use crate::error::{MembershipError, Result};
use crate::node::CacheNode;
use crate::types::GroupKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

type Configure = Box<dyn Fn(NodeConfig) -> NodeConfig + Send + Sync>;

/// Builds a [`TestCluster`].
pub struct TestClusterBuilder {
    size: usize,
    registry: Arc<ExtensionRegistry>,
    manual_clock: Option<i64>,
    configure: Option<Configure>,
}

impl TestClusterBuilder {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Registry shared by every node.
    pub fn with_registry(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Drive every node's clock from one manual wall clock starting at
    /// `start_millis`.
    pub fn with_manual_clock(mut self, start_millis: i64) -> Self {
        self.manual_clock = Some(start_millis);
        self
    }

    /// Adjust each node's configuration after the defaults are applied.
    pub fn with_node_config<F>(mut self, configure: F) -> Self
    where
        F: Fn(NodeConfig) -> NodeConfig + Send + Sync + 'static,
    {
        self.configure = Some(Box::new(configure));
        self
    }

    /// Start the nodes one after another.
    pub async fn start(self) -> Result<TestCluster> {
        let mut cluster = TestCluster {
            nodes: Vec::with_capacity(self.size),
            registry: self.registry,
            wall: self.manual_clock.map(|start| Arc::new(ManualWallClock::new(start))),
            configure: self.configure,
            started_at: Instant::now(),
        };
        for _ in 0..self.size {
            cluster.add_node().await?;
        }
        info!(nodes = cluster.node_count(), "Test cluster started");
        Ok(cluster)
    }
}

/// A localhost cluster for integration tests.
pub struct TestCluster {
    nodes: Vec<CacheNode>,
    registry: Arc<ExtensionRegistry>,
    wall: Option<Arc<ManualWallClock>>,
    configure: Option<Configure>,
    started_at: Instant,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder {
            size: 1,
            registry: Arc::new(ExtensionRegistry::new()),
            manual_clock: None,
            configure: None,
        }
    }

    /// Start `size` nodes with default settings.
    pub async fn start(size: usize) -> Result<Self> {
        Self::builder().with_size(size).start().await
    }

    /// Start one more node, seeded with the current members.
    pub async fn add_node(&mut self) -> Result<&CacheNode> {
        let seeds = self
            .nodes
            .iter()
            .map(|node| node.local_address().socket_addr())
            .collect();
        let mut config = local_node_config(seeds);
        if let Some(configure) = &self.configure {
            config = configure(config);
        }

        let mut builder = CacheNode::builder(config).with_registry(self.registry.clone());
        if let Some(wall) = &self.wall {
            builder = builder.with_clock(Arc::new(Clock::with_wall_clock(wall.clone())));
        }
        let node = builder.start().await?;
        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub fn node(&self, index: usize) -> &CacheNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[CacheNode] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Take a node out of the cluster's bookkeeping, leaving it running.
    pub fn take_node(&mut self, index: usize) -> CacheNode {
        self.nodes.remove(index)
    }

    /// Wall clock driving the nodes, when built with a manual clock.
    pub fn wall_clock(&self) -> Option<&Arc<ManualWallClock>> {
        self.wall.as_ref()
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Create the cache on every node, in node order.
    pub async fn create_cache(&self, config: CacheConfig) -> Result<Vec<DistributedCache>> {
        let mut caches = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            caches.push(node.create_cache(config.clone()).await?);
        }
        Ok(caches)
    }

    /// Wait until every node sees the same settled ownership of `cache`:
    /// all nodes in the group, every bucket owned, no transfer in flight.
    pub async fn wait_stable(&self, cache: &str, timeout: Duration) -> bool {
        let key = GroupKey::cache(cache);
        wait_for(|| self.is_stable(&key), timeout, Duration::from_millis(50)).await
    }

    fn is_stable(&self, key: &GroupKey) -> bool {
        let mut maps = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let state = node.replicated_state();
            let Some(group) = state.group(key) else {
                return false;
            };
            let settled = group.members().len() == self.nodes.len()
                && group.transfers_in_flight() == 0
                && group.unowned_buckets().is_empty();
            if !settled {
                return false;
            }
            maps.push(group.group_map());
        }
        maps.windows(2).all(|pair| pair[0] == pair[1])
    }

    /// Wait until every node's member list has `count` entries.
    pub async fn wait_for_members(&self, count: usize, timeout: Duration) -> Result<()> {
        let converged = wait_for(
            || self.nodes.iter().all(|node| node.members().len() == count),
            timeout,
            Duration::from_millis(50),
        )
        .await;
        if converged {
            Ok(())
        } else {
            Err(MembershipError::JoinFailed(format!("cluster did not reach {count} members")).into())
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop every node without handing buckets off.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
