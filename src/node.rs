//! A cluster node: the network stack, the cluster processor and one store
//! processor per cache, started and stopped together.
//!
//! # Example
//!
//! ```rust,no_run
//! use cachegrid::{CacheConfig, CacheNode, NodeConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> cachegrid::Result<()> {
//! let node = CacheNode::builder(NodeConfig::new("127.0.0.1:7400".parse().unwrap()))
//!     .start()
//!     .await?;
//!
//! let orders = node
//!     .create_cache(CacheConfig::new("orders").with_bucket_count(17))
//!     .await?;
//! orders.put_with_ttl("o-1", "42", Duration::from_secs(5)).await?;
//! assert_eq!(orders.get("o-1").await?.as_deref(), Some(&b"42"[..]));
//!
//! node.leave().await?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{
    DistributedCache, ExtensionRegistry, StoreClient, StoreCommand, StoreContext, StoreProcessor,
};
use crate::clock::Clock;
use crate::cluster::{ClusterEventListener, ClusterHandle, ClusterProcessor, ReplicatedState};
use crate::config::{CacheConfig, NodeConfig};
use crate::error::{MembershipError, Result, StoreError};
use crate::metrics::{CacheMetrics, TransportMetrics, TransportMetricsSnapshot};
use crate::network::{EnvelopeHandler, Multicast, NetworkServer, Router, Transport};
use crate::processor::ProcessorHandle;
use crate::types::{ClusterNodeAddress, GroupKey, GroupType, NodeStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shutdown waits for background tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configures and starts a [`CacheNode`].
pub struct CacheNodeBuilder {
    config: NodeConfig,
    clock: Option<Arc<Clock>>,
    registry: Option<Arc<ExtensionRegistry>>,
}

impl CacheNodeBuilder {
    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Resolve cache extensions through `registry`.
    pub fn with_registry(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind sockets, join (or form) the cluster and wait until the node is
    /// operational.
    pub async fn start(self) -> Result<CacheNode> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(Clock::system()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ExtensionRegistry::new()));
        let transport_metrics = Arc::new(TransportMetrics::new());

        let server = NetworkServer::bind(
            config.bind_addr,
            config.cluster_name.clone(),
            config.transport.clone(),
            transport_metrics.clone(),
        )
        .await?;
        let advertised = config.advertised(server.local_addr());
        let local = ClusterNodeAddress::new(advertised, rand::random());

        let multicast = Arc::new(
            Multicast::bind(
                local.clone(),
                &config.multicast,
                config.transport.multicast_frame_size,
                transport_metrics.clone(),
            )
            .await?,
        );

        let cancel = CancellationToken::new();
        let (transport, failures) = Transport::new(
            local.clone(),
            config.cluster_name.clone(),
            config.transport.clone(),
            transport_metrics.clone(),
            &cancel,
        );
        let router = Arc::new(Router::new(
            clock.clone(),
            transport,
            Some(multicast.clone()),
            config.network_timeout,
        ));

        let handler: Arc<dyn EnvelopeHandler> = router.clone();
        let mut tasks = vec![
            tokio::spawn(server.run(handler.clone(), cancel.child_token())),
            tokio::spawn(multicast.run(handler, cancel.child_token())),
            tokio::spawn(router.clone().run_failure_listener(failures, cancel.child_token())),
        ];
        let (cluster, cluster_task) = ClusterProcessor::spawn(router.clone(), config.clone(), &cancel);
        tasks.push(cluster_task);

        let node = CacheNode {
            local,
            clock,
            registry,
            router,
            cluster,
            transport_metrics,
            caches: Mutex::new(HashMap::new()),
            cancel,
            tasks: Mutex::new(tasks),
            config,
        };

        let wait = node.config.join_timeout + node.config.network_timeout;
        if let Err(e) = node.cluster.wait_for_status(NodeStatus::Operational, wait).await {
            warn!(node = %node.local, error = %e, "Node did not become operational");
            node.shutdown().await;
            return Err(MembershipError::JoinFailed(format!("not operational after {wait:?}")).into());
        }
        info!(
            node = %node.local,
            members = node.members().len(),
            "Node operational"
        );
        Ok(node)
    }
}

struct CacheSlot {
    cache: DistributedCache,
    store: ProcessorHandle<StoreCommand>,
    task: JoinHandle<()>,
}

/// One member of a cache cluster.
pub struct CacheNode {
    config: NodeConfig,
    local: ClusterNodeAddress,
    clock: Arc<Clock>,
    registry: Arc<ExtensionRegistry>,
    router: Arc<Router>,
    cluster: ClusterHandle,
    transport_metrics: Arc<TransportMetrics>,
    caches: Mutex<HashMap<String, CacheSlot>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheNode {
    pub fn builder(config: NodeConfig) -> CacheNodeBuilder {
        CacheNodeBuilder {
            config,
            clock: None,
            registry: None,
        }
    }

    /// Create a cache on this node and add the node to the cache's group.
    ///
    /// The node whose join creates the cache's group also runs its loader
    /// before the handle is returned. Buckets it hands to nodes joining
    /// meanwhile leave only after the load, so they carry the loaded entries.
    pub async fn create_cache(&self, config: CacheConfig) -> Result<DistributedCache> {
        config.validate()?;
        if self.caches.lock().contains_key(&config.name) {
            return Err(StoreError::CacheExists(config.name).into());
        }
        let extensions = self.registry.resolve_cache(&config, &self.clock)?;
        let has_loader = extensions.loader.is_some();
        let key = GroupKey::cache(config.name.clone());
        let metrics = Arc::new(CacheMetrics::new());

        let ctx = StoreContext {
            router: self.router.clone(),
            cluster: self.cluster.clone(),
            registry: self.registry.clone(),
            metrics: metrics.clone(),
            network_timeout: self.config.network_timeout,
        };
        let (store, task) = StoreProcessor::spawn(config.clone(), extensions, ctx, &self.cancel);
        self.router.register_store(key.clone(), store.clone());

        let timeout = self.group_timeout(&config);
        let created = match self
            .cluster
            .join_group(key.clone(), config.bucket_count, config.replica_count, timeout)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(node = %self.local, cache = %config.name, error = %e, "Cannot join cache group");
                self.router.unregister_store(&key);
                store.stop();
                return Err(e);
            }
        };

        let cache = DistributedCache::new(
            config.clone(),
            StoreClient::new(key.clone(), store.clone(), self.router.clone(), self.cluster.clone()),
            self.registry.clone(),
            metrics,
        );
        self.caches.lock().insert(
            config.name.clone(),
            CacheSlot {
                cache: cache.clone(),
                store: store.clone(),
                task,
            },
        );

        if has_loader && created {
            if let Err(e) = cache.load(timeout).await {
                warn!(node = %self.local, cache = %config.name, error = %e, "Cache loader failed");
                self.destroy_cache(&config.name).await;
                return Err(e);
            }
        } else if has_loader {
            debug!(node = %self.local, cache = %config.name, "Group already loaded elsewhere");
            if let Err(e) = store.enqueue(StoreCommand::SkipLoad) {
                warn!(node = %self.local, cache = %config.name, error = %e, "Store closed before loading");
            }
        }

        info!(node = %self.local, cache = %config.name, buckets = config.bucket_count, "Cache created");
        Ok(cache)
    }

    /// Hand this node's buckets of a cache off and stop serving it.
    pub async fn destroy_cache(&self, name: &str) {
        let Some(slot) = self.caches.lock().remove(name) else {
            return;
        };
        let key = GroupKey::cache(name);
        let timeout = self.group_timeout(slot.cache.config()) + self.config.leave_timeout;
        if let Err(e) = self.cluster.leave_group(key.clone(), timeout).await {
            debug!(node = %self.local, cache = name, error = %e, "Leaving cache group failed");
        }
        self.router.unregister_store(&key);
        slot.store.stop();
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, slot.task).await;
    }

    fn group_timeout(&self, config: &CacheConfig) -> Duration {
        config.operation_timeout.max(self.config.network_timeout)
    }

    /// Handle onto a cache created on this node.
    pub fn cache(&self, name: &str) -> Option<DistributedCache> {
        self.caches.lock().get(name).map(|slot| slot.cache.clone())
    }

    /// Receive cluster events, optionally only those of one group type.
    pub fn subscribe(
        &self,
        group_type: Option<GroupType>,
        listener: Arc<dyn ClusterEventListener>,
    ) -> Result<()> {
        self.cluster.subscribe(group_type, listener)
    }

    pub fn status(&self) -> NodeStatus {
        self.cluster.status()
    }

    /// Current cluster members in join order.
    pub fn members(&self) -> Vec<ClusterNodeAddress> {
        self.cluster.state().member_addresses()
    }

    pub fn local_address(&self) -> &ClusterNodeAddress {
        &self.local
    }

    pub fn replicated_state(&self) -> Arc<ReplicatedState> {
        self.cluster.state()
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn transport_metrics(&self) -> TransportMetricsSnapshot {
        self.transport_metrics.snapshot()
    }

    /// Wait until the node reaches `status`.
    pub async fn wait_for_status(&self, status: NodeStatus, timeout: Duration) -> Result<()> {
        self.cluster.wait_for_status(status, timeout).await
    }

    /// Hand every owned bucket off, leave the cluster and shut down.
    pub async fn leave(&self) -> Result<()> {
        let timeout = self.config.leave_timeout * 2 + self.config.network_timeout;
        let result = self.cluster.leave(timeout).await;
        if let Err(e) = &result {
            warn!(node = %self.local, error = %e, "Graceful leave did not complete");
        }
        self.shutdown().await;
        result
    }

    /// Stop every task without handing buckets off. Other members see this
    /// node fail.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(node = %self.local, "Shutting down node");
        self.cluster.stop();
        self.cancel.cancel();
        self.router.transport().shutdown();
        self.router.fail_pending();

        let slots: Vec<CacheSlot> = self.caches.lock().drain().map(|(_, slot)| slot).collect();
        let mut tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for slot in slots {
            self.router.unregister_store(&GroupKey::cache(slot.cache.name()));
            tasks.push(slot.task);
        }
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(node = %self.local, "Task did not stop in time");
            }
        }
    }
}

impl Drop for CacheNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("local", &self.local)
            .field("status", &self.status())
            .finish()
    }
}
