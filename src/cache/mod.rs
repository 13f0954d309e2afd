//! Partitioned cache API.
//!
//! A [`DistributedCache`] is a cheap handle onto one configured cache. Every
//! call resolves the owner of the key's bucket from the latest published
//! cluster state and sends the operation either straight into the local store
//! processor's mailbox or to the owner's store processor over the network.
//!
//! Ownership can move while a call is in flight. The receiving store answers
//! with a retryable error in that case and the handle retries after
//! re-resolving the owner, backing off, until the cache's operation timeout.

pub mod entry;
pub mod extensions;
pub mod processor;
pub mod storage;
pub mod write_behind;

pub use entry::{CacheEntry, EntryView};
pub use extensions::{
    CacheExtensions, CacheInvalidator, CacheLoader, DataSource, DataStore, ExtensionContext,
    ExtensionRegistry, InvalidatorElement, Loadable, Storable,
};
pub use processor::{StoreCommand, StoreContext, StoreProcessor};
pub use storage::{EntryStore, Lookup, PutOutcome};

use crate::cluster::{ClusterHandle, ReplicatedState};
use crate::config::{CacheConfig, ExtensionRef};
use crate::error::{ConfigError, Error, MembershipError, Result, StoreError};
use crate::executor::{Aggregator, CountEntries, ScatterGather, Sum};
use crate::metrics::CacheMetrics;
use crate::network::message::{CacheRequest, CacheResponse};
use crate::network::router::Router;
use crate::partitioning::{bucket_of, BucketEventListener};
use crate::processor::ProcessorHandle;
use crate::rebalancing::entry_wire_size;
use crate::types::{BucketId, CacheStats, ClusterNodeAddress, GroupKey, NodeStatus};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Sends operations to whichever store processor owns them.
#[derive(Clone)]
pub(crate) struct StoreClient {
    key: GroupKey,
    local: ClusterNodeAddress,
    store: ProcessorHandle<StoreCommand>,
    router: Arc<Router>,
    cluster: ClusterHandle,
}

impl StoreClient {
    pub(crate) fn new(
        key: GroupKey,
        store: ProcessorHandle<StoreCommand>,
        router: Arc<Router>,
        cluster: ClusterHandle,
    ) -> Self {
        Self {
            key,
            local: router.local().clone(),
            store,
            router,
            cluster,
        }
    }

    pub(crate) fn key(&self) -> &GroupKey {
        &self.key
    }

    pub(crate) fn state(&self) -> Arc<ReplicatedState> {
        self.cluster.state()
    }

    pub(crate) fn ensure_operational(&self) -> Result<()> {
        match self.cluster.status() {
            NodeStatus::Operational => Ok(()),
            NodeStatus::Stopped => Err(Error::Shutdown),
            status => Err(MembershipError::NotOperational(status.to_string()).into()),
        }
    }

    /// Current primary of the bucket holding `key`.
    pub(crate) fn owner_of(&self, key: &[u8]) -> Result<(BucketId, ClusterNodeAddress)> {
        let state = self.state();
        let group = state
            .group(&self.key)
            .ok_or_else(|| MembershipError::GroupNotFound(self.key.clone()))?;
        match group.owner_of(key) {
            (bucket, Some(owner)) => Ok((bucket, owner.clone())),
            (bucket, None) => Err(Error::BucketUnowned {
                group: self.key.clone(),
                bucket,
            }),
        }
    }

    /// One attempt at `op` on `owner`, bounded by `deadline`.
    pub(crate) async fn send(
        &self,
        owner: &ClusterNodeAddress,
        op: CacheRequest,
        deadline: Instant,
    ) -> Result<CacheResponse> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }
        if *owner == self.local {
            self.store
                .request_timeout(remaining, |reply| StoreCommand::Local { op, reply })
                .await?
        } else {
            self.router.request(owner, &self.key, op, remaining).await
        }
    }
}

/// Reject an entry that cannot be carried by a single message, since it
/// could be neither replicated nor handed off.
pub(crate) fn check_entry_size(key: &[u8], value: &[u8], budget: usize) -> Result<()> {
    let size = entry_wire_size(key.len(), value.len());
    if size > budget {
        return Err(StoreError::EntryTooLarge {
            size: size as u64,
            max: budget as u64,
        }
        .into());
    }
    Ok(())
}

/// Milliseconds of a TTL, saturating for durations beyond `u64`.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Exponential retry delay capped at [`MAX_BACKOFF`].
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
    deadline: Instant,
}

impl Backoff {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            next: INITIAL_BACKOFF,
            deadline,
        }
    }

    /// Sleep before the next attempt. Returns `false` when the deadline would
    /// pass first.
    pub(crate) async fn wait(&mut self) -> bool {
        if Instant::now() + self.next >= self.deadline {
            return false;
        }
        tokio::time::sleep(self.next).await;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        true
    }
}

/// Handle onto one partitioned cache. Cheap to clone.
#[derive(Clone)]
pub struct DistributedCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: CacheConfig,
    client: StoreClient,
    scatter: ScatterGather,
    registry: Arc<ExtensionRegistry>,
    metrics: Arc<CacheMetrics>,
}

impl DistributedCache {
    pub(crate) fn new(
        config: CacheConfig,
        client: StoreClient,
        registry: Arc<ExtensionRegistry>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let scatter = ScatterGather::new(
            client.clone(),
            config.execution_policy,
            config.operation_timeout,
        );
        Self {
            inner: Arc::new(CacheInner {
                config,
                client,
                scatter,
                registry,
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get a value, consulting the data source on a miss if one is configured.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        let key = Bytes::copy_from_slice(key.as_ref());
        let timer = self.inner.metrics.get_latency.start_timer();
        let response = self.invoke(&key, CacheRequest::Get { key: key.clone() }).await;
        drop(timer);
        into_value(response?)
    }

    /// Store a value with the cache's default TTL. Returns the previous value.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.write(key.into(), value.into(), None, false).await
    }

    /// Store a value expiring `ttl` after the write.
    pub async fn put_with_ttl(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<Option<Bytes>> {
        self.write(key.into(), value.into(), Some(ttl), false).await
    }

    /// Store a value unless a live one exists. Returns the existing value, or
    /// `None` when the write happened.
    pub async fn put_if_absent(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Option<Bytes>> {
        self.write(key.into(), value.into(), None, true).await
    }

    async fn write(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<Option<Bytes>> {
        check_entry_size(&key, &value, self.inner.client.router.entry_budget())?;
        let op = CacheRequest::Put {
            key: key.clone(),
            value,
            ttl_ms: ttl.map(ttl_millis),
            if_absent,
        };
        let timer = self.inner.metrics.put_latency.start_timer();
        let response = self.invoke(&key, op).await;
        drop(timer);
        into_value(response?)
    }

    /// Remove a key. Returns the value it held.
    pub async fn remove(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        let key = Bytes::copy_from_slice(key.as_ref());
        into_value(self.invoke(&key, CacheRequest::Remove { key: key.clone() }).await?)
    }

    pub async fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = Bytes::copy_from_slice(key.as_ref());
        into_bool(self.invoke(&key, CacheRequest::ContainsKey { key: key.clone() }).await?)
    }

    /// Mark an entry invalid; it is dropped on its next access. Returns
    /// whether an entry was marked.
    pub async fn invalidate(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = Bytes::copy_from_slice(key.as_ref());
        into_bool(self.invoke(&key, CacheRequest::Invalidate { key: key.clone() }).await?)
    }

    /// Values of every key that has one. Keys are batched per owner.
    pub async fn get_all<K, I>(&self, keys: I) -> Result<HashMap<Bytes, Bytes>>
    where
        K: AsRef<[u8]>,
        I: IntoIterator<Item = K>,
    {
        let keys: Vec<Bytes> = keys
            .into_iter()
            .map(|k| Bytes::copy_from_slice(k.as_ref()))
            .collect();
        let responses = self
            .per_owner(keys, |k| k, |keys| CacheRequest::GetAll { keys })
            .await?;

        let mut found = HashMap::new();
        for response in responses {
            match response {
                CacheResponse::Values(values) => {
                    found.extend(values.into_iter().filter_map(|(k, v)| Some((k, v?))));
                }
                other => return Err(unexpected(&other)),
            }
        }
        Ok(found)
    }

    /// Store every entry with the default TTL. Entries are batched per owner.
    pub async fn put_all<K, V, I>(&self, entries: I) -> Result<()>
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
        I: IntoIterator<Item = (K, V)>,
    {
        let entries: Vec<(Bytes, Bytes)> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let budget = self.inner.client.router.entry_budget();
        for (key, value) in &entries {
            check_entry_size(key, value, budget)?;
        }
        self.per_owner(entries, |(k, _)| k, |entries| CacheRequest::PutAll {
            entries,
            ttl_ms: None,
        })
        .await?;
        Ok(())
    }

    /// Run `executable` over every owner's entries and combine the partial
    /// results with `aggregator`.
    pub async fn execute<A: Aggregator>(
        &self,
        executable: ExtensionRef,
        filter: Option<ExtensionRef>,
        aggregator: &A,
    ) -> Result<A::Output> {
        let registry = &self.inner.registry;
        if !registry.has_executable(&executable.name) {
            return Err(ConfigError::UnknownExtension {
                kind: "executable",
                name: executable.name,
            }
            .into());
        }
        if let Some(filter) = filter.as_ref().filter(|f| !registry.has_filter(&f.name)) {
            return Err(ConfigError::UnknownExtension {
                kind: "filter",
                name: filter.name.clone(),
            }
            .into());
        }

        let timer = self.inner.metrics.execute_latency.start_timer();
        let result = self.inner.scatter.execute(executable, filter, aggregator).await;
        drop(timer);
        if let Err(e) = &result {
            self.inner.metrics.record_error(e);
        }
        result
    }

    /// Entries held across the cluster.
    pub async fn size(&self) -> Result<u64> {
        self.execute(ExtensionRef::new(CountEntries::NAME), None, &Sum).await
    }

    /// Drop every entry across the cluster. Returns how many were dropped.
    pub async fn clear(&self) -> Result<u64> {
        let result = self.inner.scatter.clear().await;
        if let Err(e) = &result {
            self.inner.metrics.record_error(e);
        }
        result
    }

    /// Node currently owning `key`, if its bucket has an owner.
    pub fn owner_of(&self, key: impl AsRef<[u8]>) -> Option<ClusterNodeAddress> {
        self.inner.client.owner_of(key.as_ref()).ok().map(|(_, owner)| owner)
    }

    pub fn bucket_of(&self, key: impl AsRef<[u8]>) -> BucketId {
        bucket_of(key.as_ref(), self.inner.config.bucket_count)
    }

    /// Buckets this node currently owns.
    pub fn local_buckets(&self) -> Vec<BucketId> {
        let state = self.inner.client.state();
        state
            .group(self.inner.client.key())
            .map(|g| g.owned_buckets(&self.inner.client.local))
            .unwrap_or_default()
    }

    /// Statistics of this node's share of the cache.
    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.stats()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Be told when buckets of this cache change primary owner.
    pub fn add_bucket_listener(&self, listener: Arc<dyn BucketEventListener>) -> Result<()> {
        self.inner.client.store.enqueue(StoreCommand::AddListener(listener))
    }

    pub(crate) async fn load(&self, timeout: Duration) -> Result<usize> {
        self.inner
            .client
            .store
            .request_timeout(timeout, |reply| StoreCommand::Load { reply })
            .await?
    }

    /// Send a single-key operation to the key's owner, retrying retryable
    /// failures until the operation timeout.
    async fn invoke(&self, key: &[u8], op: CacheRequest) -> Result<CacheResponse> {
        let deadline = Instant::now() + self.inner.config.operation_timeout;
        let mut backoff = Backoff::new(deadline);
        loop {
            let result = self.attempt(key, op.clone(), deadline).await;
            match result {
                Err(e) if e.is_retryable() => {
                    trace!(cache = %self.name(), op = op.name(), error = %e, "Retrying");
                    if !backoff.wait().await {
                        self.inner.metrics.record_error(&e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.inner.metrics.record_error(&e);
                    return Err(e);
                }
                Ok(response) => return Ok(response),
            }
        }
    }

    async fn attempt(&self, key: &[u8], op: CacheRequest, deadline: Instant) -> Result<CacheResponse> {
        let client = &self.inner.client;
        client.ensure_operational()?;
        let (_, owner) = client.owner_of(key)?;
        client.send(&owner, op, deadline).await
    }

    /// Group items by the owner of their key, send one request per owner and
    /// retry the groups that failed with a retryable error.
    async fn per_owner<T, K, B>(&self, items: Vec<T>, key_of: K, build: B) -> Result<Vec<CacheResponse>>
    where
        T: Clone + Send + 'static,
        K: Fn(&T) -> &Bytes,
        B: Fn(Vec<T>) -> CacheRequest,
    {
        let client = &self.inner.client;
        let deadline = Instant::now() + self.inner.config.operation_timeout;
        let mut backoff = Backoff::new(deadline);
        let mut remaining = items;
        let mut responses = Vec::new();

        while !remaining.is_empty() {
            let mut last_error = None;
            let mut retry = Vec::new();

            let round = client.ensure_operational().and_then(|()| {
                let mut groups: BTreeMap<ClusterNodeAddress, Vec<T>> = BTreeMap::new();
                for item in remaining.drain(..) {
                    match client.owner_of(key_of(&item)) {
                        Ok((_, owner)) => groups.entry(owner).or_default().push(item),
                        Err(e) if e.is_retryable() => {
                            retry.push(item);
                            last_error = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(groups)
            });
            let groups = match round {
                Ok(groups) => groups,
                Err(e) if e.is_retryable() => {
                    last_error = Some(e);
                    BTreeMap::new()
                }
                Err(e) => {
                    self.inner.metrics.record_error(&e);
                    return Err(e);
                }
            };

            let mut requests = JoinSet::new();
            for (owner, group) in groups {
                let client = client.clone();
                let op = build(group.clone());
                requests.spawn(async move {
                    let result = client.send(&owner, op, deadline).await;
                    (group, result)
                });
            }
            while let Some(joined) = requests.join_next().await {
                let (group, result) = joined.map_err(|e| Error::Internal(e.to_string()))?;
                match result {
                    Ok(response) => responses.push(response),
                    Err(e) if e.is_retryable() => {
                        debug!(cache = %self.name(), items = group.len(), error = %e, "Retrying batch");
                        retry.extend(group);
                        last_error = Some(e);
                    }
                    Err(e) => {
                        self.inner.metrics.record_error(&e);
                        return Err(e);
                    }
                }
            }

            remaining = retry;
            if !remaining.is_empty() && !backoff.wait().await {
                let e = last_error.unwrap_or(Error::Timeout);
                self.inner.metrics.record_error(&e);
                return Err(e);
            }
        }
        Ok(responses)
    }
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache")
            .field("name", &self.inner.config.name)
            .field("local", &self.inner.client.local)
            .finish()
    }
}

fn into_value(response: CacheResponse) -> Result<Option<Bytes>> {
    match response {
        CacheResponse::Value(value) => Ok(value),
        other => Err(unexpected(&other)),
    }
}

fn into_bool(response: CacheResponse) -> Result<bool> {
    match response {
        CacheResponse::Bool(value) => Ok(value),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &CacheResponse) -> Error {
    Error::Internal(format!("unexpected response {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_until_deadline() {
        let start = Instant::now();
        let mut backoff = Backoff::new(start + Duration::from_millis(100));

        assert!(backoff.wait().await);
        assert_eq!(start.elapsed(), Duration::from_millis(10));
        assert!(backoff.wait().await);
        assert!(backoff.wait().await);
        assert_eq!(start.elapsed(), Duration::from_millis(70));
        // 70ms + 80ms passes the deadline.
        assert!(!backoff.wait().await);
    }

    #[test]
    fn test_huge_ttl_saturates() {
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5_000);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_entry_size_against_frame_budget() {
        assert!(check_entry_size(b"k", &[0u8; 100], 1024).is_ok());
        let err = check_entry_size(b"k", &[0u8; 2000], 1024).unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::EntryTooLarge { max: 1024, .. })
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_response_conversions() {
        let value = Bytes::from_static(b"v");
        assert_eq!(into_value(CacheResponse::Value(Some(value.clone()))).unwrap(), Some(value));
        assert!(into_bool(CacheResponse::Bool(true)).unwrap());
        assert!(matches!(into_value(CacheResponse::Done), Err(Error::Internal(_))));
    }
}
