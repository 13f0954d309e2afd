//! Store processor: the single owner of one cache's entries on this node.
//!
//! Every read, write, transfer batch and replica update for the cache is
//! applied here, one at a time. Topology snapshots from the cluster processor
//! arrive through the same mailbox, so a request is always checked against
//! the ownership table the processor last applied.

use crate::cache::check_entry_size;
use crate::cache::extensions::{CacheExtensions, ExtensionRegistry, Loadable, Storable};
use crate::cache::storage::{EntryStore, Lookup};
use crate::cache::write_behind::{WriteBehind, WriteOp};
use crate::clock::Clock;
use crate::cluster::{ClusterHandle, ReplicatedState};
use crate::config::{CacheConfig, WriteMode};
use crate::error::{Error, MembershipError, Result, StoreError};
use crate::executor::run_local;
use crate::metrics::CacheMetrics;
use crate::network::message::{CacheRequest, CacheResponse, Envelope, Message, ProcessorKey, ReplicaOp};
use crate::network::router::Router;
use crate::partitioning::{BucketEventListener, BucketOwnership, Group, OwnershipRole};
use crate::processor::{Handler, Processor, ProcessorHandle};
use crate::rebalancing::{into_batches, AckOutcome, DueAction, HandoffTracker, TransferBatch, TransferEntry};
use crate::types::{BucketId, ClusterNodeAddress, GroupKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const STORE_TICK: Duration = Duration::from_millis(100);
const TRANSFER_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Messages accepted by a store processor.
pub enum StoreCommand {
    /// Operation issued on this node for a bucket this node owns.
    Local {
        op: CacheRequest,
        reply: oneshot::Sender<Result<CacheResponse>>,
    },
    /// An envelope addressed to this cache.
    Remote(Envelope),
    /// A newly published cluster state.
    Topology(Arc<ReplicatedState>),
    /// Outcome of sending one handoff batch.
    TransferAcked {
        bucket: BucketId,
        transfer_id: u64,
        result: Result<()>,
    },
    /// Run the cache loader over the buckets this node owns, then start the
    /// handoffs held back while loading.
    Load { reply: oneshot::Sender<Result<usize>> },
    /// Another node loads this cache; start the held-back handoffs.
    SkipLoad,
    AddListener(Arc<dyn BucketEventListener>),
}

/// Node services a store processor talks to.
#[derive(Clone)]
pub struct StoreContext {
    pub router: Arc<Router>,
    pub cluster: ClusterHandle,
    pub registry: Arc<ExtensionRegistry>,
    pub metrics: Arc<CacheMetrics>,
    /// Deadline for one handoff batch round trip.
    pub network_timeout: Duration,
}

pub struct StoreProcessor {
    key: GroupKey,
    local: ClusterNodeAddress,
    config: CacheConfig,
    store: EntryStore,
    extensions: CacheExtensions,
    write_behind: Option<WriteBehind>,
    state: Arc<ReplicatedState>,
    handoffs: HandoffTracker,
    listeners: Vec<Arc<dyn BucketEventListener>>,
    /// Outgoing handoffs wait until the loader has run or been skipped, so
    /// loaded entries travel with their buckets.
    awaiting_load: bool,
    clock: Arc<Clock>,
    ctx: StoreContext,
    last_sweep: Instant,
}

impl StoreProcessor {
    pub fn spawn(
        config: CacheConfig,
        extensions: CacheExtensions,
        ctx: StoreContext,
        parent: &CancellationToken,
    ) -> (ProcessorHandle<StoreCommand>, JoinHandle<()>) {
        let clock = ctx.router.clock().clone();
        let store = EntryStore::new(&config, clock.clone(), extensions.invalidator.clone());
        let write_behind = match &extensions.data_store {
            Some((data_store, WriteMode::Queued { batch_size, flush_interval })) => {
                Some(WriteBehind::spawn(
                    config.name.clone(),
                    data_store.clone(),
                    *batch_size,
                    *flush_interval,
                    ctx.metrics.clone(),
                    parent.child_token(),
                ))
            }
            _ => None,
        };

        let awaiting_load = extensions.loader.is_some();
        let processor = Self {
            key: GroupKey::cache(config.name.clone()),
            local: ctx.router.local().clone(),
            store,
            extensions,
            write_behind,
            state: ctx.cluster.state(),
            handoffs: HandoffTracker::new(TRANSFER_RETRY_DELAY, ctx.network_timeout),
            listeners: Vec::new(),
            awaiting_load,
            clock,
            last_sweep: Instant::now(),
            config,
            ctx,
        };
        Processor::spawn("store", processor, Some(STORE_TICK), parent)
    }

    // ---- ownership ----

    fn group(&self) -> Result<&Group> {
        self.state
            .group(&self.key)
            .ok_or_else(|| MembershipError::GroupNotFound(self.key.clone()).into())
    }

    fn ownership(&self, bucket: BucketId) -> Result<&BucketOwnership> {
        let group = self.group()?;
        let ownership = group
            .bucket(bucket)
            .ok_or_else(|| Error::Internal(format!("bucket {bucket} out of range")))?;
        match &ownership.owner {
            Some(owner) if *owner == self.local => Ok(ownership),
            Some(_) => Err(Error::OwnershipChanged {
                group: self.key.clone(),
                bucket,
            }),
            None => Err(Error::BucketUnowned {
                group: self.key.clone(),
                bucket,
            }),
        }
    }

    /// Reads are served while a bucket is being handed off.
    fn check_read(&self, bucket: BucketId) -> Result<()> {
        self.ownership(bucket).map(|_| ())
    }

    fn check_write(&self, bucket: BucketId) -> Result<()> {
        if self.ownership(bucket)?.in_transfer() {
            return Err(Error::OwnershipChanged {
                group: self.key.clone(),
                bucket,
            });
        }
        Ok(())
    }

    fn is_writable(&self, bucket: BucketId) -> bool {
        self.check_write(bucket).is_ok()
    }

    // ---- operations ----

    async fn apply(&mut self, op: CacheRequest, from: &ClusterNodeAddress) -> Result<CacheResponse> {
        match op {
            CacheRequest::Get { key } => {
                let bucket = self.store.bucket_of(&key);
                self.check_read(bucket)?;
                Ok(CacheResponse::Value(self.read(key, bucket).await))
            }
            CacheRequest::Put {
                key,
                value,
                ttl_ms,
                if_absent,
            } => {
                let bucket = self.store.bucket_of(&key);
                self.check_write(bucket)?;
                check_entry_size(&key, &value, self.ctx.router.entry_budget())?;
                self.metrics().put_total.inc();
                if if_absent {
                    if let Lookup::Hit(existing) = self.store.get(&key) {
                        return Ok(CacheResponse::Value(Some(existing)));
                    }
                }
                let previous = self.write(key, value, ttl_ms.map(Duration::from_millis)).await?;
                Ok(CacheResponse::Value(previous))
            }
            CacheRequest::Remove { key } => {
                let bucket = self.store.bucket_of(&key);
                self.check_write(bucket)?;
                self.metrics().remove_total.inc();
                let previous = self.store.remove(&key);
                self.replicate(bucket, ReplicaOp::Remove(key.clone()));
                self.remove_through(key).await?;
                Ok(CacheResponse::Value(previous))
            }
            CacheRequest::ContainsKey { key } => {
                self.check_read(self.store.bucket_of(&key))?;
                Ok(CacheResponse::Bool(self.store.contains(&key)))
            }
            CacheRequest::Invalidate { key } => {
                let bucket = self.store.bucket_of(&key);
                self.check_write(bucket)?;
                let marked = self.store.invalidate(&key);
                if marked {
                    self.replicate(bucket, ReplicaOp::Remove(key));
                }
                Ok(CacheResponse::Bool(marked))
            }
            CacheRequest::GetAll { keys } => {
                for key in &keys {
                    self.check_read(self.store.bucket_of(key))?;
                }
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    let bucket = self.store.bucket_of(&key);
                    let value = self.read(key.clone(), bucket).await;
                    values.push((key, value));
                }
                Ok(CacheResponse::Values(values))
            }
            CacheRequest::PutAll { entries, ttl_ms } => {
                let budget = self.ctx.router.entry_budget();
                for (key, value) in &entries {
                    self.check_write(self.store.bucket_of(key))?;
                    check_entry_size(key, value, budget)?;
                }
                self.put_all(entries, ttl_ms.map(Duration::from_millis)).await?;
                Ok(CacheResponse::Done)
            }
            CacheRequest::Execute {
                buckets,
                executable,
                filter,
            } => {
                let executable = self
                    .ctx
                    .registry
                    .executable(&executable, &self.config.name, &self.clock)?;
                let filter = filter
                    .map(|f| self.ctx.registry.filter(&f, &self.config.name, &self.clock))
                    .transpose()?;
                let (owned, not_owned) = self.split_owned(buckets)?;
                let now = self.clock.current_time();
                let result = run_local(
                    executable.as_ref(),
                    filter.as_deref(),
                    self.store.entries_in(&owned, now),
                )?;
                Ok(CacheResponse::Partial { result, not_owned })
            }
            CacheRequest::Clear { buckets } => {
                let (owned, not_owned) = self.split_owned(buckets)?;
                let mut cleared = 0u64;
                for bucket in owned {
                    cleared += self.store.remove_bucket(bucket) as u64;
                    self.sync_replicas(bucket, Vec::new(), &self.backups(bucket));
                }
                debug!(cache = %self.config.name, cleared, "Cleared owned buckets");
                Ok(CacheResponse::Partial {
                    result: Bytes::from(bincode::serialize(&cleared)?),
                    not_owned,
                })
            }
            CacheRequest::ApplyTransferBatch {
                bucket,
                transfer_id,
                batch,
            } => {
                self.apply_transfer(from, bucket, transfer_id, batch)?;
                Ok(CacheResponse::Done)
            }
        }
    }

    async fn read(&mut self, key: Bytes, bucket: BucketId) -> Option<Bytes> {
        let metrics = self.ctx.metrics.clone();
        metrics.get_total.inc();
        match self.store.get(&key) {
            Lookup::Hit(value) => {
                metrics.hits.inc();
                return Some(value);
            }
            Lookup::Miss => {}
            Lookup::Expired => metrics.expirations.inc(),
            Lookup::Invalidated => metrics.invalidations.inc(),
        }
        metrics.misses.inc();
        self.read_through(key, bucket).await
    }

    /// Fetch a missing value from the data source. Failures degrade to a miss.
    async fn read_through(&mut self, key: Bytes, bucket: BucketId) -> Option<Bytes> {
        let source = self.extensions.data_source.clone()?;
        let value = match source.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(cache = %self.config.name, error = %e, "Read-through failed, treating as miss");
                return None;
            }
        };
        self.metrics().read_through_loads.inc();

        // A bucket on its way out keeps its snapshot, and a value too large to
        // replicate is not cached; either way the value is only returned.
        let fits = check_entry_size(&key, &value, self.ctx.router.entry_budget()).is_ok();
        if fits && self.is_writable(bucket) {
            match self.store.put(key.clone(), value.clone(), None) {
                Ok(outcome) => {
                    self.metrics().evictions.inc_by(outcome.evicted.len() as u64);
                    if let Some(entry) = self.store.snapshot(&key) {
                        self.replicate(bucket, ReplicaOp::Put(entry));
                    }
                }
                Err(e) => debug!(cache = %self.config.name, error = %e, "Loaded value not cached"),
            }
        }
        Some(value)
    }

    async fn write(&mut self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> Result<Option<Bytes>> {
        let bucket = self.store.bucket_of(&key);
        let outcome = self.store.put(key.clone(), value, ttl)?;
        self.metrics().evictions.inc_by(outcome.evicted.len() as u64);

        if let Some(entry) = self.store.snapshot(&key) {
            self.replicate(bucket, ReplicaOp::Put(entry.clone()));
            self.write_through(vec![storable(entry)]).await?;
        }
        Ok(outcome.previous)
    }

    async fn put_all(&mut self, entries: Vec<(Bytes, Bytes)>, ttl: Option<Duration>) -> Result<()> {
        let mut written = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let bucket = self.store.bucket_of(&key);
            self.metrics().put_total.inc();
            let outcome = self.store.put(key.clone(), value, ttl)?;
            self.metrics().evictions.inc_by(outcome.evicted.len() as u64);
            if let Some(entry) = self.store.snapshot(&key) {
                self.replicate(bucket, ReplicaOp::Put(entry.clone()));
                written.push(storable(entry));
            }
        }
        self.write_through(written).await
    }

    fn split_owned(&self, buckets: Vec<BucketId>) -> Result<(Vec<BucketId>, Vec<BucketId>)> {
        let group = self.group()?;
        Ok(buckets
            .into_iter()
            .partition(|b| group.owner_of_bucket(*b) == Some(&self.local)))
    }

    // ---- write-through ----

    async fn write_through(&self, entries: Vec<Storable>) -> Result<()> {
        let Some((data_store, _)) = &self.extensions.data_store else {
            return Ok(());
        };
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(queue) = &self.write_behind {
            for entry in entries {
                queue.enqueue(WriteOp::Store(entry));
            }
            return Ok(());
        }
        data_store.store(&entries).await.map_err(|e| self.write_through_failed(e))
    }

    async fn remove_through(&self, key: Bytes) -> Result<()> {
        let Some((data_store, _)) = &self.extensions.data_store else {
            return Ok(());
        };
        if let Some(queue) = &self.write_behind {
            queue.enqueue(WriteOp::Remove(key));
            return Ok(());
        }
        data_store.remove(&[key]).await.map_err(|e| self.write_through_failed(e))
    }

    fn write_through_failed(&self, error: Error) -> Error {
        self.metrics().write_through_failures.inc();
        warn!(cache = %self.config.name, error = %error, "Write-through failed");
        StoreError::WriteThrough(error.to_string()).into()
    }

    // ---- replicas ----

    fn backups(&self, bucket: BucketId) -> Vec<ClusterNodeAddress> {
        self.state
            .group(&self.key)
            .and_then(|g| g.bucket(bucket))
            .map(|b| b.backups.clone())
            .unwrap_or_default()
    }

    fn replicate(&self, bucket: BucketId, op: ReplicaOp) {
        for backup in self.backups(bucket) {
            let body = Message::ReplicaUpdate {
                bucket,
                op: op.clone(),
            };
            if let Err(e) = self
                .ctx
                .router
                .send(&backup, ProcessorKey::Store(self.key.clone()), body)
            {
                debug!(peer = %backup, bucket, error = %e, "Replica update not sent");
            }
        }
    }

    /// Replace what `targets` hold for a bucket with `entries`.
    fn sync_replicas(&self, bucket: BucketId, entries: Vec<TransferEntry>, targets: &[ClusterNodeAddress]) {
        if targets.is_empty() {
            return;
        }
        let now = self.clock.current_time();
        let budget = self.ctx.router.entry_budget();
        for batch in into_batches(entries, self.config.transfer_batch_size, budget, now) {
            for target in targets {
                let body = Message::ReplicaSync {
                    bucket,
                    entries: batch.entries.clone(),
                    reset: batch.is_first(),
                };
                if let Err(e) = self
                    .ctx
                    .router
                    .send(target, ProcessorKey::Store(self.key.clone()), body)
                {
                    debug!(peer = %target, bucket, error = %e, "Replica sync not sent");
                }
            }
        }
    }

    /// Replica traffic is dropped for buckets this node serves or receives.
    fn accepts_replica(&self, bucket: BucketId) -> bool {
        self.state.group(&self.key).is_some_and(|g| {
            !matches!(
                g.role(bucket, &self.local),
                OwnershipRole::Primary | OwnershipRole::Incoming
            )
        })
    }

    fn apply_replica(&mut self, bucket: BucketId, op: ReplicaOp) {
        if !self.accepts_replica(bucket) {
            trace!(cache = %self.config.name, bucket, "Replica update ignored");
            return;
        }
        match op {
            ReplicaOp::Put(entry) => {
                let (key, entry) = entry.into_entry();
                if let Err(e) = self.store.insert_entry(key, entry) {
                    debug!(cache = %self.config.name, bucket, error = %e, "Replica entry rejected");
                }
            }
            ReplicaOp::Remove(key) => {
                self.store.remove(&key);
            }
        }
    }

    fn apply_replica_sync(&mut self, bucket: BucketId, entries: Vec<TransferEntry>, reset: bool) {
        if !self.accepts_replica(bucket) {
            trace!(cache = %self.config.name, bucket, "Replica sync ignored");
            return;
        }
        if reset {
            self.store.remove_bucket(bucket);
        }
        for entry in entries {
            let (key, entry) = entry.into_entry();
            if let Err(e) = self.store.insert_entry(key, entry) {
                debug!(cache = %self.config.name, bucket, error = %e, "Replica entry rejected");
            }
        }
    }

    // ---- handoff ----

    fn apply_transfer(
        &mut self,
        from: &ClusterNodeAddress,
        bucket: BucketId,
        transfer_id: u64,
        batch: TransferBatch,
    ) -> Result<()> {
        let expected = self
            .group()?
            .bucket(bucket)
            .is_some_and(|b| b.is_owner(from) && b.is_pending(&self.local));
        if !expected {
            // The sender may be ahead of this node's view; it retries.
            return Err(Error::OwnershipChanged {
                group: self.key.clone(),
                bucket,
            });
        }

        if batch.is_first() {
            self.store.remove_bucket(bucket);
        }
        let received = batch.len() as u64;
        for entry in batch.entries {
            let (key, entry) = entry.into_entry();
            self.store.insert_entry(key, entry)?;
        }
        self.metrics().entries_transferred_in.inc_by(received);
        trace!(
            cache = %self.config.name,
            bucket,
            transfer_id,
            sequence = batch.sequence,
            received,
            "Applied transfer batch"
        );
        Ok(())
    }

    fn start_handoff(&mut self, bucket: BucketId, to: ClusterNodeAddress) {
        let now = self.clock.current_time();
        let batches = into_batches(
            self.store.bucket_entries(bucket),
            self.config.transfer_batch_size,
            self.ctx.router.entry_budget(),
            now,
        );
        let (transfer_id, first) = self.handoffs.start(bucket, to.clone(), batches, Instant::now());
        if let Some(handoff) = self.handoffs.get(bucket) {
            info!(
                cache = %self.config.name,
                bucket,
                to = %to,
                entries = handoff.entries(),
                batches = handoff.total_batches(),
                "Handing bucket off"
            );
        }
        self.send_batch(bucket, to, transfer_id, first);
    }

    fn send_batch(&self, bucket: BucketId, to: ClusterNodeAddress, transfer_id: u64, batch: TransferBatch) {
        self.metrics().transfer_batches_sent.inc();
        let router = self.ctx.router.clone();
        let key = self.key.clone();
        let timeout = self.ctx.network_timeout;
        tokio::spawn(async move {
            let op = CacheRequest::ApplyTransferBatch {
                bucket,
                transfer_id,
                batch,
            };
            let result = router.request(&to, &key, op, timeout).await.map(|_| ());
            if let Some(store) = router.store(&key) {
                let acked = StoreCommand::TransferAcked {
                    bucket,
                    transfer_id,
                    result,
                };
                if let Err(e) = store.enqueue(acked) {
                    warn!(cache = %key, bucket, transfer_id, error = %e, "Transfer ack dropped, store closed");
                }
            }
        });
    }

    fn on_transfer_acked(&mut self, bucket: BucketId, transfer_id: u64, result: Result<()>) {
        let now = Instant::now();
        if let Err(e) = result {
            debug!(cache = %self.config.name, bucket, transfer_id, error = %e, "Transfer batch failed");
            self.handoffs.failed(bucket, transfer_id, now);
            return;
        }
        let Some(to) = self.handoffs.target(bucket).cloned() else {
            return;
        };
        match self.handoffs.acked(bucket, transfer_id, now) {
            AckOutcome::Next(batch) => self.send_batch(bucket, to, transfer_id, batch),
            AckOutcome::Complete => {
                debug!(cache = %self.config.name, bucket, to = %to, "Handoff acknowledged, committing");
                self.commit(bucket, to);
            }
            AckOutcome::Stale => trace!(bucket, transfer_id, "Stale transfer ack"),
        }
    }

    fn commit(&self, bucket: BucketId, to: ClusterNodeAddress) {
        if let Err(e) = self.ctx.cluster.commit_transfer(self.key.clone(), bucket, to) {
            debug!(cache = %self.config.name, bucket, error = %e, "Cannot request commit");
        }
    }

    // ---- topology ----

    fn on_topology(&mut self, next: Arc<ReplicatedState>) {
        let previous = std::mem::replace(&mut self.state, next.clone());
        let local = self.local.clone();

        let Some(group) = next.group(&self.key).filter(|g| g.is_member(&local)) else {
            for bucket in self.handoffs.buckets() {
                self.handoffs.cancel(bucket);
            }
            if !self.store.is_empty() {
                debug!(cache = %self.config.name, "No longer a group member, dropping entries");
                self.store.clear();
            }
            return;
        };
        let old_group = previous.group(&self.key);

        for bucket in 0..group.bucket_count() {
            let Some(current) = group.bucket(bucket) else {
                continue;
            };
            let before = old_group.and_then(|g| g.bucket(bucket));
            let old_owner = before.and_then(|b| b.owner.as_ref());
            let new_owner = current.owner.as_ref();

            if old_owner != new_owner {
                for listener in &self.listeners {
                    listener.bucket_transferred(bucket, old_owner, new_owner);
                }
                if new_owner == Some(&local) && old_owner.is_some() && !held_data(before, &local) {
                    self.metrics().buckets_lost.inc();
                    warn!(cache = %self.config.name, bucket, "Took over a bucket whose data was lost");
                    self.store.remove_bucket(bucket);
                }
            }

            match (current.is_owner(&local), current.pending.as_ref()) {
                (true, Some(to)) if *to != local => {
                    if !self.awaiting_load && self.handoffs.target(bucket) != Some(to) {
                        self.start_handoff(bucket, to.clone());
                    }
                }
                _ => {
                    if self.handoffs.cancel(bucket).is_some() {
                        debug!(cache = %self.config.name, bucket, "Handoff no longer needed");
                    }
                }
            }

            if current.is_owner(&local) {
                let targets = replica_targets(before, current, &local);
                if !targets.is_empty() {
                    self.sync_replicas(bucket, self.store.bucket_entries(bucket), &targets);
                }
            }

            if group.role(bucket, &local) == OwnershipRole::None && self.store.bucket_len(bucket) > 0 {
                let dropped = self.store.remove_bucket(bucket);
                debug!(cache = %self.config.name, bucket, dropped, "Dropped bucket");
            }
        }
    }

    /// Start every handoff the applied table asks for that is not running.
    fn release_handoffs(&mut self) {
        self.awaiting_load = false;
        let Some(group) = self.state.group(&self.key) else {
            return;
        };
        let due: Vec<(BucketId, ClusterNodeAddress)> = (0..group.bucket_count())
            .filter_map(|bucket| {
                let ownership = group.bucket(bucket)?;
                let to = ownership.pending.as_ref()?;
                let start = ownership.is_owner(&self.local)
                    && *to != self.local
                    && self.handoffs.target(bucket) != Some(to);
                start.then(|| (bucket, to.clone()))
            })
            .collect();
        if !due.is_empty() {
            debug!(cache = %self.config.name, buckets = due.len(), "Starting handoffs held for loading");
        }
        for (bucket, to) in due {
            self.start_handoff(bucket, to);
        }
    }

    // ---- loader ----

    async fn load(&mut self) -> Result<usize> {
        let result = self.run_loader().await;
        self.release_handoffs();
        result
    }

    /// Load into every bucket this node owns. Buckets already promised to a
    /// joiner are included, since their handoff has not started yet.
    async fn run_loader(&mut self) -> Result<usize> {
        let Some(loader) = self.extensions.loader.clone() else {
            return Ok(0);
        };
        let mut sink = Loadable::new();
        loader
            .load(&mut sink)
            .await
            .map_err(|e| StoreError::Loader(e.to_string()))?;

        let budget = self.ctx.router.entry_budget();
        let mut loaded = 0;
        let mut skipped = 0;
        for (key, value, ttl) in sink.into_entries() {
            let bucket = self.store.bucket_of(&key);
            if self.check_read(bucket).is_err() {
                skipped += 1;
                continue;
            }
            if let Err(e) = check_entry_size(&key, &value, budget) {
                warn!(cache = %self.config.name, error = %e, "Loaded entry skipped");
                skipped += 1;
                continue;
            }
            let outcome = self.store.put(key.clone(), value, ttl)?;
            self.metrics().evictions.inc_by(outcome.evicted.len() as u64);
            if let Some(entry) = self.store.snapshot(&key) {
                self.replicate(bucket, ReplicaOp::Put(entry));
            }
            loaded += 1;
        }
        info!(cache = %self.config.name, loaded, skipped, "Cache loaded");
        Ok(loaded)
    }

    // ---- housekeeping ----

    fn sweep(&mut self) {
        let Some(interval) = self.config.expiration_sweep_interval else {
            return;
        };
        if self.last_sweep.elapsed() < interval {
            return;
        }
        self.last_sweep = Instant::now();
        let expired = self.store.remove_expired(self.clock.current_time());
        if expired > 0 {
            self.metrics().expirations.inc_by(expired as u64);
            trace!(cache = %self.config.name, expired, "Expiration sweep");
        }
    }

    fn update_gauges(&self) {
        self.metrics().entries.set(self.store.len() as i64);
        self.metrics().bytes.set(self.store.byte_size() as i64);
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.ctx.metrics
    }
}

/// Whether `local` held the bucket's content under the previous table.
fn held_data(before: Option<&BucketOwnership>, local: &ClusterNodeAddress) -> bool {
    before.is_some_and(|b| b.is_owner(local) || b.is_pending(local) || b.backups.contains(local))
}

/// Backups that need a full copy of a bucket `local` owns: all of them when
/// ownership is new, otherwise only the ones added.
fn replica_targets(
    before: Option<&BucketOwnership>,
    now: &BucketOwnership,
    local: &ClusterNodeAddress,
) -> Vec<ClusterNodeAddress> {
    let gained = !before.is_some_and(|b| b.is_owner(local));
    now.backups
        .iter()
        .filter(|backup| *backup != local)
        .filter(|backup| gained || !before.is_some_and(|b| b.backups.contains(backup)))
        .cloned()
        .collect()
}

fn storable(entry: TransferEntry) -> Storable {
    Storable {
        key: entry.key,
        value: entry.value,
        created: entry.created,
        expiration: entry.expiration,
    }
}

#[async_trait]
impl Handler for StoreProcessor {
    type Message = StoreCommand;

    async fn handle(&mut self, message: StoreCommand) {
        match message {
            StoreCommand::Local { op, reply } => {
                let local = self.local.clone();
                let result = self.apply(op, &local).await;
                let _ = reply.send(result);
            }
            StoreCommand::Remote(envelope) => {
                let Envelope { sender, body, .. } = envelope;
                match body {
                    Message::Request { request_id, op } => {
                        let result = self.apply(op, &sender).await;
                        self.ctx.router.respond(&sender, request_id, result);
                    }
                    Message::ReplicaUpdate { bucket, op } => self.apply_replica(bucket, op),
                    Message::ReplicaSync {
                        bucket,
                        entries,
                        reset,
                    } => self.apply_replica_sync(bucket, entries, reset),
                    other => trace!(message = other.name(), "Unexpected message for store"),
                }
            }
            StoreCommand::Topology(state) => self.on_topology(state),
            StoreCommand::TransferAcked {
                bucket,
                transfer_id,
                result,
            } => self.on_transfer_acked(bucket, transfer_id, result),
            StoreCommand::Load { reply } => {
                let result = self.load().await;
                let _ = reply.send(result);
            }
            StoreCommand::SkipLoad => self.release_handoffs(),
            StoreCommand::AddListener(listener) => self.listeners.push(listener),
        }
        self.update_gauges();
    }

    async fn tick(&mut self) {
        for action in self.handoffs.due(Instant::now()) {
            match action {
                DueAction::Send {
                    bucket,
                    to,
                    transfer_id,
                    batch,
                } => self.send_batch(bucket, to, transfer_id, batch),
                DueAction::Commit { bucket, to } => self.commit(bucket, to),
            }
        }
        self.sweep();
        self.update_gauges();
    }

    async fn stopped(&mut self) {
        if let Some(queue) = self.write_behind.take() {
            queue.close().await;
        }
        debug!(cache = %self.config.name, "Store processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node(port: u16) -> ClusterNodeAddress {
        ClusterNodeAddress::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn owned(owner: u16, backups: &[u16]) -> BucketOwnership {
        BucketOwnership {
            owner: Some(node(owner)),
            pending: None,
            backups: backups.iter().map(|p| node(*p)).collect(),
        }
    }

    #[test]
    fn test_new_owner_syncs_every_backup() {
        let before = owned(2, &[1, 3]);
        let now = owned(1, &[3, 4]);
        assert_eq!(replica_targets(Some(&before), &now, &node(1)), vec![node(3), node(4)]);
        assert_eq!(replica_targets(None, &now, &node(1)), vec![node(3), node(4)]);
    }

    #[test]
    fn test_existing_owner_syncs_added_backups_only() {
        let before = owned(1, &[2]);
        let now = owned(1, &[2, 3]);
        assert_eq!(replica_targets(Some(&before), &now, &node(1)), vec![node(3)]);
        assert!(replica_targets(Some(&now), &now, &node(1)).is_empty());
    }

    #[test]
    fn test_held_data_covers_owner_pending_and_backup() {
        let mut bucket = owned(2, &[3]);
        assert!(held_data(Some(&bucket), &node(2)));
        assert!(held_data(Some(&bucket), &node(3)));
        assert!(!held_data(Some(&bucket), &node(1)));
        bucket.pending = Some(node(1));
        assert!(held_data(Some(&bucket), &node(1)));
        assert!(!held_data(None, &node(1)));
    }
}
