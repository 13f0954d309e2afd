//! Fan-out of a request over every bucket of a cache.
//!
//! Buckets are grouped by their current primary and each owner gets one
//! request naming its share. Owners answer with a partial result plus the
//! requested buckets they no longer own; those go back into the uncovered set
//! and, depending on the [`ExecutionPolicy`], are re-resolved and reissued.

use crate::cache::{Backoff, StoreClient};
use crate::config::{ExecutionPolicy, ExtensionRef};
use crate::error::{Error, ExecutionError, MembershipError, Result};
use crate::executor::{Aggregator, Sum};
use crate::network::message::{CacheRequest, CacheResponse};
use crate::types::{BucketId, ClusterNodeAddress};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Runs requests against every owner of a cache's buckets.
pub struct ScatterGather {
    client: StoreClient,
    policy: ExecutionPolicy,
    timeout: Duration,
}

/// What one gather collected.
#[derive(Debug, Default)]
struct Gathered {
    partials: Vec<Bytes>,
    uncovered: Vec<BucketId>,
    total: usize,
}

impl ScatterGather {
    pub(crate) fn new(client: StoreClient, policy: ExecutionPolicy, timeout: Duration) -> Self {
        Self {
            client,
            policy,
            timeout,
        }
    }

    /// Run `executable` on every owner and aggregate the partial results.
    pub async fn execute<A: Aggregator>(
        &self,
        executable: ExtensionRef,
        filter: Option<ExtensionRef>,
        aggregator: &A,
    ) -> Result<A::Output> {
        let gathered = self
            .gather(|buckets| CacheRequest::Execute {
                buckets,
                executable: executable.clone(),
                filter: filter.clone(),
            })
            .await?;
        aggregator.aggregate(self.settle(gathered)?)
    }

    /// Clear every owner's buckets. Returns the number of dropped entries.
    pub async fn clear(&self) -> Result<u64> {
        let gathered = self.gather(|buckets| CacheRequest::Clear { buckets }).await?;
        Sum.aggregate(self.settle(gathered)?)
    }

    fn settle(&self, gathered: Gathered) -> Result<Vec<Bytes>> {
        if gathered.uncovered.is_empty() {
            return Ok(gathered.partials);
        }
        match self.policy {
            ExecutionPolicy::FailOnPartial => Err(ExecutionError::PartialResult {
                missing: gathered.uncovered.len(),
                total: gathered.total,
            }
            .into()),
            ExecutionPolicy::ReissueOnChange { .. } => {
                warn!(
                    group = %self.client.key(),
                    missing = gathered.uncovered.len(),
                    total = gathered.total,
                    "Aggregating without every bucket"
                );
                Ok(gathered.partials)
            }
        }
    }

    fn rounds(&self) -> usize {
        match self.policy {
            ExecutionPolicy::FailOnPartial => 1,
            ExecutionPolicy::ReissueOnChange { max_rounds } => 1 + max_rounds,
        }
    }

    async fn gather(&self, build: impl Fn(Vec<BucketId>) -> CacheRequest) -> Result<Gathered> {
        self.client.ensure_operational()?;
        let deadline = Instant::now() + self.timeout;
        let mut backoff = Backoff::new(deadline);

        let state = self.client.state();
        let group = state
            .group(self.client.key())
            .ok_or_else(|| MembershipError::GroupNotFound(self.client.key().clone()))?;
        let total = group.bucket_count() as usize;
        let mut gathered = Gathered {
            uncovered: (0..group.bucket_count()).collect(),
            total,
            ..Default::default()
        };

        for round in 0..self.rounds() {
            if round > 0 && !backoff.wait().await {
                break;
            }
            let (by_owner, unowned) = self.assign(std::mem::take(&mut gathered.uncovered))?;
            gathered.uncovered = unowned;

            let mut requests = JoinSet::new();
            for (owner, buckets) in by_owner {
                let client = self.client.clone();
                let op = build(buckets.clone());
                requests.spawn(async move {
                    let result = client.send(&owner, op, deadline).await;
                    (owner, buckets, result)
                });
            }

            while let Some(joined) = requests.join_next().await {
                let (owner, buckets, result) = joined.map_err(|e| Error::Internal(e.to_string()))?;
                match result {
                    Ok(CacheResponse::Partial { result, not_owned }) => {
                        gathered.partials.push(result);
                        gathered.uncovered.extend(not_owned);
                    }
                    Ok(other) => {
                        return Err(Error::Internal(format!("unexpected response {other:?}")));
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(peer = %owner, buckets = buckets.len(), error = %e, "Owner did not answer");
                        gathered.uncovered.extend(buckets);
                    }
                    Err(e) => return Err(e),
                }
            }

            if gathered.uncovered.is_empty() {
                break;
            }
            debug!(
                group = %self.client.key(),
                round,
                uncovered = gathered.uncovered.len(),
                "Buckets left uncovered"
            );
        }
        gathered.uncovered.sort_unstable();
        Ok(gathered)
    }

    /// Group buckets by current owner against the latest state.
    fn assign(
        &self,
        buckets: Vec<BucketId>,
    ) -> Result<(BTreeMap<ClusterNodeAddress, Vec<BucketId>>, Vec<BucketId>)> {
        let state = self.client.state();
        let group = state
            .group(self.client.key())
            .ok_or_else(|| MembershipError::GroupNotFound(self.client.key().clone()))?;

        let mut by_owner: BTreeMap<ClusterNodeAddress, Vec<BucketId>> = BTreeMap::new();
        let mut unowned = Vec::new();
        for bucket in buckets {
            match group.owner_of_bucket(bucket) {
                Some(owner) => by_owner.entry(owner.clone()).or_default().push(bucket),
                None => unowned.push(bucket),
            }
        }
        Ok((by_owner, unowned))
    }
}
