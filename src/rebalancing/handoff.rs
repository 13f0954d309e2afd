//! Outgoing bucket handoffs tracked by the current owner.
//!
//! A handoff walks `Sending -> Committing` and is dropped once the committed
//! ownership change arrives or the pending owner changes:
//!
//! ```text
//! start ──► AwaitingAck ──ack(non-final)──► AwaitingAck ...
//!               │
//!               ├──failed──► Backoff ──due──► AwaitingAck (same batch)
//!               │
//!               └──ack(final)──► Committing ──due──► re-send commit
//! ```

use crate::rebalancing::transfer::TransferBatch;
use crate::types::{BucketId, ClusterNodeAddress};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Where a handoff stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// A batch is in flight.
    AwaitingAck,
    /// The last send failed; resend after `until`.
    Backoff { until: Instant },
    /// Every batch was acknowledged; waiting for the commit to be sequenced.
    Committing { since: Instant },
}

/// One bucket being pushed to its pending owner.
#[derive(Debug)]
pub struct Handoff {
    pub bucket: BucketId,
    pub to: ClusterNodeAddress,
    pub transfer_id: u64,
    batches: Vec<TransferBatch>,
    next: usize,
    state: HandoffState,
    started_at: Instant,
}

impl Handoff {
    pub fn state(&self) -> HandoffState {
        self.state
    }

    /// Batches acknowledged so far.
    pub fn acked_batches(&self) -> usize {
        match self.state {
            HandoffState::Committing { .. } => self.batches.len(),
            _ => self.next,
        }
    }

    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn entries(&self) -> usize {
        self.batches.iter().map(TransferBatch::len).sum()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    fn current(&self) -> Option<TransferBatch> {
        self.batches.get(self.next).cloned()
    }
}

/// Result of acknowledging a batch.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Send this batch next.
    Next(TransferBatch),
    /// All batches landed; ask the sequencer to commit.
    Complete,
    /// The ack belongs to a cancelled or replaced handoff.
    Stale,
}

/// Work that became due on a tick.
#[derive(Debug, PartialEq, Eq)]
pub enum DueAction {
    Send {
        bucket: BucketId,
        to: ClusterNodeAddress,
        transfer_id: u64,
        batch: TransferBatch,
    },
    Commit {
        bucket: BucketId,
        to: ClusterNodeAddress,
    },
}

/// All handoffs of one cache on this node.
#[derive(Debug)]
pub struct HandoffTracker {
    handoffs: BTreeMap<BucketId, Handoff>,
    next_id: u64,
    retry_delay: Duration,
    commit_retry: Duration,
}

impl HandoffTracker {
    pub fn new(retry_delay: Duration, commit_retry: Duration) -> Self {
        Self {
            handoffs: BTreeMap::new(),
            next_id: 1,
            retry_delay,
            commit_retry,
        }
    }

    /// Begin a handoff, replacing any previous one for the bucket. Returns the
    /// transfer id and the first batch to send.
    pub fn start(
        &mut self,
        bucket: BucketId,
        to: ClusterNodeAddress,
        batches: Vec<TransferBatch>,
        now: Instant,
    ) -> (u64, TransferBatch) {
        let transfer_id = self.next_id;
        self.next_id += 1;

        let batches = if batches.is_empty() {
            vec![TransferBatch::new(0, Vec::new(), true)]
        } else {
            batches
        };
        let first = batches[0].clone();
        self.handoffs.insert(
            bucket,
            Handoff {
                bucket,
                to,
                transfer_id,
                batches,
                next: 0,
                state: HandoffState::AwaitingAck,
                started_at: now,
            },
        );
        (transfer_id, first)
    }

    pub fn get(&self, bucket: BucketId) -> Option<&Handoff> {
        self.handoffs.get(&bucket)
    }

    /// Node the bucket is being pushed to.
    pub fn target(&self, bucket: BucketId) -> Option<&ClusterNodeAddress> {
        self.handoffs.get(&bucket).map(|h| &h.to)
    }

    pub fn cancel(&mut self, bucket: BucketId) -> Option<Handoff> {
        self.handoffs.remove(&bucket)
    }

    pub fn buckets(&self) -> Vec<BucketId> {
        self.handoffs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handoffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handoffs.is_empty()
    }

    /// The receiver applied the batch in flight.
    pub fn acked(&mut self, bucket: BucketId, transfer_id: u64, now: Instant) -> AckOutcome {
        let Some(handoff) = self.live(bucket, transfer_id) else {
            return AckOutcome::Stale;
        };
        if handoff.state != HandoffState::AwaitingAck {
            return AckOutcome::Stale;
        }

        handoff.next += 1;
        match handoff.current() {
            Some(batch) => AckOutcome::Next(batch),
            None => {
                handoff.state = HandoffState::Committing { since: now };
                AckOutcome::Complete
            }
        }
    }

    /// The batch in flight could not be delivered or was refused.
    pub fn failed(&mut self, bucket: BucketId, transfer_id: u64, now: Instant) {
        let retry_delay = self.retry_delay;
        if let Some(handoff) = self.live(bucket, transfer_id) {
            if handoff.state == HandoffState::AwaitingAck {
                handoff.state = HandoffState::Backoff {
                    until: now + retry_delay,
                };
            }
        }
    }

    /// Resends and commit reminders due at `now`.
    pub fn due(&mut self, now: Instant) -> Vec<DueAction> {
        let mut actions = Vec::new();
        for handoff in self.handoffs.values_mut() {
            match handoff.state {
                HandoffState::Backoff { until } if now >= until => {
                    if let Some(batch) = handoff.current() {
                        handoff.state = HandoffState::AwaitingAck;
                        actions.push(DueAction::Send {
                            bucket: handoff.bucket,
                            to: handoff.to.clone(),
                            transfer_id: handoff.transfer_id,
                            batch,
                        });
                    }
                }
                HandoffState::Committing { since }
                    if now.saturating_duration_since(since) >= self.commit_retry =>
                {
                    handoff.state = HandoffState::Committing { since: now };
                    actions.push(DueAction::Commit {
                        bucket: handoff.bucket,
                        to: handoff.to.clone(),
                    });
                }
                _ => {}
            }
        }
        actions
    }

    fn live(&mut self, bucket: BucketId, transfer_id: u64) -> Option<&mut Handoff> {
        self.handoffs
            .get_mut(&bucket)
            .filter(|h| h.transfer_id == transfer_id)
    }
}
