//! Deadline tracking.

use crate::types::ClusterNodeAddress;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A resettable deadline.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
    deadline: Instant,
}

impl Timeout {
    /// Deadline `duration` from now.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: Instant::now() + duration,
        }
    }

    /// Push the deadline `duration` from now.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.duration;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Silence tracker for cluster peers.
///
/// Every received frame resets the sender's timeout; a peer whose timeout
/// expired has been silent for the whole network timeout.
#[derive(Debug)]
pub struct PeerTimeouts {
    network_timeout: Duration,
    peers: DashMap<ClusterNodeAddress, Timeout>,
}

impl PeerTimeouts {
    pub fn new(network_timeout: Duration) -> Self {
        Self {
            network_timeout,
            peers: DashMap::new(),
        }
    }

    /// Record that a frame arrived from `peer`.
    pub fn touch(&self, peer: &ClusterNodeAddress) {
        if let Some(mut timeout) = self.peers.get_mut(peer) {
            timeout.reset();
            return;
        }
        self.peers
            .insert(peer.clone(), Timeout::new(self.network_timeout));
    }

    /// Start watching `peer` if it is not watched yet.
    pub fn watch(&self, peer: &ClusterNodeAddress) {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| Timeout::new(self.network_timeout));
    }

    pub fn forget(&self, peer: &ClusterNodeAddress) {
        self.peers.remove(peer);
    }

    /// Watched peers among `candidates` that have been silent too long.
    pub fn expired<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a ClusterNodeAddress>,
    ) -> Vec<ClusterNodeAddress> {
        candidates
            .into_iter()
            .filter(|peer| {
                self.peers
                    .get(*peer)
                    .map(|timeout| timeout.is_expired())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn is_expired(&self, peer: &ClusterNodeAddress) -> bool {
        self.peers
            .get(peer)
            .map(|timeout| timeout.is_expired())
            .unwrap_or(false)
    }
}
