//! Replicated cluster state.
//!
//! Every node holds a copy of the member list and of every group's ownership
//! table. Copies change only by applying the sequencer's ordered stream of
//! [`ClusterChange`]s, or by being replaced wholesale with a state transfer,
//! so nodes that applied the same prefix of the stream hold equal states.

use crate::clock::Time;
use crate::cluster::events::{ClusterEvent, ClusterEventListener};
use crate::partitioning::{assignment, BucketChange, BucketChangeKind, Group};
use crate::types::{BucketId, ClusterNodeAddress, GroupKey, GroupType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// A cluster member and when it joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub address: ClusterNodeAddress,
    pub joined_at: Time,
}

/// A change to the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterChange {
    MemberJoined(MemberInfo),
    MembersLeft(Vec<ClusterNodeAddress>),
    GroupMemberJoined {
        group: GroupKey,
        member: ClusterNodeAddress,
        bucket_count: u32,
        replica_count: u32,
    },
    GroupMemberLeaving {
        group: GroupKey,
        member: ClusterNodeAddress,
    },
    TransferCommitted {
        group: GroupKey,
        bucket: BucketId,
        from: ClusterNodeAddress,
        to: ClusterNodeAddress,
    },
}

/// A change as broadcast by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedUpdate {
    /// Incremented whenever a new sequencer takes over.
    pub epoch: u64,
    /// Position in the epoch's stream, starting at 1.
    pub seq: u64,
    /// Sequencer's clock when the change was sequenced.
    pub time: Time,
    pub change: ClusterChange,
}

/// What applying a change did, before it is turned into listener events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    MemberJoined(ClusterNodeAddress),
    MemberLeft(ClusterNodeAddress),
    Bucket { group: GroupKey, change: BucketChange },
    GroupChanged(GroupKey),
    GroupRemoved(GroupKey),
}

#[derive(Clone)]
struct Subscriber {
    group_type: Option<GroupType>,
    listener: Arc<dyn ClusterEventListener>,
}

/// Membership plus every group's ownership table.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub(crate) epoch: u64,
    pub(crate) seq: u64,
    /// Members in join order; the first one sequences changes.
    members: Vec<MemberInfo>,
    groups: BTreeMap<GroupKey, Group>,
    #[serde(skip)]
    subscribers: Vec<Subscriber>,
}

impl ReplicatedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sequence number of the last applied update.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn member_addresses(&self) -> Vec<ClusterNodeAddress> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    pub fn member(&self, node: &ClusterNodeAddress) -> Option<&MemberInfo> {
        self.members.iter().find(|m| &m.address == node)
    }

    pub fn is_member(&self, node: &ClusterNodeAddress) -> bool {
        self.member(node).is_some()
    }

    /// The oldest member.
    pub fn sequencer(&self) -> Option<&ClusterNodeAddress> {
        self.members.first().map(|m| &m.address)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group(&self, key: &GroupKey) -> Option<&Group> {
        self.groups.get(key)
    }

    pub fn get_group(&self, group_type: GroupType, name: &str) -> Option<&Group> {
        self.groups.get(&GroupKey::new(group_type, name))
    }

    /// Register a group unless one with the same key exists; returns the
    /// registered group either way.
    pub fn register_group(&mut self, group_type: GroupType, name: &str, mut group: Group) -> &mut Group {
        let key = GroupKey::new(group_type, name);
        group.key = key.clone();
        self.groups.entry(key).or_insert(group)
    }

    /// Add a listener for events of `group_type` (all groups when `None`).
    /// Membership events reach every listener.
    pub fn subscribe(&mut self, group_type: Option<GroupType>, listener: Arc<dyn ClusterEventListener>) {
        self.subscribers.push(Subscriber {
            group_type,
            listener,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Replace the state with `new_state`, keeping this node's subscribers.
    pub fn reset(&mut self, new_state: ReplicatedState) {
        let subscribers = std::mem::take(&mut self.subscribers);
        *self = new_state;
        self.subscribers = subscribers;
    }

    /// Deep copy without subscribers, for transfer to another node.
    pub fn copy(&self) -> ReplicatedState {
        ReplicatedState {
            epoch: self.epoch,
            seq: self.seq,
            members: self.members.clone(),
            groups: self.groups.clone(),
            subscribers: Vec::new(),
        }
    }

    /// Apply one change. The only way the cluster processor mutates state.
    pub fn apply(&mut self, change: &ClusterChange) -> Vec<StateEvent> {
        match change {
            ClusterChange::MemberJoined(info) => {
                if self.is_member(&info.address) {
                    return Vec::new();
                }
                self.members.push(info.clone());
                vec![StateEvent::MemberJoined(info.address.clone())]
            }
            ClusterChange::MembersLeft(nodes) => {
                let departed: Vec<ClusterNodeAddress> =
                    nodes.iter().filter(|n| self.is_member(n)).cloned().collect();
                if departed.is_empty() {
                    return Vec::new();
                }
                self.members.retain(|m| !departed.contains(&m.address));
                let mut events: Vec<StateEvent> =
                    departed.iter().cloned().map(StateEvent::MemberLeft).collect();
                events.extend(self.drop_from_groups(&departed));
                events
            }
            ClusterChange::GroupMemberJoined {
                group,
                member,
                bucket_count,
                replica_count,
            } => {
                if !self.is_member(member) {
                    return Vec::new();
                }
                let entry = self.register_group(
                    group.group_type,
                    &group.name,
                    Group::new(group.clone(), *bucket_count, *replica_count),
                );
                if entry.bucket_count() != *bucket_count {
                    return Vec::new();
                }
                let changes = assignment::add_member(entry, member);
                group_events(group, changes, true)
            }
            ClusterChange::GroupMemberLeaving { group, member } => {
                let Some(entry) = self.groups.get_mut(group) else {
                    return Vec::new();
                };
                if !entry.is_member(member) {
                    return Vec::new();
                }
                let changes = assignment::mark_leaving(entry, member);
                let mut events = group_events(group, changes, true);
                events.extend(self.remove_if_empty(group));
                events
            }
            ClusterChange::TransferCommitted {
                group,
                bucket,
                from,
                to,
            } => {
                let Some(entry) = self.groups.get_mut(group) else {
                    return Vec::new();
                };
                match assignment::commit_transfer(entry, *bucket, from, to) {
                    Some(changes) => {
                        let mut events = group_events(group, changes, false);
                        events.extend(self.remove_if_empty(group));
                        events
                    }
                    None => Vec::new(),
                }
            }
        }
    }

    /// Promote or unown buckets of departed nodes in every group and
    /// rebalance, then notify subscribers.
    pub fn notify_cluster_nodes_left(&mut self, nodes: &[ClusterNodeAddress]) -> Vec<StateEvent> {
        let events = self.drop_from_groups(nodes);
        self.notify(&events);
        events
    }

    /// Events describing the difference between `self` and `newer`, used when
    /// a state transfer replaces the local copy.
    pub fn diff(&self, newer: &ReplicatedState) -> Vec<StateEvent> {
        let mut events = Vec::new();
        for member in &newer.members {
            if !self.is_member(&member.address) {
                events.push(StateEvent::MemberJoined(member.address.clone()));
            }
        }
        for member in &self.members {
            if !newer.is_member(&member.address) {
                events.push(StateEvent::MemberLeft(member.address.clone()));
            }
        }
        for (key, group) in &newer.groups {
            if self.groups.get(key) != Some(group) {
                events.push(StateEvent::GroupChanged(key.clone()));
            }
        }
        for key in self.groups.keys() {
            if !newer.groups.contains_key(key) {
                events.push(StateEvent::GroupRemoved(key.clone()));
            }
        }
        events
    }

    /// Deliver events to subscribers. Each changed group is reported once.
    pub fn notify(&self, events: &[StateEvent]) {
        if self.subscribers.is_empty() {
            return;
        }
        for event in to_cluster_events(events) {
            for subscriber in &self.subscribers {
                if event.concerns(subscriber.group_type) {
                    subscriber.listener.on_event(&event);
                }
            }
        }
    }

    fn drop_from_groups(&mut self, departed: &[ClusterNodeAddress]) -> Vec<StateEvent> {
        let affected: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, g)| departed.iter().any(|d| g.is_member(d)))
            .map(|(k, _)| k.clone())
            .collect();

        let mut events = Vec::new();
        for key in affected {
            if let Some(group) = self.groups.get_mut(&key) {
                let changes = assignment::remove_members(group, departed);
                events.extend(group_events(&key, changes, true));
            }
            events.extend(self.remove_if_empty(&key));
        }
        events
    }

    fn remove_if_empty(&mut self, key: &GroupKey) -> Option<StateEvent> {
        let empty = self.groups.get(key).is_some_and(|g| g.members().is_empty());
        if empty {
            self.groups.remove(key);
            return Some(StateEvent::GroupRemoved(key.clone()));
        }
        None
    }
}

fn group_events(group: &GroupKey, changes: Vec<BucketChange>, membership: bool) -> Vec<StateEvent> {
    let mut events = Vec::with_capacity(changes.len() + 1);
    if membership {
        events.push(StateEvent::GroupChanged(group.clone()));
    }
    events.extend(changes.into_iter().map(|change| StateEvent::Bucket {
        group: group.clone(),
        change,
    }));
    events
}

fn to_cluster_events(events: &[StateEvent]) -> Vec<ClusterEvent> {
    let mut out = Vec::new();
    let mut changed = BTreeSet::new();
    for event in events {
        match event {
            StateEvent::MemberJoined(node) => {
                out.push(ClusterEvent::MemberJoined { node: node.clone() })
            }
            StateEvent::MemberLeft(node) => out.push(ClusterEvent::MemberLeft { node: node.clone() }),
            StateEvent::Bucket { group, change } => {
                if let BucketChangeKind::Lost { .. } = change.kind {
                    out.push(ClusterEvent::BucketLost {
                        group: group.clone(),
                        bucket: change.bucket,
                    });
                }
                changed.insert(group.clone());
            }
            StateEvent::GroupChanged(group) | StateEvent::GroupRemoved(group) => {
                changed.insert(group.clone());
            }
        }
    }
    out.extend(
        changed
            .into_iter()
            .map(|group| ClusterEvent::GroupStateChanged { group }),
    );
    out
}

impl PartialEq for ReplicatedState {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
            && self.seq == other.seq
            && self.members == other.members
            && self.groups == other.groups
    }
}

impl fmt::Debug for ReplicatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedState")
            .field("epoch", &self.epoch)
            .field("seq", &self.seq)
            .field("members", &self.members)
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
