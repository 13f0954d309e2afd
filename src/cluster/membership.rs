//! Cluster membership processor.
//!
//! One processor per node owns the node's copy of the [`ReplicatedState`].
//! The oldest member acts as sequencer: it applies every change first,
//! numbers it and broadcasts it. Other members apply updates in sequence
//! order, buffering early arrivals and asking the sequencer to resend what
//! they missed. Updates the sequencer no longer buffers are replaced by a
//! full state transfer.
//!
//! Readers never touch the processor's state directly; every change is
//! published as an immutable snapshot on a watch channel and pushed to the
//! store processors.

use crate::cache::StoreCommand;
use crate::cluster::events::ClusterEventListener;
use crate::cluster::state::{ClusterChange, MemberInfo, ReplicatedState, SequencedUpdate, StateEvent};
use crate::config::NodeConfig;
use crate::error::{ConfigError, Error, MembershipError, Result};
use crate::network::message::{Envelope, Message, ProcessorKey};
use crate::network::router::Router;
use crate::processor::{Handler, Processor, ProcessorHandle};
use crate::types::{BucketId, ClusterNodeAddress, GroupKey, GroupType, NodeStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Messages accepted by the cluster processor.
pub enum ClusterCommand {
    /// An envelope addressed to the cluster processor.
    Remote(Envelope),
    /// The transport gave up on an envelope for this peer.
    PeerUnreachable(ClusterNodeAddress),
    /// Add this node to a group; answered once the state shows it, with
    /// whether this join created the group.
    JoinGroup {
        group: GroupKey,
        bucket_count: u32,
        replica_count: u32,
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Hand this node's buckets off and leave a group.
    LeaveGroup {
        group: GroupKey,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Every batch of a handoff from this node landed on `to`.
    CommitTransfer {
        group: GroupKey,
        bucket: BucketId,
        to: ClusterNodeAddress,
    },
    Subscribe {
        group_type: Option<GroupType>,
        listener: Arc<dyn ClusterEventListener>,
    },
    /// Leave the cluster gracefully.
    Leave { reply: oneshot::Sender<()> },
}

/// Handle used by the rest of the node to talk to the cluster processor.
#[derive(Clone)]
pub struct ClusterHandle {
    processor: ProcessorHandle<ClusterCommand>,
    state: watch::Receiver<Arc<ReplicatedState>>,
    status: watch::Receiver<NodeStatus>,
}

impl ClusterHandle {
    /// Latest published state.
    pub fn state(&self) -> Arc<ReplicatedState> {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every published state.
    pub fn watch_state(&self) -> watch::Receiver<Arc<ReplicatedState>> {
        self.state.clone()
    }

    /// Wait until the node reaches `wanted`.
    pub async fn wait_for_status(&self, wanted: NodeStatus, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        tokio::time::timeout(timeout, status.wait_for(|s| *s == wanted))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    /// Join a group, creating it if needed. Returns `true` for exactly one
    /// joiner per group lifetime: the one whose join the sequencer ordered
    /// first.
    pub async fn join_group(
        &self,
        group: GroupKey,
        bucket_count: u32,
        replica_count: u32,
        timeout: Duration,
    ) -> Result<bool> {
        self.processor
            .request_timeout(timeout, |reply| ClusterCommand::JoinGroup {
                group,
                bucket_count,
                replica_count,
                reply,
            })
            .await?
    }

    pub async fn leave_group(&self, group: GroupKey, timeout: Duration) -> Result<()> {
        self.processor
            .request_timeout(timeout, |reply| ClusterCommand::LeaveGroup { group, reply })
            .await?
    }

    pub fn commit_transfer(&self, group: GroupKey, bucket: BucketId, to: ClusterNodeAddress) -> Result<()> {
        self.processor
            .enqueue(ClusterCommand::CommitTransfer { group, bucket, to })
    }

    pub fn subscribe(
        &self,
        group_type: Option<GroupType>,
        listener: Arc<dyn ClusterEventListener>,
    ) -> Result<()> {
        self.processor
            .enqueue(ClusterCommand::Subscribe { group_type, listener })
    }

    /// Hand off buckets, leave the cluster and stop the processor.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        let result = self
            .processor
            .request_timeout(timeout, |reply| ClusterCommand::Leave { reply })
            .await;
        self.processor.stop();
        result
    }

    pub fn stop(&self) {
        self.processor.stop();
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("status", &self.status())
            .field("state", &self.state())
            .finish()
    }
}

/// What the sequencer sends for a resend request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResendPlan {
    Updates(Vec<SequencedUpdate>),
    StateTransfer,
    UpToDate,
}

/// Updates from `from_seq` on if the buffer still holds all of them.
pub(crate) fn plan_resend(
    buffer: &VecDeque<SequencedUpdate>,
    epoch: u64,
    seq: u64,
    requested_epoch: u64,
    from_seq: u64,
) -> ResendPlan {
    if requested_epoch != epoch {
        return ResendPlan::StateTransfer;
    }
    if from_seq > seq {
        return ResendPlan::UpToDate;
    }
    match buffer.front() {
        Some(first) if first.seq <= from_seq => ResendPlan::Updates(
            buffer.iter().filter(|u| u.seq >= from_seq).cloned().collect(),
        ),
        _ => ResendPlan::StateTransfer,
    }
}

/// Whether a node in `status` holding `current` replaces it with `offered`.
pub(crate) fn accepts_transfer(
    status: NodeStatus,
    current: &ReplicatedState,
    offered: &ReplicatedState,
) -> bool {
    match status {
        NodeStatus::Joining | NodeStatus::Syncing => true,
        NodeStatus::Stopped => false,
        NodeStatus::Operational => {
            offered.epoch > current.epoch
                || (offered.epoch == current.epoch && offered.seq > current.seq)
        }
    }
}

enum WaitReply {
    /// Answered with whether the join created the group.
    Join(oneshot::Sender<Result<bool>>),
    Leave(oneshot::Sender<Result<()>>),
}

impl WaitReply {
    fn is_closed(&self) -> bool {
        match self {
            WaitReply::Join(reply) => reply.is_closed(),
            WaitReply::Leave(reply) => reply.is_closed(),
        }
    }

    fn fail(self, error: Error) {
        match self {
            WaitReply::Join(reply) => {
                let _ = reply.send(Err(error));
            }
            WaitReply::Leave(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

struct GroupWaiter {
    group: GroupKey,
    message: Message,
    last_sent: Instant,
    reply: WaitReply,
}

enum LeaveStage {
    /// Handing buckets off group by group.
    HandingOff,
    /// LeaveRequest sent; waiting to be removed.
    Departing,
}

struct LeaveProgress {
    stage: LeaveStage,
    deadline: Instant,
    replies: Vec<oneshot::Sender<()>>,
}

/// Handler owning the replicated state.
pub struct ClusterProcessor {
    router: Arc<Router>,
    config: NodeConfig,
    local: ClusterNodeAddress,
    state: ReplicatedState,
    status: NodeStatus,
    published: watch::Sender<Arc<ReplicatedState>>,
    status_tx: watch::Sender<NodeStatus>,
    retransmit: VecDeque<SequencedUpdate>,
    buffered: BTreeMap<u64, SequencedUpdate>,
    last_resend: Option<Instant>,
    join_started: Instant,
    last_join_attempt: Option<Instant>,
    suspected: HashMap<ClusterNodeAddress, Instant>,
    groups: BTreeMap<GroupKey, (u32, u32)>,
    /// Groups created by this node's own join since waiters were last resolved.
    created: HashSet<GroupKey>,
    waiters: Vec<GroupWaiter>,
    leaving: Option<LeaveProgress>,
}

impl ClusterProcessor {
    /// Start the processor; it joins or forms a cluster on its first tick.
    pub fn spawn(
        router: Arc<Router>,
        config: NodeConfig,
        parent: &CancellationToken,
    ) -> (ClusterHandle, JoinHandle<()>) {
        let (published, state_rx) = watch::channel(Arc::new(ReplicatedState::new()));
        let (status_tx, status_rx) = watch::channel(NodeStatus::Joining);
        let tick = config.ping_interval;
        let processor = Self {
            local: router.local().clone(),
            router: router.clone(),
            config,
            state: ReplicatedState::new(),
            status: NodeStatus::Joining,
            published,
            status_tx,
            retransmit: VecDeque::new(),
            buffered: BTreeMap::new(),
            last_resend: None,
            join_started: Instant::now(),
            last_join_attempt: None,
            suspected: HashMap::new(),
            groups: BTreeMap::new(),
            created: HashSet::new(),
            waiters: Vec::new(),
            leaving: None,
        };
        let (handle, task) = Processor::spawn("cluster", processor, Some(tick), parent);
        router.attach_cluster(handle.clone());
        (
            ClusterHandle {
                processor: handle,
                state: state_rx,
                status: status_rx,
            },
            task,
        )
    }

    fn is_sequencer(&self) -> bool {
        self.state.sequencer() == Some(&self.local)
    }

    fn set_status(&mut self, status: NodeStatus) {
        if self.status != status {
            info!(node = %self.local, from = %self.status, to = %status, "Node status changed");
            self.status = status;
            self.status_tx.send_replace(status);
        }
    }

    fn send(&self, to: &ClusterNodeAddress, body: Message) {
        if let Err(e) = self.router.send(to, ProcessorKey::Cluster, body) {
            debug!(peer = %to, error = %e, "Cluster send failed");
        }
    }

    fn send_to_sequencer(&self, body: Message) {
        match self.state.sequencer() {
            Some(sequencer) => self.send(&sequencer.clone(), body),
            None => debug!(node = %self.local, message = body.name(), "No sequencer known"),
        }
    }

    fn send_state_transfer(&self, to: &ClusterNodeAddress) {
        trace!(peer = %to, seq = self.state.seq(), "Sending state transfer");
        self.send(
            to,
            Message::StateTransfer {
                cluster_id: self.router.cluster_id(),
                state: self.state.copy(),
            },
        );
    }

    fn other_members(&self) -> Vec<ClusterNodeAddress> {
        self.state
            .member_addresses()
            .into_iter()
            .filter(|m| *m != self.local)
            .collect()
    }

    fn publish(&self) {
        let snapshot = Arc::new(self.state.copy());
        self.published.send_replace(snapshot.clone());
        for (group, store) in self.router.stores() {
            if let Err(e) = store.enqueue(StoreCommand::Topology(snapshot.clone())) {
                warn!(node = %self.local, group = %group, error = %e, "Topology not delivered, store closed");
            }
        }
    }

    // ---- joining ----

    fn join_targets(&self) -> Vec<ClusterNodeAddress> {
        let mut targets: Vec<ClusterNodeAddress> = self
            .config
            .seeds
            .iter()
            .map(|seed| ClusterNodeAddress::from(*seed))
            .filter(|seed| *seed != self.local)
            .collect();
        if let Some(sequencer) = self.state.sequencer() {
            if *sequencer != self.local && !targets.contains(sequencer) {
                targets.push(sequencer.clone());
            }
        }
        targets
    }

    async fn tick_joining(&mut self) {
        let now = Instant::now();
        let targets = self.join_targets();
        let timed_out = now.saturating_duration_since(self.join_started) >= self.config.join_timeout;

        if self.status == NodeStatus::Syncing && timed_out {
            debug!(node = %self.local, "Rejoin timed out, starting over");
            self.set_status(NodeStatus::Joining);
            self.join_started = now;
            return;
        }
        if targets.is_empty() || (timed_out && self.config.form_cluster_on_join_timeout) {
            self.form_cluster().await;
            return;
        }

        let due = self
            .last_join_attempt
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.ping_interval * 2);
        if due {
            self.last_join_attempt = Some(now);
            let member = MemberInfo {
                address: self.local.clone(),
                joined_at: self.router.clock().current_time(),
            };
            for target in &targets {
                debug!(node = %self.local, seed = %target, "Sending join request");
                self.send(target, Message::JoinRequest { member: member.clone() });
            }
        }
    }

    async fn form_cluster(&mut self) {
        let cluster_id = Uuid::new_v4();
        info!(node = %self.local, %cluster_id, "Forming new cluster");
        self.router.set_cluster_id(cluster_id);

        let mut fresh = ReplicatedState::new();
        fresh.epoch = 1;
        self.state.reset(fresh);
        self.retransmit.clear();
        self.buffered.clear();
        self.set_status(NodeStatus::Operational);

        let me = MemberInfo {
            address: self.local.clone(),
            joined_at: self.router.clock().current_time(),
        };
        self.sequence(ClusterChange::MemberJoined(me)).await;
        self.rejoin_groups();
    }

    /// This node was dropped from the cluster while still running.
    fn rejoin(&mut self) {
        warn!(node = %self.local, "Node was removed from the cluster, rejoining");
        self.set_status(NodeStatus::Syncing);
        self.join_started = Instant::now();
        self.last_join_attempt = None;
    }

    fn rejoin_groups(&mut self) {
        let missing: Vec<(GroupKey, u32, u32)> = self
            .groups
            .iter()
            .filter(|(key, _)| {
                !self
                    .state
                    .group(key)
                    .is_some_and(|g| g.is_member(&self.local) && !g.is_leaving(&self.local))
            })
            .map(|(key, (buckets, replicas))| (key.clone(), *buckets, *replicas))
            .collect();
        for (group, bucket_count, replica_count) in missing {
            debug!(node = %self.local, group = %group, "Re-registering group membership");
            self.send_to_sequencer(Message::JoinGroup {
                group,
                bucket_count,
                replica_count,
            });
        }
    }

    // ---- sequencing ----

    /// Apply a change as sequencer and broadcast it.
    async fn sequence(&mut self, change: ClusterChange) {
        let update = SequencedUpdate {
            epoch: self.state.epoch,
            seq: self.state.seq + 1,
            time: self.router.clock().current_time(),
            change,
        };
        let joiner = match &update.change {
            ClusterChange::MemberJoined(info) => Some(info.address.clone()),
            _ => None,
        };

        trace!(node = %self.local, seq = update.seq, change = ?update.change, "Sequencing change");
        let events = self.apply_update(&update);

        self.retransmit.push_back(update.clone());
        while self.retransmit.len() > self.config.retransmit_buffer {
            self.retransmit.pop_front();
        }

        let recipients: Vec<ClusterNodeAddress> = self
            .other_members()
            .into_iter()
            .filter(|m| Some(m) != joiner.as_ref())
            .collect();
        if !recipients.is_empty() {
            self.router
                .broadcast(&recipients, ProcessorKey::Cluster, Message::Update(update))
                .await;
        }
        if let Some(joiner) = joiner.filter(|j| *j != self.local) {
            self.send_state_transfer(&joiner);
        }

        self.after_change(events);
    }

    fn apply_update(&mut self, update: &SequencedUpdate) -> Vec<StateEvent> {
        let creating = match &update.change {
            ClusterChange::GroupMemberJoined { group, member, .. }
                if *member == self.local && self.state.group(group).is_none() =>
            {
                Some(group.clone())
            }
            _ => None,
        };
        let events = self.state.apply(&update.change);
        self.state.seq = update.seq;
        if let Some(group) = creating.filter(|g| self.is_group_member(g)) {
            debug!(node = %self.local, group = %group, "Created group");
            self.created.insert(group);
        }
        events
    }

    fn after_change(&mut self, events: Vec<StateEvent>) {
        for event in &events {
            match event {
                StateEvent::MemberJoined(node) => {
                    info!(node = %self.local, member = %node, "Member joined");
                    self.router.liveness().watch(node);
                }
                StateEvent::MemberLeft(node) => {
                    info!(node = %self.local, member = %node, "Member left");
                    self.router.liveness().forget(node);
                    self.suspected.remove(node);
                    if *node != self.local {
                        self.router.transport().disconnect(node);
                    }
                }
                _ => {}
            }
        }

        let departed = self.status == NodeStatus::Operational && !self.state.is_member(&self.local);
        self.state.notify(&events);
        self.publish();
        self.resolve_waiters();

        if departed {
            if self.leaving.is_some() {
                self.finish_leave();
            } else {
                self.rejoin();
            }
            return;
        }
        self.check_leave();
    }

    // ---- update stream ----

    fn on_update(&mut self, sender: &ClusterNodeAddress, update: SequencedUpdate) {
        if self.status != NodeStatus::Operational {
            return;
        }
        if update.epoch < self.state.epoch || (update.epoch == self.state.epoch && update.seq <= self.state.seq) {
            trace!(seq = update.seq, "Ignoring stale update");
            return;
        }
        if update.epoch > self.state.epoch {
            // A takeover happened that this node missed.
            self.request_resend(sender);
            return;
        }
        if update.seq > self.state.seq + 1 {
            debug!(
                node = %self.local,
                expected = self.state.seq + 1,
                got = update.seq,
                "Gap in update stream"
            );
            self.buffered.insert(update.seq, update);
            self.request_resend(sender);
            return;
        }

        let mut events = self.apply_update(&update);
        while let Some(next) = self.buffered.remove(&(self.state.seq + 1)) {
            events.extend(self.apply_update(&next));
        }
        self.buffered.retain(|seq, _| *seq > self.state.seq);
        self.after_change(events);
    }

    fn request_resend(&mut self, to: &ClusterNodeAddress) {
        let now = Instant::now();
        if self
            .last_resend
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.ping_interval)
        {
            return;
        }
        self.last_resend = Some(now);
        self.send(
            to,
            Message::ResendRequest {
                epoch: self.state.epoch,
                from_seq: self.state.seq + 1,
            },
        );
    }

    fn on_resend_request(&self, sender: &ClusterNodeAddress, epoch: u64, from_seq: u64) {
        if !self.is_sequencer() {
            return;
        }
        match plan_resend(&self.retransmit, self.state.epoch, self.state.seq, epoch, from_seq) {
            ResendPlan::Updates(updates) => {
                debug!(peer = %sender, from_seq, count = updates.len(), "Resending updates");
                for update in updates {
                    self.send(sender, Message::Update(update));
                }
            }
            ResendPlan::StateTransfer => self.send_state_transfer(sender),
            ResendPlan::UpToDate => {}
        }
    }

    fn on_state_transfer(&mut self, cluster_id: Uuid, offered: ReplicatedState) {
        if self.status == NodeStatus::Operational && cluster_id != self.router.cluster_id() {
            debug!(%cluster_id, "Ignoring state of another cluster");
            return;
        }
        if !accepts_transfer(self.status, &self.state, &offered) {
            return;
        }

        let epoch_changed = offered.epoch != self.state.epoch;
        let events = self.state.diff(&offered);
        self.state.reset(offered);
        self.router.set_cluster_id(cluster_id);
        self.retransmit.clear();
        if epoch_changed {
            self.buffered.clear();
        }
        let mut events = events;
        while let Some(next) = self.buffered.remove(&(self.state.seq + 1)) {
            events.extend(self.apply_update(&next));
        }
        self.buffered.retain(|seq, _| *seq > self.state.seq);

        for member in self.state.member_addresses() {
            self.router.liveness().watch(&member);
        }

        if !self.state.is_member(&self.local) {
            // Not in the transferred state: still joining, or dropped.
            if self.status == NodeStatus::Operational {
                self.after_change(events);
            } else {
                self.state.notify(&events);
                self.publish();
            }
            return;
        }

        if self.status != NodeStatus::Operational {
            info!(
                node = %self.local,
                %cluster_id,
                members = self.state.members().len(),
                "Joined cluster"
            );
            self.set_status(NodeStatus::Operational);
            self.rejoin_groups();
        }
        self.after_change(events);
    }

    // ---- membership requests handled by the sequencer ----

    async fn on_join_request(&mut self, member: MemberInfo) {
        if self.status != NodeStatus::Operational {
            return;
        }
        if !self.is_sequencer() {
            self.send_to_sequencer(Message::JoinRequest { member });
            return;
        }

        let address = member.address;
        match self.state.member(&address).map(|m| m.address.process_id) {
            Some(pid) if pid == address.process_id => self.send_state_transfer(&address),
            Some(_) => {
                info!(member = %address, "Member restarted, replacing it");
                self.sequence(ClusterChange::MembersLeft(vec![address.clone()])).await;
                self.admit(address).await;
            }
            None => self.admit(address).await,
        }
    }

    async fn admit(&mut self, address: ClusterNodeAddress) {
        let info = MemberInfo {
            address,
            joined_at: self.router.clock().current_time(),
        };
        self.sequence(ClusterChange::MemberJoined(info)).await;
    }

    async fn on_leave_request(&mut self, member: ClusterNodeAddress) {
        if !self.is_sequencer() {
            self.send_to_sequencer(Message::LeaveRequest { member });
            return;
        }
        if self.state.is_member(&member) {
            self.sequence(ClusterChange::MembersLeft(vec![member])).await;
        }
    }

    async fn on_peer_unreachable(&mut self, node: ClusterNodeAddress) {
        if self.status != NodeStatus::Operational || node == self.local {
            return;
        }
        if self.is_sequencer() && self.state.is_member(&node) {
            warn!(node = %self.local, peer = %node, "Removing unreachable member");
            self.sequence(ClusterChange::MembersLeft(vec![node])).await;
        }
    }

    fn on_suspect(&self, node: ClusterNodeAddress) {
        if !self.is_sequencer() || !self.state.is_member(&node) || node == self.local {
            return;
        }
        // Check over TCP; an undeliverable ping removes the node.
        debug!(peer = %node, "Pinging suspected member over TCP");
        self.send(
            &node,
            Message::Ping {
                epoch: self.state.epoch,
                seq: self.state.seq,
            },
        );
    }

    fn on_ping(&mut self, sender: &ClusterNodeAddress, cluster_id: Uuid, epoch: u64, seq: u64) {
        if self.status != NodeStatus::Operational || cluster_id != self.router.cluster_id() {
            return;
        }
        if !self.state.is_member(sender) {
            if self.is_sequencer() {
                // The sender still thinks it is a member; let it find out.
                self.send_state_transfer(sender);
            }
            return;
        }
        let from_sequencer = self.state.sequencer() == Some(sender);
        if (from_sequencer && epoch == self.state.epoch && seq > self.state.seq) || epoch > self.state.epoch {
            self.request_resend(sender);
        }
    }

    // ---- groups ----

    async fn on_join_group(
        &mut self,
        sender: ClusterNodeAddress,
        group: GroupKey,
        bucket_count: u32,
        replica_count: u32,
    ) {
        if !self.is_sequencer() || !self.state.is_member(&sender) {
            return;
        }
        if let Some(existing) = self.state.group(&group) {
            if existing.bucket_count() != bucket_count {
                let reason = format!(
                    "group {group} has {} buckets, node asked for {bucket_count}",
                    existing.bucket_count()
                );
                warn!(peer = %sender, %reason, "Rejecting group join");
                self.send(&sender, Message::JoinGroupRejected { group, reason });
                return;
            }
            if existing.is_member(&sender) && !existing.is_leaving(&sender) {
                return;
            }
        }
        self.sequence(ClusterChange::GroupMemberJoined {
            group,
            member: sender,
            bucket_count,
            replica_count,
        })
        .await;
    }

    async fn on_leave_group(&mut self, sender: ClusterNodeAddress, group: GroupKey) {
        if !self.is_sequencer() {
            return;
        }
        let leaving = self
            .state
            .group(&group)
            .is_some_and(|g| g.is_member(&sender) && !g.is_leaving(&sender));
        if leaving {
            self.sequence(ClusterChange::GroupMemberLeaving { group, member: sender })
                .await;
        }
    }

    async fn on_commit_transfer(
        &mut self,
        group: GroupKey,
        bucket: BucketId,
        from: ClusterNodeAddress,
        to: ClusterNodeAddress,
    ) {
        if !self.is_sequencer() {
            return;
        }
        let in_flight = self
            .state
            .group(&group)
            .and_then(|g| g.bucket(bucket))
            .is_some_and(|b| b.is_owner(&from) && b.is_pending(&to));
        if !in_flight {
            trace!(group = %group, bucket, "Ignoring stale transfer commit");
            return;
        }
        self.sequence(ClusterChange::TransferCommitted { group, bucket, from, to })
            .await;
    }

    fn local_join_group(
        &mut self,
        group: GroupKey,
        bucket_count: u32,
        replica_count: u32,
        reply: oneshot::Sender<Result<bool>>,
    ) {
        if self.status != NodeStatus::Operational {
            let _ = reply.send(Err(MembershipError::NotOperational(self.status.to_string()).into()));
            return;
        }
        if let Some(existing) = self.state.group(&group) {
            if existing.bucket_count() != bucket_count {
                let _ = reply.send(Err(bucket_mismatch(existing.bucket_count(), bucket_count)));
                return;
            }
        }
        self.groups.insert(group.clone(), (bucket_count, replica_count));
        if self.is_group_member(&group) {
            let _ = reply.send(Ok(false));
            return;
        }

        let message = Message::JoinGroup {
            group: group.clone(),
            bucket_count,
            replica_count,
        };
        self.send_to_sequencer(message.clone());
        self.waiters.push(GroupWaiter {
            group,
            message,
            last_sent: Instant::now(),
            reply: WaitReply::Join(reply),
        });
    }

    fn local_leave_group(&mut self, group: GroupKey, reply: oneshot::Sender<Result<()>>) {
        self.groups.remove(&group);
        let member = self
            .state
            .group(&group)
            .is_some_and(|g| g.is_member(&self.local));
        if !member {
            let _ = reply.send(Ok(()));
            return;
        }
        let message = Message::LeaveGroup { group: group.clone() };
        self.send_to_sequencer(message.clone());
        self.waiters.push(GroupWaiter {
            group,
            message,
            last_sent: Instant::now(),
            reply: WaitReply::Leave(reply),
        });
    }

    fn is_group_member(&self, group: &GroupKey) -> bool {
        self.state
            .group(group)
            .is_some_and(|g| g.is_member(&self.local) && !g.is_leaving(&self.local))
    }

    fn resolve_waiters(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            let GroupWaiter {
                group,
                message,
                last_sent,
                reply,
            } = waiter;
            let reply = match reply {
                WaitReply::Join(reply) if self.is_group_member(&group) => {
                    // A join seen only through a state transfer is recognised
                    // as the creating one when nobody else has joined since.
                    let created = self.created.remove(&group)
                        || self.state.group(&group).is_some_and(|g| g.members().len() == 1);
                    let _ = reply.send(Ok(created));
                    continue;
                }
                WaitReply::Leave(reply)
                    if !self.state.group(&group).is_some_and(|g| g.is_member(&self.local)) =>
                {
                    let _ = reply.send(Ok(()));
                    continue;
                }
                pending => pending,
            };
            if !reply.is_closed() {
                self.waiters.push(GroupWaiter {
                    group,
                    message,
                    last_sent,
                    reply,
                });
            }
        }
        self.created.clear();
    }

    fn reject_waiters(&mut self, group: &GroupKey, reason: &str) {
        self.groups.remove(group);
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if &waiter.group == group && matches!(waiter.reply, WaitReply::Join(_)) {
                waiter.reply.fail(
                    ConfigError::Invalid {
                        field: "bucket_count",
                        reason: reason.to_string(),
                    }
                    .into(),
                );
            } else {
                self.waiters.push(waiter);
            }
        }
    }

    fn resend_waiters(&mut self) {
        let now = Instant::now();
        let every = self.config.ping_interval * 4;
        let due: Vec<Message> = self
            .waiters
            .iter_mut()
            .filter(|w| now.saturating_duration_since(w.last_sent) >= every)
            .map(|w| {
                w.last_sent = now;
                w.message.clone()
            })
            .collect();
        for message in due {
            self.send_to_sequencer(message);
        }
    }

    // ---- graceful leave ----

    fn start_leave(&mut self, reply: oneshot::Sender<()>) {
        if let Some(progress) = &mut self.leaving {
            progress.replies.push(reply);
            return;
        }
        if self.status != NodeStatus::Operational {
            self.set_status(NodeStatus::Stopped);
            let _ = reply.send(());
            return;
        }

        info!(node = %self.local, "Leaving cluster");
        self.groups.clear();
        let groups: Vec<GroupKey> = self
            .state
            .groups()
            .filter(|g| g.is_member(&self.local))
            .map(|g| g.key().clone())
            .collect();
        for group in groups {
            self.send_to_sequencer(Message::LeaveGroup { group });
        }
        self.leaving = Some(LeaveProgress {
            stage: LeaveStage::HandingOff,
            deadline: Instant::now() + self.config.leave_timeout,
            replies: vec![reply],
        });
        self.check_leave();
    }

    fn check_leave(&mut self) {
        let Some(progress) = &self.leaving else {
            return;
        };
        let expired = Instant::now() >= progress.deadline;
        let handing_off = matches!(progress.stage, LeaveStage::HandingOff);
        if handing_off {
            let handed_off = !self.state.groups().any(|g| g.is_member(&self.local));
            if handed_off || expired {
                if expired {
                    warn!(node = %self.local, "Leave timeout reached before handoff completed");
                }
                self.send_to_sequencer(Message::LeaveRequest {
                    member: self.local.clone(),
                });
                if let Some(progress) = &mut self.leaving {
                    progress.stage = LeaveStage::Departing;
                    progress.deadline = Instant::now() + self.config.leave_timeout;
                }
            }
        } else if expired || !self.state.is_member(&self.local) {
            self.finish_leave();
        }
    }

    fn finish_leave(&mut self) {
        if let Some(progress) = self.leaving.take() {
            info!(node = %self.local, "Left cluster");
            self.set_status(NodeStatus::Stopped);
            for reply in progress.replies {
                let _ = reply.send(());
            }
        }
    }

    // ---- failure detection ----

    async fn tick_operational(&mut self) {
        let members = self.state.member_addresses();
        let others = self.other_members();
        if !others.is_empty() {
            self.router
                .broadcast(
                    &members,
                    ProcessorKey::Cluster,
                    Message::Ping {
                        epoch: self.state.epoch,
                        seq: self.state.seq,
                    },
                )
                .await;
        }

        let expired = self.router.liveness().expired(&others);
        if !expired.is_empty() {
            if self.is_sequencer() {
                warn!(node = %self.local, members = ?expired, "Members timed out");
                self.sequence(ClusterChange::MembersLeft(expired)).await;
            } else if self
                .state
                .sequencer()
                .is_some_and(|s| expired.contains(s))
            {
                let first_live = members
                    .iter()
                    .find(|m| **m == self.local || !expired.contains(m))
                    .cloned();
                if first_live.as_ref() == Some(&self.local) {
                    self.take_over(expired).await;
                }
            } else {
                self.suspect(expired);
            }
        }

        self.resend_waiters();
        self.check_leave();
    }

    fn suspect(&mut self, nodes: Vec<ClusterNodeAddress>) {
        let now = Instant::now();
        for node in nodes {
            let recent = self
                .suspected
                .get(&node)
                .is_some_and(|at| now.saturating_duration_since(*at) < self.config.network_timeout);
            if !recent {
                debug!(node = %self.local, peer = %node, "Suspecting member");
                self.suspected.insert(node.clone(), now);
                self.send_to_sequencer(Message::SuspectNode { node });
            }
        }
    }

    /// The sequencer went silent and this node is the oldest live member.
    async fn take_over(&mut self, departed: Vec<ClusterNodeAddress>) {
        warn!(
            node = %self.local,
            departed = ?departed,
            epoch = self.state.epoch + 1,
            "Taking over as sequencer"
        );
        self.state.epoch += 1;
        self.state.seq = 0;
        self.retransmit.clear();
        self.buffered.clear();

        let update = SequencedUpdate {
            epoch: self.state.epoch,
            seq: 1,
            time: self.router.clock().current_time(),
            change: ClusterChange::MembersLeft(departed),
        };
        let events = self.apply_update(&update);
        self.retransmit.push_back(update);

        let others = self.other_members();
        self.router
            .broadcast(
                &others,
                ProcessorKey::Cluster,
                Message::StateTransfer {
                    cluster_id: self.router.cluster_id(),
                    state: self.state.copy(),
                },
            )
            .await;
        self.after_change(events);
    }

    async fn handle_remote(&mut self, envelope: Envelope) {
        let Envelope {
            cluster_id,
            sender,
            body,
            ..
        } = envelope;
        match body {
            Message::Ping { epoch, seq } => self.on_ping(&sender, cluster_id, epoch, seq),
            Message::JoinRequest { member } => self.on_join_request(member).await,
            Message::LeaveRequest { member } => self.on_leave_request(member).await,
            Message::SuspectNode { node } => self.on_suspect(node),
            Message::Update(update) => self.on_update(&sender, update),
            Message::ResendRequest { epoch, from_seq } => {
                self.on_resend_request(&sender, epoch, from_seq)
            }
            Message::StateTransfer { cluster_id, state } => self.on_state_transfer(cluster_id, state),
            Message::JoinGroup {
                group,
                bucket_count,
                replica_count,
            } => {
                self.on_join_group(sender, group, bucket_count, replica_count)
                    .await
            }
            Message::JoinGroupRejected { group, reason } => self.reject_waiters(&group, &reason),
            Message::LeaveGroup { group } => self.on_leave_group(sender, group).await,
            Message::CommitTransfer { group, bucket, from, to } => {
                self.on_commit_transfer(group, bucket, from, to).await
            }
            other => debug!(peer = %sender, message = other.name(), "Unexpected cluster message"),
        }
    }
}

fn bucket_mismatch(existing: u32, requested: u32) -> Error {
    ConfigError::Invalid {
        field: "bucket_count",
        reason: format!("cluster uses {existing} buckets for this cache, configured {requested}"),
    }
    .into()
}

#[async_trait]
impl Handler for ClusterProcessor {
    type Message = ClusterCommand;

    async fn handle(&mut self, command: ClusterCommand) {
        match command {
            ClusterCommand::Remote(envelope) => self.handle_remote(envelope).await,
            ClusterCommand::PeerUnreachable(node) => self.on_peer_unreachable(node).await,
            ClusterCommand::JoinGroup {
                group,
                bucket_count,
                replica_count,
                reply,
            } => self.local_join_group(group, bucket_count, replica_count, reply),
            ClusterCommand::LeaveGroup { group, reply } => self.local_leave_group(group, reply),
            ClusterCommand::CommitTransfer { group, bucket, to } => {
                let from = self.local.clone();
                self.send_to_sequencer(Message::CommitTransfer { group, bucket, from, to });
            }
            ClusterCommand::Subscribe { group_type, listener } => {
                self.state.subscribe(group_type, listener)
            }
            ClusterCommand::Leave { reply } => self.start_leave(reply),
        }
    }

    async fn tick(&mut self) {
        match self.status {
            NodeStatus::Joining | NodeStatus::Syncing => self.tick_joining().await,
            NodeStatus::Operational => self.tick_operational().await,
            NodeStatus::Stopped => {}
        }
    }

    async fn stopped(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.reply.fail(Error::Shutdown);
        }
        if let Some(progress) = self.leaving.take() {
            for reply in progress.replies {
                let _ = reply.send(());
            }
        }
        self.set_status(NodeStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Time;
    use std::net::SocketAddr;

    fn addr(port: u16) -> ClusterNodeAddress {
        ClusterNodeAddress::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn update(epoch: u64, seq: u64) -> SequencedUpdate {
        SequencedUpdate {
            epoch,
            seq,
            time: Time::new(seq as i64, 0),
            change: ClusterChange::MemberJoined(MemberInfo {
                address: addr(seq as u16),
                joined_at: Time::ZERO,
            }),
        }
    }

    #[test]
    fn test_resend_from_buffer() {
        let buffer: VecDeque<SequencedUpdate> = (5..=9).map(|s| update(2, s)).collect();

        match plan_resend(&buffer, 2, 9, 2, 7) {
            ResendPlan::Updates(updates) => {
                assert_eq!(updates.iter().map(|u| u.seq).collect::<Vec<_>>(), vec![7, 8, 9]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(plan_resend(&buffer, 2, 9, 2, 10), ResendPlan::UpToDate);
    }

    #[test]
    fn test_resend_falls_back_to_state_transfer() {
        let buffer: VecDeque<SequencedUpdate> = (5..=9).map(|s| update(2, s)).collect();
        // Range already dropped from the buffer.
        assert_eq!(plan_resend(&buffer, 2, 9, 2, 3), ResendPlan::StateTransfer);
        // Requester is in an older epoch.
        assert_eq!(plan_resend(&buffer, 2, 9, 1, 6), ResendPlan::StateTransfer);
        assert_eq!(plan_resend(&VecDeque::new(), 2, 9, 2, 1), ResendPlan::StateTransfer);
    }

    #[test]
    fn test_transfer_acceptance() {
        let mut current = ReplicatedState::new();
        current.epoch = 2;
        current.seq = 10;

        let mut older = ReplicatedState::new();
        older.epoch = 2;
        older.seq = 10;
        let mut newer = older.clone();
        newer.seq = 11;
        let mut next_epoch = ReplicatedState::new();
        next_epoch.epoch = 3;
        next_epoch.seq = 1;

        assert!(!accepts_transfer(NodeStatus::Operational, &current, &older));
        assert!(accepts_transfer(NodeStatus::Operational, &current, &newer));
        assert!(accepts_transfer(NodeStatus::Operational, &current, &next_epoch));
        assert!(accepts_transfer(NodeStatus::Joining, &current, &older));
        assert!(accepts_transfer(NodeStatus::Syncing, &current, &older));
        assert!(!accepts_transfer(NodeStatus::Stopped, &current, &newer));
    }
}
