//! Routing of envelopes to local processors and remote nodes.
//!
//! The router is the single entry point for everything a node receives and
//! the single exit for everything it sends:
//!
//! - inbound envelopes (TCP and UDP) are dispatched by destination key to the
//!   cluster processor, a store processor or the pending-reply table;
//! - outbound envelopes addressed to the local node skip the network;
//! - request/response pairs are correlated through request ids, and a
//!   request whose envelope the transport gave up on is failed right away.

use crate::cache::StoreCommand;
use crate::clock::Clock;
use crate::cluster::ClusterCommand;
use crate::error::{Error, MembershipError, NetworkError, RemoteFailure, Result};
use crate::network::message::{entry_budget, CacheRequest, CacheResponse, Envelope, Message, ProcessorKey};
use crate::network::multicast::Multicast;
use crate::network::server::EnvelopeHandler;
use crate::network::transport::{Transport, Undeliverable};
use crate::processor::{PeerTimeouts, ProcessorHandle};
use crate::types::{ClusterNodeAddress, GroupKey};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

type ReplySlot = oneshot::Sender<Result<CacheResponse>>;

/// Dispatches envelopes and correlates requests with responses.
pub struct Router {
    local: ClusterNodeAddress,
    cluster_id: RwLock<Uuid>,
    clock: Arc<Clock>,
    transport: Transport,
    multicast: Option<Arc<Multicast>>,
    cluster: OnceLock<ProcessorHandle<ClusterCommand>>,
    stores: DashMap<GroupKey, ProcessorHandle<StoreCommand>>,
    pending: DashMap<u64, ReplySlot>,
    next_request: AtomicU64,
    liveness: PeerTimeouts,
}

impl Router {
    pub fn new(
        clock: Arc<Clock>,
        transport: Transport,
        multicast: Option<Arc<Multicast>>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            local: transport.local().clone(),
            cluster_id: RwLock::new(Uuid::nil()),
            clock,
            transport,
            multicast,
            cluster: OnceLock::new(),
            stores: DashMap::new(),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            liveness: PeerTimeouts::new(network_timeout),
        }
    }

    pub fn local(&self) -> &ClusterNodeAddress {
        &self.local
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Total encoded entry size a single message to a peer may carry.
    pub fn entry_budget(&self) -> usize {
        entry_budget(self.transport.config().max_frame_size)
    }

    /// Silence tracker fed by every received envelope.
    pub fn liveness(&self) -> &PeerTimeouts {
        &self.liveness
    }

    /// Id of the cluster this node belongs to; nil while joining.
    pub fn cluster_id(&self) -> Uuid {
        *self.cluster_id.read()
    }

    pub fn set_cluster_id(&self, id: Uuid) {
        *self.cluster_id.write() = id;
    }

    /// Connect the cluster processor. Only the first call has an effect.
    pub fn attach_cluster(&self, handle: ProcessorHandle<ClusterCommand>) {
        if self.cluster.set(handle).is_err() {
            warn!(node = %self.local, "Cluster processor already attached");
        }
    }

    pub fn register_store(&self, group: GroupKey, handle: ProcessorHandle<StoreCommand>) {
        self.stores.insert(group, handle);
    }

    pub fn unregister_store(&self, group: &GroupKey) -> Option<ProcessorHandle<StoreCommand>> {
        self.stores.remove(group).map(|(_, handle)| handle)
    }

    pub fn store(&self, group: &GroupKey) -> Option<ProcessorHandle<StoreCommand>> {
        self.stores.get(group).map(|h| h.clone())
    }

    /// Every registered store processor.
    pub fn stores(&self) -> Vec<(GroupKey, ProcessorHandle<StoreCommand>)> {
        self.stores
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Stamp a message with this node's identity and clock.
    pub fn envelope(&self, destination: ProcessorKey, body: Message) -> Envelope {
        Envelope {
            cluster_id: self.cluster_id(),
            sender: self.local.clone(),
            sent_at: self.clock.current_time(),
            destination,
            body,
        }
    }

    /// Deliver locally when `to` is this node, otherwise send over TCP.
    pub fn route(&self, to: &ClusterNodeAddress, envelope: Envelope) -> Result<()> {
        if *to == self.local {
            self.dispatch(envelope);
            return Ok(());
        }
        self.transport.send(to, envelope)
    }

    /// Build and route a message.
    pub fn send(&self, to: &ClusterNodeAddress, destination: ProcessorKey, body: Message) -> Result<()> {
        let envelope = self.envelope(destination, body);
        self.route(to, envelope)
    }

    /// Send a message to every member but this node. Datagrams are used when
    /// the envelope fits one; otherwise each member gets it over TCP.
    pub async fn broadcast(&self, members: &[ClusterNodeAddress], destination: ProcessorKey, body: Message) {
        let envelope = self.envelope(destination, body);
        if let Some(multicast) = &self.multicast {
            if let Some(frame) = multicast.encode(&envelope) {
                multicast.send(&frame, members).await;
                return;
            }
            trace!(message = envelope.body.name(), "Envelope exceeds datagram size, using TCP");
        }
        for member in members.iter().filter(|m| **m != self.local) {
            if let Err(e) = self.transport.send(member, envelope.clone()) {
                debug!(peer = %member, error = %e, "Broadcast send failed");
            }
        }
    }

    /// Send a cache request to the store processor of `group` on `to` and
    /// wait for its response.
    pub async fn request(
        &self,
        to: &ClusterNodeAddress,
        group: &GroupKey,
        op: CacheRequest,
        timeout: Duration,
    ) -> Result<CacheResponse> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        trace!(peer = %to, group = %group, request_id, op = op.name(), "Sending request");
        let envelope = self.envelope(
            ProcessorKey::Store(group.clone()),
            Message::Request { request_id, op },
        );
        if let Err(e) = self.route(to, envelope) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Answer a request received from `to`. A response too large for a frame
    /// is replaced by the encoding error so the requester does not wait out
    /// its timeout.
    pub fn respond(&self, to: &ClusterNodeAddress, request_id: u64, result: Result<CacheResponse>) {
        let result = result.map_err(|e| RemoteFailure::from(&e));
        let envelope = self.envelope(ProcessorKey::Reply, Message::Response { request_id, result });
        match self.route(to, envelope) {
            Ok(()) => {}
            Err(e) if is_encode_error(&e) => {
                warn!(peer = %to, request_id, error = %e, "Response cannot be encoded, returning the error");
                let result = Err(RemoteFailure::from(&e));
                let envelope = self.envelope(ProcessorKey::Reply, Message::Response { request_id, result });
                if let Err(e) = self.route(to, envelope) {
                    debug!(peer = %to, request_id, error = %e, "Cannot send error response");
                }
            }
            Err(e) => debug!(peer = %to, request_id, error = %e, "Cannot send response"),
        }
    }

    /// Fail every waiting request.
    pub fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.complete(id, Err(Error::Shutdown));
        }
    }

    /// Drain the transport's failure channel until `cancel` fires.
    pub async fn run_failure_listener(
        self: Arc<Self>,
        mut failures: mpsc::UnboundedReceiver<Undeliverable>,
        cancel: CancellationToken,
    ) {
        loop {
            let failure = tokio::select! {
                _ = cancel.cancelled() => break,
                failure = failures.recv() => match failure {
                    Some(failure) => failure,
                    None => break,
                },
            };
            self.undeliverable(failure);
        }
    }

    fn undeliverable(&self, failure: Undeliverable) {
        let Undeliverable { to, envelope, reason } = failure;
        debug!(peer = %to, message = envelope.body.name(), %reason, "Envelope undeliverable");
        match envelope.body {
            Message::Request { request_id, .. } => {
                self.complete(
                    request_id,
                    Err(NetworkError::PeerUnreachable(to).into()),
                );
            }
            _ => self.to_cluster(ClusterCommand::PeerUnreachable(to)),
        }
    }

    fn complete(&self, request_id: u64, result: Result<CacheResponse>) {
        match self.pending.remove(&request_id) {
            Some((_, slot)) => {
                let _ = slot.send(result);
            }
            None => trace!(request_id, "Late or unknown response dropped"),
        }
    }

    fn to_cluster(&self, command: ClusterCommand) {
        match self.cluster.get() {
            Some(cluster) => {
                if let Err(e) = cluster.enqueue(command) {
                    warn!(node = %self.local, error = %e, "Cluster processor closed, command dropped");
                }
            }
            None => trace!(node = %self.local, "No cluster processor attached"),
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        match &envelope.destination {
            ProcessorKey::Cluster => self.to_cluster(ClusterCommand::Remote(envelope)),
            ProcessorKey::Store(group) => {
                let group = group.clone();
                let sender = envelope.sender.clone();
                let request_id = match &envelope.body {
                    Message::Request { request_id, .. } => Some(*request_id),
                    _ => None,
                };
                let delivered = match self.store(&group) {
                    Some(store) => match store.enqueue(StoreCommand::Remote(envelope)) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(node = %self.local, group = %group, error = %e, "Store processor closed, envelope dropped");
                            false
                        }
                    },
                    None => false,
                };
                // A request nobody will answer fails fast instead of waiting out its timeout.
                if let (false, Some(request_id)) = (delivered, request_id) {
                    self.respond(
                        &sender,
                        request_id,
                        Err(MembershipError::GroupNotFound(group).into()),
                    );
                }
            }
            ProcessorKey::Reply => {
                if let Message::Response { request_id, result } = envelope.body {
                    self.complete(request_id, result.map_err(Error::from));
                }
            }
        }
    }
}

/// Failures to frame an envelope locally, as opposed to failures to reach a peer.
fn is_encode_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Network(NetworkError::FrameTooLarge { .. } | NetworkError::Serialization(_))
    )
}

impl EnvelopeHandler for Router {
    fn deliver(&self, envelope: Envelope) {
        self.clock.observe(envelope.sent_at);
        self.liveness.touch(&envelope.sender);

        // Store traffic from a node of another (or a previous) cluster.
        if matches!(envelope.destination, ProcessorKey::Store(_))
            && envelope.cluster_id != self.cluster_id()
        {
            debug!(
                peer = %envelope.sender,
                message = envelope.body.name(),
                "Dropping envelope from foreign cluster"
            );
            return;
        }
        self.dispatch(envelope);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("cluster_id", &self.cluster_id())
            .field("stores", &self.stores.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
