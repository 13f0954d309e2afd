//! Wire message types.
//!
//! Every frame of payload type `Message` carries one bincode-encoded
//! [`Envelope`]. The envelope names the processor that applies its body on
//! the receiving node.

use crate::clock::Time;
use crate::cluster::state::{MemberInfo, ReplicatedState, SequencedUpdate};
use crate::config::ExtensionRef;
use crate::error::{NetworkError, RemoteFailure};
use crate::network::frame::{HEADER_SIZE, TRAILER_SIZE};
use crate::rebalancing::{TransferBatch, TransferEntry};
use crate::types::{BucketId, ClusterNodeAddress, GroupKey};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room reserved in a frame for everything around the entries a message
/// carries: routing header, addresses, group key and request framing.
pub const ENVELOPE_OVERHEAD: usize = 1024;

/// Total encoded entry size one message may carry in a frame of
/// `max_frame_size` bytes.
pub fn entry_budget(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(HEADER_SIZE + TRAILER_SIZE + ENVELOPE_OVERHEAD)
}

/// Processor a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorKey {
    /// The cluster (membership) processor.
    Cluster,
    /// The store processor of one cache.
    Store(GroupKey),
    /// The pending-reply table of the router.
    Reply,
}

/// A message plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Cluster the sender belongs to. Nil while the sender is still joining.
    pub cluster_id: Uuid,
    pub sender: ClusterNodeAddress,
    /// Sender's clock when the envelope was created.
    pub sent_at: Time,
    pub destination: ProcessorKey,
    pub body: Message,
}

/// Message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Liveness beacon advertising the sender's view of the update stream.
    Ping { epoch: u64, seq: u64 },

    /// Ask the sequencer to add a node to the cluster.
    JoinRequest { member: MemberInfo },
    /// Graceful departure, sent after buckets were handed off.
    LeaveRequest { member: ClusterNodeAddress },
    /// A member stopped hearing from `node`.
    SuspectNode { node: ClusterNodeAddress },

    /// A change sequenced by the sequencer.
    Update(SequencedUpdate),
    /// Receiver missed updates starting at `from_seq`.
    ResendRequest { epoch: u64, from_seq: u64 },
    /// Full replicated state.
    StateTransfer {
        cluster_id: Uuid,
        state: ReplicatedState,
    },

    /// Add the sender to a cache's group, creating the group if needed.
    JoinGroup {
        group: GroupKey,
        bucket_count: u32,
        replica_count: u32,
    },
    JoinGroupRejected { group: GroupKey, reason: String },
    /// Start handing the sender's buckets off before it leaves the group.
    LeaveGroup { group: GroupKey },
    /// The new owner acknowledged every batch of a handoff.
    CommitTransfer {
        group: GroupKey,
        bucket: BucketId,
        from: ClusterNodeAddress,
        to: ClusterNodeAddress,
    },

    /// Cache operation addressed to a store processor.
    Request { request_id: u64, op: CacheRequest },
    /// Answer to a [`Message::Request`].
    Response {
        request_id: u64,
        result: Result<CacheResponse, RemoteFailure>,
    },

    /// Write streamed from a primary to its backups.
    ReplicaUpdate { bucket: BucketId, op: ReplicaOp },
    /// Bucket content sent to a (new) backup.
    ReplicaSync {
        bucket: BucketId,
        entries: Vec<TransferEntry>,
        /// Drop what the backup holds for the bucket first.
        reset: bool,
    },
}

impl Message {
    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "ping",
            Message::JoinRequest { .. } => "join_request",
            Message::LeaveRequest { .. } => "leave_request",
            Message::SuspectNode { .. } => "suspect_node",
            Message::Update(_) => "update",
            Message::ResendRequest { .. } => "resend_request",
            Message::StateTransfer { .. } => "state_transfer",
            Message::JoinGroup { .. } => "join_group",
            Message::JoinGroupRejected { .. } => "join_group_rejected",
            Message::LeaveGroup { .. } => "leave_group",
            Message::CommitTransfer { .. } => "commit_transfer",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::ReplicaUpdate { .. } => "replica_update",
            Message::ReplicaSync { .. } => "replica_sync",
        }
    }
}

/// Operation applied by a store processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheRequest {
    Get { key: Bytes },
    Put {
        key: Bytes,
        value: Bytes,
        ttl_ms: Option<u64>,
        if_absent: bool,
    },
    Remove { key: Bytes },
    ContainsKey { key: Bytes },
    Invalidate { key: Bytes },
    /// Keys all owned by the receiver.
    GetAll { keys: Vec<Bytes> },
    PutAll {
        entries: Vec<(Bytes, Bytes)>,
        ttl_ms: Option<u64>,
    },
    /// Run an executable over the receiver's share of `buckets`.
    Execute {
        buckets: Vec<BucketId>,
        executable: ExtensionRef,
        filter: Option<ExtensionRef>,
    },
    /// Drop every entry of the receiver's share of `buckets`.
    Clear { buckets: Vec<BucketId> },
    /// One batch of an incoming bucket handoff.
    ApplyTransferBatch {
        bucket: BucketId,
        transfer_id: u64,
        batch: TransferBatch,
    },
}

impl CacheRequest {
    pub fn name(&self) -> &'static str {
        match self {
            CacheRequest::Get { .. } => "get",
            CacheRequest::Put { .. } => "put",
            CacheRequest::Remove { .. } => "remove",
            CacheRequest::ContainsKey { .. } => "contains_key",
            CacheRequest::Invalidate { .. } => "invalidate",
            CacheRequest::GetAll { .. } => "get_all",
            CacheRequest::PutAll { .. } => "put_all",
            CacheRequest::Execute { .. } => "execute",
            CacheRequest::Clear { .. } => "clear",
            CacheRequest::ApplyTransferBatch { .. } => "apply_transfer_batch",
        }
    }
}

/// Result of a [`CacheRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheResponse {
    Value(Option<Bytes>),
    Bool(bool),
    /// Partial scatter-gather result plus the requested buckets the receiver
    /// does not own.
    Partial {
        result: Bytes,
        not_owned: Vec<BucketId>,
    },
    Count(u64),
    Values(Vec<(Bytes, Option<Bytes>)>),
    Done,
}

/// Replicated write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicaOp {
    Put(TransferEntry),
    Remove(Bytes),
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub cluster_name: String,
    pub version: u8,
    pub sender: ClusterNodeAddress,
}

/// Server's answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub accepted: bool,
    pub reason: Option<String>,
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, NetworkError> {
    Ok(bincode::serialize(envelope)?)
}

pub fn decode_envelope(data: &[u8]) -> Result<Envelope, NetworkError> {
    Ok(bincode::deserialize(data)?)
}

pub fn encode_handshake(handshake: &Handshake) -> Result<Vec<u8>, NetworkError> {
    Ok(bincode::serialize(handshake)?)
}

pub fn decode_handshake(data: &[u8]) -> Result<Handshake, NetworkError> {
    Ok(bincode::deserialize(data)?)
}

pub fn encode_ack(ack: &HandshakeAck) -> Result<Vec<u8>, NetworkError> {
    Ok(bincode::serialize(ack)?)
}

pub fn decode_ack(data: &[u8]) -> Result<HandshakeAck, NetworkError> {
    Ok(bincode::deserialize(data)?)
}
