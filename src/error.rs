//! Error types for the distributed cache.
//!
//! Retry decisions are made on values, not on control flow: every error
//! reports an [`ErrorKind`] and callers loop on [`ErrorKind::Retryable`].

use crate::types::{BucketId, ClusterNodeAddress, GroupKey};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for distributed cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an operation that failed may succeed if issued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient condition: ownership moved, peer unreachable, node syncing.
    Retryable,
    /// Retrying will not help.
    Fatal,
}

/// Main error type for the distributed cache.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Local entry store and extension hook errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Cluster membership errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Scatter-gather execution errors.
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The bucket addressed by the operation changed owner while in flight.
    #[error("ownership of bucket {bucket} in {group} changed")]
    OwnershipChanged { group: GroupKey, bucket: BucketId },

    /// No node currently owns the bucket.
    #[error("bucket {bucket} in {group} has no owner")]
    BucketUnowned { group: GroupKey, bucket: BucketId },

    /// The operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The node or processor is shutting down.
    #[error("shutting down")]
    Shutdown,

    /// Failure reported by a remote node.
    #[error("remote error: {message}")]
    Remote { retryable: bool, message: String },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify the error for retry loops.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(e) => e.kind(),
            Error::Membership(e) => e.kind(),
            Error::OwnershipChanged { .. } | Error::BucketUnowned { .. } | Error::Timeout => {
                ErrorKind::Retryable
            }
            Error::Remote { retryable: true, .. } => ErrorKind::Retryable,
            _ => ErrorKind::Fatal,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Retryable`.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Peer did not answer within the network timeout or retries were exhausted.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(ClusterNodeAddress),

    /// The peer speaks a different protocol version or belongs to another cluster.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Frame failed signature, magic, length or checksum validation.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::ConnectionFailed { .. }
            | NetworkError::ConnectionClosed
            | NetworkError::SendFailed(_)
            | NetworkError::PeerUnreachable(_)
            | NetworkError::Io(_) => ErrorKind::Retryable,
            _ => ErrorKind::Fatal,
        }
    }
}

/// Local entry store and extension hook errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The synchronous write-through to the data store failed. The in-memory
    /// write stays committed.
    #[error("write-through failed: {0}")]
    WriteThrough(String),

    /// Loading the cache at group creation failed.
    #[error("cache loader failed: {0}")]
    Loader(String),

    /// A single entry is larger than the byte limit of the cache or of
    /// one network frame.
    #[error("entry of {size} bytes exceeds the limit of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    /// Cache with this name is not configured on this node.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// Cache with this name already exists on this node.
    #[error("cache already exists: {0}")]
    CacheExists(String),
}

/// Cluster membership errors.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// Node is joining or syncing and does not serve requests yet.
    #[error("node is not operational ({0})")]
    NotOperational(String),

    /// Join failed.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// Node not found in cluster.
    #[error("node not a member: {0}")]
    NotMember(ClusterNodeAddress),

    /// Group not registered in the replicated state.
    #[error("group not found: {0}")]
    GroupNotFound(GroupKey),
}

impl MembershipError {
    fn kind(&self) -> ErrorKind {
        match self {
            MembershipError::NotOperational(_) | MembershipError::GroupNotFound(_) => {
                ErrorKind::Retryable
            }
            _ => ErrorKind::Fatal,
        }
    }
}

/// Configuration errors, fatal for the cache being created.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// No factory registered for an extension name.
    #[error("unknown {kind} extension: {name}")]
    UnknownExtension { kind: &'static str, name: String },

    /// An extension property is missing or malformed.
    #[error("extension {name}: {reason}")]
    Property { name: String, reason: String },
}

/// Scatter-gather execution errors.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Some buckets were not covered before the deadline.
    #[error("partial result: {missing} of {total} buckets did not respond")]
    PartialResult { missing: usize, total: usize },

    /// The executable, filter or aggregator failed.
    #[error("executable failed: {0}")]
    Failed(String),
}

/// A failure that travels back over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFailure {
    /// Whether the caller may retry.
    pub retryable: bool,
    /// Rendered error message.
    pub message: String,
}

impl From<&Error> for RemoteFailure {
    fn from(e: &Error) -> Self {
        Self {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

impl From<RemoteFailure> for Error {
    fn from(f: RemoteFailure) -> Self {
        Error::Remote {
            retryable: f.retryable,
            message: f.message,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupType;

    #[test]
    fn test_retryable_classification() {
        let group = GroupKey::new(GroupType::Cache, "orders");
        assert!(Error::OwnershipChanged { group: group.clone(), bucket: 3 }.is_retryable());
        assert!(Error::BucketUnowned { group, bucket: 3 }.is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::from(MembershipError::NotOperational("syncing".into())).is_retryable());
        assert!(Error::from(NetworkError::ConnectionClosed).is_retryable());

        assert!(!Error::from(NetworkError::ProtocolMismatch("v2".into())).is_retryable());
        assert!(!Error::from(StoreError::WriteThrough("db down".into())).is_retryable());
        assert_eq!(Error::Shutdown.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_remote_failure_preserves_kind() {
        let err = Error::Timeout;
        let remote = RemoteFailure::from(&err);
        assert!(remote.retryable);

        let back: Error = remote.into();
        assert!(back.is_retryable());
        assert!(back.to_string().contains("timed out"));
    }
}
