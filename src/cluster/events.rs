//! Cluster topology events.

use crate::types::{BucketId, ClusterNodeAddress, GroupKey, GroupType};

/// Events delivered to subscribers when the replicated state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node joined the cluster.
    MemberJoined {
        /// The node's address.
        node: ClusterNodeAddress,
    },

    /// A node left the cluster, gracefully or because it stopped answering.
    MemberLeft {
        /// The node's address.
        node: ClusterNodeAddress,
    },

    /// Membership or bucket ownership of a group changed.
    GroupStateChanged {
        /// The group that changed.
        group: GroupKey,
    },

    /// A bucket's owner departed without a live backup; its entries are gone.
    BucketLost {
        /// The group the bucket belongs to.
        group: GroupKey,
        /// The lost bucket.
        bucket: BucketId,
    },
}

impl ClusterEvent {
    /// Group the event is about, if any.
    pub fn group(&self) -> Option<&GroupKey> {
        match self {
            ClusterEvent::GroupStateChanged { group } | ClusterEvent::BucketLost { group, .. } => {
                Some(group)
            }
            _ => None,
        }
    }

    /// Whether a subscriber registered for `group_type` should see the event.
    /// Membership events go to everyone.
    pub fn concerns(&self, group_type: Option<GroupType>) -> bool {
        match (self.group(), group_type) {
            (Some(group), Some(wanted)) => group.group_type == wanted,
            _ => true,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(self, ClusterEvent::MemberJoined { .. })
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(self, ClusterEvent::MemberLeft { .. })
    }
}

/// Listener for cluster events.
///
/// Called on the cluster processor; implementations must not block.
pub trait ClusterEventListener: Send + Sync + 'static {
    /// Called when a cluster event occurs.
    fn on_event(&self, event: &ClusterEvent);
}

/// No-op event listener.
pub struct NoopEventListener;

impl ClusterEventListener for NoopEventListener {
    fn on_event(&self, _event: &ClusterEvent) {}
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl ClusterEventListener for LoggingEventListener {
    fn on_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::MemberJoined { node } => {
                tracing::info!(%node, "Node joined cluster");
            }
            ClusterEvent::MemberLeft { node } => {
                tracing::info!(%node, "Node left cluster");
            }
            ClusterEvent::GroupStateChanged { group } => {
                tracing::debug!(%group, "Group state changed");
            }
            ClusterEvent::BucketLost { group, bucket } => {
                tracing::error!(%group, bucket, "Bucket lost with no live backup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ClusterNodeAddress {
        ClusterNodeAddress::from("127.0.0.1:9000".parse::<std::net::SocketAddr>().unwrap())
    }

    #[test]
    fn test_event_types() {
        let join = ClusterEvent::MemberJoined { node: node() };
        assert!(join.is_join());
        assert!(!join.is_leave());
        assert!(join.group().is_none());

        let left = ClusterEvent::MemberLeft { node: node() };
        assert!(!left.is_join());
        assert!(left.is_leave());
    }

    #[test]
    fn test_event_routing_by_group_type() {
        let lost = ClusterEvent::BucketLost {
            group: GroupKey::cache("orders"),
            bucket: 3,
        };
        assert_eq!(lost.group(), Some(&GroupKey::cache("orders")));
        assert!(lost.concerns(Some(GroupType::Cache)));
        assert!(lost.concerns(None));
        assert!(ClusterEvent::MemberJoined { node: node() }.concerns(Some(GroupType::Cache)));
    }
}
