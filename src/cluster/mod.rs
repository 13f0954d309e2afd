//! Cluster membership and the replicated state.

pub mod events;
pub mod membership;
pub mod state;

pub use events::{ClusterEvent, ClusterEventListener, LoggingEventListener, NoopEventListener};
pub use membership::{ClusterCommand, ClusterHandle, ClusterProcessor};
pub use state::{ClusterChange, MemberInfo, ReplicatedState, SequencedUpdate, StateEvent};
