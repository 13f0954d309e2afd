//! Network communication layer.
//!
//! # Architecture
//!
//! ```text
//!  outbound                                   inbound
//!  ────────                                   ───────
//!  Router::route ──► Transport ──TCP──►  NetworkServer ──┐
//!        │           (writer per peer)                    │
//!        └──────► Multicast ──UDP──►  Multicast::run ─────┤
//!                                                          ▼
//!                                       Router::deliver ──► cluster processor
//!                                                       ├─► store processor
//!                                                       └─► pending replies
//! ```

pub mod frame;
pub mod message;
pub mod multicast;
pub mod router;
pub mod server;
pub mod transport;

pub use message::{CacheRequest, CacheResponse, Envelope, Message, ProcessorKey};
pub use multicast::Multicast;
pub use router::Router;
pub use server::{EnvelopeHandler, NetworkServer};
pub use transport::{Transport, Undeliverable};
