//! Moving bucket contents between nodes when ownership changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Handoff of bucket B: X ──► Y                  │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Phase 1: Plan (every node, same applied update)     │  │
//! │  │  - rebalance sets pending(B) = Y                     │  │
//! │  │  - X keeps serving reads, refuses writes to B        │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Phase 2: Stream (X's store processor)               │  │
//! │  │  - snapshot B into batches                           │  │
//! │  │  - absolute expiration times, expired entries skipped│  │
//! │  │  - one batch in flight, resent after failure         │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Phase 3: Commit (sequencer)                         │  │
//! │  │  - TransferCommitted flips owner(B) to Y             │  │
//! │  │  - X drops B once it applies the commit              │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod handoff;
mod transfer;

pub use handoff::{AckOutcome, DueAction, Handoff, HandoffState, HandoffTracker};
pub use transfer::{entry_wire_size, into_batches, TransferBatch, TransferEntry, ENTRY_OVERHEAD};
