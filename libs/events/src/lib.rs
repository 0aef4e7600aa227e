//! # mlsched-events
//!
//! Value types that cross component boundaries in the mlsched scheduler.
//!
//! ## Design Principles
//!
//! - Types here are transport-agnostic; callers choose the wire format
//! - Every desired-state event carries the generation it was produced at
//! - Agent reports carry their own generation so stale reports can be dropped
//! - Outbound decisions are plain data; dispatching them is someone else's job
//!
//! ## Flow
//!
//! - Inbound from the desired-state layer: [`DesiredStateEvent`]
//! - Inbound from agents: [`ReplicaStatusReport`]
//! - Outbound to the dispatcher: [`DispatchCommand`], [`EvictionDecision`]

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::{ErrorKind, EventError};
pub use types::*;
