//! Model/server store.
//!
//! The store owns every model version and server. All mutation goes through
//! it; readers get cloned snapshots. Cross references (a model's server, a
//! server's models) are names, never pointers.

mod error;
mod memory;
mod model;
mod server;

pub use error::{StoreError, StoreResult};
pub use memory::{ModelChange, ModelServerStore, RescheduleOutcome, StoreConfig};
pub use model::{ModelState, ModelVersion, ReplicaBounds, ReplicaStatus, ReplicaTransition};
pub use server::ServerSnapshot;
