//! mlsched scheduler library.
//!
//! This crate primarily ships a `scheduler` binary, but exposes the store,
//! filters and experiment store as a library for integration testing and
//! embedding.

pub mod config;
pub mod experiment;
pub mod filters;
pub mod reconciler;
pub mod store;
pub mod usage;
pub mod worker;
