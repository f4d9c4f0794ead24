//! Cadre – a supervised agent runtime
//!
//! This crate runs many independent, stateful agents as isolated workers:
//! - Each worker owns one agent and drains a bounded, FIFO signal queue
//! - Pluggable actions and strategies describe side effects as directives
//! - A directive interpreter carries those effects out (emit, spawn, schedule, ...)
//! - A keyed-singleton instance manager hibernates idle agents and thaws them on demand

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Agent runtime modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{InstanceManager, ManagerConfig, Signal, Worker, WorkerHandle};

/// Current version of the cadre runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
