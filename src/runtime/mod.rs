//! Agent runtime: workers, directives, and the instance manager
//!
//! Signals flow from callers through the [`InstanceManager`] to a
//! [`Worker`], whose drain loop routes each signal to instructions, runs
//! them through the agent's [`Strategy`], and hands the resulting
//! [`Directive`]s to the interpreter. Business logic only ever describes
//! effects; the worker carries them out.

// Data
pub mod agent;
pub mod directive;
pub mod error;
pub mod signal;

// Business logic seams
pub mod action;
pub mod builtin;
pub mod catalog;
pub mod module;
pub mod router;
pub mod strategy;

// Execution
pub mod children;
pub mod dispatch;
pub mod interpreter;
pub mod queue;
pub mod status;
pub mod worker;

// Hosting
pub mod manager;
pub mod storage;

pub use action::{Action, ActionContext, ActionOutput, Effect, FnAction, StateOp};
pub use agent::AgentState;
pub use catalog::{Catalog, CatalogBuilder};
pub use children::{ExitReason, RestartPolicy};
pub use directive::{ChildSpec, Directive, Instruction};
pub use dispatch::{DispatchRouter, Dispatcher, HandleDispatcher, SignalBus};
pub use error::{
    DirectiveError, DispatchError, ErrorKind, ErrorReport, RuntimeError, RuntimeResult,
    StorageError,
};
pub use manager::{Attachment, InstanceManager, ManagerBuilder, ManagerConfig, ManagerStats};
pub use module::{AgentDefinition, AgentModule};
pub use router::{SignalRouter, TypeRouter};
pub use signal::{Dispatch, DispatchAdapter, DispatchConfig, Signal, SignalClass, SignalId};
pub use status::WorkerStatus;
pub use storage::{FileStorage, MemoryStorage, Persistence, Storage, StorageConfig};
pub use strategy::{Direct, Fsm, FsmStatus, Strategy, StrategyContext};
pub use worker::{
    RunningWorker, Worker, WorkerConfig, WorkerEvent, WorkerHandle, WorkerOptions, WorkerSnapshot,
};
