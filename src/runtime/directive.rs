//! Instructions and directives
//!
//! An [`Instruction`] asks a strategy to run one action. A [`Directive`]
//! describes a side effect the worker must carry out after the strategy
//! returns. Business logic only ever builds these values; the interpreter
//! is the sole place they turn into effects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::catalog::Catalog;
use super::children::RestartPolicy;
use super::error::{DirectiveError, DirectiveResult, RuntimeError};
use super::signal::{Dispatch, Signal, SYSTEM_TICK};

/// A single action invocation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Action identifier, resolved against the catalog
    pub action: String,
    /// Action parameters
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Caller context (signal id, correlation, ...)
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Execution options, passed through to the action
    #[serde(default)]
    pub opts: Map<String, Value>,
}

impl Instruction {
    /// Instruction with empty params, context, and opts
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Map::new(),
            context: Map::new(),
            opts: Map::new(),
        }
    }

    /// Replace the parameters
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// How to build and supervise a child worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Agent module name, resolved against the catalog
    pub module: String,
    /// Child agent id (derived from the parent and tag when absent)
    #[serde(default)]
    pub id: Option<String>,
    /// Options passed to the module constructor
    #[serde(default)]
    pub opts: Value,
    /// What to do when the child exits
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl ChildSpec {
    /// Child of the named module with default options
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            id: None,
            opts: Value::Null,
            restart: RestartPolicy::default(),
        }
    }

    /// Set the child agent id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the restart policy
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

/// Description of a side effect
#[derive(Debug, Clone)]
pub enum Directive {
    /// Send a signal out through the dispatch boundary
    Emit {
        /// Signal to send
        signal: Signal,
        /// Explicit route; the worker default applies when absent
        dispatch: Option<Dispatch>,
    },
    /// Start a supervised child
    Spawn {
        /// Child constructor and options
        spec: ChildSpec,
        /// Tag to address the child by
        tag: Option<String>,
    },
    /// Stop a live child (by tag or agent id)
    Kill {
        /// Child tag or agent id
        target: String,
    },
    /// Deliver a signal to this worker after a delay
    Schedule {
        /// Delay in milliseconds; must not be negative
        delay_ms: i64,
        /// Signal to deliver
        message: Signal,
    },
    /// Stop this worker
    Stop {
        /// Reason recorded on the exit
        reason: String,
    },
    /// Append an instruction to the agent's pending queue
    Enqueue {
        /// Action identifier
        action: Option<String>,
        /// Action parameters
        params: Map<String, Value>,
        /// Caller context
        context: Map<String, Value>,
        /// Execution options
        opts: Map<String, Value>,
    },
    /// Add an action to the agent's action set
    RegisterAction {
        /// Action identifier
        module: String,
    },
    /// Remove an action from the agent's action set
    DeregisterAction {
        /// Action identifier
        module: String,
    },
    /// Report a failure
    Error {
        /// The failure
        error: RuntimeError,
        /// Extra detail for the error signal
        context: Option<Value>,
    },
}

impl Directive {
    /// Emit through the default route
    pub fn emit(signal: Signal) -> Self {
        Directive::Emit {
            signal,
            dispatch: None,
        }
    }

    /// Enqueue an instruction for the named action
    pub fn enqueue(action: impl Into<String>, params: Map<String, Value>) -> Self {
        Directive::Enqueue {
            action: Some(action.into()),
            params,
            context: Map::new(),
            opts: Map::new(),
        }
    }

    /// Schedule a strategy tick after `delay_ms`
    pub fn schedule_tick(delay_ms: i64) -> Self {
        Directive::Schedule {
            delay_ms,
            message: Signal::new(SYSTEM_TICK, Value::Null),
        }
    }

    /// Short name of the directive variant
    pub fn name(&self) -> &'static str {
        match self {
            Directive::Emit { .. } => "emit",
            Directive::Spawn { .. } => "spawn",
            Directive::Kill { .. } => "kill",
            Directive::Schedule { .. } => "schedule",
            Directive::Stop { .. } => "stop",
            Directive::Enqueue { .. } => "enqueue",
            Directive::RegisterAction { .. } => "register_action",
            Directive::DeregisterAction { .. } => "deregister_action",
            Directive::Error { .. } => "error",
        }
    }

    /// Validation that needs no live worker state.
    ///
    /// Child liveness for `Kill` is checked by the interpreter against the
    /// worker's supervisor.
    pub fn validate(&self, catalog: &Catalog) -> DirectiveResult<()> {
        match self {
            Directive::Emit { signal, .. } => signal.validate(),
            Directive::Spawn { spec, tag } => {
                if !catalog.has_module(&spec.module) {
                    return Err(DirectiveError::InvalidModule(spec.module.clone()));
                }
                if let Some(tag) = tag {
                    if tag.trim().is_empty() {
                        return Err(DirectiveError::InvalidTarget(tag.clone()));
                    }
                }
                Ok(())
            }
            Directive::Kill { target } => {
                if target.trim().is_empty() {
                    Err(DirectiveError::InvalidTarget(target.clone()))
                } else {
                    Ok(())
                }
            }
            Directive::Schedule { delay_ms, message } => {
                if *delay_ms < 0 {
                    return Err(DirectiveError::InvalidDelay(*delay_ms));
                }
                message.validate()
            }
            Directive::Stop { .. } | Directive::Error { .. } => Ok(()),
            Directive::Enqueue { action, .. } => match action {
                Some(action) if !action.trim().is_empty() => Ok(()),
                _ => Err(DirectiveError::InvalidAction),
            },
            Directive::RegisterAction { module } | Directive::DeregisterAction { module } => {
                if catalog.has_action(module) {
                    Ok(())
                } else {
                    Err(DirectiveError::InvalidActionModule(module.clone()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::catalog::CatalogBuilder;

    #[test]
    fn test_validation_table() {
        let catalog = CatalogBuilder::with_builtins().build();

        let enqueue = Directive::Enqueue {
            action: None,
            params: Map::new(),
            context: Map::new(),
            opts: Map::new(),
        };
        assert_eq!(enqueue.validate(&catalog), Err(DirectiveError::InvalidAction));

        let register = Directive::RegisterAction {
            module: "NotAModule".into(),
        };
        assert_eq!(
            register.validate(&catalog),
            Err(DirectiveError::InvalidActionModule("NotAModule".into()))
        );
        let register = Directive::RegisterAction {
            module: "state.set".into(),
        };
        assert!(register.validate(&catalog).is_ok());

        let schedule = Directive::Schedule {
            delay_ms: -1,
            message: Signal::new("a.b", Value::Null),
        };
        assert_eq!(schedule.validate(&catalog), Err(DirectiveError::InvalidDelay(-1)));

        let spawn = Directive::Spawn {
            spec: ChildSpec::new("nope"),
            tag: None,
        };
        assert_eq!(
            spawn.validate(&catalog),
            Err(DirectiveError::InvalidModule("nope".into()))
        );

        let kill = Directive::Kill { target: " ".into() };
        assert!(matches!(kill.validate(&catalog), Err(DirectiveError::InvalidTarget(_))));
    }

    #[test]
    fn test_schedule_tick_is_system_signal() {
        match Directive::schedule_tick(0) {
            Directive::Schedule { delay_ms, message } => {
                assert_eq!(delay_ms, 0);
                assert_eq!(message.signal_type, SYSTEM_TICK);
            }
            other => panic!("unexpected directive {}", other.name()),
        }
    }
}
