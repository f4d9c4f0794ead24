//! Agent modules: constructors for agent workers
//!
//! An [`AgentModule`] describes how to build one kind of agent: its initial
//! state and actions, how its signals route, and which strategy runs its
//! instructions. [`AgentDefinition`] covers the declarative case.

use serde_json::{Map, Value};
use std::sync::Arc;

use super::agent::AgentState;
use super::error::{RuntimeError, RuntimeResult};
use super::router::{SignalRouter, TypeRouter};
use super::strategy::{Direct, Strategy};

/// Constructor for one kind of agent
pub trait AgentModule: Send + Sync {
    /// Catalog identifier
    fn name(&self) -> &str;

    /// Fresh agent state for `id`
    fn new_agent(&self, id: &str, opts: &Value) -> RuntimeResult<AgentState>;

    /// Signal routing for this agent kind
    fn router(&self) -> Arc<dyn SignalRouter>;

    /// Execution strategy (defaults to [`Direct`])
    fn strategy(&self) -> Arc<dyn Strategy> {
        Arc::new(Direct)
    }

    /// Checked before a worker leaves `initializing`, for fresh and thawed agents alike
    fn validate(&self, _agent: &AgentState) -> RuntimeResult<()> {
        Ok(())
    }
}

/// Declarative agent module
#[derive(Clone)]
pub struct AgentDefinition {
    name: String,
    actions: Vec<String>,
    initial_state: Map<String, Value>,
    router: TypeRouter,
    strategy: Arc<dyn Strategy>,
    required_keys: Vec<String>,
}

impl AgentDefinition {
    /// Definition with no actions, routes, or state, using [`Direct`]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            initial_state: Map::new(),
            router: TypeRouter::new(),
            strategy: Arc::new(Direct),
            required_keys: Vec::new(),
        }
    }

    /// Register an action on every new agent
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    /// Route `pattern` to `action`, registering the action as well
    pub fn route(mut self, pattern: &str, action: impl Into<String>) -> Self {
        let action = action.into();
        if !self.actions.contains(&action) {
            self.actions.push(action.clone());
        }
        self.router = self.router.with_route(pattern, action);
        self
    }

    /// Seed a state key
    pub fn state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.initial_state.insert(key.into(), value.into());
        self
    }

    /// Reject agents whose state lacks `key`
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    /// Use a different strategy
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }
}

impl AgentModule for AgentDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_agent(&self, id: &str, opts: &Value) -> RuntimeResult<AgentState> {
        let mut agent = AgentState::new(id)
            .with_state(self.initial_state.clone())
            .with_actions(self.actions.iter().cloned());
        match opts {
            Value::Null => {}
            Value::Object(overrides) => agent.merge(overrides),
            other => {
                return Err(RuntimeError::Invalid(format!(
                    "agent options for '{}' must be an object, got {other}",
                    self.name
                )));
            }
        }
        agent.dirty = false;
        Ok(agent)
    }

    fn router(&self) -> Arc<dyn SignalRouter> {
        Arc::new(self.router.clone())
    }

    fn strategy(&self) -> Arc<dyn Strategy> {
        self.strategy.clone()
    }

    fn validate(&self, agent: &AgentState) -> RuntimeResult<()> {
        for key in &self.required_keys {
            if !agent.state.contains_key(key) {
                return Err(RuntimeError::Invalid(format!(
                    "agent '{}' is missing required key '{key}'",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_agent_applies_options() {
        let definition = AgentDefinition::new("counter")
            .route("counter.inc", "state.set")
            .state("count", 0);
        let agent = definition.new_agent("c1", &json!({"count": 5})).unwrap();

        assert_eq!(agent.id, "c1");
        assert_eq!(agent.state["count"], json!(5));
        assert!(agent.has_action("state.set"));
        assert!(!agent.dirty);
        assert!(definition.new_agent("c2", &json!(3)).is_err());
    }

    #[test]
    fn test_required_keys() {
        let definition = AgentDefinition::new("user").require("email");
        let agent = definition.new_agent("u1", &Value::Null).unwrap();
        assert!(definition.validate(&agent).is_err());
        let agent = definition.new_agent("u1", &json!({"email": "a@b"})).unwrap();
        assert!(definition.validate(&agent).is_ok());
    }
}
