//! Action trait and the effect vocabulary actions may return
//!
//! Actions are pure with respect to the runtime: they read a view of the
//! agent and return a result map plus a list of [`Effect`]s. State effects
//! are applied by the strategy; directive effects pass through to the
//! interpreter untouched.

use serde_json::{Map, Value};

use super::directive::Directive;
use super::error::RuntimeResult;

/// Internal state mutations a strategy applies directly
#[derive(Debug, Clone, PartialEq)]
pub enum StateOp {
    /// Replace the whole state map
    Replace(Map<String, Value>),
    /// Remove top-level keys
    DeleteKeys(Vec<String>),
    /// Set a nested path
    SetPath(Vec<String>, Value),
    /// Remove a nested path
    DeletePath(Vec<String>),
}

/// Something an action wants to happen
#[derive(Debug, Clone)]
pub enum Effect {
    /// Mutate agent state (handled by the strategy)
    State(StateOp),
    /// External side effect (handled by the interpreter)
    Directive(Directive),
}

impl From<StateOp> for Effect {
    fn from(op: StateOp) -> Self {
        Effect::State(op)
    }
}

impl From<Directive> for Effect {
    fn from(directive: Directive) -> Self {
        Effect::Directive(directive)
    }
}

/// Value returned by a successful action
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    /// Result; an object result is deep-merged into agent state
    pub result: Value,
    /// Effects, in the order they should apply
    pub effects: Vec<Effect>,
}

impl ActionOutput {
    /// Output with a result and no effects
    pub fn new(result: Value) -> Self {
        Self {
            result,
            effects: Vec::new(),
        }
    }

    /// Output that only merges the given map
    pub fn merge(delta: Map<String, Value>) -> Self {
        Self::new(Value::Object(delta))
    }

    /// Append an effect
    pub fn with_effect(mut self, effect: impl Into<Effect>) -> Self {
        self.effects.push(effect.into());
        self
    }
}

/// Read-only view handed to an action
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    /// Agent id
    pub agent_id: &'a str,
    /// Agent state at the time the instruction runs
    pub state: &'a Map<String, Value>,
    /// Instruction context
    pub context: &'a Map<String, Value>,
    /// Instruction options
    pub opts: &'a Map<String, Value>,
}

/// Pluggable business logic
pub trait Action: Send + Sync {
    /// Catalog identifier
    fn name(&self) -> &str;

    /// Check parameters before running
    fn validate(&self, _params: &Map<String, Value>) -> RuntimeResult<()> {
        Ok(())
    }

    /// Run the action
    fn run(&self, params: &Map<String, Value>, ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput>;
}

/// Adapter turning a closure into an [`Action`]
pub struct FnAction<F> {
    name: String,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Map<String, Value>, ActionContext<'_>) -> RuntimeResult<ActionOutput> + Send + Sync,
{
    /// Wrap a closure under the given name
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Action for FnAction<F>
where
    F: Fn(&Map<String, Value>, ActionContext<'_>) -> RuntimeResult<ActionOutput> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, params: &Map<String, Value>, ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        (self.func)(params, ctx)
    }
}
