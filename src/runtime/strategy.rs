//! Execution strategies
//!
//! A [`Strategy`] turns instructions into agent state changes plus the
//! directives the worker must interpret. The worker never looks inside a
//! strategy; it only calls [`Strategy::init`] once, [`Strategy::cmd`] per
//! batch of instructions, and [`Strategy::tick`] when a scheduled tick
//! arrives.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::action::{ActionContext, Effect, StateOp};
use super::agent::AgentState;
use super::catalog::Catalog;
use super::directive::{Directive, Instruction};
use super::error::{RuntimeError, RuntimeResult};

/// Key under which strategies keep private sub-state
pub const STRATEGY_STATE_KEY: &str = "__strategy__";

/// What a strategy can see besides the agent
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    /// Action resolution
    pub catalog: &'a Catalog,
    /// Correlation id of the signal being processed
    pub correlation_id: Option<&'a str>,
    /// Immediate cause of this invocation
    pub causation_id: Option<&'a str>,
}

/// Pluggable execution policy
pub trait Strategy: Send + Sync {
    /// Strategy name
    fn name(&self) -> &str;

    /// Runs once after the worker is constructed, before the first `cmd`
    fn init(&self, _agent: &mut AgentState, _ctx: &StrategyContext<'_>) -> RuntimeResult<Vec<Directive>> {
        Ok(Vec::new())
    }

    /// Execute instructions, mutating the agent and returning directives
    fn cmd(
        &self,
        agent: &mut AgentState,
        instructions: Vec<Instruction>,
        ctx: &StrategyContext<'_>,
    ) -> RuntimeResult<Vec<Directive>>;

    /// Scheduled continuation
    fn tick(&self, _agent: &mut AgentState, _ctx: &StrategyContext<'_>) -> RuntimeResult<Vec<Directive>> {
        Ok(Vec::new())
    }
}

/// Run one instruction: resolve the action, merge its result, apply state ops
///
/// Directive effects are returned in order for the interpreter.
pub fn execute_instruction(
    agent: &mut AgentState,
    instruction: &Instruction,
    ctx: &StrategyContext<'_>,
) -> RuntimeResult<Vec<Directive>> {
    let name = instruction.action.as_str();
    let action = ctx
        .catalog
        .action(name)
        .ok_or_else(|| RuntimeError::execution(name, "action is not in the catalog"))?;
    if !agent.has_action(name) {
        return Err(RuntimeError::execution(name, "action is not registered on this agent"));
    }
    action.validate(&instruction.params)?;

    let output = {
        let action_ctx = ActionContext {
            agent_id: &agent.id,
            state: &agent.state,
            context: &instruction.context,
            opts: &instruction.opts,
        };
        action.run(&instruction.params, action_ctx)?
    };

    if let Value::Object(delta) = &output.result {
        agent.merge(delta);
    }
    agent.set_result(output.result);

    let mut directives = Vec::new();
    for effect in output.effects {
        match effect {
            Effect::State(op) => apply_state_op(agent, op),
            Effect::Directive(directive) => directives.push(directive),
        }
    }
    Ok(directives)
}

/// Apply one internal state mutation
pub fn apply_state_op(agent: &mut AgentState, op: StateOp) {
    match op {
        StateOp::Replace(state) => agent.replace_state(state),
        StateOp::DeleteKeys(keys) => agent.delete_keys(&keys),
        StateOp::SetPath(path, value) => agent.set_path(&path, value),
        StateOp::DeletePath(path) => agent.delete_path(&path),
    }
}

fn failure_context(instruction: &Instruction, index: usize) -> Value {
    json!({
        "action": instruction.action,
        "index": index,
        "context": Value::Object(instruction.context.clone()),
    })
}

/// Runs instructions immediately and in order
///
/// The first failing instruction stops the batch; effects of earlier
/// instructions are kept and the failure becomes an `Error` directive.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Strategy for Direct {
    fn name(&self) -> &str {
        "direct"
    }

    fn cmd(
        &self,
        agent: &mut AgentState,
        instructions: Vec<Instruction>,
        ctx: &StrategyContext<'_>,
    ) -> RuntimeResult<Vec<Directive>> {
        let mut directives = Vec::new();
        for (index, instruction) in instructions.iter().enumerate() {
            match execute_instruction(agent, instruction, ctx) {
                Ok(produced) => directives.extend(produced),
                Err(error) => {
                    directives.push(Directive::Error {
                        error,
                        context: Some(failure_context(instruction, index)),
                    });
                    break;
                }
            }
        }
        Ok(directives)
    }
}

// ========== FSM strategy ==========

/// Sub-state of the [`Fsm`] strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmStatus {
    /// Waiting for work
    Idle,
    /// Executing a batch
    Processing,
    /// Last batch succeeded
    Completed,
    /// Last batch failed
    Failed,
}

impl FsmStatus {
    fn can_transition(self, to: FsmStatus) -> bool {
        use FsmStatus::*;
        matches!(
            (self, to),
            (Idle, Processing)
                | (Completed, Processing)
                | (Failed, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FsmState {
    status: FsmStatus,
    #[serde(default)]
    processed: u64,
    #[serde(default)]
    last_error: Option<String>,
}

/// Direct execution wrapped in a private `idle/processing/completed/failed` machine
///
/// The machine lives in agent state under [`STRATEGY_STATE_KEY`]. With
/// `reset_after_ms` set, each finished batch schedules a tick that returns
/// the machine to `idle`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fsm {
    /// Delay before a finished batch resets to idle
    pub reset_after_ms: Option<i64>,
}

impl Fsm {
    /// Machine that stays in `completed`/`failed` until the next batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Machine that resets to `idle` after `ms`
    pub fn with_reset_after(ms: i64) -> Self {
        Self {
            reset_after_ms: Some(ms),
        }
    }

    /// Current sub-state of an agent run by this strategy
    pub fn status(agent: &AgentState) -> Option<FsmStatus> {
        Self::load(agent).ok().map(|state| state.status)
    }

    fn load(agent: &AgentState) -> RuntimeResult<FsmState> {
        let raw = agent
            .state
            .get(STRATEGY_STATE_KEY)
            .ok_or_else(|| RuntimeError::Planning("fsm state missing; init did not run".into()))?;
        serde_json::from_value(raw.clone())
            .map_err(|err| RuntimeError::Planning(format!("corrupt fsm state: {err}")))
    }

    fn store(agent: &mut AgentState, state: &FsmState) -> RuntimeResult<()> {
        let value = serde_json::to_value(state)
            .map_err(|err| RuntimeError::Internal(format!("encode fsm state: {err}")))?;
        agent.set_path(&[STRATEGY_STATE_KEY.to_string()], value);
        Ok(())
    }

    fn advance(state: &mut FsmState, to: FsmStatus) -> RuntimeResult<()> {
        if state.status.can_transition(to) {
            state.status = to;
            Ok(())
        } else {
            Err(RuntimeError::Planning(format!(
                "fsm cannot move from {:?} to {:?}",
                state.status, to
            )))
        }
    }
}

impl Strategy for Fsm {
    fn name(&self) -> &str {
        "fsm"
    }

    fn init(&self, agent: &mut AgentState, _ctx: &StrategyContext<'_>) -> RuntimeResult<Vec<Directive>> {
        // thawed agents keep their machine
        if Self::load(agent).is_err() {
            Self::store(
                agent,
                &FsmState {
                    status: FsmStatus::Idle,
                    processed: 0,
                    last_error: None,
                },
            )?;
        }
        Ok(Vec::new())
    }

    fn cmd(
        &self,
        agent: &mut AgentState,
        instructions: Vec<Instruction>,
        ctx: &StrategyContext<'_>,
    ) -> RuntimeResult<Vec<Directive>> {
        let mut machine = Self::load(agent)?;
        Self::advance(&mut machine, FsmStatus::Processing)?;
        Self::store(agent, &machine)?;

        let directives = Direct.cmd(agent, instructions, ctx)?;
        let failure = directives.iter().find_map(|directive| match directive {
            Directive::Error { error, .. } => Some(error.to_string()),
            _ => None,
        });

        // actions may have rewritten state; reload before finishing
        let mut machine = Self::load(agent).unwrap_or(machine);
        machine.processed += 1;
        match failure {
            Some(message) => {
                machine.status = FsmStatus::Processing;
                Self::advance(&mut machine, FsmStatus::Failed)?;
                machine.last_error = Some(message);
            }
            None => {
                machine.status = FsmStatus::Processing;
                Self::advance(&mut machine, FsmStatus::Completed)?;
                machine.last_error = None;
            }
        }
        Self::store(agent, &machine)?;

        let mut directives = directives;
        if let Some(ms) = self.reset_after_ms {
            directives.push(Directive::schedule_tick(ms));
        }
        Ok(directives)
    }

    fn tick(&self, agent: &mut AgentState, _ctx: &StrategyContext<'_>) -> RuntimeResult<Vec<Directive>> {
        let mut machine = Self::load(agent)?;
        if matches!(machine.status, FsmStatus::Completed | FsmStatus::Failed) {
            Self::advance(&mut machine, FsmStatus::Idle)?;
            Self::store(agent, &machine)?;
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::action::{ActionOutput, FnAction};
    use crate::runtime::builtin;
    use crate::runtime::catalog::CatalogBuilder;
    use serde_json::Map;
    use std::sync::Arc;

    fn catalog() -> Catalog {
        let builder = CatalogBuilder::with_builtins();
        builder.register_action(Arc::new(FnAction::new("fail", |_params, _ctx| {
            Err(RuntimeError::execution("fail", "always fails"))
        })));
        builder.register_action(Arc::new(FnAction::new("inc", |params, ctx| {
            let by = params.get("by").and_then(Value::as_i64).unwrap_or(1);
            let count = ctx.state.get("count").and_then(Value::as_i64).unwrap_or(0);
            Ok(ActionOutput::merge(params_of(json!({"count": count + by}))))
        })));
        builder.build()
    }

    fn params_of(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn ctx(catalog: &Catalog) -> StrategyContext<'_> {
        StrategyContext {
            catalog,
            correlation_id: None,
            causation_id: None,
        }
    }

    fn agent() -> AgentState {
        AgentState::new("a1").with_actions(["inc", "fail", builtin::SET_PATH, builtin::EMIT_SIGNAL])
    }

    #[test]
    fn test_direct_runs_in_order_and_merges() {
        let catalog = catalog();
        let mut agent = agent();
        let instructions = vec![
            Instruction::new("inc").with_params(params_of(json!({"by": 2}))),
            Instruction::new("inc").with_params(params_of(json!({"by": 3}))),
            Instruction::new(builtin::SET_PATH).with_params(params_of(json!({"path": "meta.seen", "value": true}))),
        ];
        let directives = Direct.cmd(&mut agent, instructions, &ctx(&catalog)).unwrap();

        assert!(directives.is_empty());
        assert_eq!(agent.state["count"], json!(5));
        assert_eq!(agent.state["meta"]["seen"], json!(true));
    }

    #[test]
    fn test_direct_stops_at_failure() {
        let catalog = catalog();
        let mut agent = agent();
        let instructions = vec![
            Instruction::new("inc"),
            Instruction::new("fail"),
            Instruction::new("inc"),
        ];
        let directives = Direct.cmd(&mut agent, instructions, &ctx(&catalog)).unwrap();

        assert_eq!(agent.state["count"], json!(1));
        assert_eq!(directives.len(), 1);
        assert!(matches!(&directives[0], Directive::Error { context: Some(c), .. } if c["index"] == json!(1)));
    }

    #[test]
    fn test_direct_passes_directives_through() {
        let catalog = catalog();
        let mut agent = agent();
        let instructions = vec![Instruction::new(builtin::EMIT_SIGNAL)
            .with_params(params_of(json!({"type": "user.created"})))];
        let directives = Direct.cmd(&mut agent, instructions, &ctx(&catalog)).unwrap();
        assert!(matches!(&directives[..], [Directive::Emit { .. }]));
    }

    #[test]
    fn test_unregistered_action_fails() {
        let catalog = catalog();
        let mut agent = AgentState::new("a1");
        let directives = Direct
            .cmd(&mut agent, vec![Instruction::new("inc")], &ctx(&catalog))
            .unwrap();
        assert!(matches!(&directives[..], [Directive::Error { .. }]));
    }

    #[test]
    fn test_fsm_tracks_sub_state() {
        let catalog = catalog();
        let fsm = Fsm::with_reset_after(10);
        let mut agent = agent();
        fsm.init(&mut agent, &ctx(&catalog)).unwrap();
        assert_eq!(Fsm::status(&agent), Some(FsmStatus::Idle));

        let directives = fsm
            .cmd(&mut agent, vec![Instruction::new("inc")], &ctx(&catalog))
            .unwrap();
        assert_eq!(Fsm::status(&agent), Some(FsmStatus::Completed));
        assert!(matches!(&directives[..], [Directive::Schedule { delay_ms: 10, .. }]));

        fsm.cmd(&mut agent, vec![Instruction::new("fail")], &ctx(&catalog))
            .unwrap();
        assert_eq!(Fsm::status(&agent), Some(FsmStatus::Failed));

        fsm.tick(&mut agent, &ctx(&catalog)).unwrap();
        assert_eq!(Fsm::status(&agent), Some(FsmStatus::Idle));
        assert_eq!(agent.state[STRATEGY_STATE_KEY]["processed"], json!(2));
    }

    #[test]
    fn test_fsm_requires_init() {
        let catalog = catalog();
        let mut agent = agent();
        let err = Fsm::new()
            .cmd(&mut agent, vec![Instruction::new("inc")], &ctx(&catalog))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Planning(_)));
    }
}
