//! Built-in state-management actions
//!
//! Registered by [`CatalogBuilder::with_builtins`](super::catalog::CatalogBuilder::with_builtins).
//! Each action translates its parameters into the internal effect
//! vocabulary, so agents get basic state editing without custom code.

use serde_json::{Map, Value};
use std::sync::Arc;

use super::action::{Action, ActionContext, ActionOutput, Effect, StateOp};
use super::agent::parse_path;
use super::directive::Directive;
use super::error::{RuntimeError, RuntimeResult};
use super::signal::{Dispatch, Signal};

/// Merge `params` into state
pub const SET_STATE: &str = "state.set";
/// Replace state with `params.state`
pub const REPLACE_STATE: &str = "state.replace";
/// Remove `params.keys`
pub const DELETE_KEYS: &str = "state.delete";
/// Set `params.path` to `params.value`
pub const SET_PATH: &str = "state.set_path";
/// Remove `params.path`
pub const DELETE_PATH: &str = "state.delete_path";
/// Emit a signal built from `params.type` and `params.data`
pub const EMIT_SIGNAL: &str = "signal.emit";
/// Do nothing
pub const NOOP: &str = "noop";

/// All built-in actions
pub fn all() -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(SetState),
        Arc::new(ReplaceState),
        Arc::new(DeleteKeys),
        Arc::new(SetPath),
        Arc::new(DeletePath),
        Arc::new(EmitSignal),
        Arc::new(Noop),
    ]
}

fn required<'a>(action: &str, params: &'a Map<String, Value>, key: &str) -> RuntimeResult<&'a Value> {
    params
        .get(key)
        .ok_or_else(|| RuntimeError::execution(action, format!("missing parameter '{key}'")))
}

fn path_param(action: &str, params: &Map<String, Value>) -> RuntimeResult<Vec<String>> {
    let path = match required(action, params, "path")? {
        Value::String(dotted) => parse_path(dotted),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RuntimeError::execution(action, "path segments must be strings"))?,
        _ => return Err(RuntimeError::execution(action, "path must be a string or array")),
    };
    if path.is_empty() {
        return Err(RuntimeError::execution(action, "path is empty"));
    }
    Ok(path)
}

/// Deep-merge the parameters into agent state
pub struct SetState;

impl Action for SetState {
    fn name(&self) -> &str {
        SET_STATE
    }

    fn run(&self, params: &Map<String, Value>, _ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        Ok(ActionOutput::merge(params.clone()))
    }
}

/// Replace agent state wholesale
pub struct ReplaceState;

impl Action for ReplaceState {
    fn name(&self) -> &str {
        REPLACE_STATE
    }

    fn run(&self, params: &Map<String, Value>, _ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        let state = required(REPLACE_STATE, params, "state")?
            .as_object()
            .cloned()
            .ok_or_else(|| RuntimeError::execution(REPLACE_STATE, "state must be an object"))?;
        Ok(ActionOutput::default().with_effect(StateOp::Replace(state)))
    }
}

/// Remove top-level keys
pub struct DeleteKeys;

impl Action for DeleteKeys {
    fn name(&self) -> &str {
        DELETE_KEYS
    }

    fn run(&self, params: &Map<String, Value>, _ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        let keys = required(DELETE_KEYS, params, "keys")?
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| RuntimeError::execution(DELETE_KEYS, "keys must be an array of strings"))?;
        Ok(ActionOutput::default().with_effect(StateOp::DeleteKeys(keys)))
    }
}

/// Set a nested value
pub struct SetPath;

impl Action for SetPath {
    fn name(&self) -> &str {
        SET_PATH
    }

    fn run(&self, params: &Map<String, Value>, _ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        let path = path_param(SET_PATH, params)?;
        let value = required(SET_PATH, params, "value")?.clone();
        Ok(ActionOutput::default().with_effect(StateOp::SetPath(path, value)))
    }
}

/// Remove a nested value
pub struct DeletePath;

impl Action for DeletePath {
    fn name(&self) -> &str {
        DELETE_PATH
    }

    fn run(&self, params: &Map<String, Value>, _ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        let path = path_param(DELETE_PATH, params)?;
        Ok(ActionOutput::default().with_effect(StateOp::DeletePath(path)))
    }
}

/// Emit a signal through the worker's output route
pub struct EmitSignal;

impl Action for EmitSignal {
    fn name(&self) -> &str {
        EMIT_SIGNAL
    }

    fn run(&self, params: &Map<String, Value>, ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        let signal_type = required(EMIT_SIGNAL, params, "type")?
            .as_str()
            .ok_or_else(|| RuntimeError::execution(EMIT_SIGNAL, "type must be a string"))?;
        let data = params.get("data").cloned().unwrap_or(Value::Null);
        let dispatch = match params.get("dispatch") {
            Some(raw) => Some(
                serde_json::from_value::<Dispatch>(raw.clone())
                    .map_err(|err| RuntimeError::execution(EMIT_SIGNAL, err.to_string()))?,
            ),
            None => None,
        };
        let signal = Signal::new(signal_type, data).with_source(format!("/agent/{}", ctx.agent_id));
        Ok(ActionOutput::default().with_effect(Effect::Directive(Directive::Emit { signal, dispatch })))
    }
}

/// Succeed without changing anything
pub struct Noop;

impl Action for Noop {
    fn name(&self) -> &str {
        NOOP
    }

    fn run(&self, _params: &Map<String, Value>, _ctx: ActionContext<'_>) -> RuntimeResult<ActionOutput> {
        Ok(ActionOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(action: &dyn Action, params: Value) -> RuntimeResult<ActionOutput> {
        let state = Map::new();
        let empty = Map::new();
        let ctx = ActionContext {
            agent_id: "a1",
            state: &state,
            context: &empty,
            opts: &empty,
        };
        action.run(params.as_object().unwrap(), ctx)
    }

    #[test]
    fn test_set_path_accepts_dotted_and_array() {
        let dotted = run(&SetPath, json!({"path": "a.b", "value": 1})).unwrap();
        let array = run(&SetPath, json!({"path": ["a", "b"], "value": 1})).unwrap();
        for output in [dotted, array] {
            match &output.effects[..] {
                [Effect::State(StateOp::SetPath(path, value))] => {
                    assert_eq!(path, &vec!["a".to_string(), "b".to_string()]);
                    assert_eq!(value, &json!(1));
                }
                other => panic!("unexpected effects {other:?}"),
            }
        }
    }

    #[test]
    fn test_missing_parameters_fail() {
        assert!(run(&ReplaceState, json!({})).is_err());
        assert!(run(&DeleteKeys, json!({"keys": [1]})).is_err());
        assert!(run(&SetPath, json!({"path": ""})).is_err());
        assert!(run(&EmitSignal, json!({"data": 1})).is_err());
    }

    #[test]
    fn test_emit_builds_directive() {
        let output = run(&EmitSignal, json!({"type": "user.created", "data": {"id": 7}})).unwrap();
        match &output.effects[..] {
            [Effect::Directive(Directive::Emit { signal, dispatch })] => {
                assert_eq!(signal.signal_type, "user.created");
                assert_eq!(signal.source, "/agent/a1");
                assert!(dispatch.is_none());
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }
}
