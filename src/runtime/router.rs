//! Signal routing contract
//!
//! A [`SignalRouter`] turns an inbound signal into the instructions a
//! strategy runs. [`TypeRouter`] is a small table keyed on signal type,
//! supporting exact entries and trailing `.*` wildcards.

use serde_json::{Map, Value};

use super::agent::AgentState;
use super::directive::Instruction;
use super::error::{RuntimeError, RuntimeResult};
use super::signal::Signal;

/// Maps a signal to instructions
pub trait SignalRouter: Send + Sync {
    /// Route `signal` for `agent`; an empty match is a routing error
    fn route(&self, agent: &AgentState, signal: &Signal) -> RuntimeResult<Vec<Instruction>>;
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) if prefix.is_empty() || prefix.ends_with('.') => {
                Pattern::Prefix(prefix.to_string())
            }
            _ => Pattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, signal_type: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == signal_type,
            Pattern::Prefix(prefix) => signal_type.starts_with(prefix.as_str()),
        }
    }
}

/// Signal-type routing table
#[derive(Debug, Clone, Default)]
pub struct TypeRouter {
    routes: Vec<(Pattern, String)>,
}

impl TypeRouter {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Route signals matching `pattern` to `action`
    ///
    /// Every matching entry yields an instruction, in registration order.
    pub fn with_route(mut self, pattern: &str, action: impl Into<String>) -> Self {
        self.routes.push((Pattern::parse(pattern), action.into()));
        self
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Parameters for an instruction built from a signal payload
pub fn params_from_signal(signal: &Signal) -> Map<String, Value> {
    match &signal.data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    }
}

/// Instruction context recording where an instruction came from
pub fn context_from_signal(signal: &Signal) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("signal_id".into(), Value::String(signal.id.to_string()));
    context.insert("signal_type".into(), Value::String(signal.signal_type.clone()));
    context.insert("source".into(), Value::String(signal.source.clone()));
    context.insert(
        "correlation_id".into(),
        Value::String(signal.correlation().to_string()),
    );
    context
}

impl SignalRouter for TypeRouter {
    fn route(&self, _agent: &AgentState, signal: &Signal) -> RuntimeResult<Vec<Instruction>> {
        let instructions: Vec<Instruction> = self
            .routes
            .iter()
            .filter(|(pattern, _)| pattern.matches(&signal.signal_type))
            .map(|(_, action)| Instruction {
                action: action.clone(),
                params: params_from_signal(signal),
                context: context_from_signal(signal),
                opts: Map::new(),
            })
            .collect();

        if instructions.is_empty() {
            Err(RuntimeError::Routing(signal.signal_type.clone()))
        } else {
            Ok(instructions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_and_wildcard_routes() {
        let router = TypeRouter::new()
            .with_route("counter.inc", "increment")
            .with_route("counter.*", "audit");
        let agent = AgentState::new("a1");

        let signal = Signal::new("counter.inc", json!({"by": 2}));
        let instructions = router.route(&agent, &signal).unwrap();
        let actions: Vec<_> = instructions.iter().map(|i| i.action.as_str()).collect();
        assert_eq!(actions, vec!["increment", "audit"]);
        assert_eq!(instructions[0].params["by"], json!(2));
        assert_eq!(instructions[0].context["signal_id"], json!(signal.id.as_str()));

        let reset = Signal::new("counter.reset", Value::Null);
        assert_eq!(router.route(&agent, &reset).unwrap().len(), 1);
    }

    #[test]
    fn test_no_route_is_routing_error() {
        let router = TypeRouter::new().with_route("a.b", "x");
        let err = router
            .route(&AgentState::new("a1"), &Signal::new("c.d", Value::Null))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Routing(ty) if ty == "c.d"));
    }

    #[test]
    fn test_scalar_payload_wrapped() {
        let params = params_from_signal(&Signal::new("a.b", json!(5)));
        assert_eq!(params["data"], json!(5));
    }
}
