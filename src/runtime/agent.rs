//! Agent state: the business entity a worker owns
//!
//! Only the owning worker mutates an [`AgentState`]; everything else sees
//! clones taken through snapshots. State maps are JSON objects and are
//! combined with a recursive deep merge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, VecDeque};

use super::directive::Instruction;

/// Business entity owned by a single worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Stable for the agent's lifetime
    pub id: String,
    /// Arbitrary key/value state
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Registered action identifiers
    #[serde(default)]
    pub actions: BTreeSet<String>,
    /// Instructions waiting for the next strategy invocation
    #[serde(default)]
    pub pending_instructions: VecDeque<Instruction>,
    /// Last produced value
    #[serde(default)]
    pub result: Value,
    /// Mutated since the last freeze
    #[serde(skip)]
    pub dirty: bool,
}

impl AgentState {
    /// Empty agent with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Map::new(),
            actions: BTreeSet::new(),
            pending_instructions: VecDeque::new(),
            result: Value::Null,
            dirty: false,
        }
    }

    /// Seed the state map
    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = state;
        self
    }

    /// Register actions
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.extend(actions.into_iter().map(Into::into));
        self
    }

    /// Whether the action is registered
    pub fn has_action(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    /// Register an action; returns false if it was already present
    pub fn register_action(&mut self, action: &str) -> bool {
        let added = self.actions.insert(action.to_string());
        self.dirty |= added;
        added
    }

    /// Deregister an action; returns false if it was absent
    pub fn deregister_action(&mut self, action: &str) -> bool {
        let removed = self.actions.remove(action);
        self.dirty |= removed;
        removed
    }

    /// Deep-merge a delta into the state map
    pub fn merge(&mut self, delta: &Map<String, Value>) {
        if delta.is_empty() {
            return;
        }
        deep_merge(&mut self.state, delta);
        self.dirty = true;
    }

    /// Replace the whole state map
    pub fn replace_state(&mut self, state: Map<String, Value>) {
        self.state = state;
        self.dirty = true;
    }

    /// Remove top-level keys
    pub fn delete_keys(&mut self, keys: &[String]) {
        for key in keys {
            self.dirty |= self.state.remove(key).is_some();
        }
    }

    /// Set a value at a nested path, creating intermediate objects
    pub fn set_path(&mut self, path: &[String], value: Value) {
        if set_path(&mut self.state, path, value) {
            self.dirty = true;
        }
    }

    /// Remove the value at a nested path
    pub fn delete_path(&mut self, path: &[String]) {
        self.dirty |= delete_path(&mut self.state, path);
    }

    /// Read the value at a nested path
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.state.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Record the last produced value
    pub fn set_result(&mut self, result: Value) {
        self.result = result;
        self.dirty = true;
    }

    /// Take every pending instruction, oldest first
    pub fn take_pending(&mut self) -> Vec<Instruction> {
        self.pending_instructions.drain(..).collect()
    }

    /// Whether identity, state, and actions match (freeze/thaw equivalence)
    pub fn equivalent(&self, other: &AgentState) -> bool {
        self.id == other.id && self.state == other.state && self.actions == other.actions
    }
}

/// Recursively merge `delta` into `target`; objects merge, anything else overwrites
pub fn deep_merge(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, value) in delta {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn set_path(map: &mut Map<String, Value>, path: &[String], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = map;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(inner) => inner,
            _ => unreachable!("path segment was just made an object"),
        };
    }
    current.insert(last.clone(), value);
    true
}

fn delete_path(map: &mut Map<String, Value>, path: &[String]) -> bool {
    match path {
        [] => false,
        [last] => map.remove(last).is_some(),
        [first, rest @ ..] => match map.get_mut(first) {
            Some(Value::Object(inner)) => delete_path(inner, rest),
            _ => false,
        },
    }
}

/// Split a dotted path (`a.b.c`) into segments
pub fn parse_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_deep_merge() {
        let mut agent = AgentState::new("a1").with_state(obj(json!({
            "count": 1,
            "profile": {"name": "x", "tags": [1]}
        })));
        agent.merge(&obj(json!({"profile": {"age": 3, "tags": [2]}, "count": 2})));

        assert_eq!(
            Value::Object(agent.state.clone()),
            json!({"count": 2, "profile": {"name": "x", "age": 3, "tags": [2]}})
        );
        assert!(agent.dirty);
    }

    #[test]
    fn test_nested_paths() {
        let mut agent = AgentState::new("a1");
        let path = parse_path("a.b.c");
        agent.set_path(&path, json!(5));
        assert_eq!(agent.get_path(&path), Some(&json!(5)));

        agent.set_path(&parse_path("a.b"), json!("leaf"));
        agent.set_path(&parse_path("a.b.d"), json!(1));
        assert_eq!(Value::Object(agent.state.clone()), json!({"a": {"b": {"d": 1}}}));

        agent.delete_path(&parse_path("a.b.d"));
        assert_eq!(Value::Object(agent.state.clone()), json!({"a": {"b": {}}}));
        agent.delete_path(&parse_path("missing.key"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut agent = AgentState::new("a1");
        assert!(agent.register_action("noop"));
        assert!(!agent.register_action("noop"));
        assert_eq!(agent.actions.len(), 1);
        assert!(agent.deregister_action("noop"));
        assert!(!agent.deregister_action("noop"));
    }

    #[test]
    fn test_serde_skips_dirty() {
        let mut agent = AgentState::new("a1").with_actions(["noop"]);
        agent.merge(&obj(json!({"k": "v"})));
        let encoded = serde_json::to_string(&agent).unwrap();
        let decoded: AgentState = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.equivalent(&agent));
        assert!(!decoded.dirty);
    }
}
