//! Signal envelopes and dispatch configuration
//!
//! Signals are immutable, CloudEvents-shaped messages exchanged between
//! callers, agents, and the runtime. A signal is never edited after it is
//! handed to the runtime; builders produce a new value instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use super::error::{DirectiveError, DirectiveResult};

/// Prefix for runtime-directed management signals
pub const SYSTEM_PREFIX: &str = "cadre.system.";
/// Prefix for outbound events emitted by the runtime
pub const EVENT_PREFIX: &str = "cadre.agent.event.";

/// Hold agent-directed signals in the queue
pub const SYSTEM_PAUSE: &str = "cadre.system.pause";
/// Resume executing agent-directed signals
pub const SYSTEM_RESUME: &str = "cadre.system.resume";
/// Scheduled strategy continuation
pub const SYSTEM_TICK: &str = "cadre.system.tick";
/// Graceful stop requested through the queue
pub const SYSTEM_STOP: &str = "cadre.system.stop";

/// Worker finished booting
pub const EVENT_STARTED: &str = "cadre.agent.event.started";
/// Worker stopped gracefully
pub const EVENT_STOPPED: &str = "cadre.agent.event.stopped";
/// Result of an asynchronously delivered signal
pub const EVENT_RESULT: &str = "cadre.agent.event.result";
/// Failure while processing a signal
pub const EVENT_ERROR: &str = "cadre.agent.event.error";

const DEFAULT_SOURCE: &str = "/cadre";

/// Signal identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub String);

impl SignalId {
    /// Create a new random SignalId
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the drain loop treats a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Routed to the agent's actions
    Command,
    /// Handled by the worker itself
    System,
    /// Outbound notification; ignored on delivery to avoid feedback loops
    Event,
}

/// Output adapter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAdapter {
    /// Deliver to a worker handle registered by name
    DirectHandle,
    /// External publish/subscribe system
    Pubsub,
    /// In-process signal bus
    Bus,
    /// HTTP webhook
    Http,
    /// Write through `tracing`
    Logger,
    /// Print to stdout
    Console,
    /// Discard
    Noop,
}

impl DispatchAdapter {
    /// Stable adapter name
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchAdapter::DirectHandle => "direct_handle",
            DispatchAdapter::Pubsub => "pubsub",
            DispatchAdapter::Bus => "bus",
            DispatchAdapter::Http => "http",
            DispatchAdapter::Logger => "logger",
            DispatchAdapter::Console => "console",
            DispatchAdapter::Noop => "noop",
        }
    }
}

impl fmt::Display for DispatchAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single output route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Adapter kind
    pub adapter: DispatchAdapter,
    /// Adapter-specific options
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl DispatchConfig {
    /// Route with no options
    pub fn new(adapter: DispatchAdapter) -> Self {
        Self {
            adapter,
            options: Map::new(),
        }
    }

    /// Add an adapter option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// One route, or fan-out to several
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dispatch {
    /// Single adapter
    One(DispatchConfig),
    /// Fan-out to every listed adapter
    Many(Vec<DispatchConfig>),
}

impl Dispatch {
    /// Iterate the configured routes
    pub fn configs(&self) -> &[DispatchConfig] {
        match self {
            Dispatch::One(config) => std::slice::from_ref(config),
            Dispatch::Many(configs) => configs,
        }
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Dispatch::One(DispatchConfig::new(DispatchAdapter::Logger))
    }
}

impl From<DispatchConfig> for Dispatch {
    fn from(config: DispatchConfig) -> Self {
        Dispatch::One(config)
    }
}

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique per emission
    pub id: SignalId,
    /// Namespaced type, e.g. `counter.increment`
    #[serde(rename = "type")]
    pub signal_type: String,
    /// Producer of the signal
    pub source: String,
    /// Optional subject within the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Opaque payload
    #[serde(default)]
    pub data: Value,
    /// Emission time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Shared by every signal in one causal chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Immediate parent signal or instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Output routing for this signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<Dispatch>,
}

impl Signal {
    /// Create a signal with a fresh id and the current time
    pub fn new(signal_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: SignalId::new(),
            signal_type: signal_type.into(),
            source: DEFAULT_SOURCE.to_string(),
            subject: None,
            data,
            time: Some(Utc::now()),
            correlation_id: None,
            causation_id: None,
            dispatch: None,
        }
    }

    /// Set the source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Set the output routing
    pub fn with_dispatch(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Correlation id for this signal's causal chain (its own id if it starts one)
    pub fn correlation(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(self.id.as_str())
    }

    /// Classify for the drain loop
    pub fn class(&self) -> SignalClass {
        if self.signal_type.starts_with(SYSTEM_PREFIX) {
            SignalClass::System
        } else if self.signal_type.starts_with(EVENT_PREFIX) {
            SignalClass::Event
        } else {
            SignalClass::Command
        }
    }

    /// Check the envelope is well-formed
    pub fn validate(&self) -> DirectiveResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(DirectiveError::InvalidSignal("empty id".into()));
        }
        if self.source.trim().is_empty() {
            return Err(DirectiveError::InvalidSignal("empty source".into()));
        }
        let ty = self.signal_type.as_str();
        if ty.is_empty() || ty.chars().any(char::is_whitespace) {
            return Err(DirectiveError::InvalidSignal(format!(
                "bad type '{}'",
                self.signal_type
            )));
        }
        if ty.split('.').any(str::is_empty) {
            return Err(DirectiveError::InvalidSignal(format!(
                "type '{}' has an empty segment",
                self.signal_type
            )));
        }
        Ok(())
    }

    /// Payload as an object, if it is one
    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert_eq!(Signal::new("counter.inc", json!({})).class(), SignalClass::Command);
        assert_eq!(Signal::new(SYSTEM_PAUSE, Value::Null).class(), SignalClass::System);
        assert_eq!(Signal::new(EVENT_RESULT, Value::Null).class(), SignalClass::Event);
    }

    #[test]
    fn test_validation() {
        assert!(Signal::new("a.b", Value::Null).validate().is_ok());
        assert!(Signal::new("", Value::Null).validate().is_err());
        assert!(Signal::new("a..b", Value::Null).validate().is_err());
        assert!(Signal::new("has space", Value::Null).validate().is_err());
        assert!(Signal::new("a.b", Value::Null).with_source("").validate().is_err());
    }

    #[test]
    fn test_correlation_defaults_to_own_id() {
        let signal = Signal::new("a.b", Value::Null);
        assert_eq!(signal.correlation(), signal.id.as_str());
        let signal = signal.with_correlation_id("chain-1");
        assert_eq!(signal.correlation(), "chain-1");
    }

    #[test]
    fn test_wire_shape() {
        let signal = Signal::new("a.b", json!({"x": 1}))
            .with_dispatch(DispatchConfig::new(DispatchAdapter::Noop));
        let wire = serde_json::to_value(&signal).unwrap();
        assert_eq!(wire["type"], "a.b");
        assert_eq!(wire["dispatch"]["adapter"], "noop");
        assert!(wire.get("subject").is_none());

        let fanout: Dispatch = serde_json::from_value(json!([
            {"adapter": "logger"},
            {"adapter": "console", "options": {"pretty": true}}
        ]))
        .unwrap();
        assert_eq!(fanout.configs().len(), 2);
    }
}
