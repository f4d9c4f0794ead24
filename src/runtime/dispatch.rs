//! Outbound dispatch boundary
//!
//! The interpreter hands every emitted signal to a [`DispatchRouter`], which
//! looks up the [`Dispatcher`] registered for each configured adapter and
//! delivers to all of them concurrently. Transport logic lives only in
//! dispatchers.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::error::{DispatchError, DispatchResult};
use super::signal::{Dispatch, DispatchAdapter, Signal};
use super::worker::WorkerHandle;

/// Delivers a signal over one transport
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `signal` using the route's adapter options
    async fn deliver(&self, signal: &Signal, options: &Map<String, Value>) -> DispatchResult<()>;
}

/// Adapter table used by workers to emit signals
#[derive(Clone, Default)]
pub struct DispatchRouter {
    adapters: HashMap<DispatchAdapter, Arc<dyn Dispatcher>>,
}

impl DispatchRouter {
    /// Router with no adapters
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the in-process adapters (`noop`, `logger`, `console`)
    pub fn with_defaults() -> Self {
        Self::new()
            .with_adapter(DispatchAdapter::Noop, Arc::new(NoopDispatcher))
            .with_adapter(DispatchAdapter::Logger, Arc::new(LoggerDispatcher))
            .with_adapter(DispatchAdapter::Console, Arc::new(ConsoleDispatcher))
    }

    /// Register (or replace) the dispatcher for an adapter kind
    pub fn with_adapter(mut self, adapter: DispatchAdapter, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.adapters.insert(adapter, dispatcher);
        self
    }

    /// Whether an adapter is registered
    pub fn supports(&self, adapter: DispatchAdapter) -> bool {
        self.adapters.contains_key(&adapter)
    }

    /// Deliver to every route in `dispatch`; the first failure is returned
    /// after all deliveries have finished
    pub async fn dispatch(&self, signal: &Signal, dispatch: &Dispatch) -> DispatchResult<()> {
        let mut deliveries = Vec::with_capacity(dispatch.configs().len());
        for config in dispatch.configs() {
            let dispatcher = self
                .adapters
                .get(&config.adapter)
                .ok_or_else(|| DispatchError::AdapterUnavailable(config.adapter.to_string()))?;
            deliveries.push(dispatcher.deliver(signal, &config.options));
        }
        join_all(deliveries).await.into_iter().collect()
    }
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut adapters: Vec<&str> = self.adapters.keys().map(DispatchAdapter::as_str).collect();
        adapters.sort_unstable();
        f.debug_struct("DispatchRouter").field("adapters", &adapters).finish()
    }
}

/// Discards signals
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn deliver(&self, _signal: &Signal, _options: &Map<String, Value>) -> DispatchResult<()> {
        Ok(())
    }
}

/// Writes signals through `tracing`; option `level` is `debug`, `info` or `warn`
pub struct LoggerDispatcher;

#[async_trait]
impl Dispatcher for LoggerDispatcher {
    async fn deliver(&self, signal: &Signal, options: &Map<String, Value>) -> DispatchResult<()> {
        let level = options.get("level").and_then(Value::as_str).unwrap_or("info");
        match level {
            "debug" => tracing::debug!(signal = %signal.id, signal_type = %signal.signal_type, data = %signal.data, "signal emitted"),
            "info" => tracing::info!(signal = %signal.id, signal_type = %signal.signal_type, data = %signal.data, "signal emitted"),
            "warn" => tracing::warn!(signal = %signal.id, signal_type = %signal.signal_type, data = %signal.data, "signal emitted"),
            other => {
                return Err(DispatchError::BadOptions {
                    adapter: DispatchAdapter::Logger.to_string(),
                    detail: format!("unknown level '{other}'"),
                });
            }
        }
        Ok(())
    }
}

/// Prints signals to stdout as JSON lines
pub struct ConsoleDispatcher;

#[async_trait]
impl Dispatcher for ConsoleDispatcher {
    async fn deliver(&self, signal: &Signal, _options: &Map<String, Value>) -> DispatchResult<()> {
        let line = serde_json::to_string(signal).map_err(|err| DispatchError::DeliveryFailed {
            adapter: DispatchAdapter::Console.to_string(),
            detail: err.to_string(),
        })?;
        println!("{line}");
        Ok(())
    }
}

/// In-process broadcast bus
///
/// Delivery never fails for lack of subscribers; late subscribers only see
/// signals sent after they subscribed.
#[derive(Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<Signal>,
}

impl SignalBus {
    /// Bus retaining up to `capacity` undelivered signals per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every signal delivered from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Dispatcher for SignalBus {
    async fn deliver(&self, signal: &Signal, _options: &Map<String, Value>) -> DispatchResult<()> {
        // no receivers is not an error
        let _ = self.sender.send(signal.clone());
        Ok(())
    }
}

/// Delivers to worker handles registered by name (option `target`)
#[derive(Clone, Default)]
pub struct HandleDispatcher {
    targets: Arc<RwLock<HashMap<String, WorkerHandle>>>,
}

impl HandleDispatcher {
    /// Empty target table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under `name`, replacing any previous one
    pub fn register(&self, name: impl Into<String>, handle: WorkerHandle) {
        self.targets.write().insert(name.into(), handle);
    }

    /// Remove a registered handle
    pub fn unregister(&self, name: &str) -> Option<WorkerHandle> {
        self.targets.write().remove(name)
    }
}

#[async_trait]
impl Dispatcher for HandleDispatcher {
    async fn deliver(&self, signal: &Signal, options: &Map<String, Value>) -> DispatchResult<()> {
        let adapter = DispatchAdapter::DirectHandle.to_string();
        let target = options
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::BadOptions {
                adapter: adapter.clone(),
                detail: "missing 'target'".into(),
            })?;
        let handle = self
            .targets
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| DispatchError::DeliveryFailed {
                adapter: adapter.clone(),
                detail: format!("no handle registered as '{target}'"),
            })?;
        handle
            .cast(signal.clone())
            .map(|_| ())
            .map_err(|err| DispatchError::DeliveryFailed {
                adapter,
                detail: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::signal::DispatchConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_fan_out_reaches_every_adapter() {
        let bus = SignalBus::new(8);
        let mut rx = bus.subscribe();
        let router = DispatchRouter::with_defaults().with_adapter(DispatchAdapter::Bus, Arc::new(bus));

        let dispatch = Dispatch::Many(vec![
            DispatchConfig::new(DispatchAdapter::Noop),
            DispatchConfig::new(DispatchAdapter::Bus),
            DispatchConfig::new(DispatchAdapter::Logger).with_option("level", "debug"),
        ]);
        let signal = Signal::new("user.created", json!({"id": 1}));
        router.dispatch(&signal, &dispatch).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().id, signal.id);
    }

    #[tokio::test]
    async fn test_missing_adapter_is_reported() {
        let router = DispatchRouter::new();
        let err = router
            .dispatch(&Signal::new("a.b", Value::Null), &Dispatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AdapterUnavailable(name) if name == "logger"));
    }

    #[tokio::test]
    async fn test_bad_logger_level() {
        let dispatch = DispatchConfig::new(DispatchAdapter::Logger).with_option("level", "loud");
        let err = DispatchRouter::with_defaults()
            .dispatch(&Signal::new("a.b", Value::Null), &dispatch.into())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadOptions { .. }));
    }

    #[tokio::test]
    async fn test_handle_dispatcher_requires_target() {
        let err = HandleDispatcher::new()
            .deliver(&Signal::new("a.b", Value::Null), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadOptions { .. }));
    }
}
