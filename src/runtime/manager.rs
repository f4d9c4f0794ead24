//! Keyed-singleton instance manager
//!
//! At most one live worker exists per key. Creation happens outside the
//! registry lock; when two callers race, the first to register wins and
//! the other discards its unspawned worker and returns the winner's handle.
//! Workers with no attachments retire after the idle timeout, freezing
//! their agent if storage is configured, and the next `get` thaws it.
//! Attachments count per key, so a worker restarted after a crash stays
//! held by the attachments taken on its predecessor.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::catalog::{Catalog, CatalogBuilder};
use super::children::{ExitReason, RestartPolicy};
use super::dispatch::DispatchRouter;
use super::error::{ErrorReport, RuntimeError, RuntimeResult};
use super::module::AgentModule;
use super::signal::{Signal, SignalId};
use super::storage::{Persistence, Storage, StorageConfig};
use super::worker::{Worker, WorkerConfig, WorkerHandle, WorkerOptions};

/// Manager construction options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Name used in logs
    pub name: String,
    /// Storage namespace for this manager's agents
    pub entity_kind: String,
    /// Retire unattached workers after this long; `None` keeps them forever
    pub idle_timeout_ms: Option<u64>,
    /// Live worker limit
    pub max_agents: usize,
    /// Applied when a worker exits without being asked to
    pub restart: RestartPolicy,
    /// Hibernation backend
    pub storage: StorageConfig,
    /// Per-worker settings
    pub worker: WorkerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "cadre".to_string(),
            entity_kind: "agent".to_string(),
            idle_timeout_ms: None,
            max_agents: 100_000,
            restart: RestartPolicy::Transient,
            storage: StorageConfig::None,
            worker: WorkerConfig::default(),
        }
    }
}

/// Live keys, as reported by [`InstanceManager::stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Keys with a live worker, sorted
    pub keys: Vec<String>,
    /// Number of live workers
    pub count: usize,
}

struct Entry {
    handle: WorkerHandle,
    opts: Value,
    epoch: u64,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn cancel_timer(&mut self) {
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

enum Slot {
    Live(Entry),
    Retiring(watch::Receiver<bool>),
}

struct Inner {
    config: ManagerConfig,
    module: Arc<dyn AgentModule>,
    catalog: Catalog,
    dispatcher: Arc<DispatchRouter>,
    storage: Option<Arc<dyn Storage>>,
    registry: Mutex<HashMap<String, Slot>>,
    // locked after `registry` when both are held
    attached: Mutex<HashMap<String, usize>>,
}

impl Inner {
    fn is_attached(&self, key: &str) -> bool {
        self.attached.lock().get(key).is_some_and(|count| *count > 0)
    }
}

/// Builder for [`InstanceManager`]
pub struct ManagerBuilder {
    module: Arc<dyn AgentModule>,
    config: ManagerConfig,
    catalog: Option<Catalog>,
    dispatcher: Option<Arc<DispatchRouter>>,
    storage: Option<Arc<dyn Storage>>,
}

impl ManagerBuilder {
    /// Use `config`
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve actions and child modules against `catalog` (default: built-ins)
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Emit through `dispatcher` (default: in-process adapters)
    pub fn dispatcher(mut self, dispatcher: DispatchRouter) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Use this store instead of the one named in the config
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate the config and build the manager
    pub fn build(self) -> RuntimeResult<InstanceManager> {
        let config = self.config;
        if config.entity_kind.trim().is_empty() {
            return Err(RuntimeError::Config("entity_kind must not be empty".into()));
        }
        if config.max_agents == 0 {
            return Err(RuntimeError::Config("max_agents must be at least 1".into()));
        }
        if config.worker.max_queue_size == 0 {
            return Err(RuntimeError::Config("max_queue_size must be at least 1".into()));
        }
        let storage = match self.storage {
            Some(storage) => Some(storage),
            None => config.storage.open()?,
        };
        let catalog = self
            .catalog
            .unwrap_or_else(|| CatalogBuilder::with_builtins().build());
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(DispatchRouter::with_defaults()));

        tracing::debug!(manager = %config.name, entity_kind = %config.entity_kind, "instance manager ready");
        Ok(InstanceManager {
            inner: Arc::new(Inner {
                config,
                module: self.module,
                catalog,
                dispatcher,
                storage,
                registry: Mutex::new(HashMap::new()),
                attached: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Registry of one worker per key
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<Inner>,
}

impl InstanceManager {
    /// Start building a manager for agents made by `module`
    pub fn builder(module: Arc<dyn AgentModule>) -> ManagerBuilder {
        ManagerBuilder {
            module,
            config: ManagerConfig::default(),
            catalog: None,
            dispatcher: None,
            storage: None,
        }
    }

    /// The manager's config
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Handle for `key`, starting (or thawing) the worker if needed
    ///
    /// Resets the idle timer of an existing unattached worker.
    pub async fn get(&self, key: &str, opts: Value) -> RuntimeResult<WorkerHandle> {
        loop {
            if let Some(handle) = self.existing(key).await {
                return Ok(handle);
            }
            if let Some(handle) = self.start_worker(key, opts.clone())? {
                return Ok(handle);
            }
        }
    }

    /// Build a worker outside the lock and register it, or adopt the
    /// winner of a concurrent start; `None` means a retirement is in progress
    fn start_worker(&self, key: &str, opts: Value) -> RuntimeResult<Option<WorkerHandle>> {
        // may thaw from storage
        let worker = Worker::build(self.worker_options(key, opts.clone()))?;

        let mut registry = self.inner.registry.lock();
        match registry.get_mut(key) {
            Some(Slot::Live(entry)) if entry.handle.is_alive() => {
                tracing::debug!(key, "lost start race; adopting existing worker");
                drop(worker);
                if !self.inner.is_attached(key) {
                    arm_idle_timer(&self.inner, key, entry);
                }
                return Ok(Some(entry.handle.clone()));
            }
            Some(Slot::Retiring(_)) => return Ok(None),
            _ => {}
        }

        let live = registry
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count();
        if live >= self.inner.config.max_agents {
            return Err(RuntimeError::Capacity(self.inner.config.max_agents));
        }

        let running = worker.spawn();
        let handle = running.handle.clone();
        let mut entry = Entry {
            handle: handle.clone(),
            opts,
            epoch: 0,
            timer: None,
        };
        if !self.inner.is_attached(key) {
            arm_idle_timer(&self.inner, key, &mut entry);
        }
        registry.insert(key.to_string(), Slot::Live(entry));
        drop(registry);

        let manager = Arc::downgrade(&self.inner);
        let monitor_key = key.to_string();
        let instance = handle.instance();
        tokio::spawn(async move {
            let reason = running.wait().await;
            if let Some(inner) = manager.upgrade() {
                InstanceManager { inner }.on_exit(&monitor_key, instance, reason);
            }
        });

        tracing::info!(manager = %self.inner.config.name, key, "agent started");
        Ok(Some(handle))
    }

    /// Live handle for `key`, waiting out a retirement in progress
    async fn existing(&self, key: &str) -> Option<WorkerHandle> {
        loop {
            let mut retiring = {
                let mut registry = self.inner.registry.lock();
                match registry.get_mut(key) {
                    Some(Slot::Live(entry)) if entry.handle.is_alive() => {
                        if !self.inner.is_attached(key) {
                            arm_idle_timer(&self.inner, key, entry);
                        }
                        return Some(entry.handle.clone());
                    }
                    Some(Slot::Live(_)) => {
                        // crashed; the monitor has not cleaned up yet
                        registry.remove(key);
                        return None;
                    }
                    Some(Slot::Retiring(done)) => done.clone(),
                    None => return None,
                }
            };
            if retiring.wait_for(|done| *done).await.is_err() {
                let mut registry = self.inner.registry.lock();
                if matches!(registry.get(key), Some(Slot::Retiring(done)) if done.has_changed().is_err()) {
                    registry.remove(key);
                }
            }
        }
    }

    fn worker_options(&self, key: &str, opts: Value) -> WorkerOptions {
        WorkerOptions {
            id: key.to_string(),
            module: self.inner.module.clone(),
            agent_opts: opts,
            catalog: self.inner.catalog.clone(),
            dispatcher: self.inner.dispatcher.clone(),
            config: self.inner.config.worker.clone(),
            persistence: self
                .inner
                .storage
                .clone()
                .map(|storage| Persistence::new(storage, self.inner.config.entity_kind.clone())),
            initial_state: None,
        }
    }

    /// Live handle for `key`, without starting anything or touching timers
    pub fn lookup(&self, key: &str) -> Option<WorkerHandle> {
        match self.inner.registry.lock().get(key) {
            Some(Slot::Live(entry)) if entry.handle.is_alive() => Some(entry.handle.clone()),
            _ => None,
        }
    }

    /// Get the worker and hold it awake until the [`Attachment`] drops
    ///
    /// The hold covers restarts after a crash.
    pub async fn attach(&self, key: &str, opts: Value) -> RuntimeResult<Attachment> {
        loop {
            let handle = self.get(key, opts.clone()).await?;
            let mut registry = self.inner.registry.lock();
            if let Some(Slot::Live(entry)) = registry.get_mut(key) {
                if entry.handle.same_worker(&handle) {
                    *self.inner.attached.lock().entry(key.to_string()).or_insert(0) += 1;
                    entry.cancel_timer();
                    return Ok(Attachment {
                        manager: Arc::downgrade(&self.inner),
                        key: key.to_string(),
                    });
                }
            }
            // retired between get and attach
        }
    }

    /// Enqueue on the worker for `key`, starting it if needed
    pub async fn cast(&self, key: &str, signal: Signal) -> RuntimeResult<SignalId> {
        self.get(key, Value::Null).await?.cast(signal)
    }

    /// Call the worker for `key` with the configured call timeout
    pub async fn call(&self, key: &str, signal: Signal) -> RuntimeResult<Value> {
        let timeout = Duration::from_millis(self.inner.config.worker.call_timeout_ms);
        self.get(key, Value::Null).await?.call(signal, timeout).await
    }

    /// Graceful stop; the agent is frozen first if storage is configured
    ///
    /// Returns whether this call stopped a worker.
    pub async fn stop(&self, key: &str) -> RuntimeResult<bool> {
        let retiring = {
            let mut registry = self.inner.registry.lock();
            match registry.remove(key) {
                Some(Slot::Live(mut entry)) => {
                    entry.cancel_timer();
                    let (done, waiter) = watch::channel(false);
                    registry.insert(key.to_string(), Slot::Retiring(waiter));
                    Ok((entry.handle, done))
                }
                Some(Slot::Retiring(waiter)) => {
                    registry.insert(key.to_string(), Slot::Retiring(waiter.clone()));
                    Err(waiter)
                }
                None => return Ok(false),
            }
        };
        match retiring {
            Ok((handle, done)) => {
                self.retire(key, handle, done, "shutdown").await?;
                tracing::info!(manager = %self.inner.config.name, key, "agent stopped");
                Ok(true)
            }
            Err(mut waiter) => {
                let _ = waiter.wait_for(|done| *done).await;
                Ok(false)
            }
        }
    }

    /// Stop every live worker; returns how many were stopped
    pub async fn stop_all(&self) -> RuntimeResult<usize> {
        let keys = self.stats().keys;
        let results = join_all(keys.iter().map(|key| self.stop(key))).await;

        let errors: Vec<RuntimeError> = results.iter().filter_map(|r| r.as_ref().err().cloned()).collect();
        if let Some(report) = ErrorReport::aggregate(&errors) {
            tracing::warn!(
                manager = %self.inner.config.name,
                kind = report.kind.as_str(),
                errors = ?report.messages,
                "some agents did not stop cleanly"
            );
            let worst = errors
                .into_iter()
                .max_by_key(RuntimeError::kind)
                .unwrap_or(RuntimeError::Internal("stop failed".into()));
            return Err(worst);
        }
        Ok(results.into_iter().filter(|r| matches!(r, Ok(true))).count())
    }

    /// Live keys and their count; read-only
    pub fn stats(&self) -> ManagerStats {
        let registry = self.inner.registry.lock();
        let mut keys: Vec<String> = registry
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(key, _)| key.clone())
            .collect();
        drop(registry);
        keys.sort();
        ManagerStats {
            count: keys.len(),
            keys,
        }
    }

    async fn retire(
        &self,
        key: &str,
        handle: WorkerHandle,
        done: watch::Sender<bool>,
        reason: &str,
    ) -> RuntimeResult<()> {
        let timeout = Duration::from_millis(self.inner.config.worker.stop_timeout_ms);
        let result = handle.stop(reason, timeout).await;
        if let Err(err) = &result {
            tracing::warn!(key, error = %err, "agent did not stop in time; aborting");
            handle.kill();
        }
        {
            let mut registry = self.inner.registry.lock();
            if matches!(registry.get(key), Some(Slot::Retiring(_))) {
                registry.remove(key);
            }
        }
        let _ = done.send(true);
        result
    }

    async fn expire(&self, key: String, epoch: u64) {
        let retiring = {
            let mut registry = self.inner.registry.lock();
            match registry.remove(&key) {
                Some(Slot::Live(entry)) if entry.epoch == epoch && !self.inner.is_attached(&key) => {
                    let (done, waiter) = watch::channel(false);
                    registry.insert(key.clone(), Slot::Retiring(waiter));
                    Some((entry.handle, done))
                }
                Some(other) => {
                    registry.insert(key.clone(), other);
                    None
                }
                None => None,
            }
        };
        let Some((handle, done)) = retiring else {
            return;
        };
        let hibernating = self.inner.storage.is_some();
        match self.retire(&key, handle, done, "idle").await {
            Ok(()) if hibernating => tracing::info!(key = %key, "agent hibernated"),
            Ok(()) => tracing::info!(key = %key, "idle agent stopped"),
            Err(err) => tracing::warn!(key = %key, error = %err, "idle retirement failed"),
        }
    }

    fn on_exit(&self, key: &str, instance: Uuid, reason: ExitReason) {
        let entry = {
            let mut registry = self.inner.registry.lock();
            match registry.remove(key) {
                Some(Slot::Live(entry)) if entry.handle.instance() == instance => Some(entry),
                Some(other) => {
                    registry.insert(key.to_string(), other);
                    None
                }
                None => None,
            }
        };
        // retired or replaced by the manager
        let Some(mut entry) = entry else {
            return;
        };
        entry.cancel_timer();

        if reason.is_abnormal() {
            tracing::warn!(key, %reason, "agent crashed");
        } else {
            tracing::info!(key, %reason, "agent exited");
        }
        if !self.inner.config.restart.should_restart(&reason) {
            return;
        }
        match self.start_worker(key, entry.opts) {
            Ok(Some(handle)) => tracing::info!(key, instance = %handle.instance(), "agent restarted"),
            Ok(None) => tracing::debug!(key, "agent retiring; not restarted"),
            Err(err) => tracing::error!(key, error = %err, "agent restart failed"),
        }
    }
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("name", &self.inner.config.name)
            .field("module", &self.inner.module.name())
            .field("live", &self.stats().count)
            .finish()
    }
}

fn arm_idle_timer(inner: &Arc<Inner>, key: &str, entry: &mut Entry) {
    entry.cancel_timer();
    let Some(ms) = inner.config.idle_timeout_ms else {
        return;
    };
    // attachments may be released outside a runtime
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let manager: Weak<Inner> = Arc::downgrade(inner);
    let key = key.to_string();
    let epoch = entry.epoch;
    let timer = runtime.spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        if let Some(inner) = manager.upgrade() {
            InstanceManager { inner }.expire(key, epoch).await;
        }
    });
    entry.timer = Some(timer.abort_handle());
}

/// Keeps the worker for a key from idling out while held
pub struct Attachment {
    manager: Weak<Inner>,
    key: String,
}

impl Attachment {
    /// Current live worker for the key, which may be a restarted one
    pub fn handle(&self) -> Option<WorkerHandle> {
        let inner = self.manager.upgrade()?;
        InstanceManager { inner }.lookup(&self.key)
    }

    /// The key attached to
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let mut registry = inner.registry.lock();
        let released = {
            let mut attached = inner.attached.lock();
            let count = attached.get(&self.key).copied().unwrap_or(0).saturating_sub(1);
            if count == 0 {
                attached.remove(&self.key);
            } else {
                attached.insert(self.key.clone(), count);
            }
            count == 0
        };
        if released {
            if let Some(Slot::Live(entry)) = registry.get_mut(&self.key) {
                arm_idle_timer(&inner, &self.key, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::module::AgentDefinition;

    fn manager(config: ManagerConfig) -> InstanceManager {
        InstanceManager::builder(Arc::new(AgentDefinition::new("kv").route("kv.set", "state.set")))
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn test_rejects_bad_config() {
        let module: Arc<dyn AgentModule> = Arc::new(AgentDefinition::new("kv"));
        let mut config = ManagerConfig::default();
        config.max_agents = 0;
        assert!(matches!(
            InstanceManager::builder(module.clone()).config(config).build(),
            Err(RuntimeError::Config(_))
        ));
        let mut config = ManagerConfig::default();
        config.entity_kind = " ".into();
        assert!(InstanceManager::builder(module).config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_max_agents() {
        let mut config = ManagerConfig::default();
        config.max_agents = 1;
        let manager = manager(config);

        manager.get("a", Value::Null).await.unwrap();
        assert!(matches!(
            manager.get("b", Value::Null).await,
            Err(RuntimeError::Capacity(1))
        ));
        assert_eq!(manager.stats().keys, vec!["a"]);
    }

    #[tokio::test]
    async fn test_stop_unknown_key() {
        let manager = manager(ManagerConfig::default());
        assert!(!manager.stop("missing").await.unwrap());
        assert!(manager.lookup("missing").is_none());
    }
}
