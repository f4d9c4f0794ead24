//! Supervised child workers
//!
//! Each worker owns a [`ChildSupervisor`]: a tag→handle table of the
//! workers it spawned. A monitor task per child reports the child's exit
//! back to the parent's control channel, and the parent asks the
//! supervisor whether the [`RestartPolicy`] wants a replacement.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::catalog::Catalog;
use super::directive::ChildSpec;
use super::dispatch::DispatchRouter;
use super::error::{DirectiveError, RuntimeResult};
use super::worker::{Control, Worker, WorkerConfig, WorkerHandle, WorkerOptions};

/// Why a worker task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Stopped itself with reason `normal`
    Normal,
    /// Stopped on request
    Shutdown(String),
    /// Retired after its idle timeout
    Idle,
    /// Panicked outside the recoverable boundary
    Crashed(String),
    /// Aborted without a graceful shutdown
    Killed,
}

impl ExitReason {
    /// Map a stop reason to an exit reason
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "normal" => ExitReason::Normal,
            "idle" => ExitReason::Idle,
            other => ExitReason::Shutdown(other.to_string()),
        }
    }

    /// Crash or abort, as opposed to an intentional stop
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ExitReason::Crashed(_) | ExitReason::Killed)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Shutdown(reason) => write!(f, "shutdown: {reason}"),
            ExitReason::Idle => f.write_str("idle"),
            ExitReason::Crashed(detail) => write!(f, "crashed: {detail}"),
            ExitReason::Killed => f.write_str("killed"),
        }
    }
}

/// Whether an exited worker is replaced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Replace on any exit except idle retirement
    Permanent,
    /// Replace only after a crash
    #[default]
    Transient,
    /// Never replace
    Temporary,
}

impl RestartPolicy {
    /// Decide for one exit
    pub fn should_restart(&self, reason: &ExitReason) -> bool {
        match self {
            RestartPolicy::Permanent => !matches!(reason, ExitReason::Idle),
            RestartPolicy::Transient => reason.is_abnormal(),
            RestartPolicy::Temporary => false,
        }
    }
}

struct Child {
    handle: WorkerHandle,
    spec: ChildSpec,
    restarts: u32,
}

/// What happened when a child exit was reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// The exit belonged to a child no longer tracked (killed or replaced)
    Untracked,
    /// The child was removed
    Removed,
    /// The child was replaced by a fresh instance
    Restarted,
}

/// Owned-child registry of one worker
pub struct ChildSupervisor {
    parent_id: String,
    catalog: Catalog,
    dispatcher: Arc<DispatchRouter>,
    config: WorkerConfig,
    control: mpsc::UnboundedSender<Control>,
    children: HashMap<String, Child>,
    max_restarts: u32,
    next_tag: u64,
}

impl ChildSupervisor {
    /// Supervisor reporting exits to `control`
    pub(crate) fn new(
        parent_id: impl Into<String>,
        catalog: Catalog,
        dispatcher: Arc<DispatchRouter>,
        config: WorkerConfig,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            parent_id: parent_id.into(),
            max_restarts: config.max_child_restarts,
            catalog,
            dispatcher,
            config,
            control,
            children: HashMap::new(),
            next_tag: 0,
        }
    }

    /// Start a child; a tag is generated when none is given
    pub fn spawn(&mut self, spec: ChildSpec, tag: Option<String>) -> RuntimeResult<WorkerHandle> {
        let tag = match tag {
            Some(tag) => tag,
            None => self.generate_tag(),
        };
        if let Some(existing) = self.children.get(&tag) {
            if existing.handle.is_alive() {
                return Err(DirectiveError::DuplicateTag(tag).into());
            }
            self.children.remove(&tag);
        }
        self.start(tag, spec, 0)
    }

    fn generate_tag(&mut self) -> String {
        loop {
            self.next_tag += 1;
            let tag = format!("child-{}", self.next_tag);
            if !self.children.contains_key(&tag) {
                return tag;
            }
        }
    }

    fn start(&mut self, tag: String, spec: ChildSpec, restarts: u32) -> RuntimeResult<WorkerHandle> {
        let module = self
            .catalog
            .module(&spec.module)
            .ok_or_else(|| DirectiveError::InvalidModule(spec.module.clone()))?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.parent_id, tag));

        let running = Worker::start(WorkerOptions {
            id,
            module,
            agent_opts: spec.opts.clone(),
            catalog: self.catalog.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            persistence: None,
            initial_state: None,
        })?;
        let handle = running.handle.clone();

        let control = self.control.clone();
        let monitor_tag = tag.clone();
        let instance = handle.instance();
        tokio::spawn(async move {
            let reason = running.wait().await;
            let _ = control.send(Control::ChildExit {
                tag: monitor_tag,
                instance,
                reason,
            });
        });

        tracing::debug!(parent = %self.parent_id, child = %handle.id(), %tag, "child started");
        self.children.insert(
            tag,
            Child {
                handle: handle.clone(),
                spec,
                restarts,
            },
        );
        Ok(handle)
    }

    /// Resolve a tag or child agent id to its tag
    fn resolve(&self, target: &str) -> Option<String> {
        if self.children.contains_key(target) {
            return Some(target.to_string());
        }
        self.children
            .iter()
            .find(|(_, child)| child.handle.id() == target)
            .map(|(tag, _)| tag.clone())
    }

    /// Whether `target` names a live child
    pub fn is_live(&self, target: &str) -> bool {
        self.resolve(target)
            .and_then(|tag| self.children.get(&tag))
            .is_some_and(|child| child.handle.is_alive())
    }

    /// Stop a live child by tag or agent id; it is not restarted
    pub async fn kill(&mut self, target: &str) -> RuntimeResult<()> {
        let tag = self
            .resolve(target)
            .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?;
        let child = match self.children.remove(&tag) {
            Some(child) if child.handle.is_alive() => child,
            _ => return Err(DirectiveError::NotFound(target.to_string()).into()),
        };
        let timeout = Duration::from_millis(self.config.stop_timeout_ms);
        if let Err(err) = child.handle.stop("killed", timeout).await {
            tracing::warn!(parent = %self.parent_id, %tag, error = %err, "child did not stop in time; aborting");
            child.handle.kill();
        }
        Ok(())
    }

    /// Handle a child's exit report
    pub fn on_exit(&mut self, tag: &str, instance: Uuid, reason: &ExitReason) -> ChildExit {
        let tracked = self
            .children
            .get(tag)
            .is_some_and(|child| child.handle.instance() == instance);
        if !tracked {
            return ChildExit::Untracked;
        }
        let Some(child) = self.children.remove(tag) else {
            return ChildExit::Untracked;
        };

        if !child.spec.restart.should_restart(reason) {
            return ChildExit::Removed;
        }
        if child.restarts >= self.max_restarts {
            tracing::warn!(parent = %self.parent_id, %tag, restarts = child.restarts, "child restart limit reached");
            return ChildExit::Removed;
        }
        match self.start(tag.to_string(), child.spec, child.restarts + 1) {
            Ok(_) => ChildExit::Restarted,
            Err(err) => {
                tracing::warn!(parent = %self.parent_id, %tag, error = %err, "child restart failed");
                ChildExit::Removed
            }
        }
    }

    /// Stop every child
    pub async fn shutdown_all(&mut self) {
        let timeout = Duration::from_millis(self.config.stop_timeout_ms);
        let stops = self.children.drain().map(|(tag, child)| async move {
            if child.handle.stop("shutdown", timeout).await.is_err() {
                tracing::warn!(%tag, "child did not stop in time; aborting");
                child.handle.kill();
            }
        });
        join_all(stops).await;
    }

    /// Handle of a child by tag
    pub fn get(&self, tag: &str) -> Option<&WorkerHandle> {
        self.children.get(tag).map(|child| &child.handle)
    }

    /// Tags of tracked children, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.children.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Number of tracked children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether no children are tracked
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::catalog::CatalogBuilder;
    use crate::runtime::module::AgentDefinition;
    use crate::runtime::signal::{DispatchAdapter, DispatchConfig};

    #[test]
    fn test_restart_policies() {
        let crashed = ExitReason::Crashed("boom".into());
        let stopped = ExitReason::Shutdown("done".into());

        assert!(RestartPolicy::Permanent.should_restart(&crashed));
        assert!(RestartPolicy::Permanent.should_restart(&stopped));
        assert!(!RestartPolicy::Permanent.should_restart(&ExitReason::Idle));

        assert!(RestartPolicy::Transient.should_restart(&crashed));
        assert!(RestartPolicy::Transient.should_restart(&ExitReason::Killed));
        assert!(!RestartPolicy::Transient.should_restart(&ExitReason::Normal));

        assert!(!RestartPolicy::Temporary.should_restart(&crashed));
    }

    #[test]
    fn test_exit_reason_from_stop_reason() {
        assert_eq!(ExitReason::from_reason("normal"), ExitReason::Normal);
        assert_eq!(ExitReason::from_reason("idle"), ExitReason::Idle);
        assert_eq!(
            ExitReason::from_reason("shutdown"),
            ExitReason::Shutdown("shutdown".into())
        );
    }

    #[tokio::test]
    async fn test_killed_child_restarts_until_limit() {
        let catalog = CatalogBuilder::with_builtins();
        catalog.register_module(Arc::new(AgentDefinition::new("echo")));
        let mut config = WorkerConfig::default();
        config.max_child_restarts = 2;
        config.default_dispatch = DispatchConfig::new(DispatchAdapter::Noop).into();
        let (control, mut reports) = mpsc::unbounded_channel();
        let mut supervisor = ChildSupervisor::new(
            "p1",
            catalog.build(),
            Arc::new(DispatchRouter::with_defaults()),
            config,
            control,
        );

        let spec = ChildSpec::new("echo").with_restart(RestartPolicy::Transient);
        let mut current = supervisor.spawn(spec, Some("w1".into())).unwrap();
        for expected in [ChildExit::Restarted, ChildExit::Restarted, ChildExit::Removed] {
            current.kill();
            let Some(Control::ChildExit {
                tag,
                instance,
                reason,
            }) = reports.recv().await
            else {
                panic!("expected a child exit report");
            };
            assert_eq!(reason, ExitReason::Killed);
            assert_eq!(supervisor.on_exit(&tag, instance, &reason), expected);

            if expected == ChildExit::Restarted {
                let next = supervisor.get("w1").unwrap().clone();
                assert!(!next.same_worker(&current));
                assert_eq!(next.id(), "p1/w1");
                current = next;
            }
        }
        assert!(supervisor.is_empty());
    }
}
