//! Agent workers
//!
//! A [`Worker`] is the single task that owns one [`AgentState`]. Callers
//! talk to it through a cloneable [`WorkerHandle`]: signals go into a
//! bounded queue shared with the handle, management requests go over an
//! unbounded control channel. The task alternates between the two,
//! preferring control messages, so status and snapshot queries are
//! answered between signals even while a long drain pass is running.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::agent::AgentState;
use super::catalog::Catalog;
use super::children::{ChildExit, ChildSupervisor, ExitReason};
use super::directive::{Directive, Instruction};
use super::dispatch::DispatchRouter;
use super::error::{ErrorKind, RuntimeError, RuntimeResult, StorageError};
use super::interpreter::{Interpreter, Outcome, Timers};
use super::module::AgentModule;
use super::queue::{Pending, Reply, SignalQueue};
use super::router::SignalRouter;
use super::signal::{
    Dispatch, EVENT_ERROR, EVENT_RESULT, EVENT_STARTED, EVENT_STOPPED, SYSTEM_PAUSE, SYSTEM_RESUME,
    SYSTEM_STOP, SYSTEM_TICK, Signal, SignalClass, SignalId,
};
use super::status::WorkerStatus;
use super::storage::Persistence;
use super::strategy::{Strategy, StrategyContext};

// ========== Configuration ==========

/// Per-worker limits and defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue capacity; enqueues beyond it fail with `QueueOverflow`
    pub max_queue_size: usize,
    /// Default bound for synchronous calls and snapshot queries
    pub call_timeout_ms: u64,
    /// Bound for graceful stops (own and children's)
    pub stop_timeout_ms: u64,
    /// Strategy re-invocations allowed for enqueued instructions per signal
    pub max_instruction_rounds: usize,
    /// Replacements allowed per child tag
    pub max_child_restarts: u32,
    /// Buffer of the [`WorkerEvent`] channel
    pub event_capacity: usize,
    /// Route used for emits without an explicit dispatch
    pub default_dispatch: Dispatch,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            call_timeout_ms: 5_000,
            stop_timeout_ms: 5_000,
            max_instruction_rounds: 16,
            max_child_restarts: 3,
            event_capacity: 256,
            default_dispatch: Dispatch::default(),
        }
    }
}

/// Everything needed to build a worker
#[derive(Clone)]
pub struct WorkerOptions {
    /// Agent id
    pub id: String,
    /// Constructor for fresh agents, plus routing and strategy
    pub module: Arc<dyn AgentModule>,
    /// Passed to [`AgentModule::new_agent`]
    pub agent_opts: Value,
    /// Action and module resolution
    pub catalog: Catalog,
    /// Outbound boundary
    pub dispatcher: Arc<DispatchRouter>,
    /// Limits and defaults
    pub config: WorkerConfig,
    /// Thaw on build and freeze on graceful stop
    pub persistence: Option<Persistence>,
    /// Pre-loaded agent; skips construction and thawing
    pub initial_state: Option<AgentState>,
}

impl WorkerOptions {
    /// Options with default config, no persistence, and the default adapters
    pub fn new(id: impl Into<String>, module: Arc<dyn AgentModule>, catalog: Catalog) -> Self {
        Self {
            id: id.into(),
            module,
            agent_opts: Value::Null,
            catalog,
            dispatcher: Arc::new(DispatchRouter::with_defaults()),
            config: WorkerConfig::default(),
            persistence: None,
            initial_state: None,
        }
    }
}

// ========== Events ==========

/// Non-fatal occurrences observable through [`WorkerHandle::subscribe`]
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The task started
    Started {
        /// Agent id
        agent: String,
    },
    /// Status changed
    ///
    /// Pausing an idle worker passes through `Running` without running
    /// any signal, so it reports `Idle -> Running` then `Running -> Paused`.
    Transition {
        /// Previous status
        from: WorkerStatus,
        /// New status
        to: WorkerStatus,
    },
    /// A transition outside the table was attempted and refused
    InvalidTransition {
        /// Current status
        from: WorkerStatus,
        /// Refused status
        to: WorkerStatus,
    },
    /// An enqueue was rejected
    QueueOverflow {
        /// Rejected signal type
        signal_type: String,
        /// Queue capacity
        max: usize,
    },
    /// A signal finished successfully
    SignalProcessed {
        /// Signal id
        signal: SignalId,
        /// Signal type
        signal_type: String,
    },
    /// A signal failed; the worker carried on
    SignalFailed {
        /// Signal id
        signal: SignalId,
        /// Failure class
        kind: ErrorKind,
        /// Failure message
        message: String,
    },
    /// A supervised child exited
    ChildExited {
        /// Child tag
        tag: String,
        /// Why it exited
        reason: ExitReason,
        /// Whether a replacement was started
        restarted: bool,
    },
    /// The worker finished a graceful stop
    Stopped {
        /// Why it stopped
        reason: ExitReason,
    },
}

/// Point-in-time copy of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Agent id
    pub id: String,
    /// Identity of this worker incarnation
    pub instance: Uuid,
    /// Lifecycle status
    pub status: WorkerStatus,
    /// Agent state
    pub agent: AgentState,
    /// Queued signals
    pub queue_len: usize,
    /// Tags of supervised children
    pub children: Vec<String>,
}

// ========== Handle ==========

pub(crate) enum Control {
    Snapshot(oneshot::Sender<WorkerSnapshot>),
    Pause,
    Resume,
    Stop {
        reason: String,
        ack: oneshot::Sender<()>,
    },
    ChildExit {
        tag: String,
        instance: Uuid,
        reason: ExitReason,
    },
}

/// Cloneable address of a worker
#[derive(Clone)]
pub struct WorkerHandle {
    id: Arc<str>,
    instance: Uuid,
    queue: Arc<Mutex<SignalQueue>>,
    wake: Arc<Notify>,
    control: mpsc::UnboundedSender<Control>,
    events: broadcast::Sender<WorkerEvent>,
    status: watch::Receiver<WorkerStatus>,
    alive: Arc<AtomicBool>,
    abort: Arc<Mutex<Option<AbortHandle>>>,
    call_timeout: Duration,
}

impl WorkerHandle {
    /// Agent id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity of this worker incarnation; a restarted worker gets a new one
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Whether two handles address the same worker incarnation
    pub fn same_worker(&self, other: &WorkerHandle) -> bool {
        self.instance == other.instance
    }

    /// Enqueue without waiting; returns the signal id as acknowledgement
    ///
    /// Completion is announced with a `cadre.agent.event.result` signal
    /// carrying the caller's correlation id.
    pub fn cast(&self, signal: Signal) -> RuntimeResult<SignalId> {
        self.enqueue(signal, None)
    }

    /// Enqueue and wait for the signal's result, up to `timeout`
    ///
    /// A timeout only abandons the wait; the worker still processes the signal.
    pub async fn call(&self, signal: Signal, timeout: Duration) -> RuntimeResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(signal, Some(tx))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::WorkerStopped(self.id.to_string())),
            Err(_) => Err(RuntimeError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Timeout used by [`WorkerHandle::state`], from the worker config
    pub fn default_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn enqueue(&self, signal: Signal, reply: Option<Reply>) -> RuntimeResult<SignalId> {
        signal.validate()?;
        let id = signal.id.clone();
        let signal_type = signal.signal_type.clone();

        let rejected = {
            let mut queue = self.queue.lock();
            if !self.alive.load(Ordering::SeqCst) {
                return Err(RuntimeError::WorkerStopped(self.id.to_string()));
            }
            queue.push(Pending { signal, reply }).err()
        };

        match rejected {
            None => {
                self.wake.notify_one();
                Ok(id)
            }
            Some((err, _)) => {
                let max = match &err {
                    RuntimeError::QueueOverflow { max } => *max,
                    _ => 0,
                };
                tracing::warn!(agent = %self.id, signal_type = %signal_type, max, "queue overflow; signal dropped");
                let _ = self.events.send(WorkerEvent::QueueOverflow { signal_type, max });
                Err(err)
            }
        }
    }

    /// Snapshot taken between signals
    pub async fn state(&self) -> RuntimeResult<WorkerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Snapshot(tx))?;
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(RuntimeError::WorkerStopped(self.id.to_string())),
            Err(_) => Err(RuntimeError::Timeout(self.call_timeout.as_millis() as u64)),
        }
    }

    /// Current lifecycle status
    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Signals waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Receive worker events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Hold agent-directed signals in the queue; system signals still run
    pub fn pause(&self) -> RuntimeResult<()> {
        self.send(Control::Pause)
    }

    /// Resume processing held signals
    pub fn resume(&self) -> RuntimeResult<()> {
        self.send(Control::Resume)
    }

    /// Graceful stop: stopped event, children torn down, state frozen
    ///
    /// Stopping a worker that already exited succeeds.
    pub async fn stop(&self, reason: &str, timeout: Duration) -> RuntimeResult<()> {
        let (ack, done) = oneshot::channel();
        let stop = Control::Stop {
            reason: reason.to_string(),
            ack,
        };
        if self.send(stop).is_err() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, done).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RuntimeError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Abort the task without a graceful stop; supervisors see a crash
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(abort) = self.abort.lock().take() {
            abort.abort();
        }
    }

    /// Whether the task is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn send(&self, control: Control) -> RuntimeResult<()> {
        if !self.is_alive() {
            return Err(RuntimeError::WorkerStopped(self.id.to_string()));
        }
        self.control
            .send(control)
            .map_err(|_| RuntimeError::WorkerStopped(self.id.to_string()))
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Clears liveness and releases stranded callers however the task ends
struct AliveGuard {
    alive: Arc<AtomicBool>,
    queue: Arc<Mutex<SignalQueue>>,
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        let stranded = {
            let mut queue = self.queue.lock();
            self.alive.store(false, Ordering::SeqCst);
            queue.drain()
        };
        drop(stranded);
    }
}

/// A spawned worker: its handle plus the task's exit
pub struct RunningWorker {
    /// Address of the worker
    pub handle: WorkerHandle,
    join: JoinHandle<ExitReason>,
}

impl RunningWorker {
    /// Wait for the task to end; panics and aborts become crash reasons
    pub async fn wait(self) -> ExitReason {
        match self.join.await {
            Ok(reason) => reason,
            Err(err) if err.is_cancelled() => ExitReason::Killed,
            Err(err) => ExitReason::Crashed(err.to_string()),
        }
    }
}

// ========== Worker ==========

struct Failure {
    error: RuntimeError,
    context: Option<Value>,
}

impl From<RuntimeError> for Failure {
    fn from(error: RuntimeError) -> Self {
        Self {
            error,
            context: None,
        }
    }
}

enum StrategyCall {
    Cmd(Vec<Instruction>),
    Tick,
}

/// The task state of one agent
pub struct Worker {
    handle: WorkerHandle,
    agent: AgentState,
    router: Arc<dyn SignalRouter>,
    strategy: Arc<dyn Strategy>,
    catalog: Catalog,
    dispatcher: Arc<DispatchRouter>,
    config: WorkerConfig,
    persistence: Option<Persistence>,
    status: WorkerStatus,
    status_tx: watch::Sender<WorkerStatus>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    children: ChildSupervisor,
    timers: Timers,
    init_directives: Vec<Directive>,
    stop_request: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    _alive: AliveGuard,
}

impl Worker {
    /// Construct without spawning: load or create the agent, validate it,
    /// run the strategy's `init`, and leave `initializing`
    pub fn build(options: WorkerOptions) -> RuntimeResult<Self> {
        let WorkerOptions {
            id,
            module,
            agent_opts,
            catalog,
            dispatcher,
            config,
            persistence,
            initial_state,
        } = options;

        if id.trim().is_empty() {
            return Err(RuntimeError::Config("worker id must not be empty".into()));
        }
        if config.max_queue_size == 0 {
            return Err(RuntimeError::Config("max_queue_size must be at least 1".into()));
        }

        let thawed = match (initial_state, &persistence) {
            (Some(agent), _) => Some(agent),
            (None, Some(persistence)) => persistence.storage.thaw(&persistence.entity_kind, &id)?,
            (None, None) => None,
        };
        let mut agent = match thawed {
            Some(agent) if agent.id != id => {
                return Err(StorageError::Corrupt {
                    id,
                    detail: format!("stored agent has id '{}'", agent.id),
                }
                .into());
            }
            Some(agent) => {
                tracing::debug!(agent = %id, "agent thawed");
                agent
            }
            None => module.new_agent(&id, &agent_opts)?,
        };
        module.validate(&agent)?;

        let strategy = module.strategy();
        let init_directives = {
            let ctx = StrategyContext {
                catalog: &catalog,
                correlation_id: None,
                causation_id: None,
            };
            strategy.init(&mut agent, &ctx)?
        };

        let queue = Arc::new(Mutex::new(SignalQueue::new(config.max_queue_size)));
        let alive = Arc::new(AtomicBool::new(true));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Initializing);

        let handle = WorkerHandle {
            id: Arc::from(id.as_str()),
            instance: Uuid::new_v4(),
            queue: queue.clone(),
            wake: Arc::new(Notify::new()),
            control: control_tx.clone(),
            events,
            status: status_rx,
            alive: alive.clone(),
            abort: Arc::new(Mutex::new(None)),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        };
        let children = ChildSupervisor::new(
            id.clone(),
            catalog.clone(),
            dispatcher.clone(),
            config.clone(),
            control_tx,
        );

        let mut worker = Self {
            handle,
            agent,
            router: module.router(),
            strategy,
            catalog,
            dispatcher,
            config,
            persistence,
            status: WorkerStatus::Initializing,
            status_tx,
            control_rx,
            children,
            timers: Timers::default(),
            init_directives,
            stop_request: None,
            correlation_id: None,
            causation_id: None,
            _alive: AliveGuard { alive, queue },
        };
        worker.set_status(WorkerStatus::Idle);
        Ok(worker)
    }

    /// Build and spawn
    pub fn start(options: WorkerOptions) -> RuntimeResult<RunningWorker> {
        Ok(Self::build(options)?.spawn())
    }

    /// Handle of the worker, usable before it is spawned
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Agent as built
    pub fn agent(&self) -> &AgentState {
        &self.agent
    }

    /// Run the worker on the tokio runtime
    pub fn spawn(self) -> RunningWorker {
        let handle = self.handle.clone();
        let join = tokio::spawn(self.run());
        *handle.abort.lock() = Some(join.abort_handle());
        RunningWorker { handle, join }
    }

    async fn run(mut self) -> ExitReason {
        let agent_id = self.agent.id.clone();
        tracing::info!(agent = %agent_id, instance = %self.handle.instance, "worker started");
        let _ = self.handle.events.send(WorkerEvent::Started {
            agent: agent_id.clone(),
        });
        self.emit_runtime_event(EVENT_STARTED, json!({ "agent": agent_id }))
            .await;

        let init = std::mem::take(&mut self.init_directives);
        if !init.is_empty() {
            if let Err(err) = self.interpret(init).await {
                tracing::warn!(agent = %agent_id, error = %err, "init directives failed");
            }
            if let Some(reason) = self.stop_request.take() {
                return self.shutdown(ExitReason::from_reason(&reason)).await;
            }
        }

        let wake = self.handle.wake.clone();
        loop {
            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => {
                    if let Some(reason) = self.on_control(control).await {
                        return reason;
                    }
                }
                _ = wake.notified() => {
                    if let Some(reason) = self.drain().await {
                        return reason;
                    }
                }
            }
        }
    }

    async fn on_control(&mut self, control: Control) -> Option<ExitReason> {
        match control {
            Control::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Control::Pause => self.pause(),
            Control::Resume => self.resume(),
            Control::Stop { reason, ack } => {
                let exit = self.shutdown(ExitReason::from_reason(&reason)).await;
                let _ = ack.send(());
                return Some(exit);
            }
            Control::ChildExit {
                tag,
                instance,
                reason,
            } => {
                let outcome = self.children.on_exit(&tag, instance, &reason);
                if outcome != ChildExit::Untracked {
                    let restarted = outcome == ChildExit::Restarted;
                    tracing::info!(agent = %self.agent.id, %tag, %reason, restarted, "child exited");
                    let _ = self.handle.events.send(WorkerEvent::ChildExited {
                        tag,
                        reason,
                        restarted,
                    });
                }
            }
        }
        None
    }

    /// Process queued signals until the queue is empty (or holds only
    /// agent-directed signals while paused)
    async fn drain(&mut self) -> Option<ExitReason> {
        loop {
            while let Ok(control) = self.control_rx.try_recv() {
                if let Some(reason) = self.on_control(control).await {
                    return Some(reason);
                }
            }

            let next = {
                let mut queue = self.handle.queue.lock();
                if self.status == WorkerStatus::Paused {
                    queue.take_system()
                } else {
                    queue.pop()
                }
            };
            let pending = next?;
            if let Some(reason) = self.process(pending).await {
                return Some(reason);
            }
        }
    }

    async fn process(&mut self, pending: Pending) -> Option<ExitReason> {
        let Pending { signal, reply } = pending;
        match signal.class() {
            SignalClass::Event => {
                tracing::debug!(agent = %self.agent.id, signal_type = %signal.signal_type, "ignoring event signal");
                respond(reply, Ok(Value::Null));
                None
            }
            SignalClass::System => self.process_system(signal, reply).await,
            SignalClass::Command => {
                self.begin(&signal);
                let result = self.process_command(&signal).await;
                self.finish(&signal, reply, result).await
            }
        }
    }

    async fn process_system(&mut self, signal: Signal, reply: Option<Reply>) -> Option<ExitReason> {
        match signal.signal_type.as_str() {
            SYSTEM_PAUSE => {
                self.pause();
                respond(reply, Ok(json!({ "status": self.status })));
                None
            }
            SYSTEM_RESUME => {
                self.resume();
                respond(reply, Ok(json!({ "status": self.status })));
                None
            }
            SYSTEM_TICK => {
                self.begin(&signal);
                if !self.timers.take_tick(&signal.id) {
                    let err = RuntimeError::Invalid(format!(
                        "tick {} was not scheduled by this worker",
                        signal.id
                    ));
                    return self.finish(&signal, reply, Err(err.into())).await;
                }
                let paused = self.status == WorkerStatus::Paused;
                if !paused {
                    self.set_status(WorkerStatus::Running);
                }
                let result = self.execute(StrategyCall::Tick).await;
                if !paused && self.status == WorkerStatus::Running {
                    self.set_status(WorkerStatus::Idle);
                }
                self.finish(&signal, reply, result).await
            }
            SYSTEM_STOP => {
                let reason = signal
                    .data
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("normal")
                    .to_string();
                let exit = self.shutdown(ExitReason::from_reason(&reason)).await;
                respond(reply, Ok(Value::Null));
                Some(exit)
            }
            other => {
                let err = RuntimeError::Invalid(format!("unknown system signal '{other}'"));
                tracing::warn!(agent = %self.agent.id, error = %err, "system signal rejected");
                respond(reply, Err(err));
                None
            }
        }
    }

    fn begin(&mut self, signal: &Signal) {
        self.correlation_id = Some(signal.correlation().to_string());
        self.causation_id = Some(signal.id.to_string());
    }

    async fn finish(
        &mut self,
        signal: &Signal,
        reply: Option<Reply>,
        result: Result<Value, Failure>,
    ) -> Option<ExitReason> {
        match &result {
            Ok(value) => {
                tracing::debug!(agent = %self.agent.id, signal = %signal.id, signal_type = %signal.signal_type, "signal processed");
                let _ = self.handle.events.send(WorkerEvent::SignalProcessed {
                    signal: signal.id.clone(),
                    signal_type: signal.signal_type.clone(),
                });
                if reply.is_none() && signal.class() == SignalClass::Command {
                    let data = json!({ "signal_id": signal.id, "result": value });
                    self.emit_runtime_event(EVENT_RESULT, data).await;
                }
            }
            Err(failure) => self.report_failure(signal, failure).await,
        }
        respond(reply, result.map_err(|failure| failure.error));

        self.correlation_id = None;
        self.causation_id = None;
        match self.stop_request.take() {
            Some(reason) => Some(self.shutdown(ExitReason::from_reason(&reason)).await),
            None => None,
        }
    }

    async fn process_command(&mut self, signal: &Signal) -> Result<Value, Failure> {
        self.set_status(WorkerStatus::Planning);
        let router = &self.router;
        let agent = &self.agent;
        let routed = std::panic::catch_unwind(AssertUnwindSafe(|| router.route(agent, signal)))
            .unwrap_or_else(|panic| {
                Err(RuntimeError::Internal(format!(
                    "router panicked on '{}': {}",
                    signal.signal_type,
                    panic_message(panic.as_ref())
                )))
            });
        let instructions = match routed {
            Ok(instructions) => instructions,
            Err(err) => {
                self.set_status(WorkerStatus::Idle);
                return Err(err.into());
            }
        };
        self.set_status(WorkerStatus::Running);
        let result = self.execute(StrategyCall::Cmd(instructions)).await;
        if self.status == WorkerStatus::Running {
            self.set_status(WorkerStatus::Idle);
        }
        result
    }

    /// Strategy call, its directives, then any enqueued instructions
    async fn execute(&mut self, call: StrategyCall) -> Result<Value, Failure> {
        self.run_round(call).await?;

        let mut rounds = 0;
        while !self.agent.pending_instructions.is_empty() && self.stop_request.is_none() {
            if rounds >= self.config.max_instruction_rounds {
                let dropped = self.agent.take_pending().len();
                return Err(RuntimeError::Planning(format!(
                    "{dropped} instructions still pending after {rounds} rounds"
                ))
                .into());
            }
            rounds += 1;
            let pending = self.agent.take_pending();
            self.run_round(StrategyCall::Cmd(pending)).await?;
        }
        Ok(self.agent.result.clone())
    }

    async fn run_round(&mut self, call: StrategyCall) -> Result<(), Failure> {
        let directives = self.invoke(call)?;
        let outcome = self.interpret(directives).await?;
        match outcome.reported {
            Some((error, context)) => Err(Failure { error, context }),
            None => Ok(()),
        }
    }

    fn invoke(&mut self, call: StrategyCall) -> RuntimeResult<Vec<Directive>> {
        let ctx = StrategyContext {
            catalog: &self.catalog,
            correlation_id: self.correlation_id.as_deref(),
            causation_id: self.causation_id.as_deref(),
        };
        let strategy = &self.strategy;
        let agent = &mut self.agent;
        std::panic::catch_unwind(AssertUnwindSafe(|| match call {
            StrategyCall::Cmd(instructions) => strategy.cmd(agent, instructions, &ctx),
            StrategyCall::Tick => strategy.tick(agent, &ctx),
        }))
        .unwrap_or_else(|panic| {
            Err(RuntimeError::Internal(format!(
                "strategy '{}' panicked: {}",
                strategy.name(),
                panic_message(panic.as_ref())
            )))
        })
    }

    async fn interpret(&mut self, directives: Vec<Directive>) -> RuntimeResult<Outcome> {
        if directives.is_empty() {
            return Ok(Outcome::default());
        }
        let mut interpreter = Interpreter {
            agent: &mut self.agent,
            children: &mut self.children,
            timers: &mut self.timers,
            dispatcher: &self.dispatcher,
            catalog: &self.catalog,
            handle: &self.handle,
            default_dispatch: &self.config.default_dispatch,
            correlation_id: self.correlation_id.as_deref(),
            causation_id: self.causation_id.as_deref(),
        };
        let outcome = interpreter.run(directives).await?;
        if let Some(reason) = &outcome.stop {
            self.stop_request.get_or_insert_with(|| reason.clone());
        }
        Ok(outcome)
    }

    async fn report_failure(&mut self, signal: &Signal, failure: &Failure) {
        let kind = failure.error.kind();
        tracing::warn!(
            agent = %self.agent.id,
            signal = %signal.id,
            signal_type = %signal.signal_type,
            kind = kind.as_str(),
            error = %failure.error,
            "signal failed"
        );
        if matches!(self.status, WorkerStatus::Planning | WorkerStatus::Running) {
            self.set_status(WorkerStatus::Idle);
        }
        let _ = self.handle.events.send(WorkerEvent::SignalFailed {
            signal: signal.id.clone(),
            kind,
            message: failure.error.to_string(),
        });
        let data = json!({
            "kind": kind,
            "message": failure.error.to_string(),
            "signal_id": signal.id,
            "signal_type": signal.signal_type,
            "context": failure.context,
        });
        self.emit_runtime_event(EVENT_ERROR, data).await;
    }

    fn pause(&mut self) {
        match self.status {
            WorkerStatus::Paused => {}
            WorkerStatus::Idle => {
                // the table only reaches paused through running, so an idle
                // pause also reports an idle -> running transition
                self.set_status(WorkerStatus::Running);
                self.set_status(WorkerStatus::Paused);
            }
            _ => self.set_status(WorkerStatus::Paused),
        }
    }

    fn resume(&mut self) {
        if self.status == WorkerStatus::Paused {
            self.set_status(WorkerStatus::Running);
            self.set_status(WorkerStatus::Idle);
            self.handle.wake.notify_one();
        }
    }

    fn set_status(&mut self, to: WorkerStatus) {
        let from = self.status;
        match self.status.transition(to) {
            Ok(()) => {
                self.status_tx.send_replace(to);
                tracing::trace!(agent = %self.agent.id, %from, %to, "status transition");
                let _ = self.handle.events.send(WorkerEvent::Transition { from, to });
            }
            Err(err) => {
                tracing::debug!(agent = %self.agent.id, error = %err, "transition refused");
                let _ = self
                    .handle
                    .events
                    .send(WorkerEvent::InvalidTransition { from, to });
            }
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.agent.id.clone(),
            instance: self.handle.instance,
            status: self.status,
            agent: self.agent.clone(),
            queue_len: self.handle.queue_len(),
            children: self.children.tags(),
        }
    }

    /// Send a runtime event signal through the default route
    async fn emit_runtime_event(&self, signal_type: &str, data: Value) {
        let mut signal = Signal::new(signal_type, data).with_source(format!("/agent/{}", self.agent.id));
        signal.correlation_id = self.correlation_id.clone();
        signal.causation_id = self.causation_id.clone();
        if let Err(err) = self
            .dispatcher
            .dispatch(&signal, &self.config.default_dispatch)
            .await
        {
            tracing::warn!(agent = %self.agent.id, signal_type, error = %err, "runtime event not dispatched");
        }
    }

    /// Graceful stop; returns the exit reason for the task
    async fn shutdown(&mut self, reason: ExitReason) -> ExitReason {
        tracing::info!(agent = %self.agent.id, %reason, "worker stopping");
        self.timers.abort_all();

        self.emit_runtime_event(
            EVENT_STOPPED,
            json!({ "agent": self.agent.id, "reason": reason.to_string() }),
        )
        .await;

        self.children.shutdown_all().await;

        if let Some(persistence) = &self.persistence {
            match persistence
                .storage
                .freeze(&persistence.entity_kind, &self.agent.id, &self.agent)
            {
                Ok(()) => {
                    self.agent.dirty = false;
                    tracing::debug!(agent = %self.agent.id, "agent frozen");
                }
                Err(err) => {
                    tracing::error!(agent = %self.agent.id, error = %err, "failed to freeze agent");
                }
            }
        }

        self.release_stranded().await;

        let _ = self.handle.events.send(WorkerEvent::Stopped {
            reason: reason.clone(),
        });
        reason
    }

    /// Close the queue and fail everything still in it: callers get
    /// `WorkerStopped`, cast commands get an error event
    async fn release_stranded(&mut self) {
        let stranded = {
            let mut queue = self.handle.queue.lock();
            self.handle.alive.store(false, Ordering::SeqCst);
            queue.drain()
        };
        for Pending { signal, reply } in stranded {
            let error = RuntimeError::WorkerStopped(self.agent.id.clone());
            if reply.is_none() && signal.class() == SignalClass::Command {
                self.begin(&signal);
                self.report_failure(&signal, &error.clone().into()).await;
            }
            respond(reply, Err(error));
        }
        self.correlation_id = None;
        self.causation_id = None;
    }
}

fn respond(reply: Option<Reply>, result: RuntimeResult<Value>) {
    if let Some(reply) = reply {
        // the caller may have timed out
        let _ = reply.send(result);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::catalog::CatalogBuilder;
    use crate::runtime::module::AgentDefinition;
    use crate::runtime::signal::{DispatchAdapter, DispatchConfig};

    fn options(max_queue_size: usize) -> WorkerOptions {
        let catalog = CatalogBuilder::with_builtins().build();
        let module = Arc::new(AgentDefinition::new("kv").route("kv.set", "state.set"));
        let mut options = WorkerOptions::new("w1", module, catalog);
        options.config.max_queue_size = max_queue_size;
        options.config.default_dispatch = DispatchConfig::new(DispatchAdapter::Noop).into();
        options
    }

    #[test]
    fn test_build_leaves_initializing() {
        let worker = Worker::build(options(4)).unwrap();
        assert_eq!(worker.handle().status(), WorkerStatus::Idle);
        assert!(worker.handle().is_alive());
    }

    #[test]
    fn test_overflow_without_drain() {
        let worker = Worker::build(options(2)).unwrap();
        let handle = worker.handle().clone();
        let mut events = handle.subscribe();

        assert!(handle.cast(Signal::new("kv.set", json!({"a": 1}))).is_ok());
        assert!(handle.cast(Signal::new("kv.set", json!({"b": 2}))).is_ok());
        let err = handle.cast(Signal::new("kv.set", json!({"c": 3}))).unwrap_err();

        assert!(matches!(err, RuntimeError::QueueOverflow { max: 2 }));
        assert_eq!(handle.queue_len(), 2);
        assert!(matches!(events.try_recv(), Ok(WorkerEvent::QueueOverflow { max: 2, .. })));
    }

    #[test]
    fn test_dropped_worker_rejects_signals() {
        let worker = Worker::build(options(2)).unwrap();
        let handle = worker.handle().clone();
        drop(worker);
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.cast(Signal::new("kv.set", Value::Null)),
            Err(RuntimeError::WorkerStopped(_))
        ));
    }

    #[test]
    fn test_malformed_signal_rejected_at_enqueue() {
        let worker = Worker::build(options(2)).unwrap();
        let err = worker.handle().cast(Signal::new("bad..type", Value::Null)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(worker.handle().queue_len(), 0);
    }
}
