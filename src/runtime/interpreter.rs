//! Directive interpreter
//!
//! The only place directives become effects. Directives are validated and
//! applied one at a time, in the order the strategy produced them;
//! interpretation stops at the first directive that fails. Effects already
//! applied stay applied.

use futures::FutureExt;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::agent::AgentState;
use super::catalog::Catalog;
use super::children::ChildSupervisor;
use super::directive::{Directive, Instruction};
use super::dispatch::DispatchRouter;
use super::error::{DirectiveError, RuntimeError, RuntimeResult};
use super::signal::{Dispatch, SYSTEM_TICK, Signal, SignalId};
use super::worker::WorkerHandle;

/// Delayed self-deliveries owned by a worker
///
/// Ticks scheduled here are the only ones the worker hands to its strategy.
#[derive(Debug, Default)]
pub struct Timers {
    handles: Vec<JoinHandle<()>>,
    ticks: HashSet<SignalId>,
}

impl Timers {
    /// Track a timer task
    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|timer| !timer.is_finished());
        self.handles.push(handle);
    }

    /// Expect a tick delivery with this id
    pub fn expect_tick(&mut self, id: SignalId) {
        self.ticks.insert(id);
    }

    /// Consume an expected tick; false for ticks nobody scheduled
    pub fn take_tick(&mut self, id: &SignalId) -> bool {
        self.ticks.remove(id)
    }

    /// Cancel every timer
    pub fn abort_all(&mut self) {
        for timer in self.handles.drain(..) {
            timer.abort();
        }
        self.ticks.clear();
    }
}

/// Result of interpreting one batch
#[derive(Debug, Default)]
pub struct Outcome {
    /// Directives applied
    pub applied: usize,
    /// Stop requested, with its reason
    pub stop: Option<String>,
    /// First failure reported through an `Error` directive
    pub reported: Option<(RuntimeError, Option<Value>)>,
}

/// Everything the interpreter may touch while applying effects
pub struct Interpreter<'a> {
    /// The worker's agent
    pub agent: &'a mut AgentState,
    /// The worker's children
    pub children: &'a mut ChildSupervisor,
    /// Scheduled self-deliveries
    pub timers: &'a mut Timers,
    /// Outbound boundary
    pub dispatcher: &'a DispatchRouter,
    /// Action and module resolution
    pub catalog: &'a Catalog,
    /// Handle back to the worker, for scheduled deliveries
    pub handle: &'a WorkerHandle,
    /// Route used when neither the directive nor the signal names one
    pub default_dispatch: &'a Dispatch,
    /// Correlation id of the signal being processed
    pub correlation_id: Option<&'a str>,
    /// Id of the signal being processed
    pub causation_id: Option<&'a str>,
}

impl Interpreter<'_> {
    /// Apply `directives` in order, halting at the first failure
    pub async fn run(&mut self, directives: Vec<Directive>) -> RuntimeResult<Outcome> {
        let mut outcome = Outcome::default();
        for directive in directives {
            let name = directive.name();
            directive.validate(self.catalog)?;
            if let Directive::Kill { target } = &directive {
                if !self.children.is_live(target) {
                    return Err(DirectiveError::NotFound(target.clone()).into());
                }
            }

            let applied = AssertUnwindSafe(self.apply(directive, &mut outcome))
                .catch_unwind()
                .await;
            match applied {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RuntimeError::Internal(format!(
                        "panic while applying {name} directive"
                    )));
                }
            }
            outcome.applied += 1;
            tracing::trace!(agent = %self.agent.id, directive = name, "directive applied");
        }
        Ok(outcome)
    }

    async fn apply(&mut self, directive: Directive, outcome: &mut Outcome) -> RuntimeResult<()> {
        match directive {
            Directive::Emit { signal, dispatch } => {
                let signal = self.stamp(signal);
                let route = dispatch
                    .or_else(|| signal.dispatch.clone())
                    .unwrap_or_else(|| self.default_dispatch.clone());
                self.dispatcher.dispatch(&signal, &route).await?;
            }
            Directive::Spawn { spec, tag } => {
                self.children.spawn(spec, tag)?;
            }
            Directive::Kill { target } => {
                self.children.kill(&target).await?;
            }
            Directive::Schedule { delay_ms, message } => {
                let message = self.stamp(message);
                if message.signal_type == SYSTEM_TICK {
                    self.timers.expect_tick(message.id.clone());
                }
                let handle = self.handle.clone();
                let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0));
                self.timers.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = handle.cast(message) {
                        tracing::warn!(agent = %handle.id(), error = %err, "scheduled signal not delivered");
                    }
                }));
            }
            Directive::Stop { reason } => {
                outcome.stop.get_or_insert(reason);
            }
            Directive::Enqueue {
                action,
                params,
                context,
                opts,
            } => {
                let action = action.ok_or(DirectiveError::InvalidAction)?;
                self.agent.pending_instructions.push_back(Instruction {
                    action,
                    params,
                    context,
                    opts,
                });
                self.agent.dirty = true;
            }
            Directive::RegisterAction { module } => {
                self.agent.register_action(&module);
            }
            Directive::DeregisterAction { module } => {
                self.agent.deregister_action(&module);
            }
            Directive::Error { error, context } => {
                tracing::debug!(agent = %self.agent.id, error = %error, "failure reported by strategy");
                if outcome.reported.is_none() {
                    outcome.reported = Some((error, context));
                }
            }
        }
        Ok(())
    }

    /// Carry the current causal chain onto an outgoing signal
    fn stamp(&self, mut signal: Signal) -> Signal {
        if signal.correlation_id.is_none() {
            signal.correlation_id = self.correlation_id.map(str::to_string);
        }
        if signal.causation_id.is_none() {
            signal.causation_id = self.causation_id.map(str::to_string);
        }
        signal
    }
}
