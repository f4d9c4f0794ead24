//! Integration tests for directive interpretation: child supervision,
//! scheduling, stop requests, enqueued instructions, and action registration.

use cadre::runtime::signal::{EVENT_STARTED, EVENT_STOPPED};
use cadre::runtime::{
    ActionContext, ActionOutput, AgentDefinition, AgentState, CatalogBuilder, ChildSpec, Direct,
    Directive, DirectiveError, DispatchAdapter, DispatchConfig, DispatchError, DispatchRouter,
    ErrorKind, ExitReason, FnAction, Fsm, FsmStatus, Instruction, RestartPolicy, RuntimeError,
    RuntimeResult, Signal, SignalBus, Strategy, StrategyContext, Worker, WorkerEvent,
    WorkerOptions,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

const SCRIPTS: &[&str] = &[
    "test.spawn",
    "test.spawn_flaky",
    "test.kill",
    "test.stop",
    "test.chain",
    "test.loop",
    "test.register",
    "test.deregister",
    "test.bad_delay",
    "test.quiet",
    "test.unreachable",
    "test.work",
];

/// Directives returned by the action of the same name
fn script(name: &str) -> Vec<Directive> {
    match name {
        "test.spawn" => vec![Directive::Spawn {
            spec: ChildSpec::new("echo").with_restart(RestartPolicy::Permanent),
            tag: Some("w1".into()),
        }],
        "test.spawn_flaky" => vec![Directive::Spawn {
            spec: ChildSpec::new("flaky").with_restart(RestartPolicy::Permanent),
            tag: Some("f1".into()),
        }],
        "test.kill" => vec![Directive::Kill { target: "w1".into() }],
        "test.stop" => vec![Directive::Stop { reason: "done".into() }],
        "test.chain" => {
            let mut params = Map::new();
            params.insert("chained".into(), json!(true));
            vec![Directive::enqueue("state.set", params)]
        }
        "test.loop" => vec![Directive::enqueue("test.loop", Map::new())],
        "test.register" => vec![Directive::RegisterAction {
            module: "state.delete".into(),
        }],
        "test.deregister" => vec![Directive::DeregisterAction {
            module: "state.set".into(),
        }],
        "test.bad_delay" => vec![Directive::Schedule {
            delay_ms: -1,
            message: Signal::new("test.never", Value::Null),
        }],
        "test.quiet" => vec![
            Directive::Emit {
                signal: Signal::new("test.hidden", Value::Null),
                dispatch: Some(DispatchConfig::new(DispatchAdapter::Noop).into()),
            },
            Directive::emit(Signal::new("test.visible", Value::Null)),
        ],
        "test.unreachable" => vec![Directive::Emit {
            signal: Signal::new("test.webhook", Value::Null),
            dispatch: Some(DispatchConfig::new(DispatchAdapter::Http).into()),
        }],
        _ => Vec::new(),
    }
}

/// Stops itself as soon as it starts
struct StopOnStart;

impl Strategy for StopOnStart {
    fn name(&self) -> &str {
        "stop_on_start"
    }

    fn init(&self, _agent: &mut AgentState, _ctx: &StrategyContext<'_>) -> RuntimeResult<Vec<Directive>> {
        Ok(vec![Directive::Stop {
            reason: "done".into(),
        }])
    }

    fn cmd(
        &self,
        agent: &mut AgentState,
        instructions: Vec<Instruction>,
        ctx: &StrategyContext<'_>,
    ) -> RuntimeResult<Vec<Directive>> {
        Direct.cmd(agent, instructions, ctx)
    }
}

fn options(id: &str, fsm: bool) -> (WorkerOptions, SignalBus) {
    let catalog = CatalogBuilder::with_builtins();
    catalog
        .register_module(Arc::new(AgentDefinition::new("echo")))
        .register_module(Arc::new(
            AgentDefinition::new("flaky").with_strategy(Arc::new(StopOnStart)),
        ));

    let mut module = AgentDefinition::new("script").action("state.set");
    for &name in SCRIPTS {
        catalog.register_action(Arc::new(FnAction::new(
            name,
            move |_params: &Map<String, Value>, _ctx: ActionContext<'_>| {
                let output = script(name)
                    .into_iter()
                    .fold(ActionOutput::default(), |output, directive| output.with_effect(directive));
                Ok(output)
            },
        )));
        module = module.route(name, name);
    }
    if fsm {
        module = module.with_strategy(Arc::new(Fsm::with_reset_after(100)));
    }

    let bus = SignalBus::new(256);
    let router = DispatchRouter::with_defaults().with_adapter(DispatchAdapter::Bus, Arc::new(bus.clone()));
    let mut options = WorkerOptions::new(id, Arc::new(module), catalog.build());
    options.dispatcher = Arc::new(router);
    options.config.default_dispatch = DispatchConfig::new(DispatchAdapter::Bus).into();
    options.config.max_instruction_rounds = 3;
    options.config.max_child_restarts = 2;
    (options, bus)
}

async fn next_matching(
    rx: &mut broadcast::Receiver<Signal>,
    matches: impl Fn(&Signal) -> bool,
) -> Signal {
    tokio::time::timeout(WAIT, async {
        loop {
            let signal = rx.recv().await.unwrap();
            if matches(&signal) {
                return signal;
            }
        }
    })
    .await
    .unwrap()
}

fn lifecycle(signal_type: &'static str, agent: &'static str) -> impl Fn(&Signal) -> bool {
    move |signal| signal.signal_type == signal_type && signal.data["agent"] == json!(agent)
}

fn cmd(signal_type: &str) -> Signal {
    Signal::new(signal_type, Value::Null)
}

#[tokio::test]
async fn test_spawn_and_kill_child() {
    let (options, bus) = options("p1", false);
    let mut rx = bus.subscribe();
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.spawn"), WAIT).await.unwrap();
    next_matching(&mut rx, lifecycle(EVENT_STARTED, "p1/w1")).await;
    assert_eq!(worker.handle.state().await.unwrap().children, vec!["w1"]);

    let err = worker.handle.call(cmd("test.spawn"), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Directive(DirectiveError::DuplicateTag(ref tag)) if tag == "w1"
    ));

    worker.handle.call(cmd("test.kill"), WAIT).await.unwrap();
    let stopped = next_matching(&mut rx, lifecycle(EVENT_STOPPED, "p1/w1")).await;
    assert_eq!(stopped.data["reason"], json!("shutdown: killed"));
    // killed children are not restarted, even when permanent
    assert!(worker.handle.state().await.unwrap().children.is_empty());
}

#[tokio::test]
async fn test_exiting_child_restarts_until_limit() {
    let (options, _bus) = options("p12", false);
    let worker = Worker::start(options).unwrap();
    let mut events = worker.handle.subscribe();

    worker.handle.call(cmd("test.spawn_flaky"), WAIT).await.unwrap();
    let mut restarts = Vec::new();
    let finished = tokio::time::timeout(WAIT, async {
        loop {
            if let WorkerEvent::ChildExited {
                tag,
                reason,
                restarted,
            } = events.recv().await.unwrap()
            {
                assert_eq!(tag, "f1");
                assert_eq!(reason, ExitReason::Shutdown("done".into()));
                restarts.push(restarted);
                if !restarted {
                    return;
                }
            }
        }
    })
    .await;

    assert!(finished.is_ok());
    assert_eq!(restarts, vec![true, true, false]);
    assert!(worker.handle.state().await.unwrap().children.is_empty());
}

#[tokio::test]
async fn test_kill_unknown_child_is_not_found() {
    let (options, _bus) = options("p2", false);
    let worker = Worker::start(options).unwrap();

    let err = worker.handle.call(cmd("test.kill"), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Directive(DirectiveError::NotFound(ref target)) if target == "w1"
    ));
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(worker.handle.is_alive());
}

#[tokio::test]
async fn test_stopping_parent_stops_children() {
    let (options, bus) = options("p3", false);
    let mut rx = bus.subscribe();
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.spawn"), WAIT).await.unwrap();
    worker.handle.stop("shutdown", WAIT).await.unwrap();
    next_matching(&mut rx, lifecycle(EVENT_STOPPED, "p3/w1")).await;
    assert_eq!(worker.wait().await, ExitReason::Shutdown("shutdown".into()));
}

#[tokio::test]
async fn test_stop_directive_ends_worker_after_reply() {
    let (options, _bus) = options("p4", false);
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.stop"), WAIT).await.unwrap();
    assert_eq!(worker.wait().await, ExitReason::Shutdown("done".into()));
}

#[tokio::test]
async fn test_enqueued_instruction_runs_in_same_signal() {
    let (options, _bus) = options("p5", false);
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.chain"), WAIT).await.unwrap();
    let snapshot = worker.handle.state().await.unwrap();
    assert_eq!(snapshot.agent.state["chained"], json!(true));
    assert!(snapshot.agent.pending_instructions.is_empty());
}

#[tokio::test]
async fn test_endless_enqueue_hits_round_limit() {
    let (options, _bus) = options("p6", false);
    let worker = Worker::start(options).unwrap();

    let err = worker.handle.call(cmd("test.loop"), WAIT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert!(worker.handle.is_alive());
}

#[tokio::test]
async fn test_register_and_deregister_actions() {
    let (options, _bus) = options("p7", false);
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.register"), WAIT).await.unwrap();
    worker.handle.call(cmd("test.deregister"), WAIT).await.unwrap();
    let actions = worker.handle.state().await.unwrap().agent.actions;
    assert!(actions.contains("state.delete"));
    assert!(!actions.contains("state.set"));

    // the enqueued state.set is no longer registered
    let err = worker.handle.call(cmd("test.chain"), WAIT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[tokio::test]
async fn test_negative_delay_rejected() {
    let (options, _bus) = options("p8", false);
    let worker = Worker::start(options).unwrap();

    let err = worker.handle.call(cmd("test.bad_delay"), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Directive(DirectiveError::InvalidDelay(-1))
    ));
}

#[tokio::test]
async fn test_explicit_dispatch_overrides_default() {
    let (options, bus) = options("p9", false);
    let mut rx = bus.subscribe();
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.quiet"), WAIT).await.unwrap();
    let first = next_matching(&mut rx, |signal| signal.signal_type.starts_with("test.")).await;
    assert_eq!(first.signal_type, "test.visible");
}

#[tokio::test]
async fn test_missing_adapter_fails_signal() {
    let (options, _bus) = options("p10", false);
    let worker = Worker::start(options).unwrap();

    let err = worker.handle.call(cmd("test.unreachable"), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Dispatch(DispatchError::AdapterUnavailable(ref adapter)) if adapter == "http"
    ));
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[tokio::test]
async fn test_fsm_resets_after_scheduled_tick() {
    let (options, _bus) = options("p11", true);
    let worker = Worker::start(options).unwrap();

    worker.handle.call(cmd("test.work"), WAIT).await.unwrap();
    let agent = worker.handle.state().await.unwrap().agent;
    assert_eq!(Fsm::status(&agent), Some(FsmStatus::Completed));

    let reset = tokio::time::timeout(WAIT, async {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let agent = worker.handle.state().await.unwrap().agent;
            if Fsm::status(&agent) == Some(FsmStatus::Idle) {
                return;
            }
        }
    })
    .await;
    assert!(reset.is_ok());
}
