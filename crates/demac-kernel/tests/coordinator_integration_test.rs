//! Integration tests for the coordinator round barrier.
//!
//! Each test spawns a real acton runtime and a session over `EchoEnv`, a
//! scripted environment that records every batch it receives and echoes
//! the submitted action and its own call count back in the observation:
//!
//! - step response observation: `[action, call_index]`
//! - reset response observation: `[-1, call_index]`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use acton_reactive::prelude::*;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use demac_kernel::{
    ActionValue, AgentChannel, AgentEnvWrapper, AgentId, CoordinatorConfig, CoordinatorError,
    EnvironmentAdapter, Info, Phase, Request, RequestKind, Response, RoundComplete, RoundOutcome,
    RoundSummary, Session, Space,
};

/// Shared view into what the environment saw.
#[derive(Default, Clone)]
struct Probe {
    batches: Arc<Mutex<Vec<BTreeMap<AgentId, Request>>>>,
    fail_next: Arc<AtomicBool>,
    panic_next: Arc<AtomicBool>,
    drop_key_next: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

impl Probe {
    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn last_batch(&self) -> BTreeMap<AgentId, Request> {
        self.batches.lock().unwrap().last().cloned().unwrap()
    }
}

struct EchoEnv {
    probe: Probe,
    declared: Option<Vec<AgentId>>,
    calls: u64,
}

impl EnvironmentAdapter for EchoEnv {
    fn batch_apply(
        &mut self,
        batch: &BTreeMap<AgentId, Request>,
    ) -> anyhow::Result<BTreeMap<AgentId, Response>> {
        self.probe.batches.lock().unwrap().push(batch.clone());
        let call = self.calls as f64;
        self.calls += 1;

        if self.probe.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("physics exploded");
        }
        if self.probe.panic_next.swap(false, Ordering::SeqCst) {
            let empty: Vec<f64> = Vec::new();
            let _ = empty[3];
        }

        let mut responses: BTreeMap<AgentId, Response> = batch
            .iter()
            .map(|(agent, request)| {
                let response = match request {
                    Request::Reset => Response::Reset {
                        observation: vec![-1.0, call],
                    },
                    Request::Step { action } => Response::Step {
                        observation: vec![action.as_discrete().unwrap_or(0) as f64, call],
                        reward: 1.0,
                        done: false,
                        info: Info::new(),
                    },
                };
                (agent.clone(), response)
            })
            .collect();

        if self.probe.drop_key_next.swap(false, Ordering::SeqCst) {
            let first = responses.keys().next().cloned();
            if let Some(agent) = first {
                responses.remove(&agent);
            }
        }

        Ok(responses)
    }

    fn agent_ids(&self) -> Option<Vec<AgentId>> {
        self.declared.clone()
    }

    fn action_space(&self, _agent: &AgentId) -> Option<Space> {
        Some(Space::Discrete { n: 3 })
    }

    fn render(&self) -> Option<String> {
        Some(format!("calls={}", self.calls))
    }

    fn close(&mut self) {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn open_session(
    runtime: &mut ActorRuntime,
    config: CoordinatorConfig,
    declared: Option<Vec<AgentId>>,
) -> (Session, Probe) {
    let probe = Probe::default();
    let env = EchoEnv {
        probe: probe.clone(),
        declared,
        calls: 0,
    };
    let session = Session::spawn(config, Box::new(env), runtime).await;
    (session, probe)
}

async fn register_all(session: &Session, names: &[&str]) -> Vec<AgentChannel> {
    let mut channels = Vec::new();
    for name in names {
        channels.push(session.register(*name).await.unwrap());
    }
    channels
}

/// Spawn an observer actor that forwards RoundComplete summaries to a channel.
async fn spawn_round_observer(
    runtime: &mut ActorRuntime,
    tx: mpsc::Sender<RoundSummary>,
) -> ActorHandle {
    #[derive(Default, Clone, Debug)]
    struct State {
        tx: Option<mpsc::Sender<RoundSummary>>,
    }

    let mut actor = runtime.new_actor_with_name::<State>("TestRoundObserver".to_string());
    actor.model.tx = Some(tx);

    actor.act_on::<RoundComplete>(|actor, context| {
        let summary = context.message().summary.clone();
        let tx = actor.model.tx.clone();
        Reply::pending(async move {
            if let Some(tx) = tx {
                let _ = tx.send(summary).await;
            }
        })
    });

    actor.start().await
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_barrier_waits_for_every_registered_agent() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let mut channels = register_all(&session, &["a", "b", "c"]).await;
    let mut c = channels.pop().unwrap();

    let mut early = Vec::new();
    for (i, mut channel) in channels.into_iter().enumerate() {
        early.push(tokio::spawn(async move {
            channel.request(Request::step(i as i64)).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.pending, vec![AgentId::from("a"), AgentId::from("b")]);
    assert_eq!(snapshot.phase, Phase::AwaitingRequests);
    assert!(snapshot.started);
    assert_eq!(probe.batch_count(), 0, "No partial dispatch");
    assert!(early.iter().all(|task| !task.is_finished()));

    let response = timeout(WAIT, c.request(Request::step(2))).await.unwrap().unwrap();
    assert_eq!(response.kind(), RequestKind::Step);
    assert_eq!(response.observation()[0], 2.0);

    for (i, task) in early.into_iter().enumerate() {
        let response = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(response.observation()[0], i as f64);
    }

    assert_eq!(probe.batch_count(), 1);
    assert_eq!(probe.last_batch().len(), 3);
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.round, 1);
    assert!(snapshot.pending.is_empty());

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_single_reset_forces_whole_round_to_reset() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    register_all(&session, &["A", "B", "C"]).await;

    let submissions = [
        ("A", Request::step(0)),
        ("B", Request::Reset),
        ("C", Request::step(2)),
    ];
    let tasks: Vec<_> = submissions
        .into_iter()
        .map(|(agent, request)| {
            let session = session.clone();
            tokio::spawn(async move { session.submit(agent, request).await })
        })
        .collect();

    for task in tasks {
        let response = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(response.kind(), RequestKind::Reset);
        assert!(matches!(response, Response::Reset { .. }));
    }

    let batch = probe.last_batch();
    assert_eq!(batch.len(), 3);
    assert!(batch.values().all(|r| *r == Request::Reset));

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_submission_leaves_pending_unchanged() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let mut channels = register_all(&session, &["a", "b"]).await;
    let mut b = channels.pop().unwrap();
    let mut a = channels.pop().unwrap();

    a.send(Request::step(1)).await.unwrap();

    // Caught by the channel itself
    let err = a.send(Request::step(2)).await.unwrap_err();
    assert_eq!(err, CoordinatorError::DuplicateSubmission(AgentId::from("a")));

    // Caught by the coordinator
    let err = session.submit("a", Request::Reset).await.unwrap_err();
    assert_eq!(err, CoordinatorError::DuplicateSubmission(AgentId::from("a")));

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.pending, vec![AgentId::from("a")]);

    b.send(Request::step(0)).await.unwrap();
    let response = timeout(WAIT, a.receive()).await.unwrap().unwrap();
    assert_eq!(response.kind(), RequestKind::Step, "The rejected reset never joined");
    assert_eq!(response.observation()[0], 1.0);
    timeout(WAIT, b.receive()).await.unwrap().unwrap();

    assert_eq!(probe.batch_count(), 1);
    assert_eq!(probe.last_batch()[&AgentId::from("a")], Request::step(1));

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_responses_never_leak_across_rounds() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, _probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let channels = register_all(&session, &["a", "b", "c"]).await;

    let tasks: Vec<_> = channels
        .into_iter()
        .enumerate()
        .map(|(i, mut channel)| {
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for seq in 0..10i64 {
                    // Stagger agents so arrival order differs every round
                    if (seq + i as i64) % 3 == 0 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    let response = channel.request(Request::step(seq)).await.unwrap();
                    seen.push((seq, response.observation().clone()));
                }
                seen
            })
        })
        .collect();

    for task in tasks {
        let seen = timeout(WAIT, task).await.unwrap().unwrap();
        for (seq, observation) in seen {
            assert_eq!(observation[0], seq as f64, "Response paired with its own request");
            assert_eq!(observation[1], seq as f64, "Round k answers request k");
        }
    }

    assert_eq!(session.snapshot().await.unwrap().round, 10);

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_adapter_failure_reaches_every_waiter_then_recovers() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    register_all(&session, &["a", "b"]).await;
    probe.fail_next.store(true, Ordering::SeqCst);

    let (first, second) = tokio::join!(
        session.submit("a", Request::step(0)),
        session.submit("b", Request::step(1)),
    );
    for result in [first, second] {
        match result.unwrap_err() {
            CoordinatorError::AdapterFailure { round, message } => {
                assert_eq!(round, 0);
                assert!(message.contains("physics exploded"));
            }
            other => panic!("expected AdapterFailure, got {other:?}"),
        }
    }

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::AwaitingRequests);
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.round, 1);

    let (first, second) = tokio::join!(
        session.submit("a", Request::step(0)),
        session.submit("b", Request::step(1)),
    );
    assert_eq!(first.unwrap().kind(), RequestKind::Step);
    assert_eq!(second.unwrap().kind(), RequestKind::Step);

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_adapter_panic_aborts_round_then_recovers() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    register_all(&session, &["a", "b"]).await;

    let (tx, mut rx) = mpsc::channel(8);
    let observer = spawn_round_observer(&mut runtime, tx).await;
    session.observe_rounds(observer).await;
    probe.panic_next.store(true, Ordering::SeqCst);

    let (first, second) = tokio::join!(
        session.submit("a", Request::step(0)),
        session.submit("b", Request::step(1)),
    );
    for result in [first, second] {
        match result.unwrap_err() {
            CoordinatorError::AdapterFailure { round, message } => {
                assert_eq!(round, 0);
                assert!(message.contains("panicked"), "{message}");
            }
            other => panic!("expected AdapterFailure, got {other:?}"),
        }
    }

    let summary = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(summary.round, 0);
    assert!(matches!(summary.outcome, RoundOutcome::Aborted { .. }));

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::AwaitingRequests);
    assert_eq!(snapshot.round, 1);

    let (first, second) = tokio::join!(
        session.submit("a", Request::step(4)),
        session.submit("b", Request::step(5)),
    );
    assert_eq!(first.unwrap().observation()[0], 4.0);
    assert_eq!(second.unwrap().observation()[0], 5.0);

    let summary = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(summary.round, 1);
    assert!(summary.is_delivered());

    // The environment is still reachable after the panic
    assert_eq!(session.render().await, Some("calls=2".to_string()));
    assert_eq!(probe.batch_count(), 2);

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_single_agent_dispatches_every_submit() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let mut solo = register_all(&session, &["solo"]).await.pop().unwrap();

    for seq in 0..5i64 {
        let response = timeout(WAIT, solo.request(Request::step(seq)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.observation()[0], seq as f64);
        assert_eq!(response.observation()[1], seq as f64);
        assert_eq!(probe.batch_count(), (seq + 1) as usize);
        assert_eq!(probe.last_batch().len(), 1);
    }

    let response = timeout(WAIT, solo.request(Request::Reset)).await.unwrap().unwrap();
    assert_eq!(response.kind(), RequestKind::Reset);

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.round, 6);
    assert!(snapshot.pending.is_empty());

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_many_agents_fan_in_to_one_batch_per_round() {
    const AGENTS: usize = 16;
    const ROUNDS: i64 = 5;

    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let names: Vec<String> = (0..AGENTS).map(|i| format!("agent-{i:02}")).collect();
    for name in &names {
        session.register(name.as_str()).await.unwrap();
    }

    let tasks: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let session = session.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let mut responses = Vec::new();
                for seq in 0..ROUNDS {
                    let action = seq * 100 + i as i64;
                    let response = session.submit(name.as_str(), Request::step(action)).await;
                    responses.push((action, response.unwrap()));
                }
                responses
            })
        })
        .collect();

    for task in tasks {
        let responses = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(responses.len(), ROUNDS as usize, "One response per request");
        for (round, (action, response)) in responses.into_iter().enumerate() {
            assert_eq!(response.observation()[0], action as f64);
            assert_eq!(response.observation()[1], round as f64);
        }
    }

    let batches = probe.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), ROUNDS as usize);
    for batch in &batches {
        assert_eq!(batch.len(), AGENTS);
    }
    assert_eq!(session.snapshot().await.unwrap().round, ROUNDS as u64);

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_missing_response_key_aborts_round() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    register_all(&session, &["a", "b"]).await;
    probe.drop_key_next.store(true, Ordering::SeqCst);

    let (first, second) = tokio::join!(
        session.submit("a", Request::step(0)),
        session.submit("b", Request::step(0)),
    );

    for result in [first, second] {
        let err = result.unwrap_err();
        assert!(matches!(err, CoordinatorError::AdapterMismatch { round: 0, .. }));
        assert!(err.is_round_level());
    }

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_barrier_timeout_clears_round() {
    let mut runtime = ActonApp::launch_async().await;
    let config = CoordinatorConfig::default().with_barrier_timeout(Duration::from_millis(100));
    let (session, probe) = open_session(&mut runtime, config, None).await;
    register_all(&session, &["fast", "slow"]).await;

    let err = timeout(WAIT, session.submit("fast", Request::step(0)))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err,
        CoordinatorError::BarrierTimeout {
            round: 0,
            timeout_ms: 100
        }
    );
    assert_eq!(probe.batch_count(), 0);

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.round, 1);
    assert!(snapshot.pending.is_empty());

    // A full round afterwards goes through, and the old deadline stays stale
    let (first, second) = tokio::join!(
        session.submit("fast", Request::step(0)),
        session.submit("slow", Request::step(1)),
    );
    assert!(first.is_ok());
    assert!(second.is_ok());

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_close_releases_waiters_and_rejects_later_calls() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let mut channels = register_all(&session, &["a", "b"]).await;
    let mut a = channels.remove(0);

    a.send(Request::step(0)).await.unwrap();
    session.close().await;

    let err = timeout(WAIT, a.receive()).await.unwrap().unwrap_err();
    assert_eq!(err, CoordinatorError::SessionClosed);

    assert_eq!(
        session.submit("b", Request::step(0)).await.unwrap_err(),
        CoordinatorError::SessionClosed
    );
    assert_eq!(
        session.register("c").await.unwrap_err(),
        CoordinatorError::SessionClosed
    );

    session.close().await;
    assert_eq!(probe.closed.load(Ordering::SeqCst), 1, "Environment closed once");

    let snapshot = session.snapshot().await.unwrap();
    assert!(snapshot.closed);
    assert_eq!(snapshot.phase, Phase::Closed);

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_registration_rules() {
    let mut runtime = ActonApp::launch_async().await;
    let declared = Some(vec![AgentId::from("0"), AgentId::from("1")]);
    let (session, _probe) =
        open_session(&mut runtime, CoordinatorConfig::default(), declared).await;

    session.register(0usize).await.unwrap();
    assert_eq!(
        session.register(0usize).await.unwrap_err(),
        CoordinatorError::AlreadyRegistered(AgentId::from("0"))
    );
    assert_eq!(
        session.register("7").await.unwrap_err(),
        CoordinatorError::UnknownToEnvironment(AgentId::from("7"))
    );
    assert_eq!(
        session.submit("1", Request::Reset).await.unwrap_err(),
        CoordinatorError::UnregisteredAgent(AgentId::from("1"))
    );

    // A one-agent session dispatches on every submission
    let response = session.submit("0", Request::Reset).await.unwrap();
    assert_eq!(response.kind(), RequestKind::Reset);

    assert_eq!(
        session.register(1usize).await.unwrap_err(),
        CoordinatorError::SessionStarted
    );

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_round_observer_receives_summaries() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    register_all(&session, &["a", "b"]).await;

    let (tx, mut rx) = mpsc::channel(8);
    let observer = spawn_round_observer(&mut runtime, tx).await;
    session.observe_rounds(observer).await;

    let _ = tokio::join!(
        session.submit("a", Request::Reset),
        session.submit("b", Request::step(1)),
    );
    probe.fail_next.store(true, Ordering::SeqCst);
    let _ = tokio::join!(
        session.submit("a", Request::step(0)),
        session.submit("b", Request::step(1)),
    );

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.round, 0);
    assert_eq!(first.kind, Some(RequestKind::Reset));
    assert_eq!(first.agents, vec![AgentId::from("a"), AgentId::from("b")]);
    assert!(first.is_delivered());

    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.round, 1);
    assert!(matches!(second.outcome, RoundOutcome::Aborted { .. }));

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_wrapper_reports_overridden_steps() {
    let mut runtime = ActonApp::launch_async().await;
    let (session, _probe) = open_session(&mut runtime, CoordinatorConfig::default(), None).await;
    let mut channels = register_all(&session, &["stepper", "resetter"]).await;
    let resetter = channels.pop().unwrap();
    let mut wrapper = AgentEnvWrapper::new(channels.pop().unwrap()).with_transcript();
    let mut other = AgentEnvWrapper::new(resetter);

    let (obs, other_obs) = tokio::join!(wrapper.reset(), other.reset());
    assert_eq!(obs.unwrap()[0], -1.0);
    assert_eq!(other_obs.unwrap()[0], -1.0);

    let (stepped, _) = tokio::join!(
        wrapper.step(ActionValue::Discrete(2)),
        other.step(ActionValue::Discrete(0)),
    );
    let stepped = stepped.unwrap();
    assert!(!stepped.overridden);
    assert_eq!(stepped.reward, 1.0);
    assert_eq!(wrapper.episode_stats().current_length, 1);

    let (overridden, _) = tokio::join!(wrapper.step(ActionValue::Discrete(2)), other.reset());
    let overridden = overridden.unwrap();
    assert!(overridden.overridden);
    assert_eq!(overridden.reward, 0.0);
    assert_eq!(wrapper.episode_stats().completed.len(), 1);
    assert!(wrapper.episode_stats().completed[0].interrupted);

    assert_eq!(wrapper.action_space().await, Some(Space::Discrete { n: 3 }));
    assert_eq!(wrapper.render().await, Some("calls=3".to_string()));

    let transcript = wrapper.take_transcript();
    assert_eq!(transcript.len(), 6);
    assert_eq!(transcript[4].kind, RequestKind::Step);
    assert_eq!(transcript[5].kind, RequestKind::Reset);

    runtime.shutdown_all().await.unwrap();
}
