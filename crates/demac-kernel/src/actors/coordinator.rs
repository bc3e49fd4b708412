//! Coordinator: the round barrier and demultiplexer behind a session.
//!
//! The actor's mailbox is the only place the pending set and the round
//! state machine are touched, so every register, submit, dispatch, and
//! distribute step is serialized without a lock:
//!
//! ```text
//! SubmitRequest → Coordinator (buffers, AWAITING_REQUESTS)
//!   └─ last registered agent arrives → ROUND_READY
//!       ├─ resolve BatchKind, build batch → DISPATCHING
//!       ├─ EnvironmentAdapter::batch_apply (synchronous)
//!       ├─ demultiplex replies → DISTRIBUTING
//!       └─ RoundComplete → round observer, back to AWAITING_REQUESTS
//! ```

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use acton_reactive::prelude::*;
use dashmap::DashMap;
use mti::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::agent::{AgentId, BatchKind, Request, RequestKind, Response};
use crate::config::CoordinatorConfig;
use crate::environment::{EnvironmentAdapter, build_batch, check_response_keys};
use crate::error::{CoordinatorError, Result};
use crate::messages::{
    BarrierDeadline, CloseSession, EnvironmentInfo, InspectEnvironment, Phase, QuerySession,
    RegisterAgent, RegisterRoundObserver, ReplySlot, RoundComplete, RoundOutcome, RoundSummary,
    SessionSnapshot, SubmitRequest,
};

/// Environment shared between the actor model and its clones.
pub(crate) type SharedAdapter = Arc<Mutex<Box<dyn EnvironmentAdapter>>>;

/// Lock the environment, taking the guard back even if an earlier holder
/// panicked.
fn lock_env(adapter: &SharedAdapter) -> MutexGuard<'_, Box<dyn EnvironmentAdapter>> {
    adapter.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Milliseconds in `elapsed`, saturating at `u64::MAX`.
fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// One agent's contribution to the current round.
#[derive(Debug, Clone)]
struct PendingRequest {
    request: Request,
    reply: ReplySlot<Result<Response>>,
}

/// Actor state for the Coordinator.
pub(crate) struct CoordinatorState {
    /// Session configuration
    config: CoordinatorConfig,
    /// Type id labelling this session in logs and snapshots
    session_id: String,
    /// The shared environment
    adapter: Option<SharedAdapter>,
    /// Agents admitted to the session
    registered: BTreeSet<AgentId>,
    /// Requests of the round currently filling, keyed by agent
    pending: DashMap<AgentId, PendingRequest>,
    phase: Phase,
    /// Number of the round currently filling
    round: u64,
    /// Set once the first request is accepted; closes registration
    started: bool,
    /// When the current round received its first request
    round_opened_at: Option<Instant>,
    /// Handle to the actor receiving RoundComplete
    round_observer: Option<ActorHandle>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            session_id: String::new(),
            adapter: None,
            registered: BTreeSet::new(),
            pending: DashMap::new(),
            phase: Phase::AwaitingRequests,
            round: 0,
            started: false,
            round_opened_at: None,
            round_observer: None,
        }
    }
}

impl Clone for CoordinatorState {
    fn clone(&self) -> Self {
        let pending = DashMap::new();
        for entry in self.pending.iter() {
            pending.insert(entry.key().clone(), entry.value().clone());
        }

        Self {
            config: self.config.clone(),
            session_id: self.session_id.clone(),
            adapter: self.adapter.clone(),
            registered: self.registered.clone(),
            pending,
            phase: self.phase,
            round: self.round,
            started: self.started,
            round_opened_at: self.round_opened_at,
            round_observer: self.round_observer.clone(),
        }
    }
}

impl std::fmt::Debug for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorState")
            .field("session_id", &self.session_id)
            .field("adapter", &self.adapter.is_some())
            .field("registered", &self.registered.len())
            .field("pending", &self.pending.len())
            .field("phase", &self.phase)
            .field("round", &self.round)
            .field("started", &self.started)
            .finish()
    }
}

impl CoordinatorState {
    fn transition(&mut self, next: Phase) {
        trace!(
            session = %self.session_id,
            round = self.round,
            from = %self.phase,
            to = %next,
            "Phase transition"
        );
        self.phase = next;
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut pending: Vec<AgentId> = self.pending.iter().map(|e| e.key().clone()).collect();
        pending.sort();

        SessionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            round: self.round,
            registered: self.registered.iter().cloned().collect(),
            pending,
            started: self.started,
            closed: self.phase == Phase::Closed,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.round_opened_at
            .map(|t| saturating_millis(t.elapsed()))
            .unwrap_or(0)
    }

    /// Remove every pending entry, ordered by agent.
    fn drain_pending(&mut self) -> BTreeMap<AgentId, PendingRequest> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    fn check_register(&self, agent_id: &AgentId) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(CoordinatorError::SessionClosed);
        }
        if self.started {
            return Err(CoordinatorError::SessionStarted);
        }
        if self.registered.contains(agent_id) {
            return Err(CoordinatorError::AlreadyRegistered(agent_id.clone()));
        }

        let declared = self
            .adapter
            .as_ref()
            .and_then(|adapter| lock_env(adapter).agent_ids());
        if let Some(declared) = declared
            && !declared.contains(agent_id)
        {
            return Err(CoordinatorError::UnknownToEnvironment(agent_id.clone()));
        }

        Ok(())
    }

    fn check_submit(&self, agent_id: &AgentId) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(CoordinatorError::SessionClosed);
        }
        if !self.registered.contains(agent_id) {
            return Err(CoordinatorError::UnregisteredAgent(agent_id.clone()));
        }
        if self.pending.contains_key(agent_id) {
            return Err(CoordinatorError::DuplicateSubmission(agent_id.clone()));
        }
        Ok(())
    }

    fn barrier_full(&self) -> bool {
        !self.registered.is_empty() && self.pending.len() == self.registered.len()
    }

    /// Call the environment once and validate what it returned.
    fn apply(
        &self,
        round: u64,
        kind: BatchKind,
        batch: &BTreeMap<AgentId, Request>,
    ) -> Result<BTreeMap<AgentId, Response>> {
        let Some(adapter) = self.adapter.as_ref() else {
            return Err(CoordinatorError::AdapterFailure {
                round,
                message: "no environment attached".to_string(),
            });
        };

        let responses = {
            let mut env = lock_env(adapter);
            panic::catch_unwind(AssertUnwindSafe(|| env.batch_apply(batch))).unwrap_or_else(
                |payload| {
                    Err(anyhow::anyhow!(
                        "environment panicked: {}",
                        panic_message(&*payload)
                    ))
                },
            )
        }
        .map_err(|e| CoordinatorError::AdapterFailure {
            round,
            message: format!("{e:#}"),
        })?;

        check_response_keys(round, kind, batch, &responses)?;
        Ok(responses)
    }

    /// Dispatch the full round and hand every waiter its answer.
    fn dispatch_round(&mut self) -> RoundSummary {
        let round = self.round;
        let duration_start = self.round_opened_at;
        let waiters = self.drain_pending();
        let requests: BTreeMap<AgentId, Request> = waiters
            .iter()
            .map(|(agent, pending)| (agent.clone(), pending.request.clone()))
            .collect();

        self.transition(Phase::Dispatching);
        let kind = RequestKind::resolve(requests.values());
        let batch = build_batch(&requests, kind);
        let result = self.apply(round, kind, &batch);

        let outcome = match result {
            Ok(mut responses) => {
                self.transition(Phase::Distributing);
                for (agent, waiter) in waiters {
                    let Some(response) = responses.remove(&agent) else {
                        continue;
                    };
                    if !waiter.reply.send(Ok(response)) {
                        debug!(agent = %agent, round, "Agent stopped waiting before delivery");
                    }
                }
                RoundOutcome::Delivered
            }
            Err(err) => {
                warn!(
                    session = %self.session_id,
                    round,
                    error = %err,
                    "Round aborted"
                );
                for waiter in waiters.values() {
                    waiter.reply.send(Err(err.clone()));
                }
                RoundOutcome::Aborted {
                    reason: err.to_string(),
                }
            }
        };

        let summary = RoundSummary {
            round,
            kind: Some(kind),
            agents: requests.into_keys().collect(),
            outcome,
            duration_ms: duration_start
                .map(|t| saturating_millis(t.elapsed()))
                .unwrap_or(0),
        };

        self.round += 1;
        self.round_opened_at = None;
        self.transition(Phase::AwaitingRequests);
        summary
    }

    /// Abort a round whose barrier never filled.
    fn expire_round(&mut self) -> RoundSummary {
        let round = self.round;
        let duration_ms = self.elapsed_ms();
        let timeout_ms = self.config.barrier_timeout_ms.unwrap_or(0);
        let waiters = self.drain_pending();
        let missing: Vec<AgentId> = self
            .registered
            .iter()
            .filter(|a| !waiters.contains_key(*a))
            .cloned()
            .collect();

        warn!(
            session = %self.session_id,
            round,
            timeout_ms,
            missing = ?missing,
            "Barrier timed out"
        );

        let err = CoordinatorError::BarrierTimeout { round, timeout_ms };
        for waiter in waiters.values() {
            waiter.reply.send(Err(err.clone()));
        }

        self.round += 1;
        self.round_opened_at = None;

        RoundSummary {
            round,
            kind: None,
            agents: waiters.into_keys().collect(),
            outcome: RoundOutcome::TimedOut { missing },
            duration_ms,
        }
    }
}

/// Central coordinator actor for a session.
///
/// Owns the registered set and the pending set for the lifetime of the
/// session. Clients talk to it through [`Session`](crate::Session).
pub struct Coordinator {
    /// Session configuration
    pub config: CoordinatorConfig,
    /// The shared environment
    pub adapter: Box<dyn EnvironmentAdapter>,
}

impl Coordinator {
    /// Create a new Coordinator.
    pub fn new(config: CoordinatorConfig, adapter: Box<dyn EnvironmentAdapter>) -> Self {
        Self { config, adapter }
    }

    /// Spawn this coordinator.
    ///
    /// Returns the session id together with the actor handle.
    pub async fn spawn(self, runtime: &mut ActorRuntime) -> (String, ActorHandle) {
        let mut actor =
            runtime.new_actor_with_name::<CoordinatorState>(self.config.actor_name.clone());

        let session_id = "session".create_type_id::<V7>().to_string();

        actor.model.session_id = session_id.clone();
        actor.model.config = self.config;
        actor.model.adapter = Some(Arc::new(Mutex::new(self.adapter)));

        configure_handlers(&mut actor);

        let handle = actor.start().await;
        info!(session = %session_id, "Session opened");
        (session_id, handle)
    }
}

/// Configure all message handlers for the coordinator.
fn configure_handlers(actor: &mut ManagedActor<Idle, CoordinatorState>) {
    actor.mutate_on::<RegisterAgent>(|actor, context| {
        let msg = context.message().clone();
        let result = actor.model.check_register(&msg.agent_id);

        if result.is_ok() {
            actor.model.registered.insert(msg.agent_id.clone());
            debug!(
                session = %actor.model.session_id,
                agent = %msg.agent_id,
                total_agents = actor.model.registered.len(),
                "Agent registered"
            );
        }
        msg.reply.send(result);
        Reply::ready()
    });

    actor.mutate_on::<RegisterRoundObserver>(|actor, context| {
        actor.model.round_observer = Some(context.message().handle.clone());
        debug!("Registered round observer");
        Reply::ready()
    });

    // Handle SubmitRequest - buffer, then dispatch when the barrier fills
    actor.mutate_on::<SubmitRequest>(|actor, context| {
        let msg = context.message().clone();
        let self_handle = actor.handle().clone();

        if let Err(err) = actor.model.check_submit(&msg.agent_id) {
            debug!(agent = %msg.agent_id, error = %err, "Submission rejected");
            msg.reply.send(Err(err));
            return Reply::ready();
        }

        let model = &mut actor.model;
        let opens_round = model.pending.is_empty();
        model.started = true;
        model.pending.insert(
            msg.agent_id.clone(),
            PendingRequest {
                request: msg.request.clone(),
                reply: msg.reply.clone(),
            },
        );
        debug!(
            session = %model.session_id,
            round = model.round,
            agent = %msg.agent_id,
            kind = %msg.request.kind(),
            pending = model.pending.len(),
            registered = model.registered.len(),
            "Request buffered"
        );

        if opens_round {
            model.round_opened_at = Some(Instant::now());
            if let Some(timeout) = model.config.barrier_timeout() {
                let round = model.round;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    self_handle.send(BarrierDeadline { round }).await;
                });
            }
        }

        if !model.barrier_full() {
            return Reply::ready();
        }

        model.transition(Phase::RoundReady);
        let summary = model.dispatch_round();
        info!(
            session = %model.session_id,
            round = summary.round,
            kind = ?summary.kind,
            agents = summary.agents.len(),
            delivered = summary.is_delivered(),
            duration_ms = summary.duration_ms,
            "Round complete"
        );

        if let Some(observer) = model.round_observer.clone() {
            return Reply::pending(async move {
                observer.send(RoundComplete { summary }).await;
            });
        }
        Reply::ready()
    });

    actor.mutate_on::<BarrierDeadline>(|actor, context| {
        let round = context.message().round;
        let model = &mut actor.model;

        if model.phase == Phase::Closed || round != model.round || model.pending.is_empty() {
            trace!(round, current = model.round, "Ignoring stale barrier deadline");
            return Reply::ready();
        }

        let summary = model.expire_round();
        if let Some(observer) = model.round_observer.clone() {
            return Reply::pending(async move {
                observer.send(RoundComplete { summary }).await;
            });
        }
        Reply::ready()
    });

    actor.mutate_on::<CloseSession>(|actor, context| {
        let reply = context.message().reply.clone();
        let model = &mut actor.model;

        if model.phase != Phase::Closed {
            model.transition(Phase::Closed);
            let waiters = model.drain_pending();
            for waiter in waiters.values() {
                waiter.reply.send(Err(CoordinatorError::SessionClosed));
            }
            if let Some(adapter) = model.adapter.as_ref() {
                lock_env(adapter).close();
            }
            info!(
                session = %model.session_id,
                rounds = model.round,
                abandoned = waiters.len(),
                "Session closed"
            );
        }

        reply.send(());
        Reply::ready()
    });

    actor.mutate_on::<QuerySession>(|actor, context| {
        context.message().reply.send(actor.model.snapshot());
        Reply::ready()
    });

    actor.mutate_on::<InspectEnvironment>(|actor, context| {
        let msg = context.message().clone();
        let info = actor
            .model
            .adapter
            .as_ref()
            .map(|adapter| {
                let env = lock_env(adapter);
                EnvironmentInfo {
                    agent_ids: env.agent_ids(),
                    observation_space: msg
                        .agent_id
                        .as_ref()
                        .and_then(|a| env.observation_space(a)),
                    action_space: msg.agent_id.as_ref().and_then(|a| env.action_space(a)),
                    rendering: env.render(),
                }
            })
            .unwrap_or_default();
        msg.reply.send(info);
        Reply::ready()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_millis_caps_at_u64_max() {
        assert_eq!(saturating_millis(Duration::from_millis(12)), 12);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
    }

    #[test]
    fn test_lock_env_recovers_poisoned_lock() {
        struct QuietEnv;
        impl EnvironmentAdapter for QuietEnv {
            fn batch_apply(
                &mut self,
                _batch: &BTreeMap<AgentId, Request>,
            ) -> anyhow::Result<BTreeMap<AgentId, Response>> {
                Ok(BTreeMap::new())
            }
            fn render(&self) -> Option<String> {
                Some("idle".to_string())
            }
        }

        let env: Box<dyn EnvironmentAdapter> = Box::new(QuietEnv);
        let adapter: SharedAdapter = Arc::new(Mutex::new(env));
        let poisoner = Arc::clone(&adapter);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(adapter.is_poisoned());
        assert_eq!(lock_env(&adapter).render(), Some("idle".to_string()));
    }
}
