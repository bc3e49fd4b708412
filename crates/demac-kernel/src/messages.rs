//! Message types for acton-reactive actor communication.
//!
//! Callers outside the actor system get their answers back through a
//! [`ReplySlot`], a single-use oneshot sender that can ride inside a
//! `Clone` message.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::agent::{AgentId, BatchKind, Request, Response};
use crate::environment::Space;
use crate::error::Result;

/// Single-use reply channel carried inside an actor message.
///
/// Cloning shares the same underlying sender; whichever clone sends first
/// wins and later sends are dropped.
pub struct ReplySlot<T>(Arc<Mutex<Option<oneshot::Sender<T>>>>);

impl<T> ReplySlot<T> {
    /// Create a slot and the receiver its reply will arrive on.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Deliver the reply. Returns false if it was already used or the
    /// receiver has gone away.
    pub fn send(&self, value: T) -> bool {
        let Ok(mut guard) = self.0.lock() else {
            return false;
        };
        match guard.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

impl<T> Clone for ReplySlot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> std::fmt::Debug for ReplySlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.0.lock().map(|g| g.is_some()).unwrap_or(false);
        f.debug_struct("ReplySlot").field("open", &open).finish()
    }
}

// ============================================================================
// Session Messages
// ============================================================================

/// Add an agent to the session's registered set.
#[derive(Debug, Clone)]
pub struct RegisterAgent {
    pub agent_id: AgentId,
    pub reply: ReplySlot<Result<()>>,
}

/// Submit one agent's request for the current round.
///
/// The reply resolves once the round this request joined has been
/// distributed, aborted, or the session closed.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub agent_id: AgentId,
    pub request: Request,
    pub reply: ReplySlot<Result<Response>>,
}

/// Sent by the coordinator to itself when a round's barrier timeout expires.
#[derive(Debug, Clone)]
pub struct BarrierDeadline {
    /// Round the deadline was armed for
    pub round: u64,
}

/// Tear the session down.
#[derive(Debug, Clone)]
pub struct CloseSession {
    pub reply: ReplySlot<()>,
}

/// Ask for a point-in-time view of the coordinator.
#[derive(Debug, Clone)]
pub struct QuerySession {
    pub reply: ReplySlot<SessionSnapshot>,
}

/// Ask the environment for its declared agents, spaces, and rendering.
#[derive(Debug, Clone)]
pub struct InspectEnvironment {
    /// Agent whose spaces to report; `None` skips the space lookup
    pub agent_id: Option<AgentId>,
    pub reply: ReplySlot<EnvironmentInfo>,
}

/// Register an actor to receive RoundComplete after every round.
#[derive(Debug, Clone)]
pub struct RegisterRoundObserver {
    /// The observer's actor handle
    pub handle: acton_reactive::prelude::ActorHandle,
}

/// Round completion notification - sent to the registered round observer.
#[derive(Debug, Clone)]
pub struct RoundComplete {
    pub summary: RoundSummary,
}

// ============================================================================
// Reply payloads
// ============================================================================

/// Coordinator state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    AwaitingRequests,
    RoundReady,
    Dispatching,
    Distributing,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AwaitingRequests => "awaiting_requests",
            Self::RoundReady => "round_ready",
            Self::Dispatching => "dispatching",
            Self::Distributing => "distributing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Type id labelling this session
    pub session_id: String,
    pub phase: Phase,
    /// Number of the round currently accumulating requests
    pub round: u64,
    pub registered: Vec<AgentId>,
    /// Agents with a request in the current round
    pub pending: Vec<AgentId>,
    /// Whether the first request has been accepted
    pub started: bool,
    pub closed: bool,
}

/// What the environment reports about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentInfo {
    pub agent_ids: Option<Vec<AgentId>>,
    pub observation_space: Option<Space>,
    pub action_space: Option<Space>,
    pub rendering: Option<String>,
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Every agent received its response
    Delivered,
    /// The environment failed or answered the wrong agents
    Aborted { reason: String },
    /// The barrier never filled
    TimedOut { missing: Vec<AgentId> },
}

/// Summary of one finished round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u64,
    /// `None` when the round timed out before a kind was resolved
    pub kind: Option<BatchKind>,
    /// Agents that had a request in the round
    pub agents: Vec<AgentId>,
    pub outcome: RoundOutcome,
    /// Time from the round's first request to its completion
    pub duration_ms: u64,
}

impl RoundSummary {
    pub fn is_delivered(&self) -> bool {
        self.outcome == RoundOutcome::Delivered
    }
}
