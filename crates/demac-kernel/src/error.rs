//! Error taxonomy for coordinator sessions.

use crate::agent::AgentId;

/// Errors returned by session operations.
///
/// Per-agent errors are returned only to the offending caller and leave the
/// round untouched. Round-level errors abort the in-flight round and are
/// delivered to every agent waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("agent {0} already has a request in flight")]
    DuplicateSubmission(AgentId),

    #[error("agent {0} is already registered")]
    AlreadyRegistered(AgentId),

    #[error("agent {0} is not registered with this session")]
    UnregisteredAgent(AgentId),

    #[error("agent {0} is not declared by the environment")]
    UnknownToEnvironment(AgentId),

    #[error("registration is closed once the first round has begun")]
    SessionStarted,

    #[error("session is closed")]
    SessionClosed,

    #[error("environment response does not match round {round}: {detail}")]
    AdapterMismatch { round: u64, detail: String },

    #[error("environment failed during round {round}: {message}")]
    AdapterFailure { round: u64, message: String },

    #[error("round {round} did not fill within {timeout_ms}ms")]
    BarrierTimeout { round: u64, timeout_ms: u64 },

    #[error("agent {0} has no request in flight")]
    NothingInFlight(AgentId),
}

impl CoordinatorError {
    /// Whether this error aborted a whole round (and was broadcast to all its agents).
    pub fn is_round_level(&self) -> bool {
        matches!(
            self,
            Self::AdapterMismatch { .. } | Self::AdapterFailure { .. } | Self::BarrierTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
