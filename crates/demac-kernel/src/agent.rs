//! Agent-facing data model: identities, requests, and responses.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for an agent within a coordinator session.
///
/// Opaque to the coordinator; stable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id from any string-like name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the underlying name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for AgentId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Index-based ids ("0", "1", ...) as used by the sample environments.
impl From<usize> for AgentId {
    fn from(index: usize) -> Self {
        Self(index.to_string())
    }
}

/// An action chosen by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    /// Index into a discrete action space
    Discrete(i64),
    /// Point in a continuous action space
    Continuous(Vec<f64>),
}

impl ActionValue {
    /// The discrete index, if this is a discrete action.
    pub fn as_discrete(&self) -> Option<i64> {
        match self {
            Self::Discrete(a) => Some(*a),
            Self::Continuous(_) => None,
        }
    }
}

/// Flat observation vector.
pub type Observation = Vec<f64>;

/// Free-form per-step metadata returned by the environment.
pub type Info = HashMap<String, serde_json::Value>;

/// The kind of a single request, or of a whole round once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Step,
    Reset,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step => f.write_str("step"),
            Self::Reset => f.write_str("reset"),
        }
    }
}

/// Kind of a dispatched batch: `Reset` if any pending request is a reset.
pub type BatchKind = RequestKind;

impl RequestKind {
    /// Resolve the kind of a round from its pending requests.
    ///
    /// A single reset anywhere in the round forces the whole round to reset.
    pub fn resolve<'a>(requests: impl IntoIterator<Item = &'a Request>) -> BatchKind {
        if requests
            .into_iter()
            .any(|r| r.kind() == RequestKind::Reset)
        {
            RequestKind::Reset
        } else {
            RequestKind::Step
        }
    }
}

/// A request submitted by one agent for the current round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Advance the shared environment with this agent's action
    Step { action: ActionValue },
    /// Reset the shared environment
    Reset,
}

impl Request {
    /// Convenience constructor for a discrete step.
    pub fn step(action: i64) -> Self {
        Self::Step {
            action: ActionValue::Discrete(action),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Step { .. } => RequestKind::Step,
            Self::Reset => RequestKind::Reset,
        }
    }
}

/// The environment's answer to one agent for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// Result of a step round
    Step {
        observation: Observation,
        reward: f64,
        done: bool,
        #[serde(default)]
        info: Info,
    },
    /// Result of a reset round
    Reset { observation: Observation },
}

impl Response {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Step { .. } => RequestKind::Step,
            Self::Reset { .. } => RequestKind::Reset,
        }
    }

    /// Observation carried by either variant.
    pub fn observation(&self) -> &Observation {
        match self {
            Self::Step { observation, .. } | Self::Reset { observation } => observation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_step_when_no_reset() {
        let requests = [Request::step(0), Request::step(1)];
        assert_eq!(RequestKind::resolve(&requests), RequestKind::Step);
    }

    #[test]
    fn test_resolve_reset_overrides_steps() {
        let requests = [Request::step(0), Request::Reset, Request::step(1)];
        assert_eq!(RequestKind::resolve(&requests), RequestKind::Reset);
    }

    #[test]
    fn test_agent_id_from_index() {
        assert_eq!(AgentId::from(3usize), AgentId::from("3"));
        assert_eq!(AgentId::from("a").to_string(), "a");
    }

    #[test]
    fn test_request_serializes_with_kind_tag() {
        let json = serde_json::to_value(Request::step(2)).unwrap();
        assert_eq!(json["kind"], "step");
        assert_eq!(json["action"], 2);

        let json = serde_json::to_value(Request::Reset).unwrap();
        assert_eq!(json["kind"], "reset");
    }
}
