//! EnvironmentAdapter trait: the shared environment behind the coordinator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, BatchKind, Request, Response};
use crate::error::CoordinatorError;

/// Shape of an observation or action space, as declared by the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Space {
    /// Actions/observations `0..n`
    Discrete { n: usize },
    /// Real-valued box with per-space bounds
    Box {
        low: f64,
        high: f64,
        shape: Vec<usize>,
    },
}

/// A shared, stateful environment that only accepts synchronized batch input.
///
/// The coordinator calls [`batch_apply`](Self::batch_apply) exactly once per
/// round, with one entry per registered agent. When the batch is reset-typed
/// every entry is `Request::Reset`; implementations must answer every key with
/// a response of the same kind.
///
/// Calls are synchronous from the coordinator's point of view. Any internal
/// parallelism (e.g. stepping agents concurrently) is the implementation's
/// business.
pub trait EnvironmentAdapter: Send {
    /// Apply one round of requests and return one response per agent.
    fn batch_apply(
        &mut self,
        batch: &BTreeMap<AgentId, Request>,
    ) -> anyhow::Result<BTreeMap<AgentId, Response>>;

    /// Agents this environment knows about.
    ///
    /// When `Some`, registration of any other id is rejected.
    fn agent_ids(&self) -> Option<Vec<AgentId>> {
        None
    }

    fn observation_space(&self, _agent: &AgentId) -> Option<Space> {
        None
    }

    fn action_space(&self, _agent: &AgentId) -> Option<Space> {
        None
    }

    /// Optional: text rendering of the current state.
    fn render(&self) -> Option<String> {
        None
    }

    /// Optional: release resources when the session closes.
    fn close(&mut self) {}
}

/// Build the outgoing batch for a round.
///
/// Under a reset round every agent contributes a reset, and the step payloads
/// of that round are dropped.
pub fn build_batch<'a>(
    pending: impl IntoIterator<Item = (&'a AgentId, &'a Request)>,
    kind: BatchKind,
) -> BTreeMap<AgentId, Request> {
    pending
        .into_iter()
        .map(|(agent, request)| {
            let request = match kind {
                BatchKind::Reset => Request::Reset,
                BatchKind::Step => request.clone(),
            };
            (agent.clone(), request)
        })
        .collect()
}

/// Verify that the environment answered exactly the agents of the batch,
/// each with a response of the round's kind.
pub fn check_response_keys(
    round: u64,
    kind: BatchKind,
    batch: &BTreeMap<AgentId, Request>,
    responses: &BTreeMap<AgentId, Response>,
) -> Result<(), CoordinatorError> {
    if !batch.keys().eq(responses.keys()) {
        let missing: Vec<_> = batch
            .keys()
            .filter(|a| !responses.contains_key(*a))
            .map(|a| a.to_string())
            .collect();
        let unexpected: Vec<_> = responses
            .keys()
            .filter(|a| !batch.contains_key(*a))
            .map(|a| a.to_string())
            .collect();
        return Err(CoordinatorError::AdapterMismatch {
            round,
            detail: format!("missing {:?}, unexpected {:?}", missing, unexpected),
        });
    }

    if let Some((agent, response)) = responses.iter().find(|(_, r)| r.kind() != kind) {
        return Err(CoordinatorError::AdapterMismatch {
            round,
            detail: format!(
                "agent {} got a {} response in a {} round",
                agent,
                response.kind(),
                kind
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RequestKind;

    fn pending() -> BTreeMap<AgentId, Request> {
        let mut pending = BTreeMap::new();
        pending.insert(AgentId::from("A"), Request::step(0));
        pending.insert(AgentId::from("B"), Request::Reset);
        pending.insert(AgentId::from("C"), Request::step(2));
        pending
    }

    fn reset_response() -> Response {
        Response::Reset {
            observation: vec![0.0],
        }
    }

    #[test]
    fn test_reset_batch_discards_step_payloads() {
        let pending = pending();
        let kind = RequestKind::resolve(pending.values());
        let batch = build_batch(&pending, kind);

        assert_eq!(kind, RequestKind::Reset);
        assert!(batch.values().all(|r| *r == Request::Reset));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_step_batch_keeps_actions() {
        let mut pending = pending();
        pending.insert(AgentId::from("B"), Request::step(1));
        let batch = build_batch(&pending, RequestKind::Step);

        assert_eq!(batch[&AgentId::from("B")], Request::step(1));
        assert_eq!(batch[&AgentId::from("C")], Request::step(2));
    }

    #[test]
    fn test_missing_agent_is_a_mismatch() {
        let batch = build_batch(&pending(), RequestKind::Reset);
        let mut responses: BTreeMap<_, _> = batch
            .keys()
            .map(|a| (a.clone(), reset_response()))
            .collect();
        responses.remove(&AgentId::from("C"));

        let err = check_response_keys(4, RequestKind::Reset, &batch, &responses).unwrap_err();
        assert!(matches!(err, CoordinatorError::AdapterMismatch { round: 4, .. }));
    }

    #[test]
    fn test_wrong_kind_is_a_mismatch() {
        let batch = build_batch(&pending(), RequestKind::Reset);
        let mut responses: BTreeMap<_, _> = batch
            .keys()
            .map(|a| (a.clone(), reset_response()))
            .collect();
        responses.insert(
            AgentId::from("A"),
            Response::Step {
                observation: vec![],
                reward: 0.0,
                done: false,
                info: Default::default(),
            },
        );

        assert!(check_response_keys(0, RequestKind::Reset, &batch, &responses).is_err());
    }

    #[test]
    fn test_matching_responses_pass() {
        let batch = build_batch(&pending(), RequestKind::Reset);
        let responses: BTreeMap<_, _> = batch
            .keys()
            .map(|a| (a.clone(), reset_response()))
            .collect();

        assert!(check_response_keys(0, RequestKind::Reset, &batch, &responses).is_ok());
    }
}
