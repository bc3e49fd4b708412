//! AgentChannel: one agent's request/response conduit to the coordinator.

use tokio::sync::oneshot;

use crate::agent::{AgentId, Request, Response};
use crate::error::{CoordinatorError, Result};
use crate::session::Session;

/// A single-slot rendezvous between one agent and the coordinator.
///
/// At most one request is in flight: `send` fills the slot, `receive`
/// empties it. The coordinator is the only producer of responses.
#[derive(Debug)]
pub struct AgentChannel {
    agent_id: AgentId,
    session: Session,
    slot: Option<oneshot::Receiver<Result<Response>>>,
}

impl AgentChannel {
    pub(crate) fn new(agent_id: AgentId, session: Session) -> Self {
        Self {
            agent_id,
            session,
            slot: None,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether a request is waiting on a response.
    pub fn in_flight(&self) -> bool {
        self.slot.is_some()
    }

    /// Post one request for the current round.
    ///
    /// Fails with `DuplicateSubmission` while a previous request is
    /// unresolved; the coordinator is not contacted in that case.
    pub async fn send(&mut self, request: Request) -> Result<()> {
        if self.slot.is_some() {
            return Err(CoordinatorError::DuplicateSubmission(self.agent_id.clone()));
        }
        let rx = self.session.post(self.agent_id.clone(), request).await;
        self.slot = Some(rx);
        Ok(())
    }

    /// Wait for the response to the in-flight request and clear the slot.
    ///
    /// Cancelling this future leaves the request in flight; a later
    /// `receive` still gets its response.
    pub async fn receive(&mut self) -> Result<Response> {
        let Some(rx) = self.slot.as_mut() else {
            return Err(CoordinatorError::NothingInFlight(self.agent_id.clone()));
        };
        let result = rx.await.unwrap_or(Err(CoordinatorError::SessionClosed));
        self.slot = None;
        result
    }

    /// `send` followed by `receive`.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        self.send(request).await?;
        self.receive().await
    }

    /// Drop any in-flight request's reply; the agent stays registered.
    pub fn close(&mut self) {
        self.slot = None;
    }
}
