//! Session: the client-side handle over a running coordinator.

use acton_reactive::prelude::*;
use tokio::sync::oneshot;
use tracing::debug;

use crate::actors::Coordinator;
use crate::agent::{AgentId, Request, Response};
use crate::channel::AgentChannel;
use crate::config::CoordinatorConfig;
use crate::environment::{EnvironmentAdapter, Space};
use crate::error::{CoordinatorError, Result};
use crate::messages::{
    CloseSession, EnvironmentInfo, InspectEnvironment, QuerySession, RegisterAgent,
    RegisterRoundObserver, ReplySlot, SessionSnapshot, SubmitRequest,
};

/// Cloneable handle to one coordinator session.
///
/// Every operation is a message to the coordinator actor. If the actor has
/// stopped, calls that expect an answer resolve to
/// [`CoordinatorError::SessionClosed`].
#[derive(Debug, Clone)]
pub struct Session {
    session_id: String,
    handle: ActorHandle,
}

impl Session {
    /// Spawn a coordinator for `adapter` and return a handle to it.
    pub async fn spawn(
        config: CoordinatorConfig,
        adapter: Box<dyn EnvironmentAdapter>,
        runtime: &mut ActorRuntime,
    ) -> Self {
        let (session_id, handle) = Coordinator::new(config, adapter).spawn(runtime).await;
        Self { session_id, handle }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// The coordinator actor's handle.
    pub fn handle(&self) -> &ActorHandle {
        &self.handle
    }

    /// Register an agent and open its channel.
    ///
    /// Only accepted before the first request of the session.
    pub async fn register(&self, agent_id: impl Into<AgentId>) -> Result<AgentChannel> {
        let agent_id = agent_id.into();
        let (reply, rx) = ReplySlot::channel();
        self.handle
            .send(RegisterAgent {
                agent_id: agent_id.clone(),
                reply,
            })
            .await;

        rx.await.unwrap_or(Err(CoordinatorError::SessionClosed))?;
        Ok(AgentChannel::new(agent_id, self.clone()))
    }

    /// Submit a request and wait for the round it joins to finish.
    pub async fn submit(&self, agent_id: impl Into<AgentId>, request: Request) -> Result<Response> {
        let rx = self.post(agent_id.into(), request).await;
        rx.await.unwrap_or(Err(CoordinatorError::SessionClosed))
    }

    /// Hand a request to the coordinator without waiting for the round.
    pub(crate) async fn post(
        &self,
        agent_id: AgentId,
        request: Request,
    ) -> oneshot::Receiver<Result<Response>> {
        let (reply, rx) = ReplySlot::channel();
        self.handle
            .send(SubmitRequest {
                agent_id,
                request,
                reply,
            })
            .await;
        rx
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = ReplySlot::channel();
        self.handle.send(QuerySession { reply }).await;
        rx.await.map_err(|_| CoordinatorError::SessionClosed)
    }

    /// Send a RoundComplete to `observer` after every round.
    pub async fn observe_rounds(&self, observer: ActorHandle) {
        self.handle
            .send(RegisterRoundObserver { handle: observer })
            .await;
    }

    async fn inspect(&self, agent_id: Option<AgentId>) -> EnvironmentInfo {
        let (reply, rx) = ReplySlot::channel();
        self.handle.send(InspectEnvironment { agent_id, reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Agents the environment declares, if it declares any.
    pub async fn declared_agents(&self) -> Option<Vec<AgentId>> {
        self.inspect(None).await.agent_ids
    }

    pub async fn observation_space(&self, agent_id: &AgentId) -> Option<Space> {
        self.inspect(Some(agent_id.clone())).await.observation_space
    }

    pub async fn action_space(&self, agent_id: &AgentId) -> Option<Space> {
        self.inspect(Some(agent_id.clone())).await.action_space
    }

    pub async fn render(&self) -> Option<String> {
        self.inspect(None).await.rendering
    }

    /// Close the session.
    ///
    /// Agents still waiting on a round receive `SessionClosed`; the
    /// environment is closed exactly once.
    pub async fn close(&self) {
        let (reply, rx) = ReplySlot::channel();
        self.handle.send(CloseSession { reply }).await;
        if rx.await.is_err() {
            debug!(session = %self.session_id, "Coordinator already stopped");
        }
    }
}
