//! Wire record exchanged on an agent's channel.
//!
//! One flat JSON object per message; fields that do not apply to the
//! message's kind and direction are omitted.

use serde::{Deserialize, Serialize};

use crate::agent::{ActionValue, AgentId, Info, Observation, Request, RequestKind, Response};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("{kind} record for agent {agent_id} is missing `{field}`")]
    MissingField {
        agent_id: AgentId,
        kind: RequestKind,
        field: &'static str,
    },

    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured record carried on an agent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub agent_id: AgentId,
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Info>,
}

impl AgentMessage {
    fn bare(agent_id: AgentId, kind: RequestKind) -> Self {
        Self {
            agent_id,
            kind,
            action: None,
            observation: None,
            reward: None,
            done: None,
            info: None,
        }
    }

    /// Record for a request sent by `agent_id`.
    pub fn request(agent_id: AgentId, request: &Request) -> Self {
        let mut msg = Self::bare(agent_id, request.kind());
        if let Request::Step { action } = request {
            msg.action = Some(action.clone());
        }
        msg
    }

    /// Record for a response delivered to `agent_id`.
    pub fn response(agent_id: AgentId, response: &Response) -> Self {
        let mut msg = Self::bare(agent_id, response.kind());
        msg.observation = Some(response.observation().clone());
        if let Response::Step {
            reward, done, info, ..
        } = response
        {
            msg.reward = Some(*reward);
            msg.done = Some(*done);
            msg.info = Some(info.clone());
        }
        msg
    }

    fn missing(&self, field: &'static str) -> WireError {
        WireError::MissingField {
            agent_id: self.agent_id.clone(),
            kind: self.kind,
            field,
        }
    }

    pub fn into_request(self) -> Result<Request, WireError> {
        match self.kind {
            RequestKind::Reset => Ok(Request::Reset),
            RequestKind::Step => {
                let action = self.action.clone().ok_or_else(|| self.missing("action"))?;
                Ok(Request::Step { action })
            }
        }
    }

    pub fn into_response(self) -> Result<Response, WireError> {
        let observation = self
            .observation
            .clone()
            .ok_or_else(|| self.missing("observation"))?;
        match self.kind {
            RequestKind::Reset => Ok(Response::Reset { observation }),
            RequestKind::Step => Ok(Response::Step {
                observation,
                reward: self.reward.ok_or_else(|| self.missing("reward"))?,
                done: self.done.ok_or_else(|| self.missing("done"))?,
                info: self.info.unwrap_or_default(),
            }),
        }
    }

    /// Encode as a single JSON line.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(line: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(line)?)
    }
}
