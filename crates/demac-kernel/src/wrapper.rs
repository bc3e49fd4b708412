//! AgentEnvWrapper: a single-agent environment view over an AgentChannel.
//!
//! A learning loop calls `reset` and `step` as if it owned the environment;
//! each call becomes one request on the agent's channel and suspends until
//! the coordinator's round completes.

use serde::{Deserialize, Serialize};

use crate::agent::{ActionValue, AgentId, Info, Observation, Request, Response};
use crate::channel::AgentChannel;
use crate::environment::Space;
use crate::error::Result;
use crate::wire::AgentMessage;

/// Result of one `step` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: Info,
    /// Another agent forced a reset in this round; the action was discarded
    pub overridden: bool,
}

/// One finished (or interrupted) episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_return: f64,
    pub length: u64,
    /// Ended by a reset rather than by `done`
    pub interrupted: bool,
}

/// Running episode statistics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub current_return: f64,
    pub current_length: u64,
    pub completed: Vec<EpisodeRecord>,
}

impl EpisodeStats {
    fn record_step(&mut self, reward: f64, done: bool) {
        self.current_return += reward;
        self.current_length += 1;
        if done {
            self.finish(false);
        }
    }

    fn finish(&mut self, interrupted: bool) {
        if self.current_length > 0 {
            self.completed.push(EpisodeRecord {
                episode_return: self.current_return,
                length: self.current_length,
                interrupted,
            });
        }
        self.current_return = 0.0;
        self.current_length = 0;
    }

    /// Mean return over episodes that ended with `done`.
    pub fn mean_return(&self) -> Option<f64> {
        let finished: Vec<f64> = self
            .completed
            .iter()
            .filter(|e| !e.interrupted)
            .map(|e| e.episode_return)
            .collect();
        if finished.is_empty() {
            return None;
        }
        Some(finished.iter().sum::<f64>() / finished.len() as f64)
    }
}

/// Single-agent step/reset API backed by a coordinator session.
#[derive(Debug)]
pub struct AgentEnvWrapper {
    channel: AgentChannel,
    stats: EpisodeStats,
    transcript: Option<Vec<AgentMessage>>,
}

impl AgentEnvWrapper {
    pub fn new(channel: AgentChannel) -> Self {
        Self {
            channel,
            stats: EpisodeStats::default(),
            transcript: None,
        }
    }

    /// Keep every request and response as a wire record.
    pub fn with_transcript(mut self) -> Self {
        self.transcript = Some(Vec::new());
        self
    }

    pub fn agent_id(&self) -> &AgentId {
        self.channel.agent_id()
    }

    async fn exchange(&mut self, request: Request) -> Result<Response> {
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.push(AgentMessage::request(self.channel.agent_id().clone(), &request));
        }
        let response = self.channel.request(request).await?;
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.push(AgentMessage::response(
                self.channel.agent_id().clone(),
                &response,
            ));
        }
        Ok(response)
    }

    /// Reset the shared environment and return this agent's observation.
    pub async fn reset(&mut self) -> Result<Observation> {
        let response = self.exchange(Request::Reset).await?;
        self.stats.finish(true);
        Ok(response.observation().clone())
    }

    /// Advance the shared environment with this agent's action.
    ///
    /// If the round resolved to a reset, the returned transition is marked
    /// `overridden` and carries the fresh observation with zero reward.
    pub async fn step(&mut self, action: ActionValue) -> Result<Transition> {
        match self.exchange(Request::Step { action }).await? {
            Response::Step {
                observation,
                reward,
                done,
                info,
            } => {
                self.stats.record_step(reward, done);
                Ok(Transition {
                    observation,
                    reward,
                    done,
                    info,
                    overridden: false,
                })
            }
            Response::Reset { observation } => {
                self.stats.finish(true);
                Ok(Transition {
                    observation,
                    reward: 0.0,
                    done: false,
                    info: Info::new(),
                    overridden: true,
                })
            }
        }
    }

    pub async fn action_space(&self) -> Option<Space> {
        self.channel
            .session()
            .action_space(self.channel.agent_id())
            .await
    }

    pub async fn observation_space(&self) -> Option<Space> {
        self.channel
            .session()
            .observation_space(self.channel.agent_id())
            .await
    }

    pub async fn render(&self) -> Option<String> {
        self.channel.session().render().await
    }

    pub fn episode_stats(&self) -> &EpisodeStats {
        &self.stats
    }

    /// Take the recorded transcript, leaving recording enabled.
    pub fn take_transcript(&mut self) -> Vec<AgentMessage> {
        self.transcript.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Give back the underlying channel.
    pub fn into_channel(self) -> AgentChannel {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_closes_episode() {
        let mut stats = EpisodeStats::default();
        stats.record_step(1.0, false);
        stats.record_step(1.0, true);

        assert_eq!(stats.completed.len(), 1);
        assert_eq!(stats.completed[0].length, 2);
        assert!(!stats.completed[0].interrupted);
        assert_eq!(stats.current_length, 0);
        assert_eq!(stats.mean_return(), Some(2.0));
    }

    #[test]
    fn test_reset_mid_episode_marks_interrupted() {
        let mut stats = EpisodeStats::default();
        stats.record_step(1.0, false);
        stats.finish(true);

        assert!(stats.completed[0].interrupted);
        assert_eq!(stats.mean_return(), None);
    }

    #[test]
    fn test_reset_before_any_step_records_nothing() {
        let mut stats = EpisodeStats::default();
        stats.finish(true);
        assert!(stats.completed.is_empty());
    }
}
