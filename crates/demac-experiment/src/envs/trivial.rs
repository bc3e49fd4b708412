//! Trivial shared environment: constant observations, rare random episode ends.

use std::collections::BTreeMap;

use anyhow::bail;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use demac_kernel::{AgentId, EnvironmentAdapter, Info, Request, RequestKind, Response, Space};

use super::agent_names;

/// Configuration for [`TrivialEnv`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrivialConfig {
    /// Chance that any given step ends the episode for everyone
    pub done_probability: f64,
    /// Observation returned by every step
    pub step_observation: f64,
    pub step_reward: f64,
}

impl Default for TrivialConfig {
    fn default() -> Self {
        Self {
            done_probability: 0.005,
            step_observation: 0.5,
            step_reward: 1.0,
        }
    }
}

/// Every agent sees the same constant step result; the episode ends at random.
pub struct TrivialEnv {
    config: TrivialConfig,
    agents: Vec<AgentId>,
    rng: ChaCha8Rng,
}

impl TrivialEnv {
    pub fn new(config: TrivialConfig, num_agents: usize, seed: u64) -> Self {
        Self {
            config,
            agents: agent_names(num_agents),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn reset(&mut self, batch: &BTreeMap<AgentId, Request>) -> BTreeMap<AgentId, Response> {
        batch
            .keys()
            .map(|agent| {
                let observation = vec![self.rng.random::<f64>()];
                (agent.clone(), Response::Reset { observation })
            })
            .collect()
    }

    fn step(&mut self, batch: &BTreeMap<AgentId, Request>) -> BTreeMap<AgentId, Response> {
        let done = self.rng.random::<f64>() < self.config.done_probability;
        batch
            .keys()
            .map(|agent| {
                let response = Response::Step {
                    observation: vec![self.config.step_observation],
                    reward: self.config.step_reward,
                    done,
                    info: Info::new(),
                };
                (agent.clone(), response)
            })
            .collect()
    }
}

impl EnvironmentAdapter for TrivialEnv {
    fn batch_apply(
        &mut self,
        batch: &BTreeMap<AgentId, Request>,
    ) -> anyhow::Result<BTreeMap<AgentId, Response>> {
        if let Some(stranger) = batch.keys().find(|a| !self.agents.contains(a)) {
            bail!("agent {stranger} is not part of this environment");
        }

        Ok(match RequestKind::resolve(batch.values()) {
            RequestKind::Reset => self.reset(batch),
            RequestKind::Step => self.step(batch),
        })
    }

    fn agent_ids(&self) -> Option<Vec<AgentId>> {
        Some(self.agents.clone())
    }

    fn observation_space(&self, _agent: &AgentId) -> Option<Space> {
        Some(Space::Box {
            low: f64::MIN,
            high: f64::MAX,
            shape: vec![1],
        })
    }

    fn action_space(&self, _agent: &AgentId) -> Option<Space> {
        Some(Space::Discrete { n: 2 })
    }
}
