//! Meteor dodging: agents share the bottom row of a square board and must
//! sidestep meteors falling from the top.
//!
//! ```text
//! --*-----
//! --------
//! ...
//! -0--1-2-
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, bail, ensure};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use demac_kernel::{AgentId, EnvironmentAdapter, Info, Request, RequestKind, Response, Space};

use super::agent_names;

/// Configuration for [`MeteorEnv`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteorConfig {
    /// Steps between meteor spawns
    pub meteor_interval: usize,
    /// Board width and height
    pub grid_size: usize,
    /// Episode length cap
    pub max_timesteps: u64,
}

impl Default for MeteorConfig {
    fn default() -> Self {
        Self {
            meteor_interval: 3,
            grid_size: 8,
            max_timesteps: 100,
        }
    }
}

/// Outcome of advancing the board by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Running,
    /// A meteor landed on an agent
    Collision,
    /// The episode reached `max_timesteps`
    TimeUp,
}

/// Board state, independent of agent naming.
#[derive(Debug, Clone)]
struct MeteorBoard {
    grid_size: usize,
    /// Column of each agent on the bottom row
    agents: Vec<usize>,
    /// (row, column) of each falling meteor; row 0 is the top
    meteors: Vec<(usize, usize)>,
    /// Column where the last collision happened
    collision: Option<usize>,
    since_spawn: usize,
    timesteps: u64,
}

impl MeteorBoard {
    fn new(grid_size: usize, num_agents: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut columns: Vec<usize> = (0..grid_size).collect();
        columns.shuffle(rng);
        columns.truncate(num_agents);

        Self {
            grid_size,
            agents: columns,
            meteors: Vec::new(),
            collision: None,
            since_spawn: 0,
            timesteps: 0,
        }
    }

    fn bottom(&self) -> usize {
        self.grid_size - 1
    }

    /// Move agents in index order; a move into an occupied cell is skipped.
    fn move_agents(&mut self, deltas: &[i64]) {
        let max_col = self.bottom() as i64;
        for (agent, delta) in deltas.iter().enumerate() {
            let current = self.agents[agent];
            let target = (current as i64 + delta).clamp(0, max_col) as usize;
            if target != current && !self.agents.contains(&target) {
                self.agents[agent] = target;
            }
        }
    }

    /// Drop every meteor one row. Meteors already on the bottom row vanish.
    fn drop_meteors(&mut self) -> bool {
        let bottom = self.bottom();
        self.meteors.retain(|(row, _)| *row < bottom);
        for (row, _) in self.meteors.iter_mut() {
            *row += 1;
        }

        let hit = self
            .meteors
            .iter()
            .find(|(row, col)| *row == bottom && self.agents.contains(col))
            .map(|(_, col)| *col);
        self.collision = hit;
        hit.is_some()
    }

    fn step(
        &mut self,
        deltas: &[i64],
        config: &MeteorConfig,
        rng: &mut ChaCha8Rng,
    ) -> StepOutcome {
        self.move_agents(deltas);

        if self.drop_meteors() {
            return StepOutcome::Collision;
        }

        self.since_spawn += 1;
        if self.since_spawn >= config.meteor_interval {
            self.since_spawn = 0;
            let col = rng.random_range(0..self.grid_size);
            self.meteors.push((0, col));
        }

        if self.timesteps >= config.max_timesteps {
            return StepOutcome::TimeUp;
        }
        self.timesteps += 1;
        StepOutcome::Running
    }

    /// One-hot agent columns followed by, per column, the number of rows
    /// between the nearest meteor and the bottom row (`grid_size` if none).
    fn observation(&self) -> Vec<f64> {
        let g = self.grid_size;
        let mut obs = vec![0.0; self.agents.len() * g + g];
        for (agent, col) in self.agents.iter().enumerate() {
            obs[agent * g + col] = 1.0;
        }

        let dists = &mut obs[self.agents.len() * g..];
        dists.fill(g as f64);
        for (row, col) in &self.meteors {
            let dist = (self.bottom() - row) as f64;
            if dist < dists[*col] {
                dists[*col] = dist;
            }
        }
        obs
    }

    fn render(&self) -> String {
        let g = self.grid_size;
        let mut cells = vec![vec!['-'; g]; g];
        for (row, col) in &self.meteors {
            cells[*row][*col] = '*';
        }
        for (agent, col) in self.agents.iter().enumerate() {
            cells[self.bottom()][*col] = char::from_digit((agent % 10) as u32, 10).unwrap_or('?');
        }
        if let Some(col) = self.collision {
            cells[self.bottom()][col] = 'c';
        }

        cells
            .into_iter()
            .map(|row| row.into_iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared meteor-dodging environment.
pub struct MeteorEnv {
    config: MeteorConfig,
    agents: Vec<AgentId>,
    board: MeteorBoard,
    rng: ChaCha8Rng,
    episodes: u64,
}

impl MeteorEnv {
    pub fn new(config: MeteorConfig, num_agents: usize, seed: u64) -> anyhow::Result<Self> {
        ensure!(config.grid_size >= 2, "grid_size must be at least 2");
        ensure!(config.meteor_interval >= 1, "meteor_interval must be at least 1");
        ensure!(
            num_agents <= config.grid_size,
            "{num_agents} agents do not fit on a {}-wide board",
            config.grid_size
        );

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let board = MeteorBoard::new(config.grid_size, num_agents, &mut rng);
        Ok(Self {
            config,
            agents: agent_names(num_agents),
            board,
            rng,
            episodes: 0,
        })
    }

    /// Map {0, 1, 2} to {left, stand, right} for every agent in board order.
    fn deltas(&self, batch: &BTreeMap<AgentId, Request>) -> anyhow::Result<Vec<i64>> {
        self.agents
            .iter()
            .map(|agent| {
                let request = batch
                    .get(agent)
                    .with_context(|| format!("no action for agent {agent}"))?;
                let Request::Step { action } = request else {
                    bail!("agent {agent} sent a reset inside a step batch");
                };
                match action.as_discrete() {
                    Some(a @ 0..=2) => Ok(a - 1),
                    _ => bail!("agent {agent} sent {action:?}, expected 0, 1 or 2"),
                }
            })
            .collect()
    }

    fn reward(&self, outcome: StepOutcome) -> f64 {
        match outcome {
            StepOutcome::Collision => 1.0 - self.config.max_timesteps as f64 / 10.0,
            StepOutcome::Running | StepOutcome::TimeUp => 1.0,
        }
    }
}

impl EnvironmentAdapter for MeteorEnv {
    fn batch_apply(
        &mut self,
        batch: &BTreeMap<AgentId, Request>,
    ) -> anyhow::Result<BTreeMap<AgentId, Response>> {
        if let Some(stranger) = batch.keys().find(|a| !self.agents.contains(a)) {
            bail!("agent {stranger} is not part of this environment");
        }

        if RequestKind::resolve(batch.values()) == RequestKind::Reset {
            self.board = MeteorBoard::new(self.config.grid_size, self.agents.len(), &mut self.rng);
            self.episodes += 1;
            let observation = self.board.observation();
            return Ok(batch
                .keys()
                .map(|agent| {
                    let response = Response::Reset {
                        observation: observation.clone(),
                    };
                    (agent.clone(), response)
                })
                .collect());
        }

        let deltas = self.deltas(batch)?;
        let outcome = self.board.step(&deltas, &self.config, &mut self.rng);
        let observation = self.board.observation();
        let reward = self.reward(outcome);
        let done = outcome != StepOutcome::Running;

        let mut info = Info::new();
        info.insert("timesteps".to_string(), self.board.timesteps.into());
        info.insert("episode".to_string(), self.episodes.into());
        if outcome == StepOutcome::Collision {
            info.insert("collision".to_string(), true.into());
        }

        Ok(batch
            .keys()
            .map(|agent| {
                let response = Response::Step {
                    observation: observation.clone(),
                    reward,
                    done,
                    info: info.clone(),
                };
                (agent.clone(), response)
            })
            .collect())
    }

    fn agent_ids(&self) -> Option<Vec<AgentId>> {
        Some(self.agents.clone())
    }

    fn observation_space(&self, _agent: &AgentId) -> Option<Space> {
        let g = self.config.grid_size;
        Some(Space::Box {
            low: 0.0,
            high: g as f64,
            shape: vec![self.agents.len() * g + g],
        })
    }

    fn action_space(&self, _agent: &AgentId) -> Option<Space> {
        Some(Space::Discrete { n: 3 })
    }

    fn render(&self) -> Option<String> {
        Some(self.board.render())
    }
}
