//! Results collection and output for coordinator runs.
//!
//! Captures metrics like:
//! - Rounds dispatched, aborted, and timed out
//! - Round latency (first request to distribution)
//! - How often a reset overrode submitted steps
//! - Per-agent episode returns

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use demac_kernel::wrapper::EpisodeRecord;
use demac_kernel::{AgentId, RequestKind, RoundOutcome, RoundSummary};

/// Configuration for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Environment name
    pub env: String,
    pub agent_count: usize,
    /// Requests each agent submits
    pub steps: usize,
    pub seed: u64,
    /// Chance an agent forces a reset instead of stepping
    pub reset_probability: f64,
    pub barrier_timeout_ms: Option<u64>,
    /// Trial number within a sweep
    pub trial: usize,
}

/// What one agent saw during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: AgentId,
    /// Step requests answered with a step response
    pub steps: usize,
    /// Reset requests this agent submitted
    pub resets_requested: usize,
    /// Step requests answered with a reset because another agent reset
    pub overridden_steps: usize,
    pub total_reward: f64,
    pub episodes: Vec<EpisodeRecord>,
    /// Round-level errors this agent received
    pub errors: Vec<String>,
}

/// Round-level counters derived from the RoundComplete stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundStats {
    pub total: usize,
    pub delivered: usize,
    pub aborted: usize,
    pub timed_out: usize,
    pub reset_rounds: usize,
    pub step_rounds: usize,
    pub avg_round_ms: f64,
    pub max_round_ms: u64,
}

impl RoundStats {
    pub fn from_summaries(rounds: &[RoundSummary]) -> Self {
        let mut stats = Self {
            total: rounds.len(),
            ..Default::default()
        };

        for round in rounds {
            match &round.outcome {
                RoundOutcome::Delivered => stats.delivered += 1,
                RoundOutcome::Aborted { .. } => stats.aborted += 1,
                RoundOutcome::TimedOut { .. } => stats.timed_out += 1,
            }
            match round.kind {
                Some(RequestKind::Reset) => stats.reset_rounds += 1,
                Some(RequestKind::Step) => stats.step_rounds += 1,
                None => {}
            }
            stats.max_round_ms = stats.max_round_ms.max(round.duration_ms);
        }

        if !rounds.is_empty() {
            stats.avg_round_ms =
                rounds.iter().map(|r| r.duration_ms as f64).sum::<f64>() / rounds.len() as f64;
        }
        stats
    }
}

/// Results from a single experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Experiment configuration
    pub config: ExperimentConfig,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub ended_at: DateTime<Utc>,
    /// Session type id
    pub session_id: String,
    pub rounds: RoundStats,
    /// Every round summary, in round order
    pub round_history: Vec<RoundSummary>,
    pub agents: Vec<AgentReport>,
    /// Board rendering at the end of the run, if the environment draws one
    pub final_render: Option<String>,
}

impl ExperimentResult {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Rounds per second of wall-clock time.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration_ms() as f64 / 1000.0;
        if secs <= 0.0 {
            return 0.0;
        }
        self.rounds.total as f64 / secs
    }

    /// Mean return over every episode that ended with `done`, across agents.
    pub fn mean_episode_return(&self) -> Option<f64> {
        let returns: Vec<f64> = self
            .agents
            .iter()
            .flat_map(|a| a.episodes.iter())
            .filter(|e| !e.interrupted)
            .map(|e| e.episode_return)
            .collect();
        if returns.is_empty() {
            return None;
        }
        Some(returns.iter().sum::<f64>() / returns.len() as f64)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Summary statistics for one (environment, agent count) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub config_key: String,
    pub trials: usize,
    pub avg_rounds: f64,
    /// Mean round latency across trials
    pub avg_round_ms: f64,
    /// Standard error of `avg_round_ms`
    pub avg_round_ms_se: f64,
    pub avg_throughput: f64,
    /// Share of dispatched rounds that resolved to reset
    pub reset_round_fraction: f64,
    /// Share of rounds that aborted or timed out
    pub failure_rate: f64,
    pub avg_episode_return: Option<f64>,
}

/// Results from a sweep over agent counts and trials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResults {
    pub results: Vec<ExperimentResult>,
    pub summary: HashMap<String, ConfigSummary>,
}

impl SweepResults {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            summary: HashMap::new(),
        }
    }

    pub fn add(&mut self, result: ExperimentResult) {
        self.results.push(result);
    }

    /// Compute summary statistics.
    pub fn compute_summary(&mut self) {
        let mut by_config: HashMap<String, Vec<&ExperimentResult>> = HashMap::new();

        for result in &self.results {
            let key = format!(
                "{}:agents={}",
                result.config.env, result.config.agent_count
            );
            by_config.entry(key).or_default().push(result);
        }

        for (key, results) in by_config {
            let trials = results.len();
            let n = trials as f64;

            let latencies: Vec<f64> = results.iter().map(|r| r.rounds.avg_round_ms).collect();
            let avg_round_ms = latencies.iter().sum::<f64>() / n;

            // Standard error for continuous: SE = std_dev / sqrt(n)
            let avg_round_ms_se = if trials > 1 {
                let variance = latencies
                    .iter()
                    .map(|l| (l - avg_round_ms).powi(2))
                    .sum::<f64>()
                    / (n - 1.0);
                variance.sqrt() / n.sqrt()
            } else {
                0.0
            };

            let total_rounds: usize = results.iter().map(|r| r.rounds.total).sum();
            let dispatched: usize = results
                .iter()
                .map(|r| r.rounds.reset_rounds + r.rounds.step_rounds)
                .sum();
            let reset_rounds: usize = results.iter().map(|r| r.rounds.reset_rounds).sum();
            let failed: usize = results
                .iter()
                .map(|r| r.rounds.aborted + r.rounds.timed_out)
                .sum();

            let episode_returns: Vec<f64> = results
                .iter()
                .filter_map(|r| r.mean_episode_return())
                .collect();
            let avg_episode_return = (!episode_returns.is_empty())
                .then(|| episode_returns.iter().sum::<f64>() / episode_returns.len() as f64);

            self.summary.insert(
                key.clone(),
                ConfigSummary {
                    config_key: key,
                    trials,
                    avg_rounds: total_rounds as f64 / n,
                    avg_round_ms,
                    avg_round_ms_se,
                    avg_throughput: results.iter().map(|r| r.throughput()).sum::<f64>() / n,
                    reset_round_fraction: ratio(reset_rounds, dispatched),
                    failure_rate: ratio(failed, total_rounds),
                    avg_episode_return,
                },
            );
        }
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let results = serde_json::from_str(&json)?;
        Ok(results)
    }
}

impl Default for SweepResults {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Format a duration in milliseconds for display.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}
