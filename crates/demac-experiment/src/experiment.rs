//! Experiment runner: N random-policy agents sharing one environment
//! through a coordinator session.

use std::path::{Path, PathBuf};

use acton_reactive::prelude::*;
use anyhow::{Context, Result, ensure};
use chrono::Utc;
use futures::future::join_all;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use demac_kernel::{
    ActionValue, AgentEnvWrapper, AgentMessage, CoordinatorConfig, RoundSummary, Session, Space,
};

use crate::envs::EnvKind;
use crate::observer::RoundObserver;
use crate::results::{AgentReport, ExperimentConfig, ExperimentResult, RoundStats};

/// Configuration for the experiment runner.
#[derive(Debug, Clone)]
pub struct ExperimentRunnerConfig {
    /// Requests each agent submits
    pub steps: usize,
    /// Chance, per request, that an agent resets instead of stepping
    pub reset_probability: f64,
    /// Coordinator barrier timeout
    pub barrier_timeout_ms: Option<u64>,
    /// JSON file with environment settings
    pub env_config: Option<PathBuf>,
    /// Directory for per-agent transcripts and `result.json`
    pub exp_path: Option<PathBuf>,
}

impl Default for ExperimentRunnerConfig {
    fn default() -> Self {
        Self {
            steps: 200,
            reset_probability: 0.0,
            barrier_timeout_ms: None,
            env_config: None,
            exp_path: None,
        }
    }
}

/// What a single agent task hands back.
struct AgentRun {
    report: AgentReport,
    transcript: Vec<AgentMessage>,
}

/// The experiment runner.
pub struct ExperimentRunner {
    config: ExperimentRunnerConfig,
}

impl ExperimentRunner {
    /// Create a new experiment runner.
    pub fn new(config: ExperimentRunnerConfig) -> Self {
        Self { config }
    }

    /// Run a single experiment.
    pub async fn run(
        &self,
        env_kind: EnvKind,
        agent_count: usize,
        trial: usize,
        seed: Option<u64>,
    ) -> Result<ExperimentResult> {
        ensure!(agent_count > 0, "at least one agent is required");
        ensure!(
            (0.0..=1.0).contains(&self.config.reset_probability),
            "reset_probability must be within [0, 1]"
        );

        let seed = seed.unwrap_or_else(rand::random);
        let started_at = Utc::now();

        info!(
            env = env_kind.name(),
            agents = agent_count,
            steps = self.config.steps,
            trial = trial,
            seed = seed,
            "Starting experiment"
        );

        let env = env_kind.build(agent_count, seed, self.config.env_config.as_deref())?;
        let agent_ids = env
            .agent_ids()
            .unwrap_or_else(|| crate::envs::agent_names(agent_count));

        let mut runtime = ActonApp::launch_async().await;

        let coordinator_config = CoordinatorConfig {
            barrier_timeout_ms: self.config.barrier_timeout_ms,
            ..Default::default()
        };
        let session = Session::spawn(coordinator_config, env, &mut runtime).await;

        // Collect RoundComplete summaries while the agents run
        let (round_tx, round_rx) = mpsc::channel::<RoundSummary>(1000);
        let observer = RoundObserver::new(round_tx).spawn(&mut runtime).await;
        session.observe_rounds(observer).await;
        let collector = tokio::spawn(collect_rounds(round_rx));

        let mut wrappers = Vec::with_capacity(agent_ids.len());
        for agent_id in &agent_ids {
            let channel = session.register(agent_id.clone()).await?;
            let wrapper = AgentEnvWrapper::new(channel);
            wrappers.push(if self.config.exp_path.is_some() {
                wrapper.with_transcript()
            } else {
                wrapper
            });
        }

        let tasks = wrappers.into_iter().enumerate().map(|(i, wrapper)| {
            let agent_seed = seed.wrapping_add(i as u64 + 1);
            tokio::spawn(drive_agent(
                wrapper,
                self.config.steps,
                self.config.reset_probability,
                agent_seed,
            ))
        });

        let mut runs = Vec::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok(run) => runs.push(run),
                Err(e) => warn!(error = %e, "Agent task panicked"),
            }
        }

        let final_render = session.render().await;
        session.close().await;

        // Stopping the observer drops the last sender, which ends the collector
        if let Err(e) = runtime.shutdown_all().await {
            warn!(error = ?e, "Runtime shutdown reported an error");
        }
        let round_history = collector.await.unwrap_or_default();
        let ended_at = Utc::now();

        if let Some(exp_path) = &self.config.exp_path {
            write_transcripts(exp_path, &runs)?;
        }

        let result = ExperimentResult {
            config: ExperimentConfig {
                env: env_kind.name().to_string(),
                agent_count,
                steps: self.config.steps,
                seed,
                reset_probability: self.config.reset_probability,
                barrier_timeout_ms: self.config.barrier_timeout_ms,
                trial,
            },
            started_at,
            ended_at,
            session_id: session.id().to_string(),
            rounds: RoundStats::from_summaries(&round_history),
            round_history,
            agents: runs.into_iter().map(|run| run.report).collect(),
            final_render,
        };

        if let Some(exp_path) = &self.config.exp_path {
            result.save(exp_path.join("result.json"))?;
        }

        info!(
            env = env_kind.name(),
            agents = agent_count,
            rounds = result.rounds.total,
            reset_rounds = result.rounds.reset_rounds,
            aborted = result.rounds.aborted + result.rounds.timed_out,
            duration_ms = result.duration_ms(),
            "Experiment complete"
        );

        Ok(result)
    }
}

/// Drain round summaries until every sender is gone.
async fn collect_rounds(mut rx: mpsc::Receiver<RoundSummary>) -> Vec<RoundSummary> {
    let mut rounds = Vec::new();
    while let Some(summary) = rx.recv().await {
        rounds.push(summary);
    }
    rounds.sort_by_key(|r| r.round);
    rounds
}

/// Random policy over the agent's discrete action space.
///
/// The first request is always a reset, as is the first request after an
/// episode ends or a round fails. Otherwise the agent forces a reset with
/// `reset_probability`.
async fn drive_agent(
    mut env: AgentEnvWrapper,
    steps: usize,
    reset_probability: f64,
    seed: u64,
) -> AgentRun {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let actions = match env.action_space().await {
        Some(Space::Discrete { n }) if n > 0 => n as i64,
        _ => 2,
    };

    let mut report = AgentReport {
        agent_id: env.agent_id().clone(),
        steps: 0,
        resets_requested: 0,
        overridden_steps: 0,
        total_reward: 0.0,
        episodes: Vec::new(),
        errors: Vec::new(),
    };
    let mut needs_reset = true;

    for _ in 0..steps {
        let outcome = if needs_reset || rng.random_bool(reset_probability) {
            report.resets_requested += 1;
            env.reset().await.map(|_| false)
        } else {
            let action = ActionValue::Discrete(rng.random_range(0..actions));
            env.step(action).await.map(|transition| {
                if transition.overridden {
                    report.overridden_steps += 1;
                    return false;
                }
                report.steps += 1;
                report.total_reward += transition.reward;
                transition.done
            })
        };

        match outcome {
            Ok(done) => needs_reset = done,
            Err(err) if err.is_round_level() => {
                debug!(agent = %report.agent_id, error = %err, "Round failed, resetting");
                report.errors.push(err.to_string());
                needs_reset = true;
            }
            Err(err) => {
                warn!(agent = %report.agent_id, error = %err, "Agent stopping");
                report.errors.push(err.to_string());
                break;
            }
        }
    }

    report.episodes = env.episode_stats().completed.clone();
    let transcript = env.take_transcript();
    AgentRun { report, transcript }
}

/// Write `<exp_path>/<agent_id>/transcript.jsonl` for every agent.
fn write_transcripts(exp_path: &Path, runs: &[AgentRun]) -> Result<()> {
    for run in runs {
        let dir = exp_path.join(run.report.agent_id.as_str());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut lines = String::new();
        for record in &run.transcript {
            lines.push_str(&record.to_json()?);
            lines.push('\n');
        }
        std::fs::write(dir.join("transcript.jsonl"), lines)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trivial_run_dispatches_one_round_per_step() {
        let config = ExperimentRunnerConfig {
            steps: 20,
            ..Default::default()
        };
        let runner = ExperimentRunner::new(config);
        let result = runner.run(EnvKind::Trivial, 3, 0, Some(42)).await.unwrap();

        assert_eq!(result.agents.len(), 3);
        assert_eq!(result.rounds.total, 20);
        assert_eq!(result.rounds.delivered, 20);
        let numbers: Vec<u64> = result.round_history.iter().map(|r| r.round).collect();
        assert_eq!(numbers, (0..20).collect::<Vec<u64>>(), "Every round is reported");
        assert!(result.rounds.reset_rounds >= 1, "First round is a reset");
        for agent in &result.agents {
            assert!(agent.errors.is_empty());
            assert_eq!(agent.steps + agent.resets_requested + agent.overridden_steps, 20);
        }
    }

    #[tokio::test]
    async fn test_forced_resets_override_other_agents() {
        let config = ExperimentRunnerConfig {
            steps: 40,
            reset_probability: 0.3,
            ..Default::default()
        };
        let runner = ExperimentRunner::new(config);
        let result = runner.run(EnvKind::Meteor, 3, 0, Some(7)).await.unwrap();

        let overridden: usize = result.agents.iter().map(|a| a.overridden_steps).sum();
        assert!(overridden > 0);
        assert!(result.final_render.is_some());
    }

    #[tokio::test]
    async fn test_exp_path_gets_transcripts_and_result() {
        let exp_path = std::env::temp_dir().join(format!("demac-exp-{}", std::process::id()));
        let config = ExperimentRunnerConfig {
            steps: 5,
            exp_path: Some(exp_path.clone()),
            ..Default::default()
        };
        let runner = ExperimentRunner::new(config);
        runner.run(EnvKind::Trivial, 2, 0, Some(1)).await.unwrap();

        let transcript = std::fs::read_to_string(exp_path.join("0").join("transcript.jsonl")).unwrap();
        let records: Vec<AgentMessage> = transcript
            .lines()
            .map(|line| AgentMessage::from_json(line).unwrap())
            .collect();
        assert_eq!(records.len(), 10);
        assert!(records[0].clone().into_request().is_ok());
        assert!(exp_path.join("result.json").exists());

        let _ = std::fs::remove_dir_all(&exp_path);
    }

    #[tokio::test]
    async fn test_zero_agents_rejected() {
        let runner = ExperimentRunner::new(ExperimentRunnerConfig::default());
        assert!(runner.run(EnvKind::Trivial, 0, 0, Some(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_collector_ends_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(collect_rounds(rx));
        for round in [1, 0] {
            let summary = RoundSummary {
                round,
                kind: None,
                agents: Vec::new(),
                outcome: demac_kernel::RoundOutcome::Delivered,
                duration_ms: 0,
            };
            tx.send(summary).await.unwrap();
        }
        drop(tx);

        let rounds = collector.await.unwrap();
        assert_eq!(rounds.iter().map(|r| r.round).collect::<Vec<_>>(), vec![0, 1]);
    }
}
