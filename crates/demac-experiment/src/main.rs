//! DEMAC experiment CLI.
//!
//! Commands:
//! - run: Run a single session with N agents
//! - sweep: Run agent counts × trials and summarize
//! - list: Show the available environments

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use demac_experiment::envs::EnvKind;
use demac_experiment::experiment::{ExperimentRunner, ExperimentRunnerConfig};
use demac_experiment::results::{SweepResults, format_duration};

/// Generate a timestamped output path from the given path.
/// e.g., "sweep.json" -> "sweep-20260108-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

#[derive(Parser)]
#[command(name = "demac-experiment")]
#[command(version)]
#[command(about = "Barrier-synchronized multi-agent sessions over a shared environment")]
struct Cli {
    /// JSON file with environment settings
    #[arg(long, env = "DEMAC_ENV_CONFIG")]
    config: Option<PathBuf>,

    /// Abort rounds that do not fill within this many milliseconds
    #[arg(long)]
    barrier_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single session
    Run {
        /// Environment to use
        #[arg(long, default_value = "trivial")]
        env: String,

        /// Number of agents
        #[arg(long, default_value = "4")]
        agents: usize,

        /// Requests per agent
        #[arg(long, default_value = "200")]
        steps: usize,

        /// Chance an agent forces a reset instead of stepping
        #[arg(long, default_value = "0.0")]
        reset_probability: f64,

        /// Directory for per-agent transcripts and result.json
        #[arg(long)]
        exp_path: Option<PathBuf>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run a sweep over agent counts
    Sweep {
        /// Environment to use
        #[arg(long, default_value = "trivial")]
        env: String,

        /// Number of trials per configuration
        #[arg(long, default_value = "5")]
        trials: usize,

        /// Requests per agent
        #[arg(long, default_value = "200")]
        steps: usize,

        /// Chance an agent forces a reset instead of stepping
        #[arg(long, default_value = "0.0")]
        reset_probability: f64,

        /// Agent counts to test (comma-separated)
        #[arg(long, default_value = "1,2,4,8", value_delimiter = ',')]
        agents: Vec<usize>,

        /// Output file for results
        #[arg(long, default_value = "sweep.json")]
        output: PathBuf,
    },

    /// List available environments
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Commands::Run {
            env,
            agents,
            steps,
            reset_probability,
            exp_path,
            seed,
        } => {
            let env_kind: EnvKind = env.parse()?;
            let config = ExperimentRunnerConfig {
                steps,
                reset_probability,
                barrier_timeout_ms: cli.barrier_timeout_ms,
                env_config: cli.config,
                exp_path,
            };

            let runner = ExperimentRunner::new(config);
            let result = runner.run(env_kind, agents, 0, seed).await?;

            println!("\n=== Session Result ===");
            println!("Environment: {}", result.config.env);
            println!("Agents: {}", result.config.agent_count);
            println!("Seed: {}", result.config.seed);
            println!("Duration: {}", format_duration(result.duration_ms()));

            println!("\nRounds:");
            println!("  Total: {}", result.rounds.total);
            println!("  Delivered: {}", result.rounds.delivered);
            println!("  Aborted: {}", result.rounds.aborted);
            println!("  Timed out: {}", result.rounds.timed_out);
            println!(
                "  Step / reset: {} / {}",
                result.rounds.step_rounds, result.rounds.reset_rounds
            );
            println!(
                "  Avg latency: {:.2}ms (max {}ms)",
                result.rounds.avg_round_ms, result.rounds.max_round_ms
            );
            println!("  Throughput: {:.1} rounds/s", result.throughput());

            println!("\nPer-Agent:");
            println!(
                "  {:>6} {:>6} {:>7} {:>10} {:>9} {:>8}",
                "Agent", "Steps", "Resets", "Overridden", "Episodes", "Return"
            );
            for agent in &result.agents {
                println!(
                    "  {:>6} {:>6} {:>7} {:>10} {:>9} {:>8.1}",
                    agent.agent_id,
                    agent.steps,
                    agent.resets_requested,
                    agent.overridden_steps,
                    agent.episodes.len(),
                    agent.total_reward
                );
            }

            if let Some(mean) = result.mean_episode_return() {
                println!("\nMean episode return: {:.2}", mean);
            }
            if let Some(board) = &result.final_render {
                println!("\nFinal board:\n{}", board);
            }
        }

        Commands::Sweep {
            env,
            trials,
            steps,
            reset_probability,
            agents,
            output,
        } => {
            let env_kind: EnvKind = env.parse()?;
            info!(env = env_kind.name(), trials = trials, "Starting sweep");

            let mut results = SweepResults::new();
            let total = agents.len() * trials;
            let mut completed = 0;

            for &agent_count in &agents {
                for trial in 0..trials {
                    let config = ExperimentRunnerConfig {
                        steps,
                        reset_probability,
                        barrier_timeout_ms: cli.barrier_timeout_ms,
                        env_config: cli.config.clone(),
                        exp_path: None,
                    };

                    let runner = ExperimentRunner::new(config);
                    let result = runner.run(env_kind, agent_count, trial, None).await?;
                    results.add(result);
                    completed += 1;

                    info!(
                        progress = format!("{}/{}", completed, total),
                        agents = agent_count,
                        trial = trial,
                        "Completed run"
                    );
                }
            }

            results.compute_summary();
            let output_path = timestamped_path(&output);
            results.save(&output_path)?;

            println!("\n=== Sweep Complete ===");
            println!("Results saved to: {}", output_path.display());
            println!("\nSummary:");
            let mut keys: Vec<_> = results.summary.keys().cloned().collect();
            keys.sort();
            for key in keys {
                let summary = &results.summary[&key];
                println!(
                    "  {}: rounds={:.0}, latency={:.2}±{:.2}ms, {:.0} rounds/s, resets={:.1}%, failures={:.1}%",
                    key,
                    summary.avg_rounds,
                    summary.avg_round_ms,
                    summary.avg_round_ms_se,
                    summary.avg_throughput,
                    summary.reset_round_fraction * 100.0,
                    summary.failure_rate * 100.0
                );
            }
        }

        Commands::List => {
            println!("Available environments:");
            for kind in EnvKind::all() {
                println!("  {:<8} {}", kind.name(), kind.description());
            }
        }
    }

    Ok(())
}
