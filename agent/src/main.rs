//! Multi-candidate coding agent.
//!
//! Runs one task to completion: the acting model proposes shell commands,
//! a verifier chooses among sampled candidates, and command output is fed
//! back until the model submits or a limit is hit.

use std::fs;
use std::path::{Path, PathBuf};

use agent::core::types::ExitStatus;
use agent::exit_codes;
use agent::io::config::{Config, DEFAULT_CONFIG_PATH, load_config, write_config};
use agent::looping::run_agent;
use agent::replay::ReplayOptions;
use agent::rollout::{RolloutOptions, run_rollouts};
use agent::step::{Agent, StepOutcome};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Map;
use tracing::debug;

#[derive(Parser)]
#[command(name = "agent", version, about = "Multi-candidate coding agent loop")]
struct Cli {
    /// Path to the TOML config.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the config file.
    Validate,
    /// Run the agent on one task.
    Run(RunArgs),
    /// Replay saved trajectories to a step and sample new continuations.
    Rollout(RolloutArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Task description.
    #[arg(short, long, conflicts_with = "task_file")]
    task: Option<String>,
    /// Read the task description from a file.
    #[arg(long)]
    task_file: Option<PathBuf>,
    /// Write the trajectory here (overrides `agent.output_path`).
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Override `agent.step_limit` (0 disables).
    #[arg(long)]
    step_limit: Option<u64>,
    /// Override `agent.cost_limit` (0 disables).
    #[arg(long)]
    cost_limit: Option<f64>,
}

#[derive(Args)]
struct RolloutArgs {
    /// Trajectory files to branch from.
    #[arg(required = true)]
    trajectories: Vec<PathBuf>,
    /// Action steps to replay before rolling out (0 starts after the task).
    #[arg(long, default_value_t = 1)]
    step: usize,
    /// Rollouts per trajectory.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    rollouts: u64,
    /// Agent steps per rollout.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    rollout_steps: u64,
    /// Directory for rollout trajectories and `rollouts.jsonl`.
    #[arg(short, long, default_value = "rollouts")]
    output: PathBuf,
    /// Drop the replayed assistant messages from the resumed conversation.
    #[arg(long)]
    exclude_thoughts: bool,
    /// Compare replayed observations with the recorded ones.
    #[arg(long)]
    verify_observations: bool,
    /// Shell command run in each fresh environment before replaying.
    #[arg(long)]
    startup_command: Option<String>,
}

impl RolloutArgs {
    fn options(&self) -> RolloutOptions {
        RolloutOptions {
            replay: ReplayOptions {
                target_step: self.step,
                include_thoughts: !self.exclude_thoughts,
                verify_observations: self.verify_observations,
            },
            rollouts: self.rollouts as usize,
            rollout_steps: self.rollout_steps,
            output_dir: self.output.clone(),
            startup_command: self.startup_command.clone(),
        }
    }
}

fn main() {
    agent::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::Rollout(args) => cmd_rollout(&cli.config, &args),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &Config::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    agent::model::build_model(&config.model).context("invalid [model] section")?;
    println!("ok");
    Ok(exit_codes::OK)
}

fn cmd_run(path: &Path, args: RunArgs) -> Result<i32> {
    let mut config = load_config(path)?;
    apply_overrides(&mut config, &args);
    let task = match (&args.task, &args.task_file) {
        (Some(task), _) => task.clone(),
        (None, Some(file)) => fs::read_to_string(file)
            .with_context(|| format!("read task file {}", file.display()))?,
        (None, None) => bail!("one of --task or --task-file is required"),
    };

    let mut agent = Agent::from_config(config, config_dir(path))?;
    let outcome = run_agent(&mut agent, &task, Map::new(), |step| match step {
        StepOutcome::Observed(observations) => {
            debug!(observations = observations.len(), "step observed");
        }
        StepOutcome::Recoverable { reason, .. } => debug!(?reason, "step recovered"),
        StepOutcome::Terminal { exit_status, .. } => {
            debug!(exit_status = exit_status.as_str(), "step ended run");
        }
    })?;

    eprintln!(
        "{} after {} steps ({} model calls, cost {:.4})",
        outcome.exit_status.as_str(),
        outcome.stats.step_count,
        outcome.stats.n_calls,
        outcome.stats.cost
    );
    Ok(match outcome.exit_status {
        ExitStatus::Submitted => {
            print!("{}", outcome.submission);
            exit_codes::OK
        }
        ExitStatus::LimitsExceeded => exit_codes::LIMITS_EXCEEDED,
    })
}

fn cmd_rollout(path: &Path, args: &RolloutArgs) -> Result<i32> {
    let config = load_config(path)?;
    let options = args.options();
    let mut failed = 0;
    for trajectory in &args.trajectories {
        match run_rollouts(trajectory, &config, config_dir(path), &options) {
            Ok(records) => {
                for record in records {
                    println!(
                        "{} #{}: {} after {} steps -> {}",
                        trajectory.display(),
                        record.rollout_index,
                        record.outcome,
                        record.rollout_steps_executed,
                        record.output_path.display()
                    );
                }
            }
            Err(err) => {
                eprintln!("{}: {:#}", trajectory.display(), err);
                failed += 1;
            }
        }
    }
    Ok(if failed == 0 {
        exit_codes::OK
    } else {
        exit_codes::ERROR
    })
}

/// Directory that relative config paths resolve against.
fn config_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(output) = &args.output {
        config.agent.output_path = Some(output.clone());
    }
    if let Some(step_limit) = args.step_limit {
        config.agent.step_limit = step_limit;
    }
    if let Some(cost_limit) = args.cost_limit {
        config.agent.cost_limit = cost_limit;
    }
}
