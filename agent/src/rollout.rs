//! Monte Carlo rollouts branching from step K of a saved trajectory.
//!
//! Every rollout gets a fresh local environment, replays the first K action
//! steps of the trajectory in it, then resumes the agent for a bounded number
//! of new steps. Each rollout is saved as its own trajectory and summarized
//! as one line of `rollouts.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::core::types::{Action, ExitStatus, Message, Role};
use crate::io::config::Config;
use crate::io::environment::{Environment, Execution, LocalEnvironment};
use crate::io::trajectory::load_trajectory;
use crate::looping::resume_agent;
use crate::model::build_model;
use crate::replay::{ObservationMismatch, ReplayOptions, ReplayedAction, replay_to_step};
use crate::step::Agent;

pub const ROLLOUT_SUMMARY_FILE: &str = "rollouts.jsonl";
/// Outcome of a rollout that used up its step budget without submitting.
pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";

#[derive(Debug, Clone, PartialEq)]
pub struct RolloutOptions {
    pub replay: ReplayOptions,
    pub rollouts: usize,
    /// Agent steps per rollout.
    pub rollout_steps: u64,
    pub output_dir: PathBuf,
    /// Run once in each fresh environment before replaying.
    pub startup_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutRecord {
    pub trajectory: PathBuf,
    pub rollout_index: usize,
    pub step: usize,
    pub replayed_steps: usize,
    pub total_action_steps: usize,
    pub rollout_steps_requested: u64,
    pub rollout_steps_executed: u64,
    pub outcome: String,
    pub output_path: PathBuf,
    pub model_cost: f64,
    pub model_calls: u64,
    pub replayed_actions: Vec<ReplayedAction>,
    pub mismatches: Vec<ObservationMismatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run `options.rollouts` rollouts from `trajectory`.
///
/// Agent, action and verifier settings come from the config recorded in the
/// trajectory when it has one; model and environment always come from
/// `base`. Agent failures are recorded in the rollout's outcome. Replay or
/// setup failures abort and are returned.
#[instrument(skip_all, fields(trajectory = %trajectory.display(), step = options.replay.target_step))]
pub fn run_rollouts(
    trajectory: &Path,
    base: &Config,
    base_dir: &Path,
    options: &RolloutOptions,
) -> Result<Vec<RolloutRecord>> {
    if options.rollouts == 0 || options.rollout_steps == 0 {
        bail!("rollouts and rollout steps must both be at least 1");
    }
    let loaded = load_trajectory(trajectory)?;
    let config = rollout_config(loaded.config, base);
    let task = loaded
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(Message::text)
        .unwrap_or_default();

    fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("create {}", options.output_dir.display()))?;
    let summary_path = options.output_dir.join(ROLLOUT_SUMMARY_FILE);
    let run_dir = options.output_dir.join(trajectory_name(trajectory));

    let mut records = Vec::with_capacity(options.rollouts);
    for index in 0..options.rollouts {
        let output_path = run_dir.join(format!("rollout_{index:04}.traj.json"));
        let mut record = run_one(&loaded.messages, &task, &config, base_dir, options, &output_path)
            .with_context(|| format!("rollout {index} of {}", trajectory.display()))?;
        record.trajectory = trajectory.to_path_buf();
        record.rollout_index = index;
        append_record(&summary_path, &record)?;
        info!(index, outcome = %record.outcome, "rollout finished");
        records.push(record);
    }
    Ok(records)
}

fn run_one(
    messages: &[Message],
    task: &str,
    config: &Config,
    base_dir: &Path,
    options: &RolloutOptions,
    output_path: &Path,
) -> Result<RolloutRecord> {
    let mut config = config.clone();
    config.agent.step_limit = options.rollout_steps;
    config.agent.output_path = Some(output_path.to_path_buf());

    let mut env = LocalEnvironment::new(config.environment.clone());
    if let Some(command) = &options.startup_command {
        run_startup(&mut env, command)?;
    }
    let replay = replay_to_step(messages, &config, &mut env, &options.replay)?;
    if !replay.mismatches.is_empty() {
        warn!(count = replay.mismatches.len(), "replayed observations differ from the trajectory");
    }

    let model = build_model(&config.model).context("build model")?;
    let mut agent = Agent::new(config, model, Box::new(env), base_dir)?;
    let mut extra = Map::new();
    extra.insert("task".to_string(), json!(task));
    let (outcome, error) = match resume_agent(&mut agent, replay.history, extra, |_| {}) {
        Ok(run)
            if run.exit_status == ExitStatus::LimitsExceeded
                && run.stats.step_count >= options.rollout_steps =>
        {
            (ROLLOUT_COMPLETE.to_string(), None)
        }
        Ok(run) => (run.exit_status.as_str().to_string(), None),
        Err(err) => {
            let status = agent
                .messages()
                .last()
                .and_then(|m| m.extra.exit_status.clone())
                .unwrap_or_else(|| "Error".to_string());
            warn!(status = %status, err = %format!("{err:#}"), "rollout failed");
            (status, Some(format!("{err:#}")))
        }
    };

    let stats = *agent.stats();
    Ok(RolloutRecord {
        trajectory: PathBuf::new(),
        rollout_index: 0,
        step: options.replay.target_step,
        replayed_steps: replay.replayed_steps,
        total_action_steps: replay.total_action_steps,
        rollout_steps_requested: options.rollout_steps,
        rollout_steps_executed: stats.step_count,
        outcome,
        output_path: output_path.to_path_buf(),
        model_cost: stats.cost,
        model_calls: stats.n_calls,
        replayed_actions: replay.actions,
        mismatches: replay.mismatches,
        error,
    })
}

/// Config for rollouts: the recorded one when readable, with model and
/// environment taken from `base`.
fn rollout_config(recorded: Option<Value>, base: &Config) -> Config {
    let mut config = match recorded.map(serde_json::from_value::<Config>) {
        Some(Ok(config)) => config,
        Some(Err(err)) => {
            warn!(err = %err, "trajectory config unreadable, using the given config");
            base.clone()
        }
        None => base.clone(),
    };
    config.model = base.model.clone();
    config.environment = base.environment.clone();
    config
}

fn run_startup(env: &mut LocalEnvironment, command: &str) -> Result<()> {
    match env.execute(&Action::new(command))? {
        Execution::Completed(output) if output.returncode == 0 => Ok(()),
        Execution::Completed(output) => bail!(
            "startup command exited with {}: {}",
            output.returncode,
            output.output.trim_end()
        ),
        Execution::Submitted(_) => bail!("startup command printed the submit marker"),
    }
}

/// `name` for `name.traj.json`, otherwise the file stem.
fn trajectory_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.strip_suffix(".traj.json") {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trajectory".to_string()),
    }
}

fn append_record(path: &Path, record: &RolloutRecord) -> Result<()> {
    let line = serde_json::to_string(record).context("serialize rollout record")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))
}
