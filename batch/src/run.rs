//! Parallel dispatch of instances over a fixed pool of workers.
//!
//! Every instance gets its own agent, conversation and environment. A failing
//! instance is recorded and never affects its siblings. Cancellation stops
//! workers from claiming new instances; in-flight ones run to completion.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use agent::io::config::Config;
use agent::io::write_json;
use agent::looping::run_agent;
use agent::model::ModelConfig;
use agent::step::Agent;
use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::instances::Instance;
use crate::preds::PredsFile;

/// Shared flag checked by workers before they claim another instance.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub output_dir: PathBuf,
    pub workers: usize,
    pub config: Config,
    /// Directory prompt files in the config are resolved against.
    pub base_dir: PathBuf,
    /// Run instances that already have a prediction again.
    pub redo_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceResult {
    pub instance_id: String,
    pub exit_status: String,
    pub submission: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Results of the instances that ran, in input order.
    pub results: Vec<InstanceResult>,
    /// Instances skipped because they already had a prediction.
    pub existing: Vec<String>,
    /// Instances never started because the batch was cancelled.
    pub cancelled: Vec<String>,
}

/// Trajectory path of `instance_id` inside `output_dir`.
pub fn trajectory_path(output_dir: &Path, instance_id: &str) -> PathBuf {
    output_dir
        .join(instance_id)
        .join(format!("{instance_id}.traj.json"))
}

/// Run `instances` with `options.workers` workers and record the exit
/// statuses of this run in `exit_statuses_<timestamp>.json`.
#[instrument(skip_all, fields(output = %options.output_dir.display(), workers = options.workers))]
pub fn run_batch(
    instances: Vec<Instance>,
    options: &BatchOptions,
    cancel: &CancelToken,
) -> Result<BatchOutcome> {
    fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("create {}", options.output_dir.display()))?;
    let preds = PredsFile::new(&options.output_dir);

    let mut outcome = BatchOutcome::default();
    let pending: Vec<Instance> = if options.redo_existing {
        instances
    } else {
        let done = preds.load()?;
        let (existing, pending): (Vec<_>, Vec<_>) = instances
            .into_iter()
            .partition(|i| done.contains_key(&i.instance_id));
        outcome.existing = existing.into_iter().map(|i| i.instance_id).collect();
        pending
    };
    if !outcome.existing.is_empty() {
        info!(count = outcome.existing.len(), "skipping instances with existing predictions");
    }
    info!(count = pending.len(), "batch started");

    let model_name = model_name(&options.config.model);
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();
    let workers = options.workers.max(1).min(pending.len().max(1));

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let (next, pending, preds, model_name) = (&next, &pending, &preds, &model_name);
            scope.spawn(move || {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(instance) = pending.get(index) else {
                        break;
                    };
                    let result = process_instance(instance, options, preds, model_name)
                        .unwrap_or_else(|err| {
                            error!(instance_id = %instance.instance_id, err = %format!("{err:#}"), "instance setup failed");
                            InstanceResult {
                                instance_id: instance.instance_id.clone(),
                                exit_status: "Error".to_string(),
                                submission: String::new(),
                                error: Some(format!("{err:#}")),
                            }
                        });
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut finished: Vec<(usize, InstanceResult)> = rx.into_iter().collect();
    finished.sort_by_key(|(index, _)| *index);
    let started: Vec<usize> = finished.iter().map(|(index, _)| *index).collect();
    outcome.cancelled = pending
        .iter()
        .enumerate()
        .filter(|(index, _)| !started.contains(index))
        .map(|(_, i)| i.instance_id.clone())
        .collect();
    outcome.results = finished.into_iter().map(|(_, result)| result).collect();
    if !outcome.cancelled.is_empty() {
        warn!(count = outcome.cancelled.len(), "batch cancelled before all instances started");
    }

    write_exit_statuses(&options.output_dir, &outcome.results)?;
    info!(ran = outcome.results.len(), "batch finished");
    Ok(outcome)
}

/// Run one instance end to end. Agent failures are recorded in the result;
/// only setup failures (config, model, output files) are returned as errors.
#[instrument(skip_all, fields(instance_id = %instance.instance_id))]
fn process_instance(
    instance: &Instance,
    options: &BatchOptions,
    preds: &PredsFile,
    model_name: &str,
) -> Result<InstanceResult> {
    let id = &instance.instance_id;
    let traj_path = trajectory_path(&options.output_dir, id);
    preds.remove(id)?;
    if traj_path.exists() {
        fs::remove_file(&traj_path)
            .with_context(|| format!("remove stale trajectory {}", traj_path.display()))?;
    }

    let mut config = options.config.clone();
    config.agent.output_path = Some(traj_path);
    let mut agent = Agent::from_config(config, &options.base_dir)?;
    info!("instance started");

    let result = match run_agent(
        &mut agent,
        &instance.problem_statement,
        instance.template_vars(),
        |_| {},
    ) {
        Ok(outcome) => InstanceResult {
            instance_id: id.clone(),
            exit_status: outcome.exit_status.as_str().to_string(),
            submission: outcome.submission,
            error: None,
        },
        Err(err) => {
            let exit_status = agent
                .messages()
                .last()
                .and_then(|m| m.extra.exit_status.clone())
                .unwrap_or_else(|| "Error".to_string());
            warn!(exit_status = %exit_status, err = %format!("{err:#}"), "instance failed");
            InstanceResult {
                instance_id: id.clone(),
                exit_status,
                submission: String::new(),
                error: Some(format!("{err:#}")),
            }
        }
    };
    preds.update(id, model_name, &result.submission)?;
    info!(exit_status = %result.exit_status, "instance finished");
    Ok(result)
}

/// Name recorded as `model_name_or_path` in predictions.
pub fn model_name(config: &ModelConfig) -> String {
    match config {
        ModelConfig::Scripted(_) => "scripted".to_string(),
        ModelConfig::Command(cfg) if !cfg.model_name.is_empty() => cfg.model_name.clone(),
        ModelConfig::Command(cfg) => cfg
            .command
            .first()
            .cloned()
            .unwrap_or_else(|| "command".to_string()),
    }
}

fn write_exit_statuses(output_dir: &Path, results: &[InstanceResult]) -> Result<()> {
    let mut by_status: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for result in results {
        by_status
            .entry(result.exit_status.as_str())
            .or_default()
            .push(result.instance_id.as_str());
    }
    let path = output_dir.join(format!(
        "exit_statuses_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    write_json(&path, &by_status)
}
