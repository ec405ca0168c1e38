use std::path::{Path, PathBuf};

use agent::io::config::{DEFAULT_CONFIG_PATH, load_config};
use agent::model::build_model;
use anyhow::{Context, Result};
use clap::Args;
use regex::Regex;

use crate::instances::{InstanceFilter, load_instances, select_instances};
use crate::run::{BatchOptions, CancelToken, run_batch};
use crate::{interrupt, logging, report};

pub const LOG_FILE: &str = "batch.log";

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON list of `{instance_id, problem_statement, ...}` objects.
    pub instances: PathBuf,
    /// Directory for trajectories, `preds.json` and logs.
    #[arg(short, long)]
    pub output: PathBuf,
    /// Agent config shared by every instance.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,
    /// Only run instances whose id matches this regex.
    #[arg(long)]
    pub filter: Option<String>,
    /// `start:stop` slice of the (filtered) instances.
    #[arg(long)]
    pub slice: Option<String>,
    /// Shuffle instances with a fixed seed before filtering.
    #[arg(long)]
    pub shuffle: bool,
    /// Run instances that already have a prediction again.
    #[arg(long)]
    pub redo_existing: bool,
}

pub fn run_instances(args: RunArgs) -> Result<()> {
    logging::init(Some(&args.output.join(LOG_FILE)))?;

    let config = load_config(&args.config)?;
    build_model(&config.model).context("model config")?;
    let base_dir = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let selection = InstanceFilter {
        filter: args
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid --filter")?,
        slice: args.slice.clone(),
        shuffle: args.shuffle,
    };
    let instances = select_instances(load_instances(&args.instances)?, &selection)?;

    let cancel = CancelToken::default();
    interrupt::install(cancel.clone())?;
    let options = BatchOptions {
        output_dir: args.output.clone(),
        workers: args.workers,
        config,
        base_dir,
        redo_existing: args.redo_existing,
    };
    let outcome = run_batch(instances, &options, &cancel)?;

    for result in &outcome.results {
        match &result.error {
            Some(err) => println!("{}: {} ({err})", result.instance_id, result.exit_status),
            None => println!("{}: {}", result.instance_id, result.exit_status),
        }
    }
    println!(
        "batch: ran={} existing={} cancelled={}",
        outcome.results.len(),
        outcome.existing.len(),
        outcome.cancelled.len()
    );
    Ok(())
}

pub fn print_summary(output: &Path) -> Result<()> {
    let (summary, warnings) = report::summarize(output)?;
    println!("summary: instances={}", summary.instances);
    for (status, count) in &summary.by_status {
        println!("summary: status {status} {count}");
    }
    println!(
        "summary: cost={:.4} api_calls={}",
        summary.total_cost, summary.total_api_calls
    );
    if let Some(avg) = summary.avg_steps {
        println!("summary: avg_steps={avg:.2}");
    }
    println!(
        "summary: predictions={} empty={}",
        summary.predictions, summary.empty_predictions
    );
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
