//! Summary of a batch output directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use agent::io::trajectory::TrajectoryInfo;
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::preds::PredsFile;
use crate::run::trajectory_path;

#[derive(Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub instances: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_cost: f64,
    pub total_api_calls: u64,
    pub avg_steps: Option<f64>,
    pub predictions: usize,
    pub empty_predictions: usize,
}

#[derive(Deserialize)]
struct TrajectoryHeader {
    info: TrajectoryInfo,
}

/// Instance directories under `output_dir`, sorted.
pub fn instance_dirs(output_dir: &Path) -> Result<Vec<PathBuf>> {
    if !output_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(output_dir).with_context(|| format!("read {}", output_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Aggregate every trajectory and the predictions file in `output_dir`.
///
/// Unreadable trajectories are skipped and reported as warnings.
pub fn summarize(output_dir: &Path) -> Result<(BatchSummary, Vec<String>)> {
    let mut summary = BatchSummary::default();
    let mut warnings = Vec::new();
    let mut total_steps = 0u64;

    for dir in instance_dirs(output_dir)? {
        let Some(id) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let path = trajectory_path(output_dir, id);
        let header: TrajectoryHeader = match fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|contents| serde_json::from_str(&contents).context("parse trajectory"))
        {
            Ok(header) => header,
            Err(err) => {
                warnings.push(format!("skip {}: {err:#}", dir.display()));
                continue;
            }
        };

        let info = header.info;
        summary.instances += 1;
        let status = if info.exit_status.is_empty() {
            "Unfinished".to_string()
        } else {
            info.exit_status
        };
        *summary.by_status.entry(status).or_default() += 1;
        summary.total_cost += info.model_stats.instance_cost + info.model_stats.verifier_cost;
        summary.total_api_calls += info.model_stats.api_calls + info.model_stats.verifier_calls;
        total_steps += info.model_stats.step_count;
    }
    if summary.instances > 0 {
        summary.avg_steps = Some(total_steps as f64 / summary.instances as f64);
    }

    let preds = PredsFile::new(output_dir).load()?;
    summary.predictions = preds.len();
    summary.empty_predictions = preds
        .values()
        .filter(|p| p.model_patch.trim().is_empty())
        .count();

    Ok((summary, warnings))
}
