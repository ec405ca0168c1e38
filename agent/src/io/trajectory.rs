//! Trajectory files: the full conversation plus run metadata.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::limits::RunStats;
use crate::core::types::Message;
use crate::io::write_json;

pub const TRAJECTORY_FORMAT: &str = "agent-trajectory-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub info: TrajectoryInfo,
    pub messages: Vec<Message>,
    pub trajectory_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub model_stats: ModelStats,
    pub config: Value,
    pub version: String,
    pub exit_status: String,
    pub submission: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub instance_cost: f64,
    pub api_calls: u64,
    pub step_count: u64,
    #[serde(default)]
    pub verifier_cost: f64,
    #[serde(default)]
    pub verifier_calls: u64,
}

impl From<&RunStats> for ModelStats {
    fn from(stats: &RunStats) -> Self {
        Self {
            instance_cost: stats.cost,
            api_calls: stats.n_calls,
            step_count: stats.step_count,
            verifier_cost: stats.verifier_cost,
            verifier_calls: stats.verifier_calls,
        }
    }
}

impl Trajectory {
    /// Snapshot a run. Exit status and submission come from the last message.
    pub fn new(messages: &[Message], stats: &RunStats, config: Value) -> Self {
        let last = messages.last().map(|m| &m.extra);
        Self {
            info: TrajectoryInfo {
                model_stats: ModelStats::from(stats),
                config,
                version: env!("CARGO_PKG_VERSION").to_string(),
                exit_status: last
                    .and_then(|e| e.exit_status.clone())
                    .unwrap_or_default(),
                submission: last.and_then(|e| e.submission.clone()).unwrap_or_default(),
            },
            messages: messages.to_vec(),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
        }
    }
}

/// Atomically write a trajectory to disk.
pub fn save_trajectory(path: &Path, trajectory: &Trajectory) -> Result<()> {
    debug!(path = %path.display(), messages = trajectory.messages.len(), "saving trajectory");
    write_json(path, trajectory).with_context(|| format!("write trajectory {}", path.display()))
}

/// A trajectory read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTrajectory {
    pub messages: Vec<Message>,
    /// `info.config` of a full trajectory document; `None` for a bare list.
    pub config: Option<Value>,
}

/// Load a trajectory file.
///
/// Accepts a full trajectory document or a bare JSON list of messages.
pub fn load_trajectory(path: &Path) -> Result<LoadedTrajectory> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read trajectory {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse trajectory {}", path.display()))?;
    let (messages, config) = match value {
        Value::Array(_) => (value, None),
        Value::Object(mut map) => {
            let Some(messages) = map.remove("messages") else {
                bail!("trajectory {} has no messages", path.display());
            };
            let config = map
                .get_mut("info")
                .and_then(|info| info.get_mut("config"))
                .map(Value::take)
                .filter(|config| !config.is_null());
            (messages, config)
        }
        _ => bail!("trajectory {} must be a list or an object", path.display()),
    };
    let messages = serde_json::from_value(messages)
        .with_context(|| format!("parse trajectory messages {}", path.display()))?;
    Ok(LoadedTrajectory { messages, config })
}

/// Load only the messages of a trajectory file.
pub fn load_messages(path: &Path) -> Result<Vec<Message>> {
    load_trajectory(path).map(|loaded| loaded.messages)
}
