//! Execution environments for agent actions.
//!
//! The [`Environment`] trait decouples the step engine from where commands
//! actually run. [`LocalEnvironment`] runs them through `sh` on this host;
//! tests use scripted environments that return canned outputs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::types::{Action, ExecOutput};
use crate::io::process::run_command_with_timeout;

/// First output line that marks the task as complete.
pub const SUBMIT_MARKER: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

/// What happened when an action ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The command ran (successfully or not, including timeouts).
    Completed(ExecOutput),
    /// The command signalled task completion; carries the submission text.
    Submitted(String),
}

/// Abstraction over command execution backends.
///
/// `Err` is reserved for failures of the environment itself. A command that
/// fails, times out or cannot be spawned is reported as
/// [`Execution::Completed`] so the model can react to it.
pub trait Environment: Send {
    fn execute(&mut self, action: &Action) -> Result<Execution>;

    /// Variables exposed to prompt templates.
    fn template_vars(&self) -> Value {
        json!({})
    }
}

/// Settings for [`LocalEnvironment`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Working directory for commands. Defaults to the process cwd.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables set for every command.
    pub env: BTreeMap<String, String>,
    /// Per-command wall-clock limit in seconds.
    pub timeout_secs: u64,
    /// Keep at most this many bytes of command output.
    pub output_limit_bytes: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            timeout_secs: 30,
            output_limit_bytes: 100_000,
        }
    }
}

/// Runs each action as `sh -c <command>` with stderr folded into stdout.
#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    config: EnvironmentConfig,
}

impl LocalEnvironment {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

impl Environment for LocalEnvironment {
    #[instrument(skip_all, fields(timeout_secs = self.config.timeout_secs))]
    fn execute(&mut self, action: &Action) -> Result<Execution> {
        debug!(command = %action.command, "executing action");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("exec 2>&1\n{}", action.command));
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.config.env);

        let output = match run_command_with_timeout(
            cmd,
            None,
            self.timeout(),
            self.config.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "action could not be run");
                return Ok(Execution::Completed(ExecOutput::failed(
                    "",
                    format!("An error occurred while executing the command: {err:#}"),
                )));
            }
        };

        let text = output.stdout_text();
        if output.timed_out {
            return Ok(Execution::Completed(ExecOutput::failed(
                text,
                format!(
                    "The command timed out after {} seconds and was killed. Output produced before the timeout is shown below.",
                    self.config.timeout_secs
                ),
            )));
        }

        let returncode = output.status.code().unwrap_or(-1);
        if let Some(submission) = detect_submission(&text, returncode) {
            debug!("submission marker detected");
            return Ok(Execution::Submitted(submission));
        }
        Ok(Execution::Completed(ExecOutput::completed(text, returncode)))
    }

    fn template_vars(&self) -> Value {
        json!({
            "environment": self.config,
            "system": std::env::consts::OS,
            "machine": std::env::consts::ARCH,
        })
    }
}

/// Return the submission text when the first non-blank output line is the
/// submit marker and the command succeeded.
pub fn detect_submission(output: &str, returncode: i32) -> Option<String> {
    if returncode != 0 {
        return None;
    }
    let trimmed = output.trim_start();
    let mut lines = trimmed.split_inclusive('\n');
    let first = lines.next()?;
    if first.trim() != SUBMIT_MARKER {
        return None;
    }
    Some(lines.collect())
}
