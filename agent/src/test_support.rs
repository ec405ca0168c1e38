//! Test-only helpers: a scripted environment and response builders.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};

use crate::core::types::{Action, ExecOutput};
use crate::io::config::{Config, write_config};
use crate::io::environment::{Environment, Execution};

/// Wrap `command` in the fenced block the default action regex expects.
pub fn bash(command: &str) -> String {
    format!("THOUGHT: next step.\n\n```bash\n{command}\n```")
}

/// Environment that replays canned executions and records the commands it
/// was asked to run. Clones share state, so a test can keep one handle
/// while the agent owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEnvironment {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<Execution>,
    executed: Vec<String>,
}

impl ScriptedEnvironment {
    pub fn new(outputs: Vec<ExecOutput>) -> Self {
        let env = Self::default();
        for output in outputs {
            env.push(Execution::Completed(output));
        }
        env
    }

    pub fn then_output(self, output: ExecOutput) -> Self {
        self.push(Execution::Completed(output));
        self
    }

    pub fn then_submit(self, submission: &str) -> Self {
        self.push(Execution::Submitted(submission.to_string()));
        self
    }

    /// Commands executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .executed
            .clone()
    }

    fn push(&self, execution: Execution) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replies
            .push_back(execution);
    }
}

impl Environment for ScriptedEnvironment {
    fn execute(&mut self, action: &Action) -> Result<Execution> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.executed.push(action.command.clone());
        state
            .replies
            .pop_front()
            .ok_or_else(|| anyhow!("scripted environment has no reply for {:?}", action.command))
    }
}

/// Write `config` as `agent.toml` inside `dir` and return its path.
pub fn write_config_in(dir: &Path, config: &Config) -> Result<PathBuf> {
    let path = dir.join("agent.toml");
    write_config(&path, config)?;
    Ok(path)
}

/// Fresh temporary directory for a test workspace.
pub fn temp_workspace() -> Result<tempfile::TempDir> {
    Ok(tempfile::tempdir()?)
}
