//! Agent configuration stored as TOML (default `agent.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::actions::ActionMode;
use crate::core::limits::Limits;
use crate::io::environment::EnvironmentConfig;
use crate::model::ModelConfig;

pub const DEFAULT_CONFIG_PATH: &str = "agent.toml";
pub const MAX_REWARD_WORKERS: usize = 8;

const SYSTEM_TEMPLATE: &str = "You are a helpful assistant that can interact with a computer shell to solve programming tasks.
Your response must contain exactly ONE bash code block with ONE command (or commands connected with && or ||).
Include a THOUGHT section before your command where you explain your reasoning.

<format_example>
THOUGHT: Your reasoning and analysis here

```bash
your_command_here
```
</format_example>";

const INSTANCE_TEMPLATE: &str = "Please solve this task:

{{ task }}

When you are done, run a command whose first output line is COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT followed by your final output, for example:

```bash
echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT && git diff
```";

const ACTION_REGEX: &str = r"(?s)```bash\s*\n(.*?)\n```";

const FORMAT_ERROR_TEMPLATE: &str = "Please always provide EXACTLY ONE action in triple backticks, found {{ actions|length }} actions.
{{ error }}

If you have completed your assignment, run a command whose first output line is COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT.";

const OBSERVATION_TEMPLATE: &str = "{% if output.exception_info %}<exception>{{output.exception_info}}</exception>\n{% endif %}<returncode>{{output.returncode}}</returncode>\n<output>\n{{output.output}}</output>";

const VERIFIER_SYSTEM_TEMPLATE: &str =
    "You are a verifier that selects the best candidate action for the agent to execute.";

const SELECTION_TEMPLATE: &str = "Choose the best candidate action for the task. Return only the number of the chosen candidate.\n\n{% for c in candidates %}Candidate {{ c.index + selection_index_base }}:\n{{ c.content }}\n{% endfor %}";

const REWARD_SYSTEM_TEMPLATE: &str =
    "You are a reward model that scores candidate actions for a coding agent.";

const REWARD_PROMPT_TEMPLATE: &str = "Score the candidate action for how well it advances the task safely and correctly. Return a single line: REWARD: <number>.\n\nTask: {{ task }}\nCandidate:\n{{ candidate.content }}\n";

/// Full agent configuration (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub actions: ActionsConfig,
    pub model: ModelConfig,
    pub environment: EnvironmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Template for the first (system) message.
    pub system_template: String,
    /// Template for the second (task) message.
    pub instance_template: String,
    /// Maximum number of executed steps. `0` disables the limit.
    pub step_limit: u64,
    /// Stop once acting-model cost reaches this value. `0` disables the limit.
    pub cost_limit: f64,
    /// Save the trajectory here after every loop iteration.
    pub output_path: Option<PathBuf>,
    /// Append format-error feedback to the conversation instead of retrying silently.
    pub add_format_error_to_conversation: bool,
    pub candidate_sampling: CandidateSamplingConfig,
    pub verifier: VerifierConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_template: SYSTEM_TEMPLATE.to_string(),
            instance_template: INSTANCE_TEMPLATE.to_string(),
            step_limit: 0,
            cost_limit: 3.0,
            output_path: None,
            add_format_error_to_conversation: true,
            candidate_sampling: CandidateSamplingConfig::default(),
            verifier: VerifierConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            step_limit: self.step_limit,
            cost_limit: self.cost_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CandidateSamplingConfig {
    /// Candidates sampled per step.
    pub num_candidates: usize,
    /// Ask the backend for all candidates in one request (`n`).
    pub use_n: bool,
    /// Extra sampling parameters forwarded to the model backend.
    pub sampling_kwargs: Map<String, Value>,
}

impl Default for CandidateSamplingConfig {
    fn default() -> Self {
        Self {
            num_candidates: 1,
            use_n: false,
            sampling_kwargs: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    #[default]
    FirstValid,
    Llm,
    RewardModel,
}

impl VerifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifierKind::FirstValid => "first_valid",
            VerifierKind::Llm => "llm",
            VerifierKind::RewardModel => "reward_model",
        }
    }
}

/// What a judge falls back to when it cannot produce a usable choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    #[default]
    FirstCandidate,
    FirstValid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: VerifierKind,
    /// Judge model. Uses the acting model when unset.
    pub model: Option<ModelConfig>,
    /// Load templates from `<prompt_dir>/<prompt_name>/`.
    pub prompt_name: Option<String>,
    pub prompt_dir: PathBuf,
    pub system_template: String,
    /// Recent steps shown to the judge; `-1` shows all.
    pub history_steps: i64,
    pub selection_template: String,
    /// The last match's first group is the chosen candidate number.
    pub selection_regex: String,
    /// Number of the first candidate as shown to the judge.
    pub selection_index_base: i64,
    pub reward_system_template: String,
    pub reward_prompt_template: String,
    pub reward_regex: String,
    pub fallback: Fallback,
    /// Optional per-candidate score pattern read from the judge response.
    pub score_regex: Option<String>,
    /// Optional task-progress pattern read from the judge response.
    pub progress_regex: Option<String>,
    /// Optional checklist-item score pattern read from the judge response.
    pub checklist_regex: Option<String>,
    /// Attempts per reward query before the step fails.
    pub reward_max_attempts: u32,
    /// Sleep `base^attempt` seconds between reward attempts.
    pub reward_backoff_base_secs: f64,
    /// Upper bound on concurrent reward queries, at most [`MAX_REWARD_WORKERS`].
    pub reward_max_workers: usize,
    /// Skip the judge when all candidate commands are at least this similar. `0` disables.
    pub similarity_skip_threshold: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: VerifierKind::FirstValid,
            model: None,
            prompt_name: None,
            prompt_dir: PathBuf::from("prompts/verifier"),
            system_template: VERIFIER_SYSTEM_TEMPLATE.to_string(),
            history_steps: 6,
            selection_template: SELECTION_TEMPLATE.to_string(),
            selection_regex: r"(\d+)".to_string(),
            selection_index_base: 1,
            reward_system_template: REWARD_SYSTEM_TEMPLATE.to_string(),
            reward_prompt_template: REWARD_PROMPT_TEMPLATE.to_string(),
            reward_regex: r"REWARD:\s*([+-]?\d+(?:\.\d+)?)".to_string(),
            fallback: Fallback::FirstCandidate,
            score_regex: None,
            progress_regex: None,
            checklist_regex: None,
            reward_max_attempts: 3,
            reward_backoff_base_secs: 4.0,
            reward_max_workers: MAX_REWARD_WORKERS,
            similarity_skip_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionsConfig {
    pub mode: ActionMode,
    /// Text mode: the first capture group of the single match is the command.
    pub action_regex: String,
    /// Rendered with `actions`, `n_actions` and `error`.
    pub format_error_template: String,
    /// Rendered with `output` and `action` for each executed action.
    pub observation_template: String,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            mode: ActionMode::Text,
            action_regex: ACTION_REGEX.to_string(),
            format_error_template: FORMAT_ERROR_TEMPLATE.to_string(),
            observation_template: OBSERVATION_TEMPLATE.to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let agent = &self.agent;
        if !agent.cost_limit.is_finite() || agent.cost_limit < 0.0 {
            return Err(anyhow!("agent.cost_limit must be a non-negative number"));
        }
        if agent.candidate_sampling.num_candidates == 0 {
            return Err(anyhow!("agent.candidate_sampling.num_candidates must be > 0"));
        }
        if self.environment.timeout_secs == 0 {
            return Err(anyhow!("environment.timeout_secs must be > 0"));
        }
        if self.environment.output_limit_bytes == 0 {
            return Err(anyhow!("environment.output_limit_bytes must be > 0"));
        }
        compile("actions.action_regex", &self.actions.action_regex)?;

        let verifier = &agent.verifier;
        compile("agent.verifier.selection_regex", &verifier.selection_regex)?;
        compile("agent.verifier.reward_regex", &verifier.reward_regex)?;
        for (name, pattern) in [
            ("agent.verifier.score_regex", &verifier.score_regex),
            ("agent.verifier.progress_regex", &verifier.progress_regex),
            ("agent.verifier.checklist_regex", &verifier.checklist_regex),
        ] {
            if let Some(pattern) = pattern {
                compile(name, pattern)?;
            }
        }
        if verifier.reward_max_attempts == 0 {
            return Err(anyhow!("agent.verifier.reward_max_attempts must be > 0"));
        }
        if !(1..=MAX_REWARD_WORKERS).contains(&verifier.reward_max_workers) {
            return Err(anyhow!(
                "agent.verifier.reward_max_workers must be within [1, {MAX_REWARD_WORKERS}]"
            ));
        }
        if !verifier.reward_backoff_base_secs.is_finite() || verifier.reward_backoff_base_secs < 0.0
        {
            return Err(anyhow!(
                "agent.verifier.reward_backoff_base_secs must be a non-negative number"
            ));
        }
        if !(0.0..=1.0).contains(&verifier.similarity_skip_threshold) {
            return Err(anyhow!(
                "agent.verifier.similarity_skip_threshold must be within [0, 1]"
            ));
        }
        Ok(())
    }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("{name} is not a valid regex"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}
