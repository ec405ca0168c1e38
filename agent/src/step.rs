//! Orchestration for a single agent step.
//!
//! One step samples candidates, lets the verifier pick one, commits it,
//! executes its actions and appends the observations. Expected endings
//! (format errors, interrupts, submission, limits) come back as a
//! [`StepOutcome`]; only unexpected failures are returned as `Err`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};

use crate::core::actions::ActionParser;
use crate::core::history::verifier_steps;
use crate::core::limits::RunStats;
use crate::core::observation::observation_messages;
use crate::core::similarity::analyze;
use crate::core::template::{recursive_merge, render};
use crate::core::types::{Candidate, ExitStatus, Message, VerifierMetadata, VerifierOutput};
use crate::io::config::Config;
use crate::io::environment::{Environment, Execution, LocalEnvironment};
use crate::io::trajectory::Trajectory;
use crate::model::{Model, ModelError, build_model};
use crate::sampler::{CandidateSampler, SampleError};
use crate::verifier::{SelectContext, Verifier};

/// Why a step ended without executing anything, while the run can go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableReason {
    /// The selected response did not contain a well-formed action.
    FormatError,
    /// The operator interrupted a model query.
    Interrupted,
}

/// Result of one [`Agent::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Actions ran; carries the observation messages already appended.
    Observed(Vec<Message>),
    /// Corrective messages for the caller to append (or drop).
    Recoverable {
        reason: RecoverableReason,
        messages: Vec<Message>,
    },
    /// The run is over.
    Terminal {
        exit_status: ExitStatus,
        submission: String,
    },
}

impl StepOutcome {
    fn limits_exceeded() -> Self {
        StepOutcome::Terminal {
            exit_status: ExitStatus::LimitsExceeded,
            submission: String::new(),
        }
    }

    fn interrupted(note: &str) -> Self {
        let content = if note.is_empty() {
            "Interrupted by user.".to_string()
        } else {
            format!("Interrupted by user: {note}")
        };
        StepOutcome::Recoverable {
            reason: RecoverableReason::Interrupted,
            messages: vec![Message::user(content).with_timestamp()],
        }
    }
}

/// The step engine. Owns the conversation and run statistics of one task.
pub struct Agent {
    config: Config,
    model: Arc<dyn Model>,
    env: Box<dyn Environment>,
    verifier: Option<Verifier>,
    parser: ActionParser,
    messages: Vec<Message>,
    stats: RunStats,
    extra_vars: Map<String, Value>,
}

impl Agent {
    /// Build an agent around explicit model and environment backends.
    ///
    /// Verifier prompt overrides resolve against `base_dir`.
    pub fn new(
        config: Config,
        model: Arc<dyn Model>,
        env: Box<dyn Environment>,
        base_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let parser = ActionParser::new(
            config.actions.mode,
            &config.actions.action_regex,
            &config.actions.format_error_template,
        )?;
        let verifier = if config.agent.verifier.enabled {
            Some(
                Verifier::from_config(&config.agent.verifier, model.clone(), base_dir)
                    .context("build verifier")?,
            )
        } else {
            None
        };
        Ok(Self {
            config,
            model,
            env,
            verifier,
            parser,
            messages: Vec::new(),
            stats: RunStats::default(),
            extra_vars: Map::new(),
        })
    }

    /// Build an agent whose model and local environment come from `config`.
    pub fn from_config(config: Config, base_dir: &Path) -> Result<Self> {
        let model = build_model(&config.model).context("build model")?;
        let env = LocalEnvironment::new(config.environment.clone());
        Self::new(config, model, Box::new(env), base_dir)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Forget any previous conversation and start a new one for `task`.
    pub fn start(&mut self, task: &str, extra: Map<String, Value>) -> Result<()> {
        self.messages.clear();
        self.stats = RunStats::default();
        self.extra_vars = extra;
        self.extra_vars.insert("task".to_string(), json!(task));

        let vars = self.template_vars();
        let system = render(&self.config.agent.system_template, &vars)
            .context("render system template")?;
        let instance = render(&self.config.agent.instance_template, &vars)
            .context("render instance template")?;
        self.messages.push(Message::system(system).with_timestamp());
        self.messages.push(Message::user(instance).with_timestamp());
        Ok(())
    }

    /// Continue from an existing conversation instead of rendering a new one.
    ///
    /// Run statistics start from zero; `extra` should carry `task` when
    /// templates reference it.
    pub fn resume(&mut self, history: Vec<Message>, extra: Map<String, Value>) {
        self.messages = history;
        self.stats = RunStats::default();
        self.extra_vars = extra;
    }

    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Variables every prompt template is rendered with.
    pub fn template_vars(&self) -> Value {
        let agent = serde_json::to_value(&self.config.agent).unwrap_or_else(|_| json!({}));
        let stats = json!({
            "n_model_calls": self.stats.n_calls,
            "model_cost": self.stats.cost,
            "step_count": self.stats.step_count,
        });
        let extra = Value::Object(self.extra_vars.clone());
        recursive_merge([
            &agent,
            &self.env.template_vars(),
            &self.model.template_vars(),
            &stats,
            &extra,
        ])
    }

    /// Snapshot of the run for persistence.
    pub fn trajectory(&self) -> Trajectory {
        let config = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        Trajectory::new(&self.messages, &self.stats, config)
    }

    /// Run one sample, select, commit, execute and observe cycle.
    #[instrument(skip_all, fields(step = self.stats.step_count, calls = self.stats.n_calls))]
    pub fn step(&mut self) -> Result<StepOutcome> {
        let limits = self.config.agent.limits();
        if limits.exceeded(&self.stats) {
            info!(cost = self.stats.cost, steps = self.stats.step_count, "limits exceeded");
            return Ok(StepOutcome::limits_exceeded());
        }

        let sampler = CandidateSampler {
            model: self.model.as_ref(),
            parser: &self.parser,
            config: &self.config.agent.candidate_sampling,
            limits,
        };
        let sampled = match sampler.sample(&self.messages, &mut self.stats) {
            Ok(sampled) => sampled,
            Err(SampleError::LimitsExceeded) => {
                info!(cost = self.stats.cost, "limits exceeded while sampling");
                return Ok(StepOutcome::limits_exceeded());
            }
            Err(SampleError::Model(ModelError::Interrupted(note))) => {
                return Ok(StepOutcome::interrupted(&note));
            }
            Err(SampleError::Model(err)) => return Err(err).context("sample candidates"),
        };

        let (index, metadata) = match self.select(&sampled.candidates) {
            Ok(selected) => selected,
            Err(err) => {
                if let Some(ModelError::Interrupted(note)) = err.downcast_ref::<ModelError>() {
                    return Ok(StepOutcome::interrupted(note));
                }
                return Err(err.context("select candidate"));
            }
        };
        debug!(index, candidates = sampled.candidates.len(), "candidate selected");

        let chosen = &sampled.responses[index];
        if let Err(err) = &chosen.parsed {
            debug!(detail = %err.detail, "selected candidate has no valid action");
            return Ok(StepOutcome::Recoverable {
                reason: RecoverableReason::FormatError,
                messages: vec![Message::user(err.message.clone()).with_timestamp()],
            });
        }
        let mut committed = chosen.message.clone();
        committed.extra.verifier = Some(metadata);
        let actions = committed.extra.actions.clone();
        self.messages.push(committed);

        let mut outputs = Vec::with_capacity(actions.len());
        for action in &actions {
            let execution = self
                .env
                .execute(action)
                .with_context(|| format!("execute action {:?}", action.command))?;
            match execution {
                Execution::Completed(output) => outputs.push(output),
                Execution::Submitted(submission) => {
                    info!(steps = self.stats.step_count, "task submitted");
                    return Ok(StepOutcome::Terminal {
                        exit_status: ExitStatus::Submitted,
                        submission,
                    });
                }
            }
        }

        let vars = self.template_vars();
        let observations = observation_messages(
            self.parser.mode(),
            &self.config.actions.observation_template,
            &actions,
            &outputs,
            &vars,
        )?;
        self.messages.extend(observations.iter().cloned());
        self.stats.step_count += 1;
        Ok(StepOutcome::Observed(observations))
    }

    /// Pick a candidate and describe the choice.
    ///
    /// The returned index is always a valid position in `candidates`.
    fn select(&mut self, candidates: &[Candidate]) -> Result<(usize, VerifierMetadata)> {
        let settings = &self.config.agent.verifier;
        let Some(verifier) = &self.verifier else {
            return Ok((
                0,
                VerifierMetadata {
                    enabled: false,
                    kind: "none".to_string(),
                    selected_index: 0,
                    selection_index_base: settings.selection_index_base,
                    candidates: candidates.to_vec(),
                    verifier_output: None,
                },
            ));
        };

        let threshold = settings.similarity_skip_threshold;
        let skip = (threshold > 0.0)
            .then(|| analyze(candidates, threshold))
            .filter(|report| report.should_skip_verifier);
        let (raw_index, output) = match skip {
            Some(similarity) => {
                debug!(
                    min_similarity = similarity.min_pairwise_similarity,
                    "candidates near-identical, skipping verifier"
                );
                (0, VerifierOutput::SimilaritySkip { similarity })
            }
            None => {
                let vars = self.verifier_vars();
                let selection = verifier.select(SelectContext {
                    candidates,
                    vars: &vars,
                })?;
                self.stats.record_verifier(selection.calls, selection.cost);
                (selection.index, selection.output)
            }
        };

        let index = raw_index.min(candidates.len().saturating_sub(1));
        let settings = &self.config.agent.verifier;
        Ok((
            index,
            VerifierMetadata {
                enabled: true,
                kind: settings.kind.as_str().to_string(),
                selected_index: index,
                selection_index_base: settings.selection_index_base,
                candidates: candidates.to_vec(),
                verifier_output: Some(output),
            },
        ))
    }

    /// Extra variables for judge prompts: the task and recent history.
    fn verifier_vars(&self) -> Value {
        let steps = verifier_steps(&self.messages, self.config.agent.verifier.history_steps);
        let messages: Vec<&Message> = steps.iter().flatten().collect();
        let task = self.extra_vars.get("task").cloned().unwrap_or_else(|| json!(""));
        let history = json!({
            "task": task,
            "messages": messages,
            "steps": steps,
        });
        recursive_merge([&Value::Object(self.extra_vars.clone()), &history])
    }
}
