//! Re-execute the actions of a saved trajectory in a fresh environment.
//!
//! Replaying brings an environment back to the state it had after step K of
//! a previous run, so new rollouts can branch from there.

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::core::actions::ActionParser;
use crate::core::history::split_steps;
use crate::core::observation::observation_messages;
use crate::core::template::recursive_merge;
use crate::core::types::{Message, Role};
use crate::io::config::Config;
use crate::io::environment::{Environment, Execution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Number of action steps to re-execute. `0` replays nothing.
    pub target_step: usize,
    /// Keep the replayed assistant messages in the resulting history.
    pub include_thoughts: bool,
    /// Compare re-rendered observations with the recorded ones.
    pub verify_observations: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedAction {
    pub step: usize,
    pub command: String,
    pub returncode: i32,
    pub output_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationMismatch {
    pub step: usize,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// Conversation to resume from: prelude plus the replayed steps.
    pub history: Vec<Message>,
    pub replayed_steps: usize,
    pub total_action_steps: usize,
    pub actions: Vec<ReplayedAction>,
    pub mismatches: Vec<ObservationMismatch>,
}

/// Replay the first `options.target_step` steps of `messages` in `env`.
///
/// Each step's actions are parsed from its assistant message with the
/// configured action format. A step whose message no longer parses, or whose
/// action submits, aborts the replay.
#[instrument(skip_all, fields(target_step = options.target_step))]
pub fn replay_to_step(
    messages: &[Message],
    config: &Config,
    env: &mut dyn Environment,
    options: &ReplayOptions,
) -> Result<Replay> {
    let parser = ActionParser::new(
        config.actions.mode,
        &config.actions.action_regex,
        &config.actions.format_error_template,
    )?;
    let (prelude, steps) = split_steps(messages);
    let steps: Vec<Vec<Message>> = steps
        .into_iter()
        .map(|step| step.into_iter().take_while(|m| m.role != Role::Exit).collect())
        .collect();
    let total_action_steps = steps.len();
    if options.target_step > total_action_steps {
        bail!(
            "target step {} exceeds the {total_action_steps} action steps in the trajectory",
            options.target_step
        );
    }

    let vars = observation_vars(config, env);
    let mut actions_run = Vec::new();
    let mut mismatches = Vec::new();
    for (index, step) in steps.iter().take(options.target_step).enumerate() {
        let number = index + 1;
        let actions = parser
            .parse(&step[0])
            .map_err(|err| anyhow!("step {number}: {}", err.detail))?;

        let mut outputs = Vec::with_capacity(actions.len());
        for action in &actions {
            let execution = env
                .execute(action)
                .with_context(|| format!("replay step {number}: {:?}", action.command))?;
            let Execution::Completed(output) = execution else {
                bail!("step {number} submitted during replay; choose an earlier step");
            };
            debug!(step = number, command = %action.command, returncode = output.returncode, "replayed action");
            actions_run.push(ReplayedAction {
                step: number,
                command: action.command.clone(),
                returncode: output.returncode,
                output_len: output.output.len(),
            });
            outputs.push(output);
        }

        if options.verify_observations {
            let rendered = observation_messages(
                parser.mode(),
                &config.actions.observation_template,
                &actions,
                &outputs,
                &vars,
            )?;
            let recorded = step[1..]
                .iter()
                .filter(|m| matches!(m.role, Role::User | Role::Tool));
            for (expected, actual) in recorded.zip(&rendered) {
                let (expected, actual) = (expected.text(), actual.text());
                if expected != actual {
                    mismatches.push(ObservationMismatch {
                        step: number,
                        expected,
                        actual,
                    });
                }
            }
        }
    }

    let mut history = prelude;
    history.extend(
        steps
            .into_iter()
            .take(options.target_step)
            .flatten()
            .filter(|m| options.include_thoughts || m.role != Role::Assistant),
    );
    info!(
        replayed = options.target_step,
        total = total_action_steps,
        mismatches = mismatches.len(),
        "trajectory replayed"
    );
    Ok(Replay {
        history,
        replayed_steps: options.target_step,
        total_action_steps,
        actions: actions_run,
        mismatches,
    })
}

fn observation_vars(config: &Config, env: &dyn Environment) -> Value {
    let agent = serde_json::to_value(&config.agent).unwrap_or_else(|_| json!({}));
    recursive_merge([&agent, &env.template_vars()])
}
