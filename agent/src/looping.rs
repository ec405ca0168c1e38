//! Run loop: drive [`Agent::step`] until the task ends.

use std::path::Path;

use anyhow::{Error, Result};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::core::limits::RunStats;
use crate::core::types::{ExitStatus, Message, Role};
use crate::io::trajectory::save_trajectory;
use crate::model::ModelError;
use crate::step::{Agent, RecoverableReason, StepOutcome};

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub exit_status: ExitStatus,
    pub submission: String,
    pub stats: RunStats,
}

/// Start `task` on `agent` and step until submission or limits.
///
/// Recoverable outcomes are fed back into the conversation (format errors
/// only when `add_format_error_to_conversation` is set). Any other error is
/// recorded as a final exit message, the trajectory is saved, and the error
/// is returned. With `output_path` configured the trajectory is saved after
/// every iteration.
#[instrument(skip_all)]
pub fn run_agent<F: FnMut(&StepOutcome)>(
    agent: &mut Agent,
    task: &str,
    extra: Map<String, Value>,
    mut on_step: F,
) -> Result<RunOutcome> {
    agent.start(task, extra)?;
    drive(agent, &mut on_step)
}

/// Continue `agent` from `history` (for example a replayed trajectory) and
/// step until submission or limits, exactly like [`run_agent`].
#[instrument(skip_all, fields(history = history.len()))]
pub fn resume_agent<F: FnMut(&StepOutcome)>(
    agent: &mut Agent,
    history: Vec<Message>,
    extra: Map<String, Value>,
    mut on_step: F,
) -> Result<RunOutcome> {
    agent.resume(history, extra);
    drive(agent, &mut on_step)
}

fn drive<F: FnMut(&StepOutcome)>(agent: &mut Agent, on_step: &mut F) -> Result<RunOutcome> {
    let output_path = agent.config().agent.output_path.clone();
    let keep_format_errors = agent.config().agent.add_format_error_to_conversation;
    info!(output = ?output_path, "agent run started");

    loop {
        let outcome = match agent.step() {
            Ok(outcome) => outcome,
            Err(err) => return Err(record_failure(agent, output_path.as_deref(), err)),
        };
        on_step(&outcome);

        let finished = match outcome {
            StepOutcome::Observed(_) => None,
            StepOutcome::Recoverable {
                reason: RecoverableReason::FormatError,
                ..
            } if !keep_format_errors => None,
            StepOutcome::Recoverable { messages, .. } => {
                agent.add_messages(messages);
                None
            }
            StepOutcome::Terminal {
                exit_status,
                submission,
            } => {
                agent.add_messages([Message::exit(&exit_status, submission.clone()).with_timestamp()]);
                Some((exit_status, submission))
            }
        };

        if let Some(path) = &output_path
            && let Err(err) = save_trajectory(path, &agent.trajectory())
        {
            return Err(record_failure(agent, Some(path.as_path()), err));
        }
        if let Some((exit_status, submission)) = finished {
            info!(exit_status = exit_status.as_str(), steps = agent.stats().step_count, "agent run finished");
            return Ok(RunOutcome {
                exit_status,
                submission,
                stats: *agent.stats(),
            });
        }
    }
}

/// Append the failure as the final message and try to persist it.
fn record_failure(agent: &mut Agent, output_path: Option<&Path>, err: Error) -> Error {
    error!(err = %format!("{err:#}"), "agent run failed");
    agent.add_messages([exit_message_for_error(&err)]);
    if let Some(path) = output_path
        && let Err(save_err) = save_trajectory(path, &agent.trajectory())
    {
        warn!(err = %format!("{save_err:#}"), "could not save trajectory after failure");
    }
    err
}

/// Final message recording an unexpected failure.
fn exit_message_for_error(err: &Error) -> Message {
    let text = format!("{err:#}");
    let mut message = Message::new(Role::Exit, text.clone()).with_timestamp();
    message.extra.exit_status = Some(error_kind(err).to_string());
    message.extra.submission = Some(String::new());
    message.extra.exception_str = Some(text);
    message.extra.traceback = Some(format!("{err:?}"));
    message
}

/// Short name for the kind of failure, recorded as the exit status.
fn error_kind(err: &Error) -> &'static str {
    match err.downcast_ref::<ModelError>() {
        Some(ModelError::Interrupted(_)) => "Interrupted",
        Some(ModelError::Transient(_)) => "TransientModelError",
        Some(ModelError::Fatal(_)) => "ModelError",
        None if err.downcast_ref::<std::io::Error>().is_some() => "IoError",
        None => "Error",
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::core::types::ExecOutput;
    use crate::io::config::Config;
    use crate::io::trajectory::load_messages;
    use crate::model::{FailKind, ScriptedModel, ScriptedOutput};
    use crate::test_support::{ScriptedEnvironment, bash, temp_workspace};

    fn agent(config: Config, outputs: Vec<ScriptedOutput>, env: ScriptedEnvironment) -> Agent {
        let model = Arc::new(ScriptedModel::from_outputs(outputs));
        Agent::new(config, model, Box::new(env), Path::new(".")).expect("agent")
    }

    #[test]
    fn submission_ends_run_with_exit_message() {
        let env = ScriptedEnvironment::new(vec![ExecOutput::completed("hello\n", 0)])
            .then_submit("done\n");
        let mut agent = agent(
            Config::default(),
            vec![
                ScriptedOutput::text(bash("echo hello")),
                ScriptedOutput::text(bash("echo submit")),
            ],
            env,
        );
        let mut steps = 0;
        let outcome = run_agent(&mut agent, "say hello", Map::new(), |_| steps += 1).expect("run");
        assert_eq!(outcome.exit_status, ExitStatus::Submitted);
        assert_eq!(outcome.submission, "done\n");
        assert_eq!(outcome.stats.n_calls, 2);
        assert_eq!(steps, 2);

        let last = agent.messages().last().expect("exit message");
        assert_eq!(last.role, Role::Exit);
        assert_eq!(last.extra.exit_status.as_deref(), Some("Submitted"));
    }

    /// Verifies format errors are fed back by default and dropped when disabled.
    #[test]
    fn format_error_feedback_is_configurable() {
        for keep in [true, false] {
            let mut config = Config::default();
            config.agent.add_format_error_to_conversation = keep;
            let env = ScriptedEnvironment::default().then_submit("");
            let mut agent = agent(
                config,
                vec![
                    ScriptedOutput::text("no block"),
                    ScriptedOutput::text(bash("echo submit")),
                ],
                env,
            );
            run_agent(&mut agent, "task", Map::new(), |_| {}).expect("run");
            let feedback = agent
                .messages()
                .iter()
                .filter(|m| m.role == Role::User && m.text().contains("EXACTLY ONE action"))
                .count();
            assert_eq!(feedback, usize::from(keep));
        }
    }

    #[test]
    fn limits_end_run() {
        let mut config = Config::default();
        config.agent.cost_limit = 1.0;
        let env = ScriptedEnvironment::new(vec![ExecOutput::completed("", 0)]);
        let mut agent = agent(
            config,
            vec![ScriptedOutput::text(bash("ls")).with_cost(1.5)],
            env,
        );
        let outcome = run_agent(&mut agent, "task", Map::new(), |_| {}).expect("run");
        assert_eq!(outcome.exit_status, ExitStatus::LimitsExceeded);
        assert_eq!(outcome.stats.n_calls, 1);
    }

    /// Verifies an unexpected failure is recorded, persisted and returned.
    #[test]
    fn unexpected_error_is_recorded_and_saved() {
        let temp = temp_workspace().expect("tempdir");
        let path = temp.path().join("run.traj.json");
        let mut config = Config::default();
        config.agent.output_path = Some(path.clone());
        let mut agent = agent(
            config,
            vec![ScriptedOutput::failing(FailKind::Fatal)],
            ScriptedEnvironment::default(),
        );
        let err = run_agent(&mut agent, "task", Map::new(), |_| {}).expect_err("fatal");
        assert!(format!("{err:#}").contains("scripted fatal failure"));

        let saved = load_messages(&path).expect("load");
        let last = saved.last().expect("exit message");
        assert_eq!(last.role, Role::Exit);
        assert_eq!(last.extra.exit_status.as_deref(), Some("ModelError"));
        assert!(last.extra.traceback.is_some());
    }

    /// Verifies a failed save still ends the conversation with an exit message.
    #[test]
    fn save_failure_is_recorded_as_exit() {
        let temp = temp_workspace().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "").expect("write blocker");
        let mut config = Config::default();
        config.agent.output_path = Some(blocker.join("run.traj.json"));
        let env = ScriptedEnvironment::new(vec![ExecOutput::completed("hi\n", 0)]);
        let mut agent = agent(config, vec![ScriptedOutput::text(bash("echo hi"))], env);

        let err = run_agent(&mut agent, "task", Map::new(), |_| {}).expect_err("save fails");
        let last = agent.messages().last().expect("exit message");
        assert_eq!(last.role, Role::Exit);
        assert!(last.extra.exit_status.is_some());
        assert_eq!(last.extra.exception_str, Some(format!("{err:#}")));
        assert_eq!(agent.stats().step_count, 1);
    }

    #[test]
    fn trajectory_is_saved_each_iteration() {
        let temp = temp_workspace().expect("tempdir");
        let path = temp.path().join("nested").join("run.traj.json");
        let mut config = Config::default();
        config.agent.output_path = Some(path.clone());
        let env = ScriptedEnvironment::new(vec![ExecOutput::completed("hi\n", 0)]).then_submit("ok");
        let mut agent = agent(
            config,
            vec![
                ScriptedOutput::text(bash("echo hi")),
                ScriptedOutput::text(bash("echo submit")),
            ],
            env,
        );
        let mut existed = Vec::new();
        run_agent(&mut agent, "task", Map::new(), |_| existed.push(path.exists())).expect("run");
        assert_eq!(existed, vec![false, true]);
        let saved = load_messages(&path).expect("load");
        assert_eq!(saved.len(), agent.messages().len());
    }
}
