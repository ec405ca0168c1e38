//! End-to-end agent scenarios.
//!
//! Drives the public API with a scripted acting model. Shell actions run
//! through the real local environment so submission and timeout handling are
//! exercised against actual `sh` processes.

use std::path::Path;
use std::sync::Arc;

use agent::core::actions::ActionMode;
use agent::core::types::{ExecOutput, ExitStatus, Role, ToolCall, VerifierOutput};
use agent::io::config::{Config, VerifierKind};
use agent::io::environment::{EnvironmentConfig, LocalEnvironment};
use agent::looping::run_agent;
use agent::model::{ModelConfig, ScriptedModel, ScriptedModelConfig, ScriptedOutput};
use agent::step::{Agent, StepOutcome};
use agent::test_support::{ScriptedEnvironment, bash};
use serde_json::Map;

#[cfg(unix)]
fn local_env(dir: &Path, timeout_secs: u64) -> LocalEnvironment {
    LocalEnvironment::new(EnvironmentConfig {
        cwd: Some(dir.to_path_buf()),
        timeout_secs,
        ..EnvironmentConfig::default()
    })
}

#[cfg(unix)]
#[test]
fn echo_then_submit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::from_outputs(vec![
        ScriptedOutput::text(bash("echo hello")),
        ScriptedOutput::text(bash("echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\necho done")),
    ]));
    let mut agent = Agent::new(
        Config::default(),
        model,
        Box::new(local_env(temp.path(), 5)),
        temp.path(),
    )
    .expect("agent");

    let outcome = run_agent(&mut agent, "say hello", Map::new(), |_| {}).expect("run");
    assert_eq!(outcome.exit_status, ExitStatus::Submitted);
    assert_eq!(outcome.submission, "done\n");
    assert_eq!(outcome.stats.n_calls, 2);

    let observations: Vec<_> = agent
        .messages()
        .iter()
        .filter(|m| m.extra.raw_output.is_some())
        .collect();
    assert_eq!(observations.len(), 1);
    assert!(observations[0].text().contains("hello"));

    let exit = agent.messages().last().expect("exit");
    assert_eq!(exit.role, Role::Exit);
    assert_eq!(exit.extra.exit_status.as_deref(), Some("Submitted"));
    assert_eq!(exit.extra.submission.as_deref(), Some("done\n"));
}

/// Verifies the reward judge picks the higher-scored candidate and records
/// the rewards exactly.
#[test]
fn reward_model_selects_highest_reward() {
    let mut config = Config::default();
    config.agent.candidate_sampling.num_candidates = 2;
    config.agent.verifier.enabled = true;
    config.agent.verifier.kind = VerifierKind::RewardModel;
    config.agent.verifier.reward_backoff_base_secs = 0.0;
    config.agent.verifier.model = Some(ModelConfig::Scripted(ScriptedModelConfig {
        outputs: vec![
            ScriptedOutput::text("REWARD: 0.2").when_contains("echo low"),
            ScriptedOutput::text("REWARD: 0.9").when_contains("echo high"),
        ],
        cost_per_call: 0.01,
    }));

    let env = ScriptedEnvironment::new(vec![ExecOutput::completed("high\n", 0)]);
    let model = Arc::new(ScriptedModel::from_outputs(vec![
        ScriptedOutput::text(bash("echo low")),
        ScriptedOutput::text(bash("echo high")),
    ]));
    let mut agent =
        Agent::new(config, model, Box::new(env.clone()), Path::new(".")).expect("agent");
    agent.start("pick one", Map::new()).expect("start");

    assert!(matches!(agent.step().expect("step"), StepOutcome::Observed(_)));
    assert_eq!(env.executed(), vec!["echo high".to_string()]);

    let committed = agent
        .messages()
        .iter()
        .find(|m| m.role == Role::Assistant)
        .expect("committed");
    let metadata = committed.extra.verifier.as_ref().expect("metadata");
    assert_eq!(metadata.selected_index, 1);
    assert_eq!(metadata.kind, "reward_model");
    match &metadata.verifier_output {
        Some(VerifierOutput::RewardModel { rewards, .. }) => {
            assert_eq!(rewards, &vec![Some(0.2), Some(0.9)]);
        }
        other => panic!("unexpected verifier output {other:?}"),
    }
    assert_eq!(agent.stats().n_calls, 2);
    assert_eq!(agent.stats().verifier_calls, 2);
}

/// Verifies a step limit of one allows exactly one step of three candidates.
#[test]
fn step_limit_with_three_candidates() {
    let mut config = Config::default();
    config.agent.step_limit = 1;
    config.agent.candidate_sampling.num_candidates = 3;
    let env = ScriptedEnvironment::new(vec![ExecOutput::completed("", 0)]);
    let model = Arc::new(ScriptedModel::from_outputs(vec![
        ScriptedOutput::text(bash("ls")),
        ScriptedOutput::text(bash("ls -a")),
        ScriptedOutput::text(bash("ls -la")),
        ScriptedOutput::text(bash("unused")),
    ]));
    let mut agent =
        Agent::new(config, model.clone(), Box::new(env), Path::new(".")).expect("agent");
    agent.start("list files", Map::new()).expect("start");

    assert!(matches!(agent.step().expect("first step"), StepOutcome::Observed(_)));
    assert_eq!(agent.stats().n_calls, 3);
    assert_eq!(agent.stats().step_count, 1);

    let second = agent.step().expect("second step");
    assert_eq!(
        second,
        StepOutcome::Terminal {
            exit_status: ExitStatus::LimitsExceeded,
            submission: String::new(),
        }
    );
    assert_eq!(agent.stats().n_calls, 3);
    assert_eq!(model.remaining(), 1);
}

/// Verifies a timed-out command surfaces its partial output and the run
/// carries on afterwards.
#[cfg(unix)]
#[test]
fn timeout_keeps_partial_output_and_continues() {
    let temp = tempfile::tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::from_outputs(vec![
        ScriptedOutput::text(bash("echo 999; sleep 5")),
        ScriptedOutput::text(bash("echo recovered")),
        ScriptedOutput::text(bash("echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT")),
    ]));
    let mut agent = Agent::new(
        Config::default(),
        model,
        Box::new(local_env(temp.path(), 1)),
        temp.path(),
    )
    .expect("agent");

    let mut observed = Vec::new();
    let outcome = run_agent(&mut agent, "slow task", Map::new(), |step| {
        if let StepOutcome::Observed(messages) = step {
            observed.extend(messages.iter().map(|m| m.text()));
        }
    })
    .expect("run");

    assert_eq!(outcome.exit_status, ExitStatus::Submitted);
    assert_eq!(observed.len(), 2);
    assert!(observed[0].contains("999"));
    assert!(observed[0].contains("timed out"));
    assert!(observed[1].contains("recovered"));
}

/// Verifies every tool call runs and is answered by its own tool message.
#[test]
fn tool_calls_produce_one_observation_each() {
    let mut config = Config::default();
    config.actions.mode = ActionMode::ToolCall;
    let env = ScriptedEnvironment::new(vec![
        ExecOutput::completed("a\n", 0),
        ExecOutput::completed("b\n", 1),
    ]);
    let model = Arc::new(ScriptedModel::from_outputs(vec![ScriptedOutput {
        tool_calls: vec![ToolCall::bash("call_1", "echo a"), ToolCall::bash("call_2", "echo b")],
        ..ScriptedOutput::default()
    }]));
    let mut agent =
        Agent::new(config, model, Box::new(env.clone()), Path::new(".")).expect("agent");
    agent.start("two commands", Map::new()).expect("start");

    let StepOutcome::Observed(observations) = agent.step().expect("step") else {
        panic!("expected observations");
    };
    assert_eq!(env.executed(), vec!["echo a".to_string(), "echo b".to_string()]);
    let ids: Vec<_> = observations.iter().map(|m| m.tool_call_id.clone()).collect();
    assert_eq!(ids, vec![Some("call_1".to_string()), Some("call_2".to_string())]);
    assert!(observations.iter().all(|m| m.role == Role::Tool));
    assert_eq!(observations[1].extra.returncode, Some(1));
    assert_eq!(agent.stats().step_count, 1);
}
