//! Candidate sampling for one step.
//!
//! Produces `num_candidates` alternative responses from the acting model,
//! either with one batched (`n`) request or with independent queries. The
//! batched path is an optimization: if its response cannot be split the
//! sampler keeps what it got and tops up with independent queries.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::actions::{ActionParser, FormatError};
use crate::core::limits::{Limits, RunStats};
use crate::core::types::{Action, Candidate, Content, Message, Role, ToolCall};
use crate::io::config::CandidateSamplingConfig;
use crate::model::{Model, ModelError, QueryParams, response_cost};

/// Why sampling stopped early. Both variants abort the whole step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("step or cost limit reached")]
    LimitsExceeded,
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// One sampled response with its parse result.
#[derive(Debug, Clone)]
pub struct Sampled {
    pub message: Message,
    pub parsed: Result<Vec<Action>, FormatError>,
}

#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    pub responses: Vec<Sampled>,
    pub candidates: Vec<Candidate>,
}

pub struct CandidateSampler<'a> {
    pub model: &'a dyn Model,
    pub parser: &'a ActionParser,
    pub config: &'a CandidateSamplingConfig,
    pub limits: Limits,
}

impl CandidateSampler<'_> {
    /// Sample candidates for the next turn of `messages`.
    ///
    /// Limits are checked before every acting query, and each query is
    /// counted in `stats` as soon as it is issued.
    #[instrument(skip_all, fields(num_candidates = self.config.num_candidates, use_n = self.config.use_n))]
    pub fn sample(&self, messages: &[Message], stats: &mut RunStats) -> Result<SampleSet, SampleError> {
        let wanted = self.config.num_candidates.max(1);
        let mut responses: Vec<Message> = Vec::with_capacity(wanted);

        if wanted > 1 && self.config.use_n {
            match self.query_once(messages, wanted, stats) {
                Ok(batched) => match split_choices(&batched, wanted) {
                    Ok(split) if !split.is_empty() => responses = split,
                    Ok(_) => {
                        warn!("batched response had no choices, falling back to independent queries");
                        responses.push(batched);
                    }
                    Err(reason) => {
                        warn!(%reason, "could not split batched response, falling back to independent queries");
                        responses.push(batched);
                    }
                },
                Err(err @ (SampleError::LimitsExceeded | SampleError::Model(ModelError::Interrupted(_)))) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(err = %err, "batched query failed, falling back to independent queries");
                }
            }
        }
        while responses.len() < wanted {
            responses.push(self.query_once(messages, 1, stats)?);
        }
        debug!(sampled = responses.len(), "candidates sampled");

        let responses: Vec<Sampled> = responses.into_iter().map(|m| self.parse(m)).collect();
        let candidates = responses
            .iter()
            .enumerate()
            .map(|(index, sampled)| candidate_info(index, sampled))
            .collect();
        Ok(SampleSet {
            responses,
            candidates,
        })
    }

    fn query_once(
        &self,
        messages: &[Message],
        n: usize,
        stats: &mut RunStats,
    ) -> Result<Message, SampleError> {
        if self.limits.exceeded(stats) {
            return Err(SampleError::LimitsExceeded);
        }
        let params = QueryParams {
            n,
            sampling: self.config.sampling_kwargs.clone(),
        };
        stats.record_call();
        let message = self.model.query(messages, &params)?;
        stats.record_cost(response_cost(&message));
        Ok(message)
    }

    fn parse(&self, mut message: Message) -> Sampled {
        let parsed = self.parser.parse(&message);
        match &parsed {
            Ok(actions) => message.extra.actions = actions.clone(),
            Err(err) => {
                message.extra.actions.clear();
                message.extra.candidate_parse_error = Some(err.detail.clone());
            }
        }
        Sampled { message, parsed }
    }
}

/// Split a batched response into one message per choice (at most `limit`).
///
/// Each choice inherits the parent's side channel (cost, raw response) but
/// carries only the content and tool calls of its own choice message.
fn split_choices(batched: &Message, limit: usize) -> Result<Vec<Message>, String> {
    let Some(raw) = &batched.extra.response else {
        return Ok(Vec::new());
    };
    let choices = match raw.get("choices") {
        Some(Value::Array(choices)) => choices,
        Some(_) => return Err("`choices` is not a list".to_string()),
        None => return Ok(Vec::new()),
    };

    let mut split = Vec::with_capacity(limit.min(choices.len()));
    for (index, choice) in choices.iter().take(limit).enumerate() {
        let Some(choice_message) = choice.get("message").filter(|m| m.is_object()) else {
            return Err(format!("choice {index} has no message object"));
        };
        let mut message = batched.clone();
        message.content = Content::default();
        message.tool_calls = Vec::new();
        if let Some(role) = choice_message.get("role") {
            message.role = serde_json::from_value::<Role>(role.clone())
                .map_err(|e| format!("choice {index} role: {e}"))?;
        }
        if let Some(content) = choice_message.get("content") {
            message.content = match content {
                Value::Null => Content::default(),
                other => serde_json::from_value::<Content>(other.clone())
                    .map_err(|e| format!("choice {index} content: {e}"))?,
            };
        }
        if let Some(tool_calls) = choice_message.get("tool_calls") {
            message.tool_calls = match tool_calls {
                Value::Null => Vec::new(),
                other => serde_json::from_value::<Vec<ToolCall>>(other.clone())
                    .map_err(|e| format!("choice {index} tool_calls: {e}"))?,
            };
        }
        message.extra.choice_index = Some(index);
        split.push(message);
    }
    Ok(split)
}

fn candidate_info(index: usize, sampled: &Sampled) -> Candidate {
    let actions = sampled.parsed.as_ref().cloned().unwrap_or_default();
    Candidate {
        index,
        content: sampled.message.text(),
        action: actions.first().map(|a| a.command.clone()),
        n_actions: actions.len(),
        actions,
        parse_error: sampled.parsed.as_ref().err().map(|e| e.detail.clone()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::actions::ActionMode;
    use crate::model::{FailKind, ScriptedChoice, ScriptedModel, ScriptedOutput};

    const REGEX: &str = r"(?s)```bash\s*\n(.*?)\n```";

    fn parser() -> ActionParser {
        ActionParser::new(ActionMode::Text, REGEX, "{{ error }}").expect("parser")
    }

    fn bash(command: &str) -> String {
        format!("```bash\n{command}\n```")
    }

    fn sample(
        model: &ScriptedModel,
        config: &CandidateSamplingConfig,
        limits: Limits,
        stats: &mut RunStats,
    ) -> Result<SampleSet, SampleError> {
        let parser = parser();
        let sampler = CandidateSampler {
            model,
            parser: &parser,
            config,
            limits,
        };
        sampler.sample(&[Message::user("task")], stats)
    }

    fn config(num_candidates: usize, use_n: bool) -> CandidateSamplingConfig {
        CandidateSamplingConfig {
            num_candidates,
            use_n,
            ..CandidateSamplingConfig::default()
        }
    }

    #[test]
    fn single_candidate_issues_one_query() {
        let model = ScriptedModel::from_outputs(vec![ScriptedOutput::text(bash("ls")).with_cost(0.3)]);
        let mut stats = RunStats::default();
        let set = sample(&model, &config(1, false), Limits::default(), &mut stats).expect("sample");
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].action.as_deref(), Some("ls"));
        assert_eq!(stats.n_calls, 1);
        assert_eq!(stats.cost, 0.3);
        assert_eq!(set.responses[0].message.extra.actions[0].command, "ls");
    }

    /// Verifies a bad candidate records its parse error without stopping its siblings.
    #[test]
    fn parse_errors_stay_on_their_candidate() {
        let model = ScriptedModel::from_outputs(vec![
            ScriptedOutput::text("no action"),
            ScriptedOutput::text(bash("pwd")),
        ]);
        let mut stats = RunStats::default();
        let set = sample(&model, &config(2, false), Limits::default(), &mut stats).expect("sample");
        assert!(set.candidates[0].parse_error.is_some());
        assert_eq!(set.candidates[0].action, None);
        assert_eq!(set.candidates[1].action.as_deref(), Some("pwd"));
        assert_eq!(stats.n_calls, 2);
        assert!(set.responses[0].message.extra.candidate_parse_error.is_some());
    }

    #[test]
    fn batched_response_is_split_into_choices() {
        let model = ScriptedModel::from_outputs(vec![ScriptedOutput {
            choices: vec![
                ScriptedChoice {
                    content: bash("ls"),
                    ..ScriptedChoice::default()
                },
                ScriptedChoice {
                    content: bash("pwd"),
                    ..ScriptedChoice::default()
                },
                ScriptedChoice {
                    content: bash("id"),
                    ..ScriptedChoice::default()
                },
            ],
            cost: Some(0.5),
            ..ScriptedOutput::default()
        }]);
        let mut stats = RunStats::default();
        let set = sample(&model, &config(2, true), Limits::default(), &mut stats).expect("sample");
        let actions: Vec<_> = set.candidates.iter().map(|c| c.action.clone()).collect();
        assert_eq!(actions, vec![Some("ls".to_string()), Some("pwd".to_string())]);
        assert_eq!(set.responses[1].message.extra.choice_index, Some(1));
        assert_eq!(set.responses[1].message.extra.cost, Some(0.5));
        assert_eq!(stats.n_calls, 1);
        assert_eq!(model.queries()[0].n, 2);
    }

    /// Verifies a response without choices is kept as one candidate and
    /// topped up with independent queries.
    #[test]
    fn unsplittable_batch_falls_back_to_independent_queries() {
        let model = ScriptedModel::from_outputs(vec![
            ScriptedOutput::text(bash("ls")),
            ScriptedOutput::text(bash("pwd")),
            ScriptedOutput::text(bash("id")),
        ]);
        let mut stats = RunStats::default();
        let set = sample(&model, &config(3, true), Limits::default(), &mut stats).expect("sample");
        let actions: Vec<_> = set.candidates.iter().filter_map(|c| c.action.clone()).collect();
        assert_eq!(actions, vec!["ls", "pwd", "id"]);
        let ns: Vec<usize> = model.queries().iter().map(|q| q.n).collect();
        assert_eq!(ns, vec![3, 1, 1]);
    }

    #[test]
    fn failed_batch_query_falls_back() {
        let model = ScriptedModel::from_outputs(vec![
            ScriptedOutput::failing(FailKind::Fatal),
            ScriptedOutput::text(bash("ls")),
            ScriptedOutput::text(bash("pwd")),
        ]);
        let mut stats = RunStats::default();
        let set = sample(&model, &config(2, true), Limits::default(), &mut stats).expect("sample");
        assert_eq!(set.candidates.len(), 2);
        assert_eq!(stats.n_calls, 3);
    }

    #[test]
    fn interrupt_during_batch_propagates() {
        let model = ScriptedModel::from_outputs(vec![
            ScriptedOutput::failing(FailKind::Interrupted),
            ScriptedOutput::text(bash("ls")),
        ]);
        let mut stats = RunStats::default();
        let err = sample(&model, &config(2, true), Limits::default(), &mut stats).expect_err("interrupt");
        assert!(matches!(err, SampleError::Model(ModelError::Interrupted(_))));
        assert_eq!(model.remaining(), 1);
    }

    /// Verifies crossing the cost limit mid-sampling aborts before the next query.
    #[test]
    fn limits_are_checked_before_each_query() {
        let model = ScriptedModel::from_outputs(vec![
            ScriptedOutput::text(bash("ls")).with_cost(1.0),
            ScriptedOutput::text(bash("pwd")),
        ]);
        let limits = Limits {
            step_limit: 0,
            cost_limit: 1.0,
        };
        let mut stats = RunStats::default();
        let err = sample(&model, &config(2, false), limits, &mut stats).expect_err("limit");
        assert_eq!(err, SampleError::LimitsExceeded);
        assert_eq!(stats.n_calls, 1);
        assert_eq!(model.remaining(), 1);
    }

    /// Verifies a choice without tool calls does not inherit the parent's.
    #[test]
    fn choice_without_tool_calls_has_no_actions() {
        let call = ToolCall::bash("call_a", "rm -rf build");
        let mut batched = Message::assistant("");
        batched.tool_calls = vec![call.clone()];
        batched.extra.response = Some(json!({
            "choices": [
                {"message": {"role": "assistant", "tool_calls": [call]}},
                {"message": {"role": "assistant", "content": "I am not sure yet, let me think."}},
            ]
        }));

        let split = split_choices(&batched, 2).expect("split");
        assert_eq!(split[0].tool_calls.len(), 1);
        assert!(split[1].tool_calls.is_empty());
        assert_eq!(split[1].text(), "I am not sure yet, let me think.");

        let tool_parser =
            ActionParser::new(ActionMode::ToolCall, REGEX, "{{ error }}").expect("parser");
        assert!(tool_parser.parse(&split[1]).is_err());
        let first = tool_parser.parse(&split[0]).expect("first choice parses");
        assert_eq!(first[0].command, "rm -rf build");
    }

    #[test]
    fn malformed_choices_are_rejected() {
        let mut batched = Message::assistant("x");
        batched.extra.response = Some(json!({"choices": "nope"}));
        assert!(split_choices(&batched, 2).is_err());

        batched.extra.response = Some(json!({"choices": [1, 2]}));
        assert!(split_choices(&batched, 2).is_err());

        batched.extra.response = Some(json!({"choices": []}));
        assert_eq!(split_choices(&batched, 2), Ok(Vec::new()));
    }
}
