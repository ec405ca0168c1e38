//! Deterministic model that replays configured responses.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::types::{Message, ToolCall};
use crate::model::{Model, ModelError, QueryParams};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedModelConfig {
    pub outputs: Vec<ScriptedOutput>,
    /// Cost reported for outputs without their own `cost`.
    pub cost_per_call: f64,
}

/// One canned response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedOutput {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Choices returned in `extra.response.choices` for batched requests.
    pub choices: Vec<ScriptedChoice>,
    pub cost: Option<f64>,
    /// Only answer a query whose last message contains this text.
    pub when_contains: Option<String>,
    /// Fail the query instead of answering.
    pub fail: Option<FailKind>,
}

impl ScriptedOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn when_contains(mut self, needle: impl Into<String>) -> Self {
        self.when_contains = Some(needle.into());
        self
    }

    pub fn failing(kind: FailKind) -> Self {
        Self {
            fail: Some(kind),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedChoice {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    Interrupted,
    Transient,
    Fatal,
}

/// Replays [`ScriptedOutput`]s and records every query it receives.
///
/// Unconditional outputs are served in order. An output with `when_contains`
/// is served to the first query whose last message contains its needle, which
/// keeps concurrent judge queries deterministic.
#[derive(Debug)]
pub struct ScriptedModel {
    outputs: Mutex<VecDeque<ScriptedOutput>>,
    cost_per_call: f64,
    queries: Mutex<Vec<RecordedQuery>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQuery {
    pub messages: Vec<Message>,
    pub n: usize,
}

impl ScriptedModel {
    pub fn new(config: ScriptedModelConfig) -> Self {
        Self {
            outputs: Mutex::new(config.outputs.into()),
            cost_per_call: config.cost_per_call,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn from_outputs(outputs: Vec<ScriptedOutput>) -> Self {
        Self::new(ScriptedModelConfig {
            outputs,
            cost_per_call: 0.0,
        })
    }

    /// Queries received so far, in arrival order.
    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.queries
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }

    /// Outputs not yet served.
    pub fn remaining(&self) -> usize {
        self.outputs.lock().map(|o| o.len()).unwrap_or_default()
    }

    fn next_output(&self, last_text: &str) -> Result<ScriptedOutput, ModelError> {
        let mut outputs = self
            .outputs
            .lock()
            .map_err(|_| ModelError::Fatal("scripted model lock poisoned".into()))?;
        let position = outputs
            .iter()
            .position(|o| {
                o.when_contains
                    .as_deref()
                    .is_some_and(|needle| last_text.contains(needle))
            })
            .or_else(|| outputs.iter().position(|o| o.when_contains.is_none()));
        position
            .and_then(|i| outputs.remove(i))
            .ok_or_else(|| ModelError::Fatal("scripted model has no output left".into()))
    }
}

impl Model for ScriptedModel {
    fn query(&self, messages: &[Message], params: &QueryParams) -> Result<Message, ModelError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(RecordedQuery {
                messages: messages.to_vec(),
                n: params.n,
            });
        }
        let last_text = messages.last().map(Message::text).unwrap_or_default();
        let output = self.next_output(&last_text)?;
        debug!(n = params.n, "scripted model answering");

        match output.fail {
            Some(FailKind::Interrupted) => {
                return Err(ModelError::Interrupted("scripted interrupt".into()));
            }
            Some(FailKind::Transient) => {
                return Err(ModelError::Transient("scripted transient failure".into()));
            }
            Some(FailKind::Fatal) => {
                return Err(ModelError::Fatal("scripted fatal failure".into()));
            }
            None => {}
        }

        let mut message = Message::assistant(output.content.clone()).with_timestamp();
        message.tool_calls = output.tool_calls.clone();
        if let Some(first) = output.choices.first()
            && output.content.is_empty()
            && output.tool_calls.is_empty()
        {
            message = Message::assistant(first.content.clone()).with_timestamp();
            message.tool_calls = first.tool_calls.clone();
        }
        if !output.choices.is_empty() {
            let choices: Vec<Value> = output
                .choices
                .iter()
                .map(|choice| {
                    json!({
                        "message": {
                            "role": "assistant",
                            "content": choice.content,
                            "tool_calls": choice.tool_calls,
                        }
                    })
                })
                .collect();
            message.extra.response = Some(json!({ "choices": choices }));
        }
        message.extra.cost = Some(output.cost.unwrap_or(self.cost_per_call));
        Ok(message)
    }

    fn template_vars(&self) -> Value {
        json!({ "model_name": "scripted" })
    }
}
