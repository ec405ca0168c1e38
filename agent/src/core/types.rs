//! Conversation data model shared by the sampler, verifier and step engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::similarity::SimilarityReport;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Exit,
}

/// Message body: plain text or a list of typed content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    /// Flatten the content to text. Blocks without text are skipped.
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block.text.as_deref())
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default = "default_block_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

fn default_block_type() -> String {
    "text".to_string()
}

/// A single shell command to run in the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub command: String,
    /// Correlates the observation with the tool call that requested it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Action {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            tool_call_id: None,
        }
    }
}

/// Structured tool call as emitted by tool-calling model backends.
///
/// Fields are lenient so that malformed calls can be reported as format
/// errors instead of failing deserialization of the whole response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolFunction {
    pub name: String,
    /// Either a JSON-encoded string or an already decoded object.
    pub arguments: Value,
}

impl ToolCall {
    /// Convenience constructor for a `bash` call with a JSON string argument.
    pub fn bash(id: impl Into<String>, command: &str) -> Self {
        Self {
            id: Some(id.into()),
            kind: Some("function".to_string()),
            function: Some(ToolFunction {
                name: "bash".to_string(),
                arguments: Value::String(serde_json::json!({ "command": command }).to_string()),
            }),
        }
    }
}

/// Side channel attached to every message.
///
/// Known keys are typed; anything else a backend wants to keep travels in
/// `other` and is written back out unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageExtra {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Raw backend response, used to split batched (`n > 1`) responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_parse_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<VerifierMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_str: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// One turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub extra: MessageExtra,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            extra: MessageExtra::default(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Final message of a run.
    pub fn exit(status: &ExitStatus, submission: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Exit, status.as_str());
        message.extra.exit_status = Some(status.as_str().to_string());
        message.extra.submission = Some(submission.into());
        message
    }

    pub fn text(&self) -> String {
        self.content.to_text()
    }

    /// Stamp the message with the current wall-clock time.
    pub fn with_timestamp(mut self) -> Self {
        self.extra.timestamp = Some(chrono::Utc::now().to_rfc3339());
        self
    }
}

/// Terminal status of a run that ended without an unexpected error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Submitted,
    LimitsExceeded,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Submitted => "Submitted",
            ExitStatus::LimitsExceeded => "LimitsExceeded",
        }
    }
}

/// Result of executing one action in the environment.
///
/// A non-zero `returncode` is a normal outcome. Timeouts and spawn failures
/// use `-1` and describe themselves in `exception_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub output: String,
    pub returncode: i32,
    pub exception_info: Option<String>,
}

impl ExecOutput {
    pub fn completed(output: impl Into<String>, returncode: i32) -> Self {
        Self {
            output: output.into(),
            returncode,
            exception_info: None,
        }
    }

    pub fn failed(output: impl Into<String>, exception_info: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            returncode: -1,
            exception_info: Some(exception_info.into()),
        }
    }
}

/// One sampled alternative for the current turn, as shown to verifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub index: usize,
    pub content: String,
    /// First parsed command, if any.
    pub action: Option<String>,
    pub actions: Vec<Action>,
    pub n_actions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl Candidate {
    pub fn has_action(&self) -> bool {
        self.action.as_deref().is_some_and(|a| !a.is_empty())
    }
}

/// Selection record attached to the committed message under `extra.verifier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierMetadata {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: String,
    /// Always within `0..candidates.len()`.
    pub selected_index: usize,
    pub selection_index_base: i64,
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_output: Option<VerifierOutput>,
}

/// Verifier-specific output recorded for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verifier_type", rename_all = "snake_case")]
pub enum VerifierOutput {
    FirstValid,
    Llm {
        raw_output: String,
        raw_index: Option<i64>,
        parsed_index: usize,
        used_fallback: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scores: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        checklist: Vec<f64>,
    },
    RewardModel {
        rewards: Vec<Option<f64>>,
        raw_outputs: Vec<String>,
        used_fallback: bool,
    },
    SimilaritySkip {
        similarity: SimilarityReport,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies unknown side-channel keys survive a JSON round trip.
    #[test]
    fn extra_keeps_unknown_keys() {
        let raw = r#"{"role":"assistant","content":"hi","extra":{"cost":0.5,"usage":{"tokens":3}}}"#;
        let message: Message = serde_json::from_str(raw).expect("parse");
        assert_eq!(message.extra.cost, Some(0.5));
        assert_eq!(message.extra.other["usage"]["tokens"], 3);

        let back = serde_json::to_value(&message).expect("serialize");
        assert_eq!(back["extra"]["usage"]["tokens"], 3);
    }

    #[test]
    fn block_content_flattens_to_text() {
        let raw = r#"{"role":"user","content":[{"type":"text","text":"a"},{"type":"image"},{"type":"text","text":"b"}]}"#;
        let message: Message = serde_json::from_str(raw).expect("parse");
        assert_eq!(message.text(), "a\nb");
    }

    #[test]
    fn exit_message_carries_status_and_submission() {
        let message = Message::exit(&ExitStatus::Submitted, "done\n");
        assert_eq!(message.role, Role::Exit);
        assert_eq!(message.extra.exit_status.as_deref(), Some("Submitted"));
        assert_eq!(message.extra.submission.as_deref(), Some("done\n"));
    }

    #[test]
    fn verifier_output_is_tagged_by_type() {
        let output = VerifierOutput::RewardModel {
            rewards: vec![Some(0.2), None],
            raw_outputs: vec!["REWARD: 0.2".into(), "?".into()],
            used_fallback: false,
        };
        let value = serde_json::to_value(&output).expect("serialize");
        assert_eq!(value["verifier_type"], "reward_model");
        assert_eq!(value["rewards"], serde_json::json!([0.2, null]));
    }
}
