//! Model backend that delegates each query to an external program.
//!
//! The program receives a JSON request on stdin:
//!
//! ```json
//! {"messages": [{"role": "user", "content": "..."}], "n": 1, "sampling": {}}
//! ```
//!
//! and must print a JSON response on stdout, either flat
//! (`{"content": "...", "tool_calls": [...], "cost": 0.01}`) or OpenAI-shaped
//! (`{"choices": [{"message": {...}}], "cost": 0.01}`). Exit code 130 means
//! the operator interrupted the query.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Message, Role, ToolCall};
use crate::io::process::run_command_with_timeout;
use crate::model::{Model, ModelError, QueryParams};

const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandModelConfig {
    /// Program and arguments, e.g. `["python3", "query_llm.py"]`.
    pub command: Vec<String>,
    /// Name reported to prompt templates.
    pub model_name: String,
    /// Extra environment variables for the program.
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CommandModelConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            model_name: String::new(),
            env: BTreeMap::new(),
            timeout_secs: 300,
            output_limit_bytes: 4_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandModel {
    config: CommandModelConfig,
}

#[derive(Serialize)]
struct Request<'a> {
    messages: Vec<RequestMessage<'a>>,
    n: usize,
    sampling: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "no_tool_calls")]
    tool_calls: &'a [ToolCall],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

fn no_tool_calls(calls: &&[ToolCall]) -> bool {
    calls.is_empty()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Response {
    content: Option<String>,
    tool_calls: Vec<ToolCall>,
    cost: f64,
    choices: Vec<Value>,
}

impl CommandModel {
    pub fn new(config: CommandModelConfig) -> Result<Self> {
        if config.command.is_empty() || config.command[0].trim().is_empty() {
            bail!("model.command must be a non-empty array");
        }
        if config.timeout_secs == 0 {
            bail!("model.timeout_secs must be > 0");
        }
        Ok(Self { config })
    }

    fn request_body(messages: &[Message], params: &QueryParams) -> Result<Vec<u8>, ModelError> {
        let request = Request {
            messages: messages
                .iter()
                .map(|m| RequestMessage {
                    role: m.role,
                    content: m.text(),
                    tool_calls: &m.tool_calls,
                    tool_call_id: m.tool_call_id.as_deref(),
                })
                .collect(),
            n: params.n,
            sampling: &params.sampling,
        };
        serde_json::to_vec(&request)
            .map_err(|e| ModelError::Fatal(format!("serialize model request: {e}")))
    }
}

impl Model for CommandModel {
    #[instrument(skip_all, fields(n = params.n, messages = messages.len()))]
    fn query(&self, messages: &[Message], params: &QueryParams) -> Result<Message, ModelError> {
        let body = Self::request_body(messages, params)?;
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]).envs(&self.config.env);

        info!(program = %self.config.command[0], "querying command model");
        let output = run_command_with_timeout(
            cmd,
            Some(&body),
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        )
        .map_err(|e| ModelError::Fatal(format!("run model command: {e:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "model command timed out");
            return Err(ModelError::Transient(format!(
                "model command timed out after {}s",
                self.config.timeout_secs
            )));
        }
        match output.status.code() {
            Some(0) => {}
            Some(INTERRUPTED_EXIT_CODE) => {
                return Err(ModelError::Interrupted(output.stderr_text().trim().to_string()));
            }
            code => {
                warn!(exit_code = ?code, "model command failed");
                return Err(ModelError::Fatal(format!(
                    "model command exited with {code:?}: {}",
                    output.stderr_text().trim()
                )));
            }
        }
        if output.stdout_truncated > 0 {
            return Err(ModelError::Fatal(format!(
                "model response exceeded {} bytes",
                self.config.output_limit_bytes
            )));
        }

        let raw: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ModelError::Fatal(format!("parse model response: {e}")))?;
        let message = message_from_response(raw)?;
        debug!(cost = ?message.extra.cost, "command model answered");
        Ok(message)
    }

    fn template_vars(&self) -> Value {
        json!({ "model_name": self.config.model_name })
    }
}

fn message_from_response(raw: Value) -> Result<Message, ModelError> {
    let response: Response = serde_json::from_value(raw.clone())
        .map_err(|e| ModelError::Fatal(format!("unexpected model response shape: {e}")))?;

    let (content, tool_calls) = match (response.content, response.choices.first()) {
        (Some(content), _) => (content, response.tool_calls),
        (None, Some(first)) => {
            let choice = &first["message"];
            let content = choice["content"].as_str().unwrap_or_default().to_string();
            let tool_calls = serde_json::from_value(choice["tool_calls"].clone()).unwrap_or_default();
            (content, tool_calls)
        }
        (None, None) if !response.tool_calls.is_empty() => (String::new(), response.tool_calls),
        (None, None) => {
            return Err(ModelError::Fatal(
                "model response has neither content nor choices".into(),
            ));
        }
    };

    let mut message = Message::assistant(content).with_timestamp();
    message.tool_calls = tool_calls;
    message.extra.cost = Some(response.cost);
    message.extra.response = Some(raw);
    Ok(message)
}
