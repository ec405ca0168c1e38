//! Extraction of shell actions from model responses.
//!
//! Free-text responses must contain exactly one fenced action block.
//! Tool-call responses may carry several `bash` calls; every malformed call
//! is reported, not just the first.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

use crate::core::template::render;
use crate::core::types::{Action, Message, ToolCall};

/// The only tool name accepted in tool-call mode.
pub const BASH_TOOL: &str = "bash";

/// How actions are encoded in model responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    #[default]
    Text,
    ToolCall,
}

/// The response did not have the expected action shape.
///
/// `message` is the rendered feedback to show the model; `detail` is the
/// short machine-oriented description.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{detail}")]
pub struct FormatError {
    pub message: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ActionParser {
    mode: ActionMode,
    action_regex: Regex,
    format_error_template: String,
}

impl ActionParser {
    pub fn new(mode: ActionMode, action_regex: &str, format_error_template: &str) -> Result<Self> {
        let action_regex = Regex::new(action_regex)
            .with_context(|| format!("compile action regex {action_regex:?}"))?;
        Ok(Self {
            mode,
            action_regex,
            format_error_template: format_error_template.to_string(),
        })
    }

    pub fn mode(&self) -> ActionMode {
        self.mode
    }

    /// Parse the actions a response encodes according to the configured mode.
    pub fn parse(&self, message: &Message) -> Result<Vec<Action>, FormatError> {
        match self.mode {
            ActionMode::Text => self.parse_text(&message.text()),
            ActionMode::ToolCall => self.parse_tool_calls(&message.tool_calls),
        }
    }

    pub fn parse_text(&self, content: &str) -> Result<Vec<Action>, FormatError> {
        let matches: Vec<String> = self
            .action_regex
            .captures_iter(content)
            .map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default()
            })
            .collect();
        if matches.len() == 1 {
            return Ok(vec![Action::new(matches[0].clone())]);
        }
        let detail = format!("expected exactly one action block, found {}", matches.len());
        Err(self.format_error(&matches, detail))
    }

    pub fn parse_tool_calls(&self, tool_calls: &[ToolCall]) -> Result<Vec<Action>, FormatError> {
        if tool_calls.is_empty() {
            let detail = "No tool calls found in the response. Every response MUST include at least one tool call.".to_string();
            return Err(self.format_error(&[], detail));
        }
        let mut actions = Vec::new();
        let mut errors = Vec::new();
        for call in tool_calls {
            match action_from_tool_call(call) {
                Ok(action) => actions.push(action),
                Err(err) => errors.push(err),
            }
        }
        if errors.is_empty() {
            return Ok(actions);
        }
        let commands: Vec<String> = actions.into_iter().map(|a| a.command).collect();
        Err(self.format_error(&commands, errors.join("; ")))
    }

    fn format_error(&self, actions: &[String], detail: String) -> FormatError {
        let vars = json!({
            "actions": actions,
            "n_actions": actions.len(),
            "error": detail,
        });
        let message = match render(&self.format_error_template, &vars) {
            Ok(message) => message,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "format error template failed to render");
                detail.clone()
            }
        };
        FormatError { message, detail }
    }
}

fn action_from_tool_call(call: &ToolCall) -> Result<Action, String> {
    let Some(function) = &call.function else {
        return Err("Malformed tool call object.".to_string());
    };
    let arguments = match &function.arguments {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| format!("Error parsing tool call arguments: {e}"))?,
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    if function.name != BASH_TOOL {
        return Err(format!("Unknown tool '{}'.", function.name));
    }
    let command = arguments
        .get("command")
        .ok_or_else(|| "Missing 'command' argument in bash tool call.".to_string())?;
    let command = match command {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Action {
        command,
        tool_call_id: call.id.clone().filter(|id| !id.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ToolFunction;

    const REGEX: &str = r"(?s)```bash\s*\n(.*?)\n```";
    const TEMPLATE: &str = "Found {{ actions|length }} actions. {{ error }}";

    fn text_parser() -> ActionParser {
        ActionParser::new(ActionMode::Text, REGEX, TEMPLATE).expect("parser")
    }

    fn tool_parser() -> ActionParser {
        ActionParser::new(ActionMode::ToolCall, REGEX, TEMPLATE).expect("parser")
    }

    #[test]
    fn single_block_yields_trimmed_action() {
        let actions = text_parser()
            .parse_text("Let me look.\n```bash\n  ls -la  \n```\n")
            .expect("parse");
        assert_eq!(actions, vec![Action::new("ls -la")]);
    }

    /// Verifies zero and multiple blocks both produce a rendered format error
    /// that reports how many blocks were found.
    #[test]
    fn wrong_block_count_is_format_error() {
        let parser = text_parser();

        let none = parser.parse_text("no actions here").expect_err("zero");
        assert!(none.message.starts_with("Found 0 actions."));

        let two = parser
            .parse_text("```bash\nls\n```\nand\n```bash\npwd\n```")
            .expect_err("two");
        assert!(two.message.starts_with("Found 2 actions."));
        assert!(two.detail.contains("found 2"));
    }

    #[test]
    fn tool_calls_preserve_ids_and_order() {
        let calls = vec![ToolCall::bash("call_1", "ls"), ToolCall::bash("call_2", "pwd")];
        let actions = tool_parser().parse_tool_calls(&calls).expect("parse");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].command, "ls");
        assert_eq!(actions[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(actions[1].tool_call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn tool_call_arguments_may_be_an_object() {
        let call = ToolCall {
            id: None,
            kind: None,
            function: Some(ToolFunction {
                name: "bash".into(),
                arguments: json!({"command": "echo hi"}),
            }),
        };
        let actions = tool_parser().parse_tool_calls(&[call]).expect("parse");
        assert_eq!(actions, vec![Action::new("echo hi")]);
    }

    /// Verifies every malformed call is reported and good calls do not hide bad ones.
    #[test]
    fn malformed_tool_calls_accumulate_errors() {
        let calls = vec![
            ToolCall::bash("ok", "ls"),
            ToolCall {
                id: Some("bad_name".into()),
                kind: None,
                function: Some(ToolFunction {
                    name: "python".into(),
                    arguments: json!({"command": "print(1)"}),
                }),
            },
            ToolCall {
                id: Some("bad_json".into()),
                kind: None,
                function: Some(ToolFunction {
                    name: "bash".into(),
                    arguments: Value::String("{not json".into()),
                }),
            },
            ToolCall {
                id: Some("no_command".into()),
                kind: None,
                function: Some(ToolFunction {
                    name: "bash".into(),
                    arguments: json!({"cmd": "ls"}),
                }),
            },
            ToolCall::default(),
        ];
        let err = tool_parser().parse_tool_calls(&calls).expect_err("errors");
        let parts: Vec<&str> = err.detail.split("; ").collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "Unknown tool 'python'.");
        assert!(parts[1].starts_with("Error parsing tool call arguments:"));
        assert_eq!(parts[2], "Missing 'command' argument in bash tool call.");
        assert_eq!(parts[3], "Malformed tool call object.");
        assert!(err.message.starts_with("Found 1 actions."));
    }

    #[test]
    fn missing_tool_calls_is_format_error() {
        let err = tool_parser().parse_tool_calls(&[]).expect_err("empty");
        assert!(err.detail.contains("No tool calls found"));
    }
}
