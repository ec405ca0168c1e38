//! Rendering of environment outputs into observation messages.

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::core::actions::ActionMode;
use crate::core::template::{recursive_merge, render};
use crate::core::types::{Action, ExecOutput, Message, Role};

/// Build one observation message per executed action, in action order.
///
/// Text mode answers with `user` messages. Tool-call mode answers with `tool`
/// messages that echo the originating `tool_call_id`.
pub fn observation_messages(
    mode: ActionMode,
    template: &str,
    actions: &[Action],
    outputs: &[ExecOutput],
    vars: &Value,
) -> Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(outputs.len());
    for (i, (action, output)) in actions.iter().zip(outputs).enumerate() {
        let local = json!({ "output": output, "action": action });
        let merged = recursive_merge([vars, &local]);
        let content =
            render(template, &merged).with_context(|| format!("render observation {i}"))?;

        let role = match mode {
            ActionMode::Text => Role::User,
            ActionMode::ToolCall => Role::Tool,
        };
        let mut message = Message::new(role, content).with_timestamp();
        if mode == ActionMode::ToolCall {
            message.tool_call_id = action.tool_call_id.clone();
        }
        message.extra.raw_output = Some(output.output.clone());
        message.extra.returncode = Some(output.returncode);
        message.extra.exception_info = output.exception_info.clone();
        messages.push(message);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "{% if output.exception_info %}<exception>{{output.exception_info}}</exception>\n{% endif %}<returncode>{{output.returncode}}</returncode>\n<output>\n{{output.output}}</output>";

    #[test]
    fn text_mode_yields_user_messages() {
        let actions = vec![Action::new("echo hello")];
        let outputs = vec![ExecOutput::completed("hello\n", 0)];
        let messages =
            observation_messages(ActionMode::Text, TEMPLATE, &actions, &outputs, &json!({}))
                .expect("render");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(
            messages[0].text(),
            "<returncode>0</returncode>\n<output>\nhello\n</output>"
        );
        assert_eq!(messages[0].extra.returncode, Some(0));
    }

    /// Verifies each tool observation is bound to its call id in order.
    #[test]
    fn tool_mode_echoes_call_ids() {
        let actions = vec![
            Action {
                command: "ls".into(),
                tool_call_id: Some("a".into()),
            },
            Action {
                command: "false".into(),
                tool_call_id: Some("b".into()),
            },
        ];
        let outputs = vec![
            ExecOutput::completed("x\n", 0),
            ExecOutput::completed("", 1),
        ];
        let messages =
            observation_messages(ActionMode::ToolCall, TEMPLATE, &actions, &outputs, &json!({}))
                .expect("render");
        assert_eq!(messages[0].role, Role::Tool);
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("a"));
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("b"));
        assert!(messages[1].text().contains("<returncode>1</returncode>"));
    }

    #[test]
    fn exception_info_is_rendered() {
        let actions = vec![Action::new("sleep 10")];
        let outputs = vec![ExecOutput::failed("999\n", "timed out")];
        let messages =
            observation_messages(ActionMode::Text, TEMPLATE, &actions, &outputs, &json!({}))
                .expect("render");
        let text = messages[0].text();
        assert!(text.starts_with("<exception>timed out</exception>"));
        assert!(text.contains("999"));
    }
}
