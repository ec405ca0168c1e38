//! Grouping of conversation history into assistant-led steps.

use crate::core::types::{Message, Role};

/// Split `messages` into the prelude (system prompt, task and anything else
/// before the first assistant turn) and steps that each start at an
/// assistant message and include everything up to the next one.
pub fn split_steps(messages: &[Message]) -> (Vec<Message>, Vec<Vec<Message>>) {
    let mut prelude = Vec::new();
    let mut steps: Vec<Vec<Message>> = Vec::new();
    for message in messages {
        if message.role == Role::Assistant {
            steps.push(vec![message.clone()]);
        } else if let Some(step) = steps.last_mut() {
            step.push(message.clone());
        } else {
            prelude.push(message.clone());
        }
    }
    (prelude, steps)
}

/// Steps shown to a verifier: the last `history_steps` steps of
/// [`split_steps`], or all of them when negative. The prelude is never
/// included.
///
/// Zero means no history at all, not the whole conversation.
pub fn verifier_steps(messages: &[Message], history_steps: i64) -> Vec<Vec<Message>> {
    let (_, mut steps) = split_steps(messages);
    if history_steps < 0 {
        return steps;
    }
    let keep = usize::try_from(history_steps).unwrap_or(usize::MAX);
    let skip = steps.len().saturating_sub(keep);
    steps.split_off(skip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(turns: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("sys"), Message::user("task")];
        for i in 0..turns {
            messages.push(Message::assistant(format!("a{i}")));
            messages.push(Message::user(format!("o{i}")));
        }
        messages
    }

    #[test]
    fn groups_start_at_assistant_messages() {
        let steps = verifier_steps(&conversation(2), -1);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0][0].text(), "a0");
        assert_eq!(steps[0][1].text(), "o0");
        assert_eq!(steps[1][0].text(), "a1");
    }

    #[test]
    fn keeps_only_most_recent_steps() {
        let steps = verifier_steps(&conversation(5), 2);
        let heads: Vec<String> = steps.iter().map(|s| s[0].text()).collect();
        assert_eq!(heads, vec!["a3", "a4"]);
    }

    #[test]
    fn zero_history_yields_no_steps() {
        assert!(verifier_steps(&conversation(3), 0).is_empty());
    }

    #[test]
    fn split_keeps_prelude_apart() {
        let (prelude, steps) = split_steps(&conversation(2));
        assert_eq!(prelude.len(), 2);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].iter().map(Message::text).collect::<Vec<_>>(), vec!["a1", "o1"]);
    }

    #[test]
    fn prelude_only_yields_no_steps() {
        assert!(verifier_steps(&conversation(0), -1).is_empty());
    }
}
