//! Verifier prompt overrides loaded from `<prompt_dir>/<prompt_name>/`.
//!
//! A prompt file may hold a system template and a task template separated by
//! markers:
//!
//! ```text
//! [[[SYSTEM_TEMPLATE]]]
//! ...
//! [[[SELECTION_TEMPLATE]]]        (or [[[REWARD_PROMPT_TEMPLATE]]])
//! ...
//! ```
//!
//! A file without markers is the task template only.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::config::{VerifierConfig, VerifierKind};

const SYSTEM_MARKER: &str = "[[[SYSTEM_TEMPLATE]]]";
const SELECTION_MARKER: &str = "[[[SELECTION_TEMPLATE]]]";
const REWARD_MARKER: &str = "[[[REWARD_PROMPT_TEMPLATE]]]";

/// Split a prompt file into an optional system template and the body template.
pub fn split_prompt_file(content: &str, body_marker: &str) -> (Option<String>, String) {
    let Some(body_at) = content.find(body_marker) else {
        return (None, content.to_string());
    };
    let body = content[body_at + body_marker.len()..].trim().to_string();
    let head = &content[..body_at];
    let system = head
        .find(SYSTEM_MARKER)
        .map(|at| head[at + SYSTEM_MARKER.len()..].trim().to_string());
    (system, body)
}

/// Apply template overrides for `config.prompt_name`, if set.
///
/// Relative `prompt_dir` values resolve against `base_dir`. Missing files keep
/// the configured templates.
pub fn apply_prompt_overrides(config: &mut VerifierConfig, base_dir: &Path) -> Result<()> {
    let Some(name) = config.prompt_name.clone() else {
        return Ok(());
    };
    let root = base_dir.join(&config.prompt_dir).join(&name);
    debug!(root = %root.display(), "loading verifier prompt overrides");

    if let Some(system) = read_optional(&root.join("system.jinja"))? {
        match config.kind {
            VerifierKind::RewardModel => config.reward_system_template = system,
            _ => config.system_template = system,
        }
    }

    match config.kind {
        VerifierKind::Llm => {
            if let Some(content) = read_optional(&root.join("selection.jinja"))? {
                let (system, body) = split_prompt_file(&content, SELECTION_MARKER);
                if let Some(system) = system {
                    config.system_template = system;
                }
                config.selection_template = body;
            }
        }
        VerifierKind::RewardModel => {
            if let Some(content) = read_optional(&root.join("reward.jinja"))? {
                let (system, body) = split_prompt_file(&content, REWARD_MARKER);
                if let Some(system) = system {
                    config.reward_system_template = system;
                }
                config.reward_prompt_template = body;
            }
        }
        VerifierKind::FirstValid => {}
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("read prompt {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_with_markers() {
        let content = "[[[SYSTEM_TEMPLATE]]]\nsystem content\n\n[[[SELECTION_TEMPLATE]]]\nselection content\n";
        let (system, body) = split_prompt_file(content, SELECTION_MARKER);
        assert_eq!(system.as_deref(), Some("system content"));
        assert_eq!(body, "selection content");
    }

    #[test]
    fn split_without_markers_is_body_only() {
        let (system, body) = split_prompt_file("reward only content", REWARD_MARKER);
        assert_eq!(system, None);
        assert_eq!(body, "reward only content");
    }

    /// Verifies a single reward file overrides both reward templates and
    /// leaves the selection templates alone.
    #[test]
    fn reward_file_overrides_reward_templates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("prompts/verifier/custom");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(
            dir.join("reward.jinja"),
            "[[[SYSTEM_TEMPLATE]]]\nloaded system\n[[[REWARD_PROMPT_TEMPLATE]]]\nloaded reward prompt\n",
        )
        .expect("write");

        let mut config = VerifierConfig {
            kind: VerifierKind::RewardModel,
            prompt_name: Some("custom".into()),
            ..VerifierConfig::default()
        };
        let selection_before = config.selection_template.clone();
        apply_prompt_overrides(&mut config, temp.path()).expect("apply");
        assert_eq!(config.reward_system_template, "loaded system");
        assert_eq!(config.reward_prompt_template, "loaded reward prompt");
        assert_eq!(config.selection_template, selection_before);
    }

    #[test]
    fn llm_files_override_selection_templates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("prompts/verifier/custom");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("system.jinja"), "sys file").expect("write");
        fs::write(dir.join("selection.jinja"), "pick one").expect("write");

        let mut config = VerifierConfig {
            kind: VerifierKind::Llm,
            prompt_name: Some("custom".into()),
            ..VerifierConfig::default()
        };
        apply_prompt_overrides(&mut config, temp.path()).expect("apply");
        assert_eq!(config.system_template, "sys file");
        assert_eq!(config.selection_template, "pick one");
    }

    #[test]
    fn no_prompt_name_is_a_no_op() {
        let mut config = VerifierConfig::default();
        let before = config.clone();
        apply_prompt_overrides(&mut config, Path::new("/nonexistent")).expect("apply");
        assert_eq!(config, before);
    }
}
