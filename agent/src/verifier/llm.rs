//! LLM judge: one query that names the best candidate.

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::json;
use tracing::{debug, instrument};

use crate::core::template::{recursive_merge, render};
use crate::core::types::{Message, VerifierOutput};
use crate::io::config::VerifierConfig;
use crate::model::{Model, QueryParams, response_cost};
use crate::verifier::{SelectContext, Selection, fallback_index};

pub struct LlmJudge {
    model: Arc<dyn Model>,
    config: VerifierConfig,
    selection_regex: Regex,
    score_regex: Option<Regex>,
    progress_regex: Option<Regex>,
    checklist_regex: Option<Regex>,
}

impl LlmJudge {
    pub fn new(model: Arc<dyn Model>, config: VerifierConfig) -> Result<Self> {
        let selection_regex =
            Regex::new(&config.selection_regex).context("compile selection_regex")?;
        let score_regex = optional_regex(config.score_regex.as_deref()).context("compile score_regex")?;
        let progress_regex =
            optional_regex(config.progress_regex.as_deref()).context("compile progress_regex")?;
        let checklist_regex =
            optional_regex(config.checklist_regex.as_deref()).context("compile checklist_regex")?;
        Ok(Self {
            model,
            config,
            selection_regex,
            score_regex,
            progress_regex,
            checklist_regex,
        })
    }

    #[instrument(skip_all, fields(candidates = ctx.candidates.len()))]
    pub fn select(&self, ctx: SelectContext<'_>) -> Result<Selection> {
        let base = self.config.selection_index_base;
        let local = json!({
            "candidates": ctx.candidates,
            "selection_index_base": base,
        });
        let vars = recursive_merge([ctx.vars, &local]);
        let system = render(&self.config.system_template, &vars).context("render judge system prompt")?;
        let prompt =
            render(&self.config.selection_template, &vars).context("render judge selection prompt")?;

        let response = self
            .model
            .query(
                &[Message::system(system), Message::user(prompt)],
                &QueryParams::default(),
            )
            .context("query llm judge")?;
        let content = response.text();

        let raw_index = last_capture(&self.selection_regex, &content).and_then(|s| s.parse::<i64>().ok());
        let parsed = raw_index
            .and_then(|raw| raw.checked_sub(base))
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < ctx.candidates.len());
        let index = parsed.unwrap_or_else(|| fallback_index(self.config.fallback, ctx.candidates));
        debug!(?raw_index, index, used_fallback = parsed.is_none(), "llm judge selected");

        Ok(Selection {
            index,
            output: VerifierOutput::Llm {
                raw_output: content.clone(),
                raw_index,
                parsed_index: index,
                used_fallback: parsed.is_none(),
                scores: all_numbers(self.score_regex.as_ref(), &content),
                progress: self
                    .progress_regex
                    .as_ref()
                    .and_then(|re| last_capture(re, &content))
                    .and_then(|s| s.parse::<f64>().ok()),
                checklist: all_numbers(self.checklist_regex.as_ref(), &content),
            },
            calls: 1,
            cost: response_cost(&response),
        })
    }
}

fn optional_regex(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern.map(Regex::new).transpose().map_err(Into::into)
}

/// First capture group (or whole match) of the last match.
pub(super) fn last_capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str())
}

fn all_numbers(re: Option<&Regex>, text: &str) -> Vec<f64> {
    let Some(re) = re else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::Fallback;
    use crate::model::{ScriptedModel, ScriptedOutput};
    use crate::verifier::test_util::candidate;

    fn judge(answer: &str, config: VerifierConfig) -> (LlmJudge, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel::from_outputs(vec![
            ScriptedOutput::text(answer).with_cost(0.1),
        ]));
        (LlmJudge::new(model.clone(), config).expect("judge"), model)
    }

    fn select(judge: &LlmJudge, candidates: &[crate::core::types::Candidate]) -> Selection {
        let vars = json!({"task": "fix it"});
        judge
            .select(SelectContext {
                candidates,
                vars: &vars,
            })
            .expect("select")
    }

    /// Verifies the last number wins so reasoning that mentions earlier
    /// candidates does not override the conclusion.
    #[test]
    fn last_match_wins_and_base_is_removed() {
        let candidates = vec![candidate(0, Some("ls")), candidate(1, Some("pwd")), candidate(2, Some("id"))];
        let (judge, model) = judge(
            "Candidate 1 looks risky, candidate 2 is fine. Final answer: 3",
            VerifierConfig::default(),
        );
        let selection = select(&judge, &candidates);
        assert_eq!(selection.index, 2);
        assert_eq!(selection.calls, 1);
        assert_eq!(selection.cost, 0.1);
        match selection.output {
            VerifierOutput::Llm {
                raw_index,
                used_fallback,
                ..
            } => {
                assert_eq!(raw_index, Some(3));
                assert!(!used_fallback);
            }
            other => panic!("unexpected output {other:?}"),
        }

        let prompt = model.queries()[0].messages[1].text();
        assert!(prompt.contains("Candidate 1:\ncandidate 0: ls"));
        assert!(prompt.contains("Candidate 3:"));
    }

    #[test]
    fn out_of_range_uses_first_candidate_fallback() {
        let candidates = vec![candidate(0, None), candidate(1, Some("ls"))];
        let (judge, _) = judge("I pick 9", VerifierConfig::default());
        let selection = select(&judge, &candidates);
        assert_eq!(selection.index, 0);
    }

    #[test]
    fn unparseable_uses_first_valid_fallback() {
        let candidates = vec![candidate(0, None), candidate(1, Some("ls"))];
        let config = VerifierConfig {
            fallback: Fallback::FirstValid,
            ..VerifierConfig::default()
        };
        let (judge, _) = judge("no idea", config);
        let selection = select(&judge, &candidates);
        assert_eq!(selection.index, 1);
        assert!(matches!(
            selection.output,
            VerifierOutput::Llm {
                used_fallback: true,
                raw_index: None,
                ..
            }
        ));
    }

    /// Verifies auxiliary scores are extracted when configured and never
    /// block selection when absent.
    #[test]
    fn auxiliary_scores_are_best_effort() {
        let candidates = vec![candidate(0, Some("ls")), candidate(1, Some("pwd"))];
        let config = VerifierConfig {
            selection_regex: r"CHOICE:\s*(\d+)".into(),
            score_regex: Some(r"SCORE:\s*([0-9.]+)".into()),
            progress_regex: Some(r"PROGRESS:\s*([0-9.]+)".into()),
            checklist_regex: Some(r"ITEM \d+:\s*([0-9.]+)".into()),
            ..VerifierConfig::default()
        };
        let (judge, _) = judge("SCORE: 0.4\nSCORE: 0.8\nPROGRESS: 0.5\nCHOICE: 2", config);
        let selection = select(&judge, &candidates);
        assert_eq!(selection.index, 1);
        match selection.output {
            VerifierOutput::Llm {
                scores,
                progress,
                checklist,
                ..
            } => {
                assert_eq!(scores, vec![0.4, 0.8]);
                assert_eq!(progress, Some(0.5));
                assert!(checklist.is_empty());
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn selection_is_deterministic_for_same_response() {
        let candidates = vec![candidate(0, Some("ls")), candidate(1, Some("pwd"))];
        let (first, _) = judge("2", VerifierConfig::default());
        let (second, _) = judge("2", VerifierConfig::default());
        assert_eq!(select(&first, &candidates), select(&second, &candidates));
    }

    #[test]
    fn judge_failure_propagates() {
        let candidates = vec![candidate(0, Some("ls"))];
        let model = Arc::new(ScriptedModel::from_outputs(Vec::new()));
        let judge = LlmJudge::new(model, VerifierConfig::default()).expect("judge");
        let vars = json!({});
        let err = judge
            .select(SelectContext {
                candidates: &candidates,
                vars: &vars,
            })
            .expect_err("no output");
        assert!(format!("{err:#}").contains("query llm judge"));
    }
}
