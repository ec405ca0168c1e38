//! Candidate selection.
//!
//! [`Verifier`] is a closed set of selection strategies chosen once from
//! config. Judge variants query a model; their spend is reported back in
//! [`Selection`] so the caller can account for it.

mod first_valid;
mod llm;
mod reward;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::core::types::{Candidate, VerifierOutput};
use crate::io::config::{Fallback, VerifierConfig, VerifierKind};
use crate::io::prompt::apply_prompt_overrides;
use crate::model::{Model, build_model};

pub use llm::LlmJudge;
pub use reward::RewardJudge;

/// Outcome of one selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Index chosen by the verifier. Callers still clamp it.
    pub index: usize,
    pub output: VerifierOutput,
    /// Judge queries issued and their total cost.
    pub calls: u64,
    pub cost: f64,
}

/// Inputs shared by every judge prompt.
#[derive(Debug, Clone, Copy)]
pub struct SelectContext<'a> {
    pub candidates: &'a [Candidate],
    /// Extra template variables (`task`, `messages`, `steps`, ...).
    pub vars: &'a Value,
}

pub enum Verifier {
    FirstValid,
    Llm(LlmJudge),
    RewardModel(RewardJudge),
}

impl Verifier {
    /// Build the configured verifier.
    ///
    /// Prompt overrides resolve against `base_dir`. Judges use `acting_model`
    /// unless a separate judge model is configured.
    pub fn from_config(
        config: &VerifierConfig,
        acting_model: Arc<dyn Model>,
        base_dir: &Path,
    ) -> Result<Self> {
        let mut config = config.clone();
        apply_prompt_overrides(&mut config, base_dir)?;
        let model = match &config.model {
            Some(model_config) => build_model(model_config)?,
            None => acting_model,
        };
        Ok(match config.kind {
            VerifierKind::FirstValid => Verifier::FirstValid,
            VerifierKind::Llm => Verifier::Llm(LlmJudge::new(model, config)?),
            VerifierKind::RewardModel => Verifier::RewardModel(RewardJudge::new(model, config)?),
        })
    }

    /// Pick one candidate.
    ///
    /// Judge query failures propagate; a step is never committed on a
    /// selection the judge could not actually make.
    pub fn select(&self, ctx: SelectContext<'_>) -> Result<Selection> {
        match self {
            Verifier::FirstValid => Ok(first_valid::select(ctx.candidates)),
            Verifier::Llm(judge) => judge.select(ctx),
            Verifier::RewardModel(judge) => judge.select(ctx),
        }
    }
}

/// Index used when a judge produced nothing usable.
pub(crate) fn fallback_index(fallback: Fallback, candidates: &[Candidate]) -> usize {
    match fallback {
        Fallback::FirstCandidate => 0,
        Fallback::FirstValid => first_valid::first_valid_index(candidates),
    }
}
