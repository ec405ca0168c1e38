//! Model abstraction for acting and judge queries.
//!
//! The [`Model`] trait decouples the step engine from concrete LLM backends.
//! Backends report failures through [`ModelError`] so callers can tell an
//! operator interrupt from a retryable hiccup or a hard failure.

mod command;
mod scripted;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::types::Message;

pub use command::{CommandModel, CommandModelConfig};
pub use scripted::{
    FailKind, RecordedQuery, ScriptedChoice, ScriptedModel, ScriptedModelConfig, ScriptedOutput,
};

/// Per-query sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    /// Number of choices requested in one call.
    pub n: usize,
    /// Backend-specific sampling parameters (temperature, ...).
    pub sampling: Map<String, Value>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            n: 1,
            sampling: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// The operator interrupted the query. Carries an optional note for the model.
    #[error("query interrupted: {0}")]
    Interrupted(String),
    /// A failure that may succeed on retry (timeouts, rate limits).
    #[error("transient model error: {0}")]
    Transient(String),
    /// A failure that will not go away by retrying.
    #[error("model error: {0}")]
    Fatal(String),
}

/// A language model backend.
///
/// Returned messages carry the response text and tool calls, the query cost
/// in `extra.cost`, and for `n > 1` requests the raw response under
/// `extra.response` with a `choices` list.
pub trait Model: Send + Sync {
    fn query(&self, messages: &[Message], params: &QueryParams) -> Result<Message, ModelError>;

    /// Variables exposed to prompt templates.
    fn template_vars(&self) -> Value {
        json!({})
    }
}

/// Model backend selection (TOML `[model]` table, tagged by `kind`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    /// Replays configured responses in order.
    Scripted(ScriptedModelConfig),
    /// Delegates every query to an external program.
    Command(CommandModelConfig),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::Command(CommandModelConfig::default())
    }
}

pub fn build_model(config: &ModelConfig) -> Result<Arc<dyn Model>> {
    Ok(match config {
        ModelConfig::Scripted(cfg) => Arc::new(ScriptedModel::new(cfg.clone())),
        ModelConfig::Command(cfg) => Arc::new(CommandModel::new(cfg.clone())?),
    })
}

/// Cost recorded on a response, `0` when the backend did not report one.
pub fn response_cost(message: &Message) -> f64 {
    message.extra.cost.unwrap_or(0.0)
}
