//! Reward-model judge: scores every candidate concurrently and keeps the best.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::{Regex, RegexBuilder};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::template::{recursive_merge, render};
use crate::core::types::{Candidate, Message, VerifierOutput};
use crate::io::config::VerifierConfig;
use crate::model::{Model, ModelError, QueryParams, response_cost};
use crate::verifier::llm::last_capture;
use crate::verifier::{SelectContext, Selection, fallback_index};

pub struct RewardJudge {
    model: Arc<dyn Model>,
    config: VerifierConfig,
    reward_regex: Regex,
}

/// Result of scoring one candidate.
#[derive(Debug)]
struct Scored {
    reward: Option<f64>,
    raw_output: String,
    calls: u64,
    cost: f64,
}

impl RewardJudge {
    pub fn new(model: Arc<dyn Model>, config: VerifierConfig) -> Result<Self> {
        let reward_regex = RegexBuilder::new(&config.reward_regex)
            .multi_line(true)
            .build()
            .context("compile reward_regex")?;
        Ok(Self {
            model,
            config,
            reward_regex,
        })
    }

    /// Score all candidates on a bounded pool of scoped threads.
    ///
    /// Each worker claims the next unscored index and sends its result back
    /// tagged with that index, so completion order does not matter.
    #[instrument(skip_all, fields(candidates = ctx.candidates.len()))]
    pub fn select(&self, ctx: SelectContext<'_>) -> Result<Selection> {
        let n = ctx.candidates.len();
        if n == 0 {
            bail!("reward judge called without candidates");
        }
        let workers = n.min(self.config.reward_max_workers).max(1);
        let mut slots: Vec<Option<Result<Scored>>> = (0..n).map(|_| None).collect();

        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, Result<Scored>)>();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        if i >= n {
                            break;
                        }
                        let scored = self.score(ctx, &ctx.candidates[i]);
                        if tx.send((i, scored)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for (i, scored) in rx {
                slots[i] = Some(scored);
            }
        });

        let mut rewards = Vec::with_capacity(n);
        let mut raw_outputs = Vec::with_capacity(n);
        let mut calls = 0;
        let mut cost = 0.0;
        for (i, slot) in slots.into_iter().enumerate() {
            let scored = slot
                .ok_or_else(|| anyhow!("reward worker produced no result for candidate {i}"))??;
            rewards.push(scored.reward);
            raw_outputs.push(scored.raw_output);
            calls += scored.calls;
            cost += scored.cost;
        }

        let best = best_index(&rewards);
        let index = best.unwrap_or_else(|| fallback_index(self.config.fallback, ctx.candidates));
        debug!(?rewards, index, used_fallback = best.is_none(), "reward judge selected");
        Ok(Selection {
            index,
            output: VerifierOutput::RewardModel {
                rewards,
                raw_outputs,
                used_fallback: best.is_none(),
            },
            calls,
            cost,
        })
    }

    fn score(&self, ctx: SelectContext<'_>, candidate: &Candidate) -> Result<Scored> {
        let local = json!({
            "candidates": ctx.candidates,
            "candidate": candidate,
            "selection_index_base": self.config.selection_index_base,
        });
        let vars = recursive_merge([ctx.vars, &local]);
        let system = render(&self.config.reward_system_template, &vars)
            .context("render reward system prompt")?;
        let prompt = render(&self.config.reward_prompt_template, &vars)
            .context("render reward prompt")?;
        let messages = [Message::system(system), Message::user(prompt)];

        let attempts = self.config.reward_max_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.model.query(&messages, &QueryParams::default()) {
                Ok(response) => {
                    let raw_output = response.text();
                    return Ok(Scored {
                        reward: self.parse_reward(&raw_output),
                        raw_output,
                        calls: u64::from(attempt) + 1,
                        cost: response_cost(&response),
                    });
                }
                Err(err @ ModelError::Interrupted(_)) => {
                    return Err(err).context(format!("reward query for candidate {}", candidate.index));
                }
                Err(err) => {
                    warn!(candidate = candidate.index, attempt, err = %err, "reward query failed");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        thread::sleep(self.backoff(attempt));
                    }
                }
            }
        }
        let err = last_err.unwrap_or_else(|| ModelError::Fatal("reward query not attempted".into()));
        Err(err).context(format!(
            "reward query for candidate {} failed after {attempts} attempts",
            candidate.index
        ))
    }

    fn parse_reward(&self, content: &str) -> Option<f64> {
        last_capture(&self.reward_regex, content).and_then(|raw| raw.parse::<f64>().ok())
    }

    /// `base^attempt` seconds; a base of zero disables sleeping.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.reward_backoff_base_secs;
        if base <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(base.powi(exponent)).unwrap_or(Duration::MAX)
    }
}

/// Highest reward; the first maximum in index order wins ties.
fn best_index(rewards: &[Option<f64>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, reward) in rewards.iter().enumerate() {
        let Some(reward) = *reward else {
            continue;
        };
        if best.is_none_or(|(_, value)| reward > value) {
            best = Some((i, reward));
        }
    }
    best.map(|(i, _)| i)
}
