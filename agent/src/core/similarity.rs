//! Pairwise similarity of candidate actions.
//!
//! When every candidate proposes essentially the same command there is
//! nothing for a verifier to decide, so its query can be skipped.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::Candidate;

pub const TOKEN_JACCARD: &str = "token_jaccard";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSimilarity {
    pub left: usize,
    pub right: usize,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityReport {
    pub metric: String,
    pub threshold: f64,
    pub min_pairwise_similarity: f64,
    pub pairwise_similarity: Vec<PairSimilarity>,
    pub should_skip_verifier: bool,
}

/// Compare every pair of candidates by the token sets of their commands.
///
/// Fewer than two candidates never skips the verifier.
pub fn analyze(candidates: &[Candidate], threshold: f64) -> SimilarityReport {
    let signatures: Vec<BTreeSet<String>> = candidates.iter().map(signature).collect();

    let mut pairwise = Vec::new();
    let mut min_similarity = 1.0f64;
    for i in 0..signatures.len() {
        for j in (i + 1)..signatures.len() {
            let similarity = token_jaccard(&signatures[i], &signatures[j]);
            min_similarity = min_similarity.min(similarity);
            pairwise.push(PairSimilarity {
                left: i,
                right: j,
                similarity,
            });
        }
    }

    let should_skip_verifier =
        candidates.len() >= 2 && pairwise.iter().all(|pair| pair.similarity >= threshold);
    SimilarityReport {
        metric: TOKEN_JACCARD.to_string(),
        threshold,
        min_pairwise_similarity: min_similarity,
        pairwise_similarity: pairwise,
        should_skip_verifier,
    }
}

fn signature(candidate: &Candidate) -> BTreeSet<String> {
    let joined = candidate
        .actions
        .iter()
        .map(|action| action.command.as_str())
        .filter(|command| !command.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    joined
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn token_jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.union(right).count();
    intersection as f64 / union as f64
}
