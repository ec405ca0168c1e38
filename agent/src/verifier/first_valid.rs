use crate::core::types::{Candidate, VerifierOutput};
use crate::verifier::Selection;

pub(super) fn select(candidates: &[Candidate]) -> Selection {
    Selection {
        index: first_valid_index(candidates),
        output: VerifierOutput::FirstValid,
        calls: 0,
        cost: 0.0,
    }
}

/// Index of the first candidate with a non-empty action, else `0`.
pub(super) fn first_valid_index(candidates: &[Candidate]) -> usize {
    candidates
        .iter()
        .find(|c| c.has_action())
        .map(|c| c.index)
        .unwrap_or(0)
}
