//! Multi-candidate coding agent loop.
//!
//! Each step samples several candidate responses from the acting model, lets a
//! verifier pick one, executes its shell actions and feeds the observations
//! back, until the model submits or a step/cost limit is reached. The crate
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (action parsing, limits, templates,
//!   similarity, history). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config files, process execution,
//!   trajectories, prompt files).
//! - **[`model`]** and **[`verifier`]**: the model boundary and the closed set
//!   of candidate-selection strategies.
//!
//! Orchestration modules ([`sampler`], [`step`], [`looping`]) coordinate core
//! logic with I/O to implement the `agent` CLI. [`replay`] and [`rollout`]
//! branch new runs from a saved trajectory.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod model;
pub mod replay;
pub mod rollout;
pub mod sampler;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verifier;
