//! Deterministic, pure logic shared by the agent core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod actions;
pub mod history;
pub mod limits;
pub mod observation;
pub mod similarity;
pub mod template;
pub mod types;
