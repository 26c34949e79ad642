//! Retention Engine: scheduled, resumable expiry of raw facts.

pub mod engine;
pub mod sweep;

pub use engine::{retention_loop, RetentionEngine};
pub use sweep::{RetentionSweeper, SweepPass};
