//! Post-scheduling analysis: aggregation, cross-run history and scoring.

pub mod aggregator;
pub mod evaluator;
pub mod history;

pub use aggregator::{Aggregator, DedupPolicy};
pub use evaluator::{EvaluationPolicy, Evaluator, GroundTruth};
pub use history::DedupHistory;
