pub mod accuracy;
pub mod optimizer;
pub mod outcome_tracker;

pub use accuracy::{AccuracyReport, AccuracyTracker};
pub use optimizer::{OptimizeOutcome, WeightOptimizer};
pub use outcome_tracker::{OutcomeTracker, ResolutionReport, StalePending};
