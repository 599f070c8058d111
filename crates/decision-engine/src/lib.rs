pub mod classifier;
pub mod scorer;

pub use classifier::{classify, size_position, PositionPlan};
pub use scorer::{CompositeScore, CompositeScorer};
