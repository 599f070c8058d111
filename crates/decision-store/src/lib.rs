pub mod schema;
pub mod store;

pub use store::{DecisionStore, PendingOutcome, ResolvedSample};
