pub mod replay;

pub use replay::{BacktestReport, Backtester, ReplayHistory};
