use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{AnalyzerOutput, EngineError};

/// Source of analyzer outputs for an instrument at a point in time.
///
/// Analyzers are external collaborators; the engine only consumes their
/// output records. Implementations must be point-in-time correct: no
/// returned output may be timestamped after the requested `as_of`.
#[async_trait]
pub trait AnalyzerSource: Send + Sync {
    async fn outputs(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<AnalyzerOutput>, EngineError>;
}

/// Point price lookups against external market-data history.
///
/// Used only by outcome resolution and backtesting. `None` means no
/// observation exists at (or acceptably near) the requested timestamp.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price_at(
        &self,
        instrument: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, EngineError>;

    /// Annualized volatility observed for the instrument at (or as of) the
    /// given timestamp, as a fraction (0.35 = 35%). Feeds position sizing;
    /// sources without a volatility series return `None` and sizing falls
    /// back to its conservative defaults.
    async fn volatility_at(
        &self,
        _instrument: &str,
        _at: DateTime<Utc>,
    ) -> Result<Option<f64>, EngineError> {
        Ok(None)
    }
}
