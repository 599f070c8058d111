use std::sync::Arc;

use chrono::{DateTime, Utc};

use decision_core::{EngineError, Horizon, PriceSource};
use decision_store::DecisionStore;

/// A horizon that has passed but could not be resolved for lack of price
/// data. Reported, left pending, retried on the next run.
#[derive(Debug, Clone)]
pub struct StalePending {
    pub decision_id: i64,
    pub instrument: String,
    pub horizon: Horizon,
}

#[derive(Debug, Default)]
pub struct ResolutionReport {
    pub resolved: usize,
    pub stale: Vec<StalePending>,
}

/// Resolves past decisions against subsequently observed prices.
///
/// Resolution is monotone: the store only accepts the first write per
/// (decision, horizon), so re-running the tracker is always safe.
pub struct OutcomeTracker {
    store: Arc<DecisionStore>,
    prices: Arc<dyn PriceSource>,
}

impl OutcomeTracker {
    pub fn new(store: Arc<DecisionStore>, prices: Arc<dyn PriceSource>) -> Self {
        Self { store, prices }
    }

    /// Resolve every pending (decision, horizon) whose horizon has elapsed
    /// by `now` and whose prices are observable.
    pub async fn resolve_due(&self, now: DateTime<Utc>) -> Result<ResolutionReport, EngineError> {
        let pending = self.store.pending_outcomes().await?;
        let mut report = ResolutionReport::default();

        for entry in pending {
            let due_at = entry.as_of + entry.horizon.duration();
            if due_at > now {
                continue;
            }

            let price_at_decision = self.prices.price_at(&entry.instrument, entry.as_of).await?;
            let price_at_horizon = self.prices.price_at(&entry.instrument, due_at).await?;

            match (price_at_decision, price_at_horizon) {
                (Some(p0), Some(ph)) if p0 > 0.0 => {
                    let realized_return = (ph - p0) / p0;
                    let wrote = self
                        .store
                        .resolve_outcome(entry.decision_id, entry.horizon, realized_return, now)
                        .await?;
                    if wrote {
                        report.resolved += 1;
                        tracing::info!(
                            decision_id = entry.decision_id,
                            instrument = %entry.instrument,
                            horizon = %entry.horizon,
                            realized_return,
                            "outcome resolved"
                        );
                    }
                }
                _ => {
                    tracing::warn!(
                        decision_id = entry.decision_id,
                        instrument = %entry.instrument,
                        horizon = %entry.horizon,
                        "horizon elapsed but no price data; leaving pending"
                    );
                    report.stale.push(StalePending {
                        decision_id: entry.decision_id,
                        instrument: entry.instrument,
                        horizon: entry.horizon,
                    });
                }
            }
        }

        tracing::info!(
            resolved = report.resolved,
            stale = report.stale.len(),
            "outcome resolution pass complete"
        );
        Ok(report)
    }
}
