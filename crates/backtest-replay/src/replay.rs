use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use decision_core::{
    AnalyzerId, AnalyzerOutput, CompositeDecision, EngineConfig, EngineError, Horizon, Outcome,
    WeightSet,
};
use decision_engine::{classify, size_position, CompositeScorer};

/// In-memory historical record for a set of instruments: time-ordered
/// analyzer outputs plus a point price series.
#[derive(Debug, Default)]
pub struct ReplayHistory {
    instruments: BTreeMap<String, InstrumentHistory>,
}

#[derive(Debug, Default)]
struct InstrumentHistory {
    outputs: Vec<AnalyzerOutput>,
    prices: BTreeMap<DateTime<Utc>, f64>,
    volatility: BTreeMap<DateTime<Utc>, f64>,
}

impl ReplayHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, instrument: &str, output: AnalyzerOutput) {
        self.instruments
            .entry(instrument.to_string())
            .or_default()
            .outputs
            .push(output);
    }

    pub fn add_price(&mut self, instrument: &str, at: DateTime<Utc>, price: f64) {
        self.instruments
            .entry(instrument.to_string())
            .or_default()
            .prices
            .insert(at, price);
    }

    pub fn price_at(&self, instrument: &str, at: DateTime<Utc>) -> Option<f64> {
        self.instruments.get(instrument)?.prices.get(&at).copied()
    }

    pub fn add_volatility(&mut self, instrument: &str, at: DateTime<Utc>, volatility: f64) {
        self.instruments
            .entry(instrument.to_string())
            .or_default()
            .volatility
            .insert(at, volatility);
    }

    /// The most recent volatility observation with a timestamp at or before
    /// `at`. Observations carry forward, like analyzer outputs.
    pub fn volatility_at(&self, instrument: &str, at: DateTime<Utc>) -> Option<f64> {
        self.instruments
            .get(instrument)?
            .volatility
            .range(..=at)
            .next_back()
            .map(|(_, v)| *v)
    }

    /// Timestamps at which this instrument received fresh analyzer output
    /// inside the given range. These are the replay's evaluation points.
    fn evaluation_times(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let Some(history) = self.instruments.get(instrument) else {
            return Vec::new();
        };
        let times: BTreeSet<DateTime<Utc>> = history
            .outputs
            .iter()
            .map(|o| o.as_of)
            .filter(|t| *t >= start && *t <= end)
            .collect();
        times.into_iter().collect()
    }

    /// The latest output per analyzer with `as_of <= at`. Earlier outputs
    /// carry forward until an analyzer emits again.
    fn outputs_at(&self, instrument: &str, at: DateTime<Utc>) -> Vec<AnalyzerOutput> {
        let Some(history) = self.instruments.get(instrument) else {
            return Vec::new();
        };
        let mut latest: BTreeMap<AnalyzerId, &AnalyzerOutput> = BTreeMap::new();
        for output in &history.outputs {
            if output.as_of > at {
                continue;
            }
            match latest.get(&output.analyzer) {
                Some(prev) if prev.as_of >= output.as_of => {}
                _ => {
                    latest.insert(output.analyzer, output);
                }
            }
        }
        latest.into_values().cloned().collect()
    }
}

/// Replay output: every decision the live pipeline would have logged, in
/// instrument-then-time order, with the outcomes observable inside the
/// replayed range.
#[derive(Debug, Default, Serialize)]
pub struct BacktestReport {
    pub decisions: Vec<CompositeDecision>,
    pub outcomes: Vec<Outcome>,
    /// Evaluation points refused for insufficient analyzer coverage.
    pub coverage_skips: usize,
}

/// Drives scorer -> classifier -> outcome resolution over a `ReplayHistory`
/// in strict ascending time, per instrument in sorted order.
///
/// At simulated time T only analyzer outputs with `as_of <= T` and weight
/// versions with `effective_from <= T` are visible. Two runs over the same
/// history and weight versions produce identical reports.
pub struct Backtester {
    scorer: CompositeScorer,
    config: EngineConfig,
    weight_versions: Vec<WeightSet>,
}

impl Backtester {
    pub fn new(config: EngineConfig, mut weight_versions: Vec<WeightSet>) -> Self {
        weight_versions.sort_by_key(|w| (w.effective_from, w.version));
        Self {
            scorer: CompositeScorer::new(config.clone()),
            config,
            weight_versions,
        }
    }

    fn weights_at(&self, at: DateTime<Utc>) -> Option<&WeightSet> {
        self.weight_versions
            .iter()
            .rev()
            .find(|w| w.effective_from <= at)
    }

    pub fn run(
        &self,
        history: &ReplayHistory,
        instruments: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestReport, EngineError> {
        if start > end {
            return Err(EngineError::InvalidInput(format!(
                "backtest range is inverted: {start} > {end}"
            )));
        }

        let mut sorted: Vec<&String> = instruments.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut report = BacktestReport::default();
        for instrument in sorted {
            for at in history.evaluation_times(instrument, start, end) {
                let weights = self.weights_at(at).ok_or_else(|| {
                    EngineError::InvalidInput(format!("no weight version effective at {at}"))
                })?;
                let outputs = history.outputs_at(instrument, at);

                let composite = match self.scorer.score(&outputs, weights) {
                    Ok(composite) => composite,
                    Err(EngineError::InsufficientCoverage { present_mass, .. }) => {
                        tracing::debug!(
                            %instrument,
                            %at,
                            present_mass,
                            "replay point skipped for coverage"
                        );
                        report.coverage_skips += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let action = classify(composite.score, composite.confidence, &self.config);
                let plan = size_position(
                    action,
                    composite.score,
                    composite.confidence,
                    history.volatility_at(instrument, at),
                    &self.config,
                );
                let reasoning = self.scorer.reasoning(&outputs, weights);

                let decision = CompositeDecision {
                    id: None,
                    instrument: instrument.clone(),
                    as_of: at,
                    composite_score: composite.score,
                    confidence: composite.confidence,
                    action,
                    weight_version: weights.version,
                    position_size_pct: plan.position_size_pct,
                    stop_loss_pct: plan.stop_loss_pct,
                    inputs: outputs,
                    reasoning,
                    superseded: false,
                };

                let decision_index = report.decisions.len() as i64;
                for horizon in Horizon::ALL {
                    report
                        .outcomes
                        .push(self.resolve(history, instrument, &decision, decision_index, horizon, end));
                }
                report.decisions.push(decision);
            }
        }

        tracing::info!(
            decisions = report.decisions.len(),
            coverage_skips = report.coverage_skips,
            "backtest complete"
        );
        Ok(report)
    }

    /// Resolve one horizon against the replayed history, or leave it
    /// pending when the horizon lands outside the range or prices are
    /// missing. Replayed decisions have no store id, so outcomes key on the
    /// decision's position in the report.
    fn resolve(
        &self,
        history: &ReplayHistory,
        instrument: &str,
        decision: &CompositeDecision,
        decision_index: i64,
        horizon: Horizon,
        end: DateTime<Utc>,
    ) -> Outcome {
        let due_at = decision.as_of + horizon.duration();
        let mut outcome = Outcome {
            decision_id: decision_index,
            horizon,
            realized_return: None,
            resolved_at: None,
        };
        if due_at > end {
            return outcome;
        }

        let p0 = history.price_at(instrument, decision.as_of);
        let ph = history.price_at(instrument, due_at);
        if let (Some(p0), Some(ph)) = (p0, ph) {
            if p0 > 0.0 {
                outcome.realized_return = Some((ph - p0) / p0);
                outcome.resolved_at = Some(due_at);
            }
        }
        outcome
    }
}
