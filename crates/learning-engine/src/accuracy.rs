use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;

use decision_core::stats::spearman;
use decision_core::{AccuracySnapshot, AnalyzerId, EngineConfig, EngineError, Horizon};
use decision_store::{DecisionStore, ResolvedSample};

/// Result of an accuracy computation. Too little data is a named outcome,
/// never an error.
#[derive(Debug, Clone)]
pub enum AccuracyReport {
    Insufficient {
        horizon: Horizon,
        sample_size: usize,
        required: usize,
    },
    Computed {
        horizon: Horizon,
        as_of: DateTime<Utc>,
        sample_size: usize,
        snapshots: Vec<AccuracySnapshot>,
    },
}

impl AccuracyReport {
    pub fn snapshots(&self) -> &[AccuracySnapshot] {
        match self {
            AccuracyReport::Computed { snapshots, .. } => snapshots,
            AccuracyReport::Insufficient { .. } => &[],
        }
    }
}

/// Scores each analyzer's historical predictive value from resolved
/// outcomes: direction accuracy plus rank-correlation information
/// coefficient.
pub struct AccuracyTracker {
    store: Arc<DecisionStore>,
    config: EngineConfig,
}

impl AccuracyTracker {
    pub fn new(store: Arc<DecisionStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Compute per-analyzer accuracy over the trailing window of resolved
    /// outcomes at one horizon. Analyzers whose own sample is below the
    /// configured minimum are omitted from the snapshots.
    pub async fn compute(
        &self,
        horizon: Horizon,
        now: DateTime<Utc>,
    ) -> Result<AccuracyReport, EngineError> {
        let samples = self
            .store
            .resolved_samples(horizon, self.config.accuracy_lookback)
            .await?;

        if samples.len() < self.config.min_accuracy_sample {
            tracing::info!(
                %horizon,
                sample_size = samples.len(),
                required = self.config.min_accuracy_sample,
                "not enough resolved outcomes for accuracy"
            );
            return Ok(AccuracyReport::Insufficient {
                horizon,
                sample_size: samples.len(),
                required: self.config.min_accuracy_sample,
            });
        }

        let snapshots =
            snapshots_from_samples(&samples, horizon, now, self.config.min_accuracy_sample);
        Ok(AccuracyReport::Computed {
            horizon,
            as_of: now,
            sample_size: samples.len(),
            snapshots,
        })
    }
}

/// Pure computation from (analyzer score, realized return) pairs.
pub fn snapshots_from_samples(
    samples: &[ResolvedSample],
    horizon: Horizon,
    now: DateTime<Utc>,
    min_sample: usize,
) -> Vec<AccuracySnapshot> {
    let mut per_analyzer: BTreeMap<AnalyzerId, Vec<(f64, f64)>> = BTreeMap::new();
    for sample in samples {
        for input in &sample.inputs {
            per_analyzer
                .entry(input.analyzer)
                .or_default()
                .push((input.score, sample.realized_return));
        }
    }

    per_analyzer
        .into_iter()
        .filter(|(_, pairs)| pairs.len() >= min_sample)
        .map(|(analyzer, pairs)| {
            // Direction accuracy is measured only where both sides took a
            // direction: a score of 0 is an abstention and a return of 0 has
            // no direction to call, so neither enters the denominator.
            let mut scored = 0usize;
            let mut correct = 0usize;
            let mut abs_correct: Vec<f64> = Vec::new();
            let mut abs_wrong: Vec<f64> = Vec::new();

            for (score, realized) in &pairs {
                let predicted = sign(*score);
                let actual = sign(*realized);
                if predicted == 0 || actual == 0 {
                    continue;
                }
                scored += 1;
                if predicted == actual {
                    correct += 1;
                    abs_correct.push(score.abs());
                } else {
                    abs_wrong.push(score.abs());
                }
            }

            let scores: Vec<f64> = pairs.iter().map(|p| p.0).collect();
            let returns: Vec<f64> = pairs.iter().map(|p| p.1).collect();

            AccuracySnapshot {
                analyzer,
                horizon,
                as_of: now,
                direction_accuracy: if scored == 0 {
                    0.0
                } else {
                    correct as f64 / scored as f64
                },
                information_coefficient: spearman(&scores, &returns),
                sample_size: pairs.len(),
                mean_abs_score_correct: if abs_correct.is_empty() {
                    0.0
                } else {
                    (&abs_correct[..]).mean()
                },
                mean_abs_score_wrong: if abs_wrong.is_empty() {
                    0.0
                } else {
                    (&abs_wrong[..]).mean()
                },
            }
        })
        .collect()
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}
