use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use decision_core::{
    AnalyzerId, ClampPolicy, EngineConfig, EngineError, WeightSet, WEIGHT_SUM_TOLERANCE,
};
use decision_store::DecisionStore;

use crate::accuracy::snapshots_from_samples;

/// Result of an optimization run. Unmet preconditions are a named no-op,
/// never an error; the current weight set stays in force.
#[derive(Debug, Clone)]
pub enum OptimizeOutcome {
    Applied(WeightSet),
    Skipped { reason: String },
}

/// Proposes a new weight version from accuracy signals under strict
/// stability constraints: 70/30 smoothing toward the target, a 5% cap on
/// any single step, and a 2% floor, with the emitted set summing to 1.
pub struct WeightOptimizer {
    store: Arc<DecisionStore>,
    config: EngineConfig,
}

impl WeightOptimizer {
    pub fn new(store: Arc<DecisionStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Run one optimization pass. Reads resolved outcomes and writes the new
    /// weight version inside a single transaction, so the accuracy snapshot
    /// it acts on is consistent and concurrent outcome writes cannot bleed
    /// into the computation.
    pub async fn optimize(&self, now: DateTime<Utc>) -> Result<OptimizeOutcome, EngineError> {
        let horizon = self.config.optimization_horizon;
        let mut tx = self.store.begin().await?;

        let resolved = DecisionStore::resolved_decision_count_on(&mut tx, horizon).await?;
        if (resolved as usize) < self.config.min_decisions_for_optimization {
            tracing::info!(
                resolved,
                required = self.config.min_decisions_for_optimization,
                "skipping weight optimization: not enough resolved decisions"
            );
            return Ok(OptimizeOutcome::Skipped {
                reason: format!(
                    "need {} decisions with resolved {} outcomes, have {}",
                    self.config.min_decisions_for_optimization,
                    horizon.label(),
                    resolved
                ),
            });
        }

        let current = DecisionStore::current_weights_on(&mut tx)
            .await?
            .ok_or_else(|| {
                EngineError::InvariantViolation("no current weight set to optimize".to_string())
            })?;

        let samples =
            DecisionStore::resolved_samples_on(&mut tx, horizon, self.config.accuracy_lookback)
                .await?;
        let snapshots =
            snapshots_from_samples(&samples, horizon, now, self.config.min_accuracy_sample);
        let coefficients: BTreeMap<AnalyzerId, f64> = snapshots
            .iter()
            .map(|s| (s.analyzer, s.information_coefficient))
            .collect();

        // Any failure past this point aborts the transaction; the prior
        // version stays current.
        let next = propose_weights(&current, &coefficients, &self.config, now)?;

        let reason = format!(
            "optimization from {} resolved {} decisions",
            resolved,
            horizon.label()
        );
        DecisionStore::insert_weight_set_on(&mut tx, &next, &reason).await?;
        tx.commit().await.map_err(EngineError::db)?;

        tracing::info!(
            version = next.version,
            previous = current.version,
            "weight set optimized"
        );
        Ok(OptimizeOutcome::Applied(next))
    }
}

/// Pure weight proposal from information coefficients.
///
/// Analyzers with positive IC split the distributable mass proportionally;
/// non-positive IC pins the target at the floor; analyzers with no accuracy
/// data keep their current weight as the target (no evidence, no pull).
pub fn propose_weights(
    current: &WeightSet,
    coefficients: &BTreeMap<AnalyzerId, f64>,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<WeightSet, EngineError> {
    let floor = config.weight_floor;
    let step = config.max_weight_step;

    let positive_ic_sum: f64 = coefficients.values().filter(|ic| **ic > 0.0).sum();
    let floored_mass: f64 = current
        .weights
        .keys()
        .filter(|a| matches!(coefficients.get(a), Some(ic) if *ic <= 0.0))
        .count() as f64
        * floor;
    let untracked_mass: f64 = current
        .weights
        .iter()
        .filter(|(a, _)| !coefficients.contains_key(*a))
        .map(|(_, w)| *w)
        .sum();
    let distributable = (1.0 - floored_mass - untracked_mass).max(0.0);

    let mut target: BTreeMap<AnalyzerId, f64> = BTreeMap::new();
    for (analyzer, old) in &current.weights {
        let t = match coefficients.get(analyzer) {
            Some(ic) if *ic > 0.0 && positive_ic_sum > 0.0 => distributable * ic / positive_ic_sum,
            Some(_) => floor,
            None => *old,
        };
        target.insert(*analyzer, t);
    }
    normalize(&mut target);

    // 70/30 smoothing: never jump straight to the target.
    let mut proposed: BTreeMap<AnalyzerId, f64> = current
        .weights
        .iter()
        .map(|(analyzer, old)| {
            let t = target.get(analyzer).copied().unwrap_or(*old);
            (
                *analyzer,
                old * (1.0 - config.smoothing_factor) + t * config.smoothing_factor,
            )
        })
        .collect();

    // Per-analyzer feasible band: within one step of the old weight and at
    // or above the floor.
    let lo: BTreeMap<AnalyzerId, f64> = current
        .weights
        .iter()
        .map(|(a, old)| (*a, (old - step).max(floor)))
        .collect();
    let hi: BTreeMap<AnalyzerId, f64> = current
        .weights
        .iter()
        .map(|(a, old)| (*a, (old + step).min(1.0)))
        .collect();

    match config.clamp_policy {
        ClampPolicy::ClampThenRenormalize => {
            clamp_to_band(&mut proposed, &lo, &hi);
            redistribute(&mut proposed, &lo, &hi)?;
        }
        ClampPolicy::RenormalizeThenClamp => {
            normalize(&mut proposed);
            clamp_to_band(&mut proposed, &lo, &hi);
            redistribute(&mut proposed, &lo, &hi)?;
        }
    }

    // Belt and braces: the emitted set must honor the step cap even after
    // redistribution.
    for (analyzer, w) in &proposed {
        let old = current.weight(*analyzer);
        if (w - old).abs() > step + WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::InvariantViolation(format!(
                "{analyzer} step {:.4} exceeds cap {step}",
                (w - old).abs()
            )));
        }
    }

    WeightSet::new(proposed, current.version + 1, now)
}

fn normalize(weights: &mut BTreeMap<AnalyzerId, f64>) {
    let sum: f64 = weights.values().sum();
    if sum > f64::EPSILON {
        for w in weights.values_mut() {
            *w /= sum;
        }
    }
}

fn clamp_to_band(
    weights: &mut BTreeMap<AnalyzerId, f64>,
    lo: &BTreeMap<AnalyzerId, f64>,
    hi: &BTreeMap<AnalyzerId, f64>,
) {
    for (analyzer, w) in weights.iter_mut() {
        *w = w.clamp(lo[analyzer], hi[analyzer]);
    }
}

/// Push the sum back to exactly 1 by moving weights proportionally to their
/// remaining slack, never leaving the per-analyzer band.
fn redistribute(
    weights: &mut BTreeMap<AnalyzerId, f64>,
    lo: &BTreeMap<AnalyzerId, f64>,
    hi: &BTreeMap<AnalyzerId, f64>,
) -> Result<(), EngineError> {
    let lo_sum: f64 = lo.values().sum();
    let hi_sum: f64 = hi.values().sum();
    if lo_sum > 1.0 + WEIGHT_SUM_TOLERANCE || hi_sum < 1.0 - WEIGHT_SUM_TOLERANCE {
        return Err(EngineError::InvariantViolation(format!(
            "weight bands cannot reach sum 1 (lo {lo_sum:.4}, hi {hi_sum:.4})"
        )));
    }

    for _ in 0..32 {
        let sum: f64 = weights.values().sum();
        let deficit = 1.0 - sum;
        if deficit.abs() <= 1e-12 {
            return Ok(());
        }

        let slack: BTreeMap<AnalyzerId, f64> = weights
            .iter()
            .map(|(a, w)| {
                let s = if deficit > 0.0 { hi[a] - w } else { w - lo[a] };
                (*a, s.max(0.0))
            })
            .collect();
        let total_slack: f64 = slack.values().sum();
        if total_slack < deficit.abs() - WEIGHT_SUM_TOLERANCE {
            break;
        }
        if total_slack <= f64::EPSILON {
            break;
        }

        for (analyzer, w) in weights.iter_mut() {
            *w += deficit * slack[analyzer] / total_slack;
        }
    }

    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(EngineError::InvariantViolation(format!(
            "redistribution failed to reach sum 1 (got {sum:.8})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use decision_core::{Action, AnalyzerOutput, CompositeDecision, Horizon};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sqlx::sqlite::SqlitePoolOptions;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn coefficients(pairs: &[(AnalyzerId, f64)]) -> BTreeMap<AnalyzerId, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn strong_analyzer_gains_weak_analyzer_shrinks() {
        let config = EngineConfig::default();
        let current = WeightSet::defaults(ts(2024, 1, 1));
        let ics = coefficients(&[
            (AnalyzerId::Technical, 0.40),
            (AnalyzerId::Fundamental, 0.10),
            (AnalyzerId::Macroeconomic, -0.20),
            (AnalyzerId::Sector, 0.05),
            (AnalyzerId::Sentiment, 0.02),
            (AnalyzerId::Insider, -0.10),
        ]);

        let next = propose_weights(&current, &ics, &config, ts(2024, 2, 1)).unwrap();
        next.validate().unwrap();
        assert_eq!(next.version, current.version + 1);

        // Technical has the best IC and should gain; macro has negative IC
        // and should shrink toward the floor.
        assert!(next.weight(AnalyzerId::Technical) > current.weight(AnalyzerId::Technical));
        assert!(
            next.weight(AnalyzerId::Macroeconomic) < current.weight(AnalyzerId::Macroeconomic)
        );
    }

    #[test]
    fn step_cap_and_floor_hold_under_random_coefficients() {
        let config = EngineConfig::default();
        let current = WeightSet::defaults(ts(2024, 1, 1));
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let ics: BTreeMap<AnalyzerId, f64> = AnalyzerId::ALL
                .iter()
                .map(|a| (*a, rng.gen_range(-1.0..1.0)))
                .collect();
            let next = propose_weights(&current, &ics, &config, ts(2024, 2, 1)).unwrap();

            let sum: f64 = next.weights.values().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            for analyzer in AnalyzerId::ALL {
                let old = current.weight(analyzer);
                let new = next.weight(analyzer);
                assert!(
                    (new - old).abs() <= config.max_weight_step + 1e-6,
                    "{analyzer}: {old} -> {new}"
                );
                assert!(new >= config.weight_floor - 1e-9, "{analyzer}: {new}");
            }
        }
    }

    #[test]
    fn both_clamp_policies_satisfy_constraints() {
        let current = WeightSet::defaults(ts(2024, 1, 1));
        let ics = coefficients(&[
            (AnalyzerId::Technical, 0.9),
            (AnalyzerId::Fundamental, -0.5),
            (AnalyzerId::Macroeconomic, -0.5),
            (AnalyzerId::Sector, -0.5),
            (AnalyzerId::Sentiment, -0.5),
            (AnalyzerId::Insider, -0.5),
        ]);

        for policy in [
            ClampPolicy::ClampThenRenormalize,
            ClampPolicy::RenormalizeThenClamp,
        ] {
            let mut config = EngineConfig::default();
            config.clamp_policy = policy;
            let next = propose_weights(&current, &ics, &config, ts(2024, 2, 1)).unwrap();
            next.validate().unwrap();
            for analyzer in AnalyzerId::ALL {
                let delta = (next.weight(analyzer) - current.weight(analyzer)).abs();
                assert!(delta <= config.max_weight_step + 1e-6, "{policy:?} {analyzer}");
            }
        }
    }

    #[test]
    fn analyzers_without_data_keep_their_weight_as_target() {
        let config = EngineConfig::default();
        let current = WeightSet::defaults(ts(2024, 1, 1));
        // Only technical has accuracy data; everyone else should barely move.
        let ics = coefficients(&[(AnalyzerId::Technical, 0.3)]);

        let next = propose_weights(&current, &ics, &config, ts(2024, 2, 1)).unwrap();
        next.validate().unwrap();
        for analyzer in AnalyzerId::ALL {
            let delta = (next.weight(analyzer) - current.weight(analyzer)).abs();
            assert!(delta <= config.max_weight_step + 1e-6);
        }
    }

    // --- Store-backed preconditions ---

    async fn store_with_resolved(count: usize) -> Arc<DecisionStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(DecisionStore::new(pool));
        store.init_schema().await.unwrap();
        store.ensure_seed_weights(ts(2024, 1, 1)).await.unwrap();

        for i in 0..count {
            let as_of = ts(2024, 1, 1) + chrono::Duration::hours(i as i64);
            let score = if i % 2 == 0 { 40.0 } else { -40.0 };
            let decision = CompositeDecision {
                id: None,
                instrument: format!("SYM{i}"),
                as_of,
                composite_score: score,
                confidence: 0.6,
                action: Action::Buy,
                weight_version: 1,
                position_size_pct: 5.0,
                stop_loss_pct: 15.0,
                inputs: vec![
                    AnalyzerOutput {
                        analyzer: AnalyzerId::Technical,
                        score,
                        confidence: 0.6,
                        rationale: vec![],
                        as_of,
                    },
                    AnalyzerOutput {
                        analyzer: AnalyzerId::Fundamental,
                        score: -score,
                        confidence: 0.6,
                        rationale: vec![],
                        as_of,
                    },
                ],
                reasoning: vec![],
                superseded: false,
            };
            let id = store.log_decision(&decision).await.unwrap();
            // Technical called the direction right every time.
            let realized = if score > 0.0 { 0.05 } else { -0.05 };
            store
                .resolve_outcome(id, Horizon::OneMonth, realized + i as f64 * 1e-4, ts(2024, 3, 1))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn below_minimum_resolved_is_a_noop() {
        let store = store_with_resolved(10).await;
        let optimizer = WeightOptimizer::new(store.clone(), EngineConfig::default());

        let outcome = optimizer.optimize(ts(2024, 3, 2)).await.unwrap();
        assert!(matches!(outcome, OptimizeOutcome::Skipped { .. }));

        // Current version unchanged.
        let current = store.current_weights().await.unwrap().unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(store.weight_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn meeting_preconditions_appends_a_new_version() {
        let store = store_with_resolved(60).await;
        let optimizer = WeightOptimizer::new(store.clone(), EngineConfig::default());

        let outcome = optimizer.optimize(ts(2024, 3, 2)).await.unwrap();
        let applied = match outcome {
            OptimizeOutcome::Applied(set) => set,
            other => panic!("expected applied, got {other:?}"),
        };
        assert_eq!(applied.version, 2);
        applied.validate().unwrap();

        // Technical was consistently right, fundamental consistently wrong.
        let seed = WeightSet::defaults(ts(2024, 1, 1));
        assert!(applied.weight(AnalyzerId::Technical) > seed.weight(AnalyzerId::Technical));
        assert!(applied.weight(AnalyzerId::Fundamental) < seed.weight(AnalyzerId::Fundamental));

        let current = store.current_weights().await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        // Version 1 still present, untouched.
        assert_eq!(store.weight_history().await.unwrap()[0].version, 1);
    }
}
