//! Facade wiring the store, scoring engine, and learning loop into the
//! caller-facing operations: score an instrument, resolve outcomes, compute
//! accuracy, optimize weights, and replay history.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use backtest_replay::{BacktestReport, Backtester, ReplayHistory};
use decision_core::{
    AnalyzerSource, CompositeDecision, EngineConfig, EngineError, Horizon, PriceSource,
};
use decision_engine::{classify, size_position, CompositeScorer};
use decision_store::DecisionStore;
use learning_engine::{
    AccuracyReport, AccuracyTracker, OptimizeOutcome, OutcomeTracker, ResolutionReport,
    WeightOptimizer,
};

pub struct DecisionOrchestrator {
    store: Arc<DecisionStore>,
    analyzers: Arc<dyn AnalyzerSource>,
    prices: Arc<dyn PriceSource>,
    scorer: CompositeScorer,
    outcome_tracker: OutcomeTracker,
    accuracy_tracker: AccuracyTracker,
    optimizer: WeightOptimizer,
    config: EngineConfig,
}

impl DecisionOrchestrator {
    pub fn new(
        store: Arc<DecisionStore>,
        analyzers: Arc<dyn AnalyzerSource>,
        prices: Arc<dyn PriceSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            scorer: CompositeScorer::new(config.clone()),
            outcome_tracker: OutcomeTracker::new(store.clone(), prices.clone()),
            accuracy_tracker: AccuracyTracker::new(store.clone(), config.clone()),
            optimizer: WeightOptimizer::new(store.clone(), config.clone()),
            store,
            analyzers,
            prices,
            config,
        }
    }

    pub fn store(&self) -> &DecisionStore {
        &self.store
    }

    /// Score one instrument at one timestamp and log the decision.
    ///
    /// Coverage failures propagate and log nothing; a live decision for the
    /// same (instrument, as_of) is rejected as a duplicate. Re-analysis goes
    /// through [`supersede_and_rescore`](Self::supersede_and_rescore).
    pub async fn score_instrument(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<CompositeDecision, EngineError> {
        let weights = self.store.ensure_seed_weights(as_of).await?;
        let outputs = self.analyzers.outputs(instrument, as_of).await?;

        let composite = self.scorer.score(&outputs, &weights)?;
        let action = classify(composite.score, composite.confidence, &self.config);
        let volatility = self.prices.volatility_at(instrument, as_of).await?;
        let plan = size_position(
            action,
            composite.score,
            composite.confidence,
            volatility,
            &self.config,
        );
        let reasoning = self.scorer.reasoning(&outputs, &weights);

        let mut decision = CompositeDecision {
            id: None,
            instrument: instrument.to_string(),
            as_of,
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
        let id = self.store.log_decision(&decision).await?;
        decision.id = Some(id);

        tracing::info!(
            %instrument,
            %as_of,
            decision_id = id,
            action = %action,
            score = composite.score,
            "decision logged"
        );
        Ok(decision)
    }

    /// Mark the live decision for (instrument, as_of) superseded and score
    /// the period again. The prior decision stays on the log.
    pub async fn supersede_and_rescore(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<CompositeDecision, EngineError> {
        let superseded = self.store.supersede(instrument, as_of).await?;
        if superseded {
            tracing::info!(%instrument, %as_of, "prior decision superseded");
        }
        self.score_instrument(instrument, as_of).await
    }

    /// Resolve every pending outcome whose horizon has elapsed.
    pub async fn resolve_outcomes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ResolutionReport, EngineError> {
        self.outcome_tracker.resolve_due(now).await
    }

    /// Per-analyzer accuracy over resolved outcomes at one horizon.
    pub async fn compute_accuracy(
        &self,
        horizon: Horizon,
        now: DateTime<Utc>,
    ) -> Result<AccuracyReport, EngineError> {
        self.accuracy_tracker.compute(horizon, now).await
    }

    /// One constrained optimization pass; a no-op below the resolved
    /// decision minimum.
    pub async fn optimize_weights(
        &self,
        now: DateTime<Utc>,
    ) -> Result<OptimizeOutcome, EngineError> {
        self.optimizer.optimize(now).await
    }

    /// Deterministic replay over in-memory history, using every weight
    /// version the store has accumulated.
    pub async fn backtest(
        &self,
        history: &ReplayHistory,
        instruments: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestReport, EngineError> {
        let versions = self.store.weight_history().await?;
        if versions.is_empty() {
            return Err(EngineError::InvalidInput(
                "no weight versions to backtest against".to_string(),
            ));
        }
        Backtester::new(self.config.clone(), versions).run(history, instruments, start, end)
    }
}
