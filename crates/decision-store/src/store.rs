use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, SqliteConnection};

use decision_core::{
    AnalyzerOutput, CompositeDecision, EngineError, Horizon, Outcome, WeightSet,
};

use crate::schema::SCHEMA;

/// A decision horizon still awaiting resolution.
#[derive(Debug, Clone)]
pub struct PendingOutcome {
    pub decision_id: i64,
    pub instrument: String,
    pub as_of: DateTime<Utc>,
    pub horizon: Horizon,
}

/// One resolved outcome joined with the analyzer inputs that produced the
/// decision. The unit of work for accuracy tracking.
#[derive(Debug, Clone)]
pub struct ResolvedSample {
    pub decision_id: i64,
    pub realized_return: f64,
    pub inputs: Vec<AnalyzerOutput>,
}

/// Persistence for decisions, outcomes, and weight versions.
///
/// Decisions and weight versions are append-only; an outcome row is written
/// once on first resolution and never recomputed. Every multi-row write goes
/// through a transaction so readers never observe partial state.
pub struct DecisionStore {
    pool: SqlitePool,
}

impl DecisionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if they don't exist.
    pub async fn init_schema(&self) -> Result<(), EngineError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(EngineError::db)?;
        }
        Ok(())
    }

    /// Begin a transaction for callers that need a consistent snapshot
    /// across reads and a following write (the weight optimizer).
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, EngineError> {
        self.pool.begin().await.map_err(EngineError::db)
    }

    // --- Decisions ---

    /// Append a decision and its pending outcome rows. Rejects a second
    /// active decision for the same (instrument, as_of) as a duplicate.
    pub async fn log_decision(&self, decision: &CompositeDecision) -> Result<i64, EngineError> {
        let mut tx = self.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM decisions WHERE instrument = ? AND as_of = ? AND superseded = 0",
        )
        .bind(&decision.instrument)
        .bind(decision.as_of.to_rfc3339())
        .fetch_optional(&mut *tx)
        .await
        .map_err(EngineError::db)?;

        if existing.is_some() {
            return Err(EngineError::DuplicateDecision {
                instrument: decision.instrument.clone(),
                as_of: decision.as_of,
            });
        }

        let inputs_json = serde_json::to_string(&decision.inputs)?;
        let reasoning_json = serde_json::to_string(&decision.reasoning)?;

        let (decision_id,): (i64,) = sqlx::query_as(
            "INSERT INTO decisions (
                instrument, as_of, composite_score, confidence, action,
                weight_version, position_size_pct, stop_loss_pct,
                inputs_json, reasoning_json, superseded
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING id",
        )
        .bind(&decision.instrument)
        .bind(decision.as_of.to_rfc3339())
        .bind(decision.composite_score)
        .bind(decision.confidence)
        .bind(decision.action.as_str())
        .bind(decision.weight_version)
        .bind(decision.position_size_pct)
        .bind(decision.stop_loss_pct)
        .bind(&inputs_json)
        .bind(&reasoning_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(EngineError::db)?;

        for horizon in Horizon::ALL {
            sqlx::query("INSERT INTO outcomes (decision_id, horizon) VALUES (?, ?)")
                .bind(decision_id)
                .bind(horizon.label())
                .execute(&mut *tx)
                .await
                .map_err(EngineError::db)?;
        }

        tx.commit().await.map_err(EngineError::db)?;
        tracing::info!(
            decision_id,
            instrument = %decision.instrument,
            action = %decision.action,
            "decision logged"
        );
        Ok(decision_id)
    }

    /// Mark the active decision for (instrument, as_of) superseded,
    /// permitting a re-log. Returns false when nothing was active.
    pub async fn supersede(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE decisions SET superseded = 1
             WHERE instrument = ? AND as_of = ? AND superseded = 0",
        )
        .bind(instrument)
        .bind(as_of.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(EngineError::db)?;

        let superseded = result.rows_affected() > 0;
        if superseded {
            tracing::info!(instrument, %as_of, "decision superseded");
        }
        Ok(superseded)
    }

    pub async fn get_decision(&self, id: i64) -> Result<Option<CompositeDecision>, EngineError> {
        let row: Option<DecisionRow> = sqlx::query_as(
            "SELECT id, instrument, as_of, composite_score, confidence, action,
                    weight_version, position_size_pct, stop_loss_pct,
                    inputs_json, reasoning_json, superseded
             FROM decisions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::db)?;

        row.map(DecisionRow::into_decision).transpose()
    }

    /// The active (non-superseded) decision for an instrument/timestamp.
    pub async fn get_active_decision(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<CompositeDecision>, EngineError> {
        let row: Option<DecisionRow> = sqlx::query_as(
            "SELECT id, instrument, as_of, composite_score, confidence, action,
                    weight_version, position_size_pct, stop_loss_pct,
                    inputs_json, reasoning_json, superseded
             FROM decisions WHERE instrument = ? AND as_of = ? AND superseded = 0",
        )
        .bind(instrument)
        .bind(as_of.to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::db)?;

        row.map(DecisionRow::into_decision).transpose()
    }

    // --- Outcomes ---

    /// All unresolved (decision, horizon) pairs, oldest decisions first.
    pub async fn pending_outcomes(&self) -> Result<Vec<PendingOutcome>, EngineError> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            "SELECT o.decision_id, d.instrument, d.as_of, o.horizon
             FROM outcomes o
             JOIN decisions d ON d.id = o.decision_id
             WHERE o.resolved_at IS NULL
             ORDER BY d.as_of, o.decision_id, o.horizon",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db)?;

        rows.into_iter().map(PendingRow::into_pending).collect()
    }

    /// Write a resolution exactly once. Returns false when the outcome was
    /// already resolved, leaving the stored values untouched.
    pub async fn resolve_outcome(
        &self,
        decision_id: i64,
        horizon: Horizon,
        realized_return: f64,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE outcomes SET realized_return = ?, resolved_at = ?
             WHERE decision_id = ? AND horizon = ? AND resolved_at IS NULL",
        )
        .bind(realized_return)
        .bind(resolved_at.to_rfc3339())
        .bind(decision_id)
        .bind(horizon.label())
        .execute(&self.pool)
        .await
        .map_err(EngineError::db)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn outcomes_for(&self, decision_id: i64) -> Result<Vec<Outcome>, EngineError> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT decision_id, horizon, realized_return, resolved_at
             FROM outcomes WHERE decision_id = ? ORDER BY horizon",
        )
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db)?;

        rows.into_iter().map(OutcomeRow::into_outcome).collect()
    }

    /// Decisions with a resolved outcome at the given horizon.
    pub async fn resolved_decision_count(&self, horizon: Horizon) -> Result<i64, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(EngineError::db)?;
        Self::resolved_decision_count_on(&mut conn, horizon).await
    }

    pub async fn resolved_decision_count_on(
        conn: &mut SqliteConnection,
        horizon: Horizon,
    ) -> Result<i64, EngineError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT decision_id) FROM outcomes
             WHERE horizon = ? AND resolved_at IS NOT NULL",
        )
        .bind(horizon.label())
        .fetch_one(&mut *conn)
        .await
        .map_err(EngineError::db)?;
        Ok(count)
    }

    /// Most recent resolved outcomes at a horizon, joined with the analyzer
    /// inputs of their decisions.
    pub async fn resolved_samples(
        &self,
        horizon: Horizon,
        limit: usize,
    ) -> Result<Vec<ResolvedSample>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(EngineError::db)?;
        Self::resolved_samples_on(&mut conn, horizon, limit).await
    }

    pub async fn resolved_samples_on(
        conn: &mut SqliteConnection,
        horizon: Horizon,
        limit: usize,
    ) -> Result<Vec<ResolvedSample>, EngineError> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            "SELECT o.decision_id, o.realized_return, d.inputs_json
             FROM outcomes o
             JOIN decisions d ON d.id = o.decision_id
             WHERE o.horizon = ? AND o.resolved_at IS NOT NULL
             ORDER BY o.resolved_at DESC, o.decision_id DESC
             LIMIT ?",
        )
        .bind(horizon.label())
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(EngineError::db)?;

        rows.into_iter()
            .map(|r| {
                Ok(ResolvedSample {
                    decision_id: r.decision_id,
                    realized_return: r.realized_return,
                    inputs: serde_json::from_str(&r.inputs_json)?,
                })
            })
            .collect()
    }

    // --- Weight versions ---

    /// Insert the starting weight set if no version exists yet. Returns the
    /// current set either way. Concurrent first callers are safe: the insert
    /// yields to an existing version 1 and the loser reads back whatever won.
    pub async fn ensure_seed_weights(
        &self,
        now: DateTime<Utc>,
    ) -> Result<WeightSet, EngineError> {
        let seed = WeightSet::defaults(now);
        seed.validate()?;
        let weights_json = serde_json::to_string(&seed.weights)?;
        let result = sqlx::query(
            "INSERT INTO weight_versions (version, weights_json, effective_from, reason)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(version) DO NOTHING",
        )
        .bind(seed.version)
        .bind(&weights_json)
        .bind(seed.effective_from.to_rfc3339())
        .bind("seed defaults")
        .execute(&self.pool)
        .await
        .map_err(EngineError::db)?;

        if result.rows_affected() > 0 {
            tracing::info!(version = seed.version, "seeded default weight set");
        }
        self.current_weights().await?.ok_or_else(|| {
            EngineError::InvariantViolation("weight seed insert left no current version".to_string())
        })
    }

    pub async fn current_weights(&self) -> Result<Option<WeightSet>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(EngineError::db)?;
        Self::current_weights_on(&mut conn).await
    }

    pub async fn current_weights_on(
        conn: &mut SqliteConnection,
    ) -> Result<Option<WeightSet>, EngineError> {
        let row: Option<WeightRow> = sqlx::query_as(
            "SELECT version, weights_json, effective_from
             FROM weight_versions ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(EngineError::db)?;

        row.map(WeightRow::into_weight_set).transpose()
    }

    /// Every version ever created, ascending. Backtests use this to pick the
    /// version that was current at a simulated timestamp.
    pub async fn weight_history(&self) -> Result<Vec<WeightSet>, EngineError> {
        let rows: Vec<WeightRow> = sqlx::query_as(
            "SELECT version, weights_json, effective_from
             FROM weight_versions ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db)?;

        rows.into_iter().map(WeightRow::into_weight_set).collect()
    }

    /// Append a new weight version. The primary key rejects an in-place
    /// rewrite of an existing version.
    pub async fn insert_weight_set_on(
        conn: &mut SqliteConnection,
        set: &WeightSet,
        reason: &str,
    ) -> Result<(), EngineError> {
        set.validate()?;
        let weights_json = serde_json::to_string(&set.weights)?;
        sqlx::query(
            "INSERT INTO weight_versions (version, weights_json, effective_from, reason)
             VALUES (?, ?, ?, ?)",
        )
        .bind(set.version)
        .bind(&weights_json)
        .bind(set.effective_from.to_rfc3339())
        .bind(reason)
        .execute(&mut *conn)
        .await
        .map_err(EngineError::db)?;
        Ok(())
    }
}

// --- Internal row types ---

#[derive(FromRow)]
struct DecisionRow {
    id: i64,
    instrument: String,
    as_of: String,
    composite_score: f64,
    confidence: f64,
    action: String,
    weight_version: i64,
    position_size_pct: f64,
    stop_loss_pct: f64,
    inputs_json: String,
    reasoning_json: String,
    superseded: bool,
}

impl DecisionRow {
    fn into_decision(self) -> Result<CompositeDecision, EngineError> {
        Ok(CompositeDecision {
            id: Some(self.id),
            as_of: parse_timestamp(&self.as_of)?,
            action: decision_core::Action::parse(&self.action).ok_or_else(|| {
                EngineError::InvalidInput(format!("unknown action {:?} in store", self.action))
            })?,
            instrument: self.instrument,
            composite_score: self.composite_score,
            confidence: self.confidence,
            weight_version: self.weight_version,
            position_size_pct: self.position_size_pct,
            stop_loss_pct: self.stop_loss_pct,
            inputs: serde_json::from_str(&self.inputs_json)?,
            reasoning: serde_json::from_str(&self.reasoning_json)?,
            superseded: self.superseded,
        })
    }
}

#[derive(FromRow)]
struct PendingRow {
    decision_id: i64,
    instrument: String,
    as_of: String,
    horizon: String,
}

impl PendingRow {
    fn into_pending(self) -> Result<PendingOutcome, EngineError> {
        Ok(PendingOutcome {
            decision_id: self.decision_id,
            as_of: parse_timestamp(&self.as_of)?,
            horizon: parse_horizon(&self.horizon)?,
            instrument: self.instrument,
        })
    }
}

#[derive(FromRow)]
struct OutcomeRow {
    decision_id: i64,
    horizon: String,
    realized_return: Option<f64>,
    resolved_at: Option<String>,
}

impl OutcomeRow {
    fn into_outcome(self) -> Result<Outcome, EngineError> {
        Ok(Outcome {
            decision_id: self.decision_id,
            horizon: parse_horizon(&self.horizon)?,
            realized_return: self.realized_return,
            resolved_at: self
                .resolved_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

#[derive(FromRow)]
struct SampleRow {
    decision_id: i64,
    realized_return: f64,
    inputs_json: String,
}

#[derive(FromRow)]
struct WeightRow {
    version: i64,
    weights_json: String,
    effective_from: String,
}

impl WeightRow {
    fn into_weight_set(self) -> Result<WeightSet, EngineError> {
        WeightSet::new(
            serde_json::from_str(&self.weights_json)?,
            self.version,
            parse_timestamp(&self.effective_from)?,
        )
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, EngineError> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| EngineError::InvalidInput(format!("bad timestamp {s:?}: {e}")))
}

fn parse_horizon(s: &str) -> Result<Horizon, EngineError> {
    Horizon::parse(s)
        .ok_or_else(|| EngineError::InvalidInput(format!("unknown horizon {s:?} in store")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use decision_core::{Action, AnalyzerId};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> DecisionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = DecisionStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn decision(instrument: &str, as_of: DateTime<Utc>) -> CompositeDecision {
        CompositeDecision {
            id: None,
            instrument: instrument.to_string(),
            as_of,
            composite_score: 43.0,
            confidence: 0.72,
            action: Action::Buy,
            weight_version: 1,
            position_size_pct: 5.0,
            stop_loss_pct: 15.0,
            inputs: vec![AnalyzerOutput {
                analyzer: AnalyzerId::Technical,
                score: 43.0,
                confidence: 0.72,
                rationale: vec!["momentum intact".to_string()],
                as_of,
            }],
            reasoning: vec!["technical (bullish)".to_string()],
            superseded: false,
        }
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn log_creates_decision_and_pending_outcomes() {
        let store = test_store().await;
        let id = store.log_decision(&decision("AAPL", ts(2024, 1, 2))).await.unwrap();

        let loaded = store.get_decision(id).await.unwrap().unwrap();
        assert_eq!(loaded.instrument, "AAPL");
        assert_eq!(loaded.action, Action::Buy);
        assert_eq!(loaded.inputs.len(), 1);

        let outcomes = store.outcomes_for(id).await.unwrap();
        assert_eq!(outcomes.len(), Horizon::ALL.len());
        assert!(outcomes.iter().all(|o| !o.is_resolved()));
    }

    #[tokio::test]
    async fn duplicate_log_rejected_and_original_unmodified() {
        let store = test_store().await;
        let as_of = ts(2024, 1, 2);
        let id = store.log_decision(&decision("AAPL", as_of)).await.unwrap();

        let mut second = decision("AAPL", as_of);
        second.composite_score = -10.0;
        let err = store.log_decision(&second).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDecision { .. }));

        let original = store.get_decision(id).await.unwrap().unwrap();
        assert!((original.composite_score - 43.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn supersede_permits_relog_and_keeps_history() {
        let store = test_store().await;
        let as_of = ts(2024, 1, 2);
        let first_id = store.log_decision(&decision("MSFT", as_of)).await.unwrap();

        assert!(store.supersede("MSFT", as_of).await.unwrap());
        // Second supersede is a no-op.
        assert!(!store.supersede("MSFT", as_of).await.unwrap());

        let second_id = store.log_decision(&decision("MSFT", as_of)).await.unwrap();
        assert_ne!(first_id, second_id);

        let old = store.get_decision(first_id).await.unwrap().unwrap();
        assert!(old.superseded);
        let active = store.get_active_decision("MSFT", as_of).await.unwrap().unwrap();
        assert_eq!(active.id, Some(second_id));
    }

    #[tokio::test]
    async fn outcome_resolution_is_monotone() {
        let store = test_store().await;
        let id = store.log_decision(&decision("NVDA", ts(2024, 1, 2))).await.unwrap();

        let first = store
            .resolve_outcome(id, Horizon::OneWeek, 0.08, ts(2024, 1, 10))
            .await
            .unwrap();
        assert!(first);

        // Second resolution attempt changes nothing.
        let second = store
            .resolve_outcome(id, Horizon::OneWeek, -0.50, ts(2024, 2, 1))
            .await
            .unwrap();
        assert!(!second);

        let outcomes = store.outcomes_for(id).await.unwrap();
        let one_week = outcomes
            .iter()
            .find(|o| o.horizon == Horizon::OneWeek)
            .unwrap();
        assert!((one_week.realized_return.unwrap() - 0.08).abs() < 1e-9);
        assert_eq!(one_week.resolved_at.unwrap(), ts(2024, 1, 10));
    }

    #[tokio::test]
    async fn weight_versions_are_append_only() {
        let store = test_store().await;
        let seed = store.ensure_seed_weights(ts(2024, 1, 1)).await.unwrap();
        assert_eq!(seed.version, 1);

        // A second seeder loses the insert and gets the existing row back,
        // original effective_from intact, never an error.
        let again = store.ensure_seed_weights(ts(2024, 6, 1)).await.unwrap();
        assert_eq!(again.version, 1);
        assert_eq!(again.effective_from, ts(2024, 1, 1));

        let mut next = seed.clone();
        next.version = 2;
        next.effective_from = ts(2024, 2, 1);
        let mut tx = store.begin().await.unwrap();
        DecisionStore::insert_weight_set_on(&mut tx, &next, "test").await.unwrap();
        tx.commit().await.unwrap();

        let current = store.current_weights().await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(store.weight_history().await.unwrap().len(), 2);

        // Seeding once optimization has moved on still returns the latest.
        let late = store.ensure_seed_weights(ts(2024, 7, 1)).await.unwrap();
        assert_eq!(late.version, 2);
    }

    #[tokio::test]
    async fn resolved_samples_join_inputs() {
        let store = test_store().await;
        let id = store.log_decision(&decision("AMD", ts(2024, 1, 2))).await.unwrap();
        store
            .resolve_outcome(id, Horizon::OneMonth, 0.05, ts(2024, 2, 2))
            .await
            .unwrap();

        assert_eq!(
            store.resolved_decision_count(Horizon::OneMonth).await.unwrap(),
            1
        );
        assert_eq!(
            store.resolved_decision_count(Horizon::OneWeek).await.unwrap(),
            0
        );

        let samples = store.resolved_samples(Horizon::OneMonth, 100).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].inputs[0].analyzer, AnalyzerId::Technical);
        assert!((samples[0].realized_return - 0.05).abs() < 1e-9);
    }
}
