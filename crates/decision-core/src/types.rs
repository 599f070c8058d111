use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Minimum weight any analyzer retains regardless of measured accuracy.
pub const WEIGHT_FLOOR: f64 = 0.02;

/// Tolerance for the sum-to-one invariant on weight sets.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// The six fixed analyzers whose outputs the engine fuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerId {
    Technical,
    Fundamental,
    Macroeconomic,
    Sector,
    Sentiment,
    Insider,
}

impl AnalyzerId {
    pub const ALL: [AnalyzerId; 6] = [
        AnalyzerId::Technical,
        AnalyzerId::Fundamental,
        AnalyzerId::Macroeconomic,
        AnalyzerId::Sector,
        AnalyzerId::Sentiment,
        AnalyzerId::Insider,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerId::Technical => "technical",
            AnalyzerId::Fundamental => "fundamental",
            AnalyzerId::Macroeconomic => "macroeconomic",
            AnalyzerId::Sector => "sector",
            AnalyzerId::Sentiment => "sentiment",
            AnalyzerId::Insider => "insider",
        }
    }

    pub fn parse(s: &str) -> Option<AnalyzerId> {
        AnalyzerId::ALL.iter().copied().find(|a| a.as_str() == s)
    }
}

impl fmt::Display for AnalyzerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output contract every analyzer must satisfy. Immutable once emitted
/// for a given (instrument, as_of).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerOutput {
    pub analyzer: AnalyzerId,
    /// Signal score, -100 (strong sell) to +100 (strong buy).
    pub score: f64,
    /// How much the analyzer trusts its own score, 0 to 1.
    pub confidence: f64,
    /// Ordered textual claims supporting the score.
    pub rationale: Vec<String>,
    pub as_of: DateTime<Utc>,
}

impl AnalyzerOutput {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(-100.0..=100.0).contains(&self.score) || !self.score.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "{} score {} outside [-100, 100]",
                self.analyzer, self.score
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "{} confidence {} outside [0, 1]",
                self.analyzer, self.confidence
            )));
        }
        Ok(())
    }
}

/// A versioned, immutable set of fusion weights. A new optimization run
/// creates a new version; exactly one version is current at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    pub weights: BTreeMap<AnalyzerId, f64>,
    pub version: i64,
    pub effective_from: DateTime<Utc>,
}

impl WeightSet {
    /// Build a weight set, rejecting anything that violates the
    /// sum-to-one or floor invariants.
    pub fn new(
        weights: BTreeMap<AnalyzerId, f64>,
        version: i64,
        effective_from: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let set = WeightSet {
            weights,
            version,
            effective_from,
        };
        set.validate()?;
        Ok(set)
    }

    /// The hand-tuned starting weights used before any optimization run.
    pub fn defaults(effective_from: DateTime<Utc>) -> Self {
        let weights = BTreeMap::from([
            (AnalyzerId::Fundamental, 0.30),
            (AnalyzerId::Technical, 0.20),
            (AnalyzerId::Macroeconomic, 0.15),
            (AnalyzerId::Sector, 0.15),
            (AnalyzerId::Sentiment, 0.12),
            (AnalyzerId::Insider, 0.08),
        ]);
        WeightSet {
            weights,
            version: 1,
            effective_from,
        }
    }

    pub fn weight(&self, analyzer: AnalyzerId) -> f64 {
        self.weights.get(&analyzer).copied().unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.weights.is_empty() {
            return Err(EngineError::InvariantViolation(
                "weight set has no entries".to_string(),
            ));
        }
        let sum: f64 = self.weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::InvariantViolation(format!(
                "weights sum to {sum:.8}, expected 1.0"
            )));
        }
        for (analyzer, w) in &self.weights {
            if !w.is_finite() || *w < WEIGHT_FLOOR - WEIGHT_SUM_TOLERANCE || *w > 1.0 {
                return Err(EngineError::InvariantViolation(format!(
                    "{analyzer} weight {w:.4} outside [{WEIGHT_FLOOR}, 1.0]"
                )));
            }
        }
        Ok(())
    }
}

/// Recommended action for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::StrongBuy => "STRONG_BUY",
            Action::Buy => "BUY",
            Action::Hold => "HOLD",
            Action::Sell => "SELL",
            Action::StrongSell => "STRONG_SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Action> {
        match s {
            "STRONG_BUY" => Some(Action::StrongBuy),
            "BUY" => Some(Action::Buy),
            "HOLD" => Some(Action::Hold),
            "SELL" => Some(Action::Sell),
            "STRONG_SELL" => Some(Action::StrongSell),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed future offset at which a decision's outcome is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    OneWeek,
    OneMonth,
    ThreeMonths,
    SixMonths,
}

impl Horizon {
    pub const ALL: [Horizon; 4] = [
        Horizon::OneWeek,
        Horizon::OneMonth,
        Horizon::ThreeMonths,
        Horizon::SixMonths,
    ];

    pub fn days(&self) -> i64 {
        match self {
            Horizon::OneWeek => 7,
            Horizon::OneMonth => 30,
            Horizon::ThreeMonths => 90,
            Horizon::SixMonths => 180,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::days(self.days())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Horizon::OneWeek => "1w",
            Horizon::OneMonth => "1m",
            Horizon::ThreeMonths => "3m",
            Horizon::SixMonths => "6m",
        }
    }

    pub fn parse(s: &str) -> Option<Horizon> {
        Horizon::ALL.iter().copied().find(|h| h.label() == s)
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A fused decision for one (instrument, as_of). Append-only once logged;
/// re-analysis of the same period goes through an explicit supersede.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeDecision {
    pub id: Option<i64>,
    pub instrument: String,
    pub as_of: DateTime<Utc>,
    pub composite_score: f64,
    pub confidence: f64,
    pub action: Action,
    /// Weight set version that was current at decision time. Decisions are
    /// never re-scored by later weight changes.
    pub weight_version: i64,
    pub position_size_pct: f64,
    pub stop_loss_pct: f64,
    /// The exact analyzer outputs that produced this decision.
    pub inputs: Vec<AnalyzerOutput>,
    /// Ordered justification, strongest contribution first.
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub superseded: bool,
}

/// Realized result of a decision at one horizon. Pending until the horizon
/// has elapsed and a price exists; resolved exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub decision_id: i64,
    pub horizon: Horizon,
    /// Signed fraction, e.g. 0.08 = +8%. None while pending.
    pub realized_return: Option<f64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Outcome {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Derived per-analyzer accuracy over a trailing window of resolved
/// outcomes. Recomputed on demand, never authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracySnapshot {
    pub analyzer: AnalyzerId,
    pub horizon: Horizon,
    pub as_of: DateTime<Utc>,
    /// Fraction of decisions where the analyzer called the direction right.
    pub direction_accuracy: f64,
    /// Spearman rank correlation between analyzer score and realized return.
    pub information_coefficient: f64,
    pub sample_size: usize,
    pub mean_abs_score_correct: f64,
    pub mean_abs_score_wrong: f64,
}
