use serde::{Deserialize, Serialize};

use crate::Horizon;

/// Order in which the optimizer applies the per-analyzer step clamp and the
/// final renormalization. The exact order is a documented policy choice, so
/// both are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampPolicy {
    ClampThenRenormalize,
    RenormalizeThenClamp,
}

/// Tunables for the scoring/learning loop. Defaults match the shipped
/// configuration; individual values can be overridden from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum fraction of total weight mass that must be covered by
    /// present analyzers before a score is produced.
    pub min_coverage: f64,
    /// Composite confidence below this forces HOLD.
    pub low_confidence_floor: f64,
    /// Hard cap on position size, percent of portfolio.
    pub max_position_pct: f64,
    /// Decisions with at least one resolved outcome required before any
    /// optimization run is permitted.
    pub min_decisions_for_optimization: usize,
    /// Per-analyzer resolved-outcome sample below which accuracy is
    /// reported as insufficient.
    pub min_accuracy_sample: usize,
    /// Most recent resolved outcomes considered per horizon.
    pub accuracy_lookback: usize,
    /// Fraction of the target weight blended in per optimization run.
    pub smoothing_factor: f64,
    /// Maximum per-analyzer weight change per optimization run.
    pub max_weight_step: f64,
    /// No analyzer weight may fall below this.
    pub weight_floor: f64,
    pub clamp_policy: ClampPolicy,
    /// Horizon whose resolved outcomes drive weight optimization.
    pub optimization_horizon: Horizon,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_coverage: 0.40,
            low_confidence_floor: 0.30,
            max_position_pct: 10.0,
            min_decisions_for_optimization: 50,
            min_accuracy_sample: 10,
            accuracy_lookback: 500,
            smoothing_factor: 0.30,
            max_weight_step: 0.05,
            weight_floor: crate::WEIGHT_FLOOR,
            clamp_policy: ClampPolicy::ClampThenRenormalize,
            optimization_horizon: Horizon::OneMonth,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then apply any `CONVICTION_*` environment overrides.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = EngineConfig::default();
        if let Some(v) = env_f64("CONVICTION_MIN_COVERAGE") {
            config.min_coverage = v;
        }
        if let Some(v) = env_f64("CONVICTION_LOW_CONFIDENCE_FLOOR") {
            config.low_confidence_floor = v;
        }
        if let Some(v) = env_f64("CONVICTION_MAX_POSITION_PCT") {
            config.max_position_pct = v;
        }
        if let Some(v) = env_usize("CONVICTION_MIN_DECISIONS_FOR_OPTIMIZATION") {
            config.min_decisions_for_optimization = v;
        }
        if let Some(v) = env_usize("CONVICTION_MIN_ACCURACY_SAMPLE") {
            config.min_accuracy_sample = v;
        }
        if let Some(v) = env_usize("CONVICTION_ACCURACY_LOOKBACK") {
            config.accuracy_lookback = v;
        }
        if let Some(v) = env_f64("CONVICTION_SMOOTHING_FACTOR") {
            config.smoothing_factor = v;
        }
        if let Some(v) = env_f64("CONVICTION_MAX_WEIGHT_STEP") {
            config.max_weight_step = v;
        }
        if let Some(v) = env_f64("CONVICTION_WEIGHT_FLOOR") {
            config.weight_floor = v;
        }
        if let Ok(v) = std::env::var("CONVICTION_CLAMP_POLICY") {
            match v.as_str() {
                "renormalize_then_clamp" => {
                    config.clamp_policy = ClampPolicy::RenormalizeThenClamp
                }
                "clamp_then_renormalize" => {
                    config.clamp_policy = ClampPolicy::ClampThenRenormalize
                }
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("CONVICTION_OPTIMIZATION_HORIZON") {
            if let Some(h) = Horizon::parse(&v) {
                config.optimization_horizon = h;
            }
        }
        config
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}
