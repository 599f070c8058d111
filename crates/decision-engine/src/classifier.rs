use decision_core::{Action, EngineConfig};

/// Sizing output attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionPlan {
    /// Percent of portfolio, capped at the configured maximum.
    pub position_size_pct: f64,
    /// Percent below entry at which the position is abandoned.
    pub stop_loss_pct: f64,
}

/// Map composite score + confidence to an action.
///
/// Low confidence dominates: below the floor the action is forced to HOLD
/// regardless of how strong the score looks.
pub fn classify(score: f64, confidence: f64, config: &EngineConfig) -> Action {
    if confidence < config.low_confidence_floor {
        return Action::Hold;
    }
    if score >= 50.0 {
        Action::StrongBuy
    } else if score >= 20.0 {
        Action::Buy
    } else if score <= -50.0 {
        Action::StrongSell
    } else if score <= -20.0 {
        Action::Sell
    } else {
        Action::Hold
    }
}

// Conviction-tier sizing defaults (percent of portfolio).
const SIZE_HIGH_CONVICTION: f64 = 8.0;
const SIZE_MEDIUM_CONVICTION: f64 = 5.0;
const SIZE_LOW_CONVICTION: f64 = 2.0;

// Stops: tighter for tactical high-conviction entries, wide for core holds.
const STOP_TACTICAL_PCT: f64 = 8.0;
const STOP_CORE_PCT: f64 = 15.0;

// Annualized volatility above this starts scaling position size down.
const VOL_SCALE_THRESHOLD: f64 = 0.40;

/// Deterministic position sizing from (action, confidence, volatility).
///
/// Volatility is an optional annualized fraction (e.g. 0.35 = 35%). When it
/// is missing, sizing degrades to the conservative defaults and never fails.
pub fn size_position(
    action: Action,
    score: f64,
    confidence: f64,
    volatility: Option<f64>,
    config: &EngineConfig,
) -> PositionPlan {
    if action == Action::Hold {
        return PositionPlan {
            position_size_pct: 0.0,
            stop_loss_pct: STOP_CORE_PCT,
        };
    }

    let base = if score.abs() >= 50.0 && confidence >= 0.7 {
        SIZE_HIGH_CONVICTION
    } else if score.abs() >= 20.0 && confidence >= 0.5 {
        SIZE_MEDIUM_CONVICTION
    } else {
        SIZE_LOW_CONVICTION
    };

    let (size, stop) = match volatility {
        Some(vol) if vol.is_finite() && vol > 0.0 => {
            let scale = if vol > VOL_SCALE_THRESHOLD {
                VOL_SCALE_THRESHOLD / vol
            } else {
                1.0
            };
            // Stop widens with realized volatility: half the annualized move,
            // bounded to the tactical/core band.
            let stop = (vol * 100.0 * 0.5).clamp(STOP_TACTICAL_PCT, 25.0);
            (base * scale, stop)
        }
        _ => {
            let stop = if score.abs() >= 50.0 {
                STOP_TACTICAL_PCT
            } else {
                STOP_CORE_PCT
            };
            (base, stop)
        }
    };

    PositionPlan {
        position_size_pct: size.min(config.max_position_pct),
        stop_loss_pct: stop,
    }
}
