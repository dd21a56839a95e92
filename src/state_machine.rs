// =============================================================================
// Position State Machine — stop-loss / arm / trailing-take-profit decisions
// =============================================================================
//
// Evaluation order per price observation is fixed:
//
//   1. recompute unrealized pct from cost basis
//   2. ratchet the ATH high-water mark
//   3. unarmed and at/below the stop level   -> SELL(STOP_LOSS), stop here
//   4. at/above the arm threshold            -> armed = true (sticky)
//   5. armed and retraced enough off the ATH -> SELL(TRAILING_TAKE_PROFIT)
//
// At most one sell decision per call; the stop-loss branch short-circuits the
// arm and trailing checks for that observation. All comparisons are inclusive.
// A position that arms and has already retraced 3 points from the just-updated
// ATH closes on the same observation.
// =============================================================================

use tracing::{debug, info};

use crate::types::{ExitReason, PositionRecord};

/// Loss threshold (percent) that exits an unarmed position.
pub const STOP_LOSS_PCT: f64 = -3.0;
/// Gain threshold (percent) that arms trailing-exit monitoring.
pub const ARM_THRESHOLD_PCT: f64 = 5.0;
/// Retracement from the ATH (percentage points) that exits an armed position.
pub const TRAILING_DROP_PCT: f64 = 3.0;

/// Decision produced by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Hold,
    Sell(ExitReason),
}

/// Apply one price observation to `record`, updating the unrealized pct, the
/// ATH ratchet, and the armed flag in place. Returns the exit decision.
pub fn evaluate(record: &mut PositionRecord, observed_price: f64) -> ExitAction {
    record.current_price = observed_price;
    record.unrealized_pct =
        (observed_price - record.cost_basis) / record.cost_basis * 100.0;

    if record.unrealized_pct > record.ath_unrealized_pct {
        record.ath_unrealized_pct = record.unrealized_pct;
    }

    if !record.armed && record.unrealized_pct <= STOP_LOSS_PCT {
        info!(
            asset = %record.asset,
            unrealized_pct = format!("{:.2}", record.unrealized_pct),
            "stop-loss level reached"
        );
        return ExitAction::Sell(ExitReason::StopLoss);
    }

    if !record.armed && record.unrealized_pct >= ARM_THRESHOLD_PCT {
        record.armed = true;
        info!(
            asset = %record.asset,
            unrealized_pct = format!("{:.2}", record.unrealized_pct),
            "position armed for trailing exit"
        );
    }

    if record.armed
        && record.ath_unrealized_pct - record.unrealized_pct >= TRAILING_DROP_PCT
    {
        info!(
            asset = %record.asset,
            unrealized_pct = format!("{:.2}", record.unrealized_pct),
            ath_unrealized_pct = format!("{:.2}", record.ath_unrealized_pct),
            "trailing retracement level reached"
        );
        return ExitAction::Sell(ExitReason::TrailingTakeProfit);
    }

    debug!(
        asset = %record.asset,
        price = observed_price,
        unrealized_pct = format!("{:.2}", record.unrealized_pct),
        ath_unrealized_pct = format!("{:.2}", record.ath_unrealized_pct),
        armed = record.armed,
        "position evaluated"
    );

    ExitAction::Hold
}

// =============================================================================
// Tests
// =============================================================================
