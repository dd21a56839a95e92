// =============================================================================
// Core types — tracked position records and per-cycle holdings
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status & exit reasons
// ---------------------------------------------------------------------------

/// Lifecycle status of a tracked position record.
///
/// `Closed` and `ClosedExternal` are terminal: such a record is never mutated
/// again, only superseded by a brand-new record if the asset reappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Closed,
    ClosedExternal,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Closed => write!(f, "CLOSED"),
            Self::ClosedExternal => write!(f, "CLOSED_EXTERNAL"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CLOSED" => Ok(Self::Closed),
            "CLOSED_EXTERNAL" => Ok(Self::ClosedExternal),
            other => Err(format!("unknown position status '{other}'")),
        }
    }
}

/// Why a sell was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TrailingTakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TrailingTakeProfit => write!(f, "TRAILING_TAKE_PROFIT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Position record
// ---------------------------------------------------------------------------

/// One row of the tracking table, keyed by asset display-name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Display-name (venue altname), the table key.
    pub asset: String,
    /// Venue internal asset code.
    pub asset_code: String,
    /// Trading pair the position is priced and sold against.
    pub pair: String,
    /// Open quantity in asset units.
    pub position_size: f64,
    /// Price the position is measured against.
    pub cost_basis: f64,
    #[serde(default)]
    pub current_price: f64,
    /// Signed gain/loss percent vs. cost basis; meaningful only while ACTIVE.
    #[serde(default)]
    pub unrealized_pct: f64,
    /// High-water mark of `unrealized_pct`; non-decreasing while ACTIVE.
    #[serde(default)]
    pub ath_unrealized_pct: f64,
    /// Sticky flag: once the arm threshold is reached this never resets.
    #[serde(default)]
    pub armed: bool,
    pub status: PositionStatus,
    /// Set once, at close.
    #[serde(default)]
    pub realized_pct: Option<f64>,
    /// RFC 3339 UTC timestamp of the last mutation.
    pub last_updated: String,
}

impl PositionRecord {
    /// Start a fresh tracking campaign for an asset first seen at `price`.
    pub fn open(
        asset: &str,
        asset_code: &str,
        pair: &str,
        position_size: f64,
        price: f64,
    ) -> Self {
        Self {
            asset: asset.to_string(),
            asset_code: asset_code.to_string(),
            pair: pair.to_string(),
            position_size,
            cost_basis: price,
            current_price: price,
            unrealized_pct: 0.0,
            ath_unrealized_pct: 0.0,
            armed: false,
            status: PositionStatus::Active,
            realized_pct: None,
            last_updated: Utc::now().to_rfc3339(),
        }
    }

    /// Refresh `last_updated` to now.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now().to_rfc3339();
    }
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

/// A spot holding observed in one polling cycle, after eligibility filtering.
#[derive(Debug, Clone)]
pub struct Holding {
    pub asset_code: String,
    pub altname: String,
    pub pair: String,
    pub quantity: f64,
}
