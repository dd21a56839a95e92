// =============================================================================
// Exchange gateway contract
// =============================================================================
//
// The reconciliation engine depends only on this trait; the Kraken REST
// client is one implementation, test doubles are another.

use std::collections::HashMap;

use crate::error::BotError;

/// Outcome of a sell submission.
#[derive(Debug, Clone)]
pub struct SellOutcome {
    /// True when the state transition may be applied (including dry-run).
    pub submitted: bool,
    /// Venue transaction id, absent in dry-run.
    pub order_id: Option<String>,
}

/// Venue operations consumed per cycle.
///
/// Implementations surface venue-reported failures as `BotError::Gateway`.
pub trait ExchangeGateway {
    /// Spot balances keyed by venue asset code.
    async fn balances(&self) -> Result<HashMap<String, f64>, BotError>;

    /// Venue asset code to display-name (altname) directory.
    async fn asset_directory(&self) -> Result<HashMap<String, String>, BotError>;

    /// Last trade price for a pair.
    async fn last_price(&self, pair: &str) -> Result<f64, BotError>;

    /// Submit a reduce-only market sell; returns the venue transaction id.
    async fn market_sell(&self, pair: &str, volume: f64) -> Result<String, BotError>;
}
