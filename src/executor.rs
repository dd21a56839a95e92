// =============================================================================
// Order Executor — dry-run aware market sell submission
// =============================================================================
//
// Sells the record's full position size through the gateway, or suppresses
// the call entirely in dry-run mode. No retry lives here: a failed sell is
// retried implicitly when the next poll cycle re-evaluates the still-active
// record.

use tracing::{info, warn};

use crate::error::BotError;
use crate::gateway::{ExchangeGateway, SellOutcome};
use crate::types::{ExitReason, PositionRecord};

pub struct OrderExecutor {
    dry_run: bool,
}

impl OrderExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// Submit a reduce-only market sell for the record's full position size.
    ///
    /// In **dry-run mode** no request reaches the venue; the outcome still
    /// reports `submitted = true` so the caller applies the same state
    /// transition. The suppression is visible only in the log line.
    pub async fn sell<G: ExchangeGateway>(
        &self,
        gateway: &G,
        record: &PositionRecord,
        reason: ExitReason,
    ) -> Result<SellOutcome, BotError> {
        if self.dry_run {
            info!(
                asset = %record.asset,
                pair = %record.pair,
                volume = record.position_size,
                reason = %reason,
                "DRY RUN — sell suppressed, no order sent"
            );
            return Ok(SellOutcome {
                submitted: true,
                order_id: None,
            });
        }

        match gateway.market_sell(&record.pair, record.position_size).await {
            Ok(txid) => {
                info!(
                    asset = %record.asset,
                    pair = %record.pair,
                    volume = record.position_size,
                    reason = %reason,
                    order_id = %txid,
                    "market sell submitted"
                );
                Ok(SellOutcome {
                    submitted: true,
                    order_id: if txid.is_empty() { None } else { Some(txid) },
                })
            }
            Err(e) => {
                warn!(
                    asset = %record.asset,
                    pair = %record.pair,
                    reason = %reason,
                    error = %e,
                    "market sell failed"
                );
                Err(BotError::Execution(format!(
                    "sell {} failed: {e}",
                    record.pair
                )))
            }
        }
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("dry_run", &self.dry_run)
            .finish()
    }
}
