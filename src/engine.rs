// =============================================================================
// Reconciliation Engine — one polling cycle over live balances
// =============================================================================
//
// SAFETY POLICY: triggered sells use at-least-once semantics. When a sell
// submission fails the record keeps its armed flag and ATH updates but stays
// ACTIVE, so the same trigger fires again on the next cycle. A triggered exit
// is never silently dropped.
//
// Failure isolation: a problem pricing or persisting one asset never aborts
// the rest of the cycle; only a failed balance fetch does.
// =============================================================================

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::error::BotError;
use crate::executor::OrderExecutor;
use crate::gateway::ExchangeGateway;
use crate::state_machine::{self, ExitAction};
use crate::store::TrackingStore;
use crate::types::{Holding, PositionRecord, PositionStatus};

/// Asset codes never tracked besides the configured base currency: fiat quote
/// forms and the fee-accrual token.
const EXCLUDED_ASSETS: [&str; 5] = ["ZUSD", "USD", "ZEUR", "EUR", "KFEE"];

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

/// Summary of a single reconciliation cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    /// Eligible holdings observed this cycle.
    pub holdings_seen: u32,
    /// Sells submitted (or suppressed in dry-run) and applied.
    pub sells_triggered: u32,
    /// Sells that the venue rejected; retried next cycle.
    pub sells_failed: u32,
    /// Assets skipped because their price could not be resolved.
    pub assets_skipped: u32,
    /// ACTIVE records whose asset vanished from balances.
    pub externally_closed: u32,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives the per-asset state machine once per poll against live balances and
/// the persisted tracking table. The engine is the sole writer to the store.
pub struct ReconciliationEngine<G, S> {
    pub gateway: G,
    pub store: S,
    pub executor: OrderExecutor,
    base_currency: String,
    asset_directory: Option<HashMap<String, String>>,
}

impl<G: ExchangeGateway, S: TrackingStore> ReconciliationEngine<G, S> {
    pub fn new(
        gateway: G,
        store: S,
        executor: OrderExecutor,
        base_currency: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            store,
            executor,
            base_currency: base_currency.into(),
            asset_directory: None,
        }
    }

    /// Run one full cycle: fetch balances, evaluate every eligible holding,
    /// execute triggered sells, then sweep records for positions that were
    /// closed outside the bot.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, BotError> {
        info!("reconciliation cycle started");
        let mut summary = CycleSummary::default();

        let balances = self.gateway.balances().await?;
        self.ensure_directory().await?;

        let holdings = self.eligible_holdings(&balances);
        summary.holdings_seen = holdings.len() as u32;

        let mut present: HashSet<String> = HashSet::with_capacity(holdings.len());
        for holding in &holdings {
            // Mark presence before processing so a pricing failure does not
            // get the asset swept as externally closed below.
            present.insert(holding.altname.clone());

            if let Err(e) = self.process_holding(holding, &mut summary).await {
                warn!(
                    asset = %holding.altname,
                    error = %e,
                    "asset skipped this cycle"
                );
                summary.assets_skipped += 1;
            }
        }

        self.sweep_departed(&present, &mut summary);

        info!(
            holdings = summary.holdings_seen,
            sells = summary.sells_triggered,
            sell_failures = summary.sells_failed,
            skipped = summary.assets_skipped,
            external_closes = summary.externally_closed,
            "reconciliation cycle completed"
        );
        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // Asset directory
    // -------------------------------------------------------------------------

    /// Fetch the asset code → display-name directory once and keep it for the
    /// process lifetime.
    async fn ensure_directory(&mut self) -> Result<(), BotError> {
        if self.asset_directory.is_none() {
            let directory = self.gateway.asset_directory().await?;
            info!(assets = directory.len(), "asset directory cached");
            self.asset_directory = Some(directory);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Eligibility filter
    // -------------------------------------------------------------------------

    /// Filter raw balances down to sellable holdings: positive quantity, not
    /// the base currency, not a fiat quote form, not the fee token.
    fn eligible_holdings(&self, balances: &HashMap<String, f64>) -> Vec<Holding> {
        let empty = HashMap::new();
        let directory = self.asset_directory.as_ref().unwrap_or(&empty);

        let mut holdings = Vec::new();
        for (code, &quantity) in balances {
            if quantity <= 0.0 {
                continue;
            }
            if EXCLUDED_ASSETS.contains(&code.as_str()) {
                continue;
            }

            let altname = directory.get(code).cloned().unwrap_or_else(|| code.clone());
            if altname.eq_ignore_ascii_case(&self.base_currency) {
                continue;
            }

            let pair = format!("{}{}", altname, self.base_currency);
            holdings.push(Holding {
                asset_code: code.clone(),
                altname,
                pair,
                quantity,
            });
        }

        // Balance maps have no stable order; sort so cycles are deterministic.
        holdings.sort_by(|a, b| a.altname.cmp(&b.altname));
        holdings
    }

    // -------------------------------------------------------------------------
    // Per-asset processing
    // -------------------------------------------------------------------------

    async fn process_holding(
        &mut self,
        holding: &Holding,
        summary: &mut CycleSummary,
    ) -> Result<(), BotError> {
        let price = self.gateway.last_price(&holding.pair).await?;
        if price <= 0.0 {
            return Err(BotError::Gateway(format!(
                "non-positive price {price} for {}",
                holding.pair
            )));
        }

        let mut record = match self.store.get(&holding.altname) {
            Some(existing) if existing.status == PositionStatus::Active => {
                let mut rec = existing;
                rec.position_size = holding.quantity;
                rec
            }
            // No open record: a closed row is superseded, a new asset starts
            // its campaign at the first observed price.
            _ => {
                info!(
                    asset = %holding.altname,
                    pair = %holding.pair,
                    position_size = holding.quantity,
                    cost_basis = price,
                    "tracking new position"
                );
                PositionRecord::open(
                    &holding.altname,
                    &holding.asset_code,
                    &holding.pair,
                    holding.quantity,
                    price,
                )
            }
        };

        let action = state_machine::evaluate(&mut record, price);

        if let ExitAction::Sell(reason) = action {
            match self.executor.sell(&self.gateway, &record, reason).await {
                Ok(outcome) if outcome.submitted => {
                    record.status = PositionStatus::Closed;
                    record.realized_pct = Some(record.unrealized_pct);
                    summary.sells_triggered += 1;
                    info!(
                        asset = %record.asset,
                        reason = %reason,
                        realized_pct = format!("{:.2}", record.unrealized_pct),
                        order_id = ?outcome.order_id,
                        "position closed"
                    );
                }
                Ok(_) => {
                    summary.sells_failed += 1;
                    warn!(
                        asset = %record.asset,
                        reason = %reason,
                        "sell not submitted, will retry next cycle"
                    );
                }
                Err(e) => {
                    // Armed flag and ATH updates are still persisted below so
                    // the identical trigger re-fires next cycle.
                    summary.sells_failed += 1;
                    warn!(
                        asset = %record.asset,
                        reason = %reason,
                        error = %e,
                        "sell failed, will retry next cycle"
                    );
                }
            }
        }

        record.touch();
        if let Err(e) = self.store.upsert(record) {
            warn!(
                asset = %holding.altname,
                error = %e,
                "failed to persist record, state will be recomputed next cycle"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // External-close sweep
    // -------------------------------------------------------------------------

    /// Close out ACTIVE records whose asset no longer appears in balances.
    /// Cost basis and the ATH stay behind as the historical record.
    fn sweep_departed(&mut self, present: &HashSet<String>, summary: &mut CycleSummary) {
        let departed: Vec<PositionRecord> = self
            .store
            .scan()
            .into_iter()
            .filter(|r| r.status == PositionStatus::Active && !present.contains(&r.asset))
            .collect();

        for mut record in departed {
            record.status = PositionStatus::ClosedExternal;
            record.position_size = 0.0;
            record.unrealized_pct = 0.0;
            record.touch();

            info!(
                asset = %record.asset,
                cost_basis = record.cost_basis,
                ath_unrealized_pct = format!("{:.2}", record.ath_unrealized_pct),
                "position closed externally"
            );

            let asset = record.asset.clone();
            if let Err(e) = self.store.upsert(record) {
                warn!(asset = %asset, error = %e, "failed to persist external close");
            }
            summary.externally_closed += 1;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    // ── Mock gateway ─────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockInner {
        balances: RefCell<HashMap<String, f64>>,
        directory: RefCell<HashMap<String, String>>,
        prices: RefCell<HashMap<String, Vec<f64>>>,
        fail_balances: Cell<bool>,
        fail_sell: Cell<bool>,
        sells: RefCell<Vec<(String, f64)>>,
    }

    #[derive(Clone, Default)]
    struct MockGateway {
        inner: Rc<MockInner>,
    }

    impl MockGateway {
        fn set_balance(&self, code: &str, quantity: f64) {
            self.inner
                .balances
                .borrow_mut()
                .insert(code.to_string(), quantity);
        }

        fn clear_balances(&self) {
            self.inner.balances.borrow_mut().clear();
        }

        fn set_altname(&self, code: &str, altname: &str) {
            self.inner
                .directory
                .borrow_mut()
                .insert(code.to_string(), altname.to_string());
        }

        /// Queue a price series for a pair; the last price repeats forever.
        fn set_prices(&self, pair: &str, series: &[f64]) {
            self.inner
                .prices
                .borrow_mut()
                .insert(pair.to_string(), series.to_vec());
        }

        fn drop_prices(&self, pair: &str) {
            self.inner.prices.borrow_mut().remove(pair);
        }

        fn sells(&self) -> Vec<(String, f64)> {
            self.inner.sells.borrow().clone()
        }
    }

    impl ExchangeGateway for MockGateway {
        async fn balances(&self) -> Result<HashMap<String, f64>, BotError> {
            if self.inner.fail_balances.get() {
                return Err(BotError::Gateway("connection refused".to_string()));
            }
            Ok(self.inner.balances.borrow().clone())
        }

        async fn asset_directory(&self) -> Result<HashMap<String, String>, BotError> {
            Ok(self.inner.directory.borrow().clone())
        }

        async fn last_price(&self, pair: &str) -> Result<f64, BotError> {
            let mut prices = self.inner.prices.borrow_mut();
            let series = prices
                .get_mut(pair)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| BotError::Gateway(format!("no price for {pair}")))?;
            if series.len() > 1 {
                Ok(series.remove(0))
            } else {
                Ok(series[0])
            }
        }

        async fn market_sell(&self, pair: &str, volume: f64) -> Result<String, BotError> {
            if self.inner.fail_sell.get() {
                return Err(BotError::Gateway("EOrder:Insufficient funds".to_string()));
            }
            self.inner
                .sells
                .borrow_mut()
                .push((pair.to_string(), volume));
            Ok("OQCLML-BW3P3-BUCMWZ".to_string())
        }
    }

    // ── In-memory store ──────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct MemStore {
        records: Rc<RefCell<Vec<PositionRecord>>>,
        fail_upsert: Rc<Cell<bool>>,
    }

    impl TrackingStore for MemStore {
        fn get(&self, asset: &str) -> Option<PositionRecord> {
            self.records
                .borrow()
                .iter()
                .find(|r| r.asset == asset)
                .cloned()
        }

        fn upsert(&mut self, record: PositionRecord) -> Result<(), BotError> {
            if self.fail_upsert.get() {
                return Err(BotError::Persistence("disk full".to_string()));
            }
            let mut records = self.records.borrow_mut();
            match records.iter_mut().find(|r| r.asset == record.asset) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
            Ok(())
        }

        fn scan(&self) -> Vec<PositionRecord> {
            self.records.borrow().clone()
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn engine_with_btc(
        dry_run: bool,
    ) -> (ReconciliationEngine<MockGateway, MemStore>, MockGateway, MemStore) {
        let gateway = MockGateway::default();
        gateway.set_balance("XXBT", 0.5);
        gateway.set_altname("XXBT", "XBT");

        let store = MemStore::default();
        let engine = ReconciliationEngine::new(
            gateway.clone(),
            store.clone(),
            OrderExecutor::new(dry_run),
            "USD",
        );
        (engine, gateway, store)
    }

    // ── Cases ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ineligible_balances_are_filtered() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_balance("ZUSD", 1_000.0);
        gateway.set_balance("KFEE", 25.0);
        gateway.set_balance("DOT", 0.0);
        gateway.set_altname("ZUSD", "USD");
        gateway.set_altname("KFEE", "FEE");
        gateway.set_altname("DOT", "DOT");
        gateway.set_prices("XBTUSD", &[100.0]);

        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.holdings_seen, 1);
        assert_eq!(store.scan().len(), 1);
        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::Active);
        assert!((rec.cost_basis - 100.0).abs() < 1e-9);
        assert!((rec.position_size - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trailing_campaign_closes_with_realized_gain() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0, 105.0, 110.0, 106.0]);

        engine.run_cycle().await.unwrap(); // cost basis set at 100
        engine.run_cycle().await.unwrap(); // 105 arms
        assert!(store.get("XBT").unwrap().armed);

        engine.run_cycle().await.unwrap(); // 110 ratchets the ATH
        assert!((store.get("XBT").unwrap().ath_unrealized_pct - 10.0).abs() < 1e-9);

        let summary = engine.run_cycle().await.unwrap(); // 106 retraces 4 points
        assert_eq!(summary.sells_triggered, 1);

        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::Closed);
        assert!((rec.realized_pct.unwrap() - 6.0).abs() < 1e-9);
        assert!((rec.ath_unrealized_pct - 10.0).abs() < 1e-9);
        assert_eq!(engine.gateway.sells(), vec![("XBTUSD".to_string(), 0.5)]);
    }

    #[tokio::test]
    async fn stop_loss_closes_unarmed_position() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0, 97.0]);

        engine.run_cycle().await.unwrap();
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.sells_triggered, 1);
        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::Closed);
        assert!((rec.realized_pct.unwrap() - -3.0).abs() < 1e-9);
        assert!(!rec.armed);
    }

    #[tokio::test]
    async fn departed_asset_closes_externally() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0, 104.0]);

        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();
        assert!((store.get("XBT").unwrap().ath_unrealized_pct - 4.0).abs() < 1e-9);

        gateway.clear_balances();
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.externally_closed, 1);
        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::ClosedExternal);
        assert_eq!(rec.position_size, 0.0);
        assert_eq!(rec.unrealized_pct, 0.0);
        assert!((rec.cost_basis - 100.0).abs() < 1e-9);
        assert!((rec.ath_unrealized_pct - 4.0).abs() < 1e-9);
        assert!(rec.realized_pct.is_none());
    }

    #[tokio::test]
    async fn failed_sell_keeps_record_active_and_retries() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0, 105.0, 110.0, 106.0]);
        gateway.inner.fail_sell.set(true);

        for _ in 0..3 {
            engine.run_cycle().await.unwrap();
        }
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.sells_failed, 1);
        assert_eq!(summary.sells_triggered, 0);
        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::Active);
        assert!(rec.armed);
        assert!((rec.ath_unrealized_pct - 10.0).abs() < 1e-9);

        // Venue recovers; the identical inputs reproduce the trigger.
        gateway.inner.fail_sell.set(false);
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.sells_triggered, 1);
        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::Closed);
        assert!((rec.realized_pct.unwrap() - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn balance_failure_aborts_cycle() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0]);
        gateway.inner.fail_balances.set(true);

        assert!(engine.run_cycle().await.is_err());
        assert!(store.scan().is_empty());
    }

    #[tokio::test]
    async fn price_failure_skips_only_that_asset() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_balance("SOL", 10.0);
        gateway.set_altname("SOL", "SOL");
        gateway.set_prices("XBTUSD", &[100.0]);
        gateway.set_prices("SOLUSD", &[150.0]);

        engine.run_cycle().await.unwrap();
        assert_eq!(store.scan().len(), 2);

        // Pricing breaks for one pair: that asset is skipped, not swept.
        gateway.drop_prices("XBTUSD");
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.assets_skipped, 1);
        assert_eq!(summary.externally_closed, 0);
        assert_eq!(store.get("XBT").unwrap().status, PositionStatus::Active);
        assert_eq!(store.get("SOL").unwrap().status, PositionStatus::Active);
    }

    #[tokio::test]
    async fn dry_run_applies_close_without_contacting_venue() {
        let (mut engine, gateway, store) = engine_with_btc(true);
        gateway.set_prices("XBTUSD", &[100.0, 97.0]);

        engine.run_cycle().await.unwrap();
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.sells_triggered, 1);
        assert_eq!(store.get("XBT").unwrap().status, PositionStatus::Closed);
        assert!(engine.gateway.sells().is_empty());
    }

    #[tokio::test]
    async fn unchanged_inputs_are_idempotent() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0, 103.0]);

        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();
        let before = store.get("XBT").unwrap();

        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.sells_triggered, 0);
        let after = store.get("XBT").unwrap();
        assert_eq!(after.unrealized_pct, before.unrealized_pct);
        assert_eq!(after.ath_unrealized_pct, before.ath_unrealized_pct);
        assert_eq!(after.armed, before.armed);
        assert_eq!(after.status, before.status);
        assert!(engine.gateway.sells().is_empty());
    }

    #[tokio::test]
    async fn reappearing_asset_opens_fresh_campaign() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0, 106.0]);

        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();

        gateway.clear_balances();
        engine.run_cycle().await.unwrap();
        assert_eq!(
            store.get("XBT").unwrap().status,
            PositionStatus::ClosedExternal
        );

        // The asset comes back later at a very different price level.
        gateway.set_balance("XXBT", 0.25);
        gateway.set_prices("XBTUSD", &[200.0]);
        engine.run_cycle().await.unwrap();

        let rec = store.get("XBT").unwrap();
        assert_eq!(rec.status, PositionStatus::Active);
        assert!((rec.cost_basis - 200.0).abs() < 1e-9);
        assert_eq!(rec.ath_unrealized_pct, 0.0);
        assert!(!rec.armed);
        assert!((rec.position_size - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn persistence_failure_is_tolerated() {
        let (mut engine, gateway, store) = engine_with_btc(false);
        gateway.set_prices("XBTUSD", &[100.0]);
        store.fail_upsert.set(true);

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.holdings_seen, 1);
        assert_eq!(summary.assets_skipped, 0);
        assert!(store.scan().is_empty());
    }
}
