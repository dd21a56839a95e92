// =============================================================================
// Kraken Sentinel — Main Entry Point
// =============================================================================
//
// Wires the Kraken gateway, the CSV tracking store and the reconciliation
// engine together, then drives one cycle per poll interval until Ctrl+C.
// A failed cycle is logged and retried at the next tick; only configuration
// errors at startup are fatal.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod engine;
mod error;
mod executor;
mod gateway;
mod kraken;
mod state_machine;
mod store;
mod types;

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;
use crate::engine::ReconciliationEngine;
use crate::executor::OrderExecutor;
use crate::kraken::client::KrakenClient;
use crate::store::CsvStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Kraken Sentinel — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match BotConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration, refusing to start");
            return Err(e.into());
        }
    };

    info!(
        tracking_file = %config.tracking_file,
        base_currency = %config.base_currency,
        poll_interval_secs = config.poll_interval_secs,
        dry_run = config.dry_run,
        "configuration loaded"
    );
    if config.dry_run {
        warn!("DRY RUN mode active, sell orders will be logged but not sent");
    }

    // ── 2. Build the gateway, store and engine ───────────────────────────
    let gateway = KrakenClient::new(config.api_key.clone(), config.api_secret.clone());
    let store = CsvStore::open(&config.tracking_file)?;
    let executor = OrderExecutor::new(config.dry_run);

    let mut engine = ReconciliationEngine::new(
        gateway,
        store,
        executor,
        config.base_currency.clone(),
    );

    // ── 3. Poll loop with graceful shutdown ──────────────────────────────
    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

    info!("monitor running, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.run_cycle().await {
                    warn!(error = %e, "cycle aborted, retrying at next interval");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received, stopping");
                break;
            }
        }
    }

    info!("Kraken Sentinel shut down complete.");
    Ok(())
}
