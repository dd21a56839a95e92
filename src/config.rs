// =============================================================================
// Bot configuration — environment-driven settings
// =============================================================================
//
// Thresholds for the exit rules live in `state_machine`; everything here is
// collaborator wiring (credentials, table path, base currency, pacing).

use crate::error::BotError;

const DEFAULT_BASE_CURRENCY: &str = "USD";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_TRACKING_FILE: &str = "positions.csv";

/// Flag values accepted as true, compared case-insensitively.
const TRUTHY: [&str; 5] = ["1", "true", "yes", "y", "on"];

/// Startup configuration, read once from the process environment.
#[derive(Clone)]
pub struct BotConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Path of the CSV tracking table.
    pub tracking_file: String,
    /// Currency positions are priced and sold against.
    pub base_currency: String,
    pub poll_interval_secs: u64,
    /// When set, sell decisions are logged but never submitted.
    pub dry_run: bool,
}

impl BotConfig {
    /// Load configuration from the environment.
    ///
    /// Balance reads are signed calls, so credentials are required even in
    /// dry-run mode; a missing credential is fatal at startup.
    pub fn from_env() -> Result<Self, BotError> {
        let api_key = std::env::var("KRAKEN_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("KRAKEN_API_SECRET").unwrap_or_default();

        if api_key.is_empty() || api_secret.is_empty() {
            return Err(BotError::Configuration(
                "KRAKEN_API_KEY and KRAKEN_API_SECRET must be set".to_string(),
            ));
        }

        let poll_interval_secs = match std::env::var("POLL_INTERVAL_SECONDS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BotError::Configuration(format!("invalid POLL_INTERVAL_SECONDS '{raw}'"))
            })?,
            Err(_) => DEFAULT_POLL_INTERVAL_SECS,
        };

        Ok(Self {
            api_key,
            api_secret,
            tracking_file: std::env::var("TRACKING_FILE")
                .unwrap_or_else(|_| DEFAULT_TRACKING_FILE.to_string()),
            base_currency: std::env::var("BASE_CURRENCY")
                .unwrap_or_else(|_| DEFAULT_BASE_CURRENCY.to_string()),
            poll_interval_secs,
            dry_run: parse_bool_flag(std::env::var("DRY_RUN").ok().as_deref()),
        })
    }
}

/// Map an environment flag to a boolean.
///
/// Accepts `1 / true / yes / y / on` in any case as true; anything else,
/// including an unset variable, is false.
pub fn parse_bool_flag(raw: Option<&str>) -> bool {
    match raw {
        Some(value) => TRUTHY.contains(&value.trim().to_ascii_lowercase().as_str()),
        None => false,
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("tracking_file", &self.tracking_file)
            .field("base_currency", &self.base_currency)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}
