// =============================================================================
// Kraken REST API Client — HMAC-SHA512 signed private requests
// =============================================================================
//
// SECURITY: the API secret is never logged or serialized. Private calls carry
// API-Key and API-Sign headers; the nonce is a millisecond timestamp.
//
// Every response arrives in Kraken's envelope `{ "error": [...], "result": … }`.
// A non-empty error array is a failure regardless of HTTP status and is
// surfaced with the venue's own messages.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info, instrument};

use crate::error::BotError;
use crate::gateway::ExchangeGateway;

type HmacSha512 = Hmac<Sha512>;

/// Kraken REST API client with HMAC-SHA512 request signing.
#[derive(Clone)]
pub struct KrakenClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl KrakenClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `KrakenClient`.
    ///
    /// # Arguments
    /// * `api_key` — Kraken API key (sent as a header).
    /// * `secret`  — base64-encoded Kraken private key, used only for signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("KrakenClient initialised (base_url=https://api.kraken.com)");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: "https://api.kraken.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Current UNIX timestamp in milliseconds, used as the request nonce.
    fn nonce_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Produce the API-Sign header value for a private request:
    /// `base64(HMAC-SHA512(base64_decode(secret), path + SHA256(nonce + postdata)))`.
    fn sign(&self, path: &str, nonce: u64, postdata: &str) -> Result<String, BotError> {
        let key = BASE64.decode(&self.secret).map_err(|e| {
            BotError::Configuration(format!("API secret is not valid base64: {e}"))
        })?;

        let mut sha = Sha256::new();
        sha.update(nonce.to_string().as_bytes());
        sha.update(postdata.as_bytes());
        let digest = sha.finalize();

        let mut mac =
            HmacSha512::new_from_slice(&key).expect("HMAC accepts any key size");
        mac.update(path.as_bytes());
        mac.update(&digest);

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn public_get(
        &self,
        path: &str,
        query: Option<&str>,
    ) -> Result<serde_json::Value, BotError> {
        let url = match query {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        };

        let resp = self.client.get(&url).send().await?;
        let body: serde_json::Value = resp.json().await?;
        Self::take_result(path, body)
    }

    async fn private_post(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, BotError> {
        let nonce = Self::nonce_ms();

        let mut postdata = format!("nonce={nonce}");
        for (key, value) in params {
            postdata.push_str(&format!("&{key}={value}"));
        }

        let signature = self.sign(path, nonce, &postdata)?;

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await?;

        let body: serde_json::Value = resp.json().await?;
        Self::take_result(path, body)
    }

    /// Unwrap Kraken's response envelope, surfacing the venue `error` array.
    fn take_result(
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BotError> {
        if let Some(errors) = body.get("error").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let messages: Vec<&str> =
                    errors.iter().filter_map(|e| e.as_str()).collect();
                return Err(BotError::Gateway(format!(
                    "{path} returned errors: {}",
                    messages.join("; ")
                )));
            }
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| BotError::Gateway(format!("{path} response missing 'result'")))
    }

    // -------------------------------------------------------------------------
    // Endpoints
    // -------------------------------------------------------------------------

    /// GET /0/public/Assets — venue asset directory (internal code → altname).
    #[instrument(skip(self), name = "kraken::get_assets")]
    pub async fn get_assets(&self) -> Result<HashMap<String, String>, BotError> {
        let result = self.public_get("/0/public/Assets", None).await?;

        let entries = result
            .as_object()
            .ok_or_else(|| BotError::Gateway("Assets result is not an object".to_string()))?;

        let mut directory = HashMap::with_capacity(entries.len());
        for (code, info) in entries {
            if let Some(altname) = info.get("altname").and_then(|v| v.as_str()) {
                directory.insert(code.clone(), altname.to_string());
            }
        }

        debug!(count = directory.len(), "asset directory fetched");
        Ok(directory)
    }

    /// POST /0/private/BalanceEx (signed) — balances per asset code.
    ///
    /// The extended endpoint also reports amounts on hold; only the total
    /// balance is consumed here.
    #[instrument(skip(self), name = "kraken::get_balances")]
    pub async fn get_balances(&self) -> Result<HashMap<String, f64>, BotError> {
        let result = self.private_post("/0/private/BalanceEx", &[]).await?;

        let entries = result.as_object().ok_or_else(|| {
            BotError::Gateway("BalanceEx result is not an object".to_string())
        })?;

        let mut balances = HashMap::with_capacity(entries.len());
        for (code, entry) in entries {
            let raw = entry
                .get("balance")
                .ok_or_else(|| {
                    BotError::Gateway(format!("BalanceEx entry for {code} missing 'balance'"))
                })?;
            balances.insert(code.clone(), Self::parse_str_f64(raw)?);
        }

        debug!(count = balances.len(), "balances fetched");
        Ok(balances)
    }

    /// GET /0/public/Ticker — last trade price (`c[0]`) for `pair`.
    #[instrument(skip(self), name = "kraken::get_last_price")]
    pub async fn get_last_price(&self, pair: &str) -> Result<f64, BotError> {
        let result = self
            .public_get("/0/public/Ticker", Some(&format!("pair={pair}")))
            .await?;

        // The result is keyed by the venue's normalized pair name, which may
        // differ from the requested one; take the first entry.
        let entry = result
            .as_object()
            .and_then(|o| o.values().next())
            .ok_or_else(|| BotError::Gateway(format!("Ticker returned no entry for {pair}")))?;

        let last = entry
            .get("c")
            .and_then(|c| c.get(0))
            .ok_or_else(|| {
                BotError::Gateway(format!("Ticker entry for {pair} missing last trade"))
            })?;

        let price = Self::parse_str_f64(last)?;
        debug!(pair, price, "last trade price fetched");
        Ok(price)
    }

    /// POST /0/private/AddOrder (signed) — full-size reduce-only market sell.
    #[instrument(skip(self), name = "kraken::add_market_sell")]
    pub async fn add_market_sell(&self, pair: &str, volume: f64) -> Result<String, BotError> {
        let params = [
            ("pair", pair.to_string()),
            ("type", "sell".to_string()),
            ("ordertype", "market".to_string()),
            ("volume", volume.to_string()),
            ("reduce_only", "true".to_string()),
        ];

        let result = self.private_post("/0/private/AddOrder", &params).await?;

        let txid = result
            .get("txid")
            .and_then(|t| t.get(0))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        info!(pair, volume, txid = %txid, "market sell order accepted by venue");
        Ok(txid)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64, BotError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| BotError::Gateway(format!("failed to parse '{s}' as f64")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(BotError::Gateway(format!("expected string or number, got: {val}")))
        }
    }
}

impl ExchangeGateway for KrakenClient {
    async fn balances(&self) -> Result<HashMap<String, f64>, BotError> {
        self.get_balances().await
    }

    async fn asset_directory(&self) -> Result<HashMap<String, String>, BotError> {
        self.get_assets().await
    }

    async fn last_price(&self, pair: &str) -> Result<f64, BotError> {
        self.get_last_price(pair).await
    }

    async fn market_sell(&self, pair: &str, volume: f64) -> Result<String, BotError> {
        self.add_market_sell(pair, volume).await
    }
}

impl std::fmt::Debug for KrakenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
