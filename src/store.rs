// =============================================================================
// Tracking store — durable per-asset position table
// =============================================================================
//
// One row per asset display-name. The CSV backend keeps the full table in
// memory and rewrites the file on every upsert via a tmp + rename, so a crash
// never leaves a torn file. A table with an unexpected header is reported but
// still processed; rows that fail to parse are skipped with a warning.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::BotError;
use crate::types::{PositionRecord, PositionStatus};

/// Column layout of the tracking table, in order.
pub const HEADER: [&str; 12] = [
    "Asset",
    "AssetCode",
    "Pair",
    "PositionSize",
    "CostBasis",
    "CurrentPrice",
    "UnrealizedPct",
    "ATHUnrealizedPct",
    "Armed",
    "Status",
    "RealizedPct",
    "LastUpdated",
];

/// Keyed table of position records: get by asset, upsert, full scan.
pub trait TrackingStore {
    fn get(&self, asset: &str) -> Option<PositionRecord>;
    fn upsert(&mut self, record: PositionRecord) -> Result<(), BotError>;
    fn scan(&self) -> Vec<PositionRecord>;
}

// ---------------------------------------------------------------------------
// CSV backend
// ---------------------------------------------------------------------------

pub struct CsvStore {
    path: PathBuf,
    records: Vec<PositionRecord>,
}

impl CsvStore {
    /// Open the table at `path`, creating it with the standard header when
    /// absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BotError> {
        let path = path.into();

        if !path.exists() {
            let store = Self {
                path,
                records: Vec::new(),
            };
            store.save()?;
            info!(path = %store.path.display(), "tracking table created");
            return Ok(store);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)?;

        let headers = reader.headers()?;
        if !headers.iter().eq(HEADER.iter().copied()) {
            warn!(
                path = %path.display(),
                found = ?headers,
                "tracking table header differs from the expected layout, continuing"
            );
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            match Self::parse_row(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping unparseable tracking row"),
            }
        }

        info!(
            path = %path.display(),
            rows = records.len(),
            "tracking table loaded"
        );

        Ok(Self { path, records })
    }

    /// Rewrite the whole table atomically (write to `.tmp`, then rename).
    fn save(&self) -> Result<(), BotError> {
        let tmp_path = self.path.with_extension("csv.tmp");

        {
            let mut writer = csv::Writer::from_path(&tmp_path)?;
            writer.write_record(HEADER)?;
            for record in &self.records {
                writer.write_record(&[
                    record.asset.clone(),
                    record.asset_code.clone(),
                    record.pair.clone(),
                    record.position_size.to_string(),
                    record.cost_basis.to_string(),
                    record.current_price.to_string(),
                    record.unrealized_pct.to_string(),
                    record.ath_unrealized_pct.to_string(),
                    record.armed.to_string(),
                    record.status.to_string(),
                    record
                        .realized_pct
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    record.last_updated.clone(),
                ])?;
            }
            writer.flush()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn parse_row(row: &csv::StringRecord) -> Result<PositionRecord, BotError> {
        let text = |idx: usize| row.get(idx).unwrap_or("").to_string();
        let number = |idx: usize| -> Result<f64, BotError> {
            let raw = row.get(idx).unwrap_or("");
            if raw.is_empty() {
                return Ok(0.0);
            }
            raw.parse().map_err(|_| {
                BotError::Persistence(format!("invalid numeric field '{raw}'"))
            })
        };

        let status: PositionStatus = row
            .get(9)
            .unwrap_or("")
            .parse()
            .map_err(BotError::Persistence)?;

        let realized_raw = row.get(10).unwrap_or("");
        let realized_pct = if realized_raw.is_empty() {
            None
        } else {
            Some(realized_raw.parse().map_err(|_| {
                BotError::Persistence(format!("invalid realized pct '{realized_raw}'"))
            })?)
        };

        Ok(PositionRecord {
            asset: text(0),
            asset_code: text(1),
            pair: text(2),
            position_size: number(3)?,
            cost_basis: number(4)?,
            current_price: number(5)?,
            unrealized_pct: number(6)?,
            ath_unrealized_pct: number(7)?,
            armed: row.get(8).unwrap_or("").eq_ignore_ascii_case("true"),
            status,
            realized_pct,
            last_updated: text(11),
        })
    }

}

impl TrackingStore for CsvStore {
    fn get(&self, asset: &str) -> Option<PositionRecord> {
        self.records.iter().find(|r| r.asset == asset).cloned()
    }

    fn upsert(&mut self, record: PositionRecord) -> Result<(), BotError> {
        match self.records.iter_mut().find(|r| r.asset == record.asset) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        self.save()
    }

    fn scan(&self) -> Vec<PositionRecord> {
        self.records.clone()
    }
}

impl std::fmt::Debug for CsvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvStore")
            .field("path", &self.path)
            .field("rows", &self.records.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
