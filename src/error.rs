// =============================================================================
// Error taxonomy
// =============================================================================
//
// Four failure classes, each with a fixed handling policy:
//   Configuration — fatal at startup, the poll loop never begins.
//   Gateway       — during the balance fetch the whole cycle aborts; during a
//                   single asset's price fetch only that asset is skipped.
//   Persistence   — logged and tolerated, the record is recomputed next cycle.
//   Execution     — the record stays active and the sell retries next cycle.
//
// None of these escalate to a crash after startup; every recovery path is
// bounded to "try again next poll interval".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("execution error: {0}")]
    Execution(String),
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        Self::Gateway(e.to_string())
    }
}

impl From<csv::Error> for BotError {
    fn from(e: csv::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for BotError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
