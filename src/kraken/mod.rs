// =============================================================================
// Kraken REST API module
// =============================================================================

pub mod client;
