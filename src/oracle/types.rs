//! Wire types for the HTTP quote feed.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Quote response from `GET /quote?symbol=`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub change: Decimal,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}
