//! Price oracle: current quotes for a symbol.
//!
//! The feed is a black box with no caching, ordering or snapshot guarantees.
//! Every call is bounded by [`TimedOracle`] and failures surface as
//! `OracleUnavailable`, aborting only the operation that asked.

mod http_client;
mod simulated;
mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{TerminalError, TerminalResult};

pub use http_client::HttpOracle;
pub use simulated::SimulatedOracle;

/// A single price observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    /// Percent change reported by the feed
    pub change: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Source of current prices. May be called concurrently for distinct symbols.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn fetch_price(&self, symbol: &str) -> TerminalResult<Quote>;
}

/// Bounds every call of the inner oracle by a timeout.
pub struct TimedOracle {
    inner: Arc<dyn PriceOracle>,
    timeout: Duration,
}

impl TimedOracle {
    pub fn new(inner: Arc<dyn PriceOracle>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl PriceOracle for TimedOracle {
    async fn fetch_price(&self, symbol: &str) -> TerminalResult<Quote> {
        match tokio::time::timeout(self.timeout, self.inner.fetch_price(symbol)).await {
            Ok(Ok(quote)) if quote.price > Decimal::ZERO => Ok(quote),
            Ok(Ok(quote)) => Err(TerminalError::oracle(
                symbol,
                format!("non-positive price {}", quote.price),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TerminalError::oracle(
                symbol,
                format!("timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }
}
