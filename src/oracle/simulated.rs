//! Simulated market feed with a fixed price catalogue and random drift.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::{TerminalError, TerminalResult};

use super::{PriceOracle, Quote};

/// Price used for symbols outside the catalogue.
const FALLBACK_PRICE: Decimal = dec!(100.00);

/// Maximum drift either side of the base price (0.5%).
const MAX_DRIFT: f64 = 0.005;

fn catalogue() -> BTreeMap<String, Decimal> {
    [
        ("AAPL", dec!(185.92)),
        ("MSFT", dec!(415.10)),
        ("TSLA", dec!(175.40)),
        ("BTC-USD", dec!(64230.50)),
        ("ETH-USD", dec!(3450.20)),
        ("NVDA", dec!(875.30)),
        ("EUR/USD", dec!(1.0845)),
        ("GBP/USD", dec!(1.2630)),
        ("USD/JPY", dec!(151.40)),
        ("AUD/USD", dec!(0.6520)),
        ("USD/CHF", dec!(0.9010)),
    ]
    .into_iter()
    .map(|(s, p)| (s.to_string(), p))
    .collect()
}

/// Mock oracle: base price per symbol with up to ±0.5% drift per call.
///
/// Prices are rounded to two decimals, so FX pairs move in coarse steps.
pub struct SimulatedOracle {
    base_prices: BTreeMap<String, Decimal>,
    rng: Mutex<StdRng>,
    latency: Duration,
}

impl SimulatedOracle {
    pub fn new(latency: Duration) -> Self {
        Self {
            base_prices: catalogue(),
            rng: Mutex::new(StdRng::from_os_rng()),
            latency,
        }
    }

    /// Reproducible drift sequence, no latency.
    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            base_prices: catalogue(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            latency: Duration::ZERO,
        }
    }

    /// Symbols with a catalogued base price.
    pub fn symbols(&self) -> Vec<String> {
        self.base_prices.keys().cloned().collect()
    }

    pub fn base_price(&self, symbol: &str) -> Decimal {
        self.base_prices
            .get(symbol)
            .copied()
            .unwrap_or(FALLBACK_PRICE)
    }

    fn next_drift(&self) -> TerminalResult<Decimal> {
        let drift = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| TerminalError::oracle("*", "drift generator poisoned"))?;
            rng.random_range(-MAX_DRIFT..MAX_DRIFT)
        };
        Decimal::try_from(drift).map_err(|e| TerminalError::oracle("*", e))
    }
}

#[async_trait]
impl PriceOracle for SimulatedOracle {
    async fn fetch_price(&self, symbol: &str) -> TerminalResult<Quote> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let drift = self.next_drift()?;
        let base = self.base_price(symbol);
        let price = (base * (Decimal::ONE + drift)).round_dp(2);
        let change = (drift * Decimal::ONE_HUNDRED).round_dp(2);

        debug!(symbol = %symbol, price = %price, change = %change, "Simulated quote");

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change,
            timestamp: Utc::now(),
        })
    }
}
