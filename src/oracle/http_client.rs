//! HTTP quote feed client.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::{TerminalError, TerminalResult};

use super::types::QuoteResponse;
use super::{PriceOracle, Quote};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a JSON quote endpoint (read-only).
pub struct HttpOracle {
    client: Client,
    base_url: String,
    max_retry_elapsed: Duration,
}

impl HttpOracle {
    /// Create a client for `base_url`; retries stop after `max_retry_elapsed`.
    pub fn new(base_url: impl Into<String>, max_retry_elapsed: Duration) -> TerminalResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT.min(max_retry_elapsed))
            .build()
            .map_err(|e| TerminalError::oracle("*", format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retry_elapsed,
        })
    }

    async fn fetch_once(&self, symbol: &str) -> Result<Quote, backoff::Error<TerminalError>> {
        let url = format!("{}/quote", self.base_url);
        debug!(url = %url, symbol = %symbol, "Fetching quote");

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| backoff::Error::transient(TerminalError::oracle(symbol, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = TerminalError::oracle(symbol, format!("{} - {}", status, body));
            // Unknown symbols and bad requests will not improve with retries
            return if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
                Err(backoff::Error::permanent(err))
            } else {
                Err(backoff::Error::transient(err))
            };
        }

        let body: QuoteResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(TerminalError::oracle(
                symbol,
                format!("failed to parse quote: {}", e),
            ))
        })?;

        let timestamp = Utc
            .timestamp_millis_opt(body.timestamp)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Quote {
            symbol: body.symbol,
            price: body.price,
            change: body.change,
            timestamp,
        })
    }
}

#[async_trait]
impl PriceOracle for HttpOracle {
    async fn fetch_price(&self, symbol: &str) -> TerminalResult<Quote> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(self.max_retry_elapsed))
            .build();

        backoff::future::retry_notify(
            policy,
            || self.fetch_once(symbol),
            |e: TerminalError, wait: Duration| {
                warn!(symbol = %symbol, error = %e, retry_in_ms = wait.as_millis() as u64, "Quote request failed");
            },
        )
        .await
    }
}
