//! Terminal configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::DEFAULT_SIGNAL_TTL_MINUTES;

/// Configuration for sizing, signal lifetime and polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Fraction of balance committed by a manual trade
    pub manual_position_fraction: Decimal,

    /// Fraction of balance a resized copy trade may use
    pub copy_headroom_fraction: Decimal,

    /// Lifetime of a signal without an explicit expiry (minutes)
    pub signal_ttl_minutes: i64,

    /// An account is online if seen within this window (seconds)
    pub online_window_secs: i64,

    /// Price refresh interval for open positions (seconds)
    pub price_poll_secs: u64,

    /// Signal expiry sweep interval (seconds)
    pub signal_sweep_secs: u64,

    /// Heartbeat interval (seconds)
    pub heartbeat_secs: u64,

    /// Account and signal list refresh interval (seconds)
    pub account_refresh_secs: u64,

    /// Upper bound on a single oracle call (milliseconds)
    pub oracle_timeout_ms: u64,

    /// Artificial delay of the simulated feed (milliseconds)
    pub simulated_latency_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            manual_position_fraction: dec!(0.10), // 10% of balance per manual trade
            copy_headroom_fraction: dec!(0.90),   // Resized copies keep 10% free
            signal_ttl_minutes: DEFAULT_SIGNAL_TTL_MINUTES,
            online_window_secs: 60,
            price_poll_secs: 5,
            signal_sweep_secs: 30,
            heartbeat_secs: 30,
            account_refresh_secs: 5,
            oracle_timeout_ms: 5_000,
            simulated_latency_ms: 500,
        }
    }
}

impl TerminalConfig {
    pub fn signal_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.signal_ttl_minutes)
    }

    pub fn online_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.online_window_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }
}
