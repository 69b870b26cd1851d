//! Signal model: a broker-issued trade suggestion broadcast to all traders.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::Side;

/// Lifetime of a signal without an explicit expiry.
pub const DEFAULT_SIGNAL_TTL_MINUTES: i64 = 15;

/// Visibility state of a signal at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalState {
    Active,
    Expired,
}

/// Broker signal. Immutable once created; only deleted by its broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,

    /// Issuing broker account
    pub broker_id: Uuid,

    pub symbol: String,

    pub side: Side,

    /// Oracle price captured at broadcast time
    pub reference_price: Decimal,

    /// Suggested size in units
    pub quantity: Decimal,

    /// Free-text rationale from the broker
    #[serde(default)]
    pub rationale: String,

    pub created_at: DateTime<Utc>,

    /// Explicit expiry; falls back to `created_at + ttl` when absent
    pub expires_at: Option<DateTime<Utc>>,
}

impl Signal {
    /// Instant after which the signal is expired.
    pub fn effective_expiry(&self, default_ttl: Duration) -> DateTime<Utc> {
        self.expires_at
            .unwrap_or_else(|| self.created_at + default_ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, default_ttl: Duration) -> bool {
        now > self.effective_expiry(default_ttl)
    }

    pub fn state(&self, now: DateTime<Utc>, default_ttl: Duration) -> SignalState {
        if self.is_expired(now, default_ttl) {
            SignalState::Expired
        } else {
            SignalState::Active
        }
    }
}
