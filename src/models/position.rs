//! Position model: an open or closed simulated exposure owned by one account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{TerminalError, TerminalResult};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// P&L of `quantity` units entered at `entry` and valued at `price`.
    pub fn pnl(&self, entry: Decimal, price: Decimal, quantity: Decimal) -> TerminalResult<Decimal> {
        let move_per_unit = match self {
            Side::Long => price.checked_sub(entry),
            Side::Short => entry.checked_sub(price),
        };
        move_per_unit
            .and_then(|d| d.checked_mul(quantity))
            .ok_or_else(TerminalError::out_of_range)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(format!("unknown position status '{}'", other)),
        }
    }
}

/// A position held by an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,

    /// Owning account
    pub account_id: Uuid,

    /// Market symbol (e.g., "BTC-USD")
    pub symbol: String,

    pub side: Side,

    /// Number of units held
    pub quantity: Decimal,

    /// Price at open, never changes
    pub entry_price: Decimal,

    pub status: PositionStatus,

    /// Signal this position was copied from
    pub signal_id: Option<Uuid>,

    #[serde(default)]
    pub is_copied: bool,

    pub opened_at: DateTime<Utc>,

    pub exit_price: Option<Decimal>,

    pub realized_pnl: Option<Decimal>,

    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Cost of the position at entry.
    pub fn notional(&self) -> TerminalResult<Decimal> {
        self.quantity
            .checked_mul(self.entry_price)
            .ok_or_else(TerminalError::out_of_range)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// P&L if the position were closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> TerminalResult<Decimal> {
        self.side.pnl(self.entry_price, price, self.quantity)
    }

    /// Return on notional at `price`.
    pub fn return_pct(&self, price: Decimal) -> TerminalResult<Decimal> {
        let notional = self.notional()?;
        if notional.is_zero() {
            return Ok(Decimal::ZERO);
        }
        self.pnl_at(price)?
            .checked_div(notional)
            .ok_or_else(TerminalError::out_of_range)
    }
}
