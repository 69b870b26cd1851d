//! Account model: a broker or trader holding virtual capital.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Role assigned to an account at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broker,
    Trader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Broker => "broker",
            Role::Trader => "trader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "broker" => Ok(Role::Broker),
            "trader" => Ok(Role::Trader),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Account holding a balance and realized P&L.
///
/// `balance`, `realized_pnl` and `last_bonus_percent` are only changed through
/// [`crate::ledger::Ledger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,

    /// Display name
    #[serde(default)]
    pub name: String,

    pub role: Role,

    /// Available cash, never negative after a committed operation
    pub balance: Decimal,

    /// Sum of settled P&L from closed positions
    #[serde(default)]
    pub realized_pnl: Decimal,

    /// Bonus percent applied by the most recent allocation (notice only)
    #[serde(default)]
    pub last_bonus_percent: Decimal,

    /// Last heartbeat from a session bound to this account
    pub last_seen_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with an empty balance.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            balance: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            last_bonus_percent: Decimal::ZERO,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_broker(&self) -> bool {
        self.role == Role::Broker
    }

    /// Online if a heartbeat arrived within `window` of `now`.
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_seen_at {
            Some(seen) => now - seen < window,
            None => false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = Some(now);
    }

    /// Get display name (name or shortened id).
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            self.name.clone()
        } else {
            let id = self.id.simple().to_string();
            format!("{}...", &id[..8])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_window() {
        let mut account = Account::new("alice", Role::Trader);
        let now = Utc::now();
        assert!(!account.is_online(now, Duration::seconds(60)));

        account.touch(now - Duration::seconds(30));
        assert!(account.is_online(now, Duration::seconds(60)));

        account.touch(now - Duration::seconds(61));
        assert!(!account.is_online(now, Duration::seconds(60)));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Broker".parse::<Role>().unwrap(), Role::Broker);
        assert!("admin".parse::<Role>().is_err());
    }
}
