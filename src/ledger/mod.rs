//! Ledger: balance mutations and mark-to-market valuation.
//!
//! Every mutating operation validates first and only then touches the account,
//! so a rejected operation leaves the balance exactly as it was. Callers are
//! responsible for serializing operations on the same account.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{TerminalError, TerminalResult};
use crate::models::{Account, Position, Role};

/// Outcome of a broker allocation.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub base_amount: Decimal,
    pub bonus_percent: Decimal,
    pub bonus_amount: Decimal,
    pub new_balance: Decimal,
}

/// Outcome of settling a closed position.
#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    /// Amount returned to the balance (notional plus P&L, floored at zero)
    pub credited: Decimal,
    /// P&L booked into the account's realized total
    pub booked_pnl: Decimal,
    pub new_balance: Decimal,
}

/// Balance operations on a single account.
pub struct Ledger;

impl Ledger {
    /// Add `amount` to the balance.
    pub fn credit(account: &mut Account, amount: Decimal) -> TerminalResult<Decimal> {
        require_positive(amount, "credit amount")?;
        let new_balance = checked_add(account.balance, amount)?;
        account.balance = new_balance;
        Ok(new_balance)
    }

    /// Remove `amount` from the balance. No partial debit.
    pub fn debit(account: &mut Account, amount: Decimal) -> TerminalResult<Decimal> {
        require_positive(amount, "debit amount")?;
        if account.balance < amount {
            return Err(TerminalError::InsufficientFunds {
                needed: amount,
                available: account.balance,
            });
        }
        account.balance -= amount;
        Ok(account.balance)
    }

    /// Broker allocation of `base_amount` plus a percentage bonus.
    pub fn allocate(
        actor: Role,
        account: &mut Account,
        base_amount: Decimal,
        bonus_percent: Decimal,
    ) -> TerminalResult<Allocation> {
        if actor != Role::Broker {
            return Err(TerminalError::PermissionDenied(
                "only brokers can allocate capital".to_string(),
            ));
        }
        require_positive(base_amount, "allocation amount")?;
        if bonus_percent < Decimal::ZERO {
            return Err(TerminalError::invalid("bonus percent cannot be negative"));
        }

        let bonus_amount = base_amount
            .checked_mul(bonus_percent)
            .map(|v| v / Decimal::ONE_HUNDRED)
            .ok_or_else(overflow)?;
        let new_balance = checked_add(checked_add(account.balance, base_amount)?, bonus_amount)?;

        account.balance = new_balance;
        account.last_bonus_percent = bonus_percent;

        Ok(Allocation {
            base_amount,
            bonus_percent,
            bonus_amount,
            new_balance,
        })
    }

    /// Return a closed position's notional plus `pnl` to the balance.
    ///
    /// A short that moved against the holder by more than its notional would
    /// produce a negative return; the credit is floored at zero and the booked
    /// loss is capped at the notional so the balance never goes negative.
    pub fn settle_close(
        account: &mut Account,
        notional: Decimal,
        pnl: Decimal,
    ) -> TerminalResult<Settlement> {
        let credited = checked_add(notional, pnl)?.max(Decimal::ZERO);
        let booked_pnl = credited - notional;
        let new_balance = checked_add(account.balance, credited)?;
        let realized = checked_add(account.realized_pnl, booked_pnl)?;

        account.balance = new_balance;
        account.realized_pnl = realized;

        Ok(Settlement {
            credited,
            booked_pnl,
            new_balance,
        })
    }
}

/// Unrealized P&L of `position` at `current_price`. Pure.
pub fn mark_to_market(position: &Position, current_price: Decimal) -> TerminalResult<Decimal> {
    position.pnl_at(current_price)
}

/// Sum of unrealized P&L over open positions, valued at `prices` when a quote
/// exists and at entry price otherwise.
pub fn total_unrealized(
    positions: &[Position],
    prices: &HashMap<String, Decimal>,
) -> TerminalResult<Decimal> {
    positions
        .iter()
        .filter(|p| p.is_open())
        .try_fold(Decimal::ZERO, |total, p| -> TerminalResult<Decimal> {
            let price = prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
            checked_add(total, mark_to_market(p, price)?)
        })
}

/// `quantity * price`, rejecting overflow.
pub fn notional(quantity: Decimal, price: Decimal) -> TerminalResult<Decimal> {
    quantity.checked_mul(price).ok_or_else(overflow)
}

fn require_positive(amount: Decimal, what: &str) -> TerminalResult<()> {
    if amount <= Decimal::ZERO {
        return Err(TerminalError::invalid(format!(
            "{} must be positive, got {}",
            what, amount
        )));
    }
    Ok(())
}

fn checked_add(a: Decimal, b: Decimal) -> TerminalResult<Decimal> {
    a.checked_add(b).ok_or_else(overflow)
}

fn overflow() -> TerminalError {
    TerminalError::out_of_range()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{PositionStatus, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trader(balance: Decimal) -> Account {
        let mut account = Account::new("trader", Role::Trader);
        account.balance = balance;
        account
    }

    #[test]
    fn test_allocate_with_bonus() {
        let mut account = trader(dec!(1000));
        let alloc = Ledger::allocate(Role::Broker, &mut account, dec!(500), dec!(10)).unwrap();

        assert_eq!(alloc.bonus_amount, dec!(50));
        assert_eq!(account.balance, dec!(1550));
        assert_eq!(account.last_bonus_percent, dec!(10));
    }

    #[test]
    fn test_allocate_rejections() {
        let mut account = trader(dec!(100));

        let err = Ledger::allocate(Role::Trader, &mut account, dec!(500), dec!(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = Ledger::allocate(Role::Broker, &mut account, dec!(0), dec!(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = Ledger::allocate(Role::Broker, &mut account, dec!(10), dec!(-5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        assert_eq!(account.balance, dec!(100));
        assert_eq!(account.last_bonus_percent, Decimal::ZERO);
    }

    #[test]
    fn test_debit_insufficient_leaves_balance() {
        let mut account = trader(dec!(550));
        let err = Ledger::debit(&mut account, dec!(1000)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(account.balance, dec!(550));

        assert_eq!(Ledger::debit(&mut account, dec!(550)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_credit_requires_positive() {
        let mut account = trader(dec!(10));
        assert!(Ledger::credit(&mut account, dec!(-1)).is_err());
        assert_eq!(Ledger::credit(&mut account, dec!(5)).unwrap(), dec!(15));
    }

    #[test]
    fn test_settle_close_floors_at_zero() {
        let mut account = trader(dec!(20));
        // Short 2 @ 500 closed at 1200: pnl = -1400, notional 1000
        let settlement = Ledger::settle_close(&mut account, dec!(1000), dec!(-1400)).unwrap();

        assert_eq!(settlement.credited, Decimal::ZERO);
        assert_eq!(settlement.booked_pnl, dec!(-1000));
        assert_eq!(account.balance, dec!(20));
        assert_eq!(account.realized_pnl, dec!(-1000));
    }

    #[test]
    fn test_total_unrealized_falls_back_to_entry() {
        let open = |symbol: &str, side, entry| Position {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            quantity: dec!(2),
            entry_price: entry,
            status: PositionStatus::Open,
            signal_id: None,
            is_copied: false,
            opened_at: Utc::now(),
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
        };

        let positions = vec![
            open("BTC-USD", Side::Long, dec!(500)),
            open("ETH-USD", Side::Short, dec!(100)),
            open("AAPL", Side::Long, dec!(50)),
        ];
        let prices = HashMap::from([
            ("BTC-USD".to_string(), dec!(600)),
            ("ETH-USD".to_string(), dec!(90)),
        ]);

        // 200 + 20 + 0 (no quote for AAPL)
        assert_eq!(total_unrealized(&positions, &prices).unwrap(), dec!(220));
    }

    #[test]
    fn test_total_unrealized_overflow_is_an_error() {
        let open = |entry| Position {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            symbol: "BTC-USD".to_string(),
            side: Side::Long,
            quantity: Decimal::ONE,
            entry_price: entry,
            status: PositionStatus::Open,
            signal_id: None,
            is_copied: false,
            opened_at: Utc::now(),
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
        };
        let half = Decimal::MAX / dec!(2);
        let positions = vec![open(dec!(0.01)), open(dec!(0.01)), open(dec!(0.01))];
        let prices = HashMap::from([("BTC-USD".to_string(), half)]);

        let err = total_unrealized(&positions, &prices).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
