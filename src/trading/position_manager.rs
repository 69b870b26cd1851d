//! Position manager: sizing, opening and closing positions.
//!
//! Operates on position values only; balance changes are applied by the
//! ledger in the same transaction by [`super::TradingDesk`].

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::error::{TerminalError, TerminalResult};
use crate::models::{Position, PositionStatus, Side};

use super::TerminalConfig;

/// Everything needed to open a position except its quantity.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: Side,
    /// Oracle price the position opens at
    pub price: Decimal,
    /// Set for copy trades
    pub signal_id: Option<Uuid>,
}

/// Opens, sizes and closes positions.
pub struct PositionManager {
    manual_fraction: Decimal,
}

impl PositionManager {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            manual_fraction: config.manual_position_fraction,
        }
    }

    /// Quantity for a manual trade: whole units worth a fixed fraction of balance.
    ///
    /// `floor(balance * fraction / price)`, at least one unit; fails when the
    /// fraction cannot cover a single unit.
    pub fn manual_quantity(&self, balance: Decimal, price: Decimal) -> TerminalResult<Decimal> {
        require_price(price)?;
        let budget = balance
            .checked_mul(self.manual_fraction)
            .ok_or_else(TerminalError::out_of_range)?;
        if budget < price {
            return Err(TerminalError::BalanceTooLow { balance, price });
        }
        Ok(whole_units(budget, price)?.max(Decimal::ONE))
    }

    /// Build a new open position. The caller must debit its notional.
    pub fn open(
        &self,
        account_id: Uuid,
        order: &OpenOrder,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> TerminalResult<Position> {
        require_price(order.price)?;
        if quantity <= Decimal::ZERO {
            return Err(TerminalError::invalid(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        if order.symbol.trim().is_empty() {
            return Err(TerminalError::invalid("symbol is required"));
        }

        Ok(Position {
            id: Uuid::new_v4(),
            account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity,
            entry_price: order.price,
            status: PositionStatus::Open,
            signal_id: order.signal_id,
            is_copied: order.signal_id.is_some(),
            opened_at: now,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
        })
    }

    /// Close `position` at `exit_price` and return its realized P&L.
    ///
    /// The caller must credit `notional + pnl` back to the account.
    pub fn close(
        &self,
        position: &mut Position,
        exit_price: Decimal,
        now: DateTime<Utc>,
    ) -> TerminalResult<Decimal> {
        if !position.is_open() {
            return Err(TerminalError::AlreadyClosed(position.id));
        }
        require_price(exit_price)?;

        let pnl = position.pnl_at(exit_price)?;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.realized_pnl = Some(pnl);
        position.closed_at = Some(now);

        Ok(pnl)
    }
}

/// Whole units of `price` that fit in `budget`.
pub(crate) fn whole_units(budget: Decimal, price: Decimal) -> TerminalResult<Decimal> {
    budget
        .checked_div(price)
        .map(|units| units.round_dp_with_strategy(0, RoundingStrategy::ToZero))
        .ok_or_else(TerminalError::out_of_range)
}

fn require_price(price: Decimal) -> TerminalResult<()> {
    if price <= Decimal::ZERO {
        return Err(TerminalError::invalid(format!(
            "price must be positive, got {}",
            price
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rust_decimal_macros::dec;

    fn manager() -> PositionManager {
        PositionManager::new(&TerminalConfig::default())
    }

    fn order(price: Decimal) -> OpenOrder {
        OpenOrder {
            symbol: "BTC-USD".to_string(),
            side: Side::Long,
            price,
            signal_id: None,
        }
    }

    #[test]
    fn test_manual_sizing() {
        let pm = manager();

        // 10% of 10000 = 1000, at 185.92 -> 5 units
        assert_eq!(pm.manual_quantity(dec!(10000), dec!(185.92)).unwrap(), dec!(5));
        // Exactly one unit affordable
        assert_eq!(pm.manual_quantity(dec!(1000), dec!(100)).unwrap(), dec!(1));

        let err = pm.manual_quantity(dec!(999), dec!(100)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BalanceTooLow);
    }

    #[test]
    fn test_sizing_out_of_range_is_an_error() {
        let pm = manager();

        let err = pm.manual_quantity(Decimal::MAX, dec!(0.0000001)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(whole_units(Decimal::MAX, dec!(0.0001)).is_err());
        assert_eq!(whole_units(dec!(999), dec!(100)).unwrap(), dec!(9));
    }

    #[test]
    fn test_open_and_close_long() {
        let pm = manager();
        let mut pos = pm.open(Uuid::new_v4(), &order(dec!(500)), dec!(2), Utc::now()).unwrap();
        assert!(pos.is_open());
        assert!(!pos.is_copied);
        assert_eq!(pos.notional().unwrap(), dec!(1000));

        let pnl = pm.close(&mut pos, dec!(600), Utc::now()).unwrap();
        assert_eq!(pnl, dec!(200));
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_price, Some(dec!(600)));

        let err = pm.close(&mut pos, dec!(700), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
        assert_eq!(pos.realized_pnl, Some(dec!(200)));
    }

    #[test]
    fn test_open_rejects_bad_input() {
        let pm = manager();
        let account = Uuid::new_v4();

        assert!(pm.open(account, &order(dec!(500)), dec!(0), Utc::now()).is_err());
        assert!(pm.open(account, &order(dec!(0)), dec!(1), Utc::now()).is_err());

        let copied = OpenOrder {
            signal_id: Some(Uuid::new_v4()),
            ..order(dec!(10))
        };
        assert!(pm.open(account, &copied, dec!(1), Utc::now()).unwrap().is_copied);
    }
}
