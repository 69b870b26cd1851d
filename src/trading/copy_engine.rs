//! Copy-trading engine: follows broker signals into positions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{TerminalError, TerminalResult};
use crate::ledger;
use crate::models::Position;
use crate::notify::{report, Severity};
use crate::signals::SignalBroadcaster;

use super::position_manager::whole_units;
use super::{OpenOrder, TerminalConfig, TradingDesk};

/// A followed signal.
#[derive(Debug, Clone, Serialize)]
pub struct CopyFill {
    pub position: Position,
    /// Quantity the broker suggested
    pub suggested_quantity: Decimal,
    pub resized: bool,
}

/// Opens copy positions from signals.
pub struct CopyEngine {
    desk: Arc<TradingDesk>,
    broadcaster: Arc<SignalBroadcaster>,
    headroom: Decimal,
}

impl CopyEngine {
    pub fn new(
        config: &TerminalConfig,
        desk: Arc<TradingDesk>,
        broadcaster: Arc<SignalBroadcaster>,
    ) -> Self {
        Self {
            desk,
            broadcaster,
            headroom: config.copy_headroom_fraction,
        }
    }

    /// Copy a signal into `account_id` at the current price.
    pub async fn follow(
        &self,
        account_id: Uuid,
        signal_id: Uuid,
        now: DateTime<Utc>,
    ) -> TerminalResult<CopyFill> {
        let result = self.follow_inner(account_id, signal_id, now).await;
        let fill = report(self.desk.notifier(), "Copy trade", result)?;

        if fill.resized {
            self.desk.notifier().notify(
                Severity::Info,
                &format!(
                    "Adjusted quantity to {} to fit balance (signal suggested {})",
                    fill.position.quantity, fill.suggested_quantity
                ),
            );
        }
        self.desk.notifier().notify(
            Severity::Success,
            &format!(
                "Copied {} {} {} @ {}",
                fill.position.side,
                fill.position.quantity,
                fill.position.symbol,
                fill.position.entry_price
            ),
        );
        Ok(fill)
    }

    async fn follow_inner(
        &self,
        account_id: Uuid,
        signal_id: Uuid,
        now: DateTime<Utc>,
    ) -> TerminalResult<CopyFill> {
        let signal = self.broadcaster.get(signal_id).await?;
        if signal.is_expired(now, self.broadcaster.ttl()) {
            return Err(TerminalError::invalid(format!(
                "signal {} has expired",
                signal_id
            )));
        }

        let account = self.desk.account(account_id).await?;
        if account.balance <= Decimal::ZERO {
            return Err(TerminalError::InsufficientFunds {
                needed: ledger::notional(signal.quantity, signal.reference_price)?,
                available: account.balance,
            });
        }

        // Executes at the current price, not the signal's reference price
        let price = self.desk.fetch_quote(&signal.symbol).await?.price;
        let order = OpenOrder {
            symbol: signal.symbol.clone(),
            side: signal.side,
            price,
            signal_id: Some(signal.id),
        };

        let suggested = signal.quantity;
        let headroom = self.headroom;
        let position = self
            .desk
            .execute_open(account_id, &order, |balance| {
                copy_quantity(balance, suggested, price, headroom)
            })
            .await?;

        info!(
            account = %account_id,
            signal = %signal.id,
            broker = %signal.broker_id,
            reference = %signal.reference_price,
            executed = %price,
            "Signal copied"
        );

        Ok(CopyFill {
            resized: position.quantity != suggested,
            suggested_quantity: suggested,
            position,
        })
    }
}

/// Quantity for a copy trade.
///
/// The suggested quantity when affordable, otherwise whole units worth
/// `headroom` of the balance. `BalanceTooLow` when not even one unit fits.
pub fn copy_quantity(
    balance: Decimal,
    suggested: Decimal,
    price: Decimal,
    headroom: Decimal,
) -> TerminalResult<Decimal> {
    if suggested <= Decimal::ZERO {
        return Err(TerminalError::invalid("signal quantity must be positive"));
    }
    if price <= Decimal::ZERO {
        return Err(TerminalError::invalid(format!(
            "price must be positive, got {}",
            price
        )));
    }

    if ledger::notional(suggested, price)? <= balance {
        return Ok(suggested);
    }

    let budget = balance
        .max(Decimal::ZERO)
        .checked_mul(headroom)
        .ok_or_else(TerminalError::out_of_range)?;
    let quantity = whole_units(budget, price)?;
    if quantity <= Decimal::ZERO {
        return Err(TerminalError::BalanceTooLow { balance, price });
    }
    Ok(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::ErrorKind;
    use crate::models::{Account, Role, Side};
    use crate::notify::testing::RecordingNotifier;
    use crate::oracle::testing::FixedOracle;
    use crate::signals::SignalDraft;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_copy_quantity() {
        let headroom = dec!(0.90);

        // Affordable: keep suggestion
        assert_eq!(copy_quantity(dec!(2000), dec!(5), dec!(300), headroom).unwrap(), dec!(5));
        // 5 * 300 > 1000 -> floor(900 / 300) = 3
        assert_eq!(copy_quantity(dec!(1000), dec!(5), dec!(300), headroom).unwrap(), dec!(3));

        let err = copy_quantity(dec!(100), dec!(5), dec!(300), headroom).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BalanceTooLow);
    }

    struct Fixture {
        engine: CopyEngine,
        desk: Arc<TradingDesk>,
        broadcaster: Arc<SignalBroadcaster>,
        oracle: Arc<FixedOracle>,
        notifier: Arc<RecordingNotifier>,
        broker: Account,
        trader: Account,
    }

    async fn fixture() -> Fixture {
        let config = TerminalConfig::default();
        let store = Arc::new(MemoryStore::new());
        let oracle = Arc::new(FixedOracle::with_prices(&[("NVDA", dec!(300))]));
        let notifier = Arc::new(RecordingNotifier::default());

        let desk = Arc::new(TradingDesk::new(
            &config,
            oracle.clone(),
            store.clone(),
            notifier.clone(),
        ));
        let broadcaster = Arc::new(SignalBroadcaster::new(
            &config,
            oracle.clone(),
            store,
            notifier.clone(),
        ));
        let engine = CopyEngine::new(&config, desk.clone(), broadcaster.clone());

        let broker = desk.register("desk", Role::Broker).await.unwrap();
        let trader = desk.register("alice", Role::Trader).await.unwrap();

        Fixture {
            engine,
            desk,
            broadcaster,
            oracle,
            notifier,
            broker,
            trader,
        }
    }

    async fn publish(f: &Fixture, quantity: Decimal) -> Uuid {
        let draft = SignalDraft {
            symbol: "NVDA".to_string(),
            side: Side::Long,
            quantity,
            rationale: "Earnings momentum".to_string(),
            duration_minutes: None,
        };
        f.broadcaster
            .broadcast(&f.broker, draft, Utc::now())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_follow_resizes_to_balance() {
        let f = fixture().await;
        f.desk.deposit(f.trader.id, dec!(1000)).await.unwrap();
        let signal_id = publish(&f, dec!(5)).await;

        let fill = f
            .engine
            .follow(f.trader.id, signal_id, Utc::now())
            .await
            .unwrap();

        assert!(fill.resized);
        assert_eq!(fill.position.quantity, dec!(3));
        assert!(fill.position.is_copied);
        assert_eq!(fill.position.signal_id, Some(signal_id));
        assert_eq!(f.desk.account(f.trader.id).await.unwrap().balance, dec!(100));
        assert_eq!(f.notifier.count(Severity::Info), 1);
    }

    #[tokio::test]
    async fn test_follow_executes_at_current_price() {
        let f = fixture().await;
        f.desk.deposit(f.trader.id, dec!(5000)).await.unwrap();
        let signal_id = publish(&f, dec!(2)).await;

        f.oracle.set_price("NVDA", dec!(320));
        let fill = f
            .engine
            .follow(f.trader.id, signal_id, Utc::now())
            .await
            .unwrap();

        assert!(!fill.resized);
        assert_eq!(fill.position.entry_price, dec!(320));
        assert_eq!(f.desk.account(f.trader.id).await.unwrap().balance, dec!(4360));
    }

    #[tokio::test]
    async fn test_follow_rejections() {
        let f = fixture().await;
        let signal_id = publish(&f, dec!(1)).await;

        let err = f
            .engine
            .follow(f.trader.id, signal_id, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        f.desk.deposit(f.trader.id, dec!(100)).await.unwrap();
        let err = f
            .engine
            .follow(f.trader.id, signal_id, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BalanceTooLow);

        let later = Utc::now() + Duration::minutes(16);
        let err = f.engine.follow(f.trader.id, signal_id, later).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = f
            .engine
            .follow(f.trader.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(f.desk.account(f.trader.id).await.unwrap().balance, dec!(100));
    }
}
