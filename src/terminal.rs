//! Terminal: the desk, signal broadcaster, copy engine and viewer registry
//! wired over one store, oracle and notifier.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::db::Store;
use crate::error::TerminalResult;
use crate::models::Account;
use crate::notify::{report, Notifier, Severity};
use crate::oracle::PriceOracle;
use crate::signals::{SignalBroadcaster, ViewerKey, ViewerRegistry};
use crate::trading::{CopyEngine, TerminalConfig, TradingDesk};

pub struct Terminal {
    pub config: TerminalConfig,
    pub desk: Arc<TradingDesk>,
    pub signals: Arc<SignalBroadcaster>,
    pub copier: CopyEngine,
    pub viewers: ViewerRegistry,
    notifier: Arc<dyn Notifier>,
}

impl Terminal {
    /// Build the terminal and load persisted state.
    pub async fn open(
        config: TerminalConfig,
        store: Arc<dyn Store>,
        oracle: Arc<dyn PriceOracle>,
        notifier: Arc<dyn Notifier>,
    ) -> TerminalResult<Self> {
        let desk = Arc::new(TradingDesk::new(
            &config,
            oracle.clone(),
            store.clone(),
            notifier.clone(),
        ));
        let signals = Arc::new(SignalBroadcaster::new(
            &config,
            oracle,
            store.clone(),
            notifier.clone(),
        ));
        let copier = CopyEngine::new(&config, desk.clone(), signals.clone());
        let viewers = ViewerRegistry::new(store);

        let accounts = desk.load().await?;
        let loaded_signals = signals.load().await?;
        info!(accounts, signals = loaded_signals, "Terminal state loaded");

        Ok(Self {
            config,
            desk,
            signals,
            copier,
            viewers,
            notifier,
        })
    }

    /// One-time notice of the account's latest bonus for this viewer.
    pub async fn bonus_notice(&self, key: &ViewerKey) -> TerminalResult<Option<Decimal>> {
        let result = match self.desk.account(key.account_id).await {
            Ok(account) => {
                self.viewers
                    .update(key, |state| state.bonus_notice(account.last_bonus_percent))
                    .await
            }
            Err(e) => Err(e),
        };
        let notice = report(self.notifier.as_ref(), "Bonus notice", result)?;

        if let Some(bonus) = notice {
            self.notifier.notify(
                Severity::Info,
                &format!("Your broker applied a {}% bonus to your last allocation", bonus),
            );
        }
        Ok(notice)
    }

    /// Remove a trader and forget their viewer state.
    pub async fn remove_account(&self, broker_id: Uuid, account_id: Uuid) -> TerminalResult<Account> {
        let account = self.desk.remove_account(broker_id, account_id).await?;
        self.viewers.evict_account(account_id).await;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::Role;
    use crate::notify::testing::RecordingNotifier;
    use crate::oracle::testing::FixedOracle;
    use crate::signals::DEFAULT_SCOPE;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_bonus_notice_shown_once_per_viewer() {
        let notifier = Arc::new(RecordingNotifier::default());
        let terminal = Terminal::open(
            TerminalConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedOracle::default()),
            notifier.clone(),
        )
        .await
        .unwrap();

        let broker = terminal.desk.register("desk", Role::Broker).await.unwrap();
        let trader = terminal.desk.register("alice", Role::Trader).await.unwrap();
        let key = ViewerKey::new(trader.id, DEFAULT_SCOPE);

        assert_eq!(terminal.bonus_notice(&key).await.unwrap(), None);

        terminal
            .desk
            .allocate(broker.id, trader.id, dec!(500), dec!(10))
            .await
            .unwrap();
        assert_eq!(terminal.bonus_notice(&key).await.unwrap(), Some(dec!(10)));
        assert_eq!(terminal.bonus_notice(&key).await.unwrap(), None);

        // Another session of the same account gets its own notice
        let other = ViewerKey::new(trader.id, "mobile");
        assert_eq!(terminal.bonus_notice(&other).await.unwrap(), Some(dec!(10)));
        assert_eq!(notifier.count(Severity::Info), 2);
    }

    #[tokio::test]
    async fn test_failed_bonus_notice_is_reported_and_retried() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let terminal = Terminal::open(
            TerminalConfig::default(),
            store.clone(),
            Arc::new(FixedOracle::default()),
            notifier.clone(),
        )
        .await
        .unwrap();

        let broker = terminal.desk.register("desk", Role::Broker).await.unwrap();
        let trader = terminal.desk.register("alice", Role::Trader).await.unwrap();
        terminal
            .desk
            .allocate(broker.id, trader.id, dec!(500), dec!(10))
            .await
            .unwrap();
        let key = ViewerKey::new(trader.id, DEFAULT_SCOPE);

        store.fail_next_viewer_save();
        assert!(terminal.bonus_notice(&key).await.is_err());
        assert_eq!(notifier.count(Severity::Error), 1);

        // The notice was not acknowledged, so the next refresh shows it
        assert_eq!(terminal.bonus_notice(&key).await.unwrap(), Some(dec!(10)));
    }
}
