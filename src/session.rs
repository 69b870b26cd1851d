//! Session runner: the polling loops bound to one signed-in viewer.
//!
//! Runs independent cancellable timers:
//! - Heartbeat so brokers see the account online
//! - Account, position and roster refresh, plus the bonus notice
//! - Price refresh of open positions
//! - Signal sweep, auto-dismissing expired signals for this viewer
//!
//! Loops only read into a shared snapshot; stale reads are acceptable and a
//! failed tick is logged and retried on the next one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::{Account, Signal};
use crate::signals::ViewerKey;
use crate::terminal::Terminal;
use crate::trading::{PortfolioView, RosterEntry};

/// Latest state seen by a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub account: Option<Account>,
    pub portfolio: Option<PortfolioView>,
    pub signals: Vec<Signal>,
    /// Brokers only
    pub roster: Vec<RosterEntry>,
    pub bonus_notice: Option<Decimal>,
    pub last_error: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// A running session. Dropping it without [`Session::cancel`] leaves the
/// loops running until the runtime shuts down.
pub struct Session {
    key: ViewerKey,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start every polling loop for `key`.
    pub fn start(terminal: Arc<Terminal>, key: ViewerKey) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::default()));
        let config = terminal.config.clone();

        info!(
            viewer = %key,
            heartbeat = config.heartbeat_secs,
            prices = config.price_poll_secs,
            sweep = config.signal_sweep_secs,
            "Starting session"
        );

        let mut tasks = Vec::new();

        {
            let (terminal, key) = (terminal.clone(), key.clone());
            tasks.push(spawn_loop(
                "heartbeat",
                Duration::from_secs(config.heartbeat_secs),
                rx.clone(),
                move || {
                    let (terminal, key) = (terminal.clone(), key.clone());
                    async move {
                        if let Err(e) = terminal.desk.heartbeat(key.account_id, Utc::now()).await {
                            warn!(viewer = %key, error = %e, "Heartbeat failed");
                        }
                    }
                },
            ));
        }

        {
            let (terminal, key, snapshot) = (terminal.clone(), key.clone(), snapshot.clone());
            tasks.push(spawn_loop(
                "refresh",
                Duration::from_secs(config.account_refresh_secs),
                rx.clone(),
                move || {
                    let (terminal, key, snapshot) =
                        (terminal.clone(), key.clone(), snapshot.clone());
                    async move { refresh_account(&terminal, &key, &snapshot).await }
                },
            ));
        }

        {
            let (terminal, key, snapshot) = (terminal.clone(), key.clone(), snapshot.clone());
            tasks.push(spawn_loop(
                "prices",
                Duration::from_secs(config.price_poll_secs),
                rx.clone(),
                move || {
                    let (terminal, key, snapshot) =
                        (terminal.clone(), key.clone(), snapshot.clone());
                    async move {
                        match terminal.desk.portfolio(key.account_id).await {
                            Ok(view) => snapshot.write().await.portfolio = Some(view),
                            Err(e) => record_error(&snapshot, "price refresh", e).await,
                        }
                    }
                },
            ));
        }

        {
            let (terminal, key, snapshot) = (terminal.clone(), key.clone(), snapshot.clone());
            tasks.push(spawn_loop(
                "signals",
                Duration::from_secs(config.signal_sweep_secs),
                rx,
                move || {
                    let (terminal, key, snapshot) =
                        (terminal.clone(), key.clone(), snapshot.clone());
                    async move {
                        let active = terminal
                            .signals
                            .active_for(&terminal.viewers, &key, Utc::now())
                            .await;
                        match active {
                            Ok(signals) => snapshot.write().await.signals = signals,
                            Err(e) => record_error(&snapshot, "signal sweep", e).await,
                        }
                    }
                },
            ));
        }

        Self {
            key,
            snapshot,
            shutdown,
            tasks,
        }
    }

    /// Copy of the latest snapshot.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Stop every loop and wait for them to exit.
    pub async fn cancel(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session loop ended abnormally");
            }
        }
        info!(viewer = %self.key, "Session stopped");
    }
}

async fn refresh_account(terminal: &Terminal, key: &ViewerKey, snapshot: &RwLock<SessionSnapshot>) {
    let account = match terminal.desk.account(key.account_id).await {
        Ok(account) => account,
        Err(e) => return record_error(snapshot, "account refresh", e).await,
    };

    let roster = if account.is_broker() {
        terminal.desk.roster(Utc::now()).await
    } else {
        Vec::new()
    };

    let notice = match terminal.bonus_notice(key).await {
        Ok(notice) => notice,
        Err(e) => return record_error(snapshot, "bonus notice", e).await,
    };

    let mut snap = snapshot.write().await;
    snap.account = Some(account);
    snap.roster = roster;
    if notice.is_some() {
        snap.bonus_notice = notice;
    }
    snap.refreshed_at = Some(Utc::now());
    snap.last_error = None;
}

async fn record_error(
    snapshot: &RwLock<SessionSnapshot>,
    what: &str,
    err: crate::error::TerminalError,
) {
    warn!(error = %err, "{} failed", what);
    snapshot.write().await.last_error = Some(format!("{}: {}", what, err));
}

/// Run `tick` every `period` until `shutdown` flips. The first tick is immediate.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!(task = name, "Session loop stopped");
    })
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(account) = &self.account else {
            return writeln!(f, "Waiting for first refresh...");
        };

        writeln!(f, "=== {} ({}) ===", account.display_name(), account.role)?;
        writeln!(f, "Balance:        {:.2}", account.balance)?;
        writeln!(f, "Realized P&L:   {:.2}", account.realized_pnl)?;

        if let Some(bonus) = self.bonus_notice {
            writeln!(f, "Bonus applied:  {}%", bonus)?;
        }

        if let Some(view) = &self.portfolio {
            writeln!(f, "Unrealized P&L: {:.2}", view.total_unrealized)?;
            writeln!(f, "\n--- Open Positions ({}) ---", view.open.len())?;
            for v in &view.open {
                writeln!(
                    f,
                    "  {:<8} {:<5} {:>8} @ {:>10.2} now {:>10.2}{} P&L {:>10.2}",
                    v.position.symbol,
                    v.position.side,
                    v.position.quantity,
                    v.position.entry_price,
                    v.price,
                    if v.priced { " " } else { "*" },
                    v.unrealized_pnl
                )?;
            }
        }

        writeln!(f, "\n--- Active Signals ({}) ---", self.signals.len())?;
        for s in &self.signals {
            writeln!(
                f,
                "  {} {:<5} {:<8} x{} @ {:.2}  {}",
                s.id.simple(),
                s.side,
                s.symbol,
                s.quantity,
                s.reference_price,
                s.rationale
            )?;
        }

        if !self.roster.is_empty() {
            writeln!(f, "\n--- Roster ---")?;
            for entry in &self.roster {
                writeln!(
                    f,
                    "  {:<20} {:<7} {:>12.2} {}",
                    entry.account.display_name(),
                    entry.account.role,
                    entry.account.balance,
                    if entry.online { "online" } else { "offline" }
                )?;
            }
        }

        if let Some(err) = &self.last_error {
            writeln!(f, "\nLast error: {}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{Role, Side};
    use crate::notify::testing::RecordingNotifier;
    use crate::oracle::testing::FixedOracle;
    use crate::signals::SignalDraft;
    use crate::trading::TerminalConfig;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_session_populates_snapshot_and_stops() {
        let config = TerminalConfig {
            heartbeat_secs: 1,
            account_refresh_secs: 1,
            price_poll_secs: 1,
            signal_sweep_secs: 1,
            ..TerminalConfig::default()
        };
        let terminal = Arc::new(
            Terminal::open(
                config,
                Arc::new(MemoryStore::new()),
                Arc::new(FixedOracle::with_prices(&[("AAPL", dec!(100))])),
                Arc::new(RecordingNotifier::default()),
            )
            .await
            .unwrap(),
        );

        let broker = terminal.desk.register("desk", Role::Broker).await.unwrap();
        let trader = terminal.desk.register("alice", Role::Trader).await.unwrap();
        terminal
            .desk
            .allocate(broker.id, trader.id, dec!(2000), dec!(5))
            .await
            .unwrap();
        let draft = SignalDraft {
            symbol: "AAPL".to_string(),
            side: Side::Long,
            quantity: dec!(1),
            rationale: "Breakout".to_string(),
            duration_minutes: Some(30),
        };
        tokio_test::assert_ok!(terminal.signals.broadcast(&broker, draft, Utc::now()).await);

        let session = Session::start(terminal.clone(), ViewerKey::new(trader.id, "test"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snap = session.snapshot().await;
        assert_eq!(snap.account.as_ref().map(|a| a.balance), Some(dec!(2100)));
        assert_eq!(snap.bonus_notice, Some(dec!(5)));
        assert_eq!(snap.signals.len(), 1);
        assert!(snap.portfolio.is_some());
        assert!(snap.roster.is_empty());
        assert!(snap.to_string().contains("Active Signals (1)"));

        let online = terminal.desk.roster(Utc::now()).await;
        assert!(online.iter().any(|e| e.account.id == trader.id && e.online));

        session.cancel().await;
    }
}
