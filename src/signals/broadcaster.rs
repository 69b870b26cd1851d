//! Signal broadcaster: broker-issued signals, expiry and per-viewer visibility.
//!
//! A signal is `active` until `now > expires_at` (or `created_at + ttl` when no
//! explicit expiry was set) and `expired` afterwards, with no way back. Expiry
//! is evaluated on every query rather than driven by an event. Viewers hide
//! signals through their own [`ViewerState`]; only the issuing broker can
//! delete a signal for everyone.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::Store;
use crate::error::{TerminalError, TerminalResult};
use crate::models::{Account, Side, Signal};
use crate::notify::{report, Notifier, Severity};
use crate::oracle::PriceOracle;
use crate::trading::TerminalConfig;

use super::viewer::{ViewerKey, ViewerRegistry, ViewerState};

/// Broker input for a new signal.
#[derive(Debug, Clone)]
pub struct SignalDraft {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub rationale: String,
    /// Minutes until expiry; default lifetime when `None`
    pub duration_minutes: Option<i64>,
}

/// Owns all live signals, newest first.
pub struct SignalBroadcaster {
    oracle: Arc<dyn PriceOracle>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    ttl: Duration,
    signals: RwLock<Vec<Signal>>,
}

impl SignalBroadcaster {
    pub fn new(
        config: &TerminalConfig,
        oracle: Arc<dyn PriceOracle>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            oracle,
            store,
            notifier,
            ttl: config.signal_ttl(),
            signals: RwLock::new(Vec::new()),
        }
    }

    /// Default lifetime of a signal without explicit expiry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Load persisted signals.
    pub async fn load(&self) -> TerminalResult<usize> {
        let mut loaded = self.store.load_signals().await?;
        loaded.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let count = loaded.len();
        *self.signals.write().await = loaded;
        Ok(count)
    }

    /// Publish a signal at the current oracle price.
    pub async fn broadcast(
        &self,
        broker: &Account,
        draft: SignalDraft,
        now: DateTime<Utc>,
    ) -> TerminalResult<Signal> {
        let result = self.broadcast_inner(broker, draft, now).await;
        let signal = report(self.notifier.as_ref(), "Broadcast signal", result)?;

        self.notifier.notify(
            Severity::Success,
            &format!(
                "Signal {} {} x{} @ {} broadcast",
                signal.side, signal.symbol, signal.quantity, signal.reference_price
            ),
        );
        Ok(signal)
    }

    async fn broadcast_inner(
        &self,
        broker: &Account,
        draft: SignalDraft,
        now: DateTime<Utc>,
    ) -> TerminalResult<Signal> {
        if !broker.is_broker() {
            return Err(TerminalError::PermissionDenied(
                "only brokers can broadcast signals".to_string(),
            ));
        }
        let symbol = draft.symbol.trim().to_string();
        if symbol.is_empty() {
            return Err(TerminalError::invalid("symbol is required"));
        }
        if draft.quantity <= Decimal::ZERO {
            return Err(TerminalError::invalid(format!(
                "quantity must be positive, got {}",
                draft.quantity
            )));
        }
        let expires_at = match draft.duration_minutes {
            Some(minutes) if minutes <= 0 => {
                return Err(TerminalError::invalid(format!(
                    "duration must be positive, got {} minutes",
                    minutes
                )))
            }
            Some(minutes) => Some(now + Duration::minutes(minutes)),
            None => None,
        };

        let quote = self.oracle.fetch_price(&symbol).await?;

        let signal = Signal {
            id: Uuid::new_v4(),
            broker_id: broker.id,
            symbol,
            side: draft.side,
            reference_price: quote.price,
            quantity: draft.quantity,
            rationale: draft.rationale,
            created_at: now,
            expires_at,
        };

        self.store.insert_signal(&signal).await?;
        self.signals.write().await.insert(0, signal.clone());

        info!(
            signal = %signal.id,
            broker = %broker.id,
            symbol = %signal.symbol,
            side = %signal.side,
            price = %signal.reference_price,
            "Signal broadcast"
        );
        Ok(signal)
    }

    pub async fn get(&self, signal_id: Uuid) -> TerminalResult<Signal> {
        self.signals
            .read()
            .await
            .iter()
            .find(|s| s.id == signal_id)
            .cloned()
            .ok_or_else(|| TerminalError::not_found("signal", signal_id))
    }

    /// Every signal not yet deleted, newest first, expired ones included.
    pub async fn history(&self) -> Vec<Signal> {
        self.signals.read().await.clone()
    }

    /// Signals issued by one broker, newest first.
    pub async fn history_for(&self, broker_id: Uuid) -> Vec<Signal> {
        self.signals
            .read()
            .await
            .iter()
            .filter(|s| s.broker_id == broker_id)
            .cloned()
            .collect()
    }

    /// Hard delete. Only the issuing broker may delete.
    pub async fn delete(&self, broker: &Account, signal_id: Uuid) -> TerminalResult<Signal> {
        let result = self.delete_inner(broker, signal_id).await;
        let signal = report(self.notifier.as_ref(), "Delete signal", result)?;
        self.notifier
            .notify(Severity::Success, &format!("Signal {} removed from history", signal.id));
        Ok(signal)
    }

    async fn delete_inner(&self, broker: &Account, signal_id: Uuid) -> TerminalResult<Signal> {
        let signal = self.get(signal_id).await?;
        if signal.broker_id != broker.id {
            return Err(TerminalError::PermissionDenied(format!(
                "signal {} was issued by another broker",
                signal_id
            )));
        }

        self.store.delete_signal(signal_id).await?;
        self.signals.write().await.retain(|s| s.id != signal_id);

        info!(signal = %signal_id, broker = %broker.id, "Signal deleted");
        Ok(signal)
    }

    /// Signals the viewer should currently see.
    ///
    /// Expired signals are auto-dismissed for this viewer as a side effect.
    pub async fn active_for(
        &self,
        viewers: &ViewerRegistry,
        key: &ViewerKey,
        now: DateTime<Utc>,
    ) -> TerminalResult<Vec<Signal>> {
        let signals = self.history().await;
        let ttl = self.ttl;
        let result = viewers
            .update(key, |state| {
                let (visible, expired) = sweep(&signals, state, now, ttl);
                (visible, expired, state.dismissed_count())
            })
            .await;
        let (visible, expired, hidden) = report(self.notifier.as_ref(), "Signal sweep", result)?;

        if expired > 0 {
            debug!(viewer = %key, expired, hidden, "Auto-dismissed expired signals");
        }
        Ok(visible)
    }

    /// Hide a signal for one viewer.
    pub async fn dismiss(
        &self,
        viewers: &ViewerRegistry,
        key: &ViewerKey,
        signal_id: Uuid,
    ) -> TerminalResult<bool> {
        let result = match self.get(signal_id).await {
            Ok(_) => viewers.update(key, |state| state.dismiss(signal_id)).await,
            Err(e) => Err(e),
        };
        let newly = report(self.notifier.as_ref(), "Dismiss signal", result)?;
        if newly {
            self.notifier
                .notify(Severity::Info, "Signal removed from dashboard");
        }
        Ok(newly)
    }
}

/// Auto-dismiss expired signals and return the rest with the number dismissed.
///
/// Ids of signals that no longer exist are dropped from the viewer's set.
pub fn sweep(
    signals: &[Signal],
    viewer: &mut ViewerState,
    now: DateTime<Utc>,
    ttl: Duration,
) -> (Vec<Signal>, usize) {
    let known: HashSet<Uuid> = signals.iter().map(|s| s.id).collect();
    viewer.retain_known(&known);

    let mut expired = 0;
    let mut visible = Vec::new();
    for signal in signals {
        if viewer.is_dismissed(&signal.id) {
            continue;
        }
        if signal.is_expired(now, ttl) {
            viewer.dismiss(signal.id);
            expired += 1;
            continue;
        }
        visible.push(signal.clone());
    }

    (visible, expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::ErrorKind;
    use crate::models::Role;
    use crate::notify::testing::RecordingNotifier;
    use crate::oracle::testing::FixedOracle;
    use rust_decimal_macros::dec;

    struct Fixture {
        broadcaster: SignalBroadcaster,
        viewers: ViewerRegistry,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        broker: Account,
    }

    fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let oracle = Arc::new(FixedOracle::with_prices(&[
            ("AAPL", dec!(185.92)),
            ("BTC-USD", dec!(64230.50)),
        ]));
        let notifier = Arc::new(RecordingNotifier::default());
        let broadcaster = SignalBroadcaster::new(
            &TerminalConfig::default(),
            oracle,
            store.clone(),
            notifier.clone(),
        );
        Fixture {
            broadcaster,
            viewers: ViewerRegistry::new(store.clone()),
            store,
            notifier,
            broker: Account::new("desk", Role::Broker),
        }
    }

    fn draft(symbol: &str, duration_minutes: Option<i64>) -> SignalDraft {
        SignalDraft {
            symbol: symbol.to_string(),
            side: Side::Long,
            quantity: dec!(2),
            rationale: "Technical breakout".to_string(),
            duration_minutes,
        }
    }

    #[tokio::test]
    async fn test_broadcast_captures_reference_price() {
        let f = fixture();
        let t0 = Utc::now();
        let signal = f
            .broadcaster
            .broadcast(&f.broker, draft("AAPL", Some(10)), t0)
            .await
            .unwrap();

        assert_eq!(signal.reference_price, dec!(185.92));
        assert_eq!(signal.expires_at, Some(t0 + Duration::minutes(10)));
        assert_eq!(f.broadcaster.history().await.len(), 1);
        assert_eq!(f.notifier.count(Severity::Success), 1);
    }

    #[tokio::test]
    async fn test_broadcast_rejections() {
        let f = fixture();
        let trader = Account::new("t", Role::Trader);

        let err = f
            .broadcaster
            .broadcast(&trader, draft("AAPL", None), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = f
            .broadcaster
            .broadcast(&f.broker, draft("AAPL", Some(0)), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = f
            .broadcaster
            .broadcast(&f.broker, draft("NOPE", None), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OracleUnavailable);

        assert!(f.broadcaster.history().await.is_empty());
        assert_eq!(f.notifier.count(Severity::Warning), 3);
    }

    #[tokio::test]
    async fn test_expiry_auto_dismisses_per_viewer() {
        let f = fixture();
        let t0 = Utc::now();
        let explicit = f
            .broadcaster
            .broadcast(&f.broker, draft("AAPL", Some(10)), t0)
            .await
            .unwrap();
        let implicit = f
            .broadcaster
            .broadcast(&f.broker, draft("BTC-USD", None), t0)
            .await
            .unwrap();

        let viewer = ViewerKey::new(Uuid::new_v4(), "desk");

        let at_9 = f
            .broadcaster
            .active_for(&f.viewers, &viewer, t0 + Duration::minutes(9))
            .await
            .unwrap();
        assert_eq!(at_9.len(), 2);

        let at_11 = f
            .broadcaster
            .active_for(&f.viewers, &viewer, t0 + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(at_11.len(), 1);
        assert_eq!(at_11[0].id, implicit.id);

        let at_14 = f
            .broadcaster
            .active_for(&f.viewers, &viewer, t0 + Duration::minutes(14))
            .await
            .unwrap();
        assert_eq!(at_14.len(), 1);

        let at_16 = f
            .broadcaster
            .active_for(&f.viewers, &viewer, t0 + Duration::minutes(16))
            .await
            .unwrap();
        assert!(at_16.is_empty());

        // Expired signals stay in broadcast history and in the viewer's dismissed set
        assert_eq!(f.broadcaster.history().await.len(), 2);
        assert!(f.viewers.get(&viewer).await.unwrap().is_dismissed(&explicit.id));
    }

    #[tokio::test]
    async fn test_dismiss_is_viewer_local() {
        let f = fixture();
        let signal = f
            .broadcaster
            .broadcast(&f.broker, draft("AAPL", None), Utc::now())
            .await
            .unwrap();

        let alice = ViewerKey::new(Uuid::new_v4(), "desk");
        let bob = ViewerKey::new(Uuid::new_v4(), "desk");

        assert!(f.broadcaster.dismiss(&f.viewers, &alice, signal.id).await.unwrap());
        assert!(!f.broadcaster.dismiss(&f.viewers, &alice, signal.id).await.unwrap());

        let now = Utc::now();
        assert!(f.broadcaster.active_for(&f.viewers, &alice, now).await.unwrap().is_empty());
        assert_eq!(f.broadcaster.active_for(&f.viewers, &bob, now).await.unwrap().len(), 1);

        let err = f
            .broadcaster
            .dismiss(&f.viewers, &alice, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_only_by_issuer() {
        let f = fixture();
        let signal = f
            .broadcaster
            .broadcast(&f.broker, draft("AAPL", None), Utc::now())
            .await
            .unwrap();

        let other = Account::new("other desk", Role::Broker);
        let err = f.broadcaster.delete(&other, signal.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        f.broadcaster.delete(&f.broker, signal.id).await.unwrap();
        assert!(f.broadcaster.history().await.is_empty());

        let err = f.broadcaster.delete(&f.broker, signal.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_failed_sweep_is_reported() {
        let f = fixture();
        let viewer = ViewerKey::new(Uuid::new_v4(), "desk");
        f.broadcaster
            .broadcast(&f.broker, draft("AAPL", Some(10)), Utc::now())
            .await
            .unwrap();

        f.store.fail_next_viewer_save();
        let err = f
            .broadcaster
            .active_for(&f.viewers, &viewer, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
        assert_eq!(f.notifier.count(Severity::Error), 1);

        let visible = f
            .broadcaster
            .active_for(&f.viewers, &viewer, Utc::now())
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
    }
}
