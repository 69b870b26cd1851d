//! Per-viewer overlay: dismissed signals and acknowledged bonus notices.
//!
//! State is keyed by (account id, scope) so one account can hold independent
//! views, e.g. one per terminal session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::db::Store;
use crate::error::TerminalResult;

/// Scope used when the caller has no session of its own.
pub const DEFAULT_SCOPE: &str = "default";

/// Identifies one viewer's state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewerKey {
    pub account_id: Uuid,
    pub scope: String,
}

impl ViewerKey {
    pub fn new(account_id: Uuid, scope: impl Into<String>) -> Self {
        Self {
            account_id,
            scope: scope.into(),
        }
    }
}

impl fmt::Display for ViewerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.scope)
    }
}

/// What a single viewer has hidden or acknowledged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerState {
    #[serde(default)]
    dismissed: HashSet<Uuid>,

    /// Last bonus percent this viewer was shown
    #[serde(default)]
    acknowledged_bonus: Option<Decimal>,
}

impl ViewerState {
    /// Hide a signal. Returns false if it was already hidden.
    pub fn dismiss(&mut self, signal_id: Uuid) -> bool {
        self.dismissed.insert(signal_id)
    }

    pub fn is_dismissed(&self, signal_id: &Uuid) -> bool {
        self.dismissed.contains(signal_id)
    }

    /// Drop ids that no longer refer to a live signal.
    pub fn retain_known(&mut self, known: &HashSet<Uuid>) {
        self.dismissed.retain(|id| known.contains(id));
    }

    pub fn dismissed_count(&self) -> usize {
        self.dismissed.len()
    }

    /// One-time bonus notice.
    ///
    /// Returns the bonus when it is positive and differs from the last one
    /// this viewer saw, and records it as seen.
    pub fn bonus_notice(&mut self, last_bonus_percent: Decimal) -> Option<Decimal> {
        if last_bonus_percent <= Decimal::ZERO {
            return None;
        }
        if self.acknowledged_bonus == Some(last_bonus_percent) {
            return None;
        }
        self.acknowledged_bonus = Some(last_bonus_percent);
        Some(last_bonus_percent)
    }
}

/// Cache of viewer states backed by the store.
///
/// Each key has its own lock, so a slow load or save for one viewer never
/// blocks another. Updates to the same key are serialized, so concurrent
/// polling loops of one session cannot lose each other's changes.
pub struct ViewerRegistry {
    store: Arc<dyn Store>,
    states: RwLock<HashMap<ViewerKey, Arc<Mutex<Option<ViewerState>>>>>,
}

impl ViewerRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Cache slot for `key`; `None` until loaded from the store.
    async fn slot(&self, key: &ViewerKey) -> Arc<Mutex<Option<ViewerState>>> {
        if let Some(slot) = self.states.read().await.get(key) {
            return slot.clone();
        }
        self.states
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Current state for `key`.
    pub async fn get(&self, key: &ViewerKey) -> TerminalResult<ViewerState> {
        let slot = self.slot(key).await;
        let mut cached = slot.lock().await;

        if let Some(state) = cached.as_ref() {
            return Ok(state.clone());
        }
        let loaded = self.store.load_viewer(key).await?.unwrap_or_default();
        *cached = Some(loaded.clone());
        Ok(loaded)
    }

    /// Apply `f` to the viewer's state and persist the result.
    ///
    /// The cache only takes the new state once the store accepted it.
    pub async fn update<R>(
        &self,
        key: &ViewerKey,
        f: impl FnOnce(&mut ViewerState) -> R,
    ) -> TerminalResult<R> {
        let slot = self.slot(key).await;
        let mut cached = slot.lock().await;

        let mut state = match cached.as_ref() {
            Some(state) => state.clone(),
            None => self.store.load_viewer(key).await?.unwrap_or_default(),
        };
        let result = f(&mut state);
        self.store.save_viewer(key, &state).await?;
        *cached = Some(state);

        Ok(result)
    }

    /// Forget cached state for every scope of `account_id`.
    pub async fn evict_account(&self, account_id: Uuid) {
        let mut states = self.states.write().await;
        states.retain(|key, _| key.account_id != account_id);
    }
}
