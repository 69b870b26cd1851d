//! In-memory store for tests, with injectable write failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{TerminalError, TerminalResult};
use crate::models::{Account, Position, Signal};
use crate::signals::{ViewerKey, ViewerState};

use super::Store;

#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<Uuid, Account>>,
    positions: Mutex<Vec<Position>>,
    signals: Mutex<Vec<Signal>>,
    viewers: Mutex<HashMap<ViewerKey, ViewerState>>,

    fail_account_upsert: AtomicBool,
    fail_position_insert: AtomicBool,
    fail_position_close: AtomicBool,
    fail_viewer_save: AtomicBool,
}

fn injected(what: &str) -> TerminalError {
    TerminalError::Persistence(format!("injected {} failure", what))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next account upsert fail.
    pub fn fail_next_account_upsert(&self) {
        self.fail_account_upsert.store(true, Ordering::SeqCst);
    }

    /// Make the next position insert fail.
    pub fn fail_next_position_insert(&self) {
        self.fail_position_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next position close fail.
    pub fn fail_next_position_close(&self) {
        self.fail_position_close.store(true, Ordering::SeqCst);
    }

    /// Make the next viewer state save fail.
    pub fn fail_next_viewer_save(&self) {
        self.fail_viewer_save.store(true, Ordering::SeqCst);
    }

    pub fn stored_account(&self, id: Uuid) -> Option<Account> {
        self.accounts.lock().unwrap().get(&id).cloned()
    }

    pub fn stored_positions(&self) -> Vec<Position> {
        self.positions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_account(&self, account: &Account) -> TerminalResult<()> {
        if self.fail_account_upsert.swap(false, Ordering::SeqCst) {
            return Err(injected("account upsert"));
        }
        self.accounts
            .lock()
            .unwrap()
            .insert(account.id, account.clone());
        Ok(())
    }

    async fn load_accounts(&self) -> TerminalResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.lock().unwrap().values().cloned().collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn delete_account(&self, account_id: Uuid) -> TerminalResult<()> {
        if self.accounts.lock().unwrap().remove(&account_id).is_none() {
            return Err(TerminalError::not_found("account", account_id));
        }
        self.positions
            .lock()
            .unwrap()
            .retain(|p| p.account_id != account_id);
        self.viewers
            .lock()
            .unwrap()
            .retain(|key, _| key.account_id != account_id);
        Ok(())
    }

    async fn insert_position(&self, position: &Position) -> TerminalResult<()> {
        if self.fail_position_insert.swap(false, Ordering::SeqCst) {
            return Err(injected("position insert"));
        }
        self.positions.lock().unwrap().push(position.clone());
        Ok(())
    }

    async fn close_position(&self, position: &Position) -> TerminalResult<()> {
        if self.fail_position_close.swap(false, Ordering::SeqCst) {
            return Err(injected("position close"));
        }
        let mut positions = self.positions.lock().unwrap();
        match positions
            .iter_mut()
            .find(|p| p.id == position.id && p.is_open())
        {
            Some(stored) => {
                *stored = position.clone();
                Ok(())
            }
            None => Err(TerminalError::Persistence(format!(
                "position {} is not open in the store",
                position.id
            ))),
        }
    }

    async fn load_positions(&self, account_id: Uuid) -> TerminalResult<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn insert_signal(&self, signal: &Signal) -> TerminalResult<()> {
        self.signals.lock().unwrap().push(signal.clone());
        Ok(())
    }

    async fn delete_signal(&self, signal_id: Uuid) -> TerminalResult<()> {
        let mut signals = self.signals.lock().unwrap();
        let before = signals.len();
        signals.retain(|s| s.id != signal_id);
        if signals.len() == before {
            return Err(TerminalError::not_found("signal", signal_id));
        }
        Ok(())
    }

    async fn load_signals(&self) -> TerminalResult<Vec<Signal>> {
        let mut signals = self.signals.lock().unwrap().clone();
        signals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(signals)
    }

    async fn load_viewer(&self, key: &ViewerKey) -> TerminalResult<Option<ViewerState>> {
        Ok(self.viewers.lock().unwrap().get(key).cloned())
    }

    async fn save_viewer(&self, key: &ViewerKey, state: &ViewerState) -> TerminalResult<()> {
        if self.fail_viewer_save.swap(false, Ordering::SeqCst) {
            return Err(injected("viewer save"));
        }
        self.viewers
            .lock()
            .unwrap()
            .insert(key.clone(), state.clone());
        Ok(())
    }
}
