//! Persistence for accounts, positions, signals and viewer state.
//!
//! The store offers per-record atomic writes and conditional updates but no
//! cross-record transactions; the trading desk sequences multi-record changes.

#[cfg(test)]
mod memory;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{TerminalError, TerminalResult};
use crate::models::{Account, Position, PositionStatus, Role, Side, Signal};
use crate::signals::{ViewerKey, ViewerState};

#[cfg(test)]
pub use memory::MemoryStore;

/// Durable record store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_account(&self, account: &Account) -> TerminalResult<()>;
    async fn load_accounts(&self) -> TerminalResult<Vec<Account>>;
    /// Delete an account together with its positions.
    async fn delete_account(&self, account_id: Uuid) -> TerminalResult<()>;

    async fn insert_position(&self, position: &Position) -> TerminalResult<()>;
    /// Persist a close. Fails if the stored position is no longer open.
    async fn close_position(&self, position: &Position) -> TerminalResult<()>;
    async fn load_positions(&self, account_id: Uuid) -> TerminalResult<Vec<Position>>;

    async fn insert_signal(&self, signal: &Signal) -> TerminalResult<()>;
    async fn delete_signal(&self, signal_id: Uuid) -> TerminalResult<()>;
    async fn load_signals(&self) -> TerminalResult<Vec<Signal>>;

    async fn load_viewer(&self, key: &ViewerKey) -> TerminalResult<Option<ViewerState>>;
    async fn save_viewer(&self, key: &ViewerKey, state: &ViewerState) -> TerminalResult<()>;
}

/// SQLite-backed store.
pub struct Database {
    pool: SqlitePool,
}

/// Stored account row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAccount {
    pub id: String,
    pub name: String,
    pub role: String,
    pub balance: String,
    pub realized_pnl: String,
    pub last_bonus_percent: String,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

/// Stored position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub entry_price: String,
    pub status: String,
    pub signal_id: Option<String>,
    pub is_copied: bool,
    pub opened_at: String,
    pub exit_price: Option<String>,
    pub realized_pnl: Option<String>,
    pub closed_at: Option<String>,
}

/// Stored signal row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSignal {
    pub id: String,
    pub broker_id: String,
    pub symbol: String,
    pub side: String,
    pub reference_price: String,
    pub quantity: String,
    pub rationale: String,
    pub created_at: String,
    pub expires_at: Option<String>,
}

impl Database {
    /// Create a new database connection and apply the schema.
    pub async fn new(database_url: &str) -> TerminalResult<Self> {
        // Every in-memory connection is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!(url = %database_url, "Database ready");
        Ok(db)
    }

    async fn run_migrations(&self) -> TerminalResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        // Decimals are stored as TEXT to keep exact values
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL,
                balance TEXT NOT NULL DEFAULT '0',
                realized_pnl TEXT NOT NULL DEFAULT '0',
                last_bonus_percent TEXT NOT NULL DEFAULT '0',
                last_seen_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                signal_id TEXT,
                is_copied INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT NOT NULL,
                exit_price TEXT,
                realized_pnl TEXT,
                closed_at TEXT,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                broker_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                reference_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                rationale TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                expires_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS viewer_state (
                account_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, scope)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_account ON positions(account_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn upsert_account(&self, account: &Account) -> TerminalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, name, role, balance, realized_pnl, last_bonus_percent, last_seen_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                role = excluded.role,
                balance = excluded.balance,
                realized_pnl = excluded.realized_pnl,
                last_bonus_percent = excluded.last_bonus_percent,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(account.id.to_string())
        .bind(&account.name)
        .bind(account.role.as_str())
        .bind(account.balance.to_string())
        .bind(account.realized_pnl.to_string())
        .bind(account.last_bonus_percent.to_string())
        .bind(account.last_seen_at.map(|t| t.to_rfc3339()))
        .bind(account.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_accounts(&self) -> TerminalResult<Vec<Account>> {
        let rows = sqlx::query_as::<_, StoredAccount>("SELECT * FROM accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Account::try_from).collect()
    }

    async fn delete_account(&self, account_id: Uuid) -> TerminalResult<()> {
        let id = account_id.to_string();

        sqlx::query("DELETE FROM positions WHERE account_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM viewer_state WHERE account_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TerminalError::not_found("account", account_id));
        }
        Ok(())
    }

    async fn insert_position(&self, position: &Position) -> TerminalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, account_id, symbol, side, quantity, entry_price, status,
                signal_id, is_copied, opened_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position.id.to_string())
        .bind(position.account_id.to_string())
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.quantity.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.status.as_str())
        .bind(position.signal_id.map(|id| id.to_string()))
        .bind(position.is_copied)
        .bind(position.opened_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close_position(&self, position: &Position) -> TerminalResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                status = 'closed',
                exit_price = ?,
                realized_pnl = ?,
                closed_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(position.exit_price.map(|p| p.to_string()))
        .bind(position.realized_pnl.map(|p| p.to_string()))
        .bind(position.closed_at.map(|t| t.to_rfc3339()))
        .bind(position.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TerminalError::Persistence(format!(
                "position {} is not open in the store",
                position.id
            )));
        }
        Ok(())
    }

    async fn load_positions(&self, account_id: Uuid) -> TerminalResult<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE account_id = ? ORDER BY opened_at",
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Position::try_from).collect()
    }

    async fn insert_signal(&self, signal: &Signal) -> TerminalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (
                id, broker_id, symbol, side, reference_price, quantity,
                rationale, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(signal.id.to_string())
        .bind(signal.broker_id.to_string())
        .bind(&signal.symbol)
        .bind(signal.side.as_str())
        .bind(signal.reference_price.to_string())
        .bind(signal.quantity.to_string())
        .bind(&signal.rationale)
        .bind(signal.created_at.to_rfc3339())
        .bind(signal.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_signal(&self, signal_id: Uuid) -> TerminalResult<()> {
        let result = sqlx::query("DELETE FROM signals WHERE id = ?")
            .bind(signal_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TerminalError::not_found("signal", signal_id));
        }
        Ok(())
    }

    async fn load_signals(&self) -> TerminalResult<Vec<Signal>> {
        let rows = sqlx::query_as::<_, StoredSignal>("SELECT * FROM signals ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Signal::try_from).collect()
    }

    async fn load_viewer(&self, key: &ViewerKey) -> TerminalResult<Option<ViewerState>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM viewer_state WHERE account_id = ? AND scope = ?")
                .bind(key.account_id.to_string())
                .bind(&key.scope)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| TerminalError::Persistence(format!("corrupt viewer state: {}", e)))
        })
        .transpose()
    }

    async fn save_viewer(&self, key: &ViewerKey, state: &ViewerState) -> TerminalResult<()> {
        let json = serde_json::to_string(state)
            .map_err(|e| TerminalError::Persistence(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO viewer_state (account_id, scope, state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id, scope) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.account_id.to_string())
        .bind(&key.scope)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ==================== Row conversion ====================

fn corrupt(field: &str, value: &str) -> TerminalError {
    TerminalError::Persistence(format!("corrupt {} value '{}'", field, value))
}

fn parse_uuid(field: &str, value: &str) -> TerminalResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| corrupt(field, value))
}

fn parse_decimal(field: &str, value: &str) -> TerminalResult<Decimal> {
    Decimal::from_str(value).map_err(|_| corrupt(field, value))
}

fn parse_time(field: &str, value: &str) -> TerminalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt(field, value))
}

fn parse_with<T: FromStr>(field: &str, value: &str) -> TerminalResult<T> {
    value.parse::<T>().map_err(|_| corrupt(field, value))
}

impl TryFrom<StoredAccount> for Account {
    type Error = TerminalError;

    fn try_from(row: StoredAccount) -> TerminalResult<Self> {
        Ok(Account {
            id: parse_uuid("account id", &row.id)?,
            name: row.name,
            role: parse_with::<Role>("role", &row.role)?,
            balance: parse_decimal("balance", &row.balance)?,
            realized_pnl: parse_decimal("realized_pnl", &row.realized_pnl)?,
            last_bonus_percent: parse_decimal("last_bonus_percent", &row.last_bonus_percent)?,
            last_seen_at: row
                .last_seen_at
                .as_deref()
                .map(|t| parse_time("last_seen_at", t))
                .transpose()?,
            created_at: parse_time("created_at", &row.created_at)?,
        })
    }
}

impl TryFrom<StoredPosition> for Position {
    type Error = TerminalError;

    fn try_from(row: StoredPosition) -> TerminalResult<Self> {
        Ok(Position {
            id: parse_uuid("position id", &row.id)?,
            account_id: parse_uuid("account_id", &row.account_id)?,
            symbol: row.symbol,
            side: parse_with::<Side>("side", &row.side)?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            entry_price: parse_decimal("entry_price", &row.entry_price)?,
            status: parse_with::<PositionStatus>("status", &row.status)?,
            signal_id: row
                .signal_id
                .as_deref()
                .map(|id| parse_uuid("signal_id", id))
                .transpose()?,
            is_copied: row.is_copied,
            opened_at: parse_time("opened_at", &row.opened_at)?,
            exit_price: row
                .exit_price
                .as_deref()
                .map(|p| parse_decimal("exit_price", p))
                .transpose()?,
            realized_pnl: row
                .realized_pnl
                .as_deref()
                .map(|p| parse_decimal("realized_pnl", p))
                .transpose()?,
            closed_at: row
                .closed_at
                .as_deref()
                .map(|t| parse_time("closed_at", t))
                .transpose()?,
        })
    }
}

impl TryFrom<StoredSignal> for Signal {
    type Error = TerminalError;

    fn try_from(row: StoredSignal) -> TerminalResult<Self> {
        Ok(Signal {
            id: parse_uuid("signal id", &row.id)?,
            broker_id: parse_uuid("broker_id", &row.broker_id)?,
            symbol: row.symbol,
            side: parse_with::<Side>("side", &row.side)?,
            reference_price: parse_decimal("reference_price", &row.reference_price)?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            rationale: row.rationale,
            created_at: parse_time("created_at", &row.created_at)?,
            expires_at: row
                .expires_at
                .as_deref()
                .map(|t| parse_time("expires_at", t))
                .transpose()?,
        })
    }
}
