//! Trading desk: accounts, manual trades and portfolio views.
//!
//! Each account is a single logical actor: its balance and positions live in
//! an [`AccountBook`] behind its own async mutex, so operations on one account
//! are serialized while different accounts proceed in parallel. Oracle calls
//! are made before the lock is taken, never while holding it.
//!
//! A removed account's book is flagged under its lock before it leaves the
//! map, so operations already queued on that lock fail with `NotFound`
//! instead of writing the account back.
//!
//! Multi-record changes are written in a fixed order (debit then position on
//! open, position then credit on close). Changes are applied to a copy and
//! only committed to the book once the store accepted them, so the book always
//! mirrors what was persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Store;
use crate::error::{TerminalError, TerminalResult};
use crate::ledger::{self, Allocation, Ledger, Settlement};
use crate::models::{Account, Position, Role, Side};
use crate::notify::{report, Notifier, Severity};
use crate::oracle::{PriceOracle, Quote};

use super::{OpenOrder, PositionManager, TerminalConfig};

/// An account with its positions.
#[derive(Debug, Clone)]
pub struct AccountBook {
    pub account: Account,
    pub positions: Vec<Position>,
    removed: bool,
}

impl AccountBook {
    fn new(account: Account, positions: Vec<Position>) -> Self {
        Self {
            account,
            positions,
            removed: false,
        }
    }
}

/// Result of closing a position.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: Decimal,
    pub settlement: Settlement,
}

/// Roster line shown to brokers.
#[derive(Debug, Clone, Serialize)]
pub struct RosterEntry {
    pub account: Account,
    pub online: bool,
    pub open_positions: usize,
}

/// An open position valued at a market price.
#[derive(Debug, Clone, Serialize)]
pub struct PositionValuation {
    pub position: Position,
    pub price: Decimal,
    /// False when no quote was available and the entry price was used
    pub priced: bool,
    pub unrealized_pnl: Decimal,
}

/// Portfolio of one account.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub account: Account,
    pub open: Vec<PositionValuation>,
    pub open_notional: Decimal,
    pub total_unrealized: Decimal,
}

/// Owns every account book.
pub struct TradingDesk {
    config: TerminalConfig,
    manager: PositionManager,
    oracle: Arc<dyn PriceOracle>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    books: RwLock<HashMap<Uuid, Arc<Mutex<AccountBook>>>>,
}

impl TradingDesk {
    pub fn new(
        config: &TerminalConfig,
        oracle: Arc<dyn PriceOracle>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config: config.clone(),
            manager: PositionManager::new(config),
            oracle,
            store,
            notifier,
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Load every account and its positions from the store.
    pub async fn load(&self) -> TerminalResult<usize> {
        let accounts = self.store.load_accounts().await?;
        let mut books = HashMap::with_capacity(accounts.len());

        for account in accounts {
            let positions = self.store.load_positions(account.id).await?;
            books.insert(
                account.id,
                Arc::new(Mutex::new(AccountBook::new(account, positions))),
            );
        }

        let count = books.len();
        *self.books.write().await = books;
        debug!(accounts = count, "Loaded account books");
        Ok(count)
    }

    pub(crate) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    async fn book(&self, account_id: Uuid) -> TerminalResult<Arc<Mutex<AccountBook>>> {
        self.books
            .read()
            .await
            .get(&account_id)
            .cloned()
            .ok_or_else(|| TerminalError::not_found("account", account_id))
    }

    /// Lock the book of a live account.
    async fn lock_book(&self, account_id: Uuid) -> TerminalResult<OwnedMutexGuard<AccountBook>> {
        let book = self.book(account_id).await?.lock_owned().await;
        if book.removed {
            return Err(TerminalError::not_found("account", account_id));
        }
        Ok(book)
    }

    /// Snapshot of one account.
    pub async fn account(&self, account_id: Uuid) -> TerminalResult<Account> {
        let book = self.lock_book(account_id).await?;
        Ok(book.account.clone())
    }

    /// Snapshot of every account, oldest first.
    pub async fn accounts(&self) -> Vec<Account> {
        let books: Vec<_> = self.books.read().await.values().cloned().collect();
        let mut accounts = Vec::with_capacity(books.len());
        for book in books {
            let book = book.lock().await;
            if !book.removed {
                accounts.push(book.account.clone());
            }
        }
        accounts.sort_by_key(|a| a.created_at);
        accounts
    }

    /// Create an account with a zero balance.
    pub async fn register(&self, name: &str, role: Role) -> TerminalResult<Account> {
        let result = self.register_inner(name, role).await;
        let account = report(self.notifier(), "Register", result)?;
        self.notifier.notify(
            Severity::Success,
            &format!("Registered {} as {}", account.display_name(), account.role),
        );
        Ok(account)
    }

    async fn register_inner(&self, name: &str, role: Role) -> TerminalResult<Account> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TerminalError::invalid("name is required"));
        }

        let account = Account::new(name, role);
        self.store.upsert_account(&account).await?;
        self.books.write().await.insert(
            account.id,
            Arc::new(Mutex::new(AccountBook::new(account.clone(), Vec::new()))),
        );

        info!(account = %account.id, name = %account.name, role = %role, "Account registered");
        Ok(account)
    }

    /// Record that a session bound to `account_id` is alive.
    pub async fn heartbeat(&self, account_id: Uuid, now: DateTime<Utc>) -> TerminalResult<()> {
        let mut book = self.lock_book(account_id).await?;

        let mut account = book.account.clone();
        account.touch(now);
        self.store.upsert_account(&account).await?;
        book.account = account;
        Ok(())
    }

    /// Every account with its online flag, as seen by a broker.
    pub async fn roster(&self, now: DateTime<Utc>) -> Vec<RosterEntry> {
        let window = self.config.online_window();
        let books: Vec<_> = self.books.read().await.values().cloned().collect();

        let mut roster = Vec::with_capacity(books.len());
        for book in books {
            let book = book.lock().await;
            if book.removed {
                continue;
            }
            roster.push(RosterEntry {
                online: book.account.is_online(now, window),
                open_positions: book.positions.iter().filter(|p| p.is_open()).count(),
                account: book.account.clone(),
            });
        }
        roster.sort_by_key(|e| e.account.created_at);
        roster
    }

    /// Broker allocation of capital plus bonus to `account_id`.
    pub async fn allocate(
        &self,
        broker_id: Uuid,
        account_id: Uuid,
        base_amount: Decimal,
        bonus_percent: Decimal,
    ) -> TerminalResult<Allocation> {
        let result = self
            .allocate_inner(broker_id, account_id, base_amount, bonus_percent)
            .await;
        let allocation = report(self.notifier(), "Allocate", result)?;
        self.notifier.notify(
            Severity::Success,
            &format!(
                "Allocated {} (+{}% bonus = {}), new balance {}",
                allocation.base_amount,
                allocation.bonus_percent,
                allocation.bonus_amount,
                allocation.new_balance
            ),
        );
        Ok(allocation)
    }

    async fn allocate_inner(
        &self,
        broker_id: Uuid,
        account_id: Uuid,
        base_amount: Decimal,
        bonus_percent: Decimal,
    ) -> TerminalResult<Allocation> {
        let actor = self.account(broker_id).await?.role;
        let mut book = self.lock_book(account_id).await?;

        let mut account = book.account.clone();
        let allocation = Ledger::allocate(actor, &mut account, base_amount, bonus_percent)?;
        self.store.upsert_account(&account).await?;
        book.account = account;

        info!(
            broker = %broker_id,
            account = %account_id,
            base = %allocation.base_amount,
            bonus = %allocation.bonus_amount,
            balance = %allocation.new_balance,
            "Capital allocated"
        );
        Ok(allocation)
    }

    /// Add funds to an account's balance.
    pub async fn deposit(&self, account_id: Uuid, amount: Decimal) -> TerminalResult<Decimal> {
        let result = self.deposit_inner(account_id, amount).await;
        let balance = report(self.notifier(), "Deposit", result)?;
        self.notifier.notify(
            Severity::Success,
            &format!("Deposited {}, new balance {}", amount, balance),
        );
        Ok(balance)
    }

    async fn deposit_inner(&self, account_id: Uuid, amount: Decimal) -> TerminalResult<Decimal> {
        let mut book = self.lock_book(account_id).await?;

        let mut account = book.account.clone();
        let balance = Ledger::credit(&mut account, amount)?;
        self.store.upsert_account(&account).await?;
        book.account = account;

        info!(account = %account_id, amount = %amount, balance = %balance, "Deposit");
        Ok(balance)
    }

    /// Current quote for `symbol`.
    pub async fn quote(&self, symbol: &str) -> TerminalResult<Quote> {
        let result = self.fetch_quote(symbol).await;
        report(self.notifier(), "Quote", result)
    }

    pub(crate) async fn fetch_quote(&self, symbol: &str) -> TerminalResult<Quote> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(TerminalError::invalid("symbol is required"));
        }
        self.oracle.fetch_price(symbol).await
    }

    /// Manual trade sized at a fixed fraction of the balance.
    pub async fn open_trade(
        &self,
        account_id: Uuid,
        symbol: &str,
        side: Side,
    ) -> TerminalResult<Position> {
        let result = self.open_trade_inner(account_id, symbol, side).await;
        let position = report(self.notifier(), "Open trade", result)?;
        self.notifier.notify(
            Severity::Success,
            &format!(
                "Opened {} {} {} @ {}",
                position.side, position.quantity, position.symbol, position.entry_price
            ),
        );
        Ok(position)
    }

    async fn open_trade_inner(
        &self,
        account_id: Uuid,
        symbol: &str,
        side: Side,
    ) -> TerminalResult<Position> {
        let account = self.account(account_id).await?;
        if account.balance <= Decimal::ZERO {
            return Err(TerminalError::InsufficientFunds {
                needed: Decimal::ZERO,
                available: account.balance,
            });
        }

        let quote = self.fetch_quote(symbol).await?;
        let order = OpenOrder {
            symbol: quote.symbol.clone(),
            side,
            price: quote.price,
            signal_id: None,
        };

        let manager = &self.manager;
        self.execute_open(account_id, &order, |balance| {
            manager.manual_quantity(balance, order.price)
        })
        .await
    }

    /// Open a position under the account lock.
    ///
    /// `size` receives the balance at mutation time and returns the quantity.
    /// The debit is persisted before the position; if the position write fails
    /// the debit stays and a partial commit is reported.
    pub(crate) async fn execute_open<F>(
        &self,
        account_id: Uuid,
        order: &OpenOrder,
        size: F,
    ) -> TerminalResult<Position>
    where
        F: FnOnce(Decimal) -> TerminalResult<Decimal>,
    {
        let mut book = self.lock_book(account_id).await?;

        let quantity = size(book.account.balance)?;
        let position = self.manager.open(account_id, order, quantity, Utc::now())?;
        let cost = ledger::notional(quantity, order.price)?;

        let mut account = book.account.clone();
        Ledger::debit(&mut account, cost)?;
        self.store.upsert_account(&account).await?;
        book.account = account;

        if let Err(e) = self.store.insert_position(&position).await {
            warn!(account = %account_id, cost = %cost, error = %e, "Debit stored without position");
            return Err(TerminalError::PartialCommit {
                committed: "account debit",
                failed: "position insert",
                reason: e.to_string(),
            });
        }
        book.positions.push(position.clone());

        info!(
            account = %account_id,
            position = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            price = %position.entry_price,
            copied = position.is_copied,
            balance = %book.account.balance,
            "Position opened"
        );
        Ok(position)
    }

    /// Close an open position at the current oracle price.
    pub async fn close_trade(
        &self,
        account_id: Uuid,
        position_id: Uuid,
    ) -> TerminalResult<ClosedTrade> {
        let result = self.close_trade_inner(account_id, position_id).await;
        let closed = report(self.notifier(), "Close trade", result)?;
        self.notifier.notify(
            Severity::Success,
            &format!(
                "Closed {} {} @ {}, P&L {}",
                closed.position.quantity,
                closed.position.symbol,
                closed.exit_price,
                closed.settlement.booked_pnl
            ),
        );
        Ok(closed)
    }

    async fn close_trade_inner(
        &self,
        account_id: Uuid,
        position_id: Uuid,
    ) -> TerminalResult<ClosedTrade> {
        let symbol = {
            let book = self.lock_book(account_id).await?;
            let position = find_position(&book, position_id)?;
            if !position.is_open() {
                return Err(TerminalError::AlreadyClosed(position_id));
            }
            position.symbol.clone()
        };

        let exit_price = self.fetch_quote(&symbol).await?.price;

        let mut book = self.lock_book(account_id).await?;
        // Re-check: a concurrent close may have won while we were quoting
        let mut position = find_position(&book, position_id)?.clone();
        let pnl = self.manager.close(&mut position, exit_price, Utc::now())?;

        let mut account = book.account.clone();
        let settlement = Ledger::settle_close(&mut account, position.notional()?, pnl)?;
        position.realized_pnl = Some(settlement.booked_pnl);

        self.store.close_position(&position).await?;
        if let Some(slot) = book.positions.iter_mut().find(|p| p.id == position_id) {
            *slot = position.clone();
        }

        if let Err(e) = self.store.upsert_account(&account).await {
            warn!(account = %account_id, position = %position_id, error = %e, "Close stored without credit");
            return Err(TerminalError::PartialCommit {
                committed: "position close",
                failed: "account credit",
                reason: e.to_string(),
            });
        }
        book.account = account;

        info!(
            account = %account_id,
            position = %position_id,
            exit = %exit_price,
            pnl = %settlement.booked_pnl,
            balance = %settlement.new_balance,
            "Position closed"
        );
        Ok(ClosedTrade {
            position,
            exit_price,
            settlement,
        })
    }

    /// Positions of an account, oldest first.
    pub async fn positions(&self, account_id: Uuid, open_only: bool) -> TerminalResult<Vec<Position>> {
        let book = self.lock_book(account_id).await?;
        Ok(book
            .positions
            .iter()
            .filter(|p| !open_only || p.is_open())
            .cloned()
            .collect())
    }

    /// Portfolio valued at fresh quotes, fetched concurrently per symbol.
    ///
    /// Symbols without a quote are valued at entry price.
    pub async fn portfolio(&self, account_id: Uuid) -> TerminalResult<PortfolioView> {
        let symbols: HashSet<String> = self
            .positions(account_id, true)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect();

        let quotes = join_all(symbols.iter().map(|s| self.oracle.fetch_price(s))).await;
        let mut prices = HashMap::new();
        for (symbol, quote) in symbols.iter().zip(quotes) {
            match quote {
                Ok(q) => {
                    prices.insert(symbol.clone(), q.price);
                }
                Err(e) => debug!(symbol = %symbol, error = %e, "No quote, valuing at entry"),
            }
        }

        self.portfolio_at(account_id, &prices).await
    }

    /// Portfolio valued at the given prices.
    pub async fn portfolio_at(
        &self,
        account_id: Uuid,
        prices: &HashMap<String, Decimal>,
    ) -> TerminalResult<PortfolioView> {
        let book = self.lock_book(account_id).await?;

        let open = book
            .positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| -> TerminalResult<PositionValuation> {
                let quoted = prices.get(&p.symbol).copied();
                let price = quoted.unwrap_or(p.entry_price);
                Ok(PositionValuation {
                    position: p.clone(),
                    price,
                    priced: quoted.is_some(),
                    unrealized_pnl: ledger::mark_to_market(p, price)?,
                })
            })
            .collect::<TerminalResult<Vec<_>>>()?;

        let open_notional = open.iter().try_fold(Decimal::ZERO, |total, v| -> TerminalResult<_> {
            total
                .checked_add(v.position.notional()?)
                .ok_or_else(TerminalError::out_of_range)
        })?;

        Ok(PortfolioView {
            account: book.account.clone(),
            open_notional,
            total_unrealized: ledger::total_unrealized(&book.positions, prices)?,
            open,
        })
    }

    /// Broker removal of a trader and all of their positions.
    pub async fn remove_account(&self, broker_id: Uuid, account_id: Uuid) -> TerminalResult<Account> {
        let result = self.remove_account_inner(broker_id, account_id).await;
        let account = report(self.notifier(), "Remove account", result)?;
        self.notifier.notify(
            Severity::Success,
            &format!("Removed {}", account.display_name()),
        );
        Ok(account)
    }

    async fn remove_account_inner(
        &self,
        broker_id: Uuid,
        account_id: Uuid,
    ) -> TerminalResult<Account> {
        if !self.account(broker_id).await?.is_broker() {
            return Err(TerminalError::PermissionDenied(
                "only brokers can remove accounts".to_string(),
            ));
        }

        let mut book = self.lock_book(account_id).await?;
        if book.account.is_broker() {
            return Err(TerminalError::invalid("broker accounts cannot be removed"));
        }

        self.store.delete_account(account_id).await?;
        book.removed = true;
        self.books.write().await.remove(&account_id);

        info!(
            broker = %broker_id,
            account = %account_id,
            positions = book.positions.len(),
            "Account removed"
        );
        Ok(book.account.clone())
    }
}

fn find_position(book: &AccountBook, position_id: Uuid) -> TerminalResult<&Position> {
    book.positions
        .iter()
        .find(|p| p.id == position_id)
        .ok_or_else(|| TerminalError::not_found("position", position_id))
}
