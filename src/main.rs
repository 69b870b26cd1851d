//! Brokerage Trading Terminal
//!
//! Brokers allocate virtual capital and broadcast time-limited trade signals;
//! traders open positions manually or copy signals, valued against a live
//! or simulated price feed.

mod db;
mod error;
mod ledger;
mod models;
mod notify;
mod oracle;
mod session;
mod signals;
mod terminal;
mod trading;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use crate::db::Database;
use crate::models::{Role, Side, SignalState};
use crate::notify::TracingNotifier;
use crate::oracle::{HttpOracle, PriceOracle, SimulatedOracle, TimedOracle};
use crate::session::Session;
use crate::signals::{SignalDraft, ViewerKey, DEFAULT_SCOPE};
use crate::terminal::Terminal;
use crate::trading::TerminalConfig;

/// Brokerage trading terminal CLI.
#[derive(Parser)]
#[command(name = "terminal")]
#[command(about = "Virtual brokerage: capital allocation, signals and copy trading", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(
        short,
        long,
        env = "TERMINAL_DATABASE_URL",
        default_value = "sqlite:./terminal.db?mode=rwc"
    )]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Quote endpoint; the simulated feed is used when unset
    #[arg(long, env = "TERMINAL_ORACLE_URL")]
    oracle_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new account with a zero balance
    Register {
        name: String,

        /// broker or trader
        #[arg(short, long, default_value = "trader")]
        role: Role,
    },

    /// Allocate capital plus an optional bonus (brokers only)
    Allocate {
        /// Allocating broker's account id
        #[arg(long)]
        broker: Uuid,

        /// Receiving account id
        account: Uuid,

        amount: Decimal,

        /// Bonus percent on top of the amount
        #[arg(long, default_value = "0")]
        bonus: Decimal,
    },

    /// Add funds to an account
    Deposit { account: Uuid, amount: Decimal },

    /// Open a manual trade sized at a fraction of the balance
    Trade {
        account: Uuid,
        symbol: String,

        /// long or short
        side: Side,
    },

    /// Close an open position at the current price
    Close { account: Uuid, position: Uuid },

    /// Copy a broker signal
    Follow { account: Uuid, signal: Uuid },

    /// Show positions and unrealized P&L
    Positions {
        account: Uuid,

        /// Include closed positions
        #[arg(short, long)]
        all: bool,
    },

    /// Broadcast a trade signal (brokers only)
    Signal {
        broker: Uuid,
        symbol: String,
        side: Side,
        quantity: Decimal,

        #[arg(short, long, default_value = "")]
        rationale: String,

        /// Minutes until expiry
        #[arg(short, long)]
        minutes: Option<i64>,
    },

    /// List signals: active ones for a viewer, or the full history
    Signals {
        /// Show what this account currently sees
        #[arg(long)]
        viewer: Option<Uuid>,

        /// Only signals issued by this broker
        #[arg(long)]
        broker: Option<Uuid>,

        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },

    /// Hide a signal from one viewer's dashboard
    Dismiss {
        account: Uuid,
        signal: Uuid,

        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },

    /// Delete a signal for everyone (issuing broker only)
    DeleteSignal { broker: Uuid, signal: Uuid },

    /// Show all accounts with balances and online status
    Roster { broker: Uuid },

    /// Remove a trader and their positions (brokers only)
    RemoveAccount { broker: Uuid, account: Uuid },

    /// List symbols of the simulated feed
    Symbols,

    /// Fetch a quote
    Quote { symbol: String },

    /// Run a live session until Ctrl+C
    Watch {
        account: Uuid,

        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,

        /// Seconds between dashboard prints
        #[arg(short, long, default_value = "10")]
        interval: u64,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TerminalConfig::default();

    match cli.command {
        Commands::Config => {
            print_config(&config);
            return Ok(());
        }
        Commands::Symbols => {
            let feed = SimulatedOracle::new(Duration::ZERO);
            println!("\n{:<10} {:>12}", "SYMBOL", "BASE");
            println!("{}", "-".repeat(23));
            for symbol in feed.symbols() {
                println!("{:<10} {:>12.2}", symbol, feed.base_price(&symbol));
            }
            return Ok(());
        }
        _ => {}
    }

    let db = Database::new(&cli.database)
        .await
        .with_context(|| format!("opening database {}", cli.database))?;
    let oracle = build_oracle(cli.oracle_url.as_deref(), &config)?;
    let terminal = Arc::new(
        Terminal::open(config, Arc::new(db), oracle, Arc::new(TracingNotifier))
            .await
            .context("loading terminal state")?,
    );

    match cli.command {
        Commands::Register { name, role } => {
            let account = terminal.desk.register(&name, role).await?;
            println!("Registered {} ({})", account.display_name(), account.role);
            println!("Account id: {}", account.id);
        }

        Commands::Allocate {
            broker,
            account,
            amount,
            bonus,
        } => {
            let alloc = terminal.desk.allocate(broker, account, amount, bonus).await?;
            println!("Base:        {:.2}", alloc.base_amount);
            println!("Bonus:       {:.2} ({}%)", alloc.bonus_amount, alloc.bonus_percent);
            println!("New balance: {:.2}", alloc.new_balance);
        }

        Commands::Deposit { account, amount } => {
            let balance = terminal.desk.deposit(account, amount).await?;
            println!("New balance: {:.2}", balance);
        }

        Commands::Trade {
            account,
            symbol,
            side,
        } => {
            let pos = terminal.desk.open_trade(account, &symbol, side).await?;
            println!(
                "Opened {} {} {} @ {:.2} (notional {:.2})",
                pos.side,
                pos.quantity,
                pos.symbol,
                pos.entry_price,
                pos.notional()?
            );
            println!("Position id: {}", pos.id);
        }

        Commands::Close { account, position } => {
            let closed = terminal.desk.close_trade(account, position).await?;
            println!(
                "Closed {} {} @ {:.2}: P&L {:.2}, balance {:.2}",
                closed.position.quantity,
                closed.position.symbol,
                closed.exit_price,
                closed.settlement.booked_pnl,
                closed.settlement.new_balance
            );
        }

        Commands::Follow { account, signal } => {
            let fill = terminal.copier.follow(account, signal, Utc::now()).await?;
            if fill.resized {
                println!(
                    "Signal suggested {}, adjusted to {} to fit balance",
                    fill.suggested_quantity, fill.position.quantity
                );
            }
            println!(
                "Copied {} {} {} @ {:.2}",
                fill.position.side,
                fill.position.quantity,
                fill.position.symbol,
                fill.position.entry_price
            );
            println!("Position id: {}", fill.position.id);
        }

        Commands::Positions { account, all } => {
            let view = terminal.desk.portfolio(account).await?;
            println!("\n=== {} ===", view.account.display_name());
            println!("Balance:        {:.2}", view.account.balance);
            println!("Open notional:  {:.2}", view.open_notional);
            println!("Unrealized P&L: {:.2}", view.total_unrealized);
            println!("Realized P&L:   {:.2}", view.account.realized_pnl);

            println!(
                "\n{:<34} {:<8} {:<5} {:>8} {:>10} {:>10} {:>10} {:>7}",
                "ID", "SYMBOL", "SIDE", "QTY", "ENTRY", "PRICE", "P&L", "RET%"
            );
            println!("{}", "-".repeat(99));
            for v in &view.open {
                let return_pct = v.position.return_pct(v.price)?;
                println!(
                    "{:<34} {:<8} {:<5} {:>8} {:>10.2} {:>10.2} {:>10.2} {:>7.2}",
                    v.position.id.simple(),
                    truncate(&v.position.symbol, 8),
                    v.position.side,
                    v.position.quantity,
                    v.position.entry_price,
                    v.price,
                    v.unrealized_pnl,
                    return_pct.saturating_mul(Decimal::ONE_HUNDRED)
                );
            }

            if all {
                let closed: Vec<_> = terminal
                    .desk
                    .positions(account, false)
                    .await?
                    .into_iter()
                    .filter(|p| !p.is_open())
                    .collect();
                println!("\n--- Closed ({}) ---", closed.len());
                for p in closed {
                    println!(
                        "{:<34} {:<8} {:<5} {:>8} {:>10.2} {:>10.2} {:>10.2}",
                        p.id.simple(),
                        truncate(&p.symbol, 8),
                        p.side,
                        p.quantity,
                        p.entry_price,
                        p.exit_price.unwrap_or_default(),
                        p.realized_pnl.unwrap_or_default()
                    );
                }
            }
        }

        Commands::Signal {
            broker,
            symbol,
            side,
            quantity,
            rationale,
            minutes,
        } => {
            let issuer = terminal.desk.account(broker).await?;
            let draft = SignalDraft {
                symbol,
                side,
                quantity,
                rationale,
                duration_minutes: minutes,
            };
            let signal = terminal.signals.broadcast(&issuer, draft, Utc::now()).await?;
            println!(
                "Broadcast {} {} x{} @ {:.2}, expires {}",
                signal.side,
                signal.symbol,
                signal.quantity,
                signal.reference_price,
                signal
                    .effective_expiry(terminal.signals.ttl())
                    .format("%H:%M:%S UTC")
            );
            println!("Signal id: {}", signal.id);
        }

        Commands::Signals {
            viewer,
            broker,
            scope,
        } => {
            let now = Utc::now();
            let signals = match (viewer, broker) {
                (Some(account), _) => {
                    let key = ViewerKey::new(account, scope);
                    terminal
                        .signals
                        .active_for(&terminal.viewers, &key, now)
                        .await?
                }
                (None, Some(broker)) => terminal.signals.history_for(broker).await,
                (None, None) => terminal.signals.history().await,
            };

            if signals.is_empty() {
                println!("No signals.");
                return Ok(());
            }

            println!(
                "\n{:<34} {:<8} {:<5} {:>6} {:>10} {:<8} {:<24}",
                "ID", "SYMBOL", "SIDE", "QTY", "REF", "STATE", "RATIONALE"
            );
            println!("{}", "-".repeat(101));
            for s in signals {
                let state = match s.state(now, terminal.signals.ttl()) {
                    SignalState::Active => "active",
                    SignalState::Expired => "expired",
                };
                println!(
                    "{:<34} {:<8} {:<5} {:>6} {:>10.2} {:<8} {:<24}",
                    s.id.simple(),
                    truncate(&s.symbol, 8),
                    s.side,
                    s.quantity,
                    s.reference_price,
                    state,
                    truncate(&s.rationale, 24)
                );
            }
        }

        Commands::Dismiss {
            account,
            signal,
            scope,
        } => {
            let key = ViewerKey::new(account, scope);
            let newly = terminal
                .signals
                .dismiss(&terminal.viewers, &key, signal)
                .await?;
            if newly {
                println!("Signal dismissed.");
            } else {
                println!("Signal was already dismissed.");
            }
        }

        Commands::DeleteSignal { broker, signal } => {
            let issuer = terminal.desk.account(broker).await?;
            terminal.signals.delete(&issuer, signal).await?;
            println!("Signal {} deleted.", signal);
        }

        Commands::Roster { broker } => {
            if !terminal.desk.account(broker).await?.is_broker() {
                anyhow::bail!("only brokers can view the roster");
            }

            let roster = terminal.desk.roster(Utc::now()).await;
            println!(
                "\n{:<38} {:<20} {:<7} {:>12} {:>5} {:<7}",
                "ID", "NAME", "ROLE", "BALANCE", "OPEN", "STATUS"
            );
            println!("{}", "-".repeat(94));
            for entry in roster {
                println!(
                    "{:<38} {:<20} {:<7} {:>12.2} {:>5} {:<7}",
                    entry.account.id,
                    truncate(&entry.account.display_name(), 20),
                    entry.account.role,
                    entry.account.balance,
                    entry.open_positions,
                    if entry.online { "online" } else { "offline" }
                );
            }
        }

        Commands::RemoveAccount { broker, account } => {
            let removed = terminal.remove_account(broker, account).await?;
            println!("Removed {} and all of their positions.", removed.display_name());
        }

        Commands::Quote { symbol } => {
            let quote = terminal.desk.quote(&symbol).await?;
            println!(
                "{} {:.2} ({:+.2}%) at {}",
                quote.symbol,
                quote.price,
                quote.change,
                quote.timestamp.format("%H:%M:%S UTC")
            );
        }

        Commands::Watch {
            account,
            scope,
            interval,
        } => {
            let key = ViewerKey::new(account, scope);
            terminal.desk.account(account).await?;

            info!(viewer = %key, "Starting session");
            println!("\nWatching {}. Press Ctrl+C to stop.\n", key);

            let session = Session::start(terminal.clone(), key);
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

            loop {
                tokio::select! {
                    _ = ticker.tick() => println!("{}", session.snapshot().await),
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }

            session.cancel().await;
        }

        Commands::Config | Commands::Symbols => {}
    }

    Ok(())
}

/// Oracle used by the terminal: HTTP when a URL is configured, simulated otherwise.
fn build_oracle(url: Option<&str>, config: &TerminalConfig) -> Result<Arc<dyn PriceOracle>> {
    let inner: Arc<dyn PriceOracle> = match url {
        Some(url) => {
            info!(url = %url, "Using HTTP quote feed");
            Arc::new(HttpOracle::new(url, config.oracle_timeout())?)
        }
        None => Arc::new(SimulatedOracle::new(config.simulated_latency())),
    };
    Ok(Arc::new(TimedOracle::new(inner, config.oracle_timeout())))
}

fn print_config(config: &TerminalConfig) {
    println!("\n=== Terminal Configuration ===\n");
    println!("Sizing:");
    println!(
        "  Manual Position:      {}% of balance",
        config.manual_position_fraction * Decimal::ONE_HUNDRED
    );
    println!(
        "  Copy Headroom:        {}% of balance",
        config.copy_headroom_fraction * Decimal::ONE_HUNDRED
    );

    println!("\nSignals:");
    println!("  Default Lifetime:     {}m", config.signal_ttl_minutes);
    println!("  Expiry Sweep:         {}s", config.signal_sweep_secs);

    println!("\nSession:");
    println!("  Heartbeat:            {}s", config.heartbeat_secs);
    println!("  Online Window:        {}s", config.online_window_secs);
    println!("  Price Refresh:        {}s", config.price_poll_secs);
    println!("  Account Refresh:      {}s", config.account_refresh_secs);

    println!("\nPrice Feed:");
    println!("  Call Timeout:         {}ms", config.oracle_timeout_ms);
    println!("  Simulated Latency:    {}ms", config.simulated_latency_ms);
}

/// Truncate string with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
