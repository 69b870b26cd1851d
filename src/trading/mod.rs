//! Trading logic: configuration, position management, the desk and copy trading.

mod config;
mod copy_engine;
mod desk;
mod position_manager;

pub use config::TerminalConfig;
pub use copy_engine::{copy_quantity, CopyEngine, CopyFill};
pub use desk::{
    AccountBook, ClosedTrade, PortfolioView, PositionValuation, RosterEntry, TradingDesk,
};
pub use position_manager::{OpenOrder, PositionManager};
