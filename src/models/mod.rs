//! Data models for accounts, positions, and broker signals.

mod account;
mod position;
mod signal;

pub use account::{Account, Role};
pub use position::{Position, PositionStatus, Side};
pub use signal::{Signal, SignalState, DEFAULT_SIGNAL_TTL_MINUTES};
