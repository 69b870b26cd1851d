//! Error types for ledger, position and signal operations.
//!
//! Every variant is scoped to a single operation: nothing here is fatal to the
//! process. Validation and state-conflict errors are raised before any mutation.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Coarse classification of a [`TerminalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    InsufficientFunds,
    BalanceTooLow,
    AlreadyClosed,
    NotFound,
    PermissionDenied,
    OracleUnavailable,
    PersistenceFailure,
}

/// Terminal operation errors.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Balance too low: {balance} cannot cover one unit at {price}")]
    BalanceTooLow { balance: Decimal, price: Decimal },

    #[error("Position {0} is already closed")]
    AlreadyClosed(Uuid),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Price unavailable for {symbol}: {reason}")]
    OracleUnavailable { symbol: String, reason: String },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The first write of a two-step sequence was stored but the second was not.
    #[error("Inconsistent state: {committed} was stored but {failed} failed: {reason}")]
    PartialCommit {
        committed: &'static str,
        failed: &'static str,
        reason: String,
    },
}

impl TerminalError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Arithmetic result outside the representable range.
    pub fn out_of_range() -> Self {
        Self::invalid("amount out of range")
    }

    pub fn oracle(symbol: &str, reason: impl ToString) -> Self {
        Self::OracleUnavailable {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::BalanceTooLow { .. } => ErrorKind::BalanceTooLow,
            Self::AlreadyClosed(_) => ErrorKind::AlreadyClosed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::OracleUnavailable { .. } => ErrorKind::OracleUnavailable,
            Self::Persistence(_) | Self::PartialCommit { .. } => ErrorKind::PersistenceFailure,
        }
    }

    /// Only oracle failures are worth retrying; persistence failures are surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::OracleUnavailable
    }
}

impl From<sqlx::Error> for TerminalError {
    fn from(e: sqlx::Error) -> Self {
        TerminalError::Persistence(e.to_string())
    }
}

/// Result alias for terminal operations.
pub type TerminalResult<T> = Result<T, TerminalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_display() {
        let err = TerminalError::InsufficientFunds {
            needed: dec!(1000),
            available: dec!(550),
        };
        assert_eq!(err.to_string(), "Insufficient funds: need 1000, have 550");

        let err = TerminalError::not_found("account", "abc");
        assert_eq!(err.to_string(), "account not found: abc");
    }

    #[test]
    fn test_kinds_and_retry() {
        assert!(TerminalError::oracle("AAPL", "timeout").is_retryable());
        assert!(!TerminalError::Persistence("disk full".into()).is_retryable());

        let partial = TerminalError::PartialCommit {
            committed: "balance debit",
            failed: "position insert",
            reason: "locked".into(),
        };
        assert_eq!(partial.kind(), ErrorKind::PersistenceFailure);
        assert!(!partial.is_retryable());
    }
}
