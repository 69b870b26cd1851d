//! Notification sink: operator-facing success and failure messages.

use std::fmt;

use tracing::{error, info, warn};

use crate::error::{ErrorKind, TerminalError};

/// Severity of an operator message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Severity used when reporting `err`. Retryable and user errors are warnings.
    pub fn for_error(err: &TerminalError) -> Self {
        match err.kind() {
            ErrorKind::PersistenceFailure => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// Accepts `(severity, message)` pairs.
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str);
}

/// Forward a failed `result` to `notifier` and hand it back unchanged.
pub fn report<T>(
    notifier: &dyn Notifier,
    action: &str,
    result: Result<T, TerminalError>,
) -> Result<T, TerminalError> {
    if let Err(e) = &result {
        notifier.notify(Severity::for_error(e), &format!("{} failed: {}", action, e));
    }
    result
}

/// Writes notifications to the tracing subscriber.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info | Severity::Success => info!(severity = %severity, "{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
    }
}
