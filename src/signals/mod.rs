//! Broker signals and per-viewer visibility.

mod broadcaster;
mod viewer;

pub use broadcaster::{sweep, SignalBroadcaster, SignalDraft};
pub use viewer::{ViewerKey, ViewerRegistry, ViewerState, DEFAULT_SCOPE};
