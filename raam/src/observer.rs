//! The capability interface readers notify about per-index outcomes.

use raam_spec::RaamError;

/// A bundle that failed to parse while searching an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBundle {
    /// The bundle identifier.
    pub bundle: String,
    /// Why the bundle was skipped.
    pub reason: RaamError,
}

/// Everything known about one index after a fetch or a subscription
/// delivery.
#[derive(Debug, Clone, Default)]
pub struct RecordEvent {
    /// The channel index, when known.
    pub index: Option<u64>,
    /// The authenticated message, when one was found.
    pub message: Option<String>,
    /// The branch root the message carries, if any.
    pub next_root: Option<String>,
    /// The channel root the message authenticated against (or, in public
    /// mode, the root recovered from the Merkle path).
    pub channel_root: Option<String>,
    /// Bundles at the address that failed to parse.
    pub skipped: Vec<SkippedBundle>,
    /// The per-index verification error, if the winning bundle failed.
    pub error: Option<RaamError>,
}

/// Observer of fetch and subscription outcomes, one callback per index.
pub trait ReadObserver: Send + Sync {
    /// Called once per processed index or public address.
    fn on_record(&self, event: &RecordEvent);
}
