//! Ledger and push-stream client interfaces plus in-process implementations
//! used by tests and single-node deployments.
#![deny(missing_docs)]

use async_trait::async_trait;
use tokio::sync::broadcast;

use raam_spec::{Record, RecordDraft};

mod memory;
mod subscription;

pub use memory::MemoryTangle;
pub use subscription::{BundleHandler, SubscriptionHandle, SubscriptionManager};

/// Result alias for ledger and push-stream client operations.
pub type ClientResult<T> = Result<T, anyhow::Error>;

/// The ledger RPC surface RAAM depends on. Implementations talk to a real
/// node; [`MemoryTangle`] provides the in-process variant.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Bundle identifiers attached at an address, earliest first.
    async fn find_by_address(&self, address: &str) -> ClientResult<Vec<String>>;

    /// All records belonging to the given bundles.
    async fn get_records(&self, bundles: &[String]) -> ClientResult<Vec<Record>>;

    /// Attach a bundle of record drafts; `depth` and `mwm` parameterize the
    /// proof of work and are opaque to RAAM.
    async fn submit(&self, drafts: Vec<RecordDraft>, depth: u8, mwm: u8)
        -> ClientResult<Vec<Record>>;
}

/// A push stream of raw record arrivals, one subscription per connection.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Open a connection to `url` and stream every attached record.
    async fn open(&self, url: &str) -> ClientResult<broadcast::Receiver<Record>>;
}
