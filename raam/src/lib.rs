//! Random Access Authenticated Messaging: ordered, authenticated,
//! O(1)-random-access message channels on a content-addressed ternary
//! ledger. A publisher commits to `2^height` one-time keys through a single
//! Merkle root; readers fetch any index directly by its derived address.
#![deny(missing_docs)]

pub mod keyfile;
mod observer;
mod publisher;
mod reader;

pub use observer::{ReadObserver, RecordEvent, SkippedBundle};
pub use publisher::{PreparedMessage, PublishOptions, PublishedMessage, Publisher};
pub use reader::{
    fetch_public, fetch_public_messages, fetch_range, fetch_single, FetchOptions, FetchResult,
    Reader, ReaderOptions, ReaderSubscription, SingleOptions, SubscribeOptions,
};

pub use raam_client::{
    BundleHandler, LedgerClient, MemoryTangle, StreamClient, SubscriptionHandle,
    SubscriptionManager,
};
pub use raam_crypto::{create_tree, MerkleTree, ProgressHook, TreeProgress};
pub use raam_spec::{ChannelParams, RaamError, Record, RecordDraft};

use rand_core::{OsRng, RngCore};

/// Generate a random 81-tryte channel seed from the operating system RNG.
pub fn random_seed() -> String {
    let alphabet = raam_ternary::TRYTE_ALPHABET.as_bytes();
    let mut seed = String::with_capacity(raam_spec::SEED_TRYTES);
    while seed.len() < raam_spec::SEED_TRYTES {
        // Rejection-sample to keep the distribution uniform over 27 symbols.
        let sample = (OsRng.next_u32() & 0x1f) as usize;
        if sample < alphabet.len() {
            seed.push(alphabet[sample] as char);
        }
    }
    seed
}
