//! Channel parameters, the ledger record model, validation helpers, and the
//! RAAM error taxonomy.
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

use raam_ternary::{TernaryError, HASH_LENGTH, HASH_TRYTES, TRYTE_ALPHABET};

/// Trits per one-time-signature fragment (27 sponge blocks).
pub const FRAG_TRITS: usize = 27 * HASH_LENGTH;

/// Trytes per ledger record payload; every record carries exactly this many.
pub const FRAG_TRYTES: usize = FRAG_TRITS / 3;

/// Trytes of the message index field in the framing header.
pub const INDEX_TRYTES: usize = 6;

/// Trytes of the message length field in the framing header.
pub const LENGTH_TRYTES: usize = 3;

/// Total framing header width: index, indicator, height, length.
pub const HEADER_TRYTES: usize = INDEX_TRYTES + 1 + 1 + LENGTH_TRYTES;

/// Trytes of a ledger address and of one security gram of a hash.
pub const ADDRESS_TRYTES: usize = HASH_TRYTES;

/// Trytes of a channel seed.
pub const SEED_TRYTES: usize = HASH_TRYTES;

/// Trytes of a ledger record tag.
pub const TAG_TRYTES: usize = 27;

/// Smallest channel tree height.
pub const MIN_HEIGHT: usize = 1;

/// Largest channel tree height.
pub const MAX_HEIGHT: usize = 26;

/// Smallest security multiplier.
pub const MIN_SECURITY: usize = 1;

/// Largest security multiplier.
pub const MAX_SECURITY: usize = 4;

/// Largest message length representable in the header, in trytes.
pub const MAX_MESSAGE_TRYTES: usize = 27 * 27 * 27 - 1;

/// Default proof-of-work tip-selection depth.
pub const DEFAULT_DEPTH: u8 = 3;

/// Default proof-of-work minimum weight magnitude.
pub const DEFAULT_MWM: u8 = 14;

/// Error taxonomy shared by every RAAM crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaamError {
    /// Input contains characters outside the tryte alphabet.
    #[error("message contains non-tryte characters")]
    InvalidMessage,
    /// Index outside the channel capacity.
    #[error("index {index} is outside channel capacity {capacity}")]
    InvalidIndex {
        /// The offending index.
        index: u64,
        /// The channel capacity 2^height.
        capacity: u64,
    },
    /// Height outside [1, 26].
    #[error("height {0} is outside [1, 26]")]
    InvalidHeight(usize),
    /// Security level outside [1, 4].
    #[error("security level {0} is outside [1, 4]")]
    InvalidSecurityLevel(usize),
    /// Message too long for the framing header.
    #[error("message length {0} exceeds the framing limit")]
    InvalidLength(usize),
    /// The index already holds a published message.
    #[error("index {0} was already published")]
    IndexUsed(u64),
    /// Persisted key material does not form a complete tree.
    #[error("key material does not form a complete tree")]
    IncompleteTree,
    /// Public mode requested on a password-protected channel.
    #[error("public mode is not allowed on a password-protected channel")]
    PublicNotAllowed,
    /// A bundle holds too few records for its header.
    #[error("bundle holds too few records for its header")]
    ShortMessage,
    /// The decoded header names a different index than the queried one.
    #[error("record is for index {found}, expected {expected}")]
    WrongIndex {
        /// The index the reader queried.
        expected: u64,
        /// The index the header carries.
        found: u64,
    },
    /// The decoded header disagrees with the channel height.
    #[error("record height {found} does not match channel height {expected}")]
    WrongHeight {
        /// The reader's channel height.
        expected: usize,
        /// The height the header carries.
        found: usize,
    },
    /// The decoded header disagrees with the channel security level.
    #[error("record security {found} does not match channel security {expected}")]
    WrongSecurity {
        /// The reader's channel security.
        expected: usize,
        /// The security the header carries.
        found: usize,
    },
    /// The one-time signature does not verify against the leaf key.
    #[error("signature does not verify against the leaf key")]
    VerificationFailed,
    /// The leaf key is not committed to by the channel root.
    #[error("leaf key is not authenticated by the channel root")]
    AuthenticationFailed,
    /// The subscription manager has no push-stream URL configured.
    #[error("no push-stream server URL has been set")]
    UrlNotSet,
    /// A ledger or push-stream client failure.
    #[error("ledger client failure: {0}")]
    Transport(String),
    /// A key-file storage failure.
    #[error("key storage failure: {0}")]
    Storage(String),
}

impl From<TernaryError> for RaamError {
    fn from(_: TernaryError) -> Self {
        RaamError::InvalidMessage
    }
}

/// Immutable parameters of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParams {
    /// Merkle tree height; capacity is `2^height`.
    pub height: usize,
    /// Security multiplier; hashes are `security * 243` trits wide.
    pub security: usize,
    /// Optional channel password folded into addresses and cipher keys.
    pub channel_password: Option<String>,
}

impl ChannelParams {
    /// Validate and build channel parameters without a password.
    pub fn new(height: usize, security: usize) -> Result<Self, RaamError> {
        validate_height(height)?;
        validate_security(security)?;
        Ok(Self {
            height,
            security,
            channel_password: None,
        })
    }

    /// Attach a channel password, validating its trytes.
    pub fn with_password(mut self, password: impl Into<String>) -> Result<Self, RaamError> {
        let password = password.into();
        validate_message(&password)?;
        self.channel_password = Some(password);
        Ok(self)
    }

    /// Number of one-time keys the channel commits to.
    pub fn capacity(&self) -> u64 {
        1u64 << self.height
    }

    /// Channel root width in trytes.
    pub fn root_trytes(&self) -> usize {
        self.security * ADDRESS_TRYTES
    }
}

/// One ledger record: a 2187-tryte fragment of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    /// The 81-tryte channel address the record was attached at.
    pub address: String,
    /// Bundle identifier grouping the fragments of one message.
    pub bundle: String,
    /// Position of this record within its bundle.
    pub current_index: usize,
    /// Highest record position in the bundle.
    pub last_index: usize,
    /// The 2187-tryte signature-message fragment.
    pub message: String,
    /// Advisory tag; carries the message index.
    pub tag: String,
    /// Ledger attachment timestamp.
    pub timestamp: u64,
}

/// A record prepared for submission, before the ledger assigns bundle fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordDraft {
    /// Target address.
    pub address: String,
    /// The 2187-tryte fragment.
    pub message: String,
    /// Advisory tag.
    pub tag: String,
    /// Transferred value; always zero for RAAM records.
    pub value: i64,
}

/// Check that every character belongs to the tryte alphabet.
pub fn validate_message(trytes: &str) -> Result<(), RaamError> {
    if trytes.chars().all(|c| TRYTE_ALPHABET.contains(c)) {
        Ok(())
    } else {
        Err(RaamError::InvalidMessage)
    }
}

/// Check a message length against the framing header limit.
pub fn validate_length(length: usize) -> Result<(), RaamError> {
    if length > MAX_MESSAGE_TRYTES {
        return Err(RaamError::InvalidLength(length));
    }
    Ok(())
}

/// Check a tree height.
pub fn validate_height(height: usize) -> Result<(), RaamError> {
    if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&height) {
        return Err(RaamError::InvalidHeight(height));
    }
    Ok(())
}

/// Check a security multiplier.
pub fn validate_security(security: usize) -> Result<(), RaamError> {
    if !(MIN_SECURITY..=MAX_SECURITY).contains(&security) {
        return Err(RaamError::InvalidSecurityLevel(security));
    }
    Ok(())
}

/// Check an index against a channel capacity.
pub fn validate_index(index: u64, capacity: u64) -> Result<(), RaamError> {
    if index >= capacity {
        return Err(RaamError::InvalidIndex { index, capacity });
    }
    Ok(())
}
