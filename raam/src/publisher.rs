//! Channel publisher: owns the Merkle tree and the cursor, frames and signs
//! messages, submits them through the ledger client.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use raam_client::LedgerClient;
use raam_codec as codec;
use raam_crypto::{create_tree, MerkleTree, ProgressHook};
use raam_spec::{
    validate_length, validate_message, ChannelParams, RaamError, Record, RecordDraft,
    DEFAULT_DEPTH, DEFAULT_MWM,
};

/// Per-publish configuration.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target index; defaults to the cursor.
    pub index: Option<u64>,
    /// Per-message password overriding the cipher-key basis.
    pub message_password: Option<String>,
    /// Publish in public mode: anyone holding the ledger address can decrypt.
    pub public: bool,
    /// Root of a follow-up channel to embed as a branch pointer.
    pub next_root: Option<String>,
}

/// A framed and signed message, not yet submitted. Produced by
/// [`Publisher::create_message_transfers`] so callers can inspect or
/// postpone the submission.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    /// The index the message will occupy.
    pub index: u64,
    /// The ledger address the records attach at.
    pub address: String,
    /// The message body.
    pub message: String,
    /// The embedded branch root, if any.
    pub next_root: Option<String>,
    /// The record drafts forming the bundle.
    pub records: Vec<RecordDraft>,
}

/// The outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// The index the message occupies.
    pub index: u64,
    /// The ledger address of the bundle.
    pub address: String,
    /// The bundle identifier the ledger assigned.
    pub bundle: String,
    /// The attached records.
    pub records: Vec<Record>,
}

/// A single-writer RAAM channel.
pub struct Publisher {
    params: ChannelParams,
    tree: MerkleTree,
    client: Arc<dyn LedgerClient>,
    depth: u8,
    mwm: u8,
    state: RwLock<Mirror>,
}

#[derive(Default)]
struct Mirror {
    cursor: u64,
    messages: BTreeMap<u64, String>,
    branches: BTreeMap<u64, String>,
}

impl Publisher {
    /// Build the channel tree from a seed and wrap it in a publisher.
    pub async fn create(
        seed: &str,
        params: ChannelParams,
        client: Arc<dyn LedgerClient>,
        progress: Option<ProgressHook>,
    ) -> Result<Self, RaamError> {
        let tree = create_tree(seed, params.height, params.security, 0, progress).await?;
        Self::from_tree(tree, params, client)
    }

    /// Wrap an existing tree, e.g. one rehydrated from a key file.
    pub fn from_tree(
        tree: MerkleTree,
        params: ChannelParams,
        client: Arc<dyn LedgerClient>,
    ) -> Result<Self, RaamError> {
        if tree.height() != params.height {
            return Err(RaamError::WrongHeight {
                expected: params.height,
                found: tree.height(),
            });
        }
        if tree.security() != params.security {
            return Err(RaamError::WrongSecurity {
                expected: params.security,
                found: tree.security(),
            });
        }
        Ok(Self {
            params,
            tree,
            client,
            depth: DEFAULT_DEPTH,
            mwm: DEFAULT_MWM,
            state: RwLock::new(Mirror::default()),
        })
    }

    /// Override the proof-of-work parameters passed to the ledger client.
    pub fn with_pow(mut self, depth: u8, mwm: u8) -> Self {
        self.depth = depth;
        self.mwm = mwm;
        self
    }

    /// The channel root as trytes.
    pub fn channel_root(&self) -> String {
        self.tree.root_trytes()
    }

    /// The channel parameters.
    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// The underlying Merkle tree (for key-file persistence).
    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// The next free index.
    pub fn cursor(&self) -> u64 {
        self.state.read().cursor
    }

    /// The local mirror of a published message.
    pub fn message(&self, index: u64) -> Option<String> {
        self.state.read().messages.get(&index).cloned()
    }

    /// The branch root published at an index, if any.
    pub fn branch(&self, index: u64) -> Option<String> {
        self.state.read().branches.get(&index).cloned()
    }

    /// Frame, sign, encrypt, and split a message without submitting it.
    pub fn create_message_transfers(
        &self,
        message: &str,
        options: &PublishOptions,
    ) -> Result<PreparedMessage, RaamError> {
        validate_message(message)?;
        validate_length(message.len())?;
        let index = {
            let state = self.state.read();
            let index = options.index.unwrap_or(state.cursor);
            if index >= self.params.capacity() {
                return Err(RaamError::InvalidIndex {
                    index,
                    capacity: self.params.capacity(),
                });
            }
            if index < state.cursor || state.messages.contains_key(&index) {
                return Err(RaamError::IndexUsed(index));
            }
            index
        };
        if options.public && self.params.channel_password.is_some() {
            return Err(RaamError::PublicNotAllowed);
        }
        if let Some(password) = &options.message_password {
            validate_message(password)?;
        }

        let leaf = self.tree.leaf(index)?;
        let auth_path = self.tree.auth_path(index)?;
        let address = codec::address(
            self.tree.root(),
            index,
            self.params.channel_password.as_deref(),
        )?;
        // Public mode swaps in the address-derived password so the address
        // alone decrypts.
        let message_password = if options.public {
            Some(codec::public_password(&address, index)?)
        } else {
            options.message_password.clone()
        };
        let records = codec::assemble(&codec::MessageInput {
            message,
            index,
            height: self.params.height,
            security: self.params.security,
            private_key: &leaf.private,
            verifying_key: &leaf.public,
            auth_path: &auth_path,
            root: self.tree.root(),
            channel_password: self.params.channel_password.as_deref(),
            message_password: message_password.as_deref(),
            next_root: options.next_root.as_deref(),
        })?;
        debug!(index, records = records.len(), "message transfers prepared");
        Ok(PreparedMessage {
            index,
            address,
            message: message.to_string(),
            next_root: options.next_root.clone(),
            records,
        })
    }

    /// Submit previously prepared transfers and advance the cursor.
    pub async fn publish_message_transfers(
        &self,
        prepared: PreparedMessage,
    ) -> Result<PublishedMessage, RaamError> {
        let PreparedMessage {
            index,
            address,
            message,
            next_root,
            records,
        } = prepared;
        let attached = self
            .client
            .submit(records, self.depth, self.mwm)
            .await
            .map_err(|err| RaamError::Transport(err.to_string()))?;
        let mut state = self.state.write();
        if state.messages.contains_key(&index) {
            return Err(RaamError::IndexUsed(index));
        }
        state.messages.insert(index, message);
        if let Some(root) = next_root {
            state.branches.insert(index, root);
        }
        state.cursor = state.cursor.max(index + 1);
        drop(state);
        let bundle = attached
            .first()
            .map(|record| record.bundle.clone())
            .unwrap_or_default();
        info!(index, %address, %bundle, "message published");
        Ok(PublishedMessage {
            index,
            address,
            bundle,
            records: attached,
        })
    }

    /// Frame and submit in one call.
    pub async fn publish(
        &self,
        message: &str,
        options: PublishOptions,
    ) -> Result<PublishedMessage, RaamError> {
        let prepared = self.create_message_transfers(message, &options)?;
        self.publish_message_transfers(prepared).await
    }
}
