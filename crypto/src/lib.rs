//! Cryptographic engine: one-time signatures over balanced ternary, the
//! Merkle commitment tree, and the keyed sponge stream cipher.
#![deny(missing_docs)]

mod cipher;
mod merkle;
mod ots;

pub use cipher::StreamCipher;
pub use merkle::{
    create_tree, recompute_root, verify_path, Leaf, MerkleTree, ProgressHook, TreeProgress,
};
pub use ots::{normalized_digest, private_key, public_key, sign, subseed, verify};
