//! Append-only key-file persistence: one JSON record per line, leaves and
//! internal hashes, rehydrated back into a Merkle tree.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use raam_crypto::{Leaf, MerkleTree};
use raam_spec::RaamError;
use raam_ternary::{trits_from_trytes, trytes_from_trits, Trit};

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum KeyRecord {
    Leaf {
        public: String,
        private: String,
        index: u64,
        height: usize,
    },
    Node {
        hash: String,
        index: u64,
        height: usize,
    },
}

fn storage(err: impl std::fmt::Display) -> RaamError {
    RaamError::Storage(err.to_string())
}

/// Append every leaf and internal hash of a tree to a key file.
pub fn save_key_file(tree: &MerkleTree, path: impl AsRef<Path>) -> Result<(), RaamError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .map_err(storage)?;
    for leaf in tree.leaves() {
        let record = KeyRecord::Leaf {
            public: trytes_from_trits(&leaf.public),
            private: trytes_from_trits(&leaf.private),
            index: leaf.index,
            height: 0,
        };
        writeln!(file, "{}", serde_json::to_string(&record).map_err(storage)?).map_err(storage)?;
    }
    for (height, index, hash) in tree.nodes() {
        let record = KeyRecord::Node {
            hash: trytes_from_trits(hash),
            index,
            height,
        };
        writeln!(file, "{}", serde_json::to_string(&record).map_err(storage)?).map_err(storage)?;
    }
    debug!(path = %path.as_ref().display(), "key file written");
    Ok(())
}

/// Load a key file and rebuild the tree; the channel root is the single
/// node at the top height.
pub fn load_key_file(path: impl AsRef<Path>) -> Result<MerkleTree, RaamError> {
    let file = File::open(path.as_ref()).map_err(storage)?;
    let mut leaves: Vec<Leaf> = Vec::new();
    let mut nodes: Vec<(usize, u64, Vec<Trit>)> = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(storage)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<KeyRecord>(&line).map_err(storage)? {
            KeyRecord::Leaf {
                public,
                private,
                index,
                ..
            } => leaves.push(Leaf {
                public: trits_from_trytes(&public)?,
                private: trits_from_trytes(&private)?,
                index,
            }),
            KeyRecord::Node {
                hash,
                index,
                height,
            } => nodes.push((height, index, trits_from_trytes(&hash)?)),
        }
    }
    debug!(
        path = %path.as_ref().display(),
        leaves = leaves.len(),
        nodes = nodes.len(),
        "key file loaded"
    );
    MerkleTree::from_parts(leaves, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raam_crypto::create_tree;

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let tree = create_tree("KEYFILESEED", 2, 1, 0, None).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.keys");
        save_key_file(&tree, &path).unwrap();

        let loaded = load_key_file(&path).unwrap();
        assert_eq!(loaded.root(), tree.root());
        assert_eq!(loaded.height(), tree.height());
        assert_eq!(loaded.security(), tree.security());
        assert_eq!(loaded.leaves(), tree.leaves());
    }

    #[tokio::test]
    async fn truncated_file_is_rejected() {
        let tree = create_tree("KEYFILESEED", 2, 1, 0, None).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.keys");
        save_key_file(&tree, &path).unwrap();

        let full = std::fs::read_to_string(&path).unwrap();
        let truncated: Vec<&str> = full.lines().take(3).collect();
        std::fs::write(&path, truncated.join("\n")).unwrap();
        assert_eq!(load_key_file(&path).unwrap_err(), RaamError::IncompleteTree);
    }

    #[test]
    fn missing_file_is_a_storage_error() {
        let err = load_key_file("/nonexistent/channel.keys").unwrap_err();
        assert!(matches!(err, RaamError::Storage(_)));
    }
}
