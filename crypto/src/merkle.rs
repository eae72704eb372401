//! Merkle commitment tree over one-time signing keys.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use raam_spec::{validate_height, validate_security, RaamError};
use raam_ternary::{trytes_from_trits, Curl, Trit, HASH_LENGTH};

use crate::ots;

/// One signing leaf: key pair plus its tree position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// The compressed verifying key, `security * 243` trits.
    pub public: Vec<Trit>,
    /// The one-time signing key, `security * 27 * 243` trits.
    pub private: Vec<Trit>,
    /// Tree-relative leaf index.
    pub index: u64,
}

/// Counts of nodes produced since the previous progress report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeProgress {
    /// Newly generated leaves.
    pub new_leaves: usize,
    /// Newly combined internal nodes, keyed by level.
    pub new_nodes: BTreeMap<usize, usize>,
}

/// Throttled construction progress callback. Purely advisory; timing never
/// affects the resulting tree.
#[derive(Clone)]
pub struct ProgressHook {
    /// Minimum interval between callback invocations.
    pub interval: Duration,
    /// Invoked with the counts accumulated since the last report.
    pub callback: Arc<dyn Fn(TreeProgress) + Send + Sync>,
}

/// The channel's Merkle tree: all leaves plus every internal hash.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    height: usize,
    security: usize,
    offset: u64,
    leaves: Vec<Leaf>,
    // layers[0] holds the leaf verifying keys; layers[height] the root.
    layers: Vec<Vec<Vec<Trit>>>,
}

/// Build a tree of `2^height` one-time keys from a seed. Leaf keys derive
/// from `subseed(seed, offset + i)`; construction yields between leaves so
/// callers stay responsive during long key generation.
pub async fn create_tree(
    seed: &str,
    height: usize,
    security: usize,
    offset: u64,
    progress: Option<ProgressHook>,
) -> Result<MerkleTree, RaamError> {
    validate_height(height)?;
    validate_security(security)?;
    let count = 1u64 << height;
    let mut layers: Vec<Vec<Vec<Trit>>> = vec![Vec::new(); height + 1];
    let mut leaves = Vec::with_capacity(count as usize);
    let mut stack: Vec<(usize, Vec<Trit>)> = Vec::new();
    let mut sample = TreeProgress::default();
    let mut last_report = Instant::now();

    for index in 0..count {
        let sub = ots::subseed(seed, offset + index)?;
        let private = ots::private_key(&sub, security);
        let public = ots::public_key(&private, security);
        layers[0].push(public.clone());
        leaves.push(Leaf {
            public: public.clone(),
            private,
            index,
        });
        stack.push((0, public));
        sample.new_leaves += 1;

        // Two completed subtrees of the same level combine immediately.
        while stack.len() >= 2 && stack[stack.len() - 1].0 == stack[stack.len() - 2].0 {
            let (level, right) = stack.pop().expect("stack has two entries");
            let (_, left) = stack.pop().expect("stack has two entries");
            let parent = combine(&left, &right, security);
            layers[level + 1].push(parent.clone());
            *sample.new_nodes.entry(level + 1).or_insert(0) += 1;
            stack.push((level + 1, parent));
        }

        if let Some(hook) = &progress {
            if last_report.elapsed() >= hook.interval {
                (hook.callback)(std::mem::take(&mut sample));
                last_report = Instant::now();
            }
        }
        tokio::task::yield_now().await;
    }

    debug_assert_eq!(stack.len(), 1);
    if let Some(hook) = &progress {
        if sample.new_leaves > 0 || !sample.new_nodes.is_empty() {
            (hook.callback)(sample);
        }
    }
    debug!(height, security, offset, "merkle tree constructed");
    Ok(MerkleTree {
        height,
        security,
        offset,
        leaves,
        layers,
    })
}

fn combine(left: &[Trit], right: &[Trit], security: usize) -> Vec<Trit> {
    let mut curl = Curl::new();
    curl.absorb(left);
    curl.absorb(right);
    curl.squeeze(security * HASH_LENGTH)
}

impl MerkleTree {
    /// Tree height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Security multiplier of the leaf keys.
    pub fn security(&self) -> usize {
        self.security
    }

    /// Subseed offset the leaves were derived at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of leaves.
    pub fn capacity(&self) -> u64 {
        1u64 << self.height
    }

    /// The channel root committing to every leaf.
    pub fn root(&self) -> &[Trit] {
        &self.layers[self.height][0]
    }

    /// The channel root as trytes.
    pub fn root_trytes(&self) -> String {
        trytes_from_trits(self.root())
    }

    /// Borrow the leaf at a tree-relative index.
    pub fn leaf(&self, index: u64) -> Result<&Leaf, RaamError> {
        self.leaves
            .get(index as usize)
            .ok_or(RaamError::InvalidIndex {
                index,
                capacity: self.capacity(),
            })
    }

    /// All leaves in index order.
    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// Iterate the internal nodes as `(level, index, hash)`.
    pub fn nodes(&self) -> impl Iterator<Item = (usize, u64, &[Trit])> + '_ {
        self.layers
            .iter()
            .enumerate()
            .skip(1)
            .flat_map(|(level, hashes)| {
                hashes
                    .iter()
                    .enumerate()
                    .map(move |(index, hash)| (level, index as u64, hash.as_slice()))
            })
    }

    /// The sibling hashes authenticating a leaf, leaves-first.
    pub fn auth_path(&self, index: u64) -> Result<Vec<Vec<Trit>>, RaamError> {
        if index >= self.capacity() {
            return Err(RaamError::InvalidIndex {
                index,
                capacity: self.capacity(),
            });
        }
        let mut path = Vec::with_capacity(self.height);
        for level in 0..self.height {
            let sibling = ((index >> level) ^ 1) as usize;
            path.push(self.layers[level][sibling].clone());
        }
        Ok(path)
    }

    /// Rebuild a tree from persisted leaves and internal nodes.
    pub fn from_parts(
        mut leaves: Vec<Leaf>,
        nodes: Vec<(usize, u64, Vec<Trit>)>,
    ) -> Result<Self, RaamError> {
        let height = nodes
            .iter()
            .map(|(level, _, _)| *level)
            .max()
            .ok_or(RaamError::IncompleteTree)?;
        validate_height(height)?;
        let count = 1usize << height;
        if leaves.len() != count {
            return Err(RaamError::IncompleteTree);
        }
        leaves.sort_by_key(|leaf| leaf.index);
        let width = leaves[0].public.len();
        if width == 0 || width % HASH_LENGTH != 0 {
            return Err(RaamError::IncompleteTree);
        }
        let security = width / HASH_LENGTH;
        validate_security(security)?;

        let mut layers: Vec<Vec<Vec<Trit>>> = vec![Vec::new(); height + 1];
        for (position, leaf) in leaves.iter().enumerate() {
            if leaf.index != position as u64 || leaf.public.len() != width {
                return Err(RaamError::IncompleteTree);
            }
            layers[0].push(leaf.public.clone());
        }
        let mut buckets: Vec<BTreeMap<u64, Vec<Trit>>> = vec![BTreeMap::new(); height + 1];
        for (level, index, hash) in nodes {
            if level == 0 || level > height || hash.len() != width {
                return Err(RaamError::IncompleteTree);
            }
            buckets[level].insert(index, hash);
        }
        for level in 1..=height {
            let expected = count >> level;
            let bucket = std::mem::take(&mut buckets[level]);
            if bucket.len() != expected {
                return Err(RaamError::IncompleteTree);
            }
            for (position, (index, hash)) in bucket.into_iter().enumerate() {
                if index != position as u64 {
                    return Err(RaamError::IncompleteTree);
                }
                layers[level].push(hash);
            }
        }
        Ok(Self {
            height,
            security,
            offset: 0,
            leaves,
            layers,
        })
    }
}

/// Fold a leaf key up its authentication path to the implied channel root.
pub fn recompute_root(
    leaf_public: &[Trit],
    index: u64,
    path: &[Vec<Trit>],
    security: usize,
) -> Vec<Trit> {
    let mut hash = leaf_public.to_vec();
    for (level, sibling) in path.iter().enumerate() {
        hash = if (index >> level) & 1 == 0 {
            combine(&hash, sibling, security)
        } else {
            combine(sibling, &hash, security)
        };
    }
    hash
}

/// Check that a leaf key is committed to by the given channel root.
pub fn verify_path(
    root: &[Trit],
    leaf_public: &[Trit],
    index: u64,
    path: &[Vec<Trit>],
    security: usize,
) -> bool {
    recompute_root(leaf_public, index, path, security) == root
}
