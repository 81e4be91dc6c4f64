//! Streaming Tiger Tree (THEX) hashing.
//!
//! Data is consumed in 1024-byte base blocks. Block digests are combined
//! pairwise as soon as two subtrees of equal width exist, so memory stays
//! logarithmic in the input size. Subtree digests at the configured leaf
//! block size are collected as *leaf data*, which peers can fetch to
//! verify partial downloads.

use tiger::{Digest, Tiger};

use crate::tth::Tth;
use crate::{BLOCK_SIZE, DIGEST_SIZE, MAX_LEVELS, MIN_LEAF_SIZE};

/// Hash a base block with the leaf prefix byte `0x00`
fn hash_block(data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut h = Tiger::new();
    h.update([0u8]);
    h.update(data);
    h.finalize().into()
}

/// Combine two child digests with the interior-node prefix byte `0x01`
fn hash_nodes(left: &[u8; DIGEST_SIZE], right: &[u8; DIGEST_SIZE]) -> [u8; DIGEST_SIZE] {
    let mut h = Tiger::new();
    h.update([1u8]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Pick the leaf block size for a file so the tree over the leaves has at
/// most `MAX_LEVELS` levels. Never smaller than `MIN_LEAF_SIZE`.
#[must_use]
pub fn block_size_for(file_size: u64) -> u64 {
    let max_leaves = 1u64 << (MAX_LEVELS - 1);
    let mut size = BLOCK_SIZE;
    while max_leaves * size < file_size {
        size *= 2;
    }
    size.max(MIN_LEAF_SIZE)
}

/// Compute the tree root from a sequence of leaf digests.
///
/// Leaves are paired left to right; an odd leaf at any level is promoted
/// unchanged to the next level. An empty slice yields the digest of an
/// empty leaf block, which is also the TTH of an empty file.
#[must_use]
pub fn root_from_leaves(leaves: &[[u8; DIGEST_SIZE]]) -> [u8; DIGEST_SIZE] {
    if leaves.is_empty() {
        return hash_block(&[]);
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(hash_nodes(&pair[0], &pair[1]));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

/// Result of a finished tree hash: the root and the collected leaf digests.
#[derive(Debug, Clone)]
pub struct TreeDigest {
    /// The TTH root
    pub root: Tth,
    /// Leaf digests at the configured leaf block size, in file order
    pub leaves: Vec<[u8; DIGEST_SIZE]>,
}

impl TreeDigest {
    /// Concatenated raw leaf bytes, the on-wire `tthl` payload
    #[must_use]
    pub fn leaf_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaves.len() * DIGEST_SIZE);
        for leaf in &self.leaves {
            out.extend_from_slice(leaf);
        }
        out
    }
}

/// Split a raw leaf-data payload into digests and recompute the root.
///
/// Returns `None` when the payload length is not a multiple of the digest
/// size. Used to validate leaf data fetched from a peer or re-read from
/// the TTH store.
#[must_use]
pub fn root_from_leaf_bytes(data: &[u8]) -> Option<Tth> {
    if data.len() % DIGEST_SIZE != 0 {
        return None;
    }

    let leaves: Vec<[u8; DIGEST_SIZE]> = data
        .chunks_exact(DIGEST_SIZE)
        .map(|c| {
            let mut d = [0u8; DIGEST_SIZE];
            d.copy_from_slice(c);
            d
        })
        .collect();

    Some(Tth::from_digest(root_from_leaves(&leaves)))
}

/// Incremental tree hasher.
///
/// Feed data with [`TreeHasher::update`] in chunks of any size, then call
/// [`TreeHasher::finalize`]. The hasher keeps only the merge stack of the
/// current leaf chunk plus the finished leaves.
pub struct TreeHasher {
    leaf_size: u64,
    block: Vec<u8>,
    stack: Vec<[u8; DIGEST_SIZE]>,
    blocks_in_leaf: u64,
    leaf_fill: u64,
    leaves: Vec<[u8; DIGEST_SIZE]>,
    total: u64,
}

impl TreeHasher {
    /// Create a hasher collecting leaves at `leaf_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `leaf_size` is not a power-of-two multiple of the base
    /// block size.
    #[must_use]
    pub fn new(leaf_size: u64) -> Self {
        assert!(leaf_size >= BLOCK_SIZE && leaf_size.is_power_of_two());

        Self {
            leaf_size,
            block: Vec::with_capacity(BLOCK_SIZE as usize),
            stack: Vec::new(),
            blocks_in_leaf: 0,
            leaf_fill: 0,
            leaves: Vec::new(),
            total: 0,
        }
    }

    /// Create a hasher with the leaf size appropriate for `file_size`
    #[must_use]
    pub fn for_file_size(file_size: u64) -> Self {
        Self::new(block_size_for(file_size))
    }

    /// Total bytes consumed so far
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    /// Feed more data
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;

        if !self.block.is_empty() {
            let want = BLOCK_SIZE as usize - self.block.len();
            let take = want.min(data.len());
            self.block.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.block.len() < BLOCK_SIZE as usize {
                return;
            }
            let digest = hash_block(&self.block);
            self.block.clear();
            self.push_block(digest);
        }

        while data.len() >= BLOCK_SIZE as usize {
            let (head, rest) = data.split_at(BLOCK_SIZE as usize);
            let digest = hash_block(head);
            data = rest;
            self.push_block(digest);
        }

        self.block.extend_from_slice(data);
    }

    /// Push a completed base-block digest and merge equal-width subtrees
    fn push_block(&mut self, digest: [u8; DIGEST_SIZE]) {
        self.stack.push(digest);
        self.blocks_in_leaf += 1;
        self.leaf_fill += BLOCK_SIZE;

        let mut b = self.blocks_in_leaf;
        while b & 1 == 0 {
            let right = self.stack.pop().expect("merge right operand");
            let left = self.stack.pop().expect("merge left operand");
            self.stack.push(hash_nodes(&left, &right));
            b >>= 1;
        }

        if self.leaf_fill == self.leaf_size {
            debug_assert_eq!(self.stack.len(), 1);
            let leaf = self.stack.pop().expect("completed leaf chunk");
            self.leaves.push(leaf);
            self.blocks_in_leaf = 0;
            self.leaf_fill = 0;
        }
    }

    /// Finish the hash, producing the root and all leaves
    #[must_use]
    pub fn finalize(mut self) -> TreeDigest {
        // A trailing partial block is hashed as-is; an empty input still
        // contributes one empty leaf block.
        if !self.block.is_empty() || self.total == 0 {
            let digest = hash_block(&self.block);
            self.stack.push(digest);
        }

        // Collapse the tail chunk right to left; it becomes the final,
        // possibly undersized, leaf.
        while self.stack.len() > 1 {
            let right = self.stack.pop().expect("collapse right operand");
            let left = self.stack.pop().expect("collapse left operand");
            self.stack.push(hash_nodes(&left, &right));
        }
        if let Some(tail) = self.stack.pop() {
            self.leaves.push(tail);
        }

        let root = Tth::from_digest(root_from_leaves(&self.leaves));
        TreeDigest {
            root,
            leaves: self.leaves,
        }
    }
}
