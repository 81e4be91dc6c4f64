//! # puck-hash
//!
//! Tiger Tree Hash (TTH) computation for the puck file-sharing client.
//!
//! This crate provides:
//! - **Streaming tree hashing**: feed file data in arbitrary chunks,
//!   get the TTH root and the leaf digests back
//! - **Leaf-level block sizing**: leaf block size selection so the tree
//!   stays within a bounded number of levels
//! - **TTH encoding**: the 39-character Base32 form used on the wire and
//!   in filelists
//!
//! The tree follows the THEX construction used by the Direct Connect
//! network: 1024-byte blocks are hashed with a `0x00` prefix, interior
//! nodes combine two children with a `0x01` prefix, and an odd node at
//! any level is promoted unchanged.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod tree;
pub mod tth;

pub use tree::{
    block_size_for, root_from_leaf_bytes, root_from_leaves, TreeDigest, TreeHasher,
};
pub use tth::{is_valid_tth, Tth, TthParseError};

/// Size of a raw Tiger digest in bytes
pub const DIGEST_SIZE: usize = 24;

/// Plain Tiger digest of a byte string, without any tree structure.
/// The share's bloom filter keys on this.
#[must_use]
pub fn tiger_digest(data: &[u8]) -> [u8; DIGEST_SIZE] {
    use tiger::{Digest, Tiger};

    let mut hasher = Tiger::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Base block size of the hash tree in bytes
pub const BLOCK_SIZE: u64 = 1024;

/// Smallest leaf block size ever used for leaf data
pub const MIN_LEAF_SIZE: u64 = 64 * 1024;

/// Maximum number of tree levels implied by the leaf block size
pub const MAX_LEVELS: u32 = 10;
