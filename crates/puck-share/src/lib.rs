//! # puck-share
//!
//! Everything the client knows about local files:
//! - **Share index**: mountpoints, the hashed and unhashed file trees,
//!   inode-keyed duplicate detection, per-mount statistics
//! - **TTH store**: the append-only log binding content hashes to inodes
//!   and carrying Tiger tree leaf data
//! - **Bloom filter**: a cheap "definitely not shared" test on filename
//!   fragments, consulted before any full search scan
//! - **Filelist codec**: XML and legacy text filelists, with bzip2
//!   decompression of remote lists
//! - **Hasher core**: the cooperative chunk-at-a-time TTH computation
//!   driven by the hasher daemon

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bloom;
pub mod filelist;
pub mod hasher;
pub mod kind;
pub mod share;
pub mod tth_store;

pub use bloom::Bloom;
pub use filelist::{FilelistError, FlDir, FlFile};
pub use hasher::{HashOutcome, Hasher, TickResult};
pub use share::{
    walk_mountpoint, HashOutcomeKind, MountId, MountStats, Mountpoint, ScanSummary,
    ScannedFile, Share, ShareError, ShareFile, ShareStats,
};
pub use tth_store::{TthEntry, TthStore, TthStoreError};
