//! # puck-proto
//!
//! The NMDC (Neo-Modus Direct Connect) wire protocol.
//!
//! This crate provides:
//! - **Command parsing**: closed enums for hub-to-client and
//!   peer-to-peer commands, with a single parse site per direction
//! - **Lock/key exchange**: the `$Lock`/`$Key` handshake transform
//! - **Legacy encoding boundary**: lossy legacy-to-UTF-8 decoding and
//!   escaped UTF-8-to-legacy encoding, isolated here so the rest of the
//!   client deals only in UTF-8
//! - **Search strings**: `$Search` restriction parsing and `$SR` result
//!   formatting
//! - **Control lines**: the `$`-separated field codec shared by the
//!   engine control bus and the hasher daemon
//!
//! NMDC frames are byte strings terminated by `|`. Everything after
//! decoding is UTF-8; `$Lock` and `$Key` payloads are raw bytes and never
//! pass through an encoding conversion.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod control;
pub mod encoding;
pub mod escape;
pub mod lock;
pub mod search;

pub use command::{HubCommand, PeerCommand, UserInfo};
pub use encoding::HubEncoding;
pub use lock::{lock_to_key, make_lock_pk};
pub use search::{
    FileKind, SearchOrigin, SearchQuery, SearchRequest, SearchResult, SizeRestriction, SrInfo,
};

use thiserror::Error;

/// Command terminator byte on the NMDC wire
pub const TERMINATOR: u8 = b'|';

/// Field separator inside `$SR` responses
pub const SR_SEPARATOR: char = '\x05';

/// Errors from parsing protocol data
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// A command had the wrong shape or too few arguments
    #[error("malformed {command} command")]
    Malformed {
        /// The command name, e.g. `$Search`
        command: &'static str,
    },

    /// A numeric field failed to parse
    #[error("invalid numeric field in {command}")]
    BadNumber {
        /// The command name
        command: &'static str,
    },

    /// A lock was too short for the key transform
    #[error("lock too short: {0} bytes")]
    ShortLock(usize),
}
