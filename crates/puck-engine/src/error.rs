//! Engine error types.

use thiserror::Error;

/// Everything that can go wrong inside the engine.
///
/// Non-fatal variants surface to the control bus as status messages or
/// topic events and are recovered locally; [`Error::Fatal`] makes the
/// engine announce `server-died` and exit.
#[derive(Debug, Error)]
pub enum Error {
    /// A socket read or write failed
    #[error("network I/O: {0}")]
    NetworkIo(#[from] std::io::Error),

    /// A protocol line could not be parsed
    #[error(transparent)]
    ProtocolParse(#[from] puck_proto::ProtoError),

    /// A peer connection's handshake did not finish in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The hub rejected our password
    #[error("hub rejected the password")]
    AuthBadPass,

    /// The hub rejected our nick
    #[error("hub rejected the nick")]
    NickDenied,

    /// The hub closed the session
    #[error("hub closed the connection")]
    HubClosed,

    /// The hub redirected us elsewhere
    #[error("hub redirected to {0}")]
    HubRedirected(String),

    /// A requested file is not shared
    #[error("file not available: {0}")]
    FileNotAvailable(String),

    /// No upload slot could be granted
    #[error("all upload slots in use")]
    SlotDenied,

    /// Downloaded data did not match its announced TTH
    #[error("content hash mismatch for {0}")]
    HashMismatch(String),

    /// The TTH store failed
    #[error(transparent)]
    TthStore(#[from] puck_share::TthStoreError),

    /// A queue mutation failed
    #[error(transparent)]
    Queue(#[from] puck_queue::QueueError),

    /// Share manipulation failed
    #[error(transparent)]
    Share(#[from] puck_share::ShareError),

    /// A filelist could not be decoded
    #[error(transparent)]
    Codec(#[from] puck_share::FilelistError),

    /// A host name did not resolve
    #[error("DNS lookup failed for {0}")]
    Dns(String),

    /// External IP detection gave up for now
    #[error("external IP detection failed")]
    IpDetect,

    /// The engine cannot continue
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Fatal errors terminate the engine after a `server-died` event
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
