//! The engine's notification center.
//!
//! Engine-internal reactions to an event (bloom updates, queue
//! bookkeeping, filelist regeneration) are dispatched explicitly by the
//! engine before the event is published here, so subscribers always
//! observe post-mutation state. Subscribers are control-bus sessions and
//! tests; delivery is a broadcast channel tap.

use std::path::PathBuf;

use puck_hash::Tth;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring; a lagging subscriber loses the
/// oldest events, never blocks the engine.
const CAPACITY: usize = 1024;

/// A typed engine event
#[derive(Debug, Clone)]
pub enum Notification {
    /// A peer's filelist finished downloading
    FilelistAdded {
        /// The nick whose list arrived
        nick: String,
        /// Where it was stored
        path: PathBuf,
        /// Resolve pending directory requests automatically
        auto_matched: bool,
    },
    /// A directory request entered the queue
    QueueDirectoryAdded {
        /// Local target directory
        target_directory: String,
        /// Providing nick
        nick: String,
    },
    /// A directory request left the queue
    QueueDirectoryRemoved {
        /// Local target directory
        target_directory: String,
    },
    /// A file target left the queue
    QueueTargetRemoved {
        /// Local target path
        filename: String,
    },
    /// A file target entered the queue
    QueueTargetAdded {
        /// Local target path
        filename: String,
        /// Providing nick
        nick: String,
    },
    /// The hasher produced (or failed to produce) a TTH
    TthAvailable {
        /// The local path
        path: PathBuf,
        /// The root hash; `None` when hashing failed
        tth: Option<Tth>,
    },
    /// A mountpoint was removed
    DidRemoveShare {
        /// Its local root
        local_root: PathBuf,
    },
    /// A share scan completed
    ShareScanFinished {
        /// The scanned local root
        local_root: PathBuf,
    },
    /// The unhashed tree drained completely
    HashingComplete,
    /// The external IP changed or was first detected
    ExternalIpDetected {
        /// Dotted-quad address
        ip: String,
    },
    /// A user logged in to a hub
    UserLogin {
        /// Hub address
        hub: String,
        /// The nick
        nick: String,
    },
    /// A user logged out of a hub
    UserLogout {
        /// Hub address
        hub: String,
        /// The nick
        nick: String,
    },
    /// User metadata changed
    UserUpdate {
        /// Hub address
        hub: String,
        /// The nick
        nick: String,
    },
    /// Public chat line
    PublicMessage {
        /// Hub address
        hub: String,
        /// Speaking nick
        nick: String,
        /// Message text
        message: String,
    },
    /// Private message
    PrivateMessage {
        /// Hub address
        hub: String,
        /// Sending nick
        nick: String,
        /// Display nick from the message body
        display_nick: String,
        /// Message text
        message: String,
    },
    /// Hub display name changed
    HubName {
        /// Hub address
        hub: String,
        /// The new name
        name: String,
    },
    /// Free-form status line for the front-end
    StatusMessage {
        /// Hub address the message concerns, when any
        hub: Option<String>,
        /// The text
        message: String,
    },
    /// A search response arrived
    SearchResponse {
        /// Hub address it came through
        hub: String,
        /// The raw `$SR` argument string
        response: String,
    },
    /// A hub session ended
    HubDisconnected {
        /// Hub address
        hub: String,
        /// Whether the engine expected it
        expected: bool,
    },
    /// The hub wants a password
    NeedPassword {
        /// Hub address
        hub: String,
        /// Our nick there
        nick: String,
    },
    /// The hub redirected us
    HubRedirect {
        /// Old address
        hub: String,
        /// New address
        target: String,
    },
    /// A download started
    DownloadStarting {
        /// Providing nick
        nick: String,
        /// Local target path
        filename: String,
        /// Starting offset
        offset: u64,
    },
    /// A download finished cleanly
    DownloadFinished {
        /// Providing nick
        nick: String,
        /// Local target path
        filename: String,
    },
    /// Progress of a running transfer
    TransferStats {
        /// The peer nick
        nick: String,
        /// Local file involved
        filename: String,
        /// Bytes moved so far
        bytes_done: u64,
        /// Total bytes expected
        size: u64,
        /// Current rate
        bytes_per_sec: u64,
    },
    /// A peer connection closed
    ConnectionClosed {
        /// The peer's nick, when the handshake got that far
        nick: Option<String>,
        /// Why, when known
        reason: Option<String>,
    },
    /// Share statistics changed
    ShareStats {
        /// Hashed unique bytes
        size: u64,
        /// All indexed bytes
        totsize: u64,
        /// Duplicate bytes
        dupsize: u64,
        /// Hashed unique files
        nfiles: u32,
        /// All indexed files
        ntotfiles: u32,
        /// Duplicates
        nduplicates: u32,
    },
    /// The engine is going down for good
    ServerDied,
}

/// The broadcast hub for [`Notification`]s
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    tx: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    /// A fresh center with no subscribers
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber
    pub fn publish(&self, notification: Notification) {
        // no subscribers is fine; events are fire-and-forget
        let _ = self.tx.send(notification);
    }

    /// Subscribe; events published after this call are received
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_see_events_in_order() {
        let nc = NotificationCenter::new();
        let mut rx = nc.subscribe();

        nc.publish(Notification::HashingComplete);
        nc.publish(Notification::ServerDied);

        assert!(matches!(rx.try_recv().unwrap(), Notification::HashingComplete));
        assert!(matches!(rx.try_recv().unwrap(), Notification::ServerDied));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let nc = NotificationCenter::new();
        nc.publish(Notification::HashingComplete);
    }
}
