//! Typed events parsed from the engine's outbound control lines.

use puck_proto::control;

/// An event from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The control session is ready
    InitCompletion,
    /// A user appeared on a hub
    UserLogin {
        /// Hub address
        hub: String,
        /// The nick
        nick: String,
    },
    /// A user left a hub
    UserLogout {
        /// Hub address
        hub: String,
        /// The nick
        nick: String,
    },
    /// A user's metadata changed
    UserUpdate {
        /// Hub address
        hub: String,
        /// The nick
        nick: String,
    },
    /// A hub renamed itself
    HubName {
        /// Hub address
        hub: String,
        /// The new name
        name: String,
    },
    /// A free-form status line
    StatusMessage {
        /// Hub address, empty when global
        hub: String,
        /// The text
        message: String,
    },
    /// Public chat
    PublicMessage {
        /// Hub address
        hub: String,
        /// Speaking nick
        nick: String,
        /// The text
        message: String,
    },
    /// Private chat
    PrivateMessage {
        /// Hub address
        hub: String,
        /// Sending nick
        nick: String,
        /// Display nick
        display_nick: String,
        /// The text
        message: String,
    },
    /// A search result arrived
    SearchResponse {
        /// Hub it came through, empty for UDP results
        hub: String,
        /// Raw `$SR` argument string
        response: String,
    },
    /// A transfer is progressing
    TransferStats {
        /// Peer nick
        nick: String,
        /// File involved
        filename: String,
        /// Bytes done
        bytes_done: u64,
        /// Total bytes
        size: u64,
        /// Current rate
        bytes_per_sec: u64,
    },
    /// A download began
    DownloadStarting {
        /// Peer nick
        nick: String,
        /// Target file
        filename: String,
        /// Start offset
        offset: u64,
    },
    /// A download completed
    DownloadFinished {
        /// Peer nick
        nick: String,
        /// Target file
        filename: String,
    },
    /// A target entered the queue
    QueueAdd {
        /// Target file
        filename: String,
        /// Providing nick
        nick: String,
    },
    /// A target left the queue
    QueueRemove {
        /// Target file
        filename: String,
    },
    /// Share counters changed
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
    /// A hub session ended
    HubDisconnected {
        /// Hub address
        hub: String,
        /// Whether the engine expected it
        expected: bool,
    },
    /// A hub wants a password
    NeedPassword {
        /// Hub address
        hub: String,
        /// Our nick there
        nick: String,
    },
    /// A hub redirected the engine
    HubRedirect {
        /// Old address
        hub: String,
        /// New address
        target: String,
    },
    /// A peer connection closed
    ConnectionClosed {
        /// Peer nick when known
        nick: String,
        /// Reason when known
        reason: String,
    },
    /// The detected external address changed
    ExternalIp {
        /// Dotted quad
        ip: String,
    },
    /// The engine died and will not come back
    ServerDied,
    /// The socket to the engine is gone
    EngineGone,
    /// A verb this client does not know
    Unknown {
        /// The verb
        verb: String,
        /// Its arguments
        args: Vec<String>,
    },
}

impl ClientEvent {
    /// Parse one outbound control line
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn parse(line: &str) -> Self {
        let (verb, args) = control::decode(line);
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let num = |i: usize| args.get(i).and_then(|s| s.parse().ok()).unwrap_or(0);

        match verb.as_str() {
            "init-completion" => Self::InitCompletion,
            "user-login" => Self::UserLogin {
                hub: arg(0),
                nick: arg(1),
            },
            "user-logout" => Self::UserLogout {
                hub: arg(0),
                nick: arg(1),
            },
            "user-update" => Self::UserUpdate {
                hub: arg(0),
                nick: arg(1),
            },
            "hubname" => Self::HubName {
                hub: arg(0),
                name: arg(1),
            },
            "status-message" => Self::StatusMessage {
                hub: arg(0),
                message: arg(1),
            },
            "public-message" => Self::PublicMessage {
                hub: arg(0),
                nick: arg(1),
                message: arg(2),
            },
            "private-message" => Self::PrivateMessage {
                hub: arg(0),
                nick: arg(1),
                display_nick: arg(2),
                message: arg(3),
            },
            "search-response" => Self::SearchResponse {
                hub: arg(0),
                response: arg(1),
            },
            "transfer-stats" => Self::TransferStats {
                nick: arg(0),
                filename: arg(1),
                bytes_done: num(2),
                size: num(3),
                bytes_per_sec: num(4),
            },
            "download-starting" => Self::DownloadStarting {
                nick: arg(0),
                filename: arg(1),
                offset: num(2),
            },
            "download-finished" => Self::DownloadFinished {
                nick: arg(0),
                filename: arg(1),
            },
            "queue-add" => Self::QueueAdd {
                filename: arg(0),
                nick: arg(1),
            },
            "queue-remove" => Self::QueueRemove { filename: arg(0) },
            "share-stats" => {
                let count = |i: usize| args.get(i).and_then(|s| s.parse().ok()).unwrap_or(0);
                Self::ShareStats {
                    size: num(0),
                    totsize: num(1),
                    dupsize: num(2),
                    nfiles: count(3),
                    ntotfiles: count(4),
                    nduplicates: count(5),
                }
            }
            "hub-disconnected" => Self::HubDisconnected {
                hub: arg(0),
                expected: arg(1) == "1",
            },
            "need-password" => Self::NeedPassword {
                hub: arg(0),
                nick: arg(1),
            },
            "hub-redirect" => Self::HubRedirect {
                hub: arg(0),
                target: arg(1),
            },
            "connection-closed" => Self::ConnectionClosed {
                nick: arg(0),
                reason: arg(1),
            },
            "external-ip" => Self::ExternalIp { ip: arg(0) },
            "server-died" => Self::ServerDied,
            _ => Self::Unknown { verb, args },
        }
    }
}
