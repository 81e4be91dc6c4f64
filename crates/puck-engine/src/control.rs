//! The control bus: the line protocol between the engine and its
//! front-ends.
//!
//! Front-ends connect to a Unix stream socket in the working directory.
//! Inbound lines are commands; outbound lines mirror engine
//! notifications. Fields are `$`-separated with entity escaping, the
//! same dialect the hasher daemon speaks.

use puck_proto::control;
use tracing::debug;

use crate::bus::Notification;

/// A parsed front-end command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Connect to a hub
    ConnectHub {
        /// `host:port`
        addr: String,
        /// Nick override; empty means the configured default
        nick: Option<String>,
        /// Password for a registered nick
        password: Option<String>,
        /// Hub charset label, e.g. `WINDOWS-1252`
        encoding: Option<String>,
    },
    /// Disconnect from a hub
    DisconnectHub {
        /// The hub's address
        addr: String,
    },
    /// Send a public chat line
    SendChat {
        /// The hub's address
        hub: String,
        /// The message
        message: String,
    },
    /// Send a private message
    SendPrivate {
        /// The hub's address
        hub: String,
        /// Recipient nick
        nick: String,
        /// The message
        message: String,
    },
    /// Start a search on every connected hub
    Search {
        /// Space-separated terms, or `TTH:<hash>`
        query: String,
        /// Size limit; 0 for none
        size: u64,
        /// 0 none, 1 at-least, 2 at-most
        size_restriction: u8,
        /// Wire file-kind code
        kind: u32,
    },
    /// Queue a file download
    Download {
        /// Providing nick
        nick: String,
        /// Path on the peer's share
        source: String,
        /// Expected size
        size: u64,
        /// Local target path
        target: String,
        /// Base32 TTH, empty when unknown
        tth: String,
    },
    /// Queue a directory download
    DownloadDirectory {
        /// Providing nick
        nick: String,
        /// Directory on the peer's share
        source: String,
        /// Local target directory
        target: String,
    },
    /// Queue a nick's filelist
    DownloadFilelist {
        /// The nick
        nick: String,
    },
    /// Cancel a queued target
    CancelDownload {
        /// Local target path
        target: String,
    },
    /// Change a target's priority
    SetPriority {
        /// Local target path
        target: String,
        /// Numeric level 0..=5
        level: u8,
    },
    /// Share a directory
    AddShare {
        /// Local root path
        path: String,
    },
    /// Stop sharing a directory
    RemoveShare {
        /// Local root path
        path: String,
    },
    /// Re-walk every mountpoint
    RescanShare,
    /// Store a hub password and retry the login
    SetPassword {
        /// The hub's address
        hub: String,
        /// The password
        password: String,
    },
    /// Change the peer port
    SetPort {
        /// The new port
        port: u16,
    },
    /// Change the default nick
    SetNick {
        /// The new nick
        nick: String,
    },
    /// Exit cleanly
    Shutdown,
}

impl ControlRequest {
    /// Parse one control line. Unknown verbs and malformed arguments
    /// yield `None`; the engine logs and ignores them.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (verb, args) = control::decode(line);
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let opt = |i: usize| args.get(i).filter(|s| !s.is_empty()).cloned();

        let request = match verb.as_str() {
            "connect-hub" => Self::ConnectHub {
                addr: arg(0),
                nick: opt(1),
                password: opt(2),
                encoding: opt(3),
            },
            "disconnect-hub" => Self::DisconnectHub { addr: arg(0) },
            "send-chat" => Self::SendChat {
                hub: arg(0),
                message: arg(1),
            },
            "send-private" => Self::SendPrivate {
                hub: arg(0),
                nick: arg(1),
                message: arg(2),
            },
            "search" => Self::Search {
                query: arg(0),
                size: arg(1).parse().unwrap_or(0),
                size_restriction: arg(2).parse().unwrap_or(0),
                kind: arg(3).parse().unwrap_or(0),
            },
            "download" => Self::Download {
                nick: arg(0),
                source: arg(1),
                size: arg(2).parse().unwrap_or(0),
                target: arg(3),
                tth: arg(4),
            },
            "download-directory" => Self::DownloadDirectory {
                nick: arg(0),
                source: arg(1),
                target: arg(2),
            },
            "download-filelist" => Self::DownloadFilelist { nick: arg(0) },
            "cancel-download" => Self::CancelDownload { target: arg(0) },
            "set-priority" => Self::SetPriority {
                target: arg(0),
                level: arg(1).parse().ok()?,
            },
            "add-share" => Self::AddShare { path: arg(0) },
            "remove-share" => Self::RemoveShare { path: arg(0) },
            "rescan-share" => Self::RescanShare,
            "set-password" => Self::SetPassword {
                hub: arg(0),
                password: arg(1),
            },
            "set-port" => Self::SetPort {
                port: arg(0).parse().ok()?,
            },
            "set-nick" => Self::SetNick { nick: arg(0) },
            "shutdown" => Self::Shutdown,
            other => {
                debug!(verb = other, "unknown control verb");
                return None;
            }
        };
        Some(request)
    }
}

/// The line greeting every fresh control session
#[must_use]
pub fn init_completion() -> String {
    control::encode("init-completion", &[])
}

/// Render a notification as its outbound control line. Events without a
/// front-end mapping yield `None`.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn notification_line(notification: &Notification) -> Option<String> {
    let line = match notification {
        Notification::UserLogin { hub, nick } => control::encode("user-login", &[hub, nick]),
        Notification::UserLogout { hub, nick } => control::encode("user-logout", &[hub, nick]),
        Notification::UserUpdate { hub, nick } => control::encode("user-update", &[hub, nick]),
        Notification::HubName { hub, name } => control::encode("hubname", &[hub, name]),
        Notification::StatusMessage { hub, message } => control::encode(
            "status-message",
            &[hub.as_deref().unwrap_or(""), message],
        ),
        Notification::PublicMessage { hub, nick, message } => {
            control::encode("public-message", &[hub, nick, message])
        }
        Notification::PrivateMessage {
            hub,
            nick,
            display_nick,
            message,
        } => control::encode("private-message", &[hub, nick, display_nick, message]),
        Notification::SearchResponse { hub, response } => {
            control::encode("search-response", &[hub, response])
        }
        Notification::DownloadStarting {
            nick,
            filename,
            offset,
        } => control::encode(
            "download-starting",
            &[nick, filename, &offset.to_string()],
        ),
        Notification::DownloadFinished { nick, filename } => {
            control::encode("download-finished", &[nick, filename])
        }
        Notification::TransferStats {
            nick,
            filename,
            bytes_done,
            size,
            bytes_per_sec,
        } => control::encode(
            "transfer-stats",
            &[
                nick,
                filename,
                &bytes_done.to_string(),
                &size.to_string(),
                &bytes_per_sec.to_string(),
            ],
        ),
        Notification::QueueTargetAdded { filename, nick } => {
            control::encode("queue-add", &[filename, nick])
        }
        Notification::QueueTargetRemoved { filename } => {
            control::encode("queue-remove", &[filename])
        }
        Notification::ShareStats {
            size,
            totsize,
            dupsize,
            nfiles,
            ntotfiles,
            nduplicates,
        } => control::encode(
            "share-stats",
            &[
                &size.to_string(),
                &totsize.to_string(),
                &dupsize.to_string(),
                &nfiles.to_string(),
                &ntotfiles.to_string(),
                &nduplicates.to_string(),
            ],
        ),
        Notification::HubDisconnected { hub, expected } => control::encode(
            "hub-disconnected",
            &[hub, if *expected { "1" } else { "0" }],
        ),
        Notification::NeedPassword { hub, nick } => {
            control::encode("need-password", &[hub, nick])
        }
        Notification::HubRedirect { hub, target } => {
            control::encode("hub-redirect", &[hub, target])
        }
        Notification::ConnectionClosed { nick, reason } => control::encode(
            "connection-closed",
            &[
                nick.as_deref().unwrap_or(""),
                reason.as_deref().unwrap_or(""),
            ],
        ),
        Notification::ServerDied => control::encode("server-died", &[]),
        Notification::ExternalIpDetected { ip } => {
            control::encode("external-ip", &[ip])
        }

        // engine-internal topics with no front-end mapping
        Notification::FilelistAdded { .. }
        | Notification::QueueDirectoryAdded { .. }
        | Notification::QueueDirectoryRemoved { .. }
        | Notification::TthAvailable { .. }
        | Notification::DidRemoveShare { .. }
        | Notification::ShareScanFinished { .. }
        | Notification::HashingComplete => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_hub() {
        assert_eq!(
            ControlRequest::parse("connect-hub$hub.example.org:411$mynick$$KOI8-R"),
            Some(ControlRequest::ConnectHub {
                addr: "hub.example.org:411".to_string(),
                nick: Some("mynick".to_string()),
                password: None,
                encoding: Some("KOI8-R".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_download_and_cancel() {
        assert_eq!(
            ControlRequest::parse(
                "download$nisse$share\\a.bin$1234$a.bin$7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI"
            ),
            Some(ControlRequest::Download {
                nick: "nisse".to_string(),
                source: "share\\a.bin".to_string(),
                size: 1234,
                target: "a.bin".to_string(),
                tth: "7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI".to_string(),
            })
        );
        assert_eq!(
            ControlRequest::parse("cancel-download$a.bin"),
            Some(ControlRequest::CancelDownload {
                target: "a.bin".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_chat_with_escapes() {
        let line = "send-chat$hub:411$costs &#36;5 a piece";
        assert_eq!(
            ControlRequest::parse(line),
            Some(ControlRequest::SendChat {
                hub: "hub:411".to_string(),
                message: "costs $5 a piece".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_garbage() {
        assert_eq!(ControlRequest::parse("frobnicate$x"), None);
        assert_eq!(ControlRequest::parse("set-port$not-a-number"), None);
    }

    #[test]
    fn test_parse_shutdown() {
        assert_eq!(ControlRequest::parse("shutdown"), Some(ControlRequest::Shutdown));
    }

    #[test]
    fn test_notification_lines() {
        let line = notification_line(&Notification::PublicMessage {
            hub: "hub:411".to_string(),
            nick: "nisse".to_string(),
            message: "a $ and a | here".to_string(),
        })
        .unwrap();
        assert_eq!(
            line,
            "public-message$hub:411$nisse$a &#36; and a &#124; here"
        );

        let line = notification_line(&Notification::HubDisconnected {
            hub: "hub:411".to_string(),
            expected: false,
        })
        .unwrap();
        assert_eq!(line, "hub-disconnected$hub:411$0");

        // internal topic: no wire form
        assert!(notification_line(&Notification::HashingComplete).is_none());
    }
}
