//! Closed command enums for the two NMDC directions.
//!
//! Hub-to-client commands arrive as decoded UTF-8 lines (the `$Lock`
//! special case is handled on raw bytes before decoding, see
//! [`crate::lock`]). Peer commands are parsed from raw bytes because the
//! path argument of a classic `$Get` is legacy-encoded while `$ADCGET`
//! paths are already UTF-8.
//!
//! Unknown commands parse into an `Unknown` variant rather than an error,
//! so a misbehaving hub produces a diagnostic instead of a disconnect.

use crate::encoding::HubEncoding;
use crate::escape;
use crate::search::SearchRequest;
use crate::ProtoError;

/// A user description block from `$MyINFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// The nick, unique within a hub
    pub nick: String,
    /// Free-form description with any client tag stripped
    pub description: String,
    /// The client tag, brackets included, e.g. `<++ V:0.674,M:A,H:1/0/0,S:3>`
    pub tag: Option<String>,
    /// Connection speed string, last byte is a legacy class code
    pub speed: String,
    /// Contact address
    pub email: String,
    /// Advertised share size in bytes
    pub shared_size: u64,
}

impl UserInfo {
    /// Parse the argument part of `$MyINFO`:
    /// `$ALL <nick> <description>$ $<speed>$<email>$<size>$`
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Malformed`] when the `$ALL` marker or the
    /// nick is missing.
    pub fn parse(args: &str) -> Result<Self, ProtoError> {
        const CMD: &str = "$MyINFO";
        let err = || ProtoError::Malformed { command: CMD };

        let rest = args.strip_prefix("$ALL ").ok_or_else(err)?;
        let (nick, rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if nick.is_empty() {
            return Err(err());
        }

        let mut fields = rest.split('$');
        let raw_desc = fields.next().unwrap_or("");
        let _flag = fields.next();
        let speed = fields.next().unwrap_or("").to_string();
        let email = fields.next().unwrap_or("").to_string();
        let shared_size = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        let (description, tag) = match (raw_desc.rfind('<'), raw_desc.ends_with('>')) {
            (Some(pos), true) => (
                raw_desc[..pos].trim_end().to_string(),
                Some(raw_desc[pos..].to_string()),
            ),
            _ => (raw_desc.to_string(), None),
        };

        Ok(Self {
            nick: nick.to_string(),
            description,
            tag,
            speed,
            email,
            shared_size,
        })
    }

    /// True when the tag advertises active mode (`M:A`)
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tag.as_deref().is_some_and(|t| t.contains("M:A"))
    }

    /// Format the argument part of an outbound `$MyINFO`
    #[must_use]
    pub fn format(&self) -> String {
        let tag = self.tag.as_deref().unwrap_or("");
        format!(
            "$ALL {} {}{}$ ${}${}${}$",
            self.nick, self.description, tag, self.speed, self.email, self.shared_size
        )
    }
}

/// User-command entry types from `$UserCommand`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommandKind {
    /// Menu separator
    Separator,
    /// Raw command
    Raw,
    /// Raw command limited to the selected nick
    RawNickLimited,
    /// Purge stored commands
    Clear,
}

impl UserCommandKind {
    fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Separator),
            1 => Some(Self::Raw),
            2 => Some(Self::RawNickLimited),
            255 => Some(Self::Clear),
            _ => None,
        }
    }
}

/// Commands received from a hub, already decoded to UTF-8
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    /// `$Hello <nick>`
    Hello(String),
    /// `$Quit <nick>`
    Quit(String),
    /// `$MyINFO $ALL ...`
    MyInfo(UserInfo),
    /// `$HubName <name>`
    HubName(String),
    /// `$Supports <feature>...`
    Supports(Vec<String>),
    /// `$Search ...` or `$MultiSearch ...`
    Search(SearchRequest),
    /// `$SR ...`, kept raw for the response collector
    SearchResponse(String),
    /// `$ConnectToMe <mynick> <host:port>`
    ConnectToMe {
        /// Our nick, as addressed by the hub
        my_nick: String,
        /// Peer address to connect to
        addr: String,
    },
    /// `$RevConnectToMe <from> <to>`
    RevConnectToMe {
        /// Requesting nick
        from: String,
        /// Requested nick, should be us
        to: String,
    },
    /// `$To: <me> From: <peer> $<<display>> <message>`
    PrivateMessage {
        /// Sending nick
        from: String,
        /// Display nick inside the message body
        display: String,
        /// Message text
        message: String,
    },
    /// Public chat: `<<nick>> <message>` or a bare line
    Chat {
        /// Speaking nick, absent for hub-generated lines
        nick: Option<String>,
        /// Message text
        message: String,
    },
    /// `$NickList <nick>$$...`
    NickList(Vec<String>),
    /// `$OpList <nick>$$...`
    OpList(Vec<String>),
    /// `$GetPass`
    GetPass,
    /// `$LogedIn` (sic, the protocol misspells it)
    LogedIn,
    /// `$BadPass`
    BadPass,
    /// `$ValidateDenide` (sic)
    ValidateDenide,
    /// `$ForceMove <address>`
    ForceMove(String),
    /// `$UserIP`/`$UserIP2` pairs
    UserIp(Vec<(String, String)>),
    /// `$UserCommand <type> <context>[ <title>$<command>]`
    UserCommand {
        /// Entry type
        kind: UserCommandKind,
        /// Context bitmask (hub/chat/search/filelist)
        context: u32,
        /// Menu title for raw entries
        title: Option<String>,
        /// Command body for raw entries
        command: Option<String>,
    },
    /// Anything unrecognised, surfaced as a diagnostic
    Unknown {
        /// The command word including `$`
        name: String,
        /// The raw argument string
        args: String,
    },
}

impl HubCommand {
    /// Parse one decoded hub line (without the `|` terminator).
    ///
    /// # Errors
    ///
    /// Returns a [`ProtoError`] when a known command is malformed; the
    /// caller logs it and proceeds with the next line.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        if let Some(rest) = line.strip_prefix('<') {
            // <nick> message
            let (nick, msg) = rest
                .split_once('>')
                .ok_or(ProtoError::Malformed { command: "<chat>" })?;
            return Ok(Self::Chat {
                nick: Some(nick.to_string()),
                message: msg.strip_prefix(' ').unwrap_or(msg).to_string(),
            });
        }

        if !line.starts_with('$') {
            return Ok(Self::Chat {
                nick: None,
                message: line.to_string(),
            });
        }

        let (name, args) = line.split_once(' ').unwrap_or((line, ""));
        let command = match name {
            "$Hello" => Self::Hello(first_word(args).to_string()),
            "$Quit" => Self::Quit(first_word(args).to_string()),
            "$MyINFO" => Self::MyInfo(UserInfo::parse(args)?),
            "$HubName" => Self::HubName(args.to_string()),
            "$Supports" => Self::Supports(
                args.split_whitespace().map(str::to_string).collect(),
            ),
            "$Search" | "$MultiSearch" => Self::Search(SearchRequest::parse(args)?),
            "$SR" => Self::SearchResponse(args.to_string()),
            "$ConnectToMe" => {
                let (my_nick, addr) = args
                    .split_once(' ')
                    .ok_or(ProtoError::Malformed { command: "$ConnectToMe" })?;
                Self::ConnectToMe {
                    my_nick: my_nick.to_string(),
                    addr: addr.to_string(),
                }
            }
            "$RevConnectToMe" => {
                let (from, to) = args
                    .split_once(' ')
                    .ok_or(ProtoError::Malformed { command: "$RevConnectToMe" })?;
                Self::RevConnectToMe {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
            "$To:" => parse_private_message(args)?,
            "$NickList" => Self::NickList(split_double_dollar(args)),
            "$OpList" => Self::OpList(split_double_dollar(args)),
            "$GetPass" => Self::GetPass,
            "$LogedIn" => Self::LogedIn,
            "$BadPass" => Self::BadPass,
            "$ValidateDenide" => Self::ValidateDenide,
            "$ForceMove" => Self::ForceMove(first_word(args).to_string()),
            "$UserIP" | "$UserIP2" => {
                let pairs = split_double_dollar(args)
                    .into_iter()
                    .filter_map(|entry| {
                        entry
                            .split_once(' ')
                            .map(|(n, ip)| (n.to_string(), ip.to_string()))
                    })
                    .collect();
                Self::UserIp(pairs)
            }
            "$UserCommand" => parse_user_command(args)?,
            _ => Self::Unknown {
                name: name.to_string(),
                args: args.to_string(),
            },
        };

        Ok(command)
    }
}

fn first_word(s: &str) -> &str {
    s.split(' ').next().unwrap_or("")
}

fn split_double_dollar(args: &str) -> Vec<String> {
    args.split("$$")
        .flat_map(|chunk| chunk.split('$'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_private_message(args: &str) -> Result<HubCommand, ProtoError> {
    const CMD: &str = "$To:";
    let err = || ProtoError::Malformed { command: CMD };

    // <me> From: <peer> $<body>
    let (_, rest) = args.split_once(" From: ").ok_or_else(err)?;
    let (from, body) = rest.split_once(" $").ok_or_else(err)?;

    // The body usually repeats the sender as <display> message
    let (display, message) = match body.strip_prefix('<') {
        Some(tail) => match tail.split_once("> ") {
            Some((display, message)) => (display, message),
            None => (from, body),
        },
        None => (from, body),
    };

    Ok(HubCommand::PrivateMessage {
        from: from.to_string(),
        display: display.to_string(),
        message: message.to_string(),
    })
}

fn parse_user_command(args: &str) -> Result<HubCommand, ProtoError> {
    const CMD: &str = "$UserCommand";
    let err = || ProtoError::Malformed { command: CMD };

    let mut parts = args.splitn(3, ' ');
    let kind_raw: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(err)?;
    let context: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(err)?;
    let kind = UserCommandKind::from_wire(kind_raw).ok_or_else(err)?;

    let (title, command) = match parts.next() {
        Some(detail) => {
            let (title, command) = detail.split_once('$').ok_or_else(err)?;
            (Some(title.to_string()), Some(command.to_string()))
        }
        None => (None, None),
    };

    Ok(HubCommand::UserCommand {
        kind,
        context,
        title,
        command,
    })
}

/// Payload selector in `$ADCGET`/`$ADCSND`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcPayload {
    /// Regular file content
    File,
    /// Tiger tree leaf data
    TthLeaves,
}

impl AdcPayload {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "file" => Some(Self::File),
            "tthl" => Some(Self::TthLeaves),
            _ => None,
        }
    }

    /// The wire token
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::TthLeaves => "tthl",
        }
    }
}

/// Commands on a peer-to-peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// `$MyNick <nick>`
    MyNick(String),
    /// `$Lock <lock> Pk=<pk>`, raw bytes
    Lock {
        /// The lock proper
        lock: Vec<u8>,
        /// Pk identification, when present
        pk: Option<Vec<u8>>,
    },
    /// `$Supports <feature>...`
    Supports(Vec<String>),
    /// `$Direction {Upload|Download} <challenge>`
    Direction {
        /// True when the peer wants to download from us
        download: bool,
        /// The peer's random challenge
        challenge: u32,
    },
    /// `$Key <key>`, raw bytes, never verified
    Key(Vec<u8>),
    /// `$Get <path>$<offset>`, offset 1-based, path legacy-encoded
    Get {
        /// Decoded virtual path
        path: String,
        /// Zero-based offset after conversion
        offset: u64,
    },
    /// `$Send`
    Send,
    /// `$GetListLen`
    GetListLen,
    /// `$UGetBlock <offset> <count> <path>`, path UTF-8
    UGetBlock {
        /// Zero-based offset
        offset: u64,
        /// Byte count, `None` for rest-of-file
        count: Option<u64>,
        /// Virtual path
        path: String,
    },
    /// `$ADCGET <type> <path> <offset> <count> [flags]`
    AdcGet {
        /// file or tthl
        payload: AdcPayload,
        /// Virtual path or `TTH/<hash>`
        path: String,
        /// Zero-based offset
        offset: u64,
        /// Byte count, `None` for rest-of-file
        count: Option<u64>,
    },
    /// `$ADCSND <type> <path> <offset> <count>`
    AdcSnd {
        /// file or tthl
        payload: AdcPayload,
        /// Echoed path
        path: String,
        /// Zero-based offset
        offset: u64,
        /// Byte count about to be streamed
        count: u64,
    },
    /// `$Sending <count>`
    Sending(u64),
    /// `$FileLength <size>`
    FileLength(u64),
    /// `$Error <message>` or `$Failed <message>`
    Failed(String),
    /// `$MaxedOut`
    MaxedOut,
    /// Anything unrecognised
    Unknown {
        /// The command word including `$`
        name: String,
        /// The raw argument bytes, lossily decoded for diagnostics
        args: String,
    },
}

impl PeerCommand {
    /// Parse one raw peer line (without the `|` terminator). The hub's
    /// legacy encoding is applied only where the protocol requires it.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtoError`] for malformed known commands.
    pub fn parse(raw: &[u8], encoding: HubEncoding) -> Result<Self, ProtoError> {
        // $Lock and $Key carry raw bytes that must not be re-decoded
        if let Some(rest) = raw.strip_prefix(b"$Lock ".as_ref()) {
            let (lock, pk) = crate::lock::split_lock_pk(rest);
            return Ok(Self::Lock {
                lock: lock.to_vec(),
                pk: pk.map(<[u8]>::to_vec),
            });
        }
        if let Some(rest) = raw.strip_prefix(b"$Key ".as_ref()) {
            return Ok(Self::Key(rest.to_vec()));
        }

        let text = String::from_utf8_lossy(raw);
        let (name, args) = text.split_once(' ').unwrap_or((text.as_ref(), ""));

        let command = match name {
            "$MyNick" => Self::MyNick(args.to_string()),
            "$Supports" => Self::Supports(
                args.split_whitespace().map(str::to_string).collect(),
            ),
            "$Direction" => parse_direction(args)?,
            "$Get" => parse_get(args, encoding)?,
            "$Send" => Self::Send,
            "$GetListLen" => Self::GetListLen,
            "$UGetBlock" => parse_uget_block(args)?,
            "$ADCGET" => parse_adcget(args)?,
            "$ADCSND" => parse_adcsnd(args)?,
            "$Sending" => Self::Sending(parse_u64(args, "$Sending")?),
            "$FileLength" => Self::FileLength(parse_u64(args, "$FileLength")?),
            "$Error" | "$Failed" => Self::Failed(args.to_string()),
            "$MaxedOut" => Self::MaxedOut,
            _ => Self::Unknown {
                name: name.to_string(),
                args: args.to_string(),
            },
        };

        Ok(command)
    }
}

fn parse_u64(args: &str, command: &'static str) -> Result<u64, ProtoError> {
    first_word(args)
        .parse()
        .map_err(|_| ProtoError::BadNumber { command })
}

fn parse_count(token: &str, command: &'static str) -> Result<Option<u64>, ProtoError> {
    if token == "-1" {
        return Ok(None);
    }
    token
        .parse()
        .map(Some)
        .map_err(|_| ProtoError::BadNumber { command })
}

fn parse_direction(args: &str) -> Result<PeerCommand, ProtoError> {
    const CMD: &str = "$Direction";
    let (dir, challenge) = args
        .split_once(' ')
        .ok_or(ProtoError::Malformed { command: CMD })?;
    let download = match dir {
        "Download" => true,
        "Upload" => false,
        _ => return Err(ProtoError::Malformed { command: CMD }),
    };
    let challenge = challenge
        .trim()
        .parse()
        .map_err(|_| ProtoError::BadNumber { command: CMD })?;
    Ok(PeerCommand::Direction {
        download,
        challenge,
    })
}

fn parse_get(args: &str, encoding: HubEncoding) -> Result<PeerCommand, ProtoError> {
    const CMD: &str = "$Get";
    let (path_raw, offset) = args
        .rsplit_once('$')
        .ok_or(ProtoError::Malformed { command: CMD })?;
    if path_raw.is_empty() {
        return Err(ProtoError::Malformed { command: CMD });
    }

    let offset: u64 = offset
        .parse()
        .map_err(|_| ProtoError::BadNumber { command: CMD })?;

    // Classic peers encode the path in the hub's legacy charset, with
    // entities for anything it cannot carry.
    let path = escape::unescape(&encoding.decode_lossy(path_raw.as_bytes()));

    Ok(PeerCommand::Get {
        path,
        offset: offset.saturating_sub(1),
    })
}

fn parse_uget_block(args: &str) -> Result<PeerCommand, ProtoError> {
    const CMD: &str = "$UGetBlock";
    let err = || ProtoError::Malformed { command: CMD };

    let (offset, rest) = args.split_once(' ').ok_or_else(err)?;
    let (count, path) = rest.split_once(' ').ok_or_else(err)?;

    Ok(PeerCommand::UGetBlock {
        offset: offset.parse().map_err(|_| ProtoError::BadNumber { command: CMD })?,
        count: parse_count(count, CMD)?,
        path: path.to_string(),
    })
}

fn looks_numeric(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Split `<type> <path with spaces> <offset> <count> [flags]` taking the
/// numeric fields from the right so paths may contain spaces. Trailing
/// non-numeric tokens (compression flags like `ZL1`) are discarded.
fn split_adc_args<'a>(
    args: &'a str,
    command: &'static str,
) -> Result<(&'a str, String, u64, &'a str), ProtoError> {
    let err = || ProtoError::Malformed { command };

    let (kind, rest) = args.split_once(' ').ok_or_else(err)?;
    let mut tokens: Vec<&str> = rest.split(' ').collect();

    while tokens.len() > 3 && !looks_numeric(tokens[tokens.len() - 1]) {
        tokens.pop();
    }
    if tokens.len() < 3 {
        return Err(err());
    }

    let count = tokens.pop().expect("count token");
    let offset = tokens.pop().expect("offset token");
    if !looks_numeric(offset) || !looks_numeric(count) {
        return Err(err());
    }
    let offset = offset
        .parse()
        .map_err(|_| ProtoError::BadNumber { command })?;

    Ok((kind, tokens.join(" "), offset, count))
}

fn parse_adcget(args: &str) -> Result<PeerCommand, ProtoError> {
    const CMD: &str = "$ADCGET";
    let (kind, path, offset, count) = split_adc_args(args, CMD)?;
    let payload = AdcPayload::from_token(kind).ok_or(ProtoError::Malformed { command: CMD })?;

    Ok(PeerCommand::AdcGet {
        payload,
        path,
        offset,
        count: parse_count(count, CMD)?,
    })
}

fn parse_adcsnd(args: &str) -> Result<PeerCommand, ProtoError> {
    const CMD: &str = "$ADCSND";
    let (kind, path, offset, count) = split_adc_args(args, CMD)?;
    let payload = AdcPayload::from_token(kind).ok_or(ProtoError::Malformed { command: CMD })?;

    Ok(PeerCommand::AdcSnd {
        payload,
        path,
        offset,
        count: count
            .parse()
            .map_err(|_| ProtoError::BadNumber { command: CMD })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{SearchOrigin, SearchQuery};

    #[test]
    fn test_parse_hello_and_quit() {
        assert_eq!(
            HubCommand::parse("$Hello someone").unwrap(),
            HubCommand::Hello("someone".to_string())
        );
        assert_eq!(
            HubCommand::parse("$Quit someone").unwrap(),
            HubCommand::Quit("someone".to_string())
        );
    }

    #[test]
    fn test_parse_myinfo() {
        let cmd = HubCommand::parse(
            "$MyINFO $ALL nisse en beskrivning<++ V:0.674,M:A,H:1/0/0,S:3>$ $DSL\u{1}$n@example.com$1234567890$",
        )
        .unwrap();
        let HubCommand::MyInfo(info) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(info.nick, "nisse");
        assert_eq!(info.description, "en beskrivning");
        assert_eq!(info.tag.as_deref(), Some("<++ V:0.674,M:A,H:1/0/0,S:3>"));
        assert!(info.is_active());
        assert_eq!(info.email, "n@example.com");
        assert_eq!(info.shared_size, 1_234_567_890);
    }

    #[test]
    fn test_myinfo_without_tag() {
        let info = UserInfo::parse("$ALL plain just text$ $LAN$$0$").unwrap();
        assert_eq!(info.description, "just text");
        assert_eq!(info.tag, None);
        assert!(!info.is_active());
    }

    #[test]
    fn test_myinfo_format_roundtrip() {
        let info = UserInfo {
            nick: "me".to_string(),
            description: "desc".to_string(),
            tag: Some("<puck V:0.3,M:P,H:1/0/0,S:3>".to_string()),
            speed: "Cable".to_string(),
            email: String::new(),
            shared_size: 42,
        };
        let parsed = UserInfo::parse(&info.format()).unwrap();
        assert_eq!(parsed.nick, "me");
        assert_eq!(parsed.tag, info.tag);
        assert_eq!(parsed.shared_size, 42);
        assert!(!parsed.is_active());
    }

    #[test]
    fn test_parse_chat_forms() {
        assert_eq!(
            HubCommand::parse("<nisse> hello there").unwrap(),
            HubCommand::Chat {
                nick: Some("nisse".to_string()),
                message: "hello there".to_string(),
            }
        );
        assert_eq!(
            HubCommand::parse("hub system notice").unwrap(),
            HubCommand::Chat {
                nick: None,
                message: "hub system notice".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_private_message() {
        let cmd =
            HubCommand::parse("$To: me From: sender $<sender> the message body").unwrap();
        assert_eq!(
            cmd,
            HubCommand::PrivateMessage {
                from: "sender".to_string(),
                display: "sender".to_string(),
                message: "the message body".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_nicklist_and_oplist() {
        assert_eq!(
            HubCommand::parse("$NickList a$$b$$c$$").unwrap(),
            HubCommand::NickList(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(
            HubCommand::parse("$OpList admin$$").unwrap(),
            HubCommand::OpList(vec!["admin".to_string()])
        );
    }

    #[test]
    fn test_parse_search_via_hub_command() {
        let cmd = HubCommand::parse("$Search Hub:asker F?F?0?0?test").unwrap();
        let HubCommand::Search(req) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(
            req.origin,
            SearchOrigin::Passive {
                nick: "asker".to_string(),
            }
        );
        assert_eq!(req.query, SearchQuery::Terms(vec!["test".to_string()]));

        // $MultiSearch goes through the same parser
        assert!(matches!(
            HubCommand::parse("$MultiSearch 1.2.3.4:412 F?F?0?0?x").unwrap(),
            HubCommand::Search(_)
        ));
    }

    #[test]
    fn test_parse_userip_pairs() {
        let cmd = HubCommand::parse("$UserIP2 me 1.2.3.4$$other 5.6.7.8").unwrap();
        assert_eq!(
            cmd,
            HubCommand::UserIp(vec![
                ("me".to_string(), "1.2.3.4".to_string()),
                ("other".to_string(), "5.6.7.8".to_string()),
            ])
        );
    }

    #[test]
    fn test_parse_user_command() {
        let cmd = HubCommand::parse("$UserCommand 1 3 Kick user$<%[mynick]> !kick %[nick]&#124;")
            .unwrap();
        assert_eq!(
            cmd,
            HubCommand::UserCommand {
                kind: UserCommandKind::Raw,
                context: 3,
                title: Some("Kick user".to_string()),
                command: Some("<%[mynick]> !kick %[nick]&#124;".to_string()),
            }
        );
        assert_eq!(
            HubCommand::parse("$UserCommand 255 15").unwrap(),
            HubCommand::UserCommand {
                kind: UserCommandKind::Clear,
                context: 15,
                title: None,
                command: None,
            }
        );
    }

    #[test]
    fn test_unknown_command_is_diagnostic() {
        let cmd = HubCommand::parse("$FancyNewThing a b c").unwrap();
        assert_eq!(
            cmd,
            HubCommand::Unknown {
                name: "$FancyNewThing".to_string(),
                args: "a b c".to_string(),
            }
        );
    }

    #[test]
    fn test_peer_lock_and_key_stay_raw() {
        let enc = HubEncoding::default();
        let cmd =
            PeerCommand::parse(b"$Lock EXTENDEDPROTOCOLABCD Pk=client1.0", enc).unwrap();
        assert_eq!(
            cmd,
            PeerCommand::Lock {
                lock: b"EXTENDEDPROTOCOLABCD".to_vec(),
                pk: Some(b"client1.0".to_vec()),
            }
        );

        let raw_key = vec![b'$', b'K', b'e', b'y', b' ', 0xD1, 0xC0];
        assert_eq!(
            PeerCommand::parse(&raw_key, enc).unwrap(),
            PeerCommand::Key(vec![0xD1, 0xC0])
        );
    }

    #[test]
    fn test_peer_direction() {
        assert_eq!(
            PeerCommand::parse(b"$Direction Download 12345", HubEncoding::default()).unwrap(),
            PeerCommand::Direction {
                download: true,
                challenge: 12345,
            }
        );
        assert!(PeerCommand::parse(b"$Direction Sideways 1", HubEncoding::default()).is_err());
    }

    #[test]
    fn test_peer_get_offset_is_one_based() {
        let cmd = PeerCommand::parse(b"$Get music\\song.mp3$1", HubEncoding::default()).unwrap();
        assert_eq!(
            cmd,
            PeerCommand::Get {
                path: "music\\song.mp3".to_string(),
                offset: 0,
            }
        );
    }

    #[test]
    fn test_peer_get_decodes_legacy_path() {
        // 0xE5 is 'å' in Windows-1252
        let cmd = PeerCommand::parse(b"$Get sm\xE5bord.txt$1", HubEncoding::default()).unwrap();
        assert_eq!(
            cmd,
            PeerCommand::Get {
                path: "sm\u{e5}bord.txt".to_string(),
                offset: 0,
            }
        );
    }

    #[test]
    fn test_peer_adcget_file() {
        let cmd = PeerCommand::parse(
            b"$ADCGET file dir\\a file.bin 0 1048576",
            HubEncoding::default(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            PeerCommand::AdcGet {
                payload: AdcPayload::File,
                path: "dir\\a file.bin".to_string(),
                offset: 0,
                count: Some(1_048_576),
            }
        );
    }

    #[test]
    fn test_peer_adcget_tthl_open_ended() {
        let cmd = PeerCommand::parse(
            b"$ADCGET tthl TTH/7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI 0 -1",
            HubEncoding::default(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            PeerCommand::AdcGet {
                payload: AdcPayload::TthLeaves,
                path: "TTH/7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI".to_string(),
                offset: 0,
                count: None,
            }
        );
    }

    #[test]
    fn test_peer_adcget_ignores_trailing_flags() {
        let cmd = PeerCommand::parse(
            b"$ADCGET file path 0 500 ZL1",
            HubEncoding::default(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            PeerCommand::AdcGet {
                payload: AdcPayload::File,
                path: "path".to_string(),
                offset: 0,
                count: Some(500),
            }
        );
    }

    #[test]
    fn test_peer_ugetblock() {
        let cmd = PeerCommand::parse(
            b"$UGetBlock 100 200 some\\path.txt",
            HubEncoding::default(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            PeerCommand::UGetBlock {
                offset: 100,
                count: Some(200),
                path: "some\\path.txt".to_string(),
            }
        );
    }

    #[test]
    fn test_peer_transfer_announcements() {
        let enc = HubEncoding::default();
        assert_eq!(
            PeerCommand::parse(b"$Sending 4711", enc).unwrap(),
            PeerCommand::Sending(4711)
        );
        assert_eq!(
            PeerCommand::parse(b"$FileLength 26577", enc).unwrap(),
            PeerCommand::FileLength(26577)
        );
        assert_eq!(
            PeerCommand::parse(b"$MaxedOut", enc).unwrap(),
            PeerCommand::MaxedOut
        );
        assert_eq!(
            PeerCommand::parse(b"$Error File Not Available", enc).unwrap(),
            PeerCommand::Failed("File Not Available".to_string())
        );
    }
}
