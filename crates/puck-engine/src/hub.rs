//! The hub session state machine.
//!
//! A [`HubSession`] consumes raw protocol lines and produces
//! [`HubAction`]s; it performs no I/O itself. The engine feeds it from
//! the hub socket and executes the actions, which keeps the whole login
//! and command dispatch logic testable against byte strings.
//!
//! Login sequence: the hub opens with `$Lock`; we answer `$Key` and
//! `$ValidateNick`; a registered nick detours through
//! `$GetPass`/`$MyPass`; `$Hello` with our own nick completes the login
//! and triggers `$Version`, `$GetNickList` and `$MyINFO`.

use std::collections::HashMap;

use puck_proto::command::UserCommandKind;
use puck_proto::{
    escape, lock, HubCommand, HubEncoding, SearchRequest, UserInfo,
};
use tracing::{debug, info, warn};

use crate::bus::Notification;

/// A user as seen on one hub
#[derive(Debug, Clone)]
pub struct User {
    /// The nick, unique within the hub
    pub nick: String,
    /// Free-form description
    pub description: String,
    /// Client tag
    pub tag: Option<String>,
    /// Connection speed string
    pub speed: String,
    /// Contact address
    pub email: String,
    /// Advertised share size
    pub shared_size: u64,
    /// Operator flag, merged across `$OpList` and `$MyINFO`
    pub is_operator: bool,
    /// Extra upload slots granted to this nick
    pub extra_slots: u32,
    /// Derived from the tag and observed RevConnectToMe bounces
    pub passive: bool,
    /// Hub-reported or detected address
    pub ip: Option<String>,
}

impl User {
    fn from_info(info: &UserInfo) -> Self {
        Self {
            nick: info.nick.clone(),
            description: info.description.clone(),
            tag: info.tag.clone(),
            speed: info.speed.clone(),
            email: info.email.clone(),
            shared_size: info.shared_size,
            is_operator: false,
            extra_slots: 0,
            passive: info.tag.is_some() && !info.is_active(),
            ip: None,
        }
    }

    fn placeholder(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            description: String::new(),
            tag: None,
            speed: String::new(),
            email: String::new(),
            shared_size: 0,
            is_operator: false,
            extra_slots: 0,
            passive: false,
            ip: None,
        }
    }
}

/// A stored `$UserCommand` entry
#[derive(Debug, Clone)]
pub struct StoredUserCommand {
    /// Entry type
    pub kind: UserCommandKind,
    /// Context bitmask
    pub context: u32,
    /// Menu title
    pub title: Option<String>,
    /// Escaped command body, `&#124;`-terminated
    pub command: Option<String>,
}

/// Our identity and credentials on one hub
#[derive(Debug, Clone)]
pub struct HubIdentity {
    /// The nick to log in with
    pub nick: String,
    /// Description for `$MyINFO`
    pub description: String,
    /// Client tag for `$MyINFO`
    pub tag: String,
    /// Contact address
    pub email: String,
    /// Speed string, without the trailing class byte
    pub speed: String,
    /// Registered-nick password
    pub password: Option<String>,
    /// We cannot accept inbound connections
    pub passive: bool,
    /// Our peer port
    pub port: u16,
    /// Advertised share size
    pub share_size: u64,
}

/// What the engine must do after a line was handled
#[derive(Debug)]
pub enum HubAction {
    /// Write these bytes to the hub socket
    Send(Vec<u8>),
    /// Publish an event
    Notify(Notification),
    /// Open an outbound peer connection
    ConnectPeer {
        /// `host:port` as given by the hub
        addr: String,
    },
    /// Evaluate a search and emit the responses
    Search(SearchRequest),
    /// Abort any transfer with this nick
    AbortTransfers {
        /// The departed nick
        nick: String,
    },
    /// Tear down and reconnect to a redirect target with the same
    /// credentials
    Reconnect {
        /// The new hub address
        addr: String,
    },
    /// Close the session
    Close,
}

/// Login progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the hub's `$Lock`
    AwaitingLock,
    /// Nick validated, waiting for `$Hello` (or `$GetPass` first)
    AwaitingHello,
    /// Fully logged in
    LoggedIn,
}

/// One hub session
pub struct HubSession {
    /// The hub's address as dialled
    pub address: String,
    /// Negotiated text encoding
    pub encoding: HubEncoding,
    /// Our identity here
    pub me: HubIdentity,
    /// Hub display name; the address until `$HubName` arrives
    pub hub_name: String,
    /// Set when a disconnect is ours or announced
    pub expected_disconnect: bool,
    /// Follow `$ForceMove` automatically
    pub follow_redirects: bool,
    /// Honour hub-reported `$UserIP` for ourselves
    pub allow_hub_ip_override: bool,
    /// Our address as this hub knows it
    pub my_ip: Option<String>,

    state: State,
    users: HashMap<String, User>,
    extended: bool,
    is_operator: bool,
    is_registered: bool,
    has_nogetinfo: bool,
    has_userip: bool,
    got_user_commands: bool,
    user_commands: Vec<StoredUserCommand>,
}

impl HubSession {
    /// A session about to log in to `address`
    #[must_use]
    pub fn new(
        address: String,
        encoding: HubEncoding,
        me: HubIdentity,
        follow_redirects: bool,
        allow_hub_ip_override: bool,
    ) -> Self {
        Self {
            hub_name: address.clone(),
            address,
            encoding,
            me,
            expected_disconnect: false,
            follow_redirects,
            allow_hub_ip_override,
            my_ip: None,
            state: State::AwaitingLock,
            users: HashMap::new(),
            extended: false,
            is_operator: false,
            is_registered: false,
            has_nogetinfo: false,
            has_userip: false,
            got_user_commands: false,
            user_commands: Vec::new(),
        }
    }

    /// Fully logged in?
    #[must_use]
    pub fn logged_in(&self) -> bool {
        self.state == State::LoggedIn
    }

    /// We hold operator status here
    #[must_use]
    pub fn is_operator(&self) -> bool {
        self.is_operator
    }

    /// Look up a user by nick
    #[must_use]
    pub fn user(&self, nick: &str) -> Option<&User> {
        self.users.get(nick)
    }

    /// Number of users seen
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Stored user commands, in arrival order
    #[must_use]
    pub fn user_commands(&self) -> &[StoredUserCommand] {
        &self.user_commands
    }

    /// Update the share size advertised by the next `$MyINFO`
    pub fn set_share_size(&mut self, size: u64) {
        self.me.share_size = size;
    }

    /// Encode an outbound command, terminator included
    fn cmd(&self, text: &str) -> HubAction {
        let mut bytes = self.encoding.encode_escaped(text);
        bytes.push(b'|');
        HubAction::Send(bytes)
    }

    /// Send raw bytes plus terminator, bypassing the encoding boundary
    fn cmd_raw(&self, mut bytes: Vec<u8>) -> HubAction {
        bytes.push(b'|');
        HubAction::Send(bytes)
    }

    fn my_info_line(&self) -> String {
        let info = UserInfo {
            nick: self.me.nick.clone(),
            description: self.me.description.clone(),
            tag: Some(self.me.tag.clone()),
            speed: format!("{}\u{1}", self.me.speed),
            email: self.me.email.clone(),
            shared_size: self.me.share_size,
        };
        format!("$MyINFO {}", info.format())
    }

    /// The harmless line sent when the idle timer fires
    #[must_use]
    pub fn keepalive(&self) -> Vec<u8> {
        b"|".to_vec()
    }

    /// Re-announce ourselves after the share size changed
    pub fn my_info_refresh(&mut self, share_size: u64) -> Vec<HubAction> {
        self.me.share_size = share_size;
        if self.logged_in() {
            vec![self.cmd(&self.my_info_line())]
        } else {
            Vec::new()
        }
    }

    /// Consume one raw line (without the terminator) from the hub
    pub fn handle_line(&mut self, raw: &[u8]) -> Vec<HubAction> {
        // $Lock is handled before any encoding conversion
        if let Some(rest) = raw.strip_prefix(b"$Lock ".as_ref()) {
            return self.handle_lock(rest);
        }

        let decoded = self.encoding.decode_lossy(raw);
        let decoded = if escape::has_entities(&decoded) {
            escape::unescape(&decoded)
        } else {
            decoded
        };
        if decoded.is_empty() {
            return Vec::new();
        }

        match HubCommand::parse(&decoded) {
            Ok(command) => self.dispatch(command),
            Err(e) => {
                warn!(hub = %self.address, error = %e, "unparsable hub command");
                Vec::new()
            }
        }
    }

    fn handle_lock(&mut self, args: &[u8]) -> Vec<HubAction> {
        if self.state != State::AwaitingLock {
            debug!(hub = %self.address, "already got a lock, ignoring");
            return Vec::new();
        }

        let (lock_part, _pk) = lock::split_lock_pk(args);
        self.extended = lock::is_extended(lock_part);

        let mut actions = Vec::new();
        if self.extended {
            actions.push(self.cmd(
                "$Supports UserCommand NoGetINFO NoHello UserIP2 TTHSearch ",
            ));
        }

        match lock::lock_to_key(lock_part) {
            Ok(key) => {
                let mut line = b"$Key ".to_vec();
                line.extend_from_slice(&key);
                actions.push(self.cmd_raw(line));
            }
            Err(e) => {
                warn!(hub = %self.address, error = %e, "unusable lock");
                actions.push(HubAction::Close);
                return actions;
            }
        }

        self.state = State::AwaitingHello;
        actions.push(self.cmd(&format!("$ValidateNick {}", self.me.nick)));
        actions
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, command: HubCommand) -> Vec<HubAction> {
        let mut actions = Vec::new();

        match command {
            HubCommand::Hello(nick) => {
                if nick == self.me.nick {
                    if self.state != State::LoggedIn {
                        info!(hub = %self.address, "logged in");
                        self.state = State::LoggedIn;
                        actions.push(self.cmd("$Version 1,0091"));
                        actions.push(self.cmd("$GetNickList"));
                        actions.push(self.cmd(&self.my_info_line()));
                    }
                } else if !self.users.contains_key(&nick) {
                    self.users.insert(nick.clone(), User::placeholder(&nick));
                    actions.push(HubAction::Notify(Notification::UserLogin {
                        hub: self.address.clone(),
                        nick,
                    }));
                }
            }

            HubCommand::MyInfo(info) => {
                let mut user = User::from_info(&info);
                let known = match self.users.remove(&info.nick) {
                    Some(old) => {
                        user.is_operator = old.is_operator;
                        user.extra_slots = old.extra_slots;
                        user.ip = old.ip;
                        // an explicit active tag clears an inferred
                        // passive flag; otherwise pessimism survives
                        user.passive = if info.is_active() {
                            false
                        } else {
                            user.passive || old.passive
                        };
                        true
                    }
                    None => false,
                };
                let nick = user.nick.clone();
                self.users.insert(nick.clone(), user);

                actions.push(HubAction::Notify(if known {
                    Notification::UserUpdate {
                        hub: self.address.clone(),
                        nick,
                    }
                } else {
                    Notification::UserLogin {
                        hub: self.address.clone(),
                        nick,
                    }
                }));
            }

            HubCommand::OpList(ops) => {
                for nick in ops {
                    if nick == self.me.nick {
                        if !self.is_operator {
                            info!(hub = %self.address, "we are an operator here");
                        }
                        self.is_operator = true;
                        if !self.got_user_commands && self.user_commands.is_empty() {
                            self.seed_default_user_commands();
                        }
                        continue;
                    }

                    let user = self
                        .users
                        .entry(nick.clone())
                        .or_insert_with(|| User::placeholder(&nick));
                    if !user.is_operator {
                        user.is_operator = true;
                        actions.push(HubAction::Notify(Notification::UserUpdate {
                            hub: self.address.clone(),
                            nick,
                        }));
                    }
                }
            }

            HubCommand::NickList(nicks) => {
                if !self.has_nogetinfo {
                    for nick in nicks {
                        actions.push(
                            self.cmd(&format!("$GetINFO {nick} {}", self.me.nick)),
                        );
                    }
                }
            }

            HubCommand::HubName(name) => {
                info!(hub = %self.address, name, "hub name");
                self.hub_name = name.clone();
                actions.push(HubAction::Notify(Notification::HubName {
                    hub: self.address.clone(),
                    name,
                }));
            }

            HubCommand::ForceMove(target) => {
                self.expected_disconnect = true;
                actions.push(HubAction::Notify(Notification::HubRedirect {
                    hub: self.address.clone(),
                    target: target.clone(),
                }));
                if self.follow_redirects {
                    actions.push(HubAction::Reconnect { addr: target });
                } else {
                    actions.push(HubAction::Notify(Notification::StatusMessage {
                        hub: Some(self.address.clone()),
                        message: format!("Redirected to hub {target}"),
                    }));
                    actions.push(HubAction::Close);
                }
            }

            HubCommand::ConnectToMe { addr, .. } => {
                actions.push(HubAction::ConnectPeer { addr });
            }

            HubCommand::RevConnectToMe { from, to } => {
                if to != self.me.nick {
                    warn!(hub = %self.address, from, "RevConnectToMe for someone else");
                } else if let Some(peer_passive) =
                    self.users.get(&from).map(|u| u.passive)
                {
                    if !self.me.passive {
                        let ip = self.my_ip.clone().unwrap_or_default();
                        actions.push(self.cmd(&format!(
                            "$ConnectToMe {from} {ip}:{}",
                            self.me.port
                        )));
                    } else if !peer_passive {
                        // both passive; bounce back exactly once
                        debug!(hub = %self.address, from, "bouncing RevConnectToMe");
                        actions.push(self.cmd(&format!(
                            "$RevConnectToMe {} {from}",
                            self.me.nick
                        )));
                    } else {
                        info!(hub = %self.address, from, "both passive, ignoring request");
                    }

                    // the request itself reveals the sender as passive
                    if let Some(user) = self.users.get_mut(&from) {
                        user.passive = true;
                    }
                } else {
                    info!(hub = %self.address, from, "RevConnectToMe from unknown user");
                }
            }

            HubCommand::Search(request) => {
                actions.push(HubAction::Search(request));
            }

            HubCommand::SearchResponse(response) => {
                actions.push(HubAction::Notify(Notification::SearchResponse {
                    hub: self.address.clone(),
                    response,
                }));
            }

            HubCommand::PrivateMessage {
                from,
                display,
                message,
            } => {
                actions.push(HubAction::Notify(Notification::PrivateMessage {
                    hub: self.address.clone(),
                    nick: from,
                    display_nick: display,
                    message,
                }));
            }

            HubCommand::Chat { nick, message } => {
                if message.to_lowercase().contains("banned") {
                    self.expected_disconnect = true;
                }
                actions.push(HubAction::Notify(Notification::PublicMessage {
                    hub: self.address.clone(),
                    nick: nick.unwrap_or_else(|| "nobody".to_string()),
                    message,
                }));
            }

            HubCommand::GetPass => {
                self.is_registered = true;
                match &self.me.password {
                    Some(password) => {
                        actions.push(self.cmd(&format!("$MyPass {password}")));
                    }
                    None => {
                        actions.push(HubAction::Notify(Notification::NeedPassword {
                            hub: self.address.clone(),
                            nick: self.me.nick.clone(),
                        }));
                    }
                }
            }

            HubCommand::LogedIn => {
                // some hubs confirm a registered login this way; refresh
                // our visible state
                actions.push(self.cmd(&self.my_info_line()));
            }

            HubCommand::BadPass => {
                info!(hub = %self.address, "wrong password");
                self.expected_disconnect = true;
                actions.push(HubAction::Notify(Notification::StatusMessage {
                    hub: Some(self.address.clone()),
                    message: "The hub rejected the password".to_string(),
                }));
                actions.push(HubAction::Close);
            }

            HubCommand::ValidateDenide => {
                self.expected_disconnect = true;
                actions.push(HubAction::Notify(Notification::StatusMessage {
                    hub: Some(self.address.clone()),
                    message: "The hub didn't accept the nickname".to_string(),
                }));
                actions.push(HubAction::Close);
            }

            HubCommand::UserIp(pairs) => {
                for (nick, ip) in pairs {
                    if nick == self.me.nick {
                        if self.allow_hub_ip_override {
                            info!(hub = %self.address, ip, "hub reported our IP");
                            self.my_ip = Some(ip);
                        } else {
                            info!(hub = %self.address, ip, "ignoring hub-reported IP");
                        }
                    } else if let Some(user) = self.users.get_mut(&nick) {
                        user.ip = Some(ip);
                    }
                }
            }

            HubCommand::UserCommand {
                kind,
                context,
                title,
                command,
            } => {
                self.handle_user_command(kind, context, title, command);
            }

            HubCommand::Supports(features) => {
                for feature in features {
                    match feature.as_str() {
                        "NoGetINFO" => self.has_nogetinfo = true,
                        "NoHello" => {}
                        "UserIP" | "UserIP2" => self.has_userip = true,
                        other => {
                            debug!(hub = %self.address, feature = other, "unknown hub feature");
                        }
                    }
                }
            }

            HubCommand::Quit(nick) => {
                if self.users.remove(&nick).is_some() {
                    actions.push(HubAction::AbortTransfers { nick: nick.clone() });
                    actions.push(HubAction::Notify(Notification::UserLogout {
                        hub: self.address.clone(),
                        nick,
                    }));
                }
            }

            HubCommand::Unknown { name, args } => {
                debug!(hub = %self.address, command = name, args, "unknown hub command");
            }
        }

        actions
    }

    fn handle_user_command(
        &mut self,
        kind: UserCommandKind,
        context: u32,
        title: Option<String>,
        command: Option<String>,
    ) {
        self.got_user_commands = true;

        if context & 0x0F == 0 {
            info!(hub = %self.address, context, "unrecognised user-command context");
            return;
        }

        match kind {
            UserCommandKind::Separator => {
                self.user_commands.push(StoredUserCommand {
                    kind,
                    context,
                    title: None,
                    command: None,
                });
            }
            UserCommandKind::Clear => {
                self.user_commands.clear();
                self.seed_default_user_commands();
            }
            UserCommandKind::Raw | UserCommandKind::RawNickLimited => {
                let (Some(title), Some(command)) = (title, command) else {
                    info!(hub = %self.address, "malformed user-command, ignoring");
                    return;
                };

                // the body was entity-decoded with the rest of the line;
                // store it re-escaped and with a terminating encoded pipe
                let command = escape::escape(&command);
                let command = if command.ends_with("&#124;") {
                    command
                } else {
                    format!("{command}&#124;")
                };
                self.user_commands.push(StoredUserCommand {
                    kind,
                    context,
                    title: Some(title),
                    command: Some(command),
                });
            }
        }
    }

    fn seed_default_user_commands(&mut self) {
        // operator conveniences every NMDC hub understands
        for (title, body) in [
            ("Kick", "<%[mynick]> !kick %[nick]&#124;"),
            ("Redirect", "$OpForceMove $Who:%[nick]$Where:%[line:Target]$Msg:%[line:Message]&#124;"),
        ] {
            self.user_commands.push(StoredUserCommand {
                kind: UserCommandKind::Raw,
                context: 2,
                title: Some(title.to_string()),
                command: Some(body.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> HubIdentity {
        HubIdentity {
            nick: "me".to_string(),
            description: "desc".to_string(),
            tag: "<puck V:0.3,M:A,H:1/0/0,S:3>".to_string(),
            email: String::new(),
            speed: "Cable".to_string(),
            password: None,
            passive: false,
            port: 1412,
            share_size: 1000,
        }
    }

    fn session() -> HubSession {
        HubSession::new(
            "hub.example.org:411".to_string(),
            HubEncoding::default(),
            identity(),
            true,
            true,
        )
    }

    fn sent_lines(actions: &[HubAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Send(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_lock_triggers_key_and_validate() {
        let mut hub = session();
        let actions = hub.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=hubsoft");
        let lines = sent_lines(&actions);

        assert!(lines[0].starts_with("$Supports UserCommand NoGetINFO"));
        assert!(lines[1].starts_with("$Key "));
        assert_eq!(lines[2], "$ValidateNick me|");

        // a second lock is ignored
        assert!(hub.handle_line(b"$Lock AGAIN Pk=x").is_empty());
    }

    #[test]
    fn test_classic_lock_skips_supports() {
        let mut hub = session();
        let actions = hub.handle_line(b"$Lock OLDSCHOOL Pk=hubsoft");
        let lines = sent_lines(&actions);
        assert!(lines[0].starts_with("$Key "));
        assert_eq!(lines[1], "$ValidateNick me|");
    }

    #[test]
    fn test_hello_logs_in_once() {
        let mut hub = session();
        hub.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=x");

        let actions = hub.handle_line(b"$Hello me");
        let lines = sent_lines(&actions);
        assert!(hub.logged_in());
        assert_eq!(lines[0], "$Version 1,0091|");
        assert_eq!(lines[1], "$GetNickList|");
        assert!(lines[2].starts_with("$MyINFO $ALL me desc<puck"));
        assert!(lines[2].contains("$1000$"));

        // repeated Hello for ourselves does nothing
        assert!(hub.handle_line(b"$Hello me").is_empty());
    }

    #[test]
    fn test_getpass_with_and_without_password() {
        let mut hub = session();
        hub.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=x");

        let actions = hub.handle_line(b"$GetPass");
        assert!(matches!(
            actions[0],
            HubAction::Notify(Notification::NeedPassword { .. })
        ));

        hub.me.password = Some("sekrit".to_string());
        let actions = hub.handle_line(b"$GetPass");
        assert_eq!(sent_lines(&actions), vec!["$MyPass sekrit|"]);
    }

    #[test]
    fn test_bad_pass_closes_expectedly() {
        let mut hub = session();
        hub.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=x");
        let actions = hub.handle_line(b"$BadPass");
        assert!(hub.expected_disconnect);
        assert!(matches!(actions.last(), Some(HubAction::Close)));
    }

    #[test]
    fn test_myinfo_tracks_users_and_merges_op() {
        let mut hub = session();
        hub.handle_line(b"$OpList nisse$$");
        assert!(hub.user("nisse").unwrap().is_operator);

        let actions =
            hub.handle_line(b"$MyINFO $ALL nisse desc<++ V:1,M:P,H:1/0/0,S:2>$ $DSL\x01$e@x$42$");
        let user = hub.user("nisse").unwrap();
        // operator status survives the MyINFO replacement
        assert!(user.is_operator);
        assert!(user.passive);
        assert_eq!(user.shared_size, 42);
        assert!(matches!(
            actions[0],
            HubAction::Notify(Notification::UserUpdate { .. })
        ));

        // an active tag clears the inferred passive flag
        hub.handle_line(b"$MyINFO $ALL nisse desc<++ V:1,M:A,H:1/0/0,S:2>$ $DSL\x01$e@x$42$");
        assert!(!hub.user("nisse").unwrap().passive);
    }

    #[test]
    fn test_nicklist_fans_out_getinfo_unless_nogetinfo() {
        let mut hub = session();
        let actions = hub.handle_line(b"$NickList a$$b$$");
        assert_eq!(
            sent_lines(&actions),
            vec!["$GetINFO a me|", "$GetINFO b me|"]
        );

        hub.handle_line(b"$Supports NoGetINFO NoHello");
        assert!(hub.handle_line(b"$NickList a$$b$$").is_empty());
    }

    #[test]
    fn test_quit_aborts_transfers() {
        let mut hub = session();
        hub.handle_line(b"$MyINFO $ALL nisse d$ $x\x01$$1$");
        let actions = hub.handle_line(b"$Quit nisse");
        assert!(matches!(
            actions[0],
            HubAction::AbortTransfers { ref nick } if nick == "nisse"
        ));
        assert!(hub.user("nisse").is_none());

        // unknown nick: nothing happens
        assert!(hub.handle_line(b"$Quit ghost").is_empty());
    }

    #[test]
    fn test_force_move_follows_redirect() {
        let mut hub = session();
        let actions = hub.handle_line(b"$ForceMove other.hub:411");
        assert!(hub.expected_disconnect);
        assert!(matches!(
            actions[1],
            HubAction::Reconnect { ref addr } if addr == "other.hub:411"
        ));
    }

    #[test]
    fn test_force_move_without_follow_closes() {
        let mut hub = session();
        hub.follow_redirects = false;
        let actions = hub.handle_line(b"$ForceMove other.hub:411");
        assert!(matches!(actions.last(), Some(HubAction::Close)));
    }

    #[test]
    fn test_rev_connect_to_me_active_answers_connect() {
        let mut hub = session();
        hub.my_ip = Some("1.2.3.4".to_string());
        hub.handle_line(b"$MyINFO $ALL nisse d$ $x\x01$$1$");

        let actions = hub.handle_line(b"$RevConnectToMe nisse me");
        assert_eq!(sent_lines(&actions), vec!["$ConnectToMe nisse 1.2.3.4:1412|"]);
        // the requester revealed itself as passive
        assert!(hub.user("nisse").unwrap().passive);
    }

    #[test]
    fn test_rev_connect_to_me_passive_bounces_once() {
        let mut hub = session();
        hub.me.passive = true;
        hub.handle_line(b"$MyINFO $ALL nisse d$ $x\x01$$1$");

        let actions = hub.handle_line(b"$RevConnectToMe nisse me");
        assert_eq!(sent_lines(&actions), vec!["$RevConnectToMe me nisse|"]);

        // second request: the peer is now known passive, no bounce
        let actions = hub.handle_line(b"$RevConnectToMe nisse me");
        assert!(sent_lines(&actions).is_empty());
    }

    #[test]
    fn test_connect_to_me_opens_peer() {
        let mut hub = session();
        let actions = hub.handle_line(b"$ConnectToMe me 5.6.7.8:412");
        assert!(matches!(
            actions[0],
            HubAction::ConnectPeer { ref addr } if addr == "5.6.7.8:412"
        ));
    }

    #[test]
    fn test_search_dispatch_and_chat() {
        let mut hub = session();
        let actions = hub.handle_line(b"$Search 1.2.3.4:412 T?F?1000?1?foo");
        assert!(matches!(actions[0], HubAction::Search(_)));

        let actions = hub.handle_line(b"<nisse> hello everyone");
        assert!(matches!(
            actions[0],
            HubAction::Notify(Notification::PublicMessage { ref nick, .. }) if nick == "nisse"
        ));
    }

    #[test]
    fn test_banned_chat_marks_expected_disconnect() {
        let mut hub = session();
        hub.handle_line(b"<hub-sec> You are BANNED until tomorrow");
        assert!(hub.expected_disconnect);
    }

    #[test]
    fn test_userip_override_policy() {
        let mut hub = session();
        hub.handle_line(b"$UserIP2 me 9.9.9.9");
        assert_eq!(hub.my_ip.as_deref(), Some("9.9.9.9"));

        hub.allow_hub_ip_override = false;
        hub.handle_line(b"$UserIP2 me 8.8.8.8");
        assert_eq!(hub.my_ip.as_deref(), Some("9.9.9.9"));
    }

    #[test]
    fn test_user_command_storage_and_clear() {
        let mut hub = session();
        hub.handle_line(b"$UserCommand 1 3 Title$Body");
        assert_eq!(hub.user_commands().len(), 1);
        assert_eq!(
            hub.user_commands()[0].command.as_deref(),
            Some("Body&#124;")
        );

        hub.handle_line(b"$UserCommand 255 15");
        // cleared and re-seeded with the defaults
        assert!(!hub.user_commands().is_empty());
        assert!(hub
            .user_commands()
            .iter()
            .all(|c| matches!(c.kind, UserCommandKind::Raw)));
    }

    #[test]
    fn test_outbound_encoding_applied() {
        let mut hub = session();
        hub.me.nick = "r\u{e4}v".to_string();
        let actions = hub.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=x");
        let HubAction::Send(bytes) = &actions[2] else {
            panic!("expected send");
        };
        // 0xE4 is 'ä' in Windows-1252
        assert_eq!(bytes.as_slice(), b"$ValidateNick r\xE4v|");
    }
}
