//! The peer connection state machine.
//!
//! Both sides of an NMDC client-client connection walk the same
//! handshake: `$MyNick`, `$Lock`/`$Key`, optional `$Supports`, and
//! `$Direction` with a random challenge deciding who downloads when both
//! want to. After the handshake the connection serves upload requests or
//! drives the download of the highest-priority queued item for the
//! peer's nick.
//!
//! Like [`crate::hub::HubSession`], this is a pure state machine: it
//! consumes lines and emits [`PeerAction`]s, and touches engine state
//! only through the [`PeerCtx`] it is handed.

use std::path::{Path, PathBuf};

use puck_hash::Tth;
use puck_proto::command::AdcPayload;
use puck_proto::{lock, HubEncoding, PeerCommand};
use puck_queue::{NextItem, Queue};
use puck_share::{Share, TthStore};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::slots::{SlotManager, SlotState};

/// Transfer direction of this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Not yet negotiated
    Unknown,
    /// We serve files
    Upload,
    /// We fetch files
    Download,
}

impl Direction {
    fn wire(self) -> &'static str {
        match self {
            Self::Upload => "Upload",
            Self::Download => "Download",
            Self::Unknown => "Unknown",
        }
    }
}

/// Features the peer announced in `$Supports`
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFeatures {
    /// Small files and filelists may use a minislot
    pub minislots: bool,
    /// Peer serves/accepts `files.xml.bz2`
    pub xmlbzlist: bool,
    /// Peer speaks `$ADCGET`/`$ADCSND`
    pub adcget: bool,
    /// Peer serves Tiger tree leaves
    pub tthl: bool,
    /// Peer accepts `TTH/<hash>` paths
    pub tthf: bool,
}

/// Handshake and transfer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the peer's `$MyNick`
    MyNick,
    /// Waiting for the peer's `$Lock`
    Lock,
    /// Waiting for `$Direction`
    Direction,
    /// Waiting for `$Key`
    Key,
    /// Handshake done; idle
    Ready,
    /// A request is in flight
    Request,
    /// Bytes are streaming
    Busy,
}

/// A pending upload
#[derive(Debug)]
struct Upload {
    /// Local file; `None` when serving leaf data from memory
    path: Option<PathBuf>,
    offset: u64,
    count: u64,
    leaves: Option<Vec<u8>>,
}

/// A pending download
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    /// What the bytes are for
    pub kind: DownloadKind,
    /// Offset the transfer starts at
    pub offset: u64,
    /// Bytes to read; announced by the peer
    pub count: u64,
    /// Expected content hash, when known
    pub tth: Option<Tth>,
}

/// What a download produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadKind {
    /// A queued file target
    File {
        /// The local target path
        target: String,
    },
    /// A nick's filelist
    Filelist {
        /// The nick whose list is being fetched
        nick: String,
        /// True when the list is bzip2-compressed XML
        compressed: bool,
    },
}

/// Engine state a peer connection may touch while handling a line
pub struct PeerCtx<'a> {
    /// The share index, for upload path resolution
    pub share: &'a mut Share,
    /// The TTH store, for leaf data and TTH path lookups
    pub store: &'a mut TthStore,
    /// The download queue
    pub queue: &'a mut Queue,
    /// The global slot table
    pub slots: &'a mut SlotManager,
    /// The working directory holding our own filelist
    pub workdir: &'a Path,
}

/// What the engine must do after a peer line was handled
#[derive(Debug)]
pub enum PeerAction {
    /// Write these bytes to the peer socket
    Send(Vec<u8>),
    /// Find the hub this nick is logged in to, then call
    /// [`PeerSession::attach_hub`]
    ResolveNick {
        /// The peer's nick
        nick: String,
    },
    /// The handshake finished; cancel its timeout
    HandshakeComplete,
    /// Ask the queue for the next item for this peer and call
    /// [`PeerSession::start_download_request`]
    RequestNext,
    /// Stream a file range to the peer
    StartUpload {
        /// Local file
        path: PathBuf,
        /// First byte
        offset: u64,
        /// Byte count
        count: u64,
    },
    /// Stream an in-memory leaf-data payload to the peer
    SendLeaves {
        /// The raw leaf bytes
        data: Vec<u8>,
    },
    /// Read exactly the planned byte count into the plan's destination
    StartDownload(DownloadPlan),
    /// A download request failed and its source was handled; a status
    /// line should reach the front-end
    DownloadFailed {
        /// The failing target
        target: String,
        /// The peer's stated reason
        reason: String,
    },
    /// Close the connection
    Close {
        /// Human-readable cause, when one is known
        reason: Option<String>,
    },
}

/// One client-client connection
pub struct PeerSession {
    /// The peer's nick, known after `$MyNick`
    pub nick: Option<String>,
    /// The hub this peer was matched to
    pub hub_addr: Option<String>,
    /// True when the peer dialled us
    pub incoming: bool,

    state: State,
    direction: Direction,
    encoding: HubEncoding,
    my_nick: Option<String>,
    challenge: u32,
    extended: bool,
    features: PeerFeatures,
    slot: SlotState,
    upload: Option<Upload>,
    download: Option<DownloadPlan>,
    /// Target currently marked active in the queue
    active_target: Option<String>,
}

impl PeerSession {
    /// A session for a connection the peer opened
    #[must_use]
    pub fn incoming() -> Self {
        Self::new(true, None, None)
    }

    /// A session for a connection we are opening after `$ConnectToMe`;
    /// the hub context is known up front.
    #[must_use]
    pub fn outgoing(my_nick: String, hub_addr: String, encoding: HubEncoding) -> Self {
        Self::new(false, Some((my_nick, hub_addr)), Some(encoding))
    }

    fn new(
        incoming: bool,
        identity: Option<(String, String)>,
        encoding: Option<HubEncoding>,
    ) -> Self {
        let (my_nick, hub_addr) = match identity {
            Some((nick, hub)) => (Some(nick), Some(hub)),
            None => (None, None),
        };
        Self {
            nick: None,
            hub_addr,
            incoming,
            state: State::MyNick,
            direction: Direction::Unknown,
            encoding: encoding.unwrap_or_default(),
            my_nick,
            challenge: 0,
            extended: false,
            features: PeerFeatures::default(),
            slot: SlotState::None,
            upload: None,
            download: None,
            active_target: None,
        }
    }

    /// The greeting an outbound connection opens with
    #[must_use]
    pub fn greeting(&self) -> Vec<PeerAction> {
        let nick = self.my_nick.as_deref().unwrap_or_default();
        vec![
            self.send(&format!("$MyNick {nick}")),
            self.send_raw(format!("$Lock {}", lock::make_lock_pk("puck", env!("CARGO_PKG_VERSION"))).into_bytes()),
        ]
    }

    /// The negotiated direction
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The slot this connection holds
    #[must_use]
    pub fn slot(&self) -> SlotState {
        self.slot
    }

    /// The queue target this connection has marked active, if any
    #[must_use]
    pub fn active_target(&self) -> Option<&str> {
        self.active_target.as_deref()
    }

    /// Handshake finished?
    #[must_use]
    pub fn handshake_done(&self) -> bool {
        matches!(self.state, State::Ready | State::Request | State::Busy)
    }

    fn send(&self, text: &str) -> PeerAction {
        let mut bytes = self.encoding.encode_escaped(text);
        bytes.push(b'|');
        PeerAction::Send(bytes)
    }

    fn send_raw(&self, mut bytes: Vec<u8>) -> PeerAction {
        bytes.push(b'|');
        PeerAction::Send(bytes)
    }

    fn close(reason: impl Into<String>) -> Vec<PeerAction> {
        vec![PeerAction::Close {
            reason: Some(reason.into()),
        }]
    }

    /// Consume one raw line (without the terminator) from the peer
    pub fn handle_line(&mut self, raw: &[u8], ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        let command = match PeerCommand::parse(raw, self.encoding) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "unparsable peer command");
                return Vec::new();
            }
        };

        match command {
            PeerCommand::MyNick(nick) => self.on_my_nick(&nick),
            PeerCommand::Lock { lock, .. } => self.on_lock(&lock),
            PeerCommand::Supports(features) => {
                self.on_supports(&features);
                Vec::new()
            }
            PeerCommand::Direction {
                download,
                challenge,
            } => self.on_direction(download, challenge),
            PeerCommand::Key(_) => self.on_key(ctx),
            PeerCommand::Get { path, offset } => self.on_get(&path, offset, ctx),
            PeerCommand::Send => self.on_send(),
            PeerCommand::GetListLen => vec![self.send("$ListLen 42")],
            PeerCommand::UGetBlock {
                offset,
                count,
                path,
            } => self.on_uget_block(&path, offset, count, ctx),
            PeerCommand::AdcGet {
                payload,
                path,
                offset,
                count,
            } => self.on_adcget(payload, &path, offset, count, ctx),
            PeerCommand::AdcSnd { count, .. } => self.on_transfer_start(count),
            PeerCommand::Sending(count) => self.on_transfer_start(count),
            PeerCommand::FileLength(size) => self.on_file_length(size, ctx),
            PeerCommand::Failed(reason) => self.on_download_failed(&reason, ctx),
            PeerCommand::MaxedOut => {
                let mut actions = self.on_download_failed("no free slots", ctx);
                actions.extend(Self::close("peer has no free slots"));
                actions
            }
            PeerCommand::Unknown { name, .. } => {
                debug!(command = name, "unknown peer command");
                Vec::new()
            }
        }
    }

    fn on_my_nick(&mut self, nick: &str) -> Vec<PeerAction> {
        if self.state != State::MyNick {
            return Self::close("unexpected $MyNick");
        }
        if nick.contains('$') || nick.is_empty() {
            info!(nick, "invalid characters in nick, dropping peer");
            return Self::close("invalid nick");
        }

        self.nick = Some(nick.to_string());
        vec![PeerAction::ResolveNick {
            nick: nick.to_string(),
        }]
    }

    /// Called by the engine once the nick was matched to a hub.
    /// `existing_direction` is the direction of another live connection
    /// to the same nick, if there is one.
    pub fn attach_hub(
        &mut self,
        hub_addr: &str,
        my_nick: &str,
        encoding: HubEncoding,
        has_queued: bool,
        existing_direction: Option<Direction>,
    ) -> Vec<PeerAction> {
        self.hub_addr = Some(hub_addr.to_string());
        self.my_nick = Some(my_nick.to_string());
        self.encoding = encoding;

        self.direction = if has_queued {
            Direction::Download
        } else {
            Direction::Upload
        };

        // Double-connection resolution: a second link to a nick we are
        // already downloading from turns into an upload; a second upload
        // is refused outright.
        if let Some(existing) = existing_direction {
            match (existing, self.direction) {
                (Direction::Download, Direction::Download) => {
                    debug!(nick = ?self.nick, "already downloading, forcing upload mode");
                    self.direction = Direction::Upload;
                }
                (Direction::Upload, Direction::Upload) => {
                    warn!(nick = ?self.nick, "second upload connection, closing");
                    return Self::close("duplicate upload connection");
                }
                _ => {}
            }
        }

        self.state = State::Lock;

        if self.incoming {
            vec![
                self.send(&format!("$MyNick {my_nick}")),
                self.send_raw(
                    format!(
                        "$Lock {}",
                        lock::make_lock_pk("puck", env!("CARGO_PKG_VERSION"))
                    )
                    .into_bytes(),
                ),
            ]
        } else {
            Vec::new()
        }
    }

    /// The engine could not match the nick to any hub
    #[must_use]
    pub fn reject_unknown_nick(&self) -> Vec<PeerAction> {
        info!(nick = ?self.nick, "peer is not logged in on any hub");
        Self::close("unknown nick")
    }

    fn on_lock(&mut self, peer_lock: &[u8]) -> Vec<PeerAction> {
        if self.state != State::Lock {
            return Self::close("unexpected $Lock");
        }

        self.extended = lock::is_extended(peer_lock);

        let mut actions = Vec::new();
        if self.extended {
            actions.push(self.send("$Supports MiniSlots XmlBZList ADCGet TTHL TTHF "));
        }

        self.challenge = rand::thread_rng().gen();
        actions.push(self.send(&format!(
            "$Direction {} {}",
            self.direction.wire(),
            self.challenge
        )));

        match lock::lock_to_key(peer_lock) {
            Ok(key) => {
                let mut line = b"$Key ".to_vec();
                line.extend_from_slice(&key);
                actions.push(self.send_raw(line));
            }
            Err(e) => {
                warn!(error = %e, "unusable peer lock");
                return Self::close("unusable lock");
            }
        }

        self.state = State::Direction;
        actions
    }

    fn on_supports(&mut self, features: &[String]) {
        for feature in features {
            match feature.as_str() {
                "MiniSlots" => self.features.minislots = true,
                "XmlBZList" => self.features.xmlbzlist = true,
                "ADCGet" => self.features.adcget = true,
                "TTHL" => self.features.tthl = true,
                "TTHF" => self.features.tthf = true,
                other => debug!(feature = other, "peer supports unknown feature"),
            }
        }
    }

    fn on_direction(&mut self, peer_downloads: bool, peer_challenge: u32) -> Vec<PeerAction> {
        if self.state != State::Direction {
            return Self::close("unexpected $Direction");
        }

        if peer_downloads {
            if self.direction == Direction::Download {
                // both want to download; the higher challenge wins
                info!("double download connection");
                if self.challenge < peer_challenge {
                    info!("lost the challenge, switching to upload");
                    self.direction = Direction::Upload;
                } else if self.challenge == peer_challenge {
                    info!("direction challenge collision");
                    return Self::close("challenge collision");
                }
            }
        } else if self.direction == Direction::Upload {
            info!("double upload connection");
            return Self::close("both sides uploading");
        }

        self.state = State::Key;
        Vec::new()
    }

    fn on_key(&mut self, _ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        if self.state != State::Key {
            return Self::close("unexpected $Key");
        }

        // the key is never verified
        self.state = State::Ready;

        let mut actions = vec![PeerAction::HandshakeComplete];
        if self.direction == Direction::Download {
            actions.push(PeerAction::RequestNext);
        }
        actions
    }

    // ---- upload side ----------------------------------------------------

    /// Resolve a requested path to a local file. The well-known filelist
    /// names map into the working directory; everything else must be a
    /// hashed, shared file.
    fn resolve_upload(
        &self,
        ctx: &PeerCtx<'_>,
        path: &str,
    ) -> Result<(PathBuf, u64, bool), String> {
        if matches!(path, "files.xml.bz2" | "files.xml" | "MyList.DcLst") {
            let local = ctx.workdir.join(path);
            let size = local
                .metadata()
                .map_err(|_| "File Not Available".to_string())?
                .len();
            return Ok((local, size, true));
        }

        let local = if let Some(tth_str) = path.strip_prefix("TTH/") {
            let tth: Tth = tth_str
                .parse()
                .map_err(|_| "File Not Available".to_string())?;
            ctx.share
                .file_by_tth(&tth, ctx.store)
                .map(|(p, _)| p.to_path_buf())
        } else {
            ctx.share.virtual_to_local(path)
        };

        let local = local.ok_or_else(|| "File Not Available".to_string())?;
        let file = ctx
            .share
            .lookup(&local)
            .ok_or_else(|| "File Not Available".to_string())?;
        Ok((local, file.size, false))
    }

    fn begin_upload(
        &mut self,
        ctx: &mut PeerCtx<'_>,
        path: &str,
        offset: u64,
        count: Option<u64>,
    ) -> Result<(PathBuf, u64, u64), Vec<PeerAction>> {
        let (local, size, is_filelist) = match self.resolve_upload(ctx, path) {
            Ok(resolved) => resolved,
            Err(message) => {
                return Err(vec![self.send(&format!("$Error {message}"))]);
            }
        };

        if offset > size {
            return Err(vec![self.send("$Error Offset out of range")]);
        }
        let count = count.unwrap_or(size - offset).min(size - offset);

        let nick = self.nick.clone().unwrap_or_default();
        self.slot = ctx
            .slots
            .request(&nick, Some(size), is_filelist, self.features.minislots);
        if self.slot == SlotState::None {
            let mut actions = vec![self.send("$MaxedOut")];
            actions.extend(Self::close("no free slots"));
            return Err(actions);
        }

        self.upload = Some(Upload {
            path: Some(local.clone()),
            offset,
            count,
            leaves: None,
        });
        Ok((local, size, count))
    }

    fn on_get(&mut self, path: &str, offset: u64, ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        if self.state != State::Ready {
            return Self::close("unexpected $Get");
        }

        match self.begin_upload(ctx, path, offset, None) {
            Ok((_, size, _)) => {
                self.state = State::Request;
                vec![self.send(&format!("$FileLength {size}"))]
            }
            Err(actions) => actions,
        }
    }

    fn on_send(&mut self) -> Vec<PeerAction> {
        if self.state != State::Request {
            return Self::close("unexpected $Send");
        }
        let Some(upload) = self.upload.as_ref() else {
            return vec![self.send("$Error File Not Available")];
        };
        let Some(path) = upload.path.clone() else {
            return vec![self.send("$Error File Not Available")];
        };

        self.state = State::Busy;
        vec![PeerAction::StartUpload {
            path,
            offset: upload.offset,
            count: upload.count,
        }]
    }

    fn on_uget_block(
        &mut self,
        path: &str,
        offset: u64,
        count: Option<u64>,
        ctx: &mut PeerCtx<'_>,
    ) -> Vec<PeerAction> {
        if self.state != State::Ready {
            return Self::close("unexpected $UGetBlock");
        }

        match self.begin_upload(ctx, path, offset, count) {
            Ok((local, _, count)) => {
                self.state = State::Busy;
                vec![
                    self.send(&format!("$Sending {count}")),
                    PeerAction::StartUpload {
                        path: local,
                        offset,
                        count,
                    },
                ]
            }
            Err(actions) => actions,
        }
    }

    fn on_adcget(
        &mut self,
        payload: AdcPayload,
        path: &str,
        offset: u64,
        count: Option<u64>,
        ctx: &mut PeerCtx<'_>,
    ) -> Vec<PeerAction> {
        if self.state != State::Ready {
            return Self::close("unexpected $ADCGET");
        }

        match payload {
            AdcPayload::TthLeaves => self.on_adcget_tthl(path, ctx),
            AdcPayload::File => match self.begin_upload(ctx, path, offset, count) {
                Ok((local, _, count)) => {
                    self.state = State::Busy;
                    vec![
                        self.send(&format!("$ADCSND file {path} {offset} {count}")),
                        PeerAction::StartUpload {
                            path: local,
                            offset,
                            count,
                        },
                    ]
                }
                Err(actions) => actions,
            },
        }
    }

    fn on_adcget_tthl(&mut self, path: &str, ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        // leaf data is looked up by TTH; a filename form exists for the
        // benefit of broken clients
        let tth = match path.strip_prefix("TTH/") {
            Some(tth_str) => tth_str.parse::<Tth>().ok(),
            None => {
                warn!("peer asks for leaf data by filename");
                ctx.share
                    .virtual_to_local(path)
                    .and_then(|local| ctx.share.lookup(&local).map(|f| f.inode))
                    .and_then(|inode| ctx.store.tth_by_inode(inode))
            }
        };

        // served only while the content is still shared
        let tth = tth.filter(|t| ctx.share.file_by_tth(t, ctx.store).is_some());
        let Some(tth) = tth else {
            return vec![self.send("$Error File Not Available")];
        };

        let data = match ctx.store.load_leaf_data(tth) {
            Ok(data) => data.to_vec(),
            Err(e) => {
                warn!(%tth, error = %e, "leaf data unavailable");
                return vec![self.send("$Error File Not Available")];
            }
        };

        self.upload = Some(Upload {
            path: None,
            offset: 0,
            count: data.len() as u64,
            leaves: Some(data.clone()),
        });
        self.state = State::Busy;
        vec![
            self.send(&format!("$ADCSND tthl {path} 0 {}", data.len())),
            PeerAction::SendLeaves { data },
        ]
    }

    /// The engine finished streaming an upload
    pub fn upload_done(&mut self, ctx: &mut PeerCtx<'_>) {
        ctx.slots.release(self.slot);
        self.slot = SlotState::None;
        self.upload = None;
        self.state = State::Ready;
    }

    // ---- download side --------------------------------------------------

    /// Issue the request for the next queued item. `resume_offset` is
    /// the size of any partial local file.
    pub fn start_download_request(
        &mut self,
        item: &NextItem,
        resume_offset: u64,
        ctx: &mut PeerCtx<'_>,
    ) -> Vec<PeerAction> {
        if self.state != State::Ready || self.direction != Direction::Download {
            return Vec::new();
        }

        let actions = match item {
            NextItem::Filelist { nick } => {
                let (remote, compressed) = if self.features.xmlbzlist {
                    ("files.xml.bz2", true)
                } else {
                    ("MyList.DcLst", false)
                };
                self.download = Some(DownloadPlan {
                    kind: DownloadKind::Filelist {
                        nick: nick.clone(),
                        compressed,
                    },
                    offset: 0,
                    count: 0,
                    tth: None,
                });
                vec![self.request_line(remote, 0, None)]
            }
            NextItem::File {
                filename,
                source_filename,
                tth,
                ..
            } => {
                ctx.queue.set_active(filename, true);
                self.active_target = Some(filename.clone());

                self.download = Some(DownloadPlan {
                    kind: DownloadKind::File {
                        target: filename.clone(),
                    },
                    offset: resume_offset,
                    count: 0,
                    tth: *tth,
                });

                let remote = match tth {
                    Some(tth) if self.features.tthf && self.features.adcget => {
                        format!("TTH/{tth}")
                    }
                    _ => source_filename.clone(),
                };
                vec![self.request_line(&remote, resume_offset, None)]
            }
            NextItem::Directory { .. } => {
                // directories are resolved by the engine, not fetched
                return Vec::new();
            }
        };

        self.state = State::Request;
        actions
    }

    fn request_line(&self, remote: &str, offset: u64, count: Option<u64>) -> PeerAction {
        if self.features.adcget {
            let count = count.map_or(-1i64, |c| i64::try_from(c).unwrap_or(-1));
            self.send(&format!("$ADCGET file {remote} {offset} {count}"))
        } else {
            // classic $Get takes a 1-based offset
            self.send(&format!("$Get {remote}${}", offset + 1))
        }
    }

    fn on_file_length(&mut self, size: u64, ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        if self.state != State::Request {
            return Self::close("unexpected $FileLength");
        }
        let Some(plan) = self.download.as_mut() else {
            return Self::close("no download in flight");
        };

        plan.count = size.saturating_sub(plan.offset);
        if let DownloadKind::File { target } = &plan.kind {
            let stored = ctx.queue.lookup_target(target).map(|t| t.size);
            if stored != Some(size) {
                warn!(target, size, "peer reports a different size");
                let _ = ctx.queue.set_size(target, size);
            }
        }

        let plan = plan.clone();
        self.state = State::Busy;
        vec![
            self.send("$Send"),
            PeerAction::StartDownload(plan),
        ]
    }

    fn on_transfer_start(&mut self, count: u64) -> Vec<PeerAction> {
        if self.state != State::Request {
            return Self::close("unexpected transfer start");
        }
        let Some(plan) = self.download.as_mut() else {
            return Self::close("no download in flight");
        };

        plan.count = count;
        let plan = plan.clone();
        self.state = State::Busy;
        vec![PeerAction::StartDownload(plan)]
    }

    fn on_download_failed(&mut self, reason: &str, ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        let Some(plan) = self.download.take() else {
            return Vec::new();
        };
        self.state = State::Ready;

        let mut actions = Vec::new();
        if let DownloadKind::File { target } = &plan.kind {
            ctx.queue.set_active(target, false);
            self.active_target = None;
            if let Some(nick) = self.nick.clone() {
                // a source that cannot deliver is dropped
                let _ = ctx.queue.remove_source(target, &nick);
            }
            actions.push(PeerAction::DownloadFailed {
                target: target.clone(),
                reason: if reason.is_empty() {
                    "unknown reason".to_string()
                } else {
                    reason.to_string()
                },
            });
        }

        actions.push(PeerAction::RequestNext);
        actions
    }

    /// The engine finished reading a download. Clears transfer state and
    /// asks for the next item; queue completion bookkeeping happens in
    /// the engine where the bytes were verified.
    pub fn download_done(&mut self, ctx: &mut PeerCtx<'_>) -> Vec<PeerAction> {
        if let Some(target) = self.active_target.take() {
            ctx.queue.set_active(&target, false);
        }
        self.download = None;
        self.state = State::Ready;
        vec![PeerAction::RequestNext]
    }

    /// Release held resources on teardown
    pub fn on_close(&mut self, ctx: &mut PeerCtx<'_>) {
        ctx.slots.release(self.slot);
        self.slot = SlotState::None;
        if let Some(target) = self.active_target.take() {
            ctx.queue.set_active(&target, false);
        }
    }

    /// The plan currently being downloaded, when streaming
    #[must_use]
    pub fn download_plan(&self) -> Option<&DownloadPlan> {
        self.download.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use puck_queue::Queue;
    use puck_share::{Share, TthStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        workdir: PathBuf,
        share: Share,
        store: TthStore,
        queue: Queue,
        slots: SlotManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let workdir = dir.path().to_path_buf();
            let store = TthStore::open(workdir.join("tth2.db")).unwrap();
            let queue = Queue::open(workdir.join("queue.db")).unwrap();
            Self {
                _dir: dir,
                workdir,
                share: Share::new(),
                store,
                queue,
                slots: SlotManager::new(3),
            }
        }

        fn ctx(&mut self) -> PeerCtx<'_> {
            PeerCtx {
                share: &mut self.share,
                store: &mut self.store,
                queue: &mut self.queue,
                slots: &mut self.slots,
                workdir: &self.workdir,
            }
        }

        /// Share one real file, hashed
        fn share_file(&mut self, name: &str, content: &[u8], tth: Tth) -> PathBuf {
            let root = self.workdir.join("media");
            std::fs::create_dir_all(&root).unwrap();
            let path = root.join(name);
            std::fs::write(&path, content).unwrap();

            if self.share.mounts().next().is_none() {
                self.share.add_mountpoint(&root).unwrap();
            }
            let id = self.share.mounts().next().unwrap().0;
            self.share.begin_scan(id);
            let files = puck_share::walk_mountpoint(&root).unwrap();
            self.share.apply_scan(id, files, &mut self.store).unwrap();
            self.share
                .on_tth_available(
                    &path,
                    Some((tth, "QUJDREVGR0hJSktMTU5PUFFSU1RVVlc=", 1)),
                    &mut self.store,
                )
                .unwrap();
            path
        }
    }

    fn sent_lines(actions: &[PeerAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                PeerAction::Send(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect()
    }

    /// Walk an incoming session through the handshake into Ready
    fn handshake(fx: &mut Fixture, has_queued: bool) -> PeerSession {
        let mut peer = PeerSession::incoming();
        let actions = peer.handle_line(b"$MyNick nisse", &mut fx.ctx());
        assert!(matches!(actions[0], PeerAction::ResolveNick { .. }));

        let actions = peer.attach_hub(
            "hub:411",
            "me",
            HubEncoding::default(),
            has_queued,
            None,
        );
        assert!(sent_lines(&actions)[0].starts_with("$MyNick me"));

        peer.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=other", &mut fx.ctx());
        peer.handle_line(b"$Supports MiniSlots XmlBZList ADCGet TTHL TTHF ", &mut fx.ctx());

        let dir_cmd: &[u8] = if has_queued {
            b"$Direction Upload 100"
        } else {
            b"$Direction Download 100"
        };
        peer.handle_line(dir_cmd, &mut fx.ctx());
        let actions = peer.handle_line(b"$Key whatever", &mut fx.ctx());
        assert!(actions
            .iter()
            .any(|a| matches!(a, PeerAction::HandshakeComplete)));
        assert!(peer.handshake_done());
        peer
    }

    #[test]
    fn test_handshake_upload_direction() {
        let mut fx = Fixture::new();
        let peer = handshake(&mut fx, false);
        assert_eq!(peer.direction(), Direction::Upload);
    }

    #[test]
    fn test_handshake_download_requests_queue_item() {
        let mut fx = Fixture::new();
        fx.queue
            .add_file("nisse", "media\\a.bin", 100, "a.bin", None, None, None)
            .unwrap();

        let mut peer = PeerSession::incoming();
        peer.handle_line(b"$MyNick nisse", &mut fx.ctx());
        peer.attach_hub("hub:411", "me", HubEncoding::default(), true, None);
        peer.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=x", &mut fx.ctx());
        peer.handle_line(b"$Direction Upload 1", &mut fx.ctx());
        let actions = peer.handle_line(b"$Key k", &mut fx.ctx());

        assert_eq!(peer.direction(), Direction::Download);
        assert!(actions.iter().any(|a| matches!(a, PeerAction::RequestNext)));
    }

    #[test]
    fn test_double_download_higher_challenge_wins() {
        let mut fx = Fixture::new();
        fx.queue
            .add_file("nisse", "x", 1, "x", None, None, None)
            .unwrap();

        let mut peer = PeerSession::incoming();
        peer.handle_line(b"$MyNick nisse", &mut fx.ctx());
        peer.attach_hub("hub:411", "me", HubEncoding::default(), true, None);
        peer.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=x", &mut fx.ctx());

        // peer also wants to download, with the maximum challenge; we
        // must yield and upload instead
        peer.handle_line(b"$Direction Download 4294967295", &mut fx.ctx());
        assert_eq!(peer.direction(), Direction::Upload);
    }

    #[test]
    fn test_double_connection_rules() {
        let mut fx = Fixture::new();

        // both sides uploading: refused
        let mut peer = PeerSession::incoming();
        peer.handle_line(b"$MyNick nisse", &mut fx.ctx());
        let actions = peer.attach_hub(
            "hub:411",
            "me",
            HubEncoding::default(),
            false,
            Some(Direction::Upload),
        );
        assert!(matches!(actions[0], PeerAction::Close { .. }));

        // second download becomes an upload
        let mut peer = PeerSession::incoming();
        peer.handle_line(b"$MyNick nisse", &mut fx.ctx());
        peer.attach_hub(
            "hub:411",
            "me",
            HubEncoding::default(),
            true,
            Some(Direction::Download),
        );
        assert_eq!(peer.direction(), Direction::Upload);
    }

    #[test]
    fn test_get_serves_shared_file() {
        let mut fx = Fixture::new();
        let tth: Tth = "7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI".parse().unwrap();
        let local = fx.share_file("song.mp3", &[7u8; 500], tth);
        let mut peer = handshake(&mut fx, false);

        let actions = peer.handle_line(b"$Get media\\song.mp3$1", &mut fx.ctx());
        assert_eq!(sent_lines(&actions), vec!["$FileLength 500|"]);

        let actions = peer.handle_line(b"$Send", &mut fx.ctx());
        match &actions[0] {
            PeerAction::StartUpload {
                path,
                offset,
                count,
            } => {
                assert_eq!(path, &local);
                assert_eq!(*offset, 0);
                assert_eq!(*count, 500);
            }
            other => panic!("expected upload, got {other:?}"),
        }

        peer.upload_done(&mut fx.ctx());
        assert_eq!(fx.slots.free(), 3);
    }

    #[test]
    fn test_get_unshared_file_is_an_error() {
        let mut fx = Fixture::new();
        let mut peer = handshake(&mut fx, false);
        let actions = peer.handle_line(b"$Get media\\nope.bin$1", &mut fx.ctx());
        assert_eq!(sent_lines(&actions), vec!["$Error File Not Available|"]);
    }

    #[test]
    fn test_adcget_file_by_tth_path() {
        let mut fx = Fixture::new();
        let tth: Tth = "7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI".parse().unwrap();
        fx.share_file("song.mp3", &[7u8; 500], tth);
        let mut peer = handshake(&mut fx, false);

        let actions = peer.handle_line(
            b"$ADCGET file TTH/7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI 100 -1",
            &mut fx.ctx(),
        );
        let lines = sent_lines(&actions);
        assert_eq!(
            lines[0],
            "$ADCSND file TTH/7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI 100 400|"
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, PeerAction::StartUpload { offset: 100, count: 400, .. })));
    }

    #[test]
    fn test_adcget_tthl_serves_leaves() {
        let mut fx = Fixture::new();
        let tth: Tth = "7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI".parse().unwrap();
        fx.share_file("song.mp3", &[7u8; 500], tth);
        let mut peer = handshake(&mut fx, false);

        let actions = peer.handle_line(
            b"$ADCGET tthl TTH/7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI 0 -1",
            &mut fx.ctx(),
        );
        let lines = sent_lines(&actions);
        assert!(lines[0].starts_with("$ADCSND tthl TTH/"));
        assert!(actions
            .iter()
            .any(|a| matches!(a, PeerAction::SendLeaves { .. })));
    }

    #[test]
    fn test_slot_denial_answers_maxed_out() {
        let mut fx = Fixture::new();
        fx.slots = SlotManager::new(0);
        let tth: Tth = "7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI".parse().unwrap();
        // large enough to miss the minislot path
        fx.share_file("big.bin", &vec![7u8; 100_000], tth);
        let mut peer = handshake(&mut fx, false);

        let actions = peer.handle_line(b"$Get media\\big.bin$1", &mut fx.ctx());
        let lines = sent_lines(&actions);
        assert_eq!(lines, vec!["$MaxedOut|"]);
        assert!(matches!(actions.last(), Some(PeerAction::Close { .. })));
    }

    #[test]
    fn test_get_list_len_stub() {
        let mut fx = Fixture::new();
        let mut peer = handshake(&mut fx, false);
        let actions = peer.handle_line(b"$GetListLen", &mut fx.ctx());
        assert_eq!(sent_lines(&actions), vec!["$ListLen 42|"]);
    }

    #[test]
    fn test_download_flow_adcget() {
        let mut fx = Fixture::new();
        fx.queue
            .add_file("nisse", "media\\a.bin", 400, "a.bin", None, None, None)
            .unwrap();
        let mut peer = handshake(&mut fx, true);

        let item = fx.queue.next_source_for("nisse").unwrap();
        let actions = peer.start_download_request(&item, 0, &mut fx.ctx());
        assert_eq!(sent_lines(&actions), vec!["$ADCGET file media\\a.bin 0 -1|"]);
        assert!(fx.queue.lookup_target("a.bin").unwrap().active);

        let actions = peer.handle_line(b"$ADCSND file media\\a.bin 0 400", &mut fx.ctx());
        match &actions[0] {
            PeerAction::StartDownload(plan) => {
                assert_eq!(plan.count, 400);
                assert_eq!(
                    plan.kind,
                    DownloadKind::File {
                        target: "a.bin".to_string(),
                    }
                );
            }
            other => panic!("expected download, got {other:?}"),
        }

        let actions = peer.download_done(&mut fx.ctx());
        assert!(matches!(actions[0], PeerAction::RequestNext));
        assert!(!fx.queue.lookup_target("a.bin").unwrap().active);
    }

    #[test]
    fn test_download_failure_drops_source_and_moves_on() {
        let mut fx = Fixture::new();
        fx.queue
            .add_file("nisse", "media\\a.bin", 400, "a.bin", None, None, None)
            .unwrap();
        let mut peer = handshake(&mut fx, true);

        let item = fx.queue.next_source_for("nisse").unwrap();
        peer.start_download_request(&item, 0, &mut fx.ctx());

        let actions = peer.handle_line(b"$Error File Not Available", &mut fx.ctx());
        assert!(matches!(
            actions[0],
            PeerAction::DownloadFailed { ref target, .. } if target == "a.bin"
        ));
        assert!(matches!(actions[1], PeerAction::RequestNext));

        // the failing source is gone
        assert!(!fx.queue.has_source_for("nisse"));
    }

    #[test]
    fn test_filelist_request_prefers_bz2() {
        let mut fx = Fixture::new();
        fx.queue.add_filelist("nisse", false).unwrap();
        let mut peer = handshake(&mut fx, true);

        let item = fx.queue.next_source_for("nisse").unwrap();
        let actions = peer.start_download_request(&item, 0, &mut fx.ctx());
        assert_eq!(
            sent_lines(&actions),
            vec!["$ADCGET file files.xml.bz2 0 -1|"]
        );
    }

    #[test]
    fn test_commands_out_of_order_close() {
        let mut fx = Fixture::new();
        let mut peer = PeerSession::incoming();
        // $Get before the handshake is a protocol violation
        let actions = peer.handle_line(b"$Get x$1", &mut fx.ctx());
        assert!(matches!(actions[0], PeerAction::Close { .. }));
    }
}
