//! The engine actor.
//!
//! One task owns every piece of mutable state: the share, the TTH
//! store, the queue, the slot table and all hub and peer sessions.
//! Socket tasks feed it events over a channel and never touch state, so
//! invariants hold between event dispatches without any locking.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use puck_proto::{control as controline, HubEncoding, SearchOrigin, SearchRequest};
use puck_queue::{NextItem, Priority, Queue, QueueEvent};
use puck_share::{filelist, MountId, ScannedFile, Share, TthStore};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{Notification, NotificationCenter};
use crate::config::{Config, HANDSHAKE_TIMEOUT, HUB_IDLE_TIMEOUT, PROGRESS_TIMEOUT};
use crate::control::{self, ControlRequest};
use crate::error::Error;
use crate::extip::{self, ExtIp};
use crate::hub::{HubAction, HubIdentity, HubSession};
use crate::net::{self, ReadDirective, ReadEvent, WriteEvent, WriteItem};
use crate::peer::{DownloadKind, DownloadPlan, PeerAction, PeerCtx, PeerSession};
use crate::search;
use crate::slots::SlotManager;

/// Stable identifier of a hub session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HubId(u64);

/// Stable identifier of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

/// Stable identifier of a control-bus client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// The reserved id used when the process itself injects a control
    /// line, e.g. from a signal handler.
    #[must_use]
    pub fn internal() -> Self {
        Self(0)
    }
}

/// Everything that can wake the engine
#[derive(Debug)]
pub enum Event {
    /// An outbound hub dial finished
    HubConnected {
        /// The session the dial belongs to
        id: HubId,
        /// The socket, when the dial succeeded
        stream: Result<TcpStream, String>,
    },
    /// A line arrived from a hub
    HubLine {
        /// The session
        id: HubId,
        /// Raw frame without the terminator
        line: Vec<u8>,
    },
    /// A hub socket ended
    HubClosed {
        /// The session
        id: HubId,
        /// The error, when it was not a clean EOF
        error: Option<String>,
    },
    /// A peer dialled our listen port
    PeerIncoming {
        /// The accepted socket
        stream: TcpStream,
    },
    /// An outbound peer dial finished
    PeerConnected {
        /// The session the dial belongs to
        id: PeerId,
        /// The socket, when the dial succeeded
        stream: Result<TcpStream, String>,
    },
    /// A peer reader produced something
    PeerRead {
        /// The connection
        id: PeerId,
        /// What happened
        event: ReadEvent,
    },
    /// A peer writer produced something
    PeerWrite {
        /// The connection
        id: PeerId,
        /// What happened
        event: WriteEvent,
    },
    /// A finished download passed (or failed) its content check
    DownloadVerified {
        /// The connection that fetched it
        id: PeerId,
        /// The plan that finished
        plan: DownloadPlan,
        /// Whether the bytes match the expected hash
        ok: bool,
    },
    /// A control client connected
    ControlConnected {
        /// The new client
        id: ClientId,
        /// Channel to its writer task
        writer: mpsc::UnboundedSender<String>,
    },
    /// A control client sent a line
    ControlLine {
        /// The client
        id: ClientId,
        /// The raw line
        line: String,
    },
    /// A control client went away
    ControlClosed {
        /// The client
        id: ClientId,
    },
    /// A line arrived from the hasher daemon
    HasherLine {
        /// The raw line
        line: String,
    },
    /// The hasher connection died
    HasherClosed,
    /// A UDP datagram arrived on the search port
    UdpPacket {
        /// The raw datagram
        data: Vec<u8>,
    },
    /// A share walk finished
    ScanDone {
        /// The mountpoint
        mount: MountId,
        /// Its local root
        root: PathBuf,
        /// The walk result
        result: Result<Vec<ScannedFile>, String>,
    },
    /// An external IP probe finished
    ExtIpResult {
        /// The detected address, when any host answered
        ip: Option<Ipv4Addr>,
    },
    /// Periodic housekeeping
    Tick,
}

struct HubConn {
    session: HubSession,
    writer: mpsc::UnboundedSender<WriteItem>,
    last_activity: Instant,
    keepalive_sent: bool,
    local_ip: Option<Ipv4Addr>,
    remote_ip: Option<Ipv4Addr>,
    connected: bool,
}

/// How many ended hub sessions are retained for restore
const MAX_RECENT_HUBS: usize = 10;

/// An ended hub session, retained so it can be reconnected with the
/// same credentials
#[derive(Debug, Clone)]
pub struct RecentHub {
    /// The hub's address as dialled
    pub address: String,
    /// The nick used there
    pub nick: String,
    /// The registered-nick password, when one was set
    pub password: Option<String>,
    /// The negotiated charset label
    pub encoding: String,
}

struct ActiveDownload {
    plan: DownloadPlan,
    dest: PathBuf,
    started: Instant,
}

struct PeerConn {
    session: PeerSession,
    writer: mpsc::UnboundedSender<WriteItem>,
    directives: mpsc::Sender<ReadDirective>,
    opened: Instant,
    last_progress: Instant,
    download: Option<ActiveDownload>,
    connected: bool,
}

/// The engine: state, sessions and the event loop
pub struct Engine {
    workdir: PathBuf,
    config: Config,
    share: Share,
    store: TthStore,
    queue: Queue,
    slots: SlotManager,
    nc: NotificationCenter,
    extip: ExtIp,

    hubs: HashMap<HubId, HubConn>,
    recent_hubs: Vec<RecentHub>,
    peers: HashMap<PeerId, PeerConn>,
    controls: HashMap<ClientId, mpsc::UnboundedSender<String>>,
    next_id: u64,

    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    hasher: Option<mpsc::UnboundedSender<String>>,
    udp: Option<std::sync::Arc<UdpSocket>>,
    probe_running: bool,
    shutting_down: bool,
}

impl Engine {
    /// Build an engine rooted in `workdir`, opening its stores.
    ///
    /// # Errors
    ///
    /// Fails when the TTH store or the queue store cannot be opened.
    pub fn new(workdir: PathBuf, config: Config) -> Result<Self, Error> {
        let store = TthStore::open_in(&workdir)?;
        let queue = Queue::open_in(&workdir)?;
        let static_ip = config
            .external_ip
            .as_deref()
            .and_then(|s| s.parse().ok());

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            slots: SlotManager::new(config.slots),
            extip: ExtIp::new(static_ip),
            workdir,
            config,
            share: Share::new(),
            store,
            queue,
            nc: NotificationCenter::new(),
            hubs: HashMap::new(),
            recent_hubs: Vec::new(),
            peers: HashMap::new(),
            controls: HashMap::new(),
            next_id: 0,
            tx,
            rx,
            hasher: None,
            udp: None,
            probe_running: false,
            shutting_down: false,
        })
    }

    /// A handle for publishing and subscribing to engine events
    #[must_use]
    pub fn notifications(&self) -> NotificationCenter {
        self.nc.clone()
    }

    /// A sender for injecting events; used by the binaries for signals
    #[must_use]
    pub fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn incomplete_path(&self, target: &str) -> PathBuf {
        self.workdir.join("incomplete").join(target)
    }

    fn finished_path(&self, target: &str) -> PathBuf {
        match &self.config.download_directory {
            Some(dir) => dir.join(target),
            None => self.workdir.join("done").join(target),
        }
    }

    /// Bind the listeners, connect the hasher and run until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the engine, after
    /// `server-died` was published.
    pub async fn run(mut self) -> Result<(), Error> {
        // peer listener (active mode)
        if !self.config.passive {
            let listener =
                TcpListener::bind(("0.0.0.0", self.config.port)).await?;
            let tx = self.tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound peer connection");
                            if tx.send(Event::PeerIncoming { stream }).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "peer accept failed");
                        }
                    }
                }
            });

            // UDP search responses
            let udp = std::sync::Arc::new(
                UdpSocket::bind(("0.0.0.0", self.config.port)).await?,
            );
            self.udp = Some(udp.clone());
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                while let Ok((n, _)) = udp.recv_from(&mut buf).await {
                    if tx.send(Event::UdpPacket {
                        data: buf[..n].to_vec(),
                    })
                    .is_err()
                    {
                        return;
                    }
                }
            });
        }

        self.spawn_control_listener()?;
        self.spawn_hasher_client();

        // housekeeping tick
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if tx.send(Event::Tick).is_err() {
                    return;
                }
            }
        });

        info!(workdir = %self.workdir.display(), "engine running");
        let result = self.event_loop().await;
        if let Err(e) = &result {
            warn!(error = %e, "engine stopped");
            self.nc.publish(Notification::ServerDied);
            self.flush_controls();
        }
        result
    }

    async fn event_loop(&mut self) -> Result<(), Error> {
        while let Some(event) = self.rx.recv().await {
            self.handle_event(event)?;
            if self.shutting_down {
                info!("engine shutting down");
                if let Some(hasher) = &self.hasher {
                    let _ = hasher.send("shutdown".to_string());
                }
                let _ = self.queue.compact();
                return Ok(());
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn handle_event(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::HubConnected { id, stream } => self.on_hub_connected(id, stream),
            Event::HubLine { id, line } => {
                if let Some(hub) = self.hubs.get_mut(&id) {
                    hub.last_activity = Instant::now();
                    hub.keepalive_sent = false;
                    let actions = hub.session.handle_line(&line);
                    self.apply_hub_actions(id, actions);
                }
            }
            Event::HubClosed { id, error } => self.on_hub_closed(id, error),
            Event::PeerIncoming { stream } => {
                let id = PeerId(self.next_id());
                self.register_peer(id, PeerSession::incoming(), stream, Vec::new());
            }
            Event::PeerConnected { id, stream } => match stream {
                Ok(stream) => {
                    if let Some(conn) = self.peers.remove(&id) {
                        let greeting = conn.session.greeting();
                        self.register_peer(id, conn.session, stream, greeting);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "outbound peer dial failed");
                    self.peers.remove(&id);
                }
            },
            Event::PeerRead { id, event } => self.on_peer_read(id, event),
            Event::PeerWrite { id, event } => self.on_peer_write(id, event),
            Event::DownloadVerified { id, plan, ok } => {
                self.on_download_verified(id, &plan, ok);
            }
            Event::ControlConnected { id, writer } => {
                let _ = writer.send(control::init_completion());
                self.controls.insert(id, writer);
            }
            Event::ControlLine { id, line } => {
                match ControlRequest::parse(&line) {
                    Some(request) => self.handle_control(request)?,
                    None => debug!(client = ?id, line, "ignoring control line"),
                }
            }
            Event::ControlClosed { id } => {
                self.controls.remove(&id);
            }
            Event::HasherLine { line } => self.on_hasher_line(&line)?,
            Event::HasherClosed => {
                return Err(Error::Fatal("lost the hasher process".to_string()));
            }
            Event::UdpPacket { data } => self.on_udp_packet(&data),
            Event::ScanDone {
                mount,
                root,
                result,
            } => self.on_scan_done(mount, &root, result)?,
            Event::ExtIpResult { ip } => {
                self.probe_running = false;
                if let Some(ip) = ip {
                    self.extip.set_detected(ip);
                    self.nc.publish(Notification::ExternalIpDetected {
                        ip: ip.to_string(),
                    });
                    self.refresh_hub_ips();
                }
            }
            Event::Tick => self.on_tick(),
        }
        Ok(())
    }

    // ---- hubs -----------------------------------------------------------

    /// Dial a hub and start a session once connected
    pub fn connect_hub(
        &mut self,
        addr: String,
        nick: Option<String>,
        password: Option<String>,
        encoding: Option<String>,
    ) {
        let id = HubId(self.next_id());
        let identity = HubIdentity {
            nick: nick.unwrap_or_else(|| self.config.nick.clone()),
            description: self.config.description.clone(),
            tag: self.config.tag(self.hubs.len() + 1),
            email: self.config.email.clone(),
            speed: self.config.speed.clone(),
            password,
            passive: self.config.passive,
            port: self.config.port,
            share_size: self.share.stats().size,
        };
        let encoding = encoding
            .as_deref()
            .map_or_else(HubEncoding::default, HubEncoding::from_label);

        let session = HubSession::new(
            addr.clone(),
            encoding,
            identity,
            self.config.follow_redirects,
            self.config.allow_hub_ip_override,
        );
        let (writer, _) = mpsc::unbounded_channel();
        self.hubs.insert(
            id,
            HubConn {
                session,
                writer,
                last_activity: Instant::now(),
                keepalive_sent: false,
                local_ip: None,
                remote_ip: None,
                connected: false,
            },
        );

        info!(addr, "connecting to hub");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Event::HubConnected { id, stream });
        });
    }

    fn on_hub_connected(&mut self, id: HubId, stream: Result<TcpStream, String>) {
        let Some(hub) = self.hubs.get_mut(&id) else {
            return;
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let addr = hub.session.address.clone();
                self.hubs.remove(&id);
                self.nc.publish(Notification::StatusMessage {
                    hub: Some(addr.clone()),
                    message: format!("Connection to {addr} failed: {e}"),
                });
                self.nc.publish(Notification::HubDisconnected {
                    hub: addr,
                    expected: false,
                });
                return;
            }
        };

        hub.connected = true;
        hub.local_ip = stream.local_addr().ok().and_then(|a| match a.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        });
        hub.remote_ip = stream.peer_addr().ok().and_then(|a| match a.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        });

        // the address we will advertise on this hub
        if let (Some(local), Some(remote)) = (hub.local_ip, hub.remote_ip) {
            hub.session.my_ip = Some(self.extip.address_for(local, remote).to_string());
        }

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        hub.writer = writer_tx;
        hub.last_activity = Instant::now();

        let (wevent_tx, mut wevent_rx) = mpsc::unbounded_channel();
        tokio::spawn(net::write_loop(write_half, writer_rx, wevent_tx));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            // a failed hub write surfaces as a close
            while let Some(event) = wevent_rx.recv().await {
                if let WriteEvent::Failed { error } = event {
                    let _ = tx.send(Event::HubClosed {
                        id,
                        error: Some(error),
                    });
                    return;
                }
            }
        });

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(read_half);
            loop {
                match net::read_frame(&mut reader).await {
                    Ok(Some(line)) => {
                        if tx.send(Event::HubLine { id, line }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Event::HubClosed { id, error: None });
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Event::HubClosed {
                            id,
                            error: Some(e.to_string()),
                        });
                        return;
                    }
                }
            }
        });
    }

    fn apply_hub_actions(&mut self, id: HubId, actions: Vec<HubAction>) {
        for action in actions {
            match action {
                HubAction::Send(bytes) => {
                    if let Some(hub) = self.hubs.get(&id) {
                        let _ = hub.writer.send(WriteItem::Line(bytes));
                    }
                }
                HubAction::Notify(notification) => self.nc.publish(notification),
                HubAction::ConnectPeer { addr } => self.connect_peer(id, addr),
                HubAction::Search(request) => self.handle_search(id, &request),
                HubAction::AbortTransfers { nick } => self.abort_transfers_with(&nick),
                HubAction::Reconnect { addr } => {
                    if let Some(hub) = self.hubs.remove(&id) {
                        self.nc.publish(Notification::HubDisconnected {
                            hub: hub.session.address.clone(),
                            expected: true,
                        });
                        let me = hub.session.me;
                        self.connect_hub(
                            addr,
                            Some(me.nick),
                            me.password,
                            Some(hub.session.encoding.name().to_string()),
                        );
                    }
                }
                HubAction::Close => {
                    self.on_hub_closed(id, None);
                }
            }
        }
    }

    fn on_hub_closed(&mut self, id: HubId, error: Option<String>) {
        let Some(hub) = self.hubs.remove(&id) else {
            return;
        };
        let expected = hub.session.expected_disconnect;
        info!(hub = %hub.session.address, expected, "hub session ended");

        // keep the credentials around so the session can be restored
        self.remember_recent(RecentHub {
            address: hub.session.address.clone(),
            nick: hub.session.me.nick.clone(),
            password: hub.session.me.password.clone(),
            encoding: hub.session.encoding.name().to_string(),
        });

        if let Some(error) = error {
            self.nc.publish(Notification::StatusMessage {
                hub: Some(hub.session.address.clone()),
                message: format!("Hub connection lost: {error}"),
            });
        }
        self.nc.publish(Notification::HubDisconnected {
            hub: hub.session.address,
            expected,
        });
    }

    /// Push onto the recently-connected list, most recent first, one
    /// entry per address.
    fn remember_recent(&mut self, entry: RecentHub) {
        self.recent_hubs.retain(|h| h.address != entry.address);
        self.recent_hubs.insert(0, entry);
        self.recent_hubs.truncate(MAX_RECENT_HUBS);
    }

    /// Hubs this engine was connected to, most recent first. A front-end
    /// restores a session by feeding these back into `connect-hub`.
    #[must_use]
    pub fn recent_hubs(&self) -> &[RecentHub] {
        &self.recent_hubs
    }

    fn refresh_hub_ips(&mut self) {
        for hub in self.hubs.values_mut() {
            if hub.session.my_ip.is_none() {
                if let (Some(local), Some(remote)) = (hub.local_ip, hub.remote_ip) {
                    hub.session.my_ip =
                        Some(self.extip.address_for(local, remote).to_string());
                }
            }
        }
    }

    // ---- search ---------------------------------------------------------

    fn handle_search(&mut self, id: HubId, request: &SearchRequest) {
        let Some(hub) = self.hubs.get(&id) else {
            return;
        };

        if search::is_self_search(
            request,
            &hub.session.me.nick,
            hub.session.my_ip.as_deref(),
            self.config.port,
        ) {
            debug!("ignoring our own search request");
            return;
        }

        let max = match request.origin {
            SearchOrigin::Active { .. } => search::MAX_RESULTS_ACTIVE,
            SearchOrigin::Passive { .. } => search::MAX_RESULTS_PASSIVE,
        };
        let hub_addr = match hub.remote_ip {
            Some(ip) => {
                let port = hub
                    .session
                    .address
                    .rsplit_once(':')
                    .and_then(|(_, p)| p.parse::<u16>().ok())
                    .unwrap_or(411);
                format!("{ip}:{port}")
            }
            None => hub.session.address.clone(),
        };
        let ctx = search::ResponseContext {
            my_nick: &hub.session.me.nick,
            hub_name: &hub.session.hub_name,
            hub_addr: &hub_addr,
            free_slots: self.slots.free(),
            total_slots: self.slots.total(),
        };
        let results = search::evaluate(&self.share, &self.store, request, &ctx, max);
        if results.is_empty() {
            return;
        }
        debug!(matches = results.len(), "search matched");

        match &request.origin {
            SearchOrigin::Passive { .. } => {
                for result in results {
                    let mut bytes = hub
                        .session
                        .encoding
                        .encode_escaped(&result.to_string());
                    bytes.push(b'|');
                    let _ = hub.writer.send(WriteItem::Line(bytes));
                }
            }
            SearchOrigin::Active { host, port } => {
                let Some(udp) = self.udp.clone() else {
                    return;
                };
                let encoding = hub.session.encoding;
                let dest = format!("{host}:{port}");
                let payload: Vec<Vec<u8>> = results
                    .iter()
                    .map(|r| {
                        let mut bytes = encoding.encode_escaped(&r.to_string());
                        bytes.push(b'|');
                        bytes
                    })
                    .collect();
                tokio::spawn(async move {
                    for datagram in payload {
                        if let Err(e) = udp.send_to(&datagram, &dest).await {
                            debug!(error = %e, dest, "UDP search response failed");
                            return;
                        }
                    }
                });
            }
        }
    }

    fn on_udp_packet(&mut self, data: &[u8]) {
        // search results from active peers arrive here
        let text = HubEncoding::default().decode_lossy(data);
        for line in text.split('|') {
            if let Some(args) = line.strip_prefix("$SR ") {
                self.nc.publish(Notification::SearchResponse {
                    hub: String::new(),
                    response: args.to_string(),
                });
            }
        }
    }

    // ---- peers ----------------------------------------------------------

    fn connect_peer(&mut self, hub_id: HubId, addr: String) {
        let Some(hub) = self.hubs.get(&hub_id) else {
            return;
        };
        let my_nick = hub.session.me.nick.clone();
        let address = hub.session.address.clone();
        let encoding = hub.session.encoding;
        let id = PeerId(self.next_id());
        let session = PeerSession::outgoing(my_nick, address, encoding);

        // parked until the dial resolves
        let (writer, _) = mpsc::unbounded_channel();
        let (directives, _) = mpsc::channel(1);
        self.peers.insert(
            id,
            PeerConn {
                session,
                writer,
                directives,
                opened: Instant::now(),
                last_progress: Instant::now(),
                download: None,
                connected: false,
            },
        );

        debug!(addr, "dialling peer");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Event::PeerConnected { id, stream });
        });
    }

    fn register_peer(
        &mut self,
        id: PeerId,
        session: PeerSession,
        stream: TcpStream,
        greeting: Vec<PeerAction>,
    ) {
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (wevent_tx, mut wevent_rx) = mpsc::unbounded_channel();
        tokio::spawn(net::write_loop(write_half, writer_rx, wevent_tx));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = wevent_rx.recv().await {
                if tx.send(Event::PeerWrite { id, event }).is_err() {
                    return;
                }
            }
        });

        let (revent_tx, mut revent_rx) = mpsc::unbounded_channel();
        let (directive_tx, directive_rx) = mpsc::channel(4);
        tokio::spawn(net::peer_read_loop(read_half, revent_tx, directive_rx));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = revent_rx.recv().await {
                if tx.send(Event::PeerRead { id, event }).is_err() {
                    return;
                }
            }
        });

        self.peers.insert(
            id,
            PeerConn {
                session,
                writer: writer_tx,
                directives: directive_tx,
                opened: Instant::now(),
                last_progress: Instant::now(),
                download: None,
                connected: true,
            },
        );
        self.apply_peer_actions(id, greeting);
    }

    fn peer_ctx(&mut self) -> PeerCtx<'_> {
        PeerCtx {
            share: &mut self.share,
            store: &mut self.store,
            queue: &mut self.queue,
            slots: &mut self.slots,
            workdir: &self.workdir,
        }
    }

    fn on_peer_read(&mut self, id: PeerId, event: ReadEvent) {
        match event {
            ReadEvent::Line(line) => {
                debug!(line = %String::from_utf8_lossy(&line), "<- peer");
                let Some(conn) = self.peers.get_mut(&id) else {
                    return;
                };
                let mut ctx = PeerCtx {
                    share: &mut self.share,
                    store: &mut self.store,
                    queue: &mut self.queue,
                    slots: &mut self.slots,
                    workdir: &self.workdir,
                };
                let actions = conn.session.handle_line(&line, &mut ctx);
                self.apply_peer_actions(id, actions);

                // lockstep: exactly one directive per line unless a
                // payload receive or a close was ordered
                if let Some(conn) = self.peers.get(&id) {
                    if conn.download.is_none() {
                        let _ = conn.directives.try_send(ReadDirective::Continue);
                    }
                }
            }
            ReadEvent::FileProgress { written } => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.last_progress = Instant::now();
                    if let Some(download) = &conn.download {
                        self.nc.publish(Notification::TransferStats {
                            nick: conn.session.nick.clone().unwrap_or_default(),
                            filename: match &download.plan.kind {
                                DownloadKind::File { target } => target.clone(),
                                DownloadKind::Filelist { nick, .. } => {
                                    format!("files.xml.{nick}")
                                }
                            },
                            bytes_done: written,
                            size: download.plan.count,
                            bytes_per_sec: rate(written, download.started),
                        });
                    }
                }
            }
            ReadEvent::FileDone { written } => self.on_download_bytes_done(id, written),
            ReadEvent::FileFailed { error } => {
                warn!(error, "download transfer failed");
                self.close_peer(id, Some("transfer failed".to_string()));
            }
            ReadEvent::Closed { error } => {
                self.close_peer(id, error);
            }
        }
    }

    fn apply_peer_actions(&mut self, id: PeerId, actions: Vec<PeerAction>) {
        for action in actions {
            match action {
                PeerAction::Send(bytes) => {
                    if let Some(conn) = self.peers.get(&id) {
                        let _ = conn.writer.send(WriteItem::Line(bytes));
                    }
                }
                PeerAction::ResolveNick { nick } => {
                    let followups = self.resolve_peer_nick(id, &nick);
                    self.apply_peer_actions(id, followups);
                }
                PeerAction::HandshakeComplete => {
                    if let Some(conn) = self.peers.get_mut(&id) {
                        conn.last_progress = Instant::now();
                    }
                }
                PeerAction::RequestNext => {
                    let followups = self.request_next_for_peer(id);
                    self.apply_peer_actions(id, followups);
                }
                PeerAction::StartUpload {
                    path,
                    offset,
                    count,
                } => {
                    if let Some(conn) = self.peers.get_mut(&id) {
                        conn.last_progress = Instant::now();
                        let _ = conn.writer.send(WriteItem::FileRange {
                            path,
                            offset,
                            count,
                        });
                    }
                }
                PeerAction::SendLeaves { data } => {
                    if let Some(conn) = self.peers.get(&id) {
                        let _ = conn.writer.send(WriteItem::Bytes(data));
                    }
                }
                PeerAction::StartDownload(plan) => self.start_download(id, plan),
                PeerAction::DownloadFailed { target, reason } => {
                    let nick = self
                        .peers
                        .get(&id)
                        .and_then(|c| c.session.nick.clone())
                        .unwrap_or_default();
                    self.nc.publish(Notification::StatusMessage {
                        hub: None,
                        message: format!(
                            "Download of {target} from {nick} failed: {reason}"
                        ),
                    });
                }
                PeerAction::Close { reason } => {
                    self.close_peer(id, reason);
                }
            }
        }
    }

    fn resolve_peer_nick(&mut self, id: PeerId, nick: &str) -> Vec<PeerAction> {
        let hub = self
            .hubs
            .iter()
            .find(|(_, h)| h.session.user(nick).is_some())
            .map(|(hid, h)| {
                (
                    *hid,
                    h.session.address.clone(),
                    h.session.me.nick.clone(),
                    h.session.encoding,
                )
            });

        let existing = self
            .peers
            .iter()
            .filter(|(pid, _)| **pid != id)
            .find(|(_, c)| c.session.nick.as_deref() == Some(nick))
            .map(|(_, c)| c.session.direction());

        let has_queued = self.queue.has_source_for(nick);
        let Some(conn) = self.peers.get_mut(&id) else {
            return Vec::new();
        };
        match hub {
            Some((_, hub_addr, my_nick, encoding)) => conn.session.attach_hub(
                &hub_addr,
                &my_nick,
                encoding,
                has_queued,
                existing,
            ),
            None => conn.session.reject_unknown_nick(),
        }
    }

    fn request_next_for_peer(&mut self, id: PeerId) -> Vec<PeerAction> {
        let Some(conn) = self.peers.get(&id) else {
            return Vec::new();
        };
        let Some(nick) = conn.session.nick.clone() else {
            return Vec::new();
        };

        loop {
            let Some(item) = self.queue.next_source_for(&nick) else {
                debug!(nick, "nothing queued for peer");
                return Vec::new();
            };

            match item {
                NextItem::Directory {
                    source_directory: _,
                    target_directory,
                    nick: dir_nick,
                } => {
                    // resolvable right here when the filelist is on disk
                    match filelist::find_filelist(&self.workdir, &dir_nick) {
                        Some(path) => {
                            if let Err(e) = self.resolve_directory(&target_directory, &path)
                            {
                                warn!(error = %e, "directory resolution failed");
                                let _ = self.queue.remove_directory(&target_directory);
                            }
                            // loop: pick the next item, likely a file
                        }
                        None => {
                            // should not happen: a filelist target is
                            // queued before any unresolved directory
                            let _ = self.queue.add_filelist(&dir_nick, true);
                            return Vec::new();
                        }
                    }
                }
                item => {
                    let resume = match &item {
                        NextItem::File { filename, .. } => self
                            .incomplete_path(filename)
                            .metadata()
                            .map(|m| m.len())
                            .unwrap_or(0),
                        _ => 0,
                    };
                    let Some(conn) = self.peers.get_mut(&id) else {
                        return Vec::new();
                    };
                    let mut ctx = PeerCtx {
                        share: &mut self.share,
                        store: &mut self.store,
                        queue: &mut self.queue,
                        slots: &mut self.slots,
                        workdir: &self.workdir,
                    };
                    return conn.session.start_download_request(&item, resume, &mut ctx);
                }
            }
        }
    }

    fn start_download(&mut self, id: PeerId, plan: DownloadPlan) {
        let dest = match &plan.kind {
            DownloadKind::File { target } => self.incomplete_path(target),
            DownloadKind::Filelist { nick, compressed } => {
                if *compressed {
                    self.workdir.join(format!("files.xml.{nick}.bz2"))
                } else {
                    self.workdir.join(format!("{nick}.DcLst"))
                }
            }
        };

        let Some(conn) = self.peers.get_mut(&id) else {
            return;
        };
        conn.last_progress = Instant::now();

        self.nc.publish(Notification::DownloadStarting {
            nick: conn.session.nick.clone().unwrap_or_default(),
            filename: match &plan.kind {
                DownloadKind::File { target } => target.clone(),
                DownloadKind::Filelist { nick, .. } => format!("files.xml.{nick}"),
            },
            offset: plan.offset,
        });

        let _ = conn.directives.try_send(ReadDirective::ReceiveFile {
            path: dest.clone(),
            offset: plan.offset,
            count: plan.count,
        });
        conn.download = Some(ActiveDownload {
            plan,
            dest,
            started: Instant::now(),
        });
    }

    fn on_download_bytes_done(&mut self, id: PeerId, _written: u64) {
        let Some(conn) = self.peers.get_mut(&id) else {
            return;
        };
        conn.last_progress = Instant::now();
        // the reader may continue framing; the session stays busy until
        // verification finishes
        let _ = conn.directives.try_send(ReadDirective::Continue);

        let Some(download) = conn.download.take() else {
            return;
        };

        let plan = download.plan.clone();
        let needs_check = plan.offset == 0 && plan.tth.is_some();
        if needs_check {
            let dest = download.dest.clone();
            let expected = plan.tth.expect("checked above");
            let tx = self.tx.clone();
            tokio::task::spawn_blocking(move || {
                let ok = verify_file_tth(&dest, expected);
                let _ = tx.send(Event::DownloadVerified { id, plan, ok });
            });
        } else {
            let _ = self.tx.send(Event::DownloadVerified { id, plan, ok: true });
        }
    }

    fn on_download_verified(&mut self, id: PeerId, plan: &DownloadPlan, ok: bool) {
        let nick = self
            .peers
            .get(&id)
            .and_then(|c| c.session.nick.clone())
            .unwrap_or_default();

        match &plan.kind {
            DownloadKind::File { target } => {
                if ok {
                    let incomplete = self.incomplete_path(target);
                    let finished = self.finished_path(target);
                    if let Some(parent) = finished.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    if let Err(e) = std::fs::rename(&incomplete, &finished) {
                        warn!(error = %e, target, "failed to move finished download");
                    }

                    let events = self.queue.remove_target(target).unwrap_or_default();
                    self.publish_queue_events(events);
                    self.nc.publish(Notification::DownloadFinished {
                        nick: nick.clone(),
                        filename: target.clone(),
                    });
                } else {
                    warn!(target, "content hash mismatch, discarding data");
                    let _ = std::fs::remove_file(self.incomplete_path(target));
                    self.nc.publish(Notification::StatusMessage {
                        hub: None,
                        message: format!(
                            "Downloaded data for {target} failed its hash check"
                        ),
                    });
                }
            }
            DownloadKind::Filelist { nick: from, compressed } => {
                let path = if *compressed {
                    self.workdir.join(format!("files.xml.{from}.bz2"))
                } else {
                    self.workdir.join(format!("{from}.DcLst"))
                };
                let auto = self
                    .queue
                    .lookup_target(&puck_queue::queue::filelist_target_name(from))
                    .is_some_and(|t| t.auto_matched);
                let events = self.queue.remove_filelist(from).unwrap_or_default();
                self.publish_queue_events(events);
                self.nc.publish(Notification::FilelistAdded {
                    nick: from.clone(),
                    path: path.clone(),
                    auto_matched: auto,
                });

                if auto {
                    self.resolve_pending_directories(from, &path);
                }
            }
        }

        // let the session pick its next item
        let followups = {
            let Some(conn) = self.peers.get_mut(&id) else {
                return;
            };
            let mut ctx = PeerCtx {
                share: &mut self.share,
                store: &mut self.store,
                queue: &mut self.queue,
                slots: &mut self.slots,
                workdir: &self.workdir,
            };
            conn.session.download_done(&mut ctx)
        };
        self.apply_peer_actions(id, followups);
    }

    fn on_peer_write(&mut self, id: PeerId, event: WriteEvent) {
        match event {
            WriteEvent::PayloadDone { sent } => {
                debug!(sent, "upload finished");
                let followups = {
                    let Some(conn) = self.peers.get_mut(&id) else {
                        return;
                    };
                    conn.last_progress = Instant::now();
                    let mut ctx = PeerCtx {
                        share: &mut self.share,
                        store: &mut self.store,
                        queue: &mut self.queue,
                        slots: &mut self.slots,
                        workdir: &self.workdir,
                    };
                    conn.session.upload_done(&mut ctx);
                    Vec::new()
                };
                self.apply_peer_actions(id, followups);
            }
            WriteEvent::Failed { error } => {
                self.close_peer(id, Some(error));
            }
        }
    }

    fn close_peer(&mut self, id: PeerId, reason: Option<String>) {
        let Some(mut conn) = self.peers.remove(&id) else {
            return;
        };
        let _ = conn.directives.try_send(ReadDirective::Close);
        let _ = conn.writer.send(WriteItem::Shutdown);

        // remember whether a download died with this connection, before
        // teardown clears the transfer state
        let interrupted = conn.download.is_some() || conn.session.active_target().is_some();

        let mut ctx = PeerCtx {
            share: &mut self.share,
            store: &mut self.store,
            queue: &mut self.queue,
            slots: &mut self.slots,
            workdir: &self.workdir,
        };
        conn.session.on_close(&mut ctx);

        debug!(nick = ?conn.session.nick, ?reason, "peer connection closed");
        let nick = conn.session.nick;
        self.nc.publish(Notification::ConnectionClosed {
            nick: nick.clone(),
            reason,
        });

        // a broken transfer leaves its target queued and inactive;
        // re-request the source so the download resumes
        if interrupted {
            if let Some(nick) = nick {
                if self.queue.has_source_for(&nick) {
                    self.request_connection_to(&nick);
                }
            }
        }
    }

    fn abort_transfers_with(&mut self, nick: &str) {
        let doomed: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, c)| c.session.nick.as_deref() == Some(nick))
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            self.close_peer(id, Some("user left the hub".to_string()));
        }
    }

    // ---- queue and filelists -------------------------------------------

    fn publish_queue_events(&mut self, events: Vec<QueueEvent>) {
        for event in events {
            let notification = match event {
                QueueEvent::TargetAdded { filename, nick }
                | QueueEvent::SourceAdded { filename, nick } => {
                    Notification::QueueTargetAdded { filename, nick }
                }
                QueueEvent::TargetRemoved { filename } => {
                    Notification::QueueTargetRemoved { filename }
                }
                QueueEvent::SourceRemoved { .. } => continue,
                QueueEvent::DirectoryAdded {
                    target_directory,
                    nick,
                } => Notification::QueueDirectoryAdded {
                    target_directory,
                    nick,
                },
                QueueEvent::DirectoryRemoved { target_directory } => {
                    Notification::QueueDirectoryRemoved { target_directory }
                }
                QueueEvent::FilelistAdded { nick, auto_matched } => {
                    // a freshly queued filelist wants a connection
                    self.request_connection_to(&nick);
                    Notification::FilelistAdded {
                        nick: nick.clone(),
                        path: self.workdir.join(format!("files.xml.{nick}")),
                        auto_matched,
                    }
                }
                QueueEvent::FilelistRemoved { .. } => continue,
            };
            self.nc.publish(notification);
        }
    }

    fn resolve_directory(
        &mut self,
        target_directory: &str,
        filelist_path: &Path,
    ) -> Result<(), Error> {
        let root = filelist::parse(filelist_path)?;
        let events = self.queue.resolve_directory(target_directory, &root)?;
        self.publish_queue_events(events);
        Ok(())
    }

    fn resolve_pending_directories(&mut self, nick: &str, filelist_path: &Path) {
        let root = match filelist::parse(filelist_path) {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, nick, "cannot parse fetched filelist");
                return;
            }
        };

        // unresolved requests for this nick, resolved one at a time
        let unresolved: Vec<String> = {
            let mut dirs = Vec::new();
            let mut seen = std::collections::BTreeSet::new();
            while let Some(NextItem::Directory {
                target_directory, ..
            }) = self.queue.next_source_for(nick)
            {
                if !seen.insert(target_directory.clone()) {
                    break;
                }
                match self.queue.resolve_directory(&target_directory, &root) {
                    Ok(events) => {
                        dirs.push(target_directory);
                        self.publish_queue_events(events);
                    }
                    Err(e) => {
                        warn!(error = %e, "directory resolution failed");
                        break;
                    }
                }
            }
            dirs
        };
        if !unresolved.is_empty() {
            info!(nick, count = unresolved.len(), "resolved queued directories");
        }
    }

    /// Ask a hub to broker a connection to `nick` so queued downloads
    /// can start.
    fn request_connection_to(&mut self, nick: &str) {
        // already connected to this peer?
        if self
            .peers
            .values()
            .any(|c| c.session.nick.as_deref() == Some(nick))
        {
            return;
        }

        let Some((_, hub)) = self
            .hubs
            .iter()
            .find(|(_, h)| h.session.user(nick).is_some())
        else {
            debug!(nick, "peer not on any connected hub");
            return;
        };

        let line = if self.config.passive {
            format!("$RevConnectToMe {} {nick}", hub.session.me.nick)
        } else {
            let ip = hub.session.my_ip.clone().unwrap_or_default();
            format!("$ConnectToMe {nick} {ip}:{}", self.config.port)
        };
        let mut bytes = hub.session.encoding.encode_escaped(&line);
        bytes.push(b'|');
        let _ = hub.writer.send(WriteItem::Line(bytes));
    }

    // ---- share and hasher ----------------------------------------------

    fn spawn_hasher_client(&mut self) {
        let (tx_line, mut rx_line) = mpsc::unbounded_channel::<String>();
        self.hasher = Some(tx_line);
        let socket = self.workdir.join("puck-hashd");
        let events = self.tx.clone();

        tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

            // the daemon may still be starting up
            let mut stream = None;
            for _ in 0..10 {
                match tokio::net::UnixStream::connect(&socket).await {
                    Ok(s) => {
                        stream = Some(s);
                        break;
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                }
            }
            let Some(stream) = stream else {
                let _ = events.send(Event::HasherClosed);
                return;
            };

            let (read_half, mut write_half) = stream.into_split();
            tokio::spawn(async move {
                while let Some(line) = rx_line.recv().await {
                    let framed = format!("{line}\n");
                    if write_half.write_all(framed.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });

            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if events.send(Event::HasherLine { line }).is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = events.send(Event::HasherClosed);
                        return;
                    }
                }
            }
        });
    }

    fn on_hasher_line(&mut self, line: &str) -> Result<(), Error> {
        let (verb, args) = controline::decode(line);
        match verb.as_str() {
            "add-hash" if args.len() >= 3 => {
                let path = PathBuf::from(&args[0]);
                let tth = args[1].parse().ok();
                let leaves = args.get(2).cloned().unwrap_or_default();
                let mtime = path
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(1, |d| d.as_secs().max(1));

                let outcome = match tth {
                    Some(tth) => self.share.on_tth_available(
                        &path,
                        Some((tth, leaves.as_str(), mtime)),
                        &mut self.store,
                    )?,
                    None => self.share.on_tth_available(&path, None, &mut self.store)?,
                };
                debug!(path = %path.display(), ?outcome, "hash applied");
                self.nc.publish(Notification::TthAvailable { path, tth });
                self.after_share_change();
            }
            "fail-hash" if !args.is_empty() => {
                let path = PathBuf::from(&args[0]);
                self.share.on_tth_available(&path, None, &mut self.store)?;
                self.nc.publish(Notification::TthAvailable { path, tth: None });
                self.after_share_change();
            }
            other => debug!(verb = other, "unexpected hasher line"),
        }
        Ok(())
    }

    fn after_share_change(&mut self) {
        self.publish_share_stats();
        if self.share.unhashed_count() == 0 && !self.share.uptodate() {
            self.nc.publish(Notification::HashingComplete);
            self.save_filelist();
            self.refresh_my_infos();
        }
    }

    fn publish_share_stats(&mut self) {
        let stats = self.share.stats();
        self.nc.publish(Notification::ShareStats {
            size: stats.size,
            totsize: stats.totsize,
            dupsize: stats.dupsize,
            nfiles: stats.nfiles,
            ntotfiles: stats.ntotfiles,
            nduplicates: stats.nduplicates,
        });
    }

    fn save_filelist(&mut self) {
        let generator = format!("puck {}", env!("CARGO_PKG_VERSION"));
        match filelist::save_own(&self.share, &self.store, &self.workdir, "PUCK", &generator)
        {
            Ok(()) => self.share.set_uptodate(),
            Err(e) => warn!(error = %e, "failed to save own filelist"),
        }
    }

    fn refresh_my_infos(&mut self) {
        let size = self.share.stats().size;
        for hub in self.hubs.values_mut() {
            for action in hub.session.my_info_refresh(size) {
                if let HubAction::Send(bytes) = action {
                    let _ = hub.writer.send(WriteItem::Line(bytes));
                }
            }
        }
    }

    fn start_scan(&mut self, mount: MountId) {
        let Some(mp) = self.share.mount(mount) else {
            return;
        };
        let root = mp.local_root.clone();
        self.share.begin_scan(mount);

        let tx = self.tx.clone();
        let walk_root = root.clone();
        tokio::task::spawn_blocking(move || {
            let result =
                puck_share::walk_mountpoint(&walk_root).map_err(|e| e.to_string());
            let _ = tx.send(Event::ScanDone {
                mount,
                root: walk_root,
                result,
            });
        });
    }

    fn on_scan_done(
        &mut self,
        mount: MountId,
        root: &Path,
        result: Result<Vec<ScannedFile>, String>,
    ) -> Result<(), Error> {
        let scanned = match result {
            Ok(scanned) => scanned,
            Err(e) => {
                self.nc.publish(Notification::StatusMessage {
                    hub: None,
                    message: format!("Scanning {} failed: {e}", root.display()),
                });
                return Ok(());
            }
        };

        let summary = self.share.apply_scan(mount, scanned, &mut self.store)?;
        if summary.aborted {
            return Ok(());
        }
        info!(
            root = %root.display(),
            new = summary.new_unhashed.len(),
            kept = summary.kept_hashed,
            removed = summary.removed,
            "scan finished"
        );

        if let Some(hasher) = &self.hasher {
            for path in &summary.new_unhashed {
                let _ = hasher.send(controline::encode(
                    "add",
                    &[&path.to_string_lossy()],
                ));
            }
        }

        self.share.maybe_grow_bloom();
        self.nc.publish(Notification::ShareScanFinished {
            local_root: root.to_path_buf(),
        });
        self.after_share_change();
        Ok(())
    }

    // ---- control --------------------------------------------------------

    fn spawn_control_listener(&mut self) -> Result<(), Error> {
        let socket_path = self.workdir.join("puckd");
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        info!(socket = %socket_path.display(), "control socket ready");

        let tx = self.tx.clone();
        let nc = self.nc.clone();
        let mut next_client = 0u64;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                next_client += 1;
                let id = ClientId(next_client);
                let (read_half, write_half) = stream.into_split();

                // writer: explicit lines plus the notification tap
                let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
                let mut bus = nc.subscribe();
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let mut write_half = write_half;
                    loop {
                        let line = tokio::select! {
                            line = line_rx.recv() => line,
                            event = bus.recv() => match event {
                                Ok(n) => control::notification_line(&n),
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                    continue;
                                }
                                Err(_) => return,
                            },
                        };
                        let Some(line) = line else { return };
                        let framed = format!("{line}\n");
                        if write_half.write_all(framed.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });

                if tx
                    .send(Event::ControlConnected {
                        id,
                        writer: line_tx,
                    })
                    .is_err()
                {
                    return;
                }

                let tx = tx.clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncBufReadExt, BufReader};
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tx.send(Event::ControlLine { id, line }).is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Event::ControlClosed { id });
                });
            }
        });
        Ok(())
    }

    fn flush_controls(&mut self) {
        // give writer tasks a moment to drain before exit
        self.controls.clear();
    }

    #[allow(clippy::too_many_lines)]
    fn handle_control(&mut self, request: ControlRequest) -> Result<(), Error> {
        match request {
            ControlRequest::ConnectHub {
                addr,
                nick,
                password,
                encoding,
            } => self.connect_hub(addr, nick, password, encoding),
            ControlRequest::DisconnectHub { addr } => {
                let id = self
                    .hubs
                    .iter()
                    .find(|(_, h)| h.session.address == addr)
                    .map(|(id, _)| *id);
                if let Some(id) = id {
                    if let Some(hub) = self.hubs.get_mut(&id) {
                        hub.session.expected_disconnect = true;
                    }
                    self.on_hub_closed(id, None);
                }
            }
            ControlRequest::SendChat { hub, message } => {
                if let Some(conn) = self.hubs.values().find(|h| h.session.address == hub) {
                    let line = format!("<{}> {message}", conn.session.me.nick);
                    let mut bytes = conn.session.encoding.encode_escaped(&line);
                    bytes.push(b'|');
                    let _ = conn.writer.send(WriteItem::Line(bytes));
                }
            }
            ControlRequest::SendPrivate { hub, nick, message } => {
                if let Some(conn) = self.hubs.values().find(|h| h.session.address == hub) {
                    let me = &conn.session.me.nick;
                    let line = format!("$To: {nick} From: {me} $<{me}> {message}");
                    let mut bytes = conn.session.encoding.encode_escaped(&line);
                    bytes.push(b'|');
                    let _ = conn.writer.send(WriteItem::Line(bytes));
                }
            }
            ControlRequest::Search {
                query,
                size,
                size_restriction,
                kind,
            } => self.send_search(&query, size, size_restriction, kind),
            ControlRequest::Download {
                nick,
                source,
                size,
                target,
                tth,
            } => {
                let tth = tth.parse().ok();
                let events = self.queue.add_file(
                    &nick,
                    &source,
                    size,
                    &target,
                    tth,
                    None,
                    None,
                )?;
                self.publish_queue_events(events);
                self.request_connection_to(&nick);
            }
            ControlRequest::DownloadDirectory {
                nick,
                source,
                target,
            } => {
                let listed = filelist::find_filelist(&self.workdir, &nick);
                let parsed = match &listed {
                    Some(path) => filelist::parse(path).ok(),
                    None => None,
                };
                let events =
                    self.queue
                        .add_directory(&nick, &source, &target, parsed.as_ref())?;
                self.publish_queue_events(events);
                self.request_connection_to(&nick);
            }
            ControlRequest::DownloadFilelist { nick } => {
                let events = self.queue.add_filelist(&nick, false)?;
                self.publish_queue_events(events);
                self.request_connection_to(&nick);
            }
            ControlRequest::CancelDownload { target } => {
                if self.queue.mark_for_removal(&target) {
                    // a transfer is running; it aborts at the next I/O
                    // boundary when the connection is closed
                    let doomed: Vec<PeerId> = self
                        .peers
                        .iter()
                        .filter(|(_, c)| c.session.active_target() == Some(&target))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in doomed {
                        self.close_peer(id, Some("download cancelled".to_string()));
                    }
                }
                let events = self.queue.remove_target(&target)?;
                self.publish_queue_events(events);
            }
            ControlRequest::SetPriority { target, level } => {
                let events = self
                    .queue
                    .set_priority(&target, Priority::from_level(level))?;
                self.publish_queue_events(events);
            }
            ControlRequest::AddShare { path } => {
                let mount = self.share.add_mountpoint(Path::new(&path))?;
                self.start_scan(mount);
            }
            ControlRequest::RemoveShare { path } => {
                let root = PathBuf::from(path);
                self.share.remove_mountpoint(&root)?;
                self.share.rebuild_bloom_same_size();
                self.nc.publish(Notification::DidRemoveShare {
                    local_root: root,
                });
                self.after_share_change();
            }
            ControlRequest::RescanShare => {
                let mounts: Vec<MountId> =
                    self.share.mounts().map(|(id, _)| id).collect();
                for mount in mounts {
                    self.start_scan(mount);
                }
            }
            ControlRequest::SetPassword { hub, password } => {
                if let Some(conn) =
                    self.hubs.values_mut().find(|h| h.session.address == hub)
                {
                    conn.session.me.password = Some(password.clone());
                    let line = format!("$MyPass {password}");
                    let mut bytes = conn.session.encoding.encode_escaped(&line);
                    bytes.push(b'|');
                    let _ = conn.writer.send(WriteItem::Line(bytes));
                }
            }
            ControlRequest::SetPort { port } => {
                self.config.port = port;
            }
            ControlRequest::SetNick { nick } => {
                self.config.nick = nick;
            }
            ControlRequest::Shutdown => {
                self.shutting_down = true;
            }
        }
        Ok(())
    }

    fn send_search(&mut self, query: &str, size: u64, restriction: u8, kind: u32) {
        use puck_proto::{FileKind, SearchQuery, SizeRestriction};

        let query_parsed = match query.strip_prefix("TTH:") {
            Some(tth) => match tth.parse() {
                Ok(tth) => SearchQuery::Tth(tth),
                Err(_) => return,
            },
            None => {
                let terms: Vec<String> =
                    query.split_whitespace().map(str::to_string).collect();
                if terms.is_empty() {
                    return;
                }
                SearchQuery::Terms(terms)
            }
        };
        let restriction = match restriction {
            1 => SizeRestriction::Min,
            2 => SizeRestriction::Max,
            _ => SizeRestriction::None,
        };

        for hub in self.hubs.values() {
            if !hub.session.logged_in() {
                continue;
            }
            let origin = if self.config.passive {
                SearchOrigin::Passive {
                    nick: hub.session.me.nick.clone(),
                }
            } else {
                let Some(ip) = hub.session.my_ip.clone() else {
                    continue;
                };
                SearchOrigin::Active {
                    host: ip,
                    port: self.config.port,
                }
            };
            let request = SearchRequest {
                origin,
                restriction,
                size,
                kind: FileKind::from_wire(kind),
                query: query_parsed.clone(),
            };

            let origin_str = match &request.origin {
                SearchOrigin::Passive { nick } => format!("Hub:{nick}"),
                SearchOrigin::Active { host, port } => format!("{host}:{port}"),
            };
            let line = format!(
                "$Search {origin_str} {}",
                request.format_restriction()
            );
            let mut bytes = hub.session.encoding.encode_escaped(&line);
            bytes.push(b'|');
            let _ = hub.writer.send(WriteItem::Line(bytes));
        }
    }

    // ---- housekeeping ---------------------------------------------------

    fn on_tick(&mut self) {
        // hub idle keepalives
        let mut dead_hubs = Vec::new();
        for (id, hub) in &mut self.hubs {
            if !hub.connected {
                continue;
            }
            let idle = hub.last_activity.elapsed();
            if idle >= 2 * HUB_IDLE_TIMEOUT && hub.keepalive_sent {
                dead_hubs.push(*id);
            } else if idle >= HUB_IDLE_TIMEOUT && !hub.keepalive_sent {
                debug!(hub = %hub.session.address, "sending keepalive");
                let _ = hub
                    .writer
                    .send(WriteItem::Line(hub.session.keepalive()));
                hub.keepalive_sent = true;
            }
        }
        for id in dead_hubs {
            self.on_hub_closed(id, Some("hub timed out".to_string()));
        }

        // peer handshake and progress timeouts
        let mut dead_peers = Vec::new();
        for (id, conn) in &self.peers {
            if !conn.connected {
                continue;
            }
            if !conn.session.handshake_done() {
                if conn.opened.elapsed() >= HANDSHAKE_TIMEOUT {
                    dead_peers.push((*id, "handshake timed out"));
                }
            } else if conn.download.is_some()
                && conn.last_progress.elapsed() >= PROGRESS_TIMEOUT
            {
                dead_peers.push((*id, "transfer stalled"));
            }
        }
        for (id, reason) in dead_peers {
            self.close_peer(id, Some(reason.to_string()));
        }

        // external IP refresh
        if !self.config.passive && self.extip.stale() && !self.probe_running {
            self.probe_running = true;
            let tx = self.tx.clone();
            let start = rand::random::<usize>() % extip::PROBE_HOSTS.len();
            tokio::spawn(async move {
                let ip = extip::probe_once(start).await;
                if ip.is_none() {
                    tokio::time::sleep(extip::RETRY_DELAY).await;
                }
                let _ = tx.send(Event::ExtIpResult { ip });
            });
        }
    }
}

fn rate(bytes: u64, since: Instant) -> u64 {
    let secs = since.elapsed().as_secs_f64().max(0.001);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rate = (bytes as f64 / secs) as u64;
    rate
}

/// Recompute a file's TTH and compare; used after a full download
fn verify_file_tth(path: &Path, expected: puck_hash::Tth) -> bool {
    use std::io::Read;

    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mut hasher = puck_hash::TreeHasher::for_file_size(size);
    let mut chunk = vec![0u8; 1024 * 1024];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => hasher.update(&chunk[..n]),
            Err(_) => return false,
        }
    }
    hasher.finalize().root == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Engine {
        Engine::new(dir.path().to_path_buf(), Config::default()).unwrap()
    }

    fn recent(address: &str) -> RecentHub {
        RecentHub {
            address: address.to_string(),
            nick: "me".to_string(),
            password: None,
            encoding: "windows-1252".to_string(),
        }
    }

    #[test]
    fn test_recent_hubs_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        engine.remember_recent(recent("one:411"));
        engine.remember_recent(recent("two:411"));
        let addresses: Vec<&str> = engine
            .recent_hubs()
            .iter()
            .map(|h| h.address.as_str())
            .collect();
        assert_eq!(addresses, vec!["two:411", "one:411"]);
    }

    #[test]
    fn test_recent_hubs_dedup_by_address() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        engine.remember_recent(recent("hub:411"));
        engine.remember_recent(RecentHub {
            password: Some("sekrit".to_string()),
            ..recent("hub:411")
        });

        assert_eq!(engine.recent_hubs().len(), 1);
        // the newer entry's credentials win
        assert_eq!(
            engine.recent_hubs()[0].password.as_deref(),
            Some("sekrit")
        );
    }

    #[test]
    fn test_recent_hubs_capped() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        for i in 0..2 * MAX_RECENT_HUBS {
            engine.remember_recent(recent(&format!("hub{i}:411")));
        }
        assert_eq!(engine.recent_hubs().len(), MAX_RECENT_HUBS);
        assert_eq!(
            engine.recent_hubs()[0].address,
            format!("hub{}:411", 2 * MAX_RECENT_HUBS - 1)
        );
    }
}
