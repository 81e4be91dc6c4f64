// Protocol-level tests: two peer state machines handshaking against
// each other, and the hub login exchange against canonical lines.

use std::path::PathBuf;

use puck_engine::hub::{HubAction, HubIdentity, HubSession};
use puck_engine::peer::{Direction, PeerAction, PeerCtx, PeerSession};
use puck_engine::slots::SlotManager;
use puck_proto::HubEncoding;
use puck_queue::Queue;
use puck_share::{Share, TthStore};
use tempfile::TempDir;

/// Engine-side state for one simulated peer
struct Side {
    _dir: TempDir,
    workdir: PathBuf,
    share: Share,
    store: TthStore,
    queue: Queue,
    slots: SlotManager,
    session: PeerSession,
}

impl Side {
    fn new(session: PeerSession) -> Self {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().to_path_buf();
        Self {
            store: TthStore::open(workdir.join("tth2.db")).unwrap(),
            queue: Queue::open(workdir.join("queue.db")).unwrap(),
            _dir: dir,
            workdir,
            share: Share::new(),
            slots: SlotManager::new(3),
            session,
        }
    }

    fn queue_file_from(&mut self, nick: &str) {
        self.queue
            .add_file(nick, "media\\wanted.bin", 100, "wanted.bin", None, None, None)
            .unwrap();
    }

    /// Feed one raw line, resolving nick lookups locally, and collect
    /// the bytes this side wants to put on the wire.
    fn feed(&mut self, line: &[u8], my_nick: &str, closed: &mut bool) -> Vec<u8> {
        let mut ctx = PeerCtx {
            share: &mut self.share,
            store: &mut self.store,
            queue: &mut self.queue,
            slots: &mut self.slots,
            workdir: &self.workdir,
        };
        let actions = self.session.handle_line(line, &mut ctx);
        self.collect(actions, my_nick, closed)
    }

    fn collect(
        &mut self,
        actions: Vec<PeerAction>,
        my_nick: &str,
        closed: &mut bool,
    ) -> Vec<u8> {
        let mut wire = Vec::new();
        for action in actions {
            match action {
                PeerAction::Send(bytes) => wire.extend_from_slice(&bytes),
                PeerAction::ResolveNick { nick } => {
                    let has_queued = self.queue.has_source_for(&nick);
                    let followups = self.session.attach_hub(
                        "hub.example.org:411",
                        my_nick,
                        HubEncoding::default(),
                        has_queued,
                        None,
                    );
                    wire.extend_from_slice(&self.collect(followups, my_nick, closed));
                }
                PeerAction::Close { .. } => *closed = true,
                // transfer actions are beyond the handshake
                _ => {}
            }
        }
        wire
    }
}

fn frames(wire: &[u8]) -> Vec<Vec<u8>> {
    wire.split(|b| *b == b'|')
        .filter(|f| !f.is_empty())
        .map(<[u8]>::to_vec)
        .collect()
}

/// Pump bytes between the two sides until both go quiet
fn pump(alice: &mut Side, bob: &mut Side) -> (bool, bool) {
    let mut alice_closed = false;
    let mut bob_closed = false;

    // Alice dialled Bob, so she greets first
    let greeting = alice.session.greeting();
    let mut to_bob = alice.collect(greeting, "alice", &mut alice_closed);
    let mut to_alice = Vec::new();

    for _ in 0..16 {
        if to_bob.is_empty() && to_alice.is_empty() {
            break;
        }

        let mut next_to_alice = Vec::new();
        for frame in frames(&to_bob) {
            if !bob_closed {
                next_to_alice.extend(bob.feed(&frame, "bob", &mut bob_closed));
            }
        }
        to_alice.extend(next_to_alice);
        to_bob.clear();

        let mut next_to_bob = Vec::new();
        for frame in frames(&to_alice) {
            if !alice_closed {
                next_to_bob.extend(alice.feed(&frame, "alice", &mut alice_closed));
            }
        }
        to_bob = next_to_bob;
        to_alice.clear();
    }

    (alice_closed, bob_closed)
}

fn outgoing_session() -> PeerSession {
    PeerSession::outgoing(
        "alice".to_string(),
        "hub.example.org:411".to_string(),
        HubEncoding::default(),
    )
}

#[test]
fn test_handshake_one_sided_queue_splits_directions() {
    // Alice wants a file from Bob; Bob has nothing queued
    let mut alice = Side::new(outgoing_session());
    alice.queue_file_from("bob");
    let mut bob = Side::new(PeerSession::incoming());

    let (alice_closed, bob_closed) = pump(&mut alice, &mut bob);
    assert!(!alice_closed);
    assert!(!bob_closed);
    assert!(alice.session.handshake_done());
    assert!(bob.session.handshake_done());
    assert_eq!(alice.session.direction(), Direction::Download);
    assert_eq!(bob.session.direction(), Direction::Upload);
}

#[test]
fn test_handshake_contended_queue_resolves_by_challenge() {
    // both sides want to download; the challenge picks a winner
    let mut alice = Side::new(outgoing_session());
    alice.queue_file_from("bob");
    let mut bob = Side::new(PeerSession::incoming());
    bob.queue_file_from("alice");

    let (alice_closed, bob_closed) = pump(&mut alice, &mut bob);

    // a challenge tie aborts; anything else splits the directions
    if alice_closed || bob_closed {
        return;
    }
    let directions = (alice.session.direction(), bob.session.direction());
    assert!(
        directions == (Direction::Download, Direction::Upload)
            || directions == (Direction::Upload, Direction::Download),
        "directions did not split: {directions:?}"
    );
}

#[test]
fn test_handshake_no_queue_aborts_double_upload() {
    // neither side has anything queued: both are uploads, which is a
    // useless pairing and one side drops it
    let mut alice = Side::new(outgoing_session());
    let mut bob = Side::new(PeerSession::incoming());

    let (alice_closed, bob_closed) = pump(&mut alice, &mut bob);
    assert!(alice_closed || bob_closed);
}

#[test]
fn test_hub_login_exchange() {
    let identity = HubIdentity {
        nick: "alice".to_string(),
        description: "testing".to_string(),
        tag: "<puck V:0.3,M:A,H:1/0/0,S:3>".to_string(),
        email: String::new(),
        speed: "LAN".to_string(),
        password: None,
        passive: false,
        port: 1412,
        share_size: 0,
    };
    let mut hub = HubSession::new(
        "hub.example.org:411".to_string(),
        HubEncoding::default(),
        identity,
        true,
        true,
    );

    // canonical lock exchange, worked out by hand
    let actions = hub.handle_line(b"$Lock EXTENDEDPROTOCOLABCD Pk=hubsoft");
    let sent: Vec<Vec<u8>> = actions
        .iter()
        .filter_map(|a| match a {
            HubAction::Send(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .collect();

    let mut expected_key = b"$Key ".to_vec();
    expected_key.extend_from_slice(&[
        0x74, 0xD1, 0xC0, 0x11, 0xB0, 0xA0, 0x10, 0x10, 0x41, 0x20, 0xD1, 0xB1, 0xB1,
        0xC0, 0xC0, 0x30, 0xD0, 0x30, 0x10, 0x70,
    ]);
    expected_key.push(b'|');
    assert!(sent.contains(&expected_key));
    assert!(sent.iter().any(|l| l.starts_with(b"$ValidateNick alice")));

    // login completes on our own Hello
    let actions = hub.handle_line(b"$Hello alice");
    assert!(hub.logged_in());
    let lines: Vec<String> = actions
        .iter()
        .filter_map(|a| match a {
            HubAction::Send(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        })
        .collect();
    assert!(lines.iter().any(|l| l.starts_with("$Version 1,0091")));
    assert!(lines.iter().any(|l| l.starts_with("$GetNickList")));
    assert!(lines.iter().any(|l| l.starts_with("$MyINFO $ALL alice")));
}
