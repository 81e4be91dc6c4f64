//! # puck-engine
//!
//! The hub/transfer engine of the puck file-sharing client.
//!
//! This crate provides:
//! - **Hub sessions**: the NMDC login and command state machine
//! - **Peer connections**: handshake, direction negotiation and
//!   upload/download transfers
//! - **Search**: evaluation of incoming searches against the share and
//!   fan-out of our own
//! - **Slots**: the global upload slot policy
//! - **External IP discovery**: rotating HTTP probes with backoff
//! - **Control bus**: the line protocol front-ends drive the engine with
//! - **The engine actor**: one task owning all state, fed by socket
//!   tasks over channels
//!
//! Protocol state machines ([`hub::HubSession`], [`peer::PeerSession`])
//! are pure: they consume lines and emit actions, and the engine
//! executes those actions against sockets and stores. Tests drive the
//! machines with byte strings and never open a socket.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod extip;
pub mod hub;
pub mod net;
pub mod peer;
pub mod search;
pub mod slots;

pub use bus::{Notification, NotificationCenter};
pub use config::Config;
pub use engine::{Engine, Event, RecentHub};
pub use error::Error;
