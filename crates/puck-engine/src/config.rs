//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_nick() -> String {
    "puck-user".to_string()
}

fn default_speed() -> String {
    "Cable".to_string()
}

fn default_port() -> u16 {
    1412
}

fn default_slots() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_hash_delay_us() -> u64 {
    100_000
}

/// Runtime settings, loaded from `puck.toml` in the working directory
/// and adjustable over the control bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default nick used on hubs
    #[serde(default = "default_nick")]
    pub nick: String,

    /// Free-form description sent in `$MyINFO`
    #[serde(default)]
    pub description: String,

    /// Contact address sent in `$MyINFO`
    #[serde(default)]
    pub email: String,

    /// Connection speed string
    #[serde(default = "default_speed")]
    pub speed: String,

    /// TCP listen port for peer connections; also the UDP search port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Total upload slots
    #[serde(default = "default_slots")]
    pub slots: u32,

    /// Operate in passive mode (no inbound connections)
    #[serde(default)]
    pub passive: bool,

    /// Follow `$ForceMove` redirects automatically
    #[serde(default = "default_true")]
    pub follow_redirects: bool,

    /// Let `$UserIP` from the hub override the detected external IP
    #[serde(default = "default_true")]
    pub allow_hub_ip_override: bool,

    /// Manually configured external IP; disables detection
    #[serde(default)]
    pub external_ip: Option<String>,

    /// Directory completed downloads land in
    #[serde(default)]
    pub download_directory: Option<PathBuf>,

    /// Microseconds the hasher sleeps between chunks
    #[serde(default = "default_hash_delay_us")]
    pub hash_delay_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            description: String::new(),
            email: String::new(),
            speed: default_speed(),
            port: default_port(),
            slots: default_slots(),
            passive: false,
            follow_redirects: default_true(),
            allow_hub_ip_override: default_true(),
            external_ip: None,
            download_directory: None,
            hash_delay_us: default_hash_delay_us(),
        }
    }
}

impl Config {
    /// The client tag sent inside `$MyINFO`
    #[must_use]
    pub fn tag(&self, hub_count: usize) -> String {
        let mode = if self.passive { 'P' } else { 'A' };
        format!(
            "<puck V:{},M:{mode},H:{hub_count}/0/0,S:{}>",
            env!("CARGO_PKG_VERSION"),
            self.slots
        )
    }
}

/// How long a peer may take to finish its handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a transfer may stall before the connection is dropped
pub const PROGRESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Hub idle time before a keepalive is sent
pub const HUB_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
