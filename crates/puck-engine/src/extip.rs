//! External IP discovery.
//!
//! Peers must be told an address they can reach us on. A manually
//! configured address wins; otherwise a rotating list of HTTP probe
//! hosts is asked, with per-host failover and a deferred retry once the
//! whole list has failed. Short-circuits apply when the hub is on our
//! own subnet or both ends are RFC 1918 private.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How long a detected address stays fresh
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Cache extension applied when no NAT is inferred
pub const NO_NAT_EXTENSION: Duration = Duration::from_secs(24 * 60 * 60);

/// Pause before restarting a fully failed probe cycle
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Per-request network timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The rotating probe list: host and request path
pub const PROBE_HOSTS: &[(&str, &str)] = &[
    ("checkip.amazonaws.com", "/"),
    ("ifconfig.me", "/ip"),
    ("icanhazip.com", "/"),
];

/// Find the first dotted-quad in a response body. Runs of one to three
/// digits separated by dots; anything longer breaks the run, so
/// `431.123.1567.1` yields nothing while the quad inside surrounding
/// text is still found.
#[must_use]
pub fn first_dotted_quad(body: &str) -> Option<String> {
    let bytes = body.as_bytes();

    'starts: for start in 0..bytes.len() {
        if !bytes[start].is_ascii_digit() {
            continue;
        }

        let mut pos = start;
        for group in 0..4 {
            let digits = bytes[pos..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            if digits == 0 {
                continue 'starts;
            }

            if group < 3 {
                // a run longer than three digits cannot end at a dot
                if digits > 3 || bytes.get(pos + digits) != Some(&b'.') {
                    continue 'starts;
                }
                pos += digits + 1;
            } else {
                pos += digits.min(3);
            }
        }

        return Some(body[start..pos].to_string());
    }
    None
}

/// RFC 1918 private address?
#[must_use]
pub fn is_private(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    match octets[0] {
        10 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

/// Are two addresses on the same subnet under `mask`?
#[must_use]
pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    u32::from(a) & u32::from(mask) == u32::from(b) & u32::from(mask)
}

/// The classful default mask, used when the interface mask is unknown
#[must_use]
pub fn default_mask(ip: Ipv4Addr) -> Ipv4Addr {
    let first = ip.octets()[0];
    if first < 128 {
        Ipv4Addr::new(255, 0, 0, 0)
    } else if first < 192 {
        Ipv4Addr::new(255, 255, 0, 0)
    } else {
        Ipv4Addr::new(255, 255, 255, 0)
    }
}

/// External address state shared by every hub session
#[derive(Debug)]
pub struct ExtIp {
    static_ip: Option<Ipv4Addr>,
    detected: Option<Ipv4Addr>,
    detected_at: Option<Instant>,
    cache_for: Duration,
}

impl ExtIp {
    /// Fresh state; `static_ip` disables detection entirely
    #[must_use]
    pub fn new(static_ip: Option<Ipv4Addr>) -> Self {
        Self {
            static_ip,
            detected: None,
            detected_at: None,
            cache_for: CACHE_TIMEOUT,
        }
    }

    /// Install or clear the manual override
    pub fn set_static(&mut self, ip: Option<Ipv4Addr>) {
        self.static_ip = ip;
    }

    /// Record a probe result
    pub fn set_detected(&mut self, ip: Ipv4Addr) {
        info!(%ip, "external IP detected");
        self.detected = Some(ip);
        self.detected_at = Some(Instant::now());
        self.cache_for = CACHE_TIMEOUT;
    }

    /// Does the cache need a refresh probe?
    #[must_use]
    pub fn stale(&self) -> bool {
        if self.static_ip.is_some() {
            return false;
        }
        match self.detected_at {
            Some(at) => at.elapsed() >= self.cache_for,
            None => true,
        }
    }

    /// Pick the address to advertise to `hub_ip`, given the local
    /// address of the hub connection.
    pub fn address_for(&mut self, local: Ipv4Addr, hub_ip: Ipv4Addr) -> Ipv4Addr {
        if let Some(ip) = self.static_ip {
            debug!(%ip, "using static external IP");
            return ip;
        }

        // hub on our own subnet: the local address works and nothing
        // else would
        if same_subnet(local, hub_ip, default_mask(local)) {
            debug!(%local, "hub is on the local subnet");
            return local;
        }

        // both ends private but different subnets: a public address
        // would not help either
        if is_private(local) && is_private(hub_ip) {
            debug!(%local, "private hub, using private local address");
            return local;
        }

        if self.detected == Some(local) {
            // we are publicly reachable as-is; no NAT, so the answer
            // cannot go stale quickly
            self.cache_for = NO_NAT_EXTENSION;
        }

        match self.detected {
            Some(ip) => ip,
            None => {
                warn!("external IP unknown, falling back to local address");
                local
            }
        }
    }
}

/// One rotating probe pass. Returns the detected address, or `None`
/// when every host failed (the caller schedules a retry after
/// [`RETRY_DELAY`]).
pub async fn probe_once(start_index: usize) -> Option<Ipv4Addr> {
    for attempt in 0..PROBE_HOSTS.len() {
        let (host, path) = PROBE_HOSTS[(start_index + attempt) % PROBE_HOSTS.len()];
        match tokio::time::timeout(PROBE_TIMEOUT, probe_host(host, path)).await {
            Ok(Some(ip)) => return Some(ip),
            Ok(None) => info!(host, "probe host gave no usable answer, trying next"),
            Err(_) => info!(host, "probe timed out, trying next"),
        }
    }
    warn!("all external IP probe hosts failed");
    None
}

async fn probe_host(host: &str, path: &str) -> Option<Ipv4Addr> {
    debug!(host, path, "sending external IP probe");

    let mut stream = TcpStream::connect((host, 80)).await.ok()?;
    let request = format!(
        "GET {path} HTTP/1.0\r\nHost: {host}\r\nUser-Agent: puck/{}\r\nConnection: close\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    );
    stream.write_all(request.as_bytes()).await.ok()?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.ok()?;
    let text = String::from_utf8_lossy(&response);

    // skip the headers when a body separator is present
    let body = text
        .split_once("\r\n\r\n")
        .map_or(text.as_ref(), |(_, body)| body);

    let candidate = first_dotted_quad(body)?;
    candidate.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_dotted_quad() {
        assert_eq!(
            first_dotted_quad("foo<external-ip>192.0.34.166</external-ip>bar"),
            Some("192.0.34.166".to_string())
        );
        assert_eq!(
            first_dotted_quad("192.0.34.166\n"),
            Some("192.0.34.166".to_string())
        );
        assert_eq!(first_dotted_quad("no ip address here"), None);
        // a four-digit run breaks the quad, the real one is found after
        assert_eq!(
            first_dotted_quad("431.123.1567.1<x>192.0.34.166</x>"),
            Some("192.0.34.166".to_string())
        );
    }

    #[test]
    fn test_is_private_ranges() {
        let private = |s: &str| is_private(s.parse().unwrap());
        assert!(!private("1.2.3.4"));
        assert!(private("10.2.3.4"));
        assert!(private("192.168.0.1"));
        assert!(!private("192.167.0.1"));
        assert!(!private("192.169.0.1"));
        assert!(private("172.16.0.0"));
        assert!(private("172.31.255.255"));
        assert!(!private("172.15.255.255"));
        assert!(!private("172.32.0.0"));
    }

    #[test]
    fn test_same_subnet() {
        let ip = |s: &str| s.parse::<Ipv4Addr>().unwrap();
        assert!(same_subnet(
            ip("192.168.1.10"),
            ip("192.168.1.20"),
            ip("255.255.255.0")
        ));
        assert!(!same_subnet(
            ip("192.168.1.10"),
            ip("192.168.2.20"),
            ip("255.255.255.0")
        ));
    }

    #[test]
    fn test_address_selection_policy() {
        let ip = |s: &str| s.parse::<Ipv4Addr>().unwrap();

        // static override wins
        let mut ext = ExtIp::new(Some(ip("5.5.5.5")));
        assert_eq!(
            ext.address_for(ip("192.168.1.2"), ip("1.2.3.4")),
            ip("5.5.5.5")
        );
        assert!(!ext.stale());

        // same-subnet hub gets the local address
        let mut ext = ExtIp::new(None);
        ext.set_detected(ip("9.9.9.9"));
        assert_eq!(
            ext.address_for(ip("192.168.1.2"), ip("192.168.1.1")),
            ip("192.168.1.2")
        );

        // private hub elsewhere: still the local address
        assert_eq!(
            ext.address_for(ip("192.168.1.2"), ip("10.0.0.1")),
            ip("192.168.1.2")
        );

        // public hub: the detected address
        assert_eq!(
            ext.address_for(ip("192.168.1.2"), ip("1.2.3.4")),
            ip("9.9.9.9")
        );
    }

    #[test]
    fn test_no_nat_extends_cache() {
        let ip = |s: &str| s.parse::<Ipv4Addr>().unwrap();
        let mut ext = ExtIp::new(None);
        assert!(ext.stale());
        ext.set_detected(ip("9.9.9.9"));
        assert!(!ext.stale());

        // detected equals local: no NAT, cache stretched to a day
        ext.address_for(ip("9.9.9.9"), ip("1.2.3.4"));
        assert_eq!(ext.cache_for, NO_NAT_EXTENSION);
    }
}
