//! `$Search` request parsing and `$SR` result formatting.
//!
//! The search restriction string is
//! `<restricted>?<is-max>?<size>?<data-type>?<pattern>`, with `F` in the
//! second field meaning a minimum-size restriction. Data type `9` with a
//! `TTH:` pattern is a content-hash lookup; other types select a file
//! kind, with unassigned values matching any kind.

use std::fmt;
use std::str::FromStr;

use puck_hash::Tth;

use crate::{ProtoError, SR_SEPARATOR};

/// File classification used by searches and the share index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Matches every kind
    Any,
    /// Audio files
    Audio,
    /// Archives
    Compressed,
    /// Documents
    Document,
    /// Executables
    Executable,
    /// Pictures
    Image,
    /// Video files
    Movie,
    /// Directories
    Directory,
}

impl FileKind {
    /// Map a wire data-type value onto a kind. Unassigned values match
    /// any kind; `9` is the TTH pseudo-type and is handled by the caller.
    #[must_use]
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::Audio,
            2 => Self::Compressed,
            3 => Self::Document,
            4 => Self::Executable,
            5 => Self::Image,
            6 => Self::Movie,
            7 => Self::Directory,
            _ => Self::Any,
        }
    }

    /// The wire data-type value for this kind
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Any => 0,
            Self::Audio => 1,
            Self::Compressed => 2,
            Self::Document => 3,
            Self::Executable => 4,
            Self::Image => 5,
            Self::Movie => 6,
            Self::Directory => 7,
        }
    }

    /// Does a file of kind `other` satisfy a search for `self`?
    #[must_use]
    pub fn accepts(self, other: Self) -> bool {
        self == Self::Any || self == other
    }
}

/// Size restriction carried by a search request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRestriction {
    /// No size restriction
    None,
    /// File must be at least the given size
    Min,
    /// File must be at most the given size
    Max,
}

impl SizeRestriction {
    /// Evaluate the restriction against a file size
    #[must_use]
    pub fn matches(self, limit: u64, file_size: u64) -> bool {
        match self {
            Self::None => true,
            Self::Min => file_size >= limit,
            Self::Max => file_size <= limit,
        }
    }
}

/// What the search is looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// Every term must appear as a case-insensitive substring
    Terms(Vec<String>),
    /// Exact content-hash lookup
    Tth(Tth),
}

/// Where results should be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOrigin {
    /// Active searcher; results go to this UDP address
    Active {
        /// Dotted-quad host
        host: String,
        /// UDP port
        port: u16,
    },
    /// Passive searcher; results are relayed through the hub
    Passive {
        /// The searching nick
        nick: String,
    },
}

/// A parsed `$Search` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Result destination
    pub origin: SearchOrigin,
    /// Size restriction mode
    pub restriction: SizeRestriction,
    /// Size limit, meaningful when `restriction` is not `None`
    pub size: u64,
    /// Requested file kind
    pub kind: FileKind,
    /// The query proper
    pub query: SearchQuery,
}

impl SearchRequest {
    /// Parse the argument part of a `$Search` command:
    /// `<host:port|Hub:nick> <restriction>`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Malformed`] when the origin or restriction
    /// fields are missing or unusable.
    pub fn parse(args: &str) -> Result<Self, ProtoError> {
        const CMD: &str = "$Search";

        let (origin_str, restriction_str) = args
            .split_once(' ')
            .ok_or(ProtoError::Malformed { command: CMD })?;

        let origin = if let Some(nick) = origin_str.strip_prefix("Hub:") {
            SearchOrigin::Passive {
                nick: nick.to_string(),
            }
        } else {
            let (host, port) = origin_str
                .rsplit_once(':')
                .ok_or(ProtoError::Malformed { command: CMD })?;
            let port = port
                .parse()
                .map_err(|_| ProtoError::BadNumber { command: CMD })?;
            SearchOrigin::Active {
                host: host.to_string(),
                port,
            }
        };

        let mut fields = restriction_str.splitn(5, '?');
        let restricted = fields.next().unwrap_or("F") == "T";
        let is_max = fields.next().unwrap_or("F") == "T";
        let size = fields
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let data_type: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let pattern = fields
            .next()
            .ok_or(ProtoError::Malformed { command: CMD })?;

        let restriction = match (restricted, is_max) {
            (false, _) => SizeRestriction::None,
            (true, false) => SizeRestriction::Min,
            (true, true) => SizeRestriction::Max,
        };

        let query = match pattern.strip_prefix("TTH:") {
            Some(tth) if data_type == 9 => {
                let tth = tth
                    .parse()
                    .map_err(|_| ProtoError::Malformed { command: CMD })?;
                SearchQuery::Tth(tth)
            }
            _ => {
                let terms: Vec<String> = pattern
                    .split([' ', '$'])
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                if terms.is_empty() {
                    return Err(ProtoError::Malformed { command: CMD });
                }
                SearchQuery::Terms(terms)
            }
        };

        Ok(Self {
            origin,
            restriction,
            size,
            kind: FileKind::from_wire(data_type),
            query,
        })
    }

    /// Format the restriction part for an outbound search
    #[must_use]
    pub fn format_restriction(&self) -> String {
        let (restricted, is_max) = match self.restriction {
            SizeRestriction::None => ('F', 'F'),
            SizeRestriction::Min => ('T', 'F'),
            SizeRestriction::Max => ('T', 'T'),
        };
        match &self.query {
            SearchQuery::Tth(tth) => {
                format!("{restricted}?{is_max}?{}?9?TTH:{tth}", self.size)
            }
            SearchQuery::Terms(terms) => format!(
                "{restricted}?{is_max}?{}?{}?{}",
                self.size,
                self.kind.to_wire(),
                terms.join("$")
            ),
        }
    }
}

/// One `$SR` search result, formatted for the wire.
///
/// Directory results carry no size field; TTH-bearing results replace the
/// hub name with `TTH:<hash>`. A passive result carries the recipient
/// nick in a trailing field so the hub can route it.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Our own nick on the hub
    pub nick: String,
    /// Virtual path of the match, `\`-separated
    pub virtual_path: String,
    /// File size; `None` for a directory match
    pub size: Option<u64>,
    /// Free upload slots
    pub free_slots: u32,
    /// Total upload slots
    pub total_slots: u32,
    /// TTH of the matched file, when known
    pub tth: Option<Tth>,
    /// Hub display name, used when no TTH is known
    pub hub_name: String,
    /// Hub address as `ip:port`
    pub hub_addr: String,
    /// Recipient nick for passive delivery
    pub target: Option<String>,
}

impl fmt::Display for SearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$SR {} {}", self.nick, self.virtual_path)?;
        if let Some(size) = self.size {
            write!(f, "{SR_SEPARATOR}{size}")?;
        }
        write!(f, " {}/{}{SR_SEPARATOR}", self.free_slots, self.total_slots)?;
        match &self.tth {
            Some(tth) => write!(f, "TTH:{tth}")?,
            None => f.write_str(&self.hub_name)?,
        }
        write!(f, " ({})", self.hub_addr)?;
        if let Some(target) = &self.target {
            write!(f, "{SR_SEPARATOR}{target}")?;
        }
        Ok(())
    }
}

/// A received `$SR`, parsed for the search-response collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrInfo {
    /// Responding nick
    pub nick: String,
    /// Virtual path of the result
    pub path: String,
    /// File size; `None` for directory results
    pub size: Option<u64>,
    /// Free slots at the responder
    pub free_slots: u32,
    /// Total slots at the responder
    pub total_slots: u32,
    /// `TTH:<hash>` or the hub name
    pub hub_or_tth: String,
    /// Hub address as reported
    pub hub_addr: String,
}

impl FromStr for SrInfo {
    type Err = ProtoError;

    /// Parse the argument part of a received `$SR`
    fn from_str(args: &str) -> Result<Self, Self::Err> {
        const CMD: &str = "$SR";
        let err = || ProtoError::Malformed { command: CMD };

        let mut fields = args.split(SR_SEPARATOR);
        let head = fields.next().ok_or_else(err)?;
        let (nick, path_part) = head.split_once(' ').ok_or_else(err)?;

        let second = fields.next().ok_or_else(err)?;
        let hub_field = fields.next();

        // With three separator-delimited fields the second one is
        // "<size> <free>/<total>"; with two, the slots ride at the end of
        // the head field and the result is a directory.
        let (path, size, slots, hub_part) = match hub_field {
            Some(hub_part) => {
                let (size, slots) = second.split_once(' ').ok_or_else(err)?;
                let size = size.parse().map_err(|_| err())?;
                (path_part.to_string(), Some(size), slots, hub_part)
            }
            None => {
                let (path, slots) = path_part.rsplit_once(' ').ok_or_else(err)?;
                (path.to_string(), None, slots, second)
            }
        };

        let (free, total) = slots.split_once('/').ok_or_else(err)?;
        let (hub_or_tth, addr) = hub_part.rsplit_once(" (").ok_or_else(err)?;
        let hub_addr = addr.trim_end_matches(')').to_string();

        Ok(Self {
            nick: nick.to_string(),
            path,
            size,
            free_slots: free.parse().map_err(|_| err())?,
            total_slots: total.trim().parse().map_err(|_| err())?,
            hub_or_tth: hub_or_tth.to_string(),
            hub_addr,
        })
    }
}
