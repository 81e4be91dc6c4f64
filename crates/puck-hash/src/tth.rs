//! The Base32 TTH string form.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use data_encoding::{Encoding, Specification, BASE32_NOPAD};
use thiserror::Error;

use crate::DIGEST_SIZE;

/// Decoding must accept hashes whose final symbol carries non-zero
/// padding bits; plenty of clients in the wild emit those.
fn base32_relaxed() -> &'static Encoding {
    static RELAXED: OnceLock<Encoding> = OnceLock::new();
    RELAXED.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
        spec.check_trailing_bits = false;
        spec.encoding().expect("static Base32 specification")
    })
}

/// Length of a TTH in its Base32 form
pub const TTH_LEN: usize = 39;

/// Errors from parsing a TTH string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TthParseError {
    /// Wrong length (must be exactly 39 characters)
    #[error("invalid TTH length: expected {TTH_LEN}, got {0}")]
    Length(usize),

    /// Characters outside the Base32 alphabet
    #[error("invalid Base32 in TTH")]
    Encoding,
}

/// A Tiger Tree Hash root in its canonical 39-character Base32 form.
///
/// This is the content address used in search requests, filelists and the
/// TTH store. The inner representation is the raw 24-byte digest; `Display`
/// renders the Base32 form without padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tth([u8; DIGEST_SIZE]);

impl Tth {
    /// Wrap a raw Tiger digest
    #[must_use]
    pub fn from_digest(digest: [u8; DIGEST_SIZE]) -> Self {
        Self(digest)
    }

    /// The raw 24 digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Base32-encode the digest
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

impl fmt::Display for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl FromStr for Tth {
    type Err = TthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TTH_LEN {
            return Err(TthParseError::Length(s.len()));
        }

        let decoded = base32_relaxed()
            .decode(s.as_bytes())
            .map_err(|_| TthParseError::Encoding)?;

        let mut digest = [0u8; DIGEST_SIZE];
        if decoded.len() != DIGEST_SIZE {
            return Err(TthParseError::Encoding);
        }
        digest.copy_from_slice(&decoded);

        Ok(Self(digest))
    }
}

/// Check whether a string looks like a valid TTH without allocating
#[must_use]
pub fn is_valid_tth(s: &str) -> bool {
    s.len() == TTH_LEN
        && s.bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}
