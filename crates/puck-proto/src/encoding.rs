//! The legacy-encoding boundary.
//!
//! NMDC predates UTF-8 adoption: every hub speaks some legacy code page,
//! typically Windows-1252. All inbound bytes are decoded lossily to UTF-8
//! here, and all outbound text is encoded back, with unmappable code
//! points carried as `&#NNN;` numeric entities. The rest of the client
//! never sees legacy bytes.

use encoding_rs::{Encoding, WINDOWS_1252};

/// The legacy encoding negotiated for a hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubEncoding(&'static Encoding);

impl HubEncoding {
    /// Look up an encoding by label, e.g. `WINDOWS-1252` or `KOI8-R`.
    /// Unknown labels fall back to the NMDC default of Windows-1252.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        Self(Encoding::for_label(label.as_bytes()).unwrap_or(WINDOWS_1252))
    }

    /// The canonical name of the underlying encoding
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Decode legacy bytes to UTF-8, replacing undecodable sequences
    #[must_use]
    pub fn decode_lossy(&self, bytes: &[u8]) -> String {
        let (text, _, _) = self.0.decode(bytes);
        text.into_owned()
    }

    /// Encode UTF-8 text to legacy bytes. Code points the encoding cannot
    /// represent are emitted as `&#NNN;` numeric entities, matching the
    /// convention NMDC clients expect.
    #[must_use]
    pub fn encode_escaped(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.0.encode(text);
        bytes.into_owned()
    }
}

impl Default for HubEncoding {
    fn default() -> Self {
        Self(WINDOWS_1252)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_windows_1252() {
        assert_eq!(HubEncoding::default().name(), "windows-1252");
    }

    #[test]
    fn test_unknown_label_falls_back() {
        assert_eq!(HubEncoding::from_label("no-such-charset").name(), "windows-1252");
    }

    #[test]
    fn test_decode_lossy_windows_1252() {
        // 0xE5 is 'å' in Windows-1252
        let enc = HubEncoding::default();
        assert_eq!(enc.decode_lossy(b"sm\xE5bord"), "sm\u{e5}bord");
    }

    #[test]
    fn test_encode_roundtrip() {
        let enc = HubEncoding::default();
        let bytes = enc.encode_escaped("sm\u{e5}bord");
        assert_eq!(bytes, b"sm\xE5bord");
        assert_eq!(enc.decode_lossy(&bytes), "sm\u{e5}bord");
    }

    #[test]
    fn test_unmappable_becomes_entity() {
        let enc = HubEncoding::default();
        // CJK is not representable in Windows-1252
        assert_eq!(enc.encode_escaped("\u{4e2d}"), b"&#20013;");
    }

    #[test]
    fn test_koi8_label() {
        let enc = HubEncoding::from_label("koi8-r");
        assert_eq!(enc.name(), "KOI8-R");
        // 0xC1 is Cyrillic small a in KOI8-R
        assert_eq!(enc.decode_lossy(&[0xC1]), "\u{430}");
    }
}
