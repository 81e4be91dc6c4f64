//! Bloom filter over filename fragments.
//!
//! Shared filenames are split into subkeys on the NMDC delimiter set,
//! every overlapping four-code-point window of each subkey is case-folded
//! and Tiger-hashed, and five 32-bit slices of the digest each set one
//! bit. A search term can then be tested the same way: if any window of
//! any subkey misses a bit, the share definitely holds no matching name.

use puck_hash::tiger_digest;

/// Characters that split a filename into subkeys
const DELIMITERS: &[char] = &['$', '.', '-', '_', '(', ')', '[', ']', '{', '}', ' '];

/// Window length in code points; shorter subkeys are not indexed
const WINDOW: usize = 4;

/// Number of bits set per window
const HASHES: usize = 5;

/// Default filter length in bytes
pub const DEFAULT_LENGTH: usize = 32 * 1024;

/// A fixed-size bloom filter with a bit-collision counter.
#[derive(Debug, Clone)]
pub struct Bloom {
    bits: Vec<u8>,
    collisions: u64,
}

impl Bloom {
    /// Create a filter of `length` bytes.
    ///
    /// # Panics
    ///
    /// Panics when `length` is zero.
    #[must_use]
    pub fn new(length: usize) -> Self {
        assert!(length > 0);
        Self {
            bits: vec![0; length],
            collisions: 0,
        }
    }

    /// Filter length in bytes
    #[must_use]
    pub fn length(&self) -> usize {
        self.bits.len()
    }

    /// How many set operations hit an already-set bit
    #[must_use]
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Clear every bit
    pub fn reset(&mut self) {
        self.bits.fill(0);
        self.collisions = 0;
    }

    fn set_bit(&mut self, bit: u32) {
        let offset = (bit >> 3) as usize;
        let mask = 1u8 << (bit & 7);
        if self.bits[offset] & mask == mask {
            self.collisions += 1;
        }
        self.bits[offset] |= mask;
    }

    fn get_bit(&self, bit: u32) -> bool {
        let offset = (bit >> 3) as usize;
        let mask = 1u8 << (bit & 7);
        self.bits[offset] & mask == mask
    }

    /// Five filter positions for one window key
    fn positions(&self, key: &str) -> [u32; HASHES] {
        let digest = tiger_digest(key.as_bytes());
        let nbits = (self.bits.len() * 8) as u32;

        let mut out = [0u32; HASHES];
        for (i, slot) in out.iter_mut().enumerate() {
            let mut slice = [0u8; 4];
            slice.copy_from_slice(&digest[i * 4..i * 4 + 4]);
            *slot = u32::from_le_bytes(slice) % nbits;
        }
        out
    }

    /// Visit every case-folded window of `key`; the visitor returns
    /// `false` to stop early.
    fn each_window(key: &str, mut visit: impl FnMut(&str) -> bool) -> bool {
        let chars: Vec<char> = key.chars().collect();
        if chars.len() < WINDOW {
            return true;
        }

        for start in 0..=chars.len() - WINDOW {
            let folded: String = chars[start..start + WINDOW]
                .iter()
                .flat_map(|c| c.to_lowercase())
                .collect();
            if !visit(&folded) {
                return false;
            }
        }
        true
    }

    /// Index one subkey
    fn add_key(&mut self, key: &str) {
        Self::each_window(key, |window| {
            // positions() borrows immutably, so collect first
            let positions = self.positions(window);
            for bit in positions {
                self.set_bit(bit);
            }
            true
        });
    }

    /// Test one subkey; false means "definitely absent"
    fn check_key(&self, key: &str) -> bool {
        Self::each_window(key, |window| {
            self.positions(window).into_iter().all(|bit| self.get_bit(bit))
        })
    }

    /// Index a shared filename
    pub fn add_filename(&mut self, filename: &str) {
        for subkey in filename.split(|c: char| DELIMITERS.contains(&c) || c.is_whitespace()) {
            if !subkey.is_empty() {
                self.add_key(subkey);
            }
        }
    }

    /// Could `filename` (or a search term) be present? A `false` answer
    /// is definitive; `true` only means the full scan is worth running.
    #[must_use]
    pub fn may_contain(&self, filename: &str) -> bool {
        filename
            .split(|c: char| DELIMITERS.contains(&c) || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .all(|subkey| self.check_key(subkey))
    }

    /// Number of set bits
    #[must_use]
    pub fn filled_bits(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// Percentage of set bits
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn filled_percent(&self) -> f32 {
        (self.filled_bits() as f32 * 100.0) / (self.bits.len() * 8) as f32
    }

    /// OR another filter of the same length into this one.
    ///
    /// # Panics
    ///
    /// Panics when the lengths differ.
    pub fn merge(&mut self, other: &Bloom) {
        assert_eq!(self.bits.len(), other.bits.len());
        for (dst, src) in self.bits.iter_mut().zip(&other.bits) {
            *dst |= src;
        }
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self::new(DEFAULT_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_added_filename_matches() {
        let mut bloom = Bloom::new(256);
        bloom.add_filename("The Tiger - A Fast New Hash Function.pdf");
        assert!(bloom.may_contain("tiger"));
        assert!(bloom.may_contain("Function"));
        assert!(bloom.may_contain("FAST"));
    }

    #[test]
    fn test_fresh_filter_rejects() {
        let bloom = Bloom::new(256);
        assert!(!bloom.may_contain("anything"));
    }

    #[test]
    fn test_short_fragments_always_pass() {
        let bloom = Bloom::new(256);
        // under four code points there is nothing to index or test
        assert!(bloom.may_contain("abc"));
        assert!(bloom.may_contain("a-b"));
    }

    #[test]
    fn test_case_insensitive() {
        let mut bloom = Bloom::new(256);
        bloom.add_filename("SomeMixedCaseName");
        assert!(bloom.may_contain("somemixedcasename"));
        assert!(bloom.may_contain("SOMEMIXEDCASENAME"));
    }

    #[test]
    fn test_substring_windows_match() {
        let mut bloom = Bloom::new(1024);
        bloom.add_filename("abcdefgh");
        // every four-char window of an indexed name is present
        assert!(bloom.may_contain("cdef"));
        assert!(bloom.may_contain("defgh"));
    }

    #[test]
    fn test_delimiters_split_subkeys() {
        let mut bloom = Bloom::new(1024);
        bloom.add_filename("alpha_beta(gamma).ext4");
        assert!(bloom.may_contain("alpha"));
        assert!(bloom.may_contain("beta"));
        assert!(bloom.may_contain("gamma"));
        assert!(bloom.may_contain("ext4"));
    }

    #[test]
    fn test_reset_and_fill_stats() {
        let mut bloom = Bloom::new(64);
        assert_eq!(bloom.filled_bits(), 0);
        bloom.add_filename("something long enough");
        assert!(bloom.filled_bits() > 0);
        assert!(bloom.filled_percent() > 0.0);
        bloom.reset();
        assert_eq!(bloom.filled_bits(), 0);
    }

    #[test]
    fn test_merge() {
        let mut a = Bloom::new(256);
        let mut b = Bloom::new(256);
        a.add_filename("first-name");
        b.add_filename("second-name");
        a.merge(&b);
        assert!(a.may_contain("first"));
        assert!(a.may_contain("second"));
    }

    proptest! {
        // Soundness: every substring of an indexed basename must match.
        #[test]
        fn prop_no_false_negatives(
            name in "[a-zA-Z0-9]{4,24}",
            start in 0usize..20,
            len in 4usize..24,
        ) {
            let mut bloom = Bloom::new(512);
            bloom.add_filename(&name);

            let start = start.min(name.len().saturating_sub(4));
            let end = (start + len).min(name.len());
            if end - start >= 4 {
                prop_assert!(bloom.may_contain(&name[start..end]));
            }
        }
    }
}
