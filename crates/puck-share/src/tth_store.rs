//! The persistent TTH store.
//!
//! An append-only text log (`tth2.db`) maps content hashes to their leaf
//! data and inodes to their last-seen (mtime, TTH) pair. Replaying the
//! log rebuilds the in-memory maps; leaf data is not loaded eagerly, only
//! the byte offset of each `+T` line is remembered so the payload can be
//! fetched later with a positioned read.
//!
//! Line kinds, numeric fields in uppercase hex:
//!
//! ```text
//! +T:<39-char-tth>:<base64-leaves>
//! +I:<hex-inode>:<hex-mtime>:<39-char-tth>
//! -T:<39-char-tth>
//! -I:<hex-inode>
//! ```
//!
//! Anything else is tolerated, logged, and flags the store for a future
//! normalization pass.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use puck_hash::Tth;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The store's file name inside the working directory
pub const STORE_FILENAME: &str = "tth2.db";

/// Errors from the TTH store
#[derive(Debug, Error)]
pub enum TthStoreError {
    /// The backing file could not be opened, read or appended
    #[error("TTH store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A positioned read did not find the expected record
    #[error("TTH store corrupt at offset {offset}: expected {expected}")]
    Corrupt {
        /// Offset the record was expected at
        offset: u64,
        /// The TTH the record should carry
        expected: Tth,
    },
}

/// One known content hash
#[derive(Debug)]
pub struct TthEntry {
    /// Byte offset of this entry's `+T` line in the log
    pub leaf_offset: u64,
    /// Decoded leaf data, populated lazily
    pub leaf_data: Option<Vec<u8>>,
    /// The inode currently claiming this TTH, if any
    pub active_inode: Option<u64>,
}

/// Last-seen state of one inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    /// Modification time in seconds
    pub mtime: u64,
    /// Content hash at that time
    pub tth: Tth,
}

/// The store itself: two in-memory maps over an append-only log file
pub struct TthStore {
    path: PathBuf,
    file: File,
    entries: BTreeMap<Tth, TthEntry>,
    inodes: BTreeMap<u64, InodeRecord>,
    needs_normalize: bool,
    loading: bool,
}

impl TthStore {
    /// Open (creating if needed) and replay the log at `path`.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Io`] when the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TthStoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut store = Self {
            path,
            file,
            entries: BTreeMap::new(),
            inodes: BTreeMap::new(),
            needs_normalize: false,
            loading: true,
        };
        store.replay()?;
        store.loading = false;

        Ok(store)
    }

    /// Open the conventional store inside a working directory
    ///
    /// # Errors
    ///
    /// Same as [`TthStore::open`].
    pub fn open_in(workdir: &Path) -> Result<Self, TthStoreError> {
        Self::open(workdir.join(STORE_FILENAME))
    }

    /// Whether replay saw removals or junk worth compacting away
    #[must_use]
    pub fn needs_normalize(&self) -> bool {
        self.needs_normalize
    }

    /// Number of known TTH entries
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn replay(&mut self) -> Result<(), TthStoreError> {
        info!(path = %self.path.display(), "loading TTH store");

        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut offset = 0u64;
        let mut line_number = 0u32;
        let mut buf = Vec::new();
        let mut ntth = 0i64;
        let mut ninode = 0i64;

        loop {
            buf.clear();
            let len = reader.read_until(b'\n', &mut buf)?;
            if len == 0 {
                break;
            }
            line_number += 1;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);

            match line.get(..3) {
                Some("+T:") => {
                    if Self::apply_add_entry(&mut self.entries, &line[3..], offset) {
                        ntth += 1;
                    } else {
                        warn!(line_number, "failed to load TTH line");
                    }
                }
                Some("+I:") => {
                    if Self::apply_add_inode(&mut self.entries, &mut self.inodes, &line[3..]) {
                        ninode += 1;
                    } else {
                        warn!(line_number, "failed to load inode line");
                    }
                }
                Some("-T:") => {
                    if let Ok(tth) = line[3..].parse::<Tth>() {
                        self.entries.remove(&tth);
                        ntth -= 1;
                    }
                    self.needs_normalize = true;
                }
                Some("-I:") => {
                    if let Ok(inode) = u64::from_str_radix(&line[3..], 16) {
                        self.inodes.remove(&inode);
                        ninode -= 1;
                    }
                    self.needs_normalize = true;
                }
                _ if line.is_empty() => {}
                _ => {
                    debug!(line_number, "unknown line kind, skipping");
                    self.needs_normalize = true;
                }
            }

            offset += len as u64;
        }

        info!(ntth, ninode, "done loading TTH store");
        Ok(())
    }

    fn apply_add_entry(entries: &mut BTreeMap<Tth, TthEntry>, args: &str, offset: u64) -> bool {
        let Some((tth, _leaves)) = args.split_once(':') else {
            return false;
        };
        let Ok(tth) = tth.parse::<Tth>() else {
            return false;
        };

        entries.entry(tth).or_insert(TthEntry {
            leaf_offset: offset,
            leaf_data: None,
            active_inode: None,
        });
        true
    }

    fn apply_add_inode(
        entries: &mut BTreeMap<Tth, TthEntry>,
        inodes: &mut BTreeMap<u64, InodeRecord>,
        args: &str,
    ) -> bool {
        let mut fields = args.split(':');
        let (Some(inode), Some(mtime), Some(tth)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return false;
        };
        let Ok(inode) = u64::from_str_radix(inode, 16) else {
            return false;
        };
        let Ok(mtime) = u64::from_str_radix(mtime, 16) else {
            return false;
        };
        let Ok(tth) = tth.parse::<Tth>() else {
            return false;
        };
        if inode == 0 || mtime == 0 {
            return false;
        }

        inodes.insert(inode, InodeRecord { mtime, tth });

        // The last claim in log order wins on restart
        if let Some(entry) = entries.get_mut(&tth) {
            entry.active_inode = Some(inode);
        }
        true
    }

    /// Record a content hash with its Base64 leaf data.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Io`] when the append fails.
    pub fn add_entry(&mut self, tth: Tth, leaves_base64: &str) -> Result<(), TthStoreError> {
        if self.entries.contains_key(&tth) {
            return Ok(());
        }

        // The file is in append mode; the end position is where the
        // record will land.
        let offset = self.file.seek(SeekFrom::End(0))?;
        writeln!(self.file, "+T:{tth}:{leaves_base64}")?;

        self.entries.insert(
            tth,
            TthEntry {
                leaf_offset: offset,
                leaf_data: None,
                active_inode: None,
            },
        );
        Ok(())
    }

    /// Record (or refresh) the mtime and TTH of an inode.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Io`] when the append fails.
    pub fn add_inode(&mut self, inode: u64, mtime: u64, tth: Tth) -> Result<(), TthStoreError> {
        let record = InodeRecord { mtime, tth };
        if self.inodes.get(&inode) == Some(&record) {
            return Ok(());
        }

        writeln!(self.file, "+I:{inode:X}:{mtime:X}:{tth}")?;
        self.inodes.insert(inode, record);
        Ok(())
    }

    /// Forget a content hash.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Io`] when the append fails.
    pub fn remove(&mut self, tth: Tth) -> Result<(), TthStoreError> {
        if self.entries.remove(&tth).is_some() {
            writeln!(self.file, "-T:{tth}")?;
        }
        Ok(())
    }

    /// Forget an inode.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Io`] when the append fails.
    pub fn remove_inode(&mut self, inode: u64) -> Result<(), TthStoreError> {
        if self.inodes.remove(&inode).is_some() {
            writeln!(self.file, "-I:{inode:X}")?;
        }
        Ok(())
    }

    /// Look up a content hash
    #[must_use]
    pub fn lookup(&self, tth: &Tth) -> Option<&TthEntry> {
        self.entries.get(tth)
    }

    /// Look up an inode's last-seen record
    #[must_use]
    pub fn lookup_inode(&self, inode: u64) -> Option<&InodeRecord> {
        self.inodes.get(&inode)
    }

    /// Resolve an inode to its TTH
    #[must_use]
    pub fn tth_by_inode(&self, inode: u64) -> Option<Tth> {
        self.inodes.get(&inode).map(|r| r.tth)
    }

    /// Mark `inode` as the one claiming `tth`. Memory-only; on restart
    /// the claim is implicit in the log order of `+I` lines.
    pub fn set_active_inode(&mut self, tth: Tth, inode: u64) {
        if let Some(entry) = self.entries.get_mut(&tth) {
            entry.active_inode = Some(inode);
        }
    }

    /// The inode currently claiming `tth`
    #[must_use]
    pub fn active_inode(&self, tth: &Tth) -> Option<u64> {
        self.entries.get(tth).and_then(|e| e.active_inode)
    }

    /// Load (and cache) the leaf data for `tth` from its recorded offset.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Corrupt`] when the line at the offset
    /// is not the expected `+T` record, or with [`TthStoreError::Io`] on
    /// read failure.
    pub fn load_leaf_data(&mut self, tth: Tth) -> Result<&[u8], TthStoreError> {
        let entry = self
            .entries
            .get_mut(&tth)
            .ok_or(TthStoreError::Corrupt {
                offset: 0,
                expected: tth,
            })?;

        if entry.leaf_data.is_some() {
            return Ok(entry.leaf_data.as_deref().expect("cached leaf data"));
        }

        debug!(%tth, offset = entry.leaf_offset, "loading leaf data");

        let corrupt = |offset| TthStoreError::Corrupt {
            offset,
            expected: tth,
        };

        // Positioned read; the append cursor is re-established by the
        // explicit seek in the next write.
        self.file.seek(SeekFrom::Start(entry.leaf_offset))?;
        let mut line = Vec::new();
        let mut reader = BufReader::new(&mut self.file);
        reader.read_until(b'\n', &mut line)?;

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\n', '\r']);

        let payload = text
            .strip_prefix("+T:")
            .and_then(|rest| rest.strip_prefix(&tth.to_base32()))
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| corrupt(entry.leaf_offset))?;

        // tolerate (and drop) excess fields after the payload
        let payload = payload.split(':').next().unwrap_or(payload);
        let decoded = BASE64
            .decode(payload)
            .map_err(|_| corrupt(entry.leaf_offset))?;
        if decoded.is_empty() {
            return Err(corrupt(entry.leaf_offset));
        }

        entry.leaf_data = Some(decoded);
        Ok(entry.leaf_data.as_deref().expect("just loaded"))
    }

    /// Rewrite the log without superseded records and swap it in place
    /// with an atomic rename. Leaf data is carried over verbatim.
    ///
    /// # Errors
    ///
    /// Fails with [`TthStoreError::Io`] on any file operation; the
    /// original log is left untouched in that case.
    pub fn compact(&mut self) -> Result<(), TthStoreError> {
        let tmp_path = self.path.with_extension("db.new");
        let mut tmp = File::create(&tmp_path)?;

        let tths: Vec<Tth> = self.entries.keys().copied().collect();
        let mut offsets = BTreeMap::new();
        let mut written = 0u64;

        for tth in tths {
            // raw payload straight from the old log
            self.file.seek(SeekFrom::Start(self.entries[&tth].leaf_offset))?;
            let mut line = Vec::new();
            BufReader::new(&mut self.file).read_until(b'\n', &mut line)?;

            offsets.insert(tth, written);
            tmp.write_all(&line)?;
            written += line.len() as u64;
        }

        for (inode, record) in &self.inodes {
            let line = format!("+I:{inode:X}:{:X}:{}\n", record.mtime, record.tth);
            tmp.write_all(line.as_bytes())?;
        }

        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        for (tth, offset) in offsets {
            if let Some(entry) = self.entries.get_mut(&tth) {
                entry.leaf_offset = offset;
            }
        }
        self.needs_normalize = false;

        info!(entries = self.entries.len(), "TTH store compacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use tempfile::TempDir;

    const TTH: &str = "7LSZ6K2ZFQJBSEIRWM72N7VW2IULICCDW5ZUMJI";

    fn sample_store(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(STORE_FILENAME);
        let leaves = BASE64.encode([0xABu8; 48]);
        std::fs::write(
            &path,
            format!("+T:{TTH}:{leaves}\n+I:61529D00001A7B:404E3394:{TTH}\n"),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_replay_binds_tth_and_inode() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);

        let store = TthStore::open(&path).unwrap();
        let tth: Tth = TTH.parse().unwrap();

        let entry = store.lookup(&tth).unwrap();
        assert_eq!(entry.active_inode, Some(0x0061_529D_0000_1A7B));
        assert_eq!(entry.leaf_offset, 0);

        let record = store.lookup_inode(0x0061_529D_0000_1A7B).unwrap();
        assert_eq!(record.tth, tth);
        assert_eq!(record.mtime, 0x404E_3394);
        assert!(!store.needs_normalize());
    }

    #[test]
    fn test_load_leaf_data() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);

        let mut store = TthStore::open(&path).unwrap();
        let tth: Tth = TTH.parse().unwrap();
        let data = store.load_leaf_data(tth).unwrap().to_vec();
        assert_eq!(data, vec![0xABu8; 48]);

        // second load comes from the cache
        assert_eq!(store.load_leaf_data(tth).unwrap(), &data[..]);
    }

    #[test]
    fn test_writes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILENAME);
        let tth: Tth = TTH.parse().unwrap();

        {
            let mut store = TthStore::open(&path).unwrap();
            store.add_entry(tth, &BASE64.encode([1u8; 24])).unwrap();
            store.add_inode(42, 1000, tth).unwrap();
        }

        let mut store = TthStore::open(&path).unwrap();
        assert_eq!(store.lookup_inode(42).unwrap().mtime, 1000);
        assert_eq!(store.active_inode(&tth), Some(42));
        assert_eq!(store.load_leaf_data(tth).unwrap(), [1u8; 24]);
    }

    #[test]
    fn test_removal_tombstones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILENAME);
        let tth: Tth = TTH.parse().unwrap();

        {
            let mut store = TthStore::open(&path).unwrap();
            store.add_entry(tth, "QUJD").unwrap();
            store.add_inode(42, 1000, tth).unwrap();
            store.remove(tth).unwrap();
            store.remove_inode(42).unwrap();
        }

        let store = TthStore::open(&path).unwrap();
        assert!(store.lookup(&tth).is_none());
        assert!(store.lookup_inode(42).is_none());
        assert!(store.needs_normalize());
    }

    #[test]
    fn test_junk_lines_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILENAME);
        std::fs::write(&path, "!!garbage!!\n+X:nope\n").unwrap();

        let store = TthStore::open(&path).unwrap();
        assert_eq!(store.entry_count(), 0);
        assert!(store.needs_normalize());
    }

    #[test]
    fn test_corrupt_offset_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILENAME);
        let other = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";
        // entry offset will point at a +T line for a different TTH
        std::fs::write(&path, format!("+T:{TTH}:QUJD\n")).unwrap();

        let mut store = TthStore::open(&path).unwrap();
        let tth: Tth = TTH.parse().unwrap();
        // corrupt the file behind the store's back
        std::fs::write(&path, format!("+T:{other}:QUJD\n")).unwrap();

        match store.load_leaf_data(tth) {
            Err(TthStoreError::Corrupt { expected, .. }) => assert_eq!(expected, tth),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILENAME);
        let tth: Tth = TTH.parse().unwrap();
        let gone: Tth = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ".parse().unwrap();

        {
            let mut store = TthStore::open(&path).unwrap();
            store.add_entry(gone, "QUJD").unwrap();
            store.add_entry(tth, &BASE64.encode([7u8; 24])).unwrap();
            store.add_inode(42, 1000, tth).unwrap();
            store.remove(gone).unwrap();
            store.compact().unwrap();

            // offsets are rewritten; leaf data still reachable
            assert_eq!(store.load_leaf_data(tth).unwrap(), [7u8; 24]);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains(&gone.to_base32()));
        assert!(!contents.contains("-T:"));

        let store = TthStore::open(&path).unwrap();
        assert!(!store.needs_normalize());
        assert_eq!(store.active_inode(&tth), Some(42));
    }
}
