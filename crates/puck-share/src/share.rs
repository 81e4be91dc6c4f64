//! The share index.
//!
//! A share is a set of mountpoints, each exposing a local directory under
//! a virtual root name. Files live in exactly one of two trees: *hashed*
//! (TTH confirmed, visible to peers) or *unhashed* (queued for the hasher
//! daemon). An inode table over the hashed tree detects duplicate content
//! without rehashing; duplicates are counted per mountpoint and dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use puck_hash::Tth;
use puck_proto::FileKind;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bloom::Bloom;
use crate::kind;
use crate::tth_store::{TthStore, TthStoreError};

/// Stable identifier of a mountpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MountId(u32);

/// Errors from share manipulation
#[derive(Debug, Error)]
pub enum ShareError {
    /// Walking a mountpoint failed
    #[error("share I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The local or virtual root is already shared
    #[error("already shared: {0}")]
    Duplicate(String),

    /// No such mountpoint
    #[error("not shared: {0}")]
    NotShared(String),
}

/// Per-mountpoint counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountStats {
    /// Bytes in hashed, unique files
    pub size: u64,
    /// Bytes in all indexed files
    pub totsize: u64,
    /// Bytes in discarded duplicates
    pub dupsize: u64,
    /// Hashed, unique files
    pub nfiles: u32,
    /// All indexed files
    pub ntotfiles: u32,
    /// Discarded duplicates
    pub nduplicates: u32,
}

/// Aggregate counters over every mountpoint
pub type ShareStats = MountStats;

/// One shared directory
#[derive(Debug)]
pub struct Mountpoint {
    /// Local filesystem root
    pub local_root: PathBuf,
    /// Name peers see as the first path component
    pub virtual_root: String,
    /// Counters
    pub stats: MountStats,
    /// A scan is currently walking this mountpoint
    pub scan_in_progress: bool,
    /// Tombstone read by an in-flight scanner so it aborts gracefully
    pub removed: bool,
}

/// One indexed file
#[derive(Debug, Clone)]
pub struct ShareFile {
    /// Owning mountpoint
    pub mount: MountId,
    /// Path below the mount root, `/`-separated
    pub partial_path: String,
    /// Extension-derived kind
    pub kind: FileKind,
    /// Size in bytes
    pub size: u64,
    /// Stable filesystem identity
    pub inode: u64,
}

impl ShareFile {
    /// The basename, as indexed by the bloom filter
    #[must_use]
    pub fn basename(&self) -> &str {
        self.partial_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.partial_path)
    }
}

/// One file found by a filesystem walk
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Absolute local path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Inode number
    pub inode: u64,
    /// Modification time in seconds
    pub mtime: u64,
}

/// What happened to a file the hasher finished with
#[derive(Debug, PartialEq, Eq)]
pub enum HashOutcomeKind {
    /// Promoted into the hashed tree
    Hashed(Tth),
    /// Same content as an already-shared file; dropped and counted
    Duplicate(Tth),
    /// Hashing failed; dropped from the share
    Failed,
    /// The path was not in the unhashed tree
    NotInShare,
}

/// Result of applying one finished scan
#[derive(Debug, Default)]
pub struct ScanSummary {
    /// Files newly queued for hashing
    pub new_unhashed: Vec<PathBuf>,
    /// Files inserted straight into the hashed tree (mtime unchanged)
    pub kept_hashed: usize,
    /// Files that vanished from disk and were dropped
    pub removed: usize,
    /// The mountpoint was tombstoned while the walk ran
    pub aborted: bool,
}

/// The share index proper
pub struct Share {
    mounts: BTreeMap<MountId, Mountpoint>,
    next_mount: u32,
    hashed: BTreeMap<PathBuf, ShareFile>,
    unhashed: BTreeMap<PathBuf, ShareFile>,
    inodes: HashMap<u64, PathBuf>,
    bloom: Bloom,
    uptodate: bool,
}

impl Share {
    /// An empty share with a default-sized bloom filter
    #[must_use]
    pub fn new() -> Self {
        Self {
            mounts: BTreeMap::new(),
            next_mount: 0,
            hashed: BTreeMap::new(),
            unhashed: BTreeMap::new(),
            inodes: HashMap::new(),
            bloom: Bloom::default(),
            uptodate: true,
        }
    }

    /// Add a mountpoint rooted at `local_root`. The virtual root is the
    /// directory's basename.
    ///
    /// # Errors
    ///
    /// Fails with [`ShareError::Duplicate`] when the local or virtual
    /// root is already shared.
    pub fn add_mountpoint(&mut self, local_root: &Path) -> Result<MountId, ShareError> {
        let virtual_root = local_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("share")
            .to_string();

        for mp in self.mounts.values() {
            if mp.local_root == local_root {
                return Err(ShareError::Duplicate(local_root.display().to_string()));
            }
            if mp.virtual_root == virtual_root {
                return Err(ShareError::Duplicate(virtual_root));
            }
        }

        let id = MountId(self.next_mount);
        self.next_mount += 1;
        info!(root = %local_root.display(), virtual_root, "adding mountpoint");

        self.mounts.insert(
            id,
            Mountpoint {
                local_root: local_root.to_path_buf(),
                virtual_root,
                stats: MountStats::default(),
                scan_in_progress: false,
                removed: false,
            },
        );
        Ok(id)
    }

    /// Remove the mountpoint rooted at `local_root` together with every
    /// file it contributed. Idempotent on the file level.
    ///
    /// # Errors
    ///
    /// Fails with [`ShareError::NotShared`] when no such mountpoint
    /// exists.
    pub fn remove_mountpoint(&mut self, local_root: &Path) -> Result<MountId, ShareError> {
        let id = self
            .mounts
            .iter()
            .find(|(_, mp)| mp.local_root == local_root)
            .map(|(id, _)| *id)
            .ok_or_else(|| ShareError::NotShared(local_root.display().to_string()))?;

        if let Some(mp) = self.mounts.get_mut(&id) {
            mp.removed = true;
        }

        let doomed: Vec<PathBuf> = self
            .hashed
            .iter()
            .chain(self.unhashed.iter())
            .filter(|(_, f)| f.mount == id)
            .map(|(p, _)| p.clone())
            .collect();
        for path in doomed {
            self.remove_file(&path);
        }

        self.mounts.remove(&id);
        self.uptodate = false;
        info!(root = %local_root.display(), "mountpoint removed");
        Ok(id)
    }

    /// Look up a mountpoint
    #[must_use]
    pub fn mount(&self, id: MountId) -> Option<&Mountpoint> {
        self.mounts.get(&id)
    }

    /// Iterate over mountpoints
    pub fn mounts(&self) -> impl Iterator<Item = (MountId, &Mountpoint)> {
        self.mounts.iter().map(|(id, mp)| (*id, mp))
    }

    /// Mark a scan as started
    pub fn begin_scan(&mut self, id: MountId) {
        if let Some(mp) = self.mounts.get_mut(&id) {
            mp.scan_in_progress = true;
        }
    }

    /// Fold a finished walk into the index, diffing against the current
    /// trees. New and modified files land in the unhashed tree; files
    /// whose recorded mtime still matches go straight to hashed.
    ///
    /// # Errors
    ///
    /// Propagates TTH store append failures.
    pub fn apply_scan(
        &mut self,
        id: MountId,
        scanned: Vec<ScannedFile>,
        store: &mut TthStore,
    ) -> Result<ScanSummary, TthStoreError> {
        let mut summary = ScanSummary::default();

        let Some(mp) = self.mounts.get_mut(&id) else {
            summary.aborted = true;
            return Ok(summary);
        };
        if mp.removed {
            mp.scan_in_progress = false;
            summary.aborted = true;
            return Ok(summary);
        }
        let local_root = mp.local_root.clone();

        // Drop indexed files that vanished from disk
        let on_disk: BTreeSet<&PathBuf> = scanned.iter().map(|f| &f.path).collect();
        let gone: Vec<PathBuf> = self
            .hashed
            .iter()
            .chain(self.unhashed.iter())
            .filter(|(p, f)| f.mount == id && !on_disk.contains(p))
            .map(|(p, _)| p.clone())
            .collect();
        for path in gone {
            debug!(path = %path.display(), "indexed file no longer on disk");
            self.remove_file(&path);
            summary.removed += 1;
        }

        for found in scanned {
            let Some(partial) = partial_path(&local_root, &found.path) else {
                warn!(path = %found.path.display(), "scanned file outside mount root");
                continue;
            };

            if let Some(existing) = self.hashed.get(&found.path) {
                let fresh = store
                    .lookup_inode(existing.inode)
                    .is_some_and(|rec| rec.mtime == found.mtime);
                if fresh && existing.inode == found.inode && existing.size == found.size {
                    continue;
                }
                // changed on disk; rehash
                debug!(path = %found.path.display(), "file changed, rehashing");
                self.remove_file(&found.path);
            } else if self.unhashed.contains_key(&found.path) {
                continue;
            }

            let file = ShareFile {
                mount: id,
                partial_path: partial,
                kind: kind::classify(&found.path),
                size: found.size,
                inode: found.inode,
            };

            // A second sighting of known content is a duplicate
            if self.inodes.contains_key(&found.inode) {
                let mp = self.mounts.get_mut(&id).expect("mount checked above");
                mp.stats.dupsize += found.size;
                mp.stats.nduplicates += 1;
                continue;
            }

            let known = store
                .lookup_inode(found.inode)
                .filter(|rec| rec.mtime == found.mtime)
                .map(|rec| rec.tth);

            match known.filter(|tth| store.lookup(tth).is_some()) {
                Some(tth) => {
                    // Already hashed and unchanged; no trip through the
                    // hasher needed.
                    if store.active_inode(&tth).is_none() {
                        store.set_active_inode(tth, found.inode);
                    }
                    self.insert_hashed(found.path, file);
                    summary.kept_hashed += 1;
                }
                None => {
                    self.insert_unhashed(found.path.clone(), file);
                    summary.new_unhashed.push(found.path);
                }
            }
        }

        if let Some(mp) = self.mounts.get_mut(&id) {
            mp.scan_in_progress = false;
        }
        self.uptodate = false;
        Ok(summary)
    }

    /// Handle a hasher result for `path`. `result` is `None` when
    /// hashing failed; the file is then dropped from the share.
    ///
    /// # Errors
    ///
    /// Propagates TTH store append failures.
    pub fn on_tth_available(
        &mut self,
        path: &Path,
        result: Option<(Tth, &str, u64)>,
        store: &mut TthStore,
    ) -> Result<HashOutcomeKind, TthStoreError> {
        let Some(file) = self.unhashed.remove(path) else {
            warn!(path = %path.display(), "hashed file not in unhashed tree");
            return Ok(HashOutcomeKind::NotInShare);
        };

        let Some((tth, leaves_base64, mtime)) = result else {
            debug!(path = %path.display(), "hashing failed, dropping file");
            self.drop_unhashed_stats(&file);
            return Ok(HashOutcomeKind::Failed);
        };

        let first_claim = store.lookup(&tth).is_none();
        if first_claim {
            store.add_entry(tth, leaves_base64)?;
        }
        store.add_inode(file.inode, mtime, tth)?;
        self.uptodate = false;

        if !first_claim {
            // TTH not unique; keep the previous claimant when it is
            // still shared and count this file as a duplicate.
            let original_shared = store
                .active_inode(&tth)
                .is_some_and(|inode| self.inodes.contains_key(&inode));
            if original_shared {
                if let Some(mp) = self.mounts.get_mut(&file.mount) {
                    mp.stats.nduplicates += 1;
                    mp.stats.dupsize += file.size;
                }
                self.drop_unhashed_stats(&file);
                return Ok(HashOutcomeKind::Duplicate(tth));
            }
        }

        store.set_active_inode(tth, file.inode);
        self.insert_hashed(path.to_path_buf(), file);
        Ok(HashOutcomeKind::Hashed(tth))
    }

    fn insert_hashed(&mut self, path: PathBuf, file: ShareFile) {
        if self.hashed.contains_key(&path) {
            warn!(path = %path.display(), "file already in hashed tree");
            return;
        }

        if let Some(mp) = self.mounts.get_mut(&file.mount) {
            mp.stats.size += file.size;
            mp.stats.nfiles += 1;
            mp.stats.totsize += file.size;
            mp.stats.ntotfiles += 1;
        }
        self.bloom.add_filename(file.basename());
        self.inodes.insert(file.inode, path.clone());
        self.hashed.insert(path, file);
    }

    fn insert_unhashed(&mut self, path: PathBuf, file: ShareFile) {
        self.unhashed.insert(path, file);
    }

    fn drop_unhashed_stats(&mut self, _file: &ShareFile) {
        // unhashed files are not yet counted anywhere
    }

    /// Remove `path` from both trees and the inode table. Idempotent.
    pub fn remove_file(&mut self, path: &Path) {
        if let Some(file) = self.hashed.remove(path) {
            self.inodes.remove(&file.inode);
            if let Some(mp) = self.mounts.get_mut(&file.mount) {
                mp.stats.size -= file.size;
                mp.stats.nfiles -= 1;
                mp.stats.totsize -= file.size;
                mp.stats.ntotfiles -= 1;
            }
            self.uptodate = false;
        }
        self.unhashed.remove(path);
    }

    /// Look up a hashed file by local path
    #[must_use]
    pub fn lookup(&self, path: &Path) -> Option<&ShareFile> {
        self.hashed.get(path)
    }

    /// Look up an unhashed file by local path
    #[must_use]
    pub fn lookup_unhashed(&self, path: &Path) -> Option<&ShareFile> {
        self.unhashed.get(path)
    }

    /// Resolve an inode to its hashed file
    #[must_use]
    pub fn file_by_inode(&self, inode: u64) -> Option<(&Path, &ShareFile)> {
        let path = self.inodes.get(&inode)?;
        self.hashed.get(path).map(|f| (path.as_path(), f))
    }

    /// Translate a local path to the virtual path peers see
    #[must_use]
    pub fn local_to_virtual(&self, path: &Path) -> Option<String> {
        let file = self.hashed.get(path)?;
        let mp = self.mounts.get(&file.mount)?;
        Some(format!(
            "{}\\{}",
            mp.virtual_root,
            file.partial_path.replace('/', "\\")
        ))
    }

    /// Translate a virtual path back to the local filesystem
    #[must_use]
    pub fn virtual_to_local(&self, virtual_path: &str) -> Option<PathBuf> {
        let (root, rest) = virtual_path
            .split_once('\\')
            .unwrap_or((virtual_path, ""));
        let mp = self.mounts.values().find(|mp| mp.virtual_root == root)?;

        let mut path = mp.local_root.clone();
        if !rest.is_empty() {
            path.push(rest.replace('\\', "/"));
        }
        Some(path)
    }

    /// Resolve a TTH to a hashed file through its active inode
    #[must_use]
    pub fn file_by_tth(&self, tth: &Tth, store: &TthStore) -> Option<(&Path, &ShareFile)> {
        store
            .active_inode(tth)
            .and_then(|inode| self.file_by_inode(inode))
    }

    /// Up to `limit` unhashed paths, in tree order
    #[must_use]
    pub fn next_unhashed(&self, limit: usize) -> Vec<PathBuf> {
        self.unhashed.keys().take(limit).cloned().collect()
    }

    /// Number of files awaiting hashing
    #[must_use]
    pub fn unhashed_count(&self) -> usize {
        self.unhashed.len()
    }

    /// Iterate over the hashed tree in path order
    pub fn hashed_files(&self) -> impl Iterator<Item = (&PathBuf, &ShareFile)> {
        self.hashed.iter()
    }

    /// Aggregate counters over all mountpoints
    #[must_use]
    pub fn stats(&self) -> ShareStats {
        let mut total = ShareStats::default();
        for mp in self.mounts.values() {
            total.size += mp.stats.size;
            total.totsize += mp.stats.totsize;
            total.dupsize += mp.stats.dupsize;
            total.nfiles += mp.stats.nfiles;
            total.ntotfiles += mp.stats.ntotfiles;
            total.nduplicates += mp.stats.nduplicates;
        }
        total
    }

    /// Bloom pre-filter for a search term
    #[must_use]
    pub fn may_contain(&self, term: &str) -> bool {
        self.bloom.may_contain(term)
    }

    /// Rebuild the bloom filter at `length` bytes from the hashed tree
    pub fn rebuild_bloom(&mut self, length: usize) {
        debug!(length, "(re)creating bloom filter");
        self.bloom = Bloom::new(length);
        let names: Vec<String> = self
            .hashed
            .values()
            .map(|f| f.basename().to_string())
            .collect();
        for name in names {
            self.bloom.add_filename(&name);
        }
        info!(fill = self.bloom.filled_percent(), "bloom filter rebuilt");
    }

    /// Double the bloom filter when it is over 70% full; called after a
    /// scan finishes.
    pub fn maybe_grow_bloom(&mut self) {
        let fill = self.bloom.filled_percent();
        if fill > 70.0 {
            info!(fill, "bloom filter over-full, doubling");
            self.rebuild_bloom(self.bloom.length() * 2);
        }
    }

    /// Shrink or refresh the filter after a mountpoint removal
    pub fn rebuild_bloom_same_size(&mut self) {
        self.rebuild_bloom(self.bloom.length());
    }

    /// Whether the generated filelist is stale
    #[must_use]
    pub fn uptodate(&self) -> bool {
        self.uptodate
    }

    /// Mark the generated filelist as current
    pub fn set_uptodate(&mut self) {
        self.uptodate = true;
    }
}

impl Default for Share {
    fn default() -> Self {
        Self::new()
    }
}

fn partial_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for comp in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(comp.as_os_str().to_str()?);
    }
    Some(out)
}

/// Walk a mountpoint depth-first, collecting every regular file.
/// Dotfiles are skipped; symlinks are not followed.
///
/// # Errors
///
/// Fails when the root cannot be read. Unreadable subdirectories are
/// skipped with a warning.
pub fn walk_mountpoint(root: &Path) -> std::io::Result<Vec<ScannedFile>> {
    use std::os::unix::fs::MetadataExt;

    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(e),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }

            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                warn!(path = %path.display(), "failed to stat, skipping");
                continue;
            };

            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                #[allow(clippy::cast_sign_loss)]
                out.push(ScannedFile {
                    path,
                    size: meta.len(),
                    inode: meta.ino(),
                    mtime: meta.mtime() as u64,
                });
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const LEAVES: &str = "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVo=";

    fn tth(n: u8) -> Tth {
        Tth::from_digest([n; 24])
    }

    fn setup() -> (TempDir, Share, TthStore, MountId, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("media");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("one.mp3"), vec![1u8; 100]).unwrap();
        fs::write(root.join("sub/two.txt"), vec![2u8; 200]).unwrap();

        let store = TthStore::open(dir.path().join("tth2.db")).unwrap();
        let mut share = Share::new();
        let id = share.add_mountpoint(&root).unwrap();
        (dir, share, store, id, root)
    }

    fn scan(share: &mut Share, store: &mut TthStore, id: MountId, root: &Path) -> ScanSummary {
        share.begin_scan(id);
        let files = walk_mountpoint(root).unwrap();
        share.apply_scan(id, files, store).unwrap()
    }

    #[test]
    fn test_scan_queues_everything_for_hashing() {
        let (_dir, mut share, mut store, id, root) = setup();
        let summary = scan(&mut share, &mut store, id, &root);

        assert_eq!(summary.new_unhashed.len(), 2);
        assert_eq!(summary.kept_hashed, 0);
        assert_eq!(share.unhashed_count(), 2);
        assert_eq!(share.stats().nfiles, 0);
    }

    #[test]
    fn test_hashing_promotes_to_hashed_tree() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);

        let path = root.join("one.mp3");
        let outcome = share
            .on_tth_available(&path, Some((tth(1), LEAVES, 1000)), &mut store)
            .unwrap();
        assert_eq!(outcome, HashOutcomeKind::Hashed(tth(1)));

        // exactly one of the two trees holds the file
        assert!(share.lookup(&path).is_some());
        assert!(share.lookup_unhashed(&path).is_none());

        let stats = share.stats();
        assert_eq!(stats.nfiles, 1);
        assert_eq!(stats.size, 100);

        // the bloom filter learned the basename
        assert!(share.may_contain("one"));

        // TTH resolves back through the active inode
        let (found, file) = share.file_by_tth(&tth(1), &store).unwrap();
        assert_eq!(found, path);
        assert_eq!(file.size, 100);
    }

    #[test]
    fn test_failed_hash_drops_file() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);

        let path = root.join("one.mp3");
        let outcome = share.on_tth_available(&path, None, &mut store).unwrap();
        assert_eq!(outcome, HashOutcomeKind::Failed);
        assert!(share.lookup(&path).is_none());
        assert!(share.lookup_unhashed(&path).is_none());
    }

    #[test]
    fn test_duplicate_content_counted_and_dropped() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);

        let one = root.join("one.mp3");
        let two = root.join("sub/two.txt");
        share
            .on_tth_available(&one, Some((tth(9), LEAVES, 1000)), &mut store)
            .unwrap();
        let outcome = share
            .on_tth_available(&two, Some((tth(9), LEAVES, 1000)), &mut store)
            .unwrap();

        assert_eq!(outcome, HashOutcomeKind::Duplicate(tth(9)));
        let stats = share.stats();
        assert_eq!(stats.nduplicates, 1);
        assert_eq!(stats.dupsize, 200);
        assert_eq!(stats.nfiles, 1);

        // the first claimant keeps the TTH
        let (path, _) = share.file_by_tth(&tth(9), &store).unwrap();
        assert_eq!(path, one);
    }

    #[test]
    fn test_rescan_skips_unchanged_hashed_files() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);

        let one = root.join("one.mp3");
        let meta_mtime = {
            use std::os::unix::fs::MetadataExt;
            #[allow(clippy::cast_sign_loss)]
            let m = fs::metadata(&one).unwrap().mtime() as u64;
            m
        };
        share
            .on_tth_available(&one, Some((tth(1), LEAVES, meta_mtime)), &mut store)
            .unwrap();
        share
            .on_tth_available(&root.join("sub/two.txt"), None, &mut store)
            .unwrap();

        // second scan: one.mp3 is fresh, two.txt needs hashing again
        let summary = scan(&mut share, &mut store, id, &root);
        assert_eq!(summary.kept_hashed, 0); // already in the hashed tree
        assert_eq!(summary.new_unhashed, vec![root.join("sub/two.txt")]);
        assert!(share.lookup(&one).is_some());
    }

    #[test]
    fn test_rescan_drops_vanished_files() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);
        share
            .on_tth_available(&root.join("one.mp3"), Some((tth(1), LEAVES, 1)), &mut store)
            .unwrap();

        fs::remove_file(root.join("one.mp3")).unwrap();
        let summary = scan(&mut share, &mut store, id, &root);
        assert_eq!(summary.removed, 1);
        assert!(share.lookup(&root.join("one.mp3")).is_none());
        assert_eq!(share.stats().nfiles, 0);
    }

    #[test]
    fn test_remove_mountpoint_clears_indices() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);
        share
            .on_tth_available(&root.join("one.mp3"), Some((tth(1), LEAVES, 1)), &mut store)
            .unwrap();

        share.remove_mountpoint(&root).unwrap();
        assert_eq!(share.stats().ntotfiles, 0);
        assert_eq!(share.unhashed_count(), 0);
        assert!(share.file_by_inode(1).is_none());
        assert!(share.mounts().next().is_none());

        // removal is an error only when the mount is unknown
        assert!(share.remove_mountpoint(&root).is_err());
    }

    #[test]
    fn test_path_translation_roundtrip() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);
        let path = root.join("sub/two.txt");
        share
            .on_tth_available(&path, Some((tth(2), LEAVES, 1)), &mut store)
            .unwrap();

        let virtual_path = share.local_to_virtual(&path).unwrap();
        assert_eq!(virtual_path, "media\\sub\\two.txt");
        assert_eq!(share.virtual_to_local(&virtual_path).unwrap(), path);
    }

    #[test]
    fn test_duplicate_mountpoint_rejected() {
        let (_dir, mut share, _store, _id, root) = setup();
        assert!(matches!(
            share.add_mountpoint(&root),
            Err(ShareError::Duplicate(_))
        ));
    }

    #[test]
    fn test_scan_aborts_on_tombstone() {
        let (_dir, mut share, mut store, id, root) = setup();
        share.begin_scan(id);
        let files = walk_mountpoint(&root).unwrap();

        // mount removed while the walk was running
        share.remove_mountpoint(&root).unwrap();
        let summary = share.apply_scan(id, files, &mut store).unwrap();
        assert!(summary.aborted);
        assert_eq!(share.unhashed_count(), 0);
    }

    #[test]
    fn test_next_unhashed_respects_limit() {
        let (_dir, mut share, mut store, id, root) = setup();
        scan(&mut share, &mut store, id, &root);
        assert_eq!(share.next_unhashed(1).len(), 1);
        assert_eq!(share.next_unhashed(10).len(), 2);
    }
}
