//! The cooperative hashing core.
//!
//! One [`Hasher`] owns a queue of paths and at most one open file. Each
//! call to [`Hasher::tick`] reads a bounded chunk, feeds the tree hasher
//! and returns. The hasher daemon interleaves ticks with its event loop
//! and an optional delay, so a slow disk or a huge share never starves
//! socket handling and CPU use stays capped.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use puck_hash::TreeHasher;
use tracing::{debug, warn};

/// Default read chunk per tick
pub const DEFAULT_CHUNK: usize = 4 * 1024 * 1024;

/// A finished or failed hash job
#[derive(Debug, Clone, PartialEq)]
pub enum HashOutcome {
    /// The file hashed cleanly
    Done {
        /// The hashed path
        path: PathBuf,
        /// Base32 TTH root
        tth: String,
        /// Base64 leaf data
        leaves_base64: String,
        /// Observed hashing speed
        mib_per_sec: f64,
    },
    /// The file could not be opened or read
    Failed {
        /// The failing path
        path: PathBuf,
    },
}

struct Job {
    path: PathBuf,
    file: File,
    tree: TreeHasher,
    started: Instant,
}

/// What a tick accomplished
#[derive(Debug, PartialEq)]
pub enum TickResult {
    /// Nothing queued
    Idle,
    /// A chunk was read; call again
    Progress,
    /// A job finished, successfully or not
    Finished(HashOutcome),
}

/// The chunk-at-a-time hasher
pub struct Hasher {
    queue: VecDeque<PathBuf>,
    current: Option<Job>,
    chunk: Vec<u8>,
}

impl Hasher {
    /// A hasher with the default chunk size
    #[must_use]
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK)
    }

    /// A hasher reading `chunk_size` bytes per tick
    #[must_use]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            chunk: vec![0u8; chunk_size],
        }
    }

    /// Queue a path unless it is already queued or being hashed
    pub fn add(&mut self, path: PathBuf) {
        let busy = self
            .current
            .as_ref()
            .is_some_and(|job| job.path == path);
        if busy || self.queue.contains(&path) {
            return;
        }
        debug!(path = %path.display(), "queueing for hashing");
        self.queue.push_back(path);
    }

    /// Drop the running job and everything queued
    pub fn abort(&mut self) {
        self.current = None;
        self.queue.clear();
    }

    /// True when there is nothing to do
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Paths waiting behind the current job
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Run one scheduling step: open the next file if none is open, or
    /// read and hash one chunk of the current file.
    pub fn tick(&mut self) -> TickResult {
        if self.current.is_none() {
            let Some(path) = self.queue.pop_front() else {
                return TickResult::Idle;
            };
            match Self::open_job(&path) {
                Ok(job) => {
                    debug!(path = %path.display(), "starting hash");
                    self.current = Some(job);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open for hashing");
                    return TickResult::Finished(HashOutcome::Failed { path });
                }
            }
        }

        let job = self.current.as_mut().expect("job ensured above");
        match job.file.read(&mut self.chunk) {
            Ok(0) => {
                let job = self.current.take().expect("current job at EOF");
                let elapsed = job.started.elapsed().as_secs_f64().max(1e-6);
                let bytes = job.tree.bytes_hashed();
                #[allow(clippy::cast_precision_loss)]
                let mib_per_sec = (bytes as f64 / (1024.0 * 1024.0)) / elapsed;

                let digest = job.tree.finalize();
                debug!(path = %job.path.display(), mib_per_sec, "finished hashing");
                TickResult::Finished(HashOutcome::Done {
                    path: job.path,
                    tth: digest.root.to_base32(),
                    leaves_base64: BASE64.encode(digest.leaf_bytes()),
                    mib_per_sec,
                })
            }
            Ok(n) => {
                job.tree.update(&self.chunk[..n]);
                TickResult::Progress
            }
            Err(e) => {
                let job = self.current.take().expect("current job on error");
                warn!(path = %job.path.display(), error = %e, "read failed while hashing");
                TickResult::Finished(HashOutcome::Failed { path: job.path })
            }
        }
    }

    fn open_job(path: &Path) -> std::io::Result<Job> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Job {
            path: path.to_path_buf(),
            file,
            tree: TreeHasher::for_file_size(size),
            started: Instant::now(),
        })
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn drive(hasher: &mut Hasher) -> Vec<HashOutcome> {
        let mut out = Vec::new();
        loop {
            match hasher.tick() {
                TickResult::Idle => break,
                TickResult::Progress => {}
                TickResult::Finished(outcome) => out.push(outcome),
            }
        }
        out
    }

    #[test]
    fn test_hash_known_vector() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector.bin");
        std::fs::write(
            &path,
            b"[ABCDEFGHIJKLMNOPQRSTYVWXYZabcdefghijklmnopqrstuvqzyx1234567890]\n",
        )
        .unwrap();

        let mut hasher = Hasher::with_chunk_size(16);
        hasher.add(path.clone());
        let outcomes = drive(&mut hasher);

        assert_eq!(outcomes.len(), 1);
        let HashOutcome::Done { tth, leaves_base64, .. } = &outcomes[0] else {
            panic!("hash failed");
        };
        assert_eq!(tth, "UUP2CKMGSUCSKXBQKSK7U76YVYFPUDXFNCYEOFI");
        assert!(!leaves_base64.is_empty());
    }

    #[test]
    fn test_missing_file_fails_cleanly() {
        let mut hasher = Hasher::new();
        hasher.add(PathBuf::from("/no/such/file"));
        let outcomes = drive(&mut hasher);
        assert_eq!(
            outcomes,
            vec![HashOutcome::Failed {
                path: PathBuf::from("/no/such/file"),
            }]
        );
        assert!(hasher.is_idle());
    }

    #[test]
    fn test_queue_dedup_and_abort() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, b"data").unwrap();

        let mut hasher = Hasher::new();
        hasher.add(path.clone());
        hasher.add(path.clone());
        assert_eq!(hasher.backlog(), 1);

        hasher.abort();
        assert!(hasher.is_idle());
        assert_eq!(hasher.tick(), TickResult::Idle);
    }

    #[test]
    fn test_multiple_files_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, vec![1u8; 5000]).unwrap();
        std::fs::write(&b, vec![2u8; 100]).unwrap();

        let mut hasher = Hasher::with_chunk_size(1024);
        hasher.add(a.clone());
        hasher.add(b.clone());

        let outcomes = drive(&mut hasher);
        let paths: Vec<&PathBuf> = outcomes
            .iter()
            .map(|o| match o {
                HashOutcome::Done { path, .. } | HashOutcome::Failed { path } => path,
            })
            .collect();
        assert_eq!(paths, vec![&a, &b]);
    }
}
