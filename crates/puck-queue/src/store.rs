//! The queue's append-only operation log.
//!
//! One JSON object per line; replaying the log in order reproduces the
//! queue state. Compaction rewrites the log as the minimal operation
//! sequence for the current state and swaps it in with a rename.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue::Priority;

/// The store's file name inside the working directory
pub const STORE_FILENAME: &str = "queue.db";

/// One logged queue mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum QueueOp {
    /// A target was created
    AddTarget {
        /// Local target path
        filename: String,
        /// Expected size
        size: u64,
        /// Base32 TTH when known
        tth: Option<String>,
        /// Priority at creation
        priority: Priority,
        /// Owning directory request
        target_directory: Option<String>,
        /// This target is a filelist download
        is_filelist: bool,
        /// Resolve directories automatically once fetched
        auto_matched: bool,
    },
    /// A target was removed
    RemoveTarget {
        /// Local target path
        filename: String,
    },
    /// A source was attached to a target
    AddSource {
        /// Local target path
        filename: String,
        /// Providing nick
        nick: String,
        /// Path on the peer's share
        source_filename: String,
    },
    /// A source was detached
    RemoveSource {
        /// Local target path
        filename: String,
        /// Providing nick
        nick: String,
    },
    /// A directory request was recorded
    AddDirectory {
        /// Local target directory
        target_directory: String,
        /// Providing nick
        nick: String,
        /// Directory on the peer's share
        source_directory: String,
    },
    /// A directory request was dropped
    RemoveDirectory {
        /// Local target directory
        target_directory: String,
    },
    /// A directory request finished resolving
    SetResolved {
        /// Local target directory
        target_directory: String,
        /// Number of files the resolution produced
        nfiles: u32,
        /// Files not yet completed
        nleft: u32,
    },
    /// A target's priority changed
    SetPriority {
        /// Local target path
        filename: String,
        /// The new priority
        priority: Priority,
    },
    /// A target's size was corrected by the remote side
    SetSize {
        /// Local target path
        filename: String,
        /// The corrected size
        size: u64,
    },
}

/// The log file wrapper
pub struct QueueStore {
    path: PathBuf,
    file: File,
}

impl QueueStore {
    /// Open (creating if needed) the log at `path`
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Open the conventional store inside a working directory
    ///
    /// # Errors
    ///
    /// Same as [`QueueStore::open`].
    pub fn open_in(workdir: &Path) -> std::io::Result<Self> {
        Self::open(workdir.join(STORE_FILENAME))
    }

    /// Replay every stored operation in order
    ///
    /// # Errors
    ///
    /// Fails on read errors; unparsable lines are skipped with a warning.
    pub fn load(&mut self) -> std::io::Result<Vec<QueueOp>> {
        self.file.seek(SeekFrom::Start(0))?;
        let reader = BufReader::new(&mut self.file);

        let mut ops = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(op) => ops.push(op),
                Err(e) => warn!(line = number + 1, error = %e, "skipping bad queue record"),
            }
        }

        info!(ops = ops.len(), "queue store loaded");
        Ok(ops)
    }

    /// Append one operation
    ///
    /// # Errors
    ///
    /// Fails when the append fails; the in-memory queue must not apply
    /// the mutation in that case.
    pub fn append(&mut self, op: &QueueOp) -> std::io::Result<()> {
        let mut line = serde_json::to_string(op).map_err(std::io::Error::other)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())
    }

    /// Replace the log with `ops` and swap atomically
    ///
    /// # Errors
    ///
    /// Fails on any file operation; the original log survives.
    pub fn rewrite(&mut self, ops: &[QueueOp]) -> std::io::Result<()> {
        let tmp_path = self.path.with_extension("db.new");
        let mut tmp = File::create(&tmp_path)?;
        for op in ops {
            let mut line = serde_json::to_string(op).map_err(std::io::Error::other)?;
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
        }
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        info!(ops = ops.len(), "queue store compacted");
        Ok(())
    }
}
