//! Queue state and operations.

use std::collections::BTreeMap;
use std::path::Path;

use puck_hash::Tth;
use puck_share::filelist::FlDir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{QueueOp, QueueStore};

/// Download priority; `Paused` targets are never scheduled
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    /// Never scheduled
    Paused,
    /// Last resort
    Lowest,
    /// Below normal
    Low,
    /// The default
    #[default]
    Normal,
    /// Above normal
    High,
    /// Before everything else
    Highest,
}

impl Priority {
    /// Map a numeric level (0..=5) onto a priority
    #[must_use]
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Paused,
            1 => Self::Lowest,
            2 => Self::Low,
            4 => Self::High,
            5.. => Self::Highest,
            _ => Self::Normal,
        }
    }

    /// The numeric level of this priority
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::Paused => 0,
            Self::Lowest => 1,
            Self::Low => 2,
            Self::Normal => 3,
            Self::High => 4,
            Self::Highest => 5,
        }
    }
}

/// Errors from queue manipulation
#[derive(Debug, Error)]
pub enum QueueError {
    /// Persisting the mutation failed; it was not applied
    #[error("queue store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The mutation would violate a queue invariant
    #[error("queue constraint: {0}")]
    Constraint(String),
}

/// One nick that can provide a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// The providing nick
    pub nick: String,
    /// The file's path on the peer's share
    pub source_filename: String,
}

/// One file the user wants
#[derive(Debug, Clone)]
pub struct Target {
    /// Local path the download lands at
    pub filename: String,
    /// Expected size in bytes
    pub size: u64,
    /// Content hash when known
    pub tth: Option<Tth>,
    /// Scheduling priority
    pub priority: Priority,
    /// The directory request this target belongs to
    pub target_directory: Option<String>,
    /// This target is a peer's filelist
    pub is_filelist: bool,
    /// Resolve pending directory requests once this filelist arrives
    pub auto_matched: bool,
    /// Providers
    pub sources: Vec<Source>,
    /// A connection is currently transferring this target
    pub active: bool,
    /// The user cancelled; remove at the next I/O boundary
    pub remove_requested: bool,
    seq: u64,
}

/// A queued directory download, resolved lazily via the filelist
#[derive(Debug, Clone)]
pub struct QueueDirectory {
    /// Local directory the files land under
    pub target_directory: String,
    /// The providing nick
    pub nick: String,
    /// The directory on the peer's share
    pub source_directory: String,
    /// Files produced by resolution
    pub nfiles: u32,
    /// Files not yet completed
    pub nleft: u32,
    /// Resolution has run
    pub resolved: bool,
}

/// Observable queue changes, emitted after the store is updated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A target gained its first source
    TargetAdded {
        /// Local target path
        filename: String,
        /// First providing nick
        nick: String,
    },
    /// Another source joined an existing target
    SourceAdded {
        /// Local target path
        filename: String,
        /// The new nick
        nick: String,
    },
    /// A source was detached
    SourceRemoved {
        /// Local target path
        filename: String,
        /// The detached nick
        nick: String,
    },
    /// A target is gone
    TargetRemoved {
        /// Local target path
        filename: String,
    },
    /// A directory request was recorded
    DirectoryAdded {
        /// Local target directory
        target_directory: String,
        /// Providing nick
        nick: String,
    },
    /// A directory request is gone
    DirectoryRemoved {
        /// Local target directory
        target_directory: String,
    },
    /// A filelist download was queued
    FilelistAdded {
        /// The nick whose list is wanted
        nick: String,
        /// Resolution should run automatically on arrival
        auto_matched: bool,
    },
    /// A filelist download is gone
    FilelistRemoved {
        /// The nick whose list was queued
        nick: String,
    },
}

/// What to download next for a given nick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextItem {
    /// Fetch the nick's filelist
    Filelist {
        /// The nick
        nick: String,
    },
    /// Resolve this directory request against the fetched filelist
    Directory {
        /// The nick
        nick: String,
        /// Directory on the peer's share
        source_directory: String,
        /// Local target directory
        target_directory: String,
    },
    /// Download a file
    File {
        /// Local target path
        filename: String,
        /// Path on the peer's share
        source_filename: String,
        /// Expected size
        size: u64,
        /// Content hash when known
        tth: Option<Tth>,
    },
}

/// The download queue
pub struct Queue {
    store: QueueStore,
    targets: BTreeMap<String, Target>,
    directories: BTreeMap<String, QueueDirectory>,
    seq: u64,
}

/// The well-known local name of a nick's filelist target
#[must_use]
pub fn filelist_target_name(nick: &str) -> String {
    format!("files.xml.{nick}")
}

fn filelist_nick(filename: &str) -> Option<&str> {
    filename.strip_prefix("files.xml.")
}

impl Queue {
    /// Open the queue backed by the store at `path`, replaying history.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened or read.
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self, QueueError> {
        let mut store = QueueStore::open(path)?;
        let ops = store.load()?;

        let mut queue = Self {
            store,
            targets: BTreeMap::new(),
            directories: BTreeMap::new(),
            seq: 0,
        };

        let mut ignored = Vec::new();
        for op in ops {
            queue.apply(op, &mut ignored);
        }
        info!(
            targets = queue.targets.len(),
            directories = queue.directories.len(),
            "queue rebuilt from store"
        );
        Ok(queue)
    }

    /// Open the conventional store inside a working directory
    ///
    /// # Errors
    ///
    /// Same as [`Queue::open`].
    pub fn open_in(workdir: &Path) -> Result<Self, QueueError> {
        Self::open(workdir.join(crate::store::STORE_FILENAME))
    }

    fn log_and_apply(
        &mut self,
        op: QueueOp,
        events: &mut Vec<QueueEvent>,
    ) -> Result<(), QueueError> {
        self.store.append(&op)?;
        self.apply(op, events);
        Ok(())
    }

    /// Apply one operation to the in-memory state
    fn apply(&mut self, op: QueueOp, events: &mut Vec<QueueEvent>) {
        match op {
            QueueOp::AddTarget {
                filename,
                size,
                tth,
                priority,
                target_directory,
                is_filelist,
                auto_matched,
            } => {
                if self.targets.contains_key(&filename) {
                    return;
                }
                self.seq += 1;
                self.targets.insert(
                    filename.clone(),
                    Target {
                        filename,
                        size,
                        tth: tth.and_then(|t| t.parse().ok()),
                        priority,
                        target_directory,
                        is_filelist,
                        auto_matched,
                        sources: Vec::new(),
                        active: false,
                        remove_requested: false,
                        seq: self.seq,
                    },
                );
            }
            QueueOp::RemoveTarget { filename } => {
                let Some(target) = self.targets.remove(&filename) else {
                    return;
                };

                if target.is_filelist {
                    if let Some(nick) = filelist_nick(&target.filename) {
                        events.push(QueueEvent::FilelistRemoved {
                            nick: nick.to_string(),
                        });
                    }
                } else {
                    events.push(QueueEvent::TargetRemoved {
                        filename: filename.clone(),
                    });
                }

                // Directory accounting: the last member target takes the
                // directory record with it.
                if let Some(dirname) = target.target_directory {
                    if let Some(dir) = self.directories.get_mut(&dirname) {
                        if dir.resolved {
                            dir.nleft = dir.nleft.saturating_sub(1);
                            if dir.nleft == 0 {
                                self.directories.remove(&dirname);
                                events.push(QueueEvent::DirectoryRemoved {
                                    target_directory: dirname,
                                });
                            }
                        }
                    }
                }
            }
            QueueOp::AddSource {
                filename,
                nick,
                source_filename,
            } => {
                let Some(target) = self.targets.get_mut(&filename) else {
                    return;
                };
                if target.sources.iter().any(|s| s.nick == nick) {
                    return;
                }
                let first = target.sources.is_empty();
                target.sources.push(Source {
                    nick: nick.clone(),
                    source_filename,
                });

                if target.is_filelist {
                    events.push(QueueEvent::FilelistAdded {
                        nick,
                        auto_matched: target.auto_matched,
                    });
                } else if first {
                    events.push(QueueEvent::TargetAdded { filename, nick });
                } else {
                    events.push(QueueEvent::SourceAdded { filename, nick });
                }
            }
            QueueOp::RemoveSource { filename, nick } => {
                let Some(target) = self.targets.get_mut(&filename) else {
                    return;
                };
                let before = target.sources.len();
                target.sources.retain(|s| s.nick != nick);
                if target.sources.len() != before {
                    events.push(QueueEvent::SourceRemoved { filename, nick });
                }
            }
            QueueOp::AddDirectory {
                target_directory,
                nick,
                source_directory,
            } => {
                if self.directories.contains_key(&target_directory) {
                    return;
                }
                self.directories.insert(
                    target_directory.clone(),
                    QueueDirectory {
                        target_directory: target_directory.clone(),
                        nick: nick.clone(),
                        source_directory,
                        nfiles: 0,
                        nleft: 0,
                        resolved: false,
                    },
                );
                events.push(QueueEvent::DirectoryAdded {
                    target_directory,
                    nick,
                });
            }
            QueueOp::RemoveDirectory { target_directory } => {
                if self.directories.remove(&target_directory).is_some() {
                    events.push(QueueEvent::DirectoryRemoved { target_directory });
                }
            }
            QueueOp::SetResolved {
                target_directory,
                nfiles,
                nleft,
            } => {
                if let Some(dir) = self.directories.get_mut(&target_directory) {
                    dir.nfiles = nfiles;
                    dir.nleft = nleft;
                    dir.resolved = true;
                }
            }
            QueueOp::SetPriority { filename, priority } => {
                if let Some(target) = self.targets.get_mut(&filename) {
                    target.priority = priority;
                }
            }
            QueueOp::SetSize { filename, size } => {
                if let Some(target) = self.targets.get_mut(&filename) {
                    target.size = size;
                }
            }
        }
    }

    /// Queue one file from one nick. An existing target gains `nick` as
    /// an additional source.
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Constraint`] when the target name
    /// collides with a filelist, or with [`QueueError::Io`] when the
    /// store append fails.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        nick: &str,
        source_filename: &str,
        size: u64,
        target_filename: &str,
        tth: Option<Tth>,
        priority: Option<Priority>,
        target_directory: Option<&str>,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        if let Some(existing) = self.targets.get(target_filename) {
            if existing.is_filelist {
                return Err(QueueError::Constraint(format!(
                    "{target_filename} is a filelist target"
                )));
            }
        }

        let mut events = Vec::new();
        if !self.targets.contains_key(target_filename) {
            self.log_and_apply(
                QueueOp::AddTarget {
                    filename: target_filename.to_string(),
                    size,
                    tth: tth.map(|t| t.to_base32()),
                    priority: priority.unwrap_or_default(),
                    target_directory: target_directory.map(str::to_string),
                    is_filelist: false,
                    auto_matched: false,
                },
                &mut events,
            )?;
        }
        self.log_and_apply(
            QueueOp::AddSource {
                filename: target_filename.to_string(),
                nick: nick.to_string(),
                source_filename: source_filename.to_string(),
            },
            &mut events,
        )?;
        Ok(events)
    }

    /// Queue a nick's filelist. At most one filelist target per nick
    /// exists; repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn add_filelist(
        &mut self,
        nick: &str,
        auto_matched: bool,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let filename = filelist_target_name(nick);
        if self.targets.contains_key(&filename) {
            return Ok(Vec::new());
        }

        debug!(nick, auto_matched, "queueing filelist");
        let mut events = Vec::new();
        self.log_and_apply(
            QueueOp::AddTarget {
                filename: filename.clone(),
                size: 0,
                tth: None,
                priority: Priority::Highest,
                target_directory: None,
                is_filelist: true,
                auto_matched,
            },
            &mut events,
        )?;
        self.log_and_apply(
            QueueOp::AddSource {
                filename,
                nick: nick.to_string(),
                source_filename: String::new(),
            },
            &mut events,
        )?;
        Ok(events)
    }

    /// Record a directory download. When `filelist` is available the
    /// directory is resolved immediately; otherwise the nick's filelist
    /// is queued and resolution waits for it.
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn add_directory(
        &mut self,
        nick: &str,
        source_directory: &str,
        target_directory: &str,
        filelist: Option<&FlDir>,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let target_directory = target_directory.trim_start_matches('/');

        let mut events = Vec::new();
        self.log_and_apply(
            QueueOp::AddDirectory {
                target_directory: target_directory.to_string(),
                nick: nick.to_string(),
                source_directory: source_directory.to_string(),
            },
            &mut events,
        )?;

        match filelist {
            Some(root) => {
                events.extend(self.resolve_directory(target_directory, root)?);
            }
            None => {
                debug!(nick, "filelist not available, queueing it");
                events.extend(self.add_filelist(nick, true)?);
            }
        }
        Ok(events)
    }

    /// Resolve a recorded directory against a parsed filelist: enumerate
    /// the file leaves under its source directory and queue each one.
    /// An unknown source directory drops the request.
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when a store append fails.
    pub fn resolve_directory(
        &mut self,
        target_directory: &str,
        filelist: &FlDir,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let Some(dir) = self.directories.get(target_directory).cloned() else {
            return Ok(Vec::new());
        };
        if dir.resolved {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let Some(subtree) = filelist.find_directory(&dir.source_directory) else {
            info!(
                source = dir.source_directory,
                "source directory not in filelist, dropping request"
            );
            events.extend(self.remove_directory(target_directory)?);
            return Ok(events);
        };

        let prefix = format!("{}\\", dir.source_directory);
        let mut resolved = Vec::new();
        subtree.each_leaf(&mut |path, file| {
            let relative = path.strip_prefix(&prefix).unwrap_or(path);
            let target = format!("{target_directory}/{}", relative.replace('\\', "/"));
            resolved.push((path.to_string(), target, file.size, file.tth));
        });

        let nfiles = u32::try_from(resolved.len()).unwrap_or(u32::MAX);
        debug!(target_directory, nfiles, "resolving directory");

        for (source, target, size, tth) in resolved {
            events.extend(self.add_file(
                &dir.nick,
                &source,
                size,
                &target,
                tth,
                None,
                Some(target_directory),
            )?);
        }

        self.log_and_apply(
            QueueOp::SetResolved {
                target_directory: target_directory.to_string(),
                nfiles,
                nleft: nfiles,
            },
            &mut events,
        )?;
        Ok(events)
    }

    /// Remove one target (and its sources).
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn remove_target(&mut self, filename: &str) -> Result<Vec<QueueEvent>, QueueError> {
        if !self.targets.contains_key(filename) {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        self.log_and_apply(
            QueueOp::RemoveTarget {
                filename: filename.to_string(),
            },
            &mut events,
        )?;

        // Mirror an implied directory removal into the log so replay
        // converges without re-deriving it.
        if let Some(QueueEvent::DirectoryRemoved { target_directory }) = events
            .iter()
            .find(|e| matches!(e, QueueEvent::DirectoryRemoved { .. }))
            .cloned()
        {
            self.store.append(&QueueOp::RemoveDirectory { target_directory })?;
        }
        Ok(events)
    }

    /// Remove a whole directory request together with its targets.
    /// The directory-removed event fires exactly once.
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when a store append fails.
    pub fn remove_directory(
        &mut self,
        target_directory: &str,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let target_directory = target_directory.trim_start_matches('/');

        let members: Vec<String> = self
            .targets
            .values()
            .filter(|t| t.target_directory.as_deref() == Some(target_directory))
            .map(|t| t.filename.clone())
            .collect();

        let mut events = Vec::new();
        for member in members {
            events.extend(self.remove_target(&member)?);
        }

        if self.directories.contains_key(target_directory) {
            self.log_and_apply(
                QueueOp::RemoveDirectory {
                    target_directory: target_directory.to_string(),
                },
                &mut events,
            )?;
        }
        Ok(events)
    }

    /// Drop the filelist target for `nick`
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn remove_filelist(&mut self, nick: &str) -> Result<Vec<QueueEvent>, QueueError> {
        self.remove_target(&filelist_target_name(nick))
    }

    /// Detach `nick` from one target
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn remove_source(
        &mut self,
        filename: &str,
        nick: &str,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let mut events = Vec::new();
        self.log_and_apply(
            QueueOp::RemoveSource {
                filename: filename.to_string(),
                nick: nick.to_string(),
            },
            &mut events,
        )?;
        Ok(events)
    }

    /// Purge every trace of a nick: sources and its filelist target
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when a store append fails.
    pub fn remove_nick(&mut self, nick: &str) -> Result<Vec<QueueEvent>, QueueError> {
        let mut events = self.remove_filelist(nick)?;
        let affected: Vec<String> = self
            .targets
            .values()
            .filter(|t| t.sources.iter().any(|s| s.nick == nick))
            .map(|t| t.filename.clone())
            .collect();
        for filename in affected {
            events.extend(self.remove_source(&filename, nick)?);
        }
        Ok(events)
    }

    /// Change a target's priority
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn set_priority(
        &mut self,
        filename: &str,
        priority: Priority,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let mut events = Vec::new();
        self.log_and_apply(
            QueueOp::SetPriority {
                filename: filename.to_string(),
                priority,
            },
            &mut events,
        )?;
        Ok(events)
    }

    /// Correct a target's size from the remote side's report
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] when the store append fails.
    pub fn set_size(&mut self, filename: &str, size: u64) -> Result<Vec<QueueEvent>, QueueError> {
        let mut events = Vec::new();
        self.log_and_apply(
            QueueOp::SetSize {
                filename: filename.to_string(),
                size,
            },
            &mut events,
        )?;
        Ok(events)
    }

    /// Mark a target as being transferred (or not). Runtime state, not
    /// persisted.
    pub fn set_active(&mut self, filename: &str, active: bool) {
        if let Some(target) = self.targets.get_mut(filename) {
            target.active = active;
        }
    }

    /// Flag a target for removal at the next I/O boundary. Returns true
    /// when a transfer is running and must be aborted first.
    pub fn mark_for_removal(&mut self, filename: &str) -> bool {
        match self.targets.get_mut(filename) {
            Some(target) => {
                target.remove_requested = true;
                target.active
            }
            None => false,
        }
    }

    /// The highest-priority runnable item for `nick`. Filelists first,
    /// then unresolved directory requests, then file targets by
    /// descending priority with insertion order as the tie-breaker.
    #[must_use]
    pub fn next_source_for(&self, nick: &str) -> Option<NextItem> {
        let runnable = |t: &&Target| {
            !t.active
                && !t.remove_requested
                && t.priority != Priority::Paused
                && t.sources.iter().any(|s| s.nick == nick)
        };

        if let Some(fl) = self
            .targets
            .values()
            .filter(runnable)
            .find(|t| t.is_filelist)
        {
            let nick = filelist_nick(&fl.filename).unwrap_or(nick);
            return Some(NextItem::Filelist {
                nick: nick.to_string(),
            });
        }

        if let Some(dir) = self
            .directories
            .values()
            .find(|d| !d.resolved && d.nick == nick)
        {
            return Some(NextItem::Directory {
                nick: dir.nick.clone(),
                source_directory: dir.source_directory.clone(),
                target_directory: dir.target_directory.clone(),
            });
        }

        self.targets
            .values()
            .filter(runnable)
            .filter(|t| !t.is_filelist)
            .max_by_key(|t| (t.priority, std::cmp::Reverse(t.seq)))
            .map(|t| {
                let source = t
                    .sources
                    .iter()
                    .find(|s| s.nick == nick)
                    .expect("runnable target has a source for the nick");
                NextItem::File {
                    filename: t.filename.clone(),
                    source_filename: source.source_filename.clone(),
                    size: t.size,
                    tth: t.tth,
                }
            })
    }

    /// Does the queue hold anything this nick could provide?
    #[must_use]
    pub fn has_source_for(&self, nick: &str) -> bool {
        self.targets
            .values()
            .any(|t| t.sources.iter().any(|s| s.nick == nick))
            || self
                .directories
                .values()
                .any(|d| !d.resolved && d.nick == nick)
    }

    /// Look up one target
    #[must_use]
    pub fn lookup_target(&self, filename: &str) -> Option<&Target> {
        self.targets.get(filename)
    }

    /// Look up one directory request
    #[must_use]
    pub fn lookup_directory(&self, target_directory: &str) -> Option<&QueueDirectory> {
        self.directories.get(target_directory)
    }

    /// Iterate over all targets
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    /// Number of queued targets
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Rewrite the store as the minimal operation sequence for the
    /// current state.
    ///
    /// # Errors
    ///
    /// Fails with [`QueueError::Io`] on any file operation.
    pub fn compact(&mut self) -> Result<(), QueueError> {
        let mut ops = Vec::new();
        for target in self.targets.values() {
            ops.push(QueueOp::AddTarget {
                filename: target.filename.clone(),
                size: target.size,
                tth: target.tth.map(|t| t.to_base32()),
                priority: target.priority,
                target_directory: target.target_directory.clone(),
                is_filelist: target.is_filelist,
                auto_matched: target.auto_matched,
            });
            for source in &target.sources {
                ops.push(QueueOp::AddSource {
                    filename: target.filename.clone(),
                    nick: source.nick.clone(),
                    source_filename: source.source_filename.clone(),
                });
            }
        }
        for dir in self.directories.values() {
            ops.push(QueueOp::AddDirectory {
                target_directory: dir.target_directory.clone(),
                nick: dir.nick.clone(),
                source_directory: dir.source_directory.clone(),
            });
            if dir.resolved {
                ops.push(QueueOp::SetResolved {
                    target_directory: dir.target_directory.clone(),
                    nfiles: dir.nfiles,
                    nleft: dir.nleft,
                });
            }
        }

        self.store.rewrite(&ops)?;
        Ok(())
    }
}
