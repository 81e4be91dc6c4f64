//! # puck-client
//!
//! The front-end side of the engine control protocol. Any UI -- a TUI, a
//! desktop shell, a test harness -- connects to the engine's Unix socket
//! through this crate, sends typed commands and receives typed events.
//! When the engine is not running it can be spawned first.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;

use std::path::{Path, PathBuf};
use std::time::Duration;

use puck_proto::control;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use event::ClientEvent;

/// Errors from the client connection
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connecting, spawning or talking to the engine failed
    #[error("engine connection: {0}")]
    Io(#[from] std::io::Error),

    /// The engine went away
    #[error("engine closed the connection")]
    Disconnected,
}

/// The engine's control socket inside a working directory
#[must_use]
pub fn socket_path(workdir: &Path) -> PathBuf {
    workdir.join("puckd")
}

/// A connection to a running engine
pub struct Client {
    commands: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Client {
    /// Connect to the engine listening under `workdir`.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Io`] when the socket is absent or
    /// refuses the connection.
    pub async fn connect(workdir: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path(workdir)).await?;
        Ok(Self::attach(stream))
    }

    /// Connect, spawning the engine executable first when the socket is
    /// not there yet.
    ///
    /// # Errors
    ///
    /// Fails when spawning fails or the engine never opens its socket.
    pub async fn connect_or_spawn(
        workdir: &Path,
        executable: &Path,
    ) -> Result<Self, ClientError> {
        if let Ok(stream) = UnixStream::connect(socket_path(workdir)).await {
            return Ok(Self::attach(stream));
        }

        debug!(executable = %executable.display(), "spawning engine");
        std::process::Command::new(executable)
            .arg("-w")
            .arg(workdir)
            .spawn()?;

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if let Ok(stream) = UnixStream::connect(socket_path(workdir)).await {
                return Ok(Self::attach(stream));
            }
        }
        Err(ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "engine did not open its control socket",
        )))
    }

    /// Wrap an already-connected stream
    #[must_use]
    pub fn attach(stream: UnixStream) -> Self {
        let (read_half, mut write_half) = stream.into_split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = command_rx.recv().await {
                let framed = format!("{line}\n");
                if write_half.write_all(framed.as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = ClientEvent::parse(&line);
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = event_tx.send(ClientEvent::EngineGone);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "control socket read failed");
                        let _ = event_tx.send(ClientEvent::EngineGone);
                        return;
                    }
                }
            }
        });

        Self {
            commands: command_tx,
            events: event_rx,
        }
    }

    /// The next engine event; `None` once the connection is gone and
    /// drained.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    fn send(&self, verb: &str, args: &[&str]) -> Result<(), ClientError> {
        self.commands
            .send(control::encode(verb, args))
            .map_err(|_| ClientError::Disconnected)
    }

    /// Connect to a hub
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Disconnected`] when the engine is gone;
    /// so do all the other command methods.
    pub fn connect_hub(
        &self,
        addr: &str,
        nick: Option<&str>,
        password: Option<&str>,
        encoding: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(
            "connect-hub",
            &[
                addr,
                nick.unwrap_or(""),
                password.unwrap_or(""),
                encoding.unwrap_or(""),
            ],
        )
    }

    /// Disconnect from a hub
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn disconnect_hub(&self, addr: &str) -> Result<(), ClientError> {
        self.send("disconnect-hub", &[addr])
    }

    /// Send a public chat line
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn send_chat(&self, hub: &str, message: &str) -> Result<(), ClientError> {
        self.send("send-chat", &[hub, message])
    }

    /// Send a private message
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn send_private(&self, hub: &str, nick: &str, message: &str) -> Result<(), ClientError> {
        self.send("send-private", &[hub, nick, message])
    }

    /// Search all connected hubs. `size_restriction`: 0 none, 1
    /// at-least, 2 at-most; `kind` is the wire file-kind code.
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn search(
        &self,
        query: &str,
        size: u64,
        size_restriction: u8,
        kind: u32,
    ) -> Result<(), ClientError> {
        self.send(
            "search",
            &[
                query,
                &size.to_string(),
                &size_restriction.to_string(),
                &kind.to_string(),
            ],
        )
    }

    /// Queue a file download
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn download(
        &self,
        nick: &str,
        source: &str,
        size: u64,
        target: &str,
        tth: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(
            "download",
            &[nick, source, &size.to_string(), target, tth.unwrap_or("")],
        )
    }

    /// Queue a directory download
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn download_directory(
        &self,
        nick: &str,
        source: &str,
        target: &str,
    ) -> Result<(), ClientError> {
        self.send("download-directory", &[nick, source, target])
    }

    /// Queue a nick's filelist
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn download_filelist(&self, nick: &str) -> Result<(), ClientError> {
        self.send("download-filelist", &[nick])
    }

    /// Cancel a queued download
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn cancel_download(&self, target: &str) -> Result<(), ClientError> {
        self.send("cancel-download", &[target])
    }

    /// Change a target's priority (level 0..=5)
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn set_priority(&self, target: &str, level: u8) -> Result<(), ClientError> {
        self.send("set-priority", &[target, &level.to_string()])
    }

    /// Share a directory
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn add_share(&self, path: &str) -> Result<(), ClientError> {
        self.send("add-share", &[path])
    }

    /// Stop sharing a directory
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn remove_share(&self, path: &str) -> Result<(), ClientError> {
        self.send("remove-share", &[path])
    }

    /// Re-walk every mountpoint
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn rescan_share(&self) -> Result<(), ClientError> {
        self.send("rescan-share", &[])
    }

    /// Supply a hub password after a `need-password` event
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn set_password(&self, hub: &str, password: &str) -> Result<(), ClientError> {
        self.send("set-password", &[hub, password])
    }

    /// Change the peer port
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn set_port(&self, port: u16) -> Result<(), ClientError> {
        self.send("set-port", &[&port.to_string()])
    }

    /// Change the default nick
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn set_nick(&self, nick: &str) -> Result<(), ClientError> {
        self.send("set-nick", &[nick])
    }

    /// Ask the engine to exit cleanly
    ///
    /// # Errors
    ///
    /// See [`Client::connect_hub`].
    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send("shutdown", &[])
    }
}
