//! The hub/transfer engine daemon.
//!
//! Owns the share, the queue and every hub and peer connection. A
//! front-end drives it over the control socket `<workdir>/puckd`; the
//! hasher runs as a separate lower-priority process that this daemon
//! spawns and connects to.

mod common;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use puck_engine::{Config, Engine};
use tracing::{info, warn};

/// The puck hub/transfer engine
#[derive(Parser)]
#[command(name = "puckd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Working directory (stores, sockets, filelists)
    #[arg(short = 'w', long)]
    workdir: Option<PathBuf>,

    /// Log level: none, warning, message, debug
    #[arg(short = 'd', long, default_value = "message")]
    debug: String,

    /// Override the configured peer port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Do not spawn the hasher daemon (it is already running)
    #[arg(long)]
    no_hasher: bool,
}

fn load_config(workdir: &std::path::Path) -> anyhow::Result<Config> {
    let path = workdir.join("puck.toml");
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
}

fn spawn_hasher(workdir: &std::path::Path, debug: &str) -> anyhow::Result<()> {
    // the hasher binary lives next to this one
    let hasher = std::env::current_exe()?
        .parent()
        .context("no executable directory")?
        .join("puck-hashd");

    std::process::Command::new(&hasher)
        .arg("-w")
        .arg(workdir)
        .arg("-d")
        .arg(debug)
        .spawn()
        .with_context(|| format!("cannot spawn {}", hasher.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(common::log_filter(&cli.debug))
        .init();

    let workdir = common::working_directory(cli.workdir)?;
    let mut config = load_config(&workdir)?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    common::write_pid(&workdir, "puckd")?;
    if !cli.no_hasher {
        spawn_hasher(&workdir, &cli.debug)?;
    }

    let engine = Engine::new(workdir.clone(), config)?;
    let events = engine.events();

    // SIGTERM behaves exactly like the shutdown control verb
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
        info!("SIGTERM, shutting down");
        let _ = events.send(puck_engine::Event::ControlLine {
            id: puck_engine::engine::ClientId::internal(),
            line: "shutdown".to_string(),
        });
    });

    let result = engine.run().await;

    common::remove_pid(&workdir, "puckd");
    let _ = std::fs::remove_file(workdir.join("puckd"));
    result.map_err(Into::into)
}
