//! The hasher daemon.
//!
//! Computes Tiger Tree Hashes of local files on behalf of the engine,
//! as a separate process at a lower OS priority so bulk hashing never
//! starves the serving side. The two talk the control-line dialect over
//! `<workdir>/puck-hashd`: inbound `add`, `abort`, `set-delay` and
//! `shutdown`; outbound `add-hash` and `fail-hash`.
//!
//! The hashing itself is cooperative: one bounded read per loop
//! iteration, with an optional sleep between chunks to cap CPU use.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use puck_proto::control;
use puck_share::hasher::{HashOutcome, Hasher, TickResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// The puck hasher daemon
#[derive(Parser)]
#[command(name = "puck-hashd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Working directory (socket and pid file)
    #[arg(short = 'w', long)]
    workdir: Option<PathBuf>,

    /// Log level: none, warning, message, debug
    #[arg(short = 'd', long, default_value = "message")]
    debug: String,
}

fn lower_priority() {
    // hashing is a background chore; let the engine win the CPU
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 10) };
    if rc != 0 {
        warn!("setpriority failed (ignored)");
    }
}

fn outcome_line(outcome: &HashOutcome) -> String {
    match outcome {
        HashOutcome::Done {
            path,
            tth,
            leaves_base64,
            mib_per_sec,
        } => control::encode(
            "add-hash",
            &[
                &path.to_string_lossy(),
                tth,
                leaves_base64,
                &format!("{mib_per_sec:.1}"),
            ],
        ),
        HashOutcome::Failed { path } => {
            control::encode("fail-hash", &[&path.to_string_lossy()])
        }
    }
}

/// Serve one engine connection until it goes away or asks us to stop.
/// Returns true when a shutdown was requested.
async fn serve(stream: UnixStream, delay: &mut Duration) -> anyhow::Result<bool> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut hasher = Hasher::new();

    loop {
        if hasher.is_idle() {
            // nothing to do: block on the next command
            let Some(line) = lines.next_line().await? else {
                return Ok(false);
            };
            if handle_command(&line, &mut hasher, delay) {
                return Ok(true);
            }
            continue;
        }

        // work pending: poll for commands without blocking, then hash
        // one chunk
        tokio::select! {
            biased;
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(false);
                };
                if handle_command(&line, &mut hasher, delay) {
                    return Ok(true);
                }
            }
            () = std::future::ready(()) => {
                match hasher.tick() {
                    TickResult::Finished(outcome) => {
                        let framed = format!("{}\n", outcome_line(&outcome));
                        write_half.write_all(framed.as_bytes()).await?;
                    }
                    TickResult::Progress => {
                        if !delay.is_zero() {
                            tokio::time::sleep(*delay).await;
                        }
                    }
                    TickResult::Idle => {}
                }
            }
        }
    }
}

/// Returns true when the engine asked for a shutdown
fn handle_command(line: &str, hasher: &mut Hasher, delay: &mut Duration) -> bool {
    let (verb, args) = control::decode(line);
    match verb.as_str() {
        "add" if !args.is_empty() => {
            hasher.add(PathBuf::from(&args[0]));
        }
        "abort" => {
            debug!("aborting all hash jobs");
            hasher.abort();
        }
        "set-delay" => {
            let micros = args
                .first()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100_000);
            *delay = Duration::from_micros(micros);
            debug!(?delay, "hash delay updated");
        }
        "shutdown" => return true,
        other => debug!(verb = other, "unknown hasher command"),
    }
    false
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(common::log_filter(&cli.debug))
        .init();

    let workdir = common::working_directory(cli.workdir)?;
    lower_priority();
    common::write_pid(&workdir, "puck-hashd")?;

    let socket = workdir.join("puck-hashd");
    let _ = std::fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket)?;
    info!(socket = %socket.display(), "hasher ready");

    let mut delay = Duration::from_micros(100_000);
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = sigterm.recv() => break,
        };

        debug!("engine connected");
        let done = tokio::select! {
            served = serve(stream, &mut delay) => match served {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "engine connection failed");
                    false
                }
            },
            _ = sigterm.recv() => true,
        };

        // the engine is our only client; losing it means we go too
        if done {
            break;
        }
        info!("engine connection closed, exiting");
        break;
    }

    common::remove_pid(&workdir, "puck-hashd");
    let _ = std::fs::remove_file(&socket);
    Ok(())
}
