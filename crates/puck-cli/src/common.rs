//! Shared daemon plumbing: working directory, pid files, log levels.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Resolve the working directory: the `-w` override or `~/.puck`
pub fn working_directory(override_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match override_path {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("cannot determine the home directory")?
            .join(".puck"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create working directory {}", dir.display()))?;
    Ok(dir)
}

/// Map the `-d` level names onto a tracing filter
pub fn log_filter(level: &str) -> &'static str {
    match level {
        "none" => "off",
        "warning" => "warn",
        "debug" => "debug",
        // "message" is the historical alias for info
        _ => "info",
    }
}

/// Write `<workdir>/<name>.pid`
pub fn write_pid(workdir: &Path, name: &str) -> anyhow::Result<()> {
    let path = workdir.join(format!("{name}.pid"));
    std::fs::write(&path, format!("{}\n", std::process::id()))
        .with_context(|| format!("cannot write pid file {}", path.display()))?;
    Ok(())
}

/// Remove `<workdir>/<name>.pid`
pub fn remove_pid(workdir: &Path, name: &str) {
    let _ = std::fs::remove_file(workdir.join(format!("{name}.pid")));
}
