//! Background scheduler process and its marker file.
//!
//! The marker file holds the child's pid. Deleting it is the stop signal; the
//! child notices at its next minute-boundary wake.

use std::io;
use std::path::Path;

use anyhow::Context;

/// Read the pid recorded in `path`, if any.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn write_pid_file(path: &Path, pid: u32) -> anyhow::Result<()> {
    std::fs::write(path, pid.to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

/// Delete the marker. Returns `false` when there was none.
pub fn remove_pid_file(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Re-launch this executable as `start --blocking` detached from the terminal.
///
/// Returns the child's pid once it is recorded in `pid_file`.
#[cfg(unix)]
pub fn spawn_background(
    pid_file: &Path,
    config: Option<&Path>,
    verbose: u8,
) -> anyhow::Result<u32> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe().context("cannot locate the cronjob executable")?;

    // The child checks for the marker at its first wake, which may come
    // before the parent learns its pid.
    std::fs::write(pid_file, "")
        .with_context(|| format!("failed to create pid file {}", pid_file.display()))?;

    let mut command = Command::new(exe);
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }
    for _ in 0..verbose {
        command.arg("-v");
    }
    command
        .args(["start", "--blocking", "--pid-file"])
        .arg(pid_file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = remove_pid_file(pid_file);
            return Err(e).context("failed to start background scheduler");
        }
    };

    let pid = child.id();
    if let Err(e) = write_pid_file(pid_file, pid) {
        let _ = child.kill();
        let _ = remove_pid_file(pid_file);
        return Err(e);
    }
    Ok(pid)
}

#[cfg(not(unix))]
pub fn spawn_background(
    _pid_file: &Path,
    _config: Option<&Path>,
    _verbose: u8,
) -> anyhow::Result<u32> {
    anyhow::bail!("background mode needs a Unix process model; use `cronjob start --blocking`")
}
