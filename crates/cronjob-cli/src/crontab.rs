//! Per-minute crontab entry for `cronjob run`.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// `* * * * * cd '<dir>' && '<exe>' [--config '<file>'] run`
pub fn crontab_line(dir: &Path, exe: &Path, config: Option<&Path>) -> String {
    let config = config
        .map(|c| format!(" --config {}", shell_quote(c)))
        .unwrap_or_default();
    format!(
        "* * * * * cd {} && {}{config} run",
        shell_quote(dir),
        shell_quote(exe)
    )
}

/// The crontab with `line` appended, or `None` when it is already present.
pub fn merge(existing: &str, line: &str) -> Option<String> {
    if existing.lines().any(|l| l.trim() == line) {
        return None;
    }
    let mut merged = existing.to_string();
    if !merged.is_empty() && !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged.push_str(line);
    merged.push('\n');
    Some(merged)
}

/// Add `line` to the user's crontab. Returns `false` if it was already there.
pub fn install(line: &str) -> anyhow::Result<bool> {
    let listing = Command::new("crontab")
        .arg("-l")
        .output()
        .context("failed to run `crontab -l`")?;
    // `crontab -l` fails when the user has no crontab yet.
    let existing = if listing.status.success() {
        String::from_utf8_lossy(&listing.stdout).into_owned()
    } else {
        String::new()
    };

    let Some(merged) = merge(&existing, line) else {
        return Ok(false);
    };

    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .spawn()
        .context("failed to run `crontab -`")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(merged.as_bytes())
            .context("failed to write crontab")?;
    }
    let status = child.wait()?;
    if !status.success() {
        bail!("`crontab -` exited with {status}");
    }
    Ok(true)
}
