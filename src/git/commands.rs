//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function shells out to the configured `git` binary. Fetch and
//! update-server-info collect their output and fail with the trimmed stderr
//! on a non-zero exit; the archive command is spawned with a piped stdout so
//! the caller can stream the zip as it is produced.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

/// Run `git fetch` inside an existing bare repo.
#[instrument(skip(binary), fields(repo = %repo_path.display()))]
pub async fn git_fetch(binary: &str, repo_path: &Path) -> Result<()> {
    let output = Command::new(binary)
        .arg("-C")
        .arg(repo_path)
        .arg("fetch")
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git fetch")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git fetch failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git fetch complete");
    Ok(())
}

/// Run `git update-server-info` inside a bare repo so dumb-HTTP clients see
/// fresh `info/refs` and pack indexes.
#[instrument(skip(binary), fields(repo = %repo_path.display()))]
pub async fn git_update_server_info(binary: &str, repo_path: &Path) -> Result<()> {
    let output = Command::new(binary)
        .arg("-C")
        .arg(repo_path)
        .arg("update-server-info")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git update-server-info")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git update-server-info failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git update-server-info complete");
    Ok(())
}

/// Spawn `git archive --format=zip <ref>` inside a bare repo with stdout
/// piped; the caller streams stdout and reaps the child.
#[instrument(skip(binary), fields(repo = %repo_path.display(), %git_ref))]
pub fn spawn_archive(binary: &str, repo_path: &Path, git_ref: &str) -> Result<Child> {
    let child = Command::new(binary)
        .arg("-C")
        .arg(repo_path)
        .arg("archive")
        .arg("--format=zip")
        .arg(git_ref)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn git archive")?;

    debug!("git archive spawned");
    Ok(child)
}
