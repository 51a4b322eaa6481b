//! Bare-repository mirror and archive gateway.
//!
//! Repositories live at `<root>/<host>/<vendor>/<project>.git` and are
//! provisioned out-of-band by an operator; the mirror only keeps them fresh
//! (`git fetch` + `git update-server-info`) and serves zip archives and raw
//! files out of them.

pub mod commands;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::MetricsRegistry;

pub struct GitMirror {
    root: PathBuf,
    binary: String,
    sync_interval: Duration,
    metrics: MetricsRegistry,
}

impl GitMirror {
    pub fn new(
        root: PathBuf,
        binary: String,
        sync_interval: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            root,
            binary,
            sync_interval,
            metrics,
        }
    }

    // -----------------------------------------------------------------------
    // Supervisor loop
    // -----------------------------------------------------------------------

    /// Refresh every repository on a fixed interval until `shutdown` flips.
    pub async fn run_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(root = %self.root.display(), "git sync worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let synced = self.sync_repositories().await;
            if synced > 0 {
                self.metrics
                    .metrics
                    .repositories_synced
                    .inc_by(synced as u64);
            }

            debug!("waiting before starting a new repository sync");
            tokio::select! {
                _ = tokio::time::sleep(self.sync_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("git sync worker stopped");
    }

    // -----------------------------------------------------------------------
    // SyncRepositories
    // -----------------------------------------------------------------------

    /// Walk `<root>/<host>/<vendor>/<project>` and refresh each repository
    /// sequentially. Per-repo failures are logged and the walk continues.
    /// Returns the number of repositories refreshed.
    #[instrument(skip(self))]
    pub async fn sync_repositories(&self) -> usize {
        let mut synced = 0usize;

        for repo in self.repository_paths().await {
            debug!(path = %repo.display(), "syncing repository");

            if let Err(e) = commands::git_fetch(&self.binary, &repo).await {
                error!(path = %repo.display(), error = %e, "fetch failed");
                continue;
            }
            if let Err(e) = commands::git_update_server_info(&self.binary, &repo).await {
                error!(path = %repo.display(), error = %e, "update-server-info failed");
                continue;
            }

            debug!(path = %repo.display(), "repository synced");
            synced += 1;
        }

        info!(synced, "repository sync pass complete");
        synced
    }

    /// Enumerate `<root>/<host>/<vendor>/<project>` directories, three
    /// levels deep. Unreadable directories are skipped.
    async fn repository_paths(&self) -> Vec<PathBuf> {
        let mut repos = Vec::new();

        let mut hosts = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot read git data root");
                return repos;
            }
        };

        while let Ok(Some(host)) = hosts.next_entry().await {
            let mut vendors = match tokio::fs::read_dir(host.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(vendor)) = vendors.next_entry().await {
                let mut projects = match tokio::fs::read_dir(vendor.path()).await {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                while let Ok(Some(project)) = projects.next_entry().await {
                    let path = project.path();
                    if path.is_dir() {
                        repos.push(path);
                    }
                }
            }
        }

        repos.sort();
        repos
    }

    // -----------------------------------------------------------------------
    // Archive gateway
    // -----------------------------------------------------------------------

    /// Stream a zip archive of `git_ref` from the repository at `path`
    /// (relative, e.g. `github.com/acme/lib.git`) into `w`.
    ///
    /// Spawn and exit errors are returned; a broken copy (client went away)
    /// is only logged, matching the command's own tolerance for a closed
    /// pipe.
    #[instrument(skip(self, w), fields(%path, %git_ref))]
    pub async fn write_archive<W>(&self, w: &mut W, path: &str, git_ref: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        validate_rel_path(path)?;

        let repo = self.root.join(path);
        let mut child = commands::spawn_archive(&self.binary, &repo, git_ref)?;

        let mut stdout = child
            .stdout
            .take()
            .context("failed to capture git archive stdout")?;

        if let Err(e) = tokio::io::copy(&mut stdout, w).await {
            warn!(error = %e, "error streaming archive output");
        }
        let _ = w.flush().await;

        let status = child.wait().await.context("failed to wait on git archive")?;
        if !status.success() {
            bail!("git archive exited with status {status}");
        }

        debug!("archive complete");
        Ok(())
    }

    /// Open a raw file under the data root (smart/dumb HTTP support). The
    /// open failure is returned so the caller can answer 404 before any
    /// bytes are committed.
    #[instrument(skip(self), fields(%path))]
    pub async fn open_file(&self, path: &str) -> Result<tokio::fs::File> {
        validate_rel_path(path)?;

        let full = self.root.join(path);
        tokio::fs::File::open(&full)
            .await
            .with_context(|| format!("failed to open {}", full.display()))
    }
}

/// Reject path traversal, NUL bytes, absolute paths, and empty paths before
/// anything touches the filesystem.
fn validate_rel_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("empty repository path");
    }
    if path.contains('\0') {
        bail!("invalid repository path");
    }
    let p = Path::new(path);
    if p.is_absolute() {
        bail!("absolute repository path rejected: {path}");
    }
    if p.components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        bail!("path traversal rejected: {path}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
