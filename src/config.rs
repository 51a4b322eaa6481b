use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

// ---------------------------------------------------------------------------
// Upstream repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream Composer repository.
    #[serde(default = "default_upstream_server")]
    pub server: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            server: default_upstream_server(),
        }
    }
}

fn default_upstream_server() -> String {
    "https://packagist.org".to_string()
}

// ---------------------------------------------------------------------------
// Mirror identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// Service code; names the store bucket and prefixes the rewritten
    /// entry-point URLs.
    #[serde(default = "default_code")]
    pub code: String,
    /// Public base URL written into rewritten dist/source URLs
    /// (e.g. `http://mirror.internal:8000`).
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Socket address for the HTTP listener.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            code: default_code(),
            public_url: default_public_url(),
            http_listen: default_http_listen(),
        }
    }
}

fn default_code() -> String {
    "packagist".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:8000".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Data root. The store lives at `<path>/composer/<code>.db`, bare
    /// repositories at `<path>/git/<host>/<vendor>/<project>.git`.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data")
}

impl StorageConfig {
    pub fn composer_dir(&self) -> PathBuf {
        self.path.join("composer")
    }

    pub fn git_dir(&self) -> PathBuf {
        self.path.join("git")
    }
}

// ---------------------------------------------------------------------------
// Git mirror
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Git binary to shell out to.
    #[serde(default = "default_git_binary")]
    pub binary: String,
    /// Seconds between repository sync passes.
    #[serde(default = "default_git_sync_interval")]
    pub sync_interval: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            sync_interval: default_git_sync_interval(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_git_sync_interval() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Metadata sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Seconds between metadata sync cycles.
    #[serde(default = "default_sync_interval")]
    pub interval: u64,
    /// Download pool size.
    #[serde(default = "default_sync_workers")]
    pub workers: usize,
    /// Extra attempts after the first failed provider/package fetch.
    #[serde(default = "default_sync_retries")]
    pub retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_sync_interval(),
            workers: default_sync_workers(),
            retries: default_sync_retries(),
        }
    }
}

fn default_sync_interval() -> u64 {
    10
}

fn default_sync_workers() -> usize {
    5
}

fn default_sync_retries() -> u32 {
    5
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.upstream.server.is_empty(),
        "upstream.server must not be empty"
    );
    anyhow::ensure!(
        !config.mirror.public_url.is_empty(),
        "mirror.public_url must not be empty"
    );
    anyhow::ensure!(
        !config.mirror.code.is_empty(),
        "mirror.code must not be empty"
    );
    anyhow::ensure!(
        config
            .mirror
            .code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        "mirror.code must be alphanumeric (plus '-'/'_')"
    );
    anyhow::ensure!(
        !matches!(config.mirror.code.as_str(), "git" | "p" | "healthz" | "metrics"),
        "mirror.code collides with a reserved route"
    );
    anyhow::ensure!(config.sync.workers >= 1, "sync.workers must be at least 1");
    anyhow::ensure!(config.sync.interval >= 1, "sync.interval must be at least 1");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
