//! Composer metadata mirror.
//!
//! The control loop fetches the upstream metadata graph (`packages.json` ->
//! provider indexes -> package documents), rewrites archive and clone URLs
//! to point at this mirror, and persists the rewritten graph in the store
//! under content-addressed keys. A cleanup pass removes hashed entries whose
//! hash no longer matches the current bookkeeping.

pub mod types;

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::download::DownloadPool;
use crate::error::MirrorError;
use crate::fetcher::RemoteFetcher;
use crate::metrics::MetricsRegistry;
use crate::rewrite::{rewrite_archive_url, rewrite_repository_url};
use crate::store::Store;

use self::types::{strip_hash_suffix, PackageDoc, PackageInfo, PackagesRoot, ProviderList};

pub struct PackagistMirror {
    store: Arc<Store>,
    fetcher: RemoteFetcher,
    config: Arc<Config>,
    metrics: MetricsRegistry,
    /// Serializes `save_package` across the sync consumer and explicit
    /// refreshes; the last write for a package name wins.
    save_lock: Mutex<()>,
    /// Entry-point recomputation guard. Compare-and-swap, so two concurrent
    /// updates cannot both enter.
    entry_points_busy: AtomicBool,
}

impl PackagistMirror {
    pub fn new(
        store: Arc<Store>,
        fetcher: RemoteFetcher,
        config: Arc<Config>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
            metrics,
            save_lock: Mutex::new(()),
            entry_points_busy: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Supervisor loop
    // -----------------------------------------------------------------------

    /// Run sync cycles until `shutdown` flips. Per-phase errors are logged
    /// and the loop continues; cancellation is honoured at cycle boundaries
    /// only.
    pub async fn run_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("packagist sync worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.sync_cycle().await;
            self.metrics.metrics.sync_cycles.inc();

            debug!("waiting before starting a new sync");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.sync.interval)) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("packagist sync worker stopped");
    }

    async fn sync_cycle(self: &Arc<Self>) {
        if let Err(e) = self.sync_packages().await {
            error!(error = %e, "package sync failed");
        }
        if let Err(e) = self.update_entry_points().await {
            error!(error = %e, "entry-point update failed");
        }

        let mirror = Arc::clone(self);
        match tokio::task::spawn_blocking(move || mirror.clean_packages()).await {
            Ok(Ok(deleted)) => debug!(deleted, "cleanup pass complete"),
            Ok(Err(e)) => error!(error = %e, "cleanup failed"),
            Err(e) => error!(error = %e, "cleanup task failed"),
        }
    }

    // -----------------------------------------------------------------------
    // SyncPackages
    // -----------------------------------------------------------------------

    /// One sync pass over the upstream metadata graph.
    ///
    /// A root fetch failure aborts the pass before any store write so the
    /// previous good state survives an upstream outage. Provider or package
    /// failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sync_packages(&self) -> Result<(), MirrorError> {
        let server = &self.config.upstream.server;
        let retries = self.config.sync.retries;

        let root: PackagesRoot = self
            .fetcher
            .fetch_json(&format!("{server}/packages.json"))
            .await?;

        let (result_tx, mut result_rx) = mpsc::channel::<(PackageInfo, PackageDoc)>(1);

        let pool = DownloadPool::spawn(self.config.sync.workers, {
            let fetcher = self.fetcher.clone();
            let server = server.clone();
            move |_id, info: PackageInfo| {
                let fetcher = fetcher.clone();
                let tx = result_tx.clone();
                let url = format!("{server}/p/{}", info.source_key());
                async move {
                    match fetcher.fetch_json_retry::<PackageDoc>(&url, retries).await {
                        Ok(doc) => {
                            let _ = tx.send((info, doc)).await;
                        }
                        Err(e) => {
                            warn!(package = %info.package, error = %e, "giving up on package document");
                        }
                    }
                }
            }
        });

        // Single consumer: saves are serialized so the store sees one writer.
        let consumer = async {
            let mut saved = 0usize;
            while let Some((info, doc)) = result_rx.recv().await {
                match self.save_package(&info, doc).await {
                    Ok(()) => saved += 1,
                    Err(e) => error!(package = %info.package, error = %e, "failed to save package"),
                }
            }
            saved
        };

        let producer = async {
            let mut enqueued = 0usize;
            for (provider, href) in &root.provider_includes {
                let path = provider.replace("%hash%", &href.sha256);
                debug!(provider = %provider, hash = %href.sha256, "loading provider index");

                let list: ProviderList = match self
                    .fetcher
                    .fetch_json_retry(&format!("{server}/{path}"), retries)
                    .await
                {
                    Ok(list) => list,
                    Err(e) => {
                        error!(provider = %provider, error = %e, "skipping provider for this cycle");
                        continue;
                    }
                };

                for (name, sha) in &list.providers {
                    let stored = self.load_package_info(name).ok();
                    if stored
                        .as_ref()
                        .is_some_and(|info| info.hash_source == sha.sha256)
                    {
                        debug!(package = %name, "package up to date");
                        continue;
                    }

                    let mut info = stored
                        .unwrap_or_else(|| PackageInfo::new(name, &self.config.mirror.code));
                    info.hash_source = sha.sha256.clone();

                    debug!(package = %name, "scheduling package download");
                    if pool.submit(info).await.is_err() {
                        error!("download pool is gone; aborting provider walk");
                        break;
                    }
                    enqueued += 1;
                }
            }

            pool.shutdown().await;
            enqueued
        };

        let (saved, enqueued) = tokio::join!(consumer, producer);

        self.metrics
            .metrics
            .packages_downloaded
            .inc_by(enqueued as u64);

        info!(enqueued, saved, "sync pass complete");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // UpdateEntryPoints
    // -----------------------------------------------------------------------

    /// Recompute the rewritten provider indexes and the root `packages.json`.
    ///
    /// Fails fast with [`MirrorError::SyncInProgress`] when another
    /// entry-point update (or an explicit package refresh) holds the guard.
    #[instrument(skip(self))]
    pub async fn update_entry_points(&self) -> Result<(), MirrorError> {
        if self
            .entry_points_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MirrorError::SyncInProgress);
        }

        let result = self.update_entry_points_inner().await;
        self.entry_points_busy.store(false, Ordering::Release);
        result
    }

    async fn update_entry_points_inner(&self) -> Result<(), MirrorError> {
        let server = &self.config.upstream.server;
        let code = &self.config.mirror.code;
        let retries = self.config.sync.retries;

        let mut root: PackagesRoot = self
            .fetcher
            .fetch_json(&format!("{server}/packages.json"))
            .await?;

        // The previously stored root backs providers we fail to re-fetch:
        // keeping their old hash preserves the blob the store already holds.
        let previous: Option<PackagesRoot> = self
            .store
            .get("packages.json")
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok());

        let includes: Vec<(String, String)> = root
            .provider_includes
            .iter()
            .map(|(provider, href)| (provider.clone(), href.sha256.clone()))
            .collect();

        for (provider, upstream_sha) in includes {
            let path = provider.replace("%hash%", &upstream_sha);

            let mut list: ProviderList = match self
                .fetcher
                .fetch_json_retry(&format!("{server}/{path}"), retries)
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    error!(provider = %provider, error = %e, "keeping previous provider index");
                    match previous
                        .as_ref()
                        .and_then(|prev| prev.provider_includes.get(&provider))
                    {
                        Some(prev_href) => {
                            if let Some(href) = root.provider_includes.get_mut(&provider) {
                                href.sha256 = prev_href.sha256.clone();
                            }
                        }
                        None => {
                            root.provider_includes.remove(&provider);
                        }
                    }
                    continue;
                }
            };

            // Point every provider entry at the hash of the locally
            // rewritten document instead of the upstream payload.
            for (name, entry) in list.providers.iter_mut() {
                match self.load_package_info(name) {
                    Ok(info) => entry.sha256 = info.hash_target,
                    Err(e) => {
                        warn!(package = %name, error = %e, "no stored package info; keeping upstream hash");
                    }
                }
            }

            let data = serde_json::to_vec(&list)?;
            let digest = hex::encode(Sha256::digest(&data));
            let stored_path = provider.replace("%hash%", &digest);

            self.store.put(&stored_path, &data)?;
            debug!(provider = %provider, path = %stored_path, "saved provider index");
            self.metrics.metrics.providers_refreshed.inc();

            if let Some(href) = root.provider_includes.get_mut(&provider) {
                href.sha256 = digest;
            }
        }

        root.providers_url = prefix_entry_point(code, &root.providers_url);
        root.notify = prefix_entry_point(code, &root.notify);
        root.notify_batch = prefix_entry_point(code, &root.notify_batch);
        root.search = prefix_entry_point(code, &root.search);

        let data = serde_json::to_vec(&root)?;
        self.store.put("packages.json", &data)?;

        info!("entry points updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // UpdatePackage
    // -----------------------------------------------------------------------

    /// Explicitly refresh one package from upstream and recompute the entry
    /// points. `name` may carry a `$<hash>` suffix, which is stripped.
    #[instrument(skip(self))]
    pub async fn update_package(&self, name: &str) -> Result<(), MirrorError> {
        if self.entry_points_busy.load(Ordering::Acquire) {
            return Err(MirrorError::SyncInProgress);
        }

        let package = strip_hash_suffix(name);
        let info = self.load_package_info(package)?;

        info!(package, "explicit package refresh");

        let url = format!(
            "{}/p/{}",
            self.config.upstream.server,
            info.source_key()
        );
        let doc: PackageDoc = self
            .fetcher
            .fetch_json_retry(&url, self.config.sync.retries)
            .await?;

        self.save_package(&info, doc).await?;
        self.update_entry_points().await
    }

    // -----------------------------------------------------------------------
    // savePackage
    // -----------------------------------------------------------------------

    /// Rewrite a freshly fetched package document, hash it, and persist the
    /// gzipped blob plus the updated bookkeeping record in one transaction.
    pub async fn save_package(
        &self,
        info: &PackageInfo,
        mut doc: PackageDoc,
    ) -> Result<(), MirrorError> {
        let _guard = self.save_lock.lock().await;

        let public = &self.config.mirror.public_url;
        for versions in doc.packages.values_mut() {
            for version in versions.values_mut() {
                if let Some(dist) = version.dist.as_mut() {
                    dist.url = rewrite_archive_url(public, &dist.url);
                }
                if let Some(source) = version.source.as_mut() {
                    source.url = rewrite_repository_url(public, &source.url);
                }
            }
        }

        let data = serde_json::to_vec(&doc)?;

        let mut info = info.clone();
        info.hash_target = hex::encode(Sha256::digest(&data));

        let blob = gzip_best(&data)?;
        let record = serde_json::to_vec(&info)?;

        self.store.write(|bucket| {
            bucket.put(&info.target_key(), &blob)?;
            bucket.put(&info.package, &record)
        })?;

        self.metrics.metrics.packages_saved.inc();
        debug!(package = %info.package, hash = %info.hash_target, "saved package definition");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CleanPackages
    // -----------------------------------------------------------------------

    /// Remove hashed entries whose hash no longer matches the current
    /// bookkeeping, in one batch transaction over a full ordered scan.
    ///
    /// A hashed key with no owning record is an orphan: it is logged and
    /// left alone.
    #[instrument(skip(self))]
    pub fn clean_packages(&self) -> Result<usize, MirrorError> {
        let root: PackagesRoot = serde_json::from_slice(&self.store.get("packages.json")?)?;

        let deleted = self.store.write(|bucket| {
            let mut infos: BTreeMap<String, PackageInfo> = BTreeMap::new();
            let mut hashed: Vec<(String, usize)> = Vec::new();

            bucket.for_each(|key, value| match key.find('$') {
                Some(i) => hashed.push((key.to_string(), i)),
                None => {
                    if let Ok(info) = serde_json::from_slice::<PackageInfo>(value) {
                        if !info.package.is_empty() {
                            infos.insert(key.to_string(), info);
                        }
                    }
                }
            })?;

            let mut stale: Vec<String> = Vec::new();
            for (key, i) in &hashed {
                let (key, i) = (key.as_str(), *i);
                let tail = key[i + 1..].strip_suffix(".json").unwrap_or(&key[i + 1..]);

                if key.starts_with("p/provider") {
                    for (provider, href) in &root.provider_includes {
                        if provider.as_bytes().get(..i + 1) == key.as_bytes().get(..i + 1)
                            && tail != href.sha256
                        {
                            info!(key, target = %href.sha256, "deleting stale provider definition");
                            stale.push(key.to_string());
                        }
                    }
                } else if key.starts_with("p/") && i > 2 {
                    let package = &key[2..i];
                    match infos.get(package) {
                        Some(info) if info.hash_target != tail => {
                            info!(key, target = %info.hash_target, "deleting stale package definition");
                            stale.push(key.to_string());
                        }
                        Some(_) => {}
                        None => error!(key, "orphan reference"),
                    }
                } else {
                    error!(key, "orphan reference");
                }
            }

            for key in &stale {
                bucket.delete(key)?;
            }
            Ok(stale.len())
        })?;

        if deleted > 0 {
            self.metrics
                .metrics
                .stale_keys_deleted
                .inc_by(deleted as u64);
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn load_package_info(&self, package: &str) -> Result<PackageInfo, MirrorError> {
        let raw = self.store.get(package)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Prefix an entry-point URL with `/<code>`, leaving already-prefixed URLs
/// untouched.
fn prefix_entry_point(code: &str, url: &str) -> String {
    let prefix = format!("/{code}");
    if url == prefix || url.starts_with(&format!("{prefix}/")) {
        url.to_string()
    } else {
        format!("{prefix}{url}")
    }
}

/// Gzip `data` at best compression.
fn gzip_best(data: &[u8]) -> Result<Vec<u8>, MirrorError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
