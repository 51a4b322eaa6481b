use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the mirror.
pub struct Metrics {
    // -- metadata sync --
    pub sync_cycles: Counter,
    pub packages_downloaded: Counter,
    pub packages_saved: Counter,
    pub providers_refreshed: Counter,
    pub stale_keys_deleted: Counter,

    // -- git mirror --
    pub repositories_synced: Counter,

    // -- http --
    pub metadata_requests: Counter,
    pub archive_requests: Counter,
    pub file_requests: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let sync_cycles = Counter::default();
        registry.register(
            "composercache_sync_cycles",
            "Completed metadata sync cycles",
            sync_cycles.clone(),
        );

        let packages_downloaded = Counter::default();
        registry.register(
            "composercache_packages_downloaded",
            "Package documents fetched from upstream",
            packages_downloaded.clone(),
        );

        let packages_saved = Counter::default();
        registry.register(
            "composercache_packages_saved",
            "Rewritten package documents persisted",
            packages_saved.clone(),
        );

        let providers_refreshed = Counter::default();
        registry.register(
            "composercache_providers_refreshed",
            "Provider indexes recomputed and persisted",
            providers_refreshed.clone(),
        );

        let stale_keys_deleted = Counter::default();
        registry.register(
            "composercache_stale_keys_deleted",
            "Hashed store entries removed by the cleaner",
            stale_keys_deleted.clone(),
        );

        let repositories_synced = Counter::default();
        registry.register(
            "composercache_repositories_synced",
            "Bare repository fetch passes completed",
            repositories_synced.clone(),
        );

        let metadata_requests = Counter::default();
        registry.register(
            "composercache_metadata_requests",
            "Metadata blobs served",
            metadata_requests.clone(),
        );

        let archive_requests = Counter::default();
        registry.register(
            "composercache_archive_requests",
            "Zip archives served from bare repositories",
            archive_requests.clone(),
        );

        let file_requests = Counter::default();
        registry.register(
            "composercache_file_requests",
            "Raw repository files served",
            file_requests.clone(),
        );

        Self {
            sync_cycles,
            packages_downloaded,
            packages_saved,
            providers_refreshed,
            stale_keys_deleted,
            repositories_synced,
            metadata_requests,
            archive_requests,
            file_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared across handlers and
/// background workers.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all mirror metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}
