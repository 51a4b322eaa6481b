//! Main axum router and HTTP request handlers for the mirror.
//!
//! Routes:
//! - `GET /packages.json`                          - rewritten repository root
//! - `GET /p/{*rest}`                              - provider indexes and package documents
//! - `GET /git/:host/:vendor/:package/:ref.zip`    - zip archive from a bare repo
//! - `GET /git/{*rest}`                            - raw repository file (smart/dumb HTTP)
//! - `GET /healthz`                                - health check
//! - `GET /metrics`                                - Prometheus metrics
//!
//! The metadata routes are also mounted under `/<code>` so the
//! `/<code>`-prefixed entry-point URLs the mirror emits resolve here.

use std::io::Read as _;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flate2::read::GzDecoder;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument};

use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let metadata = Router::new()
        .route("/packages.json", get(handle_packages_root))
        .route("/p/{*rest}", get(handle_metadata_blob));

    Router::new()
        .merge(metadata.clone())
        // Entry-point URLs are rewritten to carry the service prefix.
        .nest(&format!("/{}", state.config.mirror.code), metadata)
        .route("/git/{*rest}", get(handle_git))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Metadata handlers
// ---------------------------------------------------------------------------

/// `GET /packages.json`
async fn handle_packages_root(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let data = state.packagist.store().get("packages.json")?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        data,
    )
        .into_response())
}

/// `GET /p/{*rest}`
///
/// Serves both provider indexes (`/p/providers-2020$<hash>.json`) and
/// package documents (`/p/<vendor>/<package>$<hash>.json`). Package blobs
/// are stored gzipped and gunzipped here, so clients always receive plain
/// JSON.
#[instrument(skip(state), fields(%rest))]
async fn handle_metadata_blob(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
) -> Result<Response, AppError> {
    let key = format!("p/{rest}");
    debug!(%key, "serving metadata blob");

    let data = state.packagist.store().get(&key)?;
    let body = decode_stored(data)?;
    state.metrics.metrics.metadata_requests.inc();

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

/// Gunzip a stored payload when it carries the gzip magic; plain payloads
/// pass through untouched.
fn decode_stored(data: Vec<u8>) -> Result<Vec<u8>, AppError> {
    if !data.starts_with(&[0x1f, 0x8b]) {
        return Ok(data);
    }
    let mut out = Vec::new();
    GzDecoder::new(data.as_slice())
        .read_to_end(&mut out)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt stored payload: {e}")))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Git gateway handlers
// ---------------------------------------------------------------------------

/// `GET /git/{*rest}`
///
/// `<host>/<vendor>/<package>/<ref>.zip` streams a zip archive out of the
/// matching bare repository; any other path is served as a raw file from
/// the git data directory (404 when absent).
#[instrument(skip(state), fields(%rest))]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
) -> Result<Response, AppError> {
    if let Some((repo, git_ref)) = parse_archive_path(&rest) {
        debug!(%repo, %git_ref, "serving zip archive");
        state.metrics.metrics.archive_requests.inc();

        let git = Arc::clone(&state.git);
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            if let Err(e) = git.write_archive(&mut tx, &repo, &git_ref).await {
                error!(error = %e, "archive generation failed");
            }
            let _ = tx.shutdown().await;
        });

        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/zip")],
            Body::from_stream(ReaderStream::new(rx)),
        )
            .into_response());
    }

    debug!("serving raw repository file");
    let file = state
        .git
        .open_file(&rest)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    state.metrics.metrics.file_requests.inc();

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Split `<host>/<vendor>/<package>/<ref>.zip` into the repository path and
/// the archive ref. Anything else is not an archive request.
fn parse_archive_path(rest: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() != 4 {
        return None;
    }
    let git_ref = segments[3].strip_suffix(".zip")?;
    if git_ref.is_empty() || segments[..3].iter().any(|s| s.is_empty()) {
        return None;
    }
    Some((
        format!("{}/{}/{}.git", segments[0], segments[1], segments[2]),
        git_ref.to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The requested file does not exist.
    NotFound(String),
    /// An unexpected internal error (store faults included).
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => {
                debug!(%msg, "not found");
                (StatusCode::NOT_FOUND, "not found").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<crate::error::MirrorError> for AppError {
    fn from(err: crate::error::MirrorError) -> Self {
        AppError::Internal(anyhow::Error::new(err))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;
    use std::time::Duration;

    use axum::http::Request;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::fetcher::RemoteFetcher;
    use crate::git::GitMirror;
    use crate::metrics::MetricsRegistry;
    use crate::packagist::PackagistMirror;
    use crate::store::Store;

    fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::default());
        let metrics = MetricsRegistry::new();

        let store = Arc::new(Store::open(&tmp.path().join("composer"), "packagist").unwrap());
        let packagist = Arc::new(PackagistMirror::new(
            store,
            RemoteFetcher::new(reqwest::Client::new()),
            Arc::clone(&config),
            metrics.clone(),
        ));
        let git = Arc::new(GitMirror::new(
            tmp.path().join("git"),
            "git".to_string(),
            Duration::from_secs(60),
            metrics.clone(),
        ));

        let state = Arc::new(AppState {
            config,
            packagist,
            git,
            metrics,
        });
        (tmp, state)
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let resp = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn packages_root_is_served() {
        let (_tmp, state) = test_state();
        state
            .packagist
            .store()
            .put("packages.json", br#"{"providers-url":"/packagist/p/x"}"#)
            .unwrap();
        let router = create_router(Arc::clone(&state));

        let (status, body) = get(&router, "/packages.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"providers-url":"/packagist/p/x"}"#);

        // Also reachable under the service prefix.
        let (status, _) = get(&router, "/packagist/packages.json").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_root_is_a_server_error() {
        let (_tmp, state) = test_state();
        let router = create_router(state);
        let (status, _) = get(&router, "/packages.json").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn gzipped_blob_is_served_as_plain_json() {
        let (_tmp, state) = test_state();

        let payload = br#"{"packages":{}}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(payload).unwrap();
        let blob = encoder.finish().unwrap();

        state
            .packagist
            .store()
            .put("p/vendor/pkg$abcd.json", &blob)
            .unwrap();
        let router = create_router(state);

        let (status, body) = get(&router, "/p/vendor/pkg$abcd.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn plain_provider_blob_passes_through() {
        let (_tmp, state) = test_state();
        state
            .packagist
            .store()
            .put("p/providers-2020$aaaa.json", br#"{"providers":{}}"#)
            .unwrap();
        let router = create_router(state);

        let (status, body) = get(&router, "/p/providers-2020$aaaa.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"providers":{}}"#);
    }

    #[tokio::test]
    async fn missing_git_file_is_not_found() {
        let (_tmp, state) = test_state();
        let router = create_router(state);
        let (status, _) = get(&router, "/git/github.com/acme/lib.git/info/refs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn git_file_is_served() {
        let (tmp, state) = test_state();
        let dir = tmp.path().join("git/github.com/acme/lib.git/info");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("refs"), b"abc refs/heads/main\n").unwrap();
        let router = create_router(state);

        let (status, body) = get(&router, "/git/github.com/acme/lib.git/info/refs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"abc refs/heads/main\n");
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (_tmp, state) = test_state();
        let router = create_router(state);
        let (status, _) = get(&router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn archive_paths_are_recognised() {
        assert_eq!(
            parse_archive_path("github.com/acme/lib/deadbeef.zip"),
            Some(("github.com/acme/lib.git".to_string(), "deadbeef".to_string()))
        );
        // Raw files are not archive requests.
        assert_eq!(parse_archive_path("github.com/acme/lib.git/info/refs"), None);
        assert_eq!(parse_archive_path("github.com/acme/lib.git"), None);
        assert_eq!(parse_archive_path("github.com/acme/lib/.zip"), None);
    }

    #[test]
    fn decode_stored_passthrough_and_gunzip() {
        assert_eq!(decode_stored(b"plain".to_vec()).unwrap(), b"plain");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(b"compressed").unwrap();
        let blob = encoder.finish().unwrap();
        assert_eq!(decode_stored(blob).unwrap(), b"compressed");
    }
}
