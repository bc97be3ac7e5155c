use std::{path::Path, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use url::Url;

use crate::{
    adapter::{MediaFetcher, MediaKind},
    config::{Config, non_empty},
    error::ApiError,
    store::FileStore,
};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: FileStore,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub download_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: FileStore, fetcher: Arc<dyn MediaFetcher>) -> Self {
        let download_slots = Arc::new(Semaphore::new(config.max_concurrent_downloads));
        Self {
            config,
            store,
            fetcher,
            download_slots,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(fetch_info))
        .route("/api/download", post(start_download))
        .route("/downloads/{name}", get(serve_download))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    title: String,
    thumbnail: Option<String>,
    qualities: Vec<QualityOption>,
}

#[derive(Debug, Serialize)]
struct QualityOption {
    #[serde(rename = "type")]
    kind: MediaKind,
    label: &'static str,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    status: &'static str,
    download_url: String,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn fetch_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<InfoRequest>,
) -> Result<Json<InfoResponse>, ApiError> {
    authorize(&state.config, &headers, payload.api_key.as_deref())?;

    let url = require_url(&payload.url)?;
    let info = state.fetcher.probe(&url, state.config.info_timeout).await?;

    Ok(Json(InfoResponse {
        title: info.title,
        thumbnail: info.thumbnail,
        qualities: vec![
            QualityOption {
                kind: MediaKind::Mp4,
                label: MediaKind::Mp4.label(),
            },
            QualityOption {
                kind: MediaKind::Mp3,
                label: MediaKind::Mp3.label(),
            },
        ],
    }))
}

async fn start_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    authorize(&state.config, &headers, payload.api_key.as_deref())?;

    let url = require_url(&payload.url)?;
    let kind = match payload.kind.as_deref() {
        Some("mp4") => MediaKind::Mp4,
        Some("mp3") => MediaKind::Mp3,
        _ => return Err(ApiError::bad_request("Invalid type")),
    };

    let _slot = state
        .download_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    let fetcher = Arc::clone(&state.fetcher);
    let fetch_url = url.clone();
    let limit = state.config.download_timeout;
    let artifact = state
        .store
        .put(move |dir| async move { fetcher.fetch(&fetch_url, kind, &dir, limit).await })
        .await?;

    Ok(Json(DownloadResponse {
        status: "success",
        download_url: format!("/downloads/{}", urlencoding::encode(&artifact.name)),
    }))
}

async fn serve_download(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Response, ApiError> {
    let (file, artifact) = state.store.open(&name).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&artifact.name)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&artifact.size_bytes.to_string())
            .map_err(|_| ApiError::internal("Could not build content length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&artifact.name))
            .map_err(|_| ApiError::internal("Could not build download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Shared-secret check. The key may arrive as an `X-API-Key` header or an
/// `api_key` body field; either is accepted, and the check runs before any
/// external process is spawned.
fn authorize(config: &Config, headers: &HeaderMap, body_key: Option<&str>) -> Result<(), ApiError> {
    let header_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    let matches = |candidate: Option<&str>| {
        candidate
            .and_then(non_empty)
            .is_some_and(|key| key == config.api_key)
    };

    if matches(header_key) || matches(body_key) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

fn require_url(raw: &str) -> Result<String, ApiError> {
    let url = non_empty(raw).ok_or_else(|| ApiError::bad_request("Missing URL"))?;
    Ok(clean_media_url(url))
}

/// Canonicalizes share-style YouTube URLs to plain watch URLs. Anything else
/// passes through untouched for yt-dlp to judge.
fn clean_media_url(input: &str) -> String {
    let Ok(parsed) = Url::parse(input) else {
        return input.to_string();
    };
    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return input.to_string();
    };

    if host == "youtu.be" || host.ends_with(".youtu.be") {
        let id = parsed.path().trim_start_matches('/');
        if !id.is_empty() {
            return format!("https://www.youtube.com/watch?v={id}");
        }
    }

    if host == "youtube.com" || host.ends_with(".youtube.com") {
        if let Some((_, id)) = parsed.query_pairs().find(|(key, _)| key == "v") {
            return format!("https://www.youtube.com/watch?v={id}");
        }
    }

    input.to_string()
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::adapter::MediaInfo;

    const TEST_KEY: &str = "test-secret";

    enum StubBehavior {
        WriteFile { name: &'static str, content: &'static [u8] },
        Fail(&'static str),
        TimeOut,
    }

    struct StubFetcher {
        behavior: StubBehavior,
        probe_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
    }

    impl StubFetcher {
        fn writing(name: &'static str, content: &'static [u8]) -> Self {
            Self {
                behavior: StubBehavior::WriteFile { name, content },
                probe_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                behavior: StubBehavior::Fail(message),
                probe_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn timing_out() -> Self {
            Self {
                behavior: StubBehavior::TimeOut,
                probe_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for StubFetcher {
        async fn probe(&self, _url: &str, _limit: Duration) -> Result<MediaInfo, ApiError> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StubBehavior::WriteFile { .. } => Ok(MediaInfo {
                    title: "Stub Video".to_string(),
                    thumbnail: Some("https://img.test/thumb.jpg".to_string()),
                }),
                StubBehavior::Fail(message) => Err(ApiError::upstream(*message)),
                StubBehavior::TimeOut => Err(ApiError::upstream_timeout()),
            }
        }

        async fn fetch(
            &self,
            _url: &str,
            _kind: MediaKind,
            dest_dir: &Path,
            _limit: Duration,
        ) -> Result<(), ApiError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StubBehavior::WriteFile { name, content } => {
                    tokio::fs::write(dest_dir.join(name), content)
                        .await
                        .map_err(|error| ApiError::store_write_failed(error.to_string()))
                }
                StubBehavior::Fail(message) => Err(ApiError::upstream(*message)),
                StubBehavior::TimeOut => Err(ApiError::upstream_timeout()),
            }
        }
    }

    async fn test_state(fetcher: Arc<StubFetcher>) -> AppState {
        let root = std::env::temp_dir().join(format!("vidvault-routes-{}", Uuid::new_v4()));
        let store = FileStore::new(root).await.unwrap();
        let config = Arc::new(Config {
            api_key: TEST_KEY.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            downloads_dir: store.root().to_path_buf(),
            ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            info_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(5),
            max_concurrent_downloads: 2,
        });
        AppState::new(config, store, fetcher)
    }

    fn post_json(uri: &str, body: serde_json::Value, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_credential() {
        let state = test_state(Arc::new(StubFetcher::writing("x.mp4", b"x"))).await;
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn info_rejects_missing_credential_before_probing() {
        let fetcher = Arc::new(StubFetcher::writing("x.mp4", b"x"));
        let state = test_state(Arc::clone(&fetcher)).await;
        let router = build_router(state);

        let request = post_json(
            "/api/info",
            serde_json::json!({"url": "https://youtu.be/abc"}),
            None,
        );
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(fetcher.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn download_rejects_wrong_credential_before_fetching() {
        let fetcher = Arc::new(StubFetcher::writing("x.mp4", b"x"));
        let state = test_state(Arc::clone(&fetcher)).await;
        let router = build_router(state);

        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://youtu.be/abc", "type": "mp4"}),
            Some("wrong-key"),
        );
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn info_returns_metadata_and_both_qualities() {
        let state = test_state(Arc::new(StubFetcher::writing("x.mp4", b"x"))).await;
        let router = build_router(state);

        let request = post_json(
            "/api/info",
            serde_json::json!({"url": "https://youtu.be/abc"}),
            Some(TEST_KEY),
        );
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["title"], "Stub Video");
        assert_eq!(json["thumbnail"], "https://img.test/thumb.jpg");
        assert_eq!(json["qualities"][0]["type"], "mp4");
        assert_eq!(json["qualities"][1]["type"], "mp3");
    }

    #[tokio::test]
    async fn info_accepts_body_credential() {
        let state = test_state(Arc::new(StubFetcher::writing("x.mp4", b"x"))).await;
        let router = build_router(state);

        let request = post_json(
            "/api/info",
            serde_json::json!({"url": "https://youtu.be/abc", "api_key": TEST_KEY}),
            None,
        );
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn download_validates_url_and_type() {
        let fetcher = Arc::new(StubFetcher::writing("x.mp4", b"x"));
        let state = test_state(Arc::clone(&fetcher)).await;

        let missing_url = post_json(
            "/api/download",
            serde_json::json!({"type": "mp4"}),
            Some(TEST_KEY),
        );
        let response = build_router(state.clone()).oneshot(missing_url).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bad_type = post_json(
            "/api/download",
            serde_json::json!({"url": "https://youtu.be/abc", "type": "wav"}),
            Some(TEST_KEY),
        );
        let response = build_router(state).oneshot(bad_type).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn download_then_serve_round_trips_content() {
        let state = test_state(Arc::new(StubFetcher::writing("clip.mp4", b"0123456789"))).await;

        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://example.test/v1", "type": "mp4"}),
            Some(TEST_KEY),
        );
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "success");
        let download_url = json["download_url"].as_str().unwrap().to_string();
        assert!(download_url.starts_with("/downloads/"));

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri(download_url.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[CONTENT_LENGTH], "10");
        assert!(
            response.headers()[CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .starts_with("attachment")
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"0123456789");
    }

    #[tokio::test]
    async fn failed_download_reports_diagnostic_and_keeps_store_empty() {
        let state = test_state(Arc::new(StubFetcher::failing("boom"))).await;
        let store = state.store.clone();

        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://example.test/v1", "type": "mp4"}),
            Some(TEST_KEY),
        );
        let response = build_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("boom"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timed_out_download_maps_to_gateway_timeout() {
        let state = test_state(Arc::new(StubFetcher::timing_out())).await;
        let store = state.store.clone();

        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://example.test/v1", "type": "mp4"}),
            Some(TEST_KEY),
        );
        let response = build_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], "UPSTREAM_TIMEOUT");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reaped_artifact_is_gone_from_list_and_serve() {
        let state = test_state(Arc::new(StubFetcher::writing("clip.mp4", b"data"))).await;
        let store = state.store.clone();

        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://example.test/v1", "type": "mp4"}),
            Some(TEST_KEY),
        );
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        crate::reaper::sweep(&store, Duration::ZERO).await;
        assert!(store.list().await.unwrap().is_empty());

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/downloads/clip.mp4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serving_unknown_name_is_not_found() {
        let state = test_state(Arc::new(StubFetcher::writing("x.mp4", b"x"))).await;

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/downloads/never-existed.mp4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[test]
    fn cleans_share_urls_to_watch_urls() {
        assert_eq!(
            clean_media_url("https://youtu.be/abc123"),
            "https://www.youtube.com/watch?v=abc123"
        );
        assert_eq!(
            clean_media_url("https://www.youtube.com/watch?v=abc123&t=10s"),
            "https://www.youtube.com/watch?v=abc123"
        );
        assert_eq!(
            clean_media_url("https://example.test/video"),
            "https://example.test/video"
        );
        assert_eq!(clean_media_url("not a url"), "not a url");
    }

    #[test]
    fn content_types_cover_common_extensions() {
        assert_eq!(content_type_for_filename("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("a.unknown"), "application/octet-stream");
    }
}
