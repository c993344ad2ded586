#![forbid(unsafe_code)]

//! Axum backend for tubefetch.
//!
//! Every route lives under `/api`. Downloads run on their own task so a
//! client that hangs up mid-request does not cancel the job; progress is
//! observed through the SSE endpoints instead.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use chrono::Utc;
use clap::Parser;
use futures::{Stream, StreamExt};
use mime_guess::{
    MimeGuess,
    mime::{self, Mime},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tubefetch::{
    broadcast::{PLAYLIST_IDLE_TIMEOUT, PlaylistBroadcaster, VIDEO_IDLE_TIMEOUT, VideoBroadcaster},
    cleanup::spawn_cleanup,
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    download::{DownloadRequest, DownloadResult, VideoDownloader, sanitize_title},
    error::DownloadError,
    history::{DEFAULT_PAGE_SIZE, HistoryStore},
    ids::{MediaFormat, VideoJobKey},
    logging,
    metadata::{FallbackMetadata, MetadataSource},
    playlist::{
        PlaylistDownloadRequest, PlaylistDownloader, PlaylistResult, PlaylistSource,
        YtDlpPlaylistSource,
    },
    process::ProcessRunner,
};

const SERVICE_NAME: &str = "YouTube Downloader API";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Parser)]
#[command(
    name = "backend",
    version,
    about = "HTTP API that downloads YouTube videos and playlists through yt-dlp"
)]
struct BackendArgs {
    /// Port to listen on. Overrides PORT.
    #[arg(long)]
    port: Option<u16>,
    /// Address to bind. Overrides HOST.
    #[arg(long)]
    host: Option<String>,
    /// Where finished downloads are written. Overrides DOWNLOADS_DIR.
    #[arg(long, value_name = "DIR")]
    downloads_dir: Option<PathBuf>,
    /// JSON file holding the download history. Overrides HISTORY_FILE.
    #[arg(long, value_name = "FILE")]
    history_file: Option<PathBuf>,
    /// yt-dlp executable. Overrides YTDLP_PATH.
    #[arg(long, value_name = "PATH")]
    ytdlp_path: Option<PathBuf>,
    /// Alternative `.env` file.
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            port: self.port,
            host: self.host,
            downloads_dir: self.downloads_dir,
            history_file: self.history_file,
            ytdlp_path: self.ytdlp_path,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

#[derive(Clone)]
struct AppState {
    videos: Arc<VideoDownloader>,
    playlists: Arc<PlaylistDownloader>,
    history: Arc<HistoryStore>,
    video_progress: VideoBroadcaster,
    playlist_progress: PlaylistBroadcaster,
    downloads_dir: Arc<PathBuf>,
}

impl AppState {
    fn new(
        runner: ProcessRunner,
        metadata: Arc<dyn MetadataSource>,
        playlist_source: Arc<dyn PlaylistSource>,
        history: Arc<HistoryStore>,
        downloads_dir: PathBuf,
    ) -> Self {
        let video_progress = VideoBroadcaster::new(VIDEO_IDLE_TIMEOUT);
        let playlist_progress = PlaylistBroadcaster::new(PLAYLIST_IDLE_TIMEOUT);
        let videos = Arc::new(VideoDownloader::new(
            runner,
            metadata,
            history.clone(),
            video_progress.clone(),
            downloads_dir.clone(),
        ));
        let playlists = Arc::new(PlaylistDownloader::new(
            playlist_source,
            videos.clone(),
            playlist_progress.clone(),
        ));

        Self {
            videos,
            playlists,
            history,
            video_progress,
            playlist_progress,
            downloads_dir: Arc::new(downloads_dir),
        }
    }

    async fn from_settings(settings: &RuntimeSettings) -> Self {
        let runner = ProcessRunner::new(
            &settings.ytdlp_path,
            settings.max_concurrent,
            settings.download_timeout,
        );
        let history = Arc::new(HistoryStore::open(&settings.history_file).await);
        Self::new(
            runner.clone(),
            Arc::new(FallbackMetadata::standard(runner.clone())),
            Arc::new(YtDlpPlaylistSource::new(runner)),
            history,
            settings.downloads_dir.clone(),
        )
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Validation problems are always 400; anything else gets the route's
    /// `fallback` status.
    fn from_download(err: DownloadError, fallback: StatusCode) -> Self {
        let status = if err.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            fallback
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let settings = resolve_runtime_settings(BackendArgs::parse().into_overrides())?;
    let host = parse_host_arg(&settings.host)?;
    tokio::fs::create_dir_all(&settings.downloads_dir)
        .await
        .with_context(|| format!("creating {}", settings.downloads_dir.display()))?;

    let state = AppState::from_settings(&settings).await;
    let _cleanup = spawn_cleanup(
        settings.downloads_dir.clone(),
        settings.cleanup_interval,
        settings.max_file_age,
    );

    let app = router(state).layer(cors_layer(&settings.cors_origin)?);

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        downloads = %settings.downloads_dir.display(),
        ytdlp = %settings.ytdlp_path.display(),
        max_concurrent = settings.max_concurrent,
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_info))
        .route("/api/health", get(health))
        .route("/api/video/info", post(video_info))
        .route("/api/video/download", post(video_download))
        .route(
            "/api/video/download/progress/{item_id}/{quality}/{format}",
            get(video_progress),
        )
        .route("/api/video/stream/{item_id}", get(stream_video))
        .route("/api/downloads/{filename}", get(download_file))
        .route("/api/playlist/info", post(playlist_info))
        .route("/api/playlist/download", post(playlist_download))
        .route("/api/playlist/progress/{playlist_id}", get(playlist_progress))
        .route("/api/history", get(list_history).delete(clear_history))
        .route("/api/history/{id}", delete(delete_history_item))
        .fallback(api_fallback)
        .with_state(state)
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let origin: HeaderValue = origin
        .parse()
        .with_context(|| format!("CORS_ORIGIN is not a valid origin: {origin}"))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::RANGE]))
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl+C handler");
    }
    info!("shutdown requested");
}

async fn api_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn api_info() -> Json<Value> {
    Json(json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "GET /api/health",
            "videoInfo": "POST /api/video/info",
            "download": "POST /api/video/download",
            "downloadProgress": "GET /api/video/download/progress/:itemId/:quality/:format",
            "stream": "GET /api/video/stream/:itemId",
            "file": "GET /api/downloads/:filename",
            "playlistInfo": "POST /api/playlist/info",
            "playlistDownload": "POST /api/playlist/download",
            "playlistProgress": "GET /api/playlist/progress/:playlistId",
            "history": "GET /api/history",
        },
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoInfoRequest {
    #[serde(default)]
    item_id: String,
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<VideoInfoRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let info = state
        .videos
        .info(&request.item_id)
        .await
        .map_err(|err| ApiError::from_download(err, StatusCode::BAD_REQUEST))?;
    Ok(Json(json!({ "success": true, "data": info })))
}

async fn video_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadResult>> {
    let Json(request) = payload?;
    let videos = state.videos.clone();
    let job = tokio::spawn(async move { videos.download(&request).await });
    let result = job
        .await
        .map_err(|err| ApiError::internal(format!("download task failed: {err}")))?
        .map_err(|err| ApiError::from_download(err, StatusCode::INTERNAL_SERVER_ERROR))?;
    Ok(Json(result))
}

async fn video_progress(
    State(state): State<AppState>,
    AxumPath((item_id, quality, format)): AxumPath<(String, String, String)>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let format: MediaFormat = format
        .parse()
        .map_err(|err| ApiError::from_download(err, StatusCode::BAD_REQUEST))?;
    let events = state
        .video_progress
        .subscribe(VideoJobKey::new(item_id, quality, format))
        .into_stream()
        .map(|event| Event::default().json_data(&event));
    Ok(sse(events))
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath(item_id): AxumPath<String>,
) -> ApiResult<Response> {
    let (metadata, media) = state
        .videos
        .stream(&item_id)
        .await
        .map_err(|err| ApiError::from_download(err, StatusCode::INTERNAL_SERVER_ERROR))?;

    let mut response = Body::from_stream(ReaderStream::new(media)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_header(&format!("{}.mp4", sanitize_title(&metadata.title)))?,
    );
    Ok(response)
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&filename)?;
    let path = state.downloads_dir.join(&filename);
    let mut response = stream_file(path, Some(mime::APPLICATION_OCTET_STREAM), Some(&headers)).await?;
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, attachment_header(&filename)?);
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistInfoRequest {
    #[serde(default)]
    playlist_id: String,
}

async fn playlist_info(
    State(state): State<AppState>,
    payload: Result<Json<PlaylistInfoRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let info = state
        .playlists
        .info(&request.playlist_id)
        .await
        .map_err(|err| ApiError::from_download(err, StatusCode::BAD_REQUEST))?;
    Ok(Json(json!({ "success": true, "data": info })))
}

async fn playlist_download(
    State(state): State<AppState>,
    payload: Result<Json<PlaylistDownloadRequest>, JsonRejection>,
) -> ApiResult<Json<PlaylistResult>> {
    let Json(request) = payload?;
    let playlists = state.playlists.clone();
    let job = tokio::spawn(async move { playlists.download(&request).await });
    let result = job
        .await
        .map_err(|err| ApiError::internal(format!("playlist task failed: {err}")))?
        .map_err(|err| ApiError::from_download(err, StatusCode::INTERNAL_SERVER_ERROR))?;
    Ok(Json(result))
}

async fn playlist_progress(
    State(state): State<AppState>,
    AxumPath(playlist_id): AxumPath<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = state
        .playlist_progress
        .subscribe(playlist_id)
        .into_stream()
        .map(|event| Event::default().json_data(&event));
    sse(events)
}

fn sse<S>(events: S) -> Sse<impl Stream<Item = Result<Event, axum::Error>>>
where
    S: Stream<Item = Result<Event, axum::Error>> + Send + 'static,
{
    Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let (items, total) = state
        .history
        .list(
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            query.offset.unwrap_or(0),
        )
        .await;
    Ok(Json(json!({ "success": true, "data": items, "total": total })))
}

async fn clear_history(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .history
        .clear()
        .await
        .map_err(|err| ApiError::internal(format!("Failed to clear history: {err}")))?;
    Ok(Json(json!({
        "success": true,
        "message": "Download history cleared successfully",
    })))
}

async fn delete_history_item(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    state
        .history
        .delete(&id)
        .await
        .map_err(|err| ApiError::internal(format!("Failed to delete history item: {err}")))?;
    Ok(Json(json!({
        "success": true,
        "message": "History item deleted successfully",
    })))
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("File not found"));
    }

    Ok(())
}

fn attachment_header(filename: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        urlencoding::encode(filename)
    ))
    .map_err(|err| ApiError::internal(err.to_string()))
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let size = match file.metadata().await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => return Err(ApiError::not_found("File not found")),
    };

    let requested = headers.and_then(|headers| headers.get(header::RANGE));
    let mut response = match ByteRange::select(requested, size) {
        RangeSelection::Whole => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
        RangeSelection::Part(range) => {
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let body = Body::from_stream(ReaderStream::new(file.take(range.len())));
            let mut response = (StatusCode::PARTIAL_CONTENT, body).into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_RANGE, header_value(range.content_range(size))?);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
            response
        }
        RangeSelection::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = mime.or_else(|| MimeGuess::from_path(&path).first())
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Inclusive byte span of a file, already clamped to its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum RangeSelection {
    Whole,
    Part(ByteRange),
    Unsatisfiable,
}

impl ByteRange {
    /// Interprets a single `bytes=` range against a file of `size` bytes.
    /// Anything this server does not understand, multi-range requests
    /// included, is answered with the whole file.
    fn select(requested: Option<&HeaderValue>, size: u64) -> RangeSelection {
        let Some(bounds) = requested
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().strip_prefix("bytes="))
            .and_then(|ranges| ranges.trim().split_once('-'))
        else {
            return RangeSelection::Whole;
        };

        let bounds = match bounds {
            // "-N" asks for the final N bytes.
            ("", last) => last
                .parse::<u64>()
                .ok()
                .filter(|&count| count > 0)
                .map(|count| (size.saturating_sub(count), u64::MAX)),
            (first, "") => first.parse().ok().map(|start| (start, u64::MAX)),
            (first, last) => first
                .parse::<u64>()
                .ok()
                .zip(last.parse::<u64>().ok())
                .filter(|(start, end)| start <= end),
        };

        match bounds {
            None => RangeSelection::Whole,
            Some((start, _)) if start >= size => RangeSelection::Unsatisfiable,
            Some((start, end)) => RangeSelection::Part(ByteRange {
                start,
                end: end.min(size - 1),
            }),
        }
    }

    fn len(self) -> u64 {
        self.end - self.start + 1
    }

    fn content_range(self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }
}
