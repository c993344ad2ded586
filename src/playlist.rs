//! Playlist listing and sequential playlist downloads.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broadcast::{PlaylistBroadcaster, ProgressEvent};
use crate::download::{DownloadRequest, DownloadResult, VideoDownloader};
use crate::error::DownloadError;
use crate::ids::{MediaFormat, playlist_url, validate_playlist_id};
use crate::process::ProcessRunner;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistProgress {
    pub playlist_id: String,
    pub total_items: usize,
    pub current_index: usize,
    pub current_item_title: String,
    pub current_item_percent: f64,
    pub overall_percent: u32,
    pub status: PlaylistStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlaylistProgress {
    fn failed(playlist_id: &str, error: &DownloadError) -> Self {
        Self {
            playlist_id: playlist_id.to_string(),
            total_items: 0,
            current_index: 0,
            current_item_title: String::new(),
            current_item_percent: 0.0,
            overall_percent: 0,
            status: PlaylistStatus::Failed,
            error: Some(error.to_string()),
        }
    }
}

impl ProgressEvent for PlaylistProgress {
    fn is_terminal(&self) -> bool {
        matches!(self.status, PlaylistStatus::Completed | PlaylistStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub item_id: String,
    pub title: String,
    pub author: String,
    pub thumbnail: String,
    pub duration_seconds: u64,
    /// 1-based position in the playlist.
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub playlist_id: String,
    pub title: String,
    pub author: String,
    pub thumbnail: String,
    pub item_count: usize,
    pub items: Vec<PlaylistItem>,
}

pub trait PlaylistSource: Send + Sync {
    fn fetch<'a>(&'a self, playlist_id: &'a str) -> BoxFuture<'a, Result<PlaylistInfo, DownloadError>>;
}

/// Flat listing through `yt-dlp --flat-playlist`.
pub struct YtDlpPlaylistSource {
    runner: ProcessRunner,
}

impl YtDlpPlaylistSource {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

impl PlaylistSource for YtDlpPlaylistSource {
    fn fetch<'a>(&'a self, playlist_id: &'a str) -> BoxFuture<'a, Result<PlaylistInfo, DownloadError>> {
        Box::pin(async move {
            let args = [
                "--flat-playlist".to_string(),
                "--dump-single-json".to_string(),
                "--no-warnings".to_string(),
            ];
            let raw = match self.runner.capture(&playlist_url(playlist_id), &args).await {
                Ok(raw) => raw,
                Err(DownloadError::ProcessFailed { stderr, .. }) => {
                    return Err(translate_playlist_error(playlist_id, &stderr));
                }
                Err(err) => return Err(err),
            };
            let info = parse_flat_playlist(playlist_id, &raw)?;
            info!(playlist_id, items = info.item_count, "fetched playlist");
            Ok(info)
        })
    }
}

#[derive(Debug, Deserialize)]
struct FlatPlaylistJson {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
    #[serde(default)]
    entries: Vec<Option<FlatEntryJson>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntryJson {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailJson {
    url: Option<String>,
}

fn last_thumbnail(thumbnails: Vec<ThumbnailJson>) -> Option<String> {
    thumbnails.into_iter().rev().find_map(|thumb| thumb.url)
}

fn parse_flat_playlist(playlist_id: &str, raw: &str) -> Result<PlaylistInfo, DownloadError> {
    let json: FlatPlaylistJson = serde_json::from_str(raw.trim())?;

    let items: Vec<PlaylistItem> = json
        .entries
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let item_id = entry.id?;
            let thumbnail = last_thumbnail(entry.thumbnails)
                .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{item_id}/hqdefault.jpg"));
            Some(PlaylistItem {
                title: entry.title.unwrap_or_else(|| item_id.clone()),
                author: entry.uploader.or(entry.channel).unwrap_or_default(),
                thumbnail,
                duration_seconds: entry.duration.map(|value| value.max(0.0) as u64).unwrap_or(0),
                index: 0,
                item_id,
            })
        })
        .enumerate()
        .map(|(position, mut item)| {
            item.index = position + 1;
            item
        })
        .collect();

    if items.is_empty() {
        return Err(DownloadError::EmptyPlaylist);
    }

    let thumbnail = last_thumbnail(json.thumbnails)
        .or_else(|| items.first().map(|item| item.thumbnail.clone()))
        .unwrap_or_default();
    Ok(PlaylistInfo {
        playlist_id: playlist_id.to_string(),
        title: json.title.unwrap_or_else(|| "Untitled playlist".to_string()),
        author: json.uploader.or(json.channel).unwrap_or_default(),
        thumbnail,
        item_count: items.len(),
        items,
    })
}

/// Maps yt-dlp's playlist diagnostics onto messages a user can act on.
pub fn translate_playlist_error(playlist_id: &str, diagnostic: &str) -> DownloadError {
    let lowered = diagnostic.to_ascii_lowercase();
    if lowered.contains("private") {
        return DownloadError::Playlist(
            "This playlist is private. Only public or unlisted playlists can be downloaded.".into(),
        );
    }
    if lowered.contains("does not exist") || lowered.contains("unavailable") || lowered.contains("404") {
        return DownloadError::Playlist("This playlist does not exist or has been removed.".into());
    }
    if lowered.contains("unviewable") {
        return DownloadError::UnsupportedPlaylist(
            "This playlist cannot be viewed. YouTube Mix playlists are not supported.".into(),
        );
    }
    warn!(playlist_id, diagnostic, "unrecognised playlist error");
    DownloadError::Playlist("Failed to fetch playlist information".into())
}

/// How the playlist loop downloads one item.
pub trait ItemDownloader: Send + Sync {
    fn download_item<'a>(
        &'a self,
        request: DownloadRequest,
        on_progress: Box<dyn FnMut(f64) + Send + 'a>,
    ) -> BoxFuture<'a, Result<DownloadResult, DownloadError>>;
}

impl ItemDownloader for VideoDownloader {
    fn download_item<'a>(
        &'a self,
        request: DownloadRequest,
        on_progress: Box<dyn FnMut(f64) + Send + 'a>,
    ) -> BoxFuture<'a, Result<DownloadResult, DownloadError>> {
        Box::pin(async move { self.download_with(&request, on_progress).await })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistDownloadRequest {
    pub playlist_id: String,
    pub quality: String,
    pub format: MediaFormat,
    #[serde(default)]
    pub selected_item_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistResult {
    pub success: bool,
    pub total_items: usize,
    pub succeeded_count: usize,
    pub failed_titles: Vec<String>,
    pub output_urls: Vec<String>,
    pub filenames: Vec<String>,
}

pub struct PlaylistDownloader {
    source: Arc<dyn PlaylistSource>,
    items: Arc<dyn ItemDownloader>,
    progress: PlaylistBroadcaster,
}

impl PlaylistDownloader {
    pub fn new(
        source: Arc<dyn PlaylistSource>,
        items: Arc<dyn ItemDownloader>,
        progress: PlaylistBroadcaster,
    ) -> Self {
        Self {
            source,
            items,
            progress,
        }
    }

    pub async fn info(&self, playlist_id: &str) -> Result<PlaylistInfo, DownloadError> {
        validate_playlist_id(playlist_id)?;
        self.source.fetch(playlist_id).await
    }

    /// Downloads the selected items one after another. Individual failures
    /// are collected, not propagated; only listing problems abort the job.
    pub async fn download(&self, request: &PlaylistDownloadRequest) -> Result<PlaylistResult, DownloadError> {
        let playlist_id = request.playlist_id.as_str();
        let items = match self.selected_items(request).await {
            Ok(items) => items,
            Err(err) => {
                error!(playlist_id, %err, "playlist download aborted");
                self.progress
                    .publish(&playlist_id.to_string(), PlaylistProgress::failed(playlist_id, &err));
                return Err(err);
            }
        };

        let total = items.len();
        let key = playlist_id.to_string();
        let mut result = PlaylistResult {
            total_items: total,
            ..PlaylistResult::default()
        };
        info!(playlist_id, total, quality = %request.quality, format = %request.format, "playlist download started");

        for (position, item) in items.iter().enumerate() {
            let snapshot = PlaylistProgress {
                playlist_id: key.clone(),
                total_items: total,
                current_index: position + 1,
                current_item_title: item.title.clone(),
                current_item_percent: 0.0,
                overall_percent: overall_percent(position, total),
                status: PlaylistStatus::Downloading,
                error: None,
            };
            self.progress.publish(&key, snapshot.clone());

            let progress = self.progress.clone();
            let on_progress = Box::new(move |percent: f64| {
                progress.publish(
                    &snapshot.playlist_id,
                    PlaylistProgress {
                        current_item_percent: percent,
                        ..snapshot.clone()
                    },
                );
            });
            let item_request = DownloadRequest {
                item_id: item.item_id.clone(),
                quality: request.quality.clone(),
                format: request.format,
            };

            match self.items.download_item(item_request, on_progress).await {
                Ok(done) => {
                    result.succeeded_count += 1;
                    result.output_urls.extend(done.output_url);
                    result.filenames.extend(done.filename);
                }
                Err(err) => {
                    warn!(playlist_id, item_id = %item.item_id, title = %item.title, %err, "playlist item failed");
                    result.failed_titles.push(item.title.clone());
                }
            }
        }

        // Reported as completed even when some items failed; failed_titles
        // carries the detail.
        self.progress.publish(
            &key,
            PlaylistProgress {
                playlist_id: key.clone(),
                total_items: total,
                current_index: total,
                current_item_title: String::new(),
                current_item_percent: 100.0,
                overall_percent: 100,
                status: PlaylistStatus::Completed,
                error: None,
            },
        );

        result.success = result.succeeded_count > 0;
        info!(
            playlist_id,
            succeeded = result.succeeded_count,
            failed = result.failed_titles.len(),
            "playlist download finished"
        );
        Ok(result)
    }

    async fn selected_items(&self, request: &PlaylistDownloadRequest) -> Result<Vec<PlaylistItem>, DownloadError> {
        let info = self.info(&request.playlist_id).await?;
        let items = match request.selected_item_ids.as_deref() {
            Some(selected) if !selected.is_empty() => info
                .items
                .into_iter()
                .filter(|item| selected.contains(&item.item_id))
                .collect(),
            _ => info.items,
        };
        if items.is_empty() {
            return Err(DownloadError::Validation(
                "None of the selected videos belong to this playlist".into(),
            ));
        }
        Ok(items)
    }
}

fn overall_percent(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (completed * 100 / total) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::PLAYLIST_IDLE_TIMEOUT;
    use parking_lot::Mutex;

    struct StaticPlaylist {
        items: usize,
    }

    impl PlaylistSource for StaticPlaylist {
        fn fetch<'a>(&'a self, playlist_id: &'a str) -> BoxFuture<'a, Result<PlaylistInfo, DownloadError>> {
            let items: Vec<PlaylistItem> = (1..=self.items)
                .map(|n| PlaylistItem {
                    item_id: format!("video{n:06}"),
                    title: format!("Track {n}"),
                    author: "Band".into(),
                    thumbnail: String::new(),
                    duration_seconds: 180,
                    index: n,
                })
                .collect();
            let result = if items.is_empty() {
                Err(DownloadError::EmptyPlaylist)
            } else {
                Ok(PlaylistInfo {
                    playlist_id: playlist_id.to_string(),
                    title: "Album".into(),
                    author: "Band".into(),
                    thumbnail: String::new(),
                    item_count: items.len(),
                    items,
                })
            };
            Box::pin(async move { result })
        }
    }

    /// Reports 50% for every item, then fails the ids in `failing`.
    struct ScriptedItems {
        failing: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedItems {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|id| id.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ItemDownloader for ScriptedItems {
        fn download_item<'a>(
            &'a self,
            request: DownloadRequest,
            mut on_progress: Box<dyn FnMut(f64) + Send + 'a>,
        ) -> BoxFuture<'a, Result<DownloadResult, DownloadError>> {
            Box::pin(async move {
                self.seen.lock().push(request.item_id.clone());
                on_progress(50.0);
                if self.failing.contains(&request.item_id) {
                    return Err(DownloadError::DownloadFailed("HTTP Error 403".into()));
                }
                let filename = format!("{}.mp4", request.item_id);
                Ok(DownloadResult {
                    success: true,
                    output_url: Some(format!("/api/downloads/{filename}")),
                    filename: Some(filename),
                    error: None,
                })
            })
        }
    }

    fn downloader(items: usize, scripted: Arc<ScriptedItems>) -> (PlaylistDownloader, PlaylistBroadcaster) {
        let progress = PlaylistBroadcaster::new(PLAYLIST_IDLE_TIMEOUT);
        let downloader =
            PlaylistDownloader::new(Arc::new(StaticPlaylist { items }), scripted, progress.clone());
        (downloader, progress)
    }

    fn request(playlist_id: &str, selected: Option<Vec<&str>>) -> PlaylistDownloadRequest {
        PlaylistDownloadRequest {
            playlist_id: playlist_id.to_string(),
            quality: "720p".into(),
            format: MediaFormat::Video,
            selected_item_ids: selected.map(|ids| ids.into_iter().map(String::from).collect()),
        }
    }

    const PLAYLIST: &str = "PLrAXtmErZgOeiKm4sgNOknGvNjby9efdf";

    #[tokio::test]
    async fn partial_failures_still_complete() {
        let scripted = Arc::new(ScriptedItems::new(&["video000002", "video000005"]));
        let (downloader, progress) = downloader(6, scripted.clone());
        let mut subscription = progress.subscribe(PLAYLIST.to_string());

        let result = downloader.download(&request(PLAYLIST, None)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_items, 6);
        assert_eq!(result.succeeded_count, 4);
        assert_eq!(result.failed_titles, vec!["Track 2", "Track 5"]);
        assert_eq!(result.filenames.len(), 4);
        assert_eq!(result.output_urls[0], "/api/downloads/video000001.mp4");

        let mut events = Vec::new();
        while let Some(event) = subscription.next().await {
            events.push(event);
        }
        // Start and mid-item event per item, then the final one.
        assert_eq!(events.len(), 6 * 2 + 1);
        assert_eq!(events[0].current_index, 1);
        assert_eq!(events[0].overall_percent, 0);
        assert_eq!(events[0].current_item_percent, 0.0);
        assert_eq!(events[1].current_item_percent, 50.0);
        assert_eq!(events[6].current_index, 4);
        assert_eq!(events[6].overall_percent, 50);

        let last = events.last().unwrap();
        assert_eq!(last.status, PlaylistStatus::Completed);
        assert_eq!(last.overall_percent, 100);
        assert_eq!(last.current_index, 6);
        assert_eq!(progress.channel_count(), 0);
    }

    #[tokio::test]
    async fn every_item_failing_is_unsuccessful() {
        let scripted = Arc::new(ScriptedItems::new(&["video000001", "video000002"]));
        let (downloader, _progress) = downloader(2, scripted);
        let result = downloader.download(&request(PLAYLIST, None)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.succeeded_count, 0);
        assert_eq!(result.failed_titles.len(), 2);
    }

    #[tokio::test]
    async fn selection_keeps_playlist_order() {
        let scripted = Arc::new(ScriptedItems::new(&[]));
        let (downloader, _progress) = downloader(5, scripted.clone());
        let result = downloader
            .download(&request(PLAYLIST, Some(vec!["video000004", "video000002"])))
            .await
            .unwrap();
        assert_eq!(result.total_items, 2);
        assert_eq!(*scripted.seen.lock(), vec!["video000002", "video000004"]);
    }

    #[tokio::test]
    async fn empty_selection_means_everything() {
        let scripted = Arc::new(ScriptedItems::new(&[]));
        let (downloader, _progress) = downloader(3, scripted.clone());
        let result = downloader
            .download(&request(PLAYLIST, Some(Vec::new())))
            .await
            .unwrap();
        assert_eq!(result.succeeded_count, 3);
    }

    #[tokio::test]
    async fn mixes_are_rejected_with_failed_event() {
        let scripted = Arc::new(ScriptedItems::new(&[]));
        let (downloader, progress) = downloader(3, scripted.clone());
        let mix = "RDdQw4w9WgXcQ";
        let mut subscription = progress.subscribe(mix.to_string());

        let err = downloader.download(&request(mix, None)).await.unwrap_err();
        assert!(matches!(err, DownloadError::UnsupportedPlaylist(_)));
        assert!(scripted.seen.lock().is_empty());

        let event = subscription.next().await.unwrap();
        assert_eq!(event.status, PlaylistStatus::Failed);
        assert!(event.error.is_some());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_playlist_aborts() {
        let (downloader, _progress) = downloader(0, Arc::new(ScriptedItems::new(&[])));
        let err = downloader.download(&request(PLAYLIST, None)).await.unwrap_err();
        assert!(matches!(err, DownloadError::EmptyPlaylist));
    }

    #[test]
    fn playlist_errors_are_translated() {
        let private = translate_playlist_error("PLx", "ERROR: This playlist is private");
        assert!(private.to_string().contains("private"));

        for missing in [
            "ERROR: The playlist does not exist.",
            "ERROR: This playlist is unavailable",
            "HTTP Error 404: Not Found",
        ] {
            assert!(translate_playlist_error("PLx", missing)
                .to_string()
                .contains("does not exist or has been removed"));
        }

        let mix = translate_playlist_error("PLx", "ERROR: The playlist type is unviewable");
        assert!(matches!(mix, DownloadError::UnsupportedPlaylist(_)));

        let other = translate_playlist_error("PLx", "ERROR: something odd");
        assert_eq!(other.to_string(), "Failed to fetch playlist information");
    }

    #[test]
    fn parses_flat_playlist_json() {
        let raw = r#"{
            "id": "PLx",
            "title": "Road Trip",
            "uploader": "Someone",
            "entries": [
                {"id": "aaaaaaaaaaa", "title": "First", "channel": "A", "duration": 61.5},
                null,
                {"id": "bbbbbbbbbbb", "title": "Second", "thumbnails": [{"url": "s.jpg"}, {"url": "l.jpg"}]},
                {"title": "No id"}
            ]
        }"#;
        let info = parse_flat_playlist("PLx", raw).unwrap();
        assert_eq!(info.title, "Road Trip");
        assert_eq!(info.author, "Someone");
        assert_eq!(info.item_count, 2);
        assert_eq!(info.items[0].index, 1);
        assert_eq!(info.items[0].author, "A");
        assert_eq!(info.items[0].duration_seconds, 61);
        assert_eq!(info.items[0].thumbnail, "https://i.ytimg.com/vi/aaaaaaaaaaa/hqdefault.jpg");
        assert_eq!(info.items[1].index, 2);
        assert_eq!(info.items[1].thumbnail, "l.jpg");
        assert_eq!(info.thumbnail, info.items[0].thumbnail);

        let empty = parse_flat_playlist("PLx", r#"{"title": "Nothing", "entries": []}"#).unwrap_err();
        assert!(matches!(empty, DownloadError::EmptyPlaylist));
    }

    #[test]
    fn overall_percent_floors() {
        assert_eq!(overall_percent(0, 3), 0);
        assert_eq!(overall_percent(1, 3), 33);
        assert_eq!(overall_percent(2, 3), 66);
        assert_eq!(overall_percent(3, 3), 100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ytdlp_source_translates_tool_errors() {
        use crate::process::testing::install_stub;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"echo "ERROR: [youtube:tab] PLx: This playlist is private" >&2
exit 1"#,
        );
        let source = YtDlpPlaylistSource::new(ProcessRunner::new(stub, 1, Duration::from_secs(5)));
        let err = source.fetch("PLx").await.unwrap_err();
        assert!(matches!(err, DownloadError::Playlist(_)));
        assert!(err.to_string().contains("private"));
    }
}
