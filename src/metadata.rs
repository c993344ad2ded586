//! Video metadata lookups.
//!
//! The primary path asks yt-dlp for the structured info JSON. When that fails
//! (signature changes, bot checks) we retry with alternate player clients,
//! and as a last resort fall back to the public oEmbed endpoint, which needs
//! no credentials but knows nothing about duration.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DownloadError;
use crate::ids::watch_url;
use crate::process::ProcessRunner;

pub const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";

/// What the API returns for `POST /video/info` and what the downloader needs
/// for naming files and writing history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub item_id: String,
    pub title: String,
    pub author: String,
    pub thumbnail: String,
    pub duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

pub trait MetadataSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<VideoMetadata, DownloadError>>;
}

/// Subset of yt-dlp's info JSON that we read.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    fulltitle: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
    duration: Option<f64>,
    description: Option<String>,
    upload_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailJson {
    url: Option<String>,
}

pub struct YtDlpMetadata {
    name: String,
    runner: ProcessRunner,
    extra_args: Vec<String>,
}

impl YtDlpMetadata {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            name: "yt-dlp".to_string(),
            runner,
            extra_args: Vec::new(),
        }
    }

    /// Same lookup using alternate player clients, which survive some of the
    /// web client's bot checks.
    pub fn alternate_clients(runner: ProcessRunner) -> Self {
        Self {
            name: "yt-dlp (alternate clients)".to_string(),
            runner,
            extra_args: vec![
                "--extractor-args".to_string(),
                "youtube:player_client=android,web".to_string(),
            ],
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl MetadataSource for YtDlpMetadata {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<VideoMetadata, DownloadError>> {
        Box::pin(async move {
            let raw = self.runner.capture(&watch_url(item_id), &self.args()).await?;
            parse_info_json(item_id, &raw)
        })
    }
}

fn parse_info_json(item_id: &str, raw: &str) -> Result<VideoMetadata, DownloadError> {
    let info: InfoJson = serde_json::from_str(raw.trim())?;
    let title = info
        .title
        .or(info.fulltitle)
        .filter(|title| !title.trim().is_empty())
        .ok_or_else(|| DownloadError::Metadata("yt-dlp returned no title".into()))?;
    let thumbnail = info
        .thumbnail
        .or_else(|| info.thumbnails.into_iter().rev().find_map(|thumb| thumb.url))
        .unwrap_or_default();

    Ok(VideoMetadata {
        item_id: item_id.to_string(),
        title,
        author: info.uploader.or(info.channel).unwrap_or_default(),
        thumbnail,
        duration_seconds: info.duration.map(|value| value.max(0.0) as u64).unwrap_or(0),
        description: info.description,
        upload_date: info.upload_date.as_deref().and_then(upload_date_to_iso),
    })
}

fn upload_date_to_iso(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Deserialize)]
struct OEmbedJson {
    title: String,
    author_name: Option<String>,
    thumbnail_url: Option<String>,
}

/// Degraded lookup through the public oEmbed endpoint.
pub struct OEmbedMetadata {
    endpoint: String,
}

impl OEmbedMetadata {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for OEmbedMetadata {
    fn default() -> Self {
        Self::new(OEMBED_ENDPOINT)
    }
}

impl MetadataSource for OEmbedMetadata {
    fn name(&self) -> &str {
        "oembed"
    }

    fn fetch<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<VideoMetadata, DownloadError>> {
        let endpoint = self.endpoint.clone();
        let item = item_id.to_string();
        Box::pin(async move {
            let url = watch_url(&item);
            let body = tokio::task::spawn_blocking(move || -> Result<OEmbedJson, String> {
                ureq::get(&endpoint)
                    .query("url", &url)
                    .query("format", "json")
                    .call()
                    .map_err(|err| err.to_string())?
                    .into_json::<OEmbedJson>()
                    .map_err(|err| err.to_string())
            })
            .await
            .map_err(|err| DownloadError::Metadata(err.to_string()))?
            .map_err(DownloadError::Metadata)?;

            Ok(VideoMetadata {
                item_id: item,
                title: body.title,
                author: body.author_name.unwrap_or_default(),
                thumbnail: body.thumbnail_url.unwrap_or_default(),
                duration_seconds: 0,
                description: None,
                upload_date: None,
            })
        })
    }
}

/// Tries each source in order. Individual failures are logged; only the
/// last one is surfaced.
pub struct FallbackMetadata {
    sources: Vec<Arc<dyn MetadataSource>>,
}

impl FallbackMetadata {
    pub fn new(sources: Vec<Arc<dyn MetadataSource>>) -> Self {
        Self { sources }
    }

    /// yt-dlp, then yt-dlp with alternate clients, then oEmbed.
    pub fn standard(runner: ProcessRunner) -> Self {
        Self::new(vec![
            Arc::new(YtDlpMetadata::new(runner.clone())),
            Arc::new(YtDlpMetadata::alternate_clients(runner)),
            Arc::new(OEmbedMetadata::default()),
        ])
    }
}

impl MetadataSource for FallbackMetadata {
    fn name(&self) -> &str {
        "fallback"
    }

    fn fetch<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<VideoMetadata, DownloadError>> {
        Box::pin(async move {
            let mut last_error = String::from("no metadata sources configured");
            for source in &self.sources {
                match source.fetch(item_id).await {
                    Ok(metadata) => {
                        info!(item_id, source = source.name(), "fetched video metadata");
                        return Ok(metadata);
                    }
                    Err(err) => {
                        warn!(item_id, source = source.name(), %err, "metadata source failed");
                        last_error = err.to_string();
                    }
                }
            }
            Err(DownloadError::Metadata(last_error))
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticMetadata;
    use super::*;

    #[test]
    fn parses_info_json() {
        let raw = r#"{
            "id": "dQw4w9WgXcQ",
            "title": "Never Gonna Give You Up",
            "uploader": "Rick Astley",
            "thumbnails": [{"url": "small.jpg"}, {"url": "large.jpg"}],
            "duration": 212.0,
            "description": "The official video",
            "upload_date": "20091025"
        }"#;
        let metadata = parse_info_json("dQw4w9WgXcQ", raw).unwrap();
        assert_eq!(metadata.title, "Never Gonna Give You Up");
        assert_eq!(metadata.author, "Rick Astley");
        assert_eq!(metadata.thumbnail, "large.jpg");
        assert_eq!(metadata.duration_seconds, 212);
        assert_eq!(metadata.upload_date.as_deref(), Some("2009-10-25"));
    }

    #[test]
    fn info_json_without_title_is_an_error() {
        assert!(parse_info_json("x", r#"{"uploader": "a"}"#).is_err());
        assert!(parse_info_json("x", "not json").is_err());
    }

    #[tokio::test]
    async fn fallback_uses_first_success() {
        let chain = FallbackMetadata::new(vec![
            Arc::new(StaticMetadata::failing("Sign in to confirm you're not a bot")),
            Arc::new(StaticMetadata::titled("From fallback")),
            Arc::new(StaticMetadata::titled("Never reached")),
        ]);
        let metadata = chain.fetch("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(metadata.title, "From fallback");
    }

    #[tokio::test]
    async fn fallback_surfaces_only_final_failure() {
        let chain = FallbackMetadata::new(vec![
            Arc::new(StaticMetadata::failing("first")),
            Arc::new(StaticMetadata::failing("second")),
        ]);
        let err = chain.fetch("dQw4w9WgXcQ").await.unwrap_err();
        assert!(matches!(err, DownloadError::Metadata(_)));
        let message = err.to_string();
        assert!(message.contains("second"));
        assert!(!message.contains("first"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ytdlp_source_reads_stub_output() {
        use crate::process::testing::install_stub;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"echo '{"title": "Stub Title", "channel": "Stub Channel", "thumbnail": "t.jpg", "duration": 61}'"#,
        );
        let source = YtDlpMetadata::new(ProcessRunner::new(stub, 1, Duration::from_secs(5)));
        let metadata = source.fetch("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(metadata.title, "Stub Title");
        assert_eq!(metadata.author, "Stub Channel");
        assert_eq!(metadata.duration_seconds, 61);
    }
}
