//! Single-video downloads.
//!
//! A download resolves metadata, picks a collision-free file name, runs
//! yt-dlp with arguments derived from the requested quality and format, and
//! then finds whatever file yt-dlp actually produced (it may append format
//! suffixes to the name we asked for).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broadcast::{ProgressEvent, VideoBroadcaster};
use crate::error::DownloadError;
use crate::history::{HistoryEntry, HistoryStore};
use crate::ids::{MediaFormat, VideoJobKey, validate_video_id, watch_url};
use crate::metadata::{MetadataSource, VideoMetadata};
use crate::process::{MediaStream, ProcessRunner};
use crate::progress::ProgressParser;

pub const DOWNLOADS_ROUTE: &str = "/api/downloads";
const USER_AGENT: &str =
    "user-agent:Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
/// Sanitised titles are ASCII, so this is also the byte length.
const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub item_id: String,
    pub quality: String,
    pub format: MediaFormat,
}

impl DownloadRequest {
    pub fn job_key(&self) -> VideoJobKey {
        VideoJobKey::new(self.item_id.clone(), self.quality.clone(), self.format)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadResult {
    fn completed(filename: String) -> Self {
        Self {
            success: true,
            output_url: Some(format!("{DOWNLOADS_ROUTE}/{}", urlencoding::encode(&filename))),
            filename: Some(filename),
            error: None,
        }
    }
}

/// Progress of one video job. Terminal at 100 or once `error` is set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoProgress {
    #[serde(skip)]
    pub job_key: VideoJobKey,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VideoProgress {
    pub fn running(job_key: VideoJobKey, progress: f64) -> Self {
        Self {
            job_key,
            progress,
            error: None,
        }
    }

    pub fn completed(job_key: VideoJobKey) -> Self {
        Self::running(job_key, 100.0)
    }

    pub fn failed(job_key: VideoJobKey, progress: f64, error: impl Into<String>) -> Self {
        Self {
            job_key,
            progress,
            error: Some(error.into()),
        }
    }
}

impl ProgressEvent for VideoProgress {
    fn is_terminal(&self) -> bool {
        self.progress >= 100.0 || self.error.is_some()
    }
}

/// What a finished job hands to requests that joined it. Errors travel as
/// their message because `DownloadError` is not `Clone`.
type JobOutcome = Result<DownloadResult, String>;

/// Jobs currently running, one per key.
#[derive(Default)]
struct RunningJobs {
    jobs: Mutex<HashMap<VideoJobKey, watch::Receiver<Option<JobOutcome>>>>,
}

enum Claim<'a> {
    Owner(JobSlot<'a>),
    Joined(watch::Receiver<Option<JobOutcome>>),
}

impl RunningJobs {
    fn claim(&self, key: &VideoJobKey) -> Claim<'_> {
        let mut jobs = self.jobs.lock();
        if let Some(outcome) = jobs.get(key) {
            return Claim::Joined(outcome.clone());
        }
        let (tx, rx) = watch::channel(None);
        jobs.insert(key.clone(), rx);
        Claim::Owner(JobSlot {
            jobs: self,
            key: key.clone(),
            tx,
        })
    }
}

/// Ownership of a key's job. Dropping it frees the key, even if the owning
/// future was cancelled before finishing.
struct JobSlot<'a> {
    jobs: &'a RunningJobs,
    key: VideoJobKey,
    tx: watch::Sender<Option<JobOutcome>>,
}

impl JobSlot<'_> {
    fn finish(self, result: &Result<DownloadResult, DownloadError>) {
        let outcome = match result {
            Ok(done) => Ok(done.clone()),
            Err(DownloadError::DownloadFailed(message)) => Err(message.clone()),
            Err(other) => Err(other.to_string()),
        };
        let _ = self.tx.send(Some(outcome));
    }
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        self.jobs.jobs.lock().remove(&self.key);
    }
}

async fn join_running(
    key: &VideoJobKey,
    mut outcome: watch::Receiver<Option<JobOutcome>>,
) -> Result<DownloadResult, DownloadError> {
    info!(job = %key, "joining download already in progress");
    let finished = match outcome.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    match finished {
        Some(Ok(result)) => Ok(result),
        Some(Err(message)) => Err(DownloadError::DownloadFailed(message)),
        None => Err(DownloadError::DownloadFailed(
            "the download this request joined was cancelled".into(),
        )),
    }
}

pub struct VideoDownloader {
    runner: ProcessRunner,
    metadata: Arc<dyn MetadataSource>,
    history: Arc<HistoryStore>,
    progress: VideoBroadcaster,
    output_dir: PathBuf,
    running: RunningJobs,
}

impl VideoDownloader {
    pub fn new(
        runner: ProcessRunner,
        metadata: Arc<dyn MetadataSource>,
        history: Arc<HistoryStore>,
        progress: VideoBroadcaster,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            metadata,
            history,
            progress,
            output_dir: output_dir.into(),
            running: RunningJobs::default(),
        }
    }

    /// Validated metadata lookup. Malformed ids never reach yt-dlp.
    pub async fn info(&self, item_id: &str) -> Result<VideoMetadata, DownloadError> {
        validate_video_id(item_id)?;
        self.metadata.fetch(item_id).await
    }

    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadResult, DownloadError> {
        self.download_with(request, |_| {}).await
    }

    /// Like [`download`](Self::download), also reporting each parsed
    /// percentage to `on_progress`.
    ///
    /// At most one job runs per key. A request for a key that is already
    /// downloading waits for that job and shares its result; its
    /// `on_progress` is not called.
    pub async fn download_with<F>(
        &self,
        request: &DownloadRequest,
        mut on_progress: F,
    ) -> Result<DownloadResult, DownloadError>
    where
        F: FnMut(f64) + Send,
    {
        validate_video_id(&request.item_id)?;
        let key = request.job_key();
        let slot = match self.running.claim(&key) {
            Claim::Owner(slot) => slot,
            Claim::Joined(outcome) => return join_running(&key, outcome).await,
        };
        let mut parser = ProgressParser::new();
        info!(job = %key, "download requested");

        let result = match self.run(&key, request, &mut parser, &mut on_progress).await {
            Ok(result) => {
                self.progress.publish(&key, VideoProgress::completed(key.clone()));
                info!(job = %key, filename = ?result.filename, "download finished");
                Ok(result)
            }
            Err(err) => {
                let err = err.into_download_failure();
                error!(job = %key, %err, "download failed");
                self.progress.publish(
                    &key,
                    VideoProgress::failed(key.clone(), parser.last().unwrap_or(0.0), err.to_string()),
                );
                Err(err)
            }
        };
        slot.finish(&result);
        result
    }

    async fn run<F>(
        &self,
        key: &VideoJobKey,
        request: &DownloadRequest,
        parser: &mut ProgressParser,
        on_progress: &mut F,
    ) -> Result<DownloadResult, DownloadError>
    where
        F: FnMut(f64) + Send,
    {
        let metadata = self.metadata.fetch(&request.item_id).await?;

        let base = output_basename(&metadata.title);
        let target = self
            .output_dir
            .join(format!("{base}.{}", request.format.extension()));
        let args = build_download_args(&target, &request.quality, request.format);
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let progress = &self.progress;
        self.runner
            .run_download(&key.to_string(), &watch_url(&request.item_id), &args, |line| {
                for percent in parser.feed(line) {
                    progress.publish(key, VideoProgress::running(key.clone(), percent));
                    on_progress(percent);
                }
            })
            .await?;

        let filename = locate_output(&self.output_dir, &base).await?;
        let file_size = tokio::fs::metadata(self.output_dir.join(&filename))
            .await
            .ok()
            .map(|meta| meta.len());

        let entry = HistoryEntry::for_download(&metadata, &request.quality, request.format, file_size);
        if let Err(err) = self.history.add(entry).await {
            warn!(job = %key, %err, "could not record download history");
        }

        Ok(DownloadResult::completed(filename))
    }

    /// Pipes the best single-file format straight from yt-dlp's stdout.
    pub async fn stream(&self, item_id: &str) -> Result<(VideoMetadata, MediaStream), DownloadError> {
        let metadata = self.info(item_id).await?;
        let args = vec![
            "--format".to_string(),
            "best[ext=mp4]/best".to_string(),
            "--output".to_string(),
            "-".to_string(),
            "--quiet".to_string(),
            "--no-warnings".to_string(),
            "--no-part".to_string(),
        ];
        let stream = self.runner.stream(&watch_url(item_id), &args).await?;
        Ok((metadata, stream))
    }
}

/// yt-dlp format expression for a named quality tier.
pub fn quality_selector(quality: &str) -> String {
    match quality {
        "1080p" | "720p" | "480p" | "360p" | "144p" => {
            let height = quality.trim_end_matches('p');
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]/best")
        }
        _ => "bestvideo+bestaudio/best".to_string(),
    }
}

pub fn build_download_args(target: &Path, quality: &str, format: MediaFormat) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--output".into(),
        target.to_string_lossy().into_owned(),
        "--no-check-certificates".into(),
        "--no-warnings".into(),
        "--newline".into(),
        "--add-header".into(),
        "referer:youtube.com".into(),
        "--add-header".into(),
        USER_AGENT.into(),
    ];

    match format {
        MediaFormat::Audio => {
            args.extend(
                [
                    "--extract-audio",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "0",
                    "--embed-thumbnail",
                ]
                .map(String::from),
            );
        }
        MediaFormat::Video => {
            args.push("--format".into());
            args.push(quality_selector(quality));
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
    }
    args
}

/// Filesystem-safe title plus a random suffix so concurrent downloads of the
/// same video never share a name.
pub fn output_basename(title: &str) -> String {
    format!("{}_{}", sanitize_title(title), Uuid::new_v4())
}

pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned.to_string()
    }
}

const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

/// Finds the file yt-dlp wrote for `base`, skipping leftovers of interrupted
/// downloads.
pub async fn locate_output(dir: &Path, base: &str) -> Result<String, DownloadError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut matches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(base) && !PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            matches.push(name);
        }
    }
    matches.sort();
    matches
        .into_iter()
        .next()
        .ok_or_else(|| DownloadError::OutputMissing(base.to_string()))
}
