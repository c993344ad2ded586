//! Identifier shapes, job keys and request enums.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

static VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid video id regex"));
static PLAYLIST_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{2,64}$").expect("valid playlist id regex"));

pub fn watch_url(item_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={item_id}")
}

pub fn playlist_url(playlist_id: &str) -> String {
    format!("https://www.youtube.com/playlist?list={playlist_id}")
}

pub fn validate_video_id(value: &str) -> Result<(), DownloadError> {
    if value.trim().is_empty() {
        return Err(DownloadError::Validation("Video ID is required".into()));
    }
    if !VIDEO_ID_RE.is_match(value) {
        return Err(DownloadError::Validation("Invalid YouTube video ID".into()));
    }
    Ok(())
}

/// Shape check plus the category heuristics below.
pub fn validate_playlist_id(value: &str) -> Result<(), DownloadError> {
    if value.trim().is_empty() {
        return Err(DownloadError::Validation("Playlist ID is required".into()));
    }
    if !PLAYLIST_ID_RE.is_match(value) {
        return Err(DownloadError::Validation("Invalid YouTube playlist ID".into()));
    }
    if let Some(reason) = unsupported_playlist_reason(value) {
        return Err(DownloadError::UnsupportedPlaylist(reason.to_string()));
    }
    Ok(())
}

/// Auto-generated mixes and personal lists cannot be enumerated without an
/// account, so they are refused up front instead of failing inside yt-dlp.
pub fn unsupported_playlist_reason(playlist_id: &str) -> Option<&'static str> {
    if playlist_id.starts_with("RD") {
        return Some(
            "YouTube Mix and Radio playlists are generated per viewer and cannot be downloaded. Please use a regular playlist.",
        );
    }
    if playlist_id == "LL" || playlist_id == "WL" {
        return Some(
            "Liked videos and Watch Later are private lists and cannot be downloaded. Please use a public playlist.",
        );
    }
    None
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaFormat {
    type Err = DownloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "mp4" => Ok(Self::Video),
            "audio" | "audio-only" | "mp3" => Ok(Self::Audio),
            other => Err(DownloadError::Validation(format!(
                "Unsupported format '{other}'; expected video or audio"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for MediaFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies one single-video job's progress channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoJobKey {
    pub item_id: String,
    pub quality: String,
    pub format: MediaFormat,
}

impl VideoJobKey {
    pub fn new(item_id: impl Into<String>, quality: impl Into<String>, format: MediaFormat) -> Self {
        Self {
            item_id: item_id.into(),
            quality: quality.into(),
            format,
        }
    }
}

impl fmt::Display for VideoJobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.item_id, self.quality, self.format)
    }
}
