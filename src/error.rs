//! Error taxonomy shared by every orchestration step.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Malformed identifier or missing field. Raised before any upstream call.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    UnsupportedPlaylist(String),

    #[error("No videos found in playlist")]
    EmptyPlaylist,

    #[error("{0}")]
    Playlist(String),

    /// The tool exited cleanly but nothing matching the requested name was
    /// written. Points at a tool behaviour change, not a user error.
    #[error("Downloaded file not found: {0}")]
    OutputMissing(String),

    #[error("yt-dlp not found at {0}; install it or set YTDLP_PATH")]
    ToolNotFound(String),

    #[error("yt-dlp failed with code {status}: {stderr}", status = exit_code_label(.code))]
    ProcessFailed { code: Option<i32>, stderr: String },

    #[error("yt-dlp did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to fetch video information: {0}")]
    Metadata(String),

    #[error("Failed to download video: {0}")]
    DownloadFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid yt-dlp output: {0}")]
    Json(#[from] serde_json::Error),
}

impl DownloadError {
    /// Wraps anything that is not a caller mistake into the single
    /// download-failed kind surfaced by the video endpoint.
    pub fn into_download_failure(self) -> Self {
        match self {
            Self::Validation(_) | Self::DownloadFailed(_) => self,
            other => Self::DownloadFailed(other.to_string()),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnsupportedPlaylist(_))
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string())
}
