//! Download history persisted as a single JSON file.
//!
//! Newest entries come first and the list is capped at
//! [`MAX_HISTORY_ENTRIES`]. Every mutation holds the same async mutex across
//! the file write, so concurrent completions cannot lose each other's entries.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DownloadError;
use crate::ids::MediaFormat;
use crate::metadata::VideoMetadata;

pub const MAX_HISTORY_ENTRIES: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub item_id: String,
    pub title: String,
    pub author: String,
    pub thumbnail: String,
    pub quality: String,
    pub format: String,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

impl HistoryEntry {
    pub fn for_download(
        metadata: &VideoMetadata,
        quality: &str,
        format: MediaFormat,
        file_size: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_id: metadata.item_id.clone(),
            title: metadata.title.clone(),
            author: metadata.author.clone(),
            thumbnail: metadata.thumbnail.clone(),
            quality: quality.to_string(),
            format: format.to_string(),
            downloaded_at: Utc::now(),
            file_size: file_size.map(format_file_size),
            duration_seconds: (metadata.duration_seconds > 0).then_some(metadata.duration_seconds),
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryStore {
    /// Loads the file if present. A missing or unreadable file starts an
    /// empty history rather than failing startup.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Vec<HistoryEntry>>(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "history file unreadable, starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn add(&self, entry: HistoryEntry) -> Result<(), DownloadError> {
        let mut entries = self.entries.lock().await;
        let mut updated = Vec::with_capacity(MAX_HISTORY_ENTRIES);
        updated.push(entry);
        updated.extend(entries.iter().take(MAX_HISTORY_ENTRIES - 1).cloned());
        write_json_atomic(&self.path, &updated).await?;
        *entries = updated;
        Ok(())
    }

    /// One page of history plus the total number of stored entries.
    pub async fn list(&self, limit: usize, offset: usize) -> (Vec<HistoryEntry>, usize) {
        let entries = self.entries.lock().await;
        let page = entries.iter().skip(offset).take(limit).cloned().collect();
        (page, entries.len())
    }

    /// Returns whether anything was removed. Unknown ids are not an error.
    pub async fn delete(&self, id: &str) -> Result<bool, DownloadError> {
        let mut entries = self.entries.lock().await;
        if !entries.iter().any(|entry| entry.id == id) {
            return Ok(false);
        }
        let updated: Vec<HistoryEntry> = entries
            .iter()
            .filter(|entry| entry.id != id)
            .cloned()
            .collect();
        write_json_atomic(&self.path, &updated).await?;
        *entries = updated;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<(), DownloadError> {
        let mut entries = self.entries.lock().await;
        write_json_atomic(&self.path, &Vec::<HistoryEntry>::new()).await?;
        entries.clear();
        info!(path = %self.path.display(), "download history cleared");
        Ok(())
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, payload).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::testing::sample_metadata;
    use tempfile::tempdir;

    fn entry(n: usize) -> HistoryEntry {
        let mut entry = HistoryEntry::for_download(
            &sample_metadata("dQw4w9WgXcQ", &format!("Video {n}")),
            "720p",
            MediaFormat::Video,
            Some(1024),
        );
        entry.id = format!("id-{n}");
        entry
    }

    #[tokio::test]
    async fn keeps_newest_hundred() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).await;
        for n in 0..105 {
            store.add(entry(n)).await.unwrap();
        }

        let (page, total) = store.list(200, 0).await;
        assert_eq!(total, 100);
        assert_eq!(page.len(), 100);
        assert_eq!(page.first().unwrap().id, "id-104");
        assert_eq!(page.last().unwrap().id, "id-5");
        for n in 0..5 {
            assert!(page.iter().all(|item| item.id != format!("id-{n}")));
        }
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/history.json");
        {
            let store = HistoryStore::open(&path).await;
            store.add(entry(1)).await.unwrap();
            store.add(entry(2)).await.unwrap();
        }
        let store = HistoryStore::open(&path).await;
        let (page, total) = store.list(DEFAULT_PAGE_SIZE, 0).await;
        assert_eq!(total, 2);
        assert_eq!(page[0].id, "id-2");
        assert_eq!(page[0].file_size.as_deref(), Some("1.00 KB"));
    }

    #[tokio::test]
    async fn pagination_uses_limit_and_offset() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).await;
        for n in 0..10 {
            store.add(entry(n)).await.unwrap();
        }
        let (page, total) = store.list(3, 2).await;
        assert_eq!(total, 10);
        let ids: Vec<_> = page.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["id-7", "id-6", "id-5"]);
    }

    #[tokio::test]
    async fn deleting_unknown_id_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).await;
        store.add(entry(1)).await.unwrap();

        assert!(!store.delete("missing").await.unwrap());
        assert_eq!(store.list(10, 0).await.1, 1);

        assert!(store.delete("id-1").await.unwrap());
        assert_eq!(store.list(10, 0).await.1, 0);
    }

    #[tokio::test]
    async fn clear_empties_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::open(&path).await;
        store.add(entry(1)).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.list(10, 0).await.1, 0);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[tokio::test]
    async fn concurrent_adds_are_all_kept() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(HistoryStore::open(dir.path().join("history.json")).await);
        let mut handles = Vec::new();
        for n in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.add(entry(n)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let reopened = HistoryStore::open(store.path()).await;
        assert_eq!(reopened.list(100, 0).await.1, 20);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = HistoryStore::open(&path).await;
        assert_eq!(store.list(10, 0).await.1, 0);
    }

    #[test]
    fn file_sizes_are_human_readable() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
    }
}
