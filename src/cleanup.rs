//! Retention sweep for the output directory.
//!
//! Produced files are only meant to live long enough for the client to fetch
//! them, so anything older than the configured age is deleted on a timer.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Starts the periodic sweep. The first pass runs after one full interval.
pub fn spawn_cleanup(dir: PathBuf, interval: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(dir = %dir.display(), ?interval, ?max_age, "cleanup task started");
        loop {
            ticker.tick().await;
            let target = dir.clone();
            let removed =
                tokio::task::spawn_blocking(move || sweep(&target, max_age, SystemTime::now())).await;
            match removed {
                Ok(0) => debug!("cleanup pass removed nothing"),
                Ok(count) => info!(count, "cleanup pass removed old files"),
                Err(err) => warn!(%err, "cleanup pass panicked"),
            }
        }
    })
}

/// Deletes regular files directly inside `dir` whose modification time is
/// more than `max_age` before `now`. Returns how many were removed.
pub fn sweep(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    if !dir.exists() {
        return 0;
    }

    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let modified = match entry.metadata().map(|meta| meta.modified()) {
            Ok(Ok(modified)) => modified,
            _ => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(file = %entry.path().display(), age_secs = age.as_secs(), "deleted old file");
                removed += 1;
            }
            Err(err) => warn!(file = %entry.path().display(), %err, "could not delete old file"),
        }
    }
    removed
}
