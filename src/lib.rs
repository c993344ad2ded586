#![forbid(unsafe_code)]

//! Download orchestration around the `yt-dlp` command-line tool.
//!
//! The `backend` binary exposes these pieces over HTTP; everything that
//! spawns processes, tracks progress or touches the download history lives in
//! this library so it can be exercised without a running server.

pub mod broadcast;
pub mod cleanup;
pub mod config;
pub mod download;
pub mod error;
pub mod history;
pub mod ids;
pub mod logging;
pub mod metadata;
pub mod playlist;
pub mod process;
pub mod progress;
