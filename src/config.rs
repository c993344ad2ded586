#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:4200";
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_MAX_FILE_AGE_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_HISTORY_FILE: &str = "download-history.json";
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 2 * 60 * 60;

/// Everything the backend needs to know before it binds a socket.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub port: u16,
    pub host: String,
    pub cors_origin: String,
    pub cleanup_interval: Duration,
    pub max_file_age: Duration,
    pub downloads_dir: PathBuf,
    pub history_file: PathBuf,
    pub ytdlp_path: PathBuf,
    pub max_concurrent: usize,
    pub download_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            max_file_age: Duration::from_millis(DEFAULT_MAX_FILE_AGE_MS),
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            history_file: PathBuf::from(DEFAULT_HISTORY_FILE),
            ytdlp_path: PathBuf::from(DEFAULT_YTDLP_PATH),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
        }
    }
}

/// Values supplied on the command line. They win over the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub downloads_dir: Option<PathBuf>,
    pub history_file: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let defaults = RuntimeSettings::default();
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let port = match overrides.port {
        Some(port) => port,
        None => match lookup("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT must be a number between 0 and 65535, got {raw}"))?,
            None => defaults.port,
        },
    };
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("HOST"))
        .unwrap_or(defaults.host);
    let cors_origin = lookup("CORS_ORIGIN").unwrap_or(defaults.cors_origin);
    let cleanup_interval = lookup_millis("CLEANUP_INTERVAL", &lookup)?
        .unwrap_or(defaults.cleanup_interval);
    let max_file_age = lookup_millis("MAX_FILE_AGE", &lookup)?.unwrap_or(defaults.max_file_age);
    let downloads_dir = overrides
        .downloads_dir
        .or_else(|| lookup("DOWNLOADS_DIR").map(PathBuf::from))
        .unwrap_or(defaults.downloads_dir);
    let history_file = overrides
        .history_file
        .or_else(|| lookup("HISTORY_FILE").map(PathBuf::from))
        .unwrap_or(defaults.history_file);
    let ytdlp_path = overrides
        .ytdlp_path
        .or_else(|| lookup("YTDLP_PATH").map(PathBuf::from))
        .unwrap_or(defaults.ytdlp_path);
    let max_concurrent = match lookup("MAX_CONCURRENT_DOWNLOADS") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(0) | Err(_) => {
                return Err(anyhow!(
                    "MAX_CONCURRENT_DOWNLOADS must be a positive integer, got {raw}"
                ));
            }
            Ok(value) => value,
        },
        None => defaults.max_concurrent,
    };
    let download_timeout = match lookup("DOWNLOAD_TIMEOUT_SECS") {
        Some(raw) => Duration::from_secs(
            raw.parse::<u64>()
                .with_context(|| format!("DOWNLOAD_TIMEOUT_SECS must be a number, got {raw}"))?,
        ),
        None => defaults.download_timeout,
    };

    Ok(RuntimeSettings {
        port,
        host,
        cors_origin,
        cleanup_interval,
        max_file_age,
        downloads_dir,
        history_file,
        ytdlp_path,
        max_concurrent,
        download_timeout,
    })
}

fn lookup_millis(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<Duration>> {
    lookup(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("{key} must be a number of milliseconds, got {raw}"))
        })
        .transpose()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
