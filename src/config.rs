use std::{collections::HashSet, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

use crate::quota::DEFAULT_DAILY_LIMIT_BYTES;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 180;
pub const DEFAULT_MAX_FILESIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_FILE_EXPIRATION_SECONDS: u64 = 3600;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
/// Local front-end dev servers, allowed when `ALLOWED_ORIGINS` is unset.
pub const DEV_ALLOWED_ORIGINS: &[&str] = &["http://127.0.0.1:5173", "http://localhost:5173"];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub downloads_dir: PathBuf,
    pub quota_file: PathBuf,
    pub downloader_path: PathBuf,
    pub max_concurrent_downloads: usize,
    pub download_timeout: Duration,
    pub metadata_timeout: Duration,
    pub max_filesize_bytes: u64,
    pub daily_quota_bytes: u64,
    pub file_expiration_seconds: u64,
    pub task_retention_seconds: u64,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub api_keys: HashSet<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

        Self {
            bind_addr: resolve_bind_addr(),
            downloads_dir: read_path_env("DOWNLOADS_DIR").unwrap_or_else(|| root.join("downloads")),
            quota_file: read_path_env("QUOTA_FILE")
                .unwrap_or_else(|| root.join("data").join("quota.json")),
            downloader_path: read_path_env("YT_DLP_PATH").unwrap_or_else(|| PathBuf::from("yt-dlp")),
            max_concurrent_downloads: read_parsed_env::<usize>("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            download_timeout: Duration::from_secs(
                read_u64_env("DOWNLOAD_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            ),
            metadata_timeout: Duration::from_secs(
                read_u64_env("METADATA_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_METADATA_TIMEOUT_SECONDS),
            ),
            max_filesize_bytes: read_u64_env("MAX_FILESIZE_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_FILESIZE_BYTES),
            daily_quota_bytes: read_u64_env("DAILY_QUOTA_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_DAILY_LIMIT_BYTES),
            file_expiration_seconds: read_u64_env("FILE_EXPIRATION_SECONDS")
                .unwrap_or(DEFAULT_FILE_EXPIRATION_SECONDS),
            task_retention_seconds: read_u64_env("TASK_RETENTION_SECONDS").unwrap_or(0),
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins: origins_or_dev_defaults(read_list_env("ALLOWED_ORIGINS")),
            api_keys: read_list_env("API_KEYS").into_iter().collect(),
        }
    }
}

fn read_bool_env(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    read_parsed_env(name)
}

fn read_parsed_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn read_path_env(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(non_empty)
        .map(ToString::to_string)
        .collect()
}

fn origins_or_dev_defaults(configured: Vec<String>) -> Vec<String> {
    if !configured.is_empty() {
        return configured;
    }
    warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
    DEV_ALLOWED_ORIGINS.iter().map(ToString::to_string).collect()
}

/// `APP_ADDR` wins, then `PORT` on all interfaces, then loopback.
fn resolve_bind_addr() -> String {
    let explicit = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string));

    explicit
        .or_else(|| read_parsed_env::<u16>("PORT").map(|port| format!("0.0.0.0:{port}")))
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
