use rand::{distributions::Alphanumeric, thread_rng, Rng};
use reqwest::Url;
use std::{
    fs,
    path::{Path, PathBuf},
};
use sysinfo::{System, SystemExt};

pub const DEFAULT_API_BASE: &str = "https://dash.bunkr.cr/api";
pub const USER_AGENT: &str = "Mozilla/5.0";
pub const FORMAT_STRING: &str = "%Y%m%d_%H%M%S";
pub const LAST_VISITED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
pub const LOG_FILE_PREFIX: &str = "bunkr_refresh_log";
pub const FAILED_FILE_PREFIX: &str = "failed_urls";
pub const MAX_DEFAULT_WORKERS: usize = 6;
pub const DIAGNOSTIC_FAILURE_CAP: usize = 10;
pub const MAX_STALE_DAYS: i64 = 36500;

pub const VIDEO_EXTENSIONS: [&str; 6] = [".mp4", ".mkv", ".mov", ".webm", ".avi", ".m4v"];
pub const IMAGE_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];

lazy_static! {
    pub static ref API_BASE: String = match std::env::var("BUNKR_API_BASE") {
        Ok(base) if !base.trim().is_empty() => base.trim_end_matches('/').into(),
        _ => DEFAULT_API_BASE.into(),
    };
}

/// Lowercased extension including the leading dot, if any.
pub fn extension_of(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(file[idx..].to_lowercase()),
    }
}

/// Bunkr file pages live under `/f/<slug>` on any of the rotating bunkr
/// mirror domains.
pub fn is_bunkr_file_url(url: &str) -> bool {
    match Url::parse(url.trim()) {
        Ok(u) => {
            (u.scheme() == "https" || u.scheme() == "http")
                && u.host_str()
                    .map(|h| h.to_lowercase().contains("bunkr"))
                    .unwrap_or(false)
                && u.path().starts_with("/f/")
                && u.path().len() > "/f/".len()
        }
        Err(_) => false,
    }
}

pub fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    Path::new(&home)
        .join("bunkr_logs")
        .join("bunkr_album_refresh_logs")
}

pub fn default_workers() -> usize {
    let mut s = System::new();
    s.refresh_cpu();
    let cpus = s.cpus().len().max(1);
    cpus.min(MAX_DEFAULT_WORKERS)
}

pub fn get_random_string(len: i32) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len as usize)
        .map(char::from)
        .collect()
}

/// Fresh browser profile directory, removed again when the browser is dropped.
pub fn create_random_tmp_folder() -> anyhow::Result<PathBuf> {
    let rand_folder_name: String = get_random_string(11);

    let path = std::env::temp_dir().join(format!("bunkr-refresher-{}", rand_folder_name));
    fs::create_dir(&path)?;
    Ok(path)
}
