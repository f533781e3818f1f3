use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::{extension_of, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};

#[derive(Error, Debug)]
pub enum RefresherError {
    #[error("empty response from {0}")]
    EmptyResponse(String),
    #[error("navigation to {url} failed: landed on {landed}")]
    NavigationFailed { url: String, landed: String },
    #[error("retry file {0} is missing the 'URL' column")]
    MissingColumn(String),
    #[error("retry file not found: {0}")]
    RetryFileNotFound(String),
    #[error("an api token is required to list uploads from the dashboard")]
    MissingApiToken,
    #[error("stale days must be between 0 and 36500, got {0}")]
    InvalidStaleDays(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Video,
    Image,
    Other,
}

impl FileKind {
    /// Infers the kind from the suffix of a file name or url path.
    pub fn from_name(name: &str) -> FileKind {
        match extension_of(name) {
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => FileKind::Video,
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => FileKind::Image,
            _ => FileKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    All,
    VideosOnly,
    ImagesOnly,
}

impl KindFilter {
    pub fn from_flags(videos_only: bool, images_only: bool) -> KindFilter {
        match (videos_only, images_only) {
            (true, _) => KindFilter::VideosOnly,
            (_, true) => KindFilter::ImagesOnly,
            _ => KindFilter::All,
        }
    }

    pub fn allows(&self, kind: FileKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::VideosOnly => kind == FileKind::Video,
            KindFilter::ImagesOnly => kind == FileKind::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlEntry {
    pub url: String,
    pub kind: FileKind,
}

impl UrlEntry {
    pub fn new(url: &str, kind: FileKind) -> Self {
        UrlEntry {
            url: url.trim().to_string(),
            kind,
        }
    }

    /// Entry whose kind is taken from the url path itself.
    pub fn from_url(url: &str) -> Self {
        let kind = match reqwest::Url::parse(url.trim()) {
            Ok(u) => FileKind::from_name(u.path()),
            Err(_) => FileKind::from_name(url),
        };
        UrlEntry::new(url, kind)
    }
}

/// Listing entry as returned by the dashboard `uploads` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleUpload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub finalurl: Option<String>,
    #[serde(default)]
    pub last_visited_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadsPage {
    #[serde(default)]
    pub files: Vec<StaleUpload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitStatus::Ok => write!(f, "OK"),
            VisitStatus::Failed => write!(f, "FAILED"),
            VisitStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// One row of the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitRecord {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Status")]
    pub status: VisitStatus,
    #[serde(rename = "Reason")]
    pub reason: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl VisitRecord {
    pub fn ok(url: &str) -> Self {
        Self::with_status(url, VisitStatus::Ok, "")
    }

    pub fn failed(url: &str, reason: &str) -> Self {
        Self::with_status(url, VisitStatus::Failed, reason)
    }

    pub fn skipped(url: &str, reason: &str) -> Self {
        Self::with_status(url, VisitStatus::Skipped, reason)
    }

    fn with_status(url: &str, status: VisitStatus, reason: &str) -> Self {
        VisitRecord {
            url: url.into(),
            status,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn from_records(records: &[VisitRecord]) -> Self {
        records.iter().fold(RunSummary::default(), |mut s, r| {
            match r.status {
                VisitStatus::Ok => s.ok += 1,
                VisitStatus::Failed => s.failed += 1,
                VisitStatus::Skipped => s.skipped += 1,
            }
            s.attempted = s.ok + s.failed;
            s
        })
    }
}
