use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::{
    types::{RefresherError, RunSummary, VisitRecord, VisitStatus},
    utils::{is_bunkr_file_url, FAILED_FILE_PREFIX, FORMAT_STRING, LOG_FILE_PREFIX},
};

const HEADER: [&str; 4] = ["URL", "Status", "Reason", "Timestamp"];
const URL_COLUMN: &str = "URL";

#[derive(Debug)]
pub struct RunLogPaths {
    pub log: PathBuf,
    pub failed: Option<PathBuf>,
}

/// CSV sink for the outcome of a run. Each run gets its own timestamped file,
/// failures are additionally split out in a file `--retry-failed` accepts.
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: &Path) -> Self {
        RunLog { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, at: &DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", LOG_FILE_PREFIX, at.format(FORMAT_STRING)))
    }

    pub fn failed_path(&self, at: &DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", FAILED_FILE_PREFIX, at.format(FORMAT_STRING)))
    }

    pub fn write(&self, records: &[VisitRecord], at: DateTime<Utc>) -> anyhow::Result<RunLogPaths> {
        fs::create_dir_all(&self.dir)
            .context(format!("could not create log directory {:?}", self.dir))?;

        let log = self.log_path(&at);
        Self::write_records(&log, records.iter())?;

        let summary = RunSummary::from_records(records);
        let failed = if summary.failed > 0 {
            let path = self.failed_path(&at);
            Self::write_records(
                &path,
                records.iter().filter(|r| r.status == VisitStatus::Failed),
            )?;
            Some(path)
        } else {
            None
        };

        Ok(RunLogPaths { log, failed })
    }

    fn write_records<'a>(
        path: &Path,
        records: impl Iterator<Item = &'a VisitRecord>,
    ) -> anyhow::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .context(format!("could not open log file {:?}", path))?;
        writer.write_record(HEADER)?;
        for record in records {
            writer
                .serialize(record)
                .context(format!("could not write record for {}", record.url))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Plain url list, one per line. Blank lines and `#` comments are ignored.
pub fn read_url_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let content =
        fs::read_to_string(path).context(format!("could not read url list {:?}", path))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Reads the `URL` column of a previous failure log, keeping only bunkr file urls.
pub fn read_retry_file(path: &Path) -> anyhow::Result<Vec<String>> {
    if !path.is_file() {
        return Err(RefresherError::RetryFileNotFound(path.display().to_string()).into());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .context(format!("could not open retry file {:?}", path))?;

    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == URL_COLUMN)
        .ok_or_else(|| RefresherError::MissingColumn(path.display().to_string()))?;

    let mut urls = vec![];
    for row in reader.records() {
        let row = row.context(format!("malformed row in retry file {:?}", path))?;
        match row.get(column).map(str::trim) {
            Some(url) if is_bunkr_file_url(url) => urls.push(url.to_string()),
            Some(url) => debug!("ignoring non bunkr url {:?} in retry file", url),
            None => {}
        }
    }

    Ok(urls.into_iter().unique().collect())
}
