use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::Context;
use chrono::{Duration, Utc};
use itertools::Itertools;
use tokio::task;

use crate::{
    browser_controller::{probe, BrowserOptions},
    dashboard::{Dashboard, DashboardOptions},
    run_log::{read_retry_file, read_url_list, RunLog, RunLogPaths},
    types::{KindFilter, RefresherError, RunSummary, UrlEntry, VisitRecord},
    utils::{default_log_dir, API_BASE, MAX_STALE_DAYS},
    visitor::{BrowserVisitor, PageVisitor, PoolOptions, VisitPool},
};

/// Where the urls of a run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSource {
    /// Stale uploads listed by the dashboard api.
    Dashboard,
    /// Plain text file, one url per line.
    UrlList(PathBuf),
    /// Failure log of an earlier run.
    RetryFile(PathBuf),
}

#[derive(Builder, Debug)]
#[builder(setter(into))]
pub struct RunnerOptions {
    #[builder(default = "UrlSource::Dashboard")]
    source: UrlSource,
    #[builder(default = "KindFilter::All")]
    filter: KindFilter,
    // files not visited for this many days are refreshed
    #[builder(default = "7")]
    stale_days: i64,
    #[builder(default = "None")]
    api_token: Option<String>,
    #[builder(default = "self.default_api_base()")]
    api_base: String,
    // directory the csv logs are written to
    #[builder(default = "self.default_log_dir()")]
    log_dir: PathBuf,
    #[builder(default = "self.default_pool()")]
    pool: PoolOptions,
    #[builder(default = "self.default_browser()")]
    browser: BrowserOptions,
    // launch a browser once before the run and abort if that fails
    #[builder(default = "true")]
    preflight: bool,
}

impl RunnerOptions {
    pub fn default_builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

impl RunnerOptionsBuilder {
    fn default_api_base(&self) -> String {
        API_BASE.clone()
    }
    fn default_log_dir(&self) -> PathBuf {
        default_log_dir()
    }
    fn default_pool(&self) -> PoolOptions {
        PoolOptions::default()
    }
    fn default_browser(&self) -> BrowserOptions {
        BrowserOptions::default()
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub records: Vec<VisitRecord>,
    pub paths: Option<RunLogPaths>,
}

pub struct Runner {
    options: RunnerOptions,
    visitor: Arc<dyn PageVisitor>,
    should_terminate: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(options: RunnerOptions, should_terminate: Arc<AtomicBool>) -> Self {
        let visitor = Arc::new(BrowserVisitor::new(options.browser.clone()));
        Self::with_visitor(options, visitor, should_terminate)
    }

    pub fn with_visitor(
        options: RunnerOptions,
        visitor: Arc<dyn PageVisitor>,
        should_terminate: Arc<AtomicBool>,
    ) -> Self {
        Runner {
            options,
            visitor,
            should_terminate,
        }
    }

    pub async fn collect_urls(&self) -> anyhow::Result<Vec<String>> {
        let entries = match &self.options.source {
            UrlSource::Dashboard => {
                let threshold = stale_threshold(self.options.stale_days)?;
                info!("fetching stale uploads");
                let token = self
                    .options
                    .api_token
                    .clone()
                    .ok_or(RefresherError::MissingApiToken)?;
                let dashboard = Dashboard::new(
                    DashboardOptions::default_builder()
                        .api_base(self.options.api_base.clone())
                        .token(token)
                        .build()?,
                )?;
                dashboard
                    .stale_uploads(
                        threshold,
                        self.options.filter,
                        Utc::now(),
                    )
                    .await
            }
            UrlSource::UrlList(path) => {
                let urls = read_url_list(path)?;
                info!("loaded {} urls from {:?}", urls.len(), path);
                filter_entries(
                    urls.iter().map(|u| UrlEntry::from_url(u)).collect(),
                    self.options.filter,
                )
            }
            UrlSource::RetryFile(path) => {
                if self.options.filter != KindFilter::All {
                    warn!("file-type filters are not applied when retrying failures");
                }
                let urls = read_retry_file(path)
                    .context(format!("failed to read retry file {:?}", path))?;
                if urls.is_empty() {
                    warn!("no valid bunkr urls found in retry file {:?}", path);
                } else {
                    info!("retrying {} failed urls from {:?}", urls.len(), path);
                }
                urls.iter().map(|u| UrlEntry::from_url(u)).collect()
            }
        };

        Ok(entries
            .into_iter()
            .map(|e| e.url)
            .unique()
            .collect())
    }

    /// Runs one refresh pass. Returns `None` when there was nothing to visit,
    /// in which case no log is written.
    pub async fn run(&self) -> anyhow::Result<Option<RunReport>> {
        let urls = self.collect_urls().await?;
        if urls.is_empty() {
            info!("no stale files found, skipping processing and log creation");
            return Ok(None);
        }
        info!("processing {} stale files", urls.len());

        if self.options.preflight {
            let browser = self.options.browser.clone();
            task::spawn_blocking(move || probe(&browser))
                .await?
                .context("could not launch the headless browser")?;
        }

        let pool = VisitPool::new(
            self.visitor.clone(),
            self.options.pool.clone(),
            self.should_terminate.clone(),
        );
        let records = pool.run(urls).await;
        let summary = RunSummary::from_records(&records);

        let paths = match RunLog::new(&self.options.log_dir).write(&records, Utc::now()) {
            Ok(paths) => {
                match &paths.failed {
                    Some(failed) => info!("failures saved to {:?}", failed),
                    None => info!("no failures to log"),
                }
                info!("log saved to {:?}", paths.log);
                Some(paths)
            }
            Err(e) => {
                error!("error writing logs: {:#}", e);
                None
            }
        };

        info!(
            "finished: {} attempted, {} OK, {} failed, {} skipped",
            summary.attempted, summary.ok, summary.failed, summary.skipped
        );

        Ok(Some(RunReport {
            summary,
            records,
            paths,
        }))
    }
}

/// Age after which an upload counts as stale, bounded to what chrono can hold.
pub fn stale_threshold(days: i64) -> anyhow::Result<Duration> {
    if !(0..=MAX_STALE_DAYS).contains(&days) {
        return Err(RefresherError::InvalidStaleDays(days).into());
    }
    Ok(Duration::days(days))
}

/// Drops the entries whose file kind the filter excludes.
pub fn filter_entries(entries: Vec<UrlEntry>, filter: KindFilter) -> Vec<UrlEntry> {
    let before = entries.len();
    let kept = entries
        .into_iter()
        .filter(|e| filter.allows(e.kind))
        .collect::<Vec<UrlEntry>>();
    if kept.len() != before {
        debug!(
            "{:?} excluded {} of {} urls",
            filter,
            before - kept.len(),
            before
        );
    }
    kept
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::FileKind;

    #[test]
    fn filters_by_kind() {
        let entries = vec![
            UrlEntry::from_url("https://cdn.example.com/a.mp4"),
            UrlEntry::from_url("https://cdn.example.com/b.png"),
            UrlEntry::from_url("https://bunkr.pk/f/c"),
        ];
        assert_eq!(filter_entries(entries.clone(), KindFilter::All).len(), 3);

        let videos = filter_entries(entries.clone(), KindFilter::VideosOnly);
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].kind, FileKind::Video);

        let images = filter_entries(entries, KindFilter::ImagesOnly);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "https://cdn.example.com/b.png");
    }

    #[test]
    fn builder_defaults() {
        let o = RunnerOptions::default_builder().build().unwrap();
        assert_eq!(o.source, UrlSource::Dashboard);
        assert_eq!(o.stale_days, 7);
        assert!(o.preflight);
        assert!(o.log_dir.ends_with("bunkr_logs/bunkr_album_refresh_logs"));
    }

    #[test]
    fn stale_days_out_of_range_is_an_error() {
        assert_eq!(stale_threshold(7).unwrap(), Duration::days(7));
        assert_eq!(stale_threshold(0).unwrap(), Duration::zero());
        for days in [-1, MAX_STALE_DAYS + 1, 100_000_000_000_000, i64::MAX] {
            let err = stale_threshold(days).err().unwrap();
            assert!(matches!(
                err.downcast_ref::<RefresherError>(),
                Some(RefresherError::InvalidStaleDays(d)) if *d == days
            ));
        }

        let o = RunnerOptions::default_builder()
            .stale_days(i64::MAX)
            .api_token(Some("token".to_string()))
            .build()
            .unwrap();
        let runner = Runner::new(o, Arc::new(AtomicBool::new(false)));
        assert!(tokio_test::block_on(runner.collect_urls()).is_err());
    }

    #[test]
    fn dashboard_requires_a_token() {
        let o = RunnerOptions::default_builder().build().unwrap();
        let runner = Runner::new(o, Arc::new(AtomicBool::new(false)));
        let err = tokio_test::block_on(runner.collect_urls()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<RefresherError>(),
            Some(RefresherError::MissingApiToken)
        ));
    }
}
