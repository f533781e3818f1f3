use anyhow::anyhow;
use futures::StreamExt;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tokio::{sync::mpsc, task};
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use crate::{
    browser_controller::{BrowserController, BrowserOptions},
    types::{VisitRecord, VisitStatus},
    utils::{default_workers, DIAGNOSTIC_FAILURE_CAP},
};

pub const EMPTY_URL: &str = "empty url";
pub const INTERRUPTED: &str = "interrupted";
pub const FAILURE_CAP_REACHED: &str = "diagnostic failure cap reached";

/// A single unit of work: open `url` once and report whether it loaded.
pub trait PageVisitor: Send + Sync {
    fn visit(&self, url: &str) -> anyhow::Result<()>;
}

/// Drives a fresh headless browser for every attempt, so no state leaks
/// between visits.
pub struct BrowserVisitor {
    options: BrowserOptions,
}

impl BrowserVisitor {
    pub fn new(options: BrowserOptions) -> Self {
        BrowserVisitor { options }
    }
}

impl PageVisitor for BrowserVisitor {
    fn visit(&self, url: &str) -> anyhow::Result<()> {
        let browser = BrowserController::new(self.options.clone())?;
        browser.visit(url)
    }
}

#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct PoolOptions {
    #[builder(default = "self.default_workers()")]
    workers: usize,
    // attempts per url outside of diagnostic mode
    #[builder(default = "3")]
    max_retries: usize,
    // single attempt per url and a cap on total failures
    #[builder(default = "false")]
    diagnostic: bool,
    #[builder(default = "DIAGNOSTIC_FAILURE_CAP")]
    failure_cap: usize,
    // first backoff delay, doubled on every further attempt
    #[builder(default = "1000")]
    backoff_ms: u64,
}

impl PoolOptions {
    pub fn default_builder() -> PoolOptionsBuilder {
        PoolOptionsBuilder::default()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn attempts(&self) -> usize {
        if self.diagnostic {
            1
        } else {
            self.max_retries.max(1)
        }
    }
}

impl PoolOptionsBuilder {
    fn default_workers(&self) -> usize {
        default_workers()
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            workers: default_workers(),
            max_retries: 3,
            diagnostic: false,
            failure_cap: DIAGNOSTIC_FAILURE_CAP,
            backoff_ms: 1000,
        }
    }
}

pub struct VisitPool {
    visitor: Arc<dyn PageVisitor>,
    options: PoolOptions,
    should_terminate: Arc<AtomicBool>,
}

impl VisitPool {
    pub fn new(
        visitor: Arc<dyn PageVisitor>,
        options: PoolOptions,
        should_terminate: Arc<AtomicBool>,
    ) -> Self {
        VisitPool {
            visitor,
            options,
            should_terminate,
        }
    }

    /// Visits every url with at most `workers` units in flight and returns
    /// exactly one record per url, in input order.
    pub async fn run(&self, urls: Vec<String>) -> Vec<VisitRecord> {
        let total = urls.len();
        if total == 0 {
            return vec![];
        }

        let (visit_url_tx, visit_url_rx) = mpsc::channel::<(usize, String)>(total);
        let (visited_tx, mut visited_rx) = mpsc::channel::<(usize, VisitRecord)>(total);

        for (idx, url) in urls.iter().enumerate() {
            if let Err(e) = visit_url_tx.send((idx, url.clone())).await {
                error!("could not queue url {}: {}", url, e);
            }
        }
        // the stream ends once the queue is drained
        drop(visit_url_tx);

        self.processor(visit_url_rx, visited_tx);

        let mut records: Vec<Option<VisitRecord>> = vec![None; total];
        let (mut ok, mut failed, mut done) = (0, 0, 0);
        while let Some((idx, record)) = visited_rx.recv().await {
            done += 1;
            let symbol = match record.status {
                VisitStatus::Ok => {
                    ok += 1;
                    "✓"
                }
                VisitStatus::Failed => {
                    failed += 1;
                    "✗"
                }
                VisitStatus::Skipped => "-",
            };
            info!(
                "[{}] {}/{} complete, OK: {} | Failed: {}",
                symbol, done, total, ok, failed
            );
            records[idx] = Some(record);
        }

        records
            .into_iter()
            .zip(urls.iter())
            .map(|(record, url)| match record {
                Some(r) => r,
                None => {
                    error!("no outcome was reported for {}", url);
                    VisitRecord::failed(url, "worker exited without a result")
                }
            })
            .collect()
    }

    fn processor(
        &self,
        visit_url_rx: mpsc::Receiver<(usize, String)>,
        visited_tx: mpsc::Sender<(usize, VisitRecord)>,
    ) {
        let options = self.options.clone();
        let visitor = self.visitor.clone();
        let should_terminate = self.should_terminate.clone();
        let failures = Arc::new(AtomicUsize::new(0));

        info!("starting visit pool with {} workers", options.workers);
        tokio::spawn(async move {
            tokio_stream::wrappers::ReceiverStream::new(visit_url_rx)
                .for_each_concurrent(options.workers.max(1), |(idx, url)| {
                    let options = options.clone();
                    let visitor = visitor.clone();
                    let should_terminate = should_terminate.clone();
                    let failures = failures.clone();
                    let visited_tx = visited_tx.clone();

                    async move {
                        let record = if url.trim().is_empty() {
                            VisitRecord::skipped(&url, EMPTY_URL)
                        } else if should_terminate.load(Ordering::Relaxed) {
                            VisitRecord::skipped(&url, INTERRUPTED)
                        } else if options.diagnostic
                            && failures.load(Ordering::SeqCst) >= options.failure_cap
                        {
                            VisitRecord::skipped(&url, FAILURE_CAP_REACHED)
                        } else {
                            // units already in flight when the cap is hit still finish,
                            // so up to `workers - 1` failures can land past the cap
                            let record =
                                Self::visit_with_retries(visitor, &url, &options, &should_terminate)
                                    .await;
                            if record.status == VisitStatus::Failed {
                                let n = failures.fetch_add(1, Ordering::SeqCst) + 1;
                                if options.diagnostic && n == options.failure_cap {
                                    warn!(
                                        "failure cap of {} reached in diagnostic mode, skipping remaining urls",
                                        n
                                    );
                                }
                            }
                            record
                        };

                        if let Err(e) = visited_tx.send((idx, record)).await {
                            error!("could not send to visited_tx {}", e);
                        }
                    }
                })
                .await;
        });
    }

    async fn visit_with_retries(
        visitor: Arc<dyn PageVisitor>,
        url: &str,
        options: &PoolOptions,
        should_terminate: &AtomicBool,
    ) -> VisitRecord {
        let attempts = options.attempts();
        // 1s, 2s, 4s ... with the default backoff
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(options.backoff_ms)
            .map(|d| d / 2)
            .take(attempts - 1);

        let mut attempt = 0;
        let res = RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                if options.diagnostic {
                    info!("[RETRY] Attempt {} for {}", attempt, url);
                } else {
                    debug!("attempt {}/{} for {}", attempt, attempts, url);
                }
                let visitor = visitor.clone();
                let u = url.to_string();
                async move {
                    let res = match task::spawn_blocking(move || visitor.visit(&u)).await {
                        Ok(r) => r,
                        Err(e) => Err(anyhow!("problem spawning a blocking thread {}", e)),
                    };
                    if let Err(e) = &res {
                        warn!("visit failed: {:#}", e);
                    }
                    res
                }
            },
            |_: &anyhow::Error| {
                if should_terminate.load(Ordering::Relaxed) {
                    info!("termination requested, not retrying {}", url);
                    return false;
                }
                true
            },
        )
        .await;

        match res {
            Ok(_) => VisitRecord::ok(url),
            Err(e) => VisitRecord::failed(url, &format!("{:#}", e)),
        }
    }
}
