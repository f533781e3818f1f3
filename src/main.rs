use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use log::{debug, info};
use refresher::{
    browser_controller::BrowserOptions,
    runner::{Runner, RunnerOptions, UrlSource},
    types::KindFilter,
    utils::{default_workers, MAX_STALE_DAYS},
    visitor::PoolOptions,
};
use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Keeps Bunkr uploads alive by visiting them with a headless browser", long_about = None)]
struct Args {
    /// Only include video files
    #[arg(long, conflicts_with = "images_only")]
    videos_only: bool,
    /// Only include image files
    #[arg(long)]
    images_only: bool,
    /// One attempt per url, verbose attempts and stop after 10 failures
    #[arg(long)]
    diagnostic: bool,
    /// CSV file of failed URLs to retry
    #[arg(long, conflicts_with_all = ["videos_only", "images_only", "urls"])]
    retry_failed: Option<PathBuf>,
    /// Plain text file with one URL per line, instead of asking the dashboard
    #[arg(long)]
    urls: Option<PathBuf>,
    /// Number of concurrent browsers, defaults to min(6, cpu count)
    #[arg(short = 'w', long)]
    workers: Option<usize>,
    /// Number of attempts per URL outside of diagnostic mode
    #[arg(short = 'r', long, default_value_t = 3)]
    retries: usize,
    /// Files not visited for this many days are refreshed
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(0..=MAX_STALE_DAYS))]
    stale_days: i64,
    /// Maximum time in seconds to wait for a page to load
    #[arg(long, default_value_t = 120)]
    page_load_timeout: u64,
    /// Minimum time in seconds to wait after a tab navigates to a page
    #[arg(long, default_value_t = 2)]
    min_wait_after_navigation: u64,
    /// Maximum time in seconds to wait after a tab navigates to a page
    #[arg(long, default_value_t = 5)]
    max_wait_after_navigation: u64,
    /// Chrome binary to use instead of the default lookup
    #[arg(long)]
    chrome_path: Option<PathBuf>,
    /// Disable the chrome sandbox (implied by IN_DOCKER)
    #[arg(long)]
    no_sandbox: bool,
    /// Directory the run logs are written to
    #[arg(short = 'd', long, env = "BUNKR_LOG_DIR")]
    log_dir: Option<PathBuf>,
    /// Dashboard api token
    #[arg(long, env = "BUNKR_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match std::env::var("RUST_LOG") {
        Ok(env) => {
            if env == "debug" {
                println!("{number:/>width$}", number = "", width = 20);
                println!("{}", "Debug mode enabled");
                println!("{number:/>width$}", number = "", width = 20);
                println!();
            }
        }
        _ => {}
    }

    let source = match (&args.retry_failed, &args.urls) {
        (Some(path), _) => UrlSource::RetryFile(path.clone()),
        (None, Some(path)) => UrlSource::UrlList(path.clone()),
        (None, None) => UrlSource::Dashboard,
    };

    let mut browser = BrowserOptions::default_builder();
    browser
        .chrome_path(args.chrome_path.clone())
        .page_load_timeout(args.page_load_timeout)
        .min_wait_after_navigation(args.min_wait_after_navigation)
        .max_wait_after_navigation(args.max_wait_after_navigation);
    if args.no_sandbox {
        browser.sandbox(false);
    }

    let pool = PoolOptions::default_builder()
        .workers(args.workers.unwrap_or_else(default_workers))
        .max_retries(args.retries)
        .diagnostic(args.diagnostic)
        .build()?;

    debug!("Starting refresher from {:?} with {:#?}", source, pool);

    let mut options = RunnerOptions::default_builder();
    options
        .source(source)
        .filter(KindFilter::from_flags(args.videos_only, args.images_only))
        .stale_days(args.stale_days)
        .api_token(args.api_token.clone())
        .pool(pool)
        .browser(browser.build()?);
    if let Some(dir) = &args.log_dir {
        options.log_dir(dir.clone());
    }
    let options = options.build()?;

    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

    let runner = Runner::new(options, should_terminate);
    if let Some(report) = runner.run().await? {
        info!(
            "{} of {} urls refreshed",
            report.summary.ok,
            report.records.len()
        );
    }

    Ok(())
}
