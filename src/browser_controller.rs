use anyhow::{anyhow, Context, Result};
use headless_chrome::{browser::default_executable, Browser, LaunchOptions};
use rand::Rng;
use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

use crate::{types::RefresherError, utils::create_random_tmp_folder};

const CHROME_ARGS: [&str; 7] = [
    "--disable-dev-shm-usage",
    "--proxy-server=direct://",
    "--proxy-bypass-list=*",
    "--disable-extensions",
    "--disable-blink-features=AutomationControlled",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
];

// resolves to false on chrome's blank or error documents
const HAS_CONTENT_SCRIPT: &str =
    "document.body !== null && document.documentElement.outerHTML.length > 0 && document.body.childElementCount > 0";

#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(setter(into))]
pub struct BrowserOptions {
    // explicit chrome binary, otherwise the default executable lookup is used
    #[builder(default = "None")]
    chrome_path: Option<PathBuf>,
    // page load timeout in seconds
    #[builder(default = "120")]
    page_load_timeout: u64,
    // minimum wait time after navigation in seconds
    #[builder(default = "2")]
    min_wait_after_navigation: u64,
    // maximum wait time after navigation in seconds
    #[builder(default = "5")]
    max_wait_after_navigation: u64,
    #[builder(default = "self.default_sandbox()")]
    sandbox: bool,
}

impl BrowserOptions {
    pub fn default_builder() -> BrowserOptionsBuilder {
        BrowserOptionsBuilder::default()
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout)
    }

    fn wait_range(&self) -> (u64, u64) {
        let min = self.min_wait_after_navigation;
        let max = self.max_wait_after_navigation.max(min);
        (min, max)
    }
}

impl BrowserOptionsBuilder {
    fn default_sandbox(&self) -> bool {
        sandbox_enabled()
    }
}

impl Default for BrowserOptions {
    fn default() -> Self {
        BrowserOptions {
            chrome_path: None,
            page_load_timeout: 120,
            min_wait_after_navigation: 2,
            max_wait_after_navigation: 5,
            sandbox: sandbox_enabled(),
        }
    }
}

// chrome's sandbox does not work inside most containers
fn sandbox_enabled() -> bool {
    std::env::var("IN_DOCKER").is_err()
}

pub struct BrowserController {
    browser: Browser,
    profile_dir: PathBuf,
    options: BrowserOptions,
}

impl BrowserController {
    pub fn new(options: BrowserOptions) -> Result<Self> {
        let path = match &options.chrome_path {
            Some(p) => p.clone(),
            None => default_executable()
                .map_err(|e| anyhow!("could not find a chrome binary: {}", e))?,
        };
        let profile_dir =
            create_random_tmp_folder().context("could not create browser profile directory")?;

        let launch_options = LaunchOptions::default_builder()
            .path(Some(path))
            .headless(true)
            .sandbox(options.sandbox)
            .window_size(Some((1920, 1080)))
            .user_data_dir(Some(profile_dir.clone()))
            .idle_browser_timeout(options.page_load_timeout())
            .args(CHROME_ARGS.into_iter().map(OsStr::new).collect::<Vec<&OsStr>>())
            .build()
            .map_err(|e| anyhow!("invalid launch options: {}", e))?;

        let browser = match Browser::new(launch_options) {
            Ok(b) => b,
            Err(e) => {
                let _ = fs::remove_dir_all(&profile_dir);
                return Err(e.context("browser launching error"));
            }
        };

        Ok(BrowserController {
            browser,
            profile_dir,
            options,
        })
    }

    /// Opens `url` in a fresh tab and lingers on it so the visit is counted.
    pub fn visit(&self, url: &str) -> Result<()> {
        let tab = self
            .browser
            .new_tab()
            .context("could not create new tab")?;
        tab.set_default_timeout(self.options.page_load_timeout());

        tab.navigate_to(url)
            .context(format!("could not navigate to {}", url))?;
        tab.wait_until_navigated()
            .context(format!("timed out waiting for {}", url))?;

        let landed = tab.get_url();
        if landed.starts_with("chrome-error://") {
            return Err(RefresherError::NavigationFailed {
                url: url.into(),
                landed,
            }
            .into());
        }

        let has_content = tab
            .evaluate(HAS_CONTENT_SCRIPT, false)
            .context(format!("could not inspect document of {}", url))?
            .value
            .and_then(|v: serde_json::Value| v.as_bool())
            .unwrap_or(false);
        if !has_content {
            return Err(RefresherError::EmptyResponse(url.into()).into());
        }

        let (min, max) = self.options.wait_range();
        let rndm = {
            let mut rng = rand::thread_rng();
            rng.gen_range(min..=max)
        };
        debug!("lingering on {} for {} seconds", url, rndm);
        sleep(Duration::from_secs(rndm));

        if let Err(e) = tab.close(true) {
            debug!("could not close tab for {}: {}", url, e);
        }
        Ok(())
    }

    pub fn kill(&self) -> bool {
        let pid = match self.browser.get_process_id() {
            Some(pid) => pid,
            None => return false,
        };
        let mut s = System::new();
        let pid = Pid::from_u32(pid);
        if !s.refresh_process(pid) {
            return false;
        }
        if let Some(process) = s.process(pid) {
            debug!("killing process with id {}", pid);
            return process.kill();
        }
        false
    }
}

impl Drop for BrowserController {
    fn drop(&mut self) {
        debug!("killing browser process...");
        self.kill();
        if let Err(e) = fs::remove_dir_all(&self.profile_dir) {
            debug!(
                "could not remove profile directory {:?}: {}",
                self.profile_dir, e
            );
        }
    }
}

/// Launches a browser once and shuts it down again.
pub fn probe(options: &BrowserOptions) -> Result<()> {
    let browser = BrowserController::new(options.clone())?;
    debug!(
        "browser preflight ok, version {:?}",
        browser.browser.get_version().map(|v| v.product).ok()
    );
    Ok(())
}
