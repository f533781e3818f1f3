use anyhow::anyhow;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use itertools::Itertools;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT},
    Client, StatusCode,
};

use crate::{
    types::{FileKind, KindFilter, RefresherError, StaleUpload, UploadsPage, UrlEntry},
    utils::{API_BASE, LAST_VISITED_FORMAT, USER_AGENT as BROWSER_USER_AGENT},
};

pub struct Dashboard {
    client: Client,
    api_base: String,
    token: String,
}

#[derive(Builder, Debug)]
#[builder(setter(into))]
pub struct DashboardOptions {
    #[builder(default = "self.default_api_base()")]
    api_base: String,
    token: String,
    #[builder(default = "self.default_client()")]
    client: Client,
}

impl DashboardOptions {
    pub fn default_builder() -> DashboardOptionsBuilder {
        DashboardOptionsBuilder::default()
    }
}

impl DashboardOptionsBuilder {
    fn default_api_base(&self) -> String {
        API_BASE.clone()
    }
    fn default_client(&self) -> Client {
        Client::new()
    }
}

impl Dashboard {
    pub fn new(lo: DashboardOptions) -> anyhow::Result<Self> {
        if lo.token.trim().is_empty() {
            return Err(RefresherError::MissingApiToken.into());
        }
        Ok(Dashboard {
            client: lo.client,
            api_base: lo.api_base.trim_end_matches('/').into(),
            token: lo.token,
        })
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("token", HeaderValue::from_str(&self.token)?);
        Ok(headers)
    }

    pub async fn uploads_page(&self, page: usize) -> anyhow::Result<Vec<StaleUpload>> {
        let res = self
            .client
            .get(format!("{}/uploads/{}", self.api_base, page))
            .headers(self.headers()?)
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::OK {
            let listing = res.json::<UploadsPage>().await?;
            return Ok(listing.files);
        } else {
            return Err(anyhow!(
                "uploads page {} returned {}: {}",
                page,
                status,
                res.text().await?
            ));
        }
    }

    /// Walks every uploads page and keeps the files that were not visited
    /// within `threshold` and whose kind passes `filter`.
    pub async fn stale_uploads(
        &self,
        threshold: Duration,
        filter: KindFilter,
        now: DateTime<Utc>,
    ) -> Vec<UrlEntry> {
        let mut uploads = vec![];
        let mut page = 0;
        loop {
            let files = match self.uploads_page(page).await {
                Ok(f) => f,
                Err(e) => {
                    warn!("stopping at uploads page {}: {}", page, e);
                    break;
                }
            };
            if files.is_empty() {
                break;
            }
            debug!("uploads page {} listed {} files", page, files.len());
            uploads.extend(select_stale(&files, threshold, filter, now));
            page += 1;
        }

        uploads
            .into_iter()
            .unique_by(|e| e.url.clone())
            .collect()
    }
}

pub fn parse_last_visited(last_visited_at: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(last_visited_at, LAST_VISITED_FORMAT)
        .ok()
        .map(|ts| Utc.from_utc_datetime(&ts))
}

pub fn is_stale(last_visited: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now - last_visited > threshold
}

pub fn select_stale(
    files: &[StaleUpload],
    threshold: Duration,
    filter: KindFilter,
    now: DateTime<Utc>,
) -> Vec<UrlEntry> {
    files
        .iter()
        .filter_map(|f| {
            let last = parse_last_visited(f.last_visited_at.as_deref()?)?;
            if !is_stale(last, now, threshold) {
                return None;
            }
            // only media files expire, everything else is left alone
            let kind = FileKind::from_name(&f.name);
            if kind == FileKind::Other || !filter.allows(kind) {
                return None;
            }
            let url = f.finalurl.as_deref().unwrap_or_default();
            Some(UrlEntry::new(url, kind))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn upload(name: &str, url: &str, last: Option<&str>) -> StaleUpload {
        StaleUpload {
            name: name.into(),
            finalurl: Some(url.into()),
            last_visited_at: last.map(String::from),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_dashboard_timestamps() {
        let ts = parse_last_visited("2024-03-01T08:30:00.000Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap());
        assert!(parse_last_visited("yesterday").is_none());
    }

    #[test]
    fn stale_threshold() {
        let week = Duration::days(7);
        let eight_days_ago = now() - Duration::days(8);
        let six_days_ago = now() - Duration::days(6);
        assert!(is_stale(eight_days_ago, now(), week));
        assert!(!is_stale(six_days_ago, now(), week));
        assert!(!is_stale(now() - week, now(), week));
    }

    #[test]
    fn selects_only_stale_files_matching_filter() {
        let files = vec![
            upload("a.mp4", "https://bunkr.pk/f/a", Some("2024-03-01T00:00:00.000Z")),
            upload("b.jpg", "https://bunkr.pk/f/b", Some("2024-03-01T00:00:00.000Z")),
            upload("c.mp4", "https://bunkr.pk/f/c", Some("2024-03-19T00:00:00.000Z")),
            upload("d.zip", "https://bunkr.pk/f/d", Some("2024-03-01T00:00:00.000Z")),
            upload("e.mov", "https://bunkr.pk/f/e", None),
            upload("f.mkv", "https://bunkr.pk/f/f", Some("garbage")),
        ];

        let all = select_stale(&files, Duration::days(7), KindFilter::All, now());
        let urls = all.iter().map(|e| e.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec!["https://bunkr.pk/f/a", "https://bunkr.pk/f/b"]
        );

        let videos = select_stale(&files, Duration::days(7), KindFilter::VideosOnly, now());
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].kind, FileKind::Video);

        let images = select_stale(&files, Duration::days(7), KindFilter::ImagesOnly, now());
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "https://bunkr.pk/f/b");
    }

    #[test]
    fn decodes_uploads_page() -> anyhow::Result<()> {
        let body = r#"{"success":true,"files":[
            {"name":"a.mp4","finalurl":"https://bunkr.pk/f/a","last_visited_at":"2024-03-01T00:00:00.000Z","size":"1024"},
            {"name":"b.png","last_visited_at":null}
        ]}"#;
        let page: UploadsPage = serde_json::from_str(body)?;
        assert_eq!(page.files.len(), 2);
        assert_eq!(page.files[0].finalurl.as_deref(), Some("https://bunkr.pk/f/a"));
        assert!(page.files[1].finalurl.is_none());
        assert!(page.files[1].last_visited_at.is_none());

        let empty: UploadsPage = serde_json::from_str(r#"{"success":true}"#)?;
        assert!(empty.files.is_empty());
        Ok(())
    }

    #[test]
    fn missing_token_is_rejected() {
        let options = DashboardOptions::default_builder()
            .token("  ")
            .build()
            .unwrap();
        let err = Dashboard::new(options).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<RefresherError>(),
            Some(RefresherError::MissingApiToken)
        ));
    }

    const EMPTY_PAGE: &str = r#"{"success":true,"files":[]}"#;

    // serves `pages[n]` for `GET /uploads/n` and an empty listing past the end,
    // recording every requested page number
    async fn serve_pages(pages: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<usize>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requested = Arc::new(Mutex::new(vec![]));
        let seen = requested.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                assert!(request.contains("token: secret"));
                let page = request
                    .split_whitespace()
                    .nth(1)
                    .and_then(|p| p.rsplit('/').next())
                    .and_then(|p| p.parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                seen.lock().unwrap().push(page);
                let (status, body) = pages
                    .get(page)
                    .cloned()
                    .unwrap_or((200, EMPTY_PAGE.to_string()));
                let reason = if status == 200 { "OK" } else { "Internal Server Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), requested)
    }

    fn page(files: &[(&str, &str)]) -> (u16, String) {
        let files = files
            .iter()
            .map(|(name, url)| {
                serde_json::json!({
                    "name": name,
                    "finalurl": url,
                    "last_visited_at": "2024-03-01T00:00:00.000Z",
                })
            })
            .collect::<Vec<_>>();
        (200, serde_json::json!({ "success": true, "files": files }).to_string())
    }

    fn dashboard(api_base: String) -> Dashboard {
        Dashboard::new(
            DashboardOptions::default_builder()
                .api_base(api_base)
                .token("secret")
                .client(Client::builder().no_proxy().build().unwrap())
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn pages_until_empty_and_collapses_duplicates() {
        let entries = tokio_test::block_on(async {
            let (base, requested) = serve_pages(vec![
                page(&[
                    ("a.mp4", "https://bunkr.pk/f/a"),
                    ("b.jpg", "https://bunkr.pk/f/b"),
                ]),
                page(&[
                    ("a.mp4", "https://bunkr.pk/f/a"),
                    ("c.zip", "https://bunkr.pk/f/c"),
                    ("d.webm", "https://bunkr.pk/f/d"),
                ]),
            ])
            .await;
            let entries = dashboard(base)
                .stale_uploads(Duration::days(7), KindFilter::All, now())
                .await;
            assert_eq!(*requested.lock().unwrap(), vec![0, 1, 2]);
            entries
        });

        let urls = entries.iter().map(|e| e.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec!["https://bunkr.pk/f/a", "https://bunkr.pk/f/b", "https://bunkr.pk/f/d"]
        );
        assert_eq!(entries[1].kind, FileKind::Image);
    }

    #[test]
    fn keeps_collected_uploads_when_a_page_fails() {
        let entries = tokio_test::block_on(async {
            let (base, requested) = serve_pages(vec![
                page(&[("a.mp4", "https://bunkr.pk/f/a")]),
                (500, r#"{"message":"boom"}"#.to_string()),
                page(&[("b.mp4", "https://bunkr.pk/f/b")]),
            ])
            .await;
            let entries = dashboard(base)
                .stale_uploads(Duration::days(7), KindFilter::VideosOnly, now())
                .await;
            assert_eq!(*requested.lock().unwrap(), vec![0, 1]);
            entries
        });

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://bunkr.pk/f/a");
        assert_eq!(entries[0].kind, FileKind::Video);
    }

    #[test]
    #[ignore = "outbound_calls"]
    fn lists_first_page() -> anyhow::Result<()> {
        let token = std::env::var("BUNKR_API_TOKEN")?;
        let d = Dashboard::new(DashboardOptions::default_builder().token(token).build()?)?;
        let files = tokio_test::block_on(d.uploads_page(0))?;
        println!("{files:#?}");
        Ok(())
    }
}
