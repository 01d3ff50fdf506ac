use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use toolscout_core::{Error, Result, ScrapeOutcome};
use url::Url;

use crate::config::Config;
use crate::retry_backoff;

const PER_HOST_LIMIT: usize = 2;
const GITHUB_ENRICH_THRESHOLD: usize = 600;

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

const BOT_PHRASES: [&str; 8] = [
    "captcha",
    "unusual traffic",
    "robot",
    "automation",
    "blocked",
    "cloudflare",
    "access denied",
    "security check",
];

// Interstitials are short pages; long articles that merely mention these
// words must not trip the detector.
const BOT_SCAN_MAX_LEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Trips after `threshold` consecutive failures; rejects everything for
/// `cooldown`, then admits exactly one trial request. A successful trial
/// closes the circuit, a failed one re-opens it.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// On `Ok` the caller owns the attempt and must report back via
    /// `on_success` or `on_failure`.
    pub fn admit(&self) -> Result<()> {
        let mut g = self.lock();
        match g.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = g.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    g.state = CircuitState::HalfOpen;
                    tracing::info!("circuit half-open, admitting trial request");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            // Trial already in flight.
            CircuitState::HalfOpen => Err(Error::CircuitOpen),
        }
    }

    pub fn on_success(&self) {
        let mut g = self.lock();
        if g.state != CircuitState::Closed {
            tracing::info!("circuit closed");
        }
        g.state = CircuitState::Closed;
        g.failures = 0;
        g.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut g = self.lock();
        match g.state {
            CircuitState::HalfOpen => {
                g.state = CircuitState::Open;
                g.opened_at = Some(Instant::now());
                tracing::warn!("circuit trial failed, re-opening");
            }
            CircuitState::Closed => {
                g.failures += 1;
                if g.failures >= self.threshold {
                    g.state = CircuitState::Open;
                    g.opened_at = Some(Instant::now());
                    tracing::warn!(failures = g.failures, "circuit opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }
}

fn github_owner_repo(url: &str) -> Option<(String, String)> {
    let u = Url::parse(url).ok()?;
    if u.host_str()? != "github.com" {
        return None;
    }
    let mut segments = u.path_segments()?;
    let owner = segments.next()?.to_string();
    let repo = segments.next()?.trim_end_matches(".git").to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

fn error_status(e: &Error) -> Option<u16> {
    match e {
        Error::Transient(s) | Error::Permanent(s) => Some(*s),
        Error::RateLimited(_) => Some(429),
        Error::Blocked(_) => Some(403),
        _ => None,
    }
}

pub struct Scraper {
    client: reqwest::Client,
    global: Semaphore,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    breaker: CircuitBreaker,
    ua_cursor: AtomicUsize,
    max_retries: u32,
    min_content_length: usize,
    max_content_length: usize,
}

impl Scraper {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(cfg.scrape_timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            global: Semaphore::new(cfg.max_concurrent_scrapes.max(1)),
            hosts: Mutex::new(HashMap::new()),
            breaker: CircuitBreaker::new(
                cfg.failure_threshold,
                Duration::from_secs(cfg.recovery_timeout_secs),
            ),
            ua_cursor: AtomicUsize::new(0),
            max_retries: cfg.max_retries.max(1),
            min_content_length: cfg.min_content_length,
            max_content_length: cfg.max_content_length,
        })
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut g = match self.hosts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        g.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_LIMIT)))
            .clone()
    }

    async fn fetch_once(&self, url: &str) -> Result<(u16, String)> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.next_user_agent())
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header("Sec-Ch-Ua", "\"Chromium\";v=\"124\", \"Not-A.Brand\";v=\"99\"")
            .header("Sec-Ch-Ua-Mobile", "?0")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .header("DNT", "1")
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let status = resp.status().as_u16();
        match status {
            429 => return Err(Error::RateLimited(url.to_string())),
            403 => return Err(Error::Blocked(url.to_string())),
            500 | 502 | 503 | 504 => return Err(Error::Transient(status)),
            s if !(200..300).contains(&s) => return Err(Error::Permanent(status)),
            _ => {}
        }

        if let Some(ct) = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let ct = ct.to_ascii_lowercase();
            if !ct.contains("text/html") && !ct.contains("application/xhtml") {
                return Err(Error::NoContent(format!("content type {ct} at {url}")));
            }
        }

        let body = resp.text().await.map_err(|e| Error::Fetch(e.to_string()))?;
        if body.len() <= BOT_SCAN_MAX_LEN {
            let lower = body.to_lowercase();
            if BOT_PHRASES.iter().any(|p| lower.contains(p)) {
                return Err(Error::Blocked(format!("bot interstitial at {url}")));
            }
        }
        Ok((status, body))
    }

    async fn fetch_html(&self, url: &str) -> Result<(u16, String)> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(url).await {
                Ok(ok) => return Ok(ok),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_retries => {
                    let delay = retry_backoff(attempt);
                    tracing::debug!(url, attempt, delay_ms = delay.as_millis() as u64, error = %e, "scrape retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn enrich_github(&self, url: &str, existing: Option<String>) -> Option<String> {
        let Some((owner, repo)) = github_owner_repo(url) else {
            return existing;
        };
        for branch in ["HEAD", "master", "main"] {
            let raw = format!(
                "https://raw.githubusercontent.com/{owner}/{repo}/{branch}/README.md"
            );
            let Ok(resp) = self.client.get(&raw).send().await else {
                continue;
            };
            if !resp.status().is_success() {
                continue;
            }
            let Ok(readme) = resp.text().await else {
                continue;
            };
            if readme.trim().is_empty() {
                continue;
            }
            let mut combined = existing.unwrap_or_default();
            if !combined.is_empty() {
                combined.push_str("\n\n");
            }
            combined.push_str(readme.trim());
            let capped: String = combined.chars().take(self.max_content_length).collect();
            return Some(capped);
        }
        existing
    }

    /// Never returns an error; failures surface in the outcome.
    pub async fn scrape(&self, url: &str) -> ScrapeOutcome {
        let t0 = Instant::now();
        let host = match Url::parse(url) {
            Ok(u) => match u.host_str() {
                Some(h) => h.to_string(),
                None => {
                    return ScrapeOutcome::failed(url, None, t0.elapsed().as_millis(), "url has no host")
                }
            },
            Err(e) => {
                return ScrapeOutcome::failed(
                    url,
                    None,
                    t0.elapsed().as_millis(),
                    format!("invalid url: {e}"),
                )
            }
        };

        let Ok(_global) = self.global.acquire().await else {
            return ScrapeOutcome::failed(url, None, t0.elapsed().as_millis(), "scraper shut down");
        };
        let host_sem = self.host_semaphore(&host);
        let Ok(_host) = host_sem.acquire().await else {
            return ScrapeOutcome::failed(url, None, t0.elapsed().as_millis(), "scraper shut down");
        };

        if let Err(e) = self.breaker.admit() {
            return ScrapeOutcome::failed(url, None, t0.elapsed().as_millis(), e.to_string());
        }

        match self.fetch_html(url).await {
            Ok((status, body)) => {
                self.breaker.on_success();
                let extracted = crate::extract::extract_content(
                    &body,
                    self.min_content_length,
                    self.max_content_length,
                );
                let extracted = match extracted {
                    Some(c) if c.chars().count() < GITHUB_ENRICH_THRESHOLD => {
                        self.enrich_github(url, Some(c)).await
                    }
                    None => self.enrich_github(url, None).await,
                    some => some,
                };
                let error = extracted
                    .is_none()
                    .then(|| format!("no usable content at {url}"));
                ScrapeOutcome {
                    url: url.to_string(),
                    content: extracted,
                    status: Some(status),
                    elapsed_ms: t0.elapsed().as_millis(),
                    error,
                }
            }
            Err(e) => {
                // NoContent means the server answered fine; only real
                // failures feed the breaker.
                if matches!(e, Error::NoContent(_)) {
                    self.breaker.on_success();
                } else {
                    self.breaker.on_failure();
                }
                ScrapeOutcome::failed(
                    url,
                    error_status(&e),
                    t0.elapsed().as_millis(),
                    e.to_string(),
                )
            }
        }
    }

    /// Concurrent scrapes, bounded by the global semaphore. Output order
    /// matches input order.
    pub async fn scrape_many(&self, urls: &[String]) -> Vec<ScrapeOutcome> {
        join_all(urls.iter().map(|u| self.scrape(u))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config() -> Config {
        Config {
            max_retries: 1,
            min_content_length: 30,
            recovery_timeout_secs: 60,
            ..Config::default()
        }
    }

    const PAGE: &str = r#"<html><head><title>Widget</title></head><body><main>
        <p>Widget is a build tool that compiles, bundles and minifies source
        files for deployment to any static host with sensible defaults.</p>
    </main></body></html>"#;

    #[test]
    fn breaker_opens_after_exact_threshold() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        b.admit().unwrap();
        b.on_failure();
        b.admit().unwrap();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.admit().unwrap();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.admit(), Err(Error::CircuitOpen)));
    }

    #[test]
    fn breaker_success_resets_failure_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        b.on_failure();
        b.on_failure();
        b.on_success();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn breaker_half_open_admits_single_trial() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
        // Cooldown of zero has already elapsed.
        b.admit().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.admit(), Err(Error::CircuitOpen)));
        b.on_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn breaker_failed_trial_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.on_failure();
        b.admit().unwrap();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn parses_github_owner_repo() {
        assert_eq!(
            github_owner_repo("https://github.com/acme/widget"),
            Some(("acme".to_string(), "widget".to_string()))
        );
        assert_eq!(
            github_owner_repo("https://github.com/acme/widget.git"),
            Some(("acme".to_string(), "widget".to_string()))
        );
        assert_eq!(github_owner_repo("https://example.com/acme/widget"), None);
        assert_eq!(github_owner_repo("https://github.com/"), None);
    }

    #[tokio::test]
    async fn scrape_extracts_content() {
        let app = Router::new().route("/", get(|| async { axum::response::Html(PAGE) }));
        let base = spawn(app).await;
        let s = Scraper::new(&test_config()).unwrap();
        let out = s.scrape(&base).await;
        assert_eq!(out.status, Some(200));
        assert!(out.content.unwrap().contains("build tool"));
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn forbidden_aborts_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { (axum::http::StatusCode::FORBIDDEN, "go away") }
            }),
        );
        let base = spawn(app).await;
        let cfg = Config {
            max_retries: 3,
            ..test_config()
        };
        let s = Scraper::new(&cfg).unwrap();
        let out = s.scrape(&base).await;
        assert!(out.content.is_none());
        assert_eq!(out.status, Some(403));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_retries_with_backoff_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
                    } else {
                        axum::response::Html(PAGE).into_response()
                    }
                }
            }),
        );
        let base = spawn(app).await;
        let cfg = Config {
            max_retries: 3,
            ..test_config()
        };
        let s = Scraper::new(&cfg).unwrap();
        let t0 = Instant::now();
        let out = s.scrape(&base).await;
        assert!(out.content.is_some());
        assert_eq!(out.status, Some(200));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two backoff waits sit between the three attempts.
        assert!(t0.elapsed() >= Duration::from_millis(3400));
    }

    #[tokio::test]
    async fn breaker_short_circuits_after_repeated_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }
            }),
        );
        let base = spawn(app).await;
        let s = Scraper::new(&test_config()).unwrap();
        for _ in 0..3 {
            let out = s.scrape(&base).await;
            assert!(out.content.is_none());
        }
        assert_eq!(s.breaker_state(), CircuitState::Open);
        let before = calls.load(Ordering::SeqCst);
        let out = s.scrape(&base).await;
        assert!(out.error.unwrap_or_default().contains("circuit open"));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn non_html_content_type_yields_no_content() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "application/pdf")],
                    "binary stuff",
                )
                    .into_response()
            }),
        );
        let base = spawn(app).await;
        let s = Scraper::new(&test_config()).unwrap();
        let out = s.scrape(&base).await;
        assert!(out.content.is_none());
        assert!(out.error.unwrap_or_default().contains("no usable content"));
        // A readable refusal is not a host failure.
        assert_eq!(s.breaker_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn bot_interstitial_counts_as_blocked() {
        let app = Router::new().route(
            "/",
            get(|| async {
                axum::response::Html("<html><body>Checking your browser... cloudflare</body></html>")
            }),
        );
        let base = spawn(app).await;
        let s = Scraper::new(&test_config()).unwrap();
        let out = s.scrape(&base).await;
        assert!(out.content.is_none());
        assert!(out.error.unwrap_or_default().contains("bot interstitial"));
    }

    #[tokio::test]
    async fn per_host_concurrency_is_capped() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (current.clone(), peak.clone());
        let app = Router::new().route(
            "/slow",
            get(move || {
                let c = c.clone();
                let p = p.clone();
                async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                    axum::response::Html(PAGE)
                }
            }),
        );
        let base = spawn(app).await;
        let s = Scraper::new(&test_config()).unwrap();
        let urls: Vec<String> = (0..5).map(|i| format!("{base}/slow?i={i}")).collect();
        let outcomes = s.scrape_many(&urls).await;
        assert_eq!(outcomes.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= PER_HOST_LIMIT);
    }

    #[tokio::test]
    async fn scrape_many_preserves_input_order() {
        let app = Router::new()
            .route("/a", get(|| async { axum::response::Html(PAGE) }))
            .route("/b", get(|| async { axum::http::StatusCode::NOT_FOUND }));
        let base = spawn(app).await;
        let s = Scraper::new(&test_config()).unwrap();
        let urls = vec![format!("{base}/a"), format!("{base}/b")];
        let outcomes = s.scrape_many(&urls).await;
        assert_eq!(outcomes[0].url, urls[0]);
        assert_eq!(outcomes[1].url, urls[1]);
        assert!(outcomes[0].content.is_some());
        assert!(outcomes[1].content.is_none());
    }
}
