use html_scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use toolscout_core::{Error, Result, SearchProvider, SearchResult};
use url::Url;

use crate::config::{Config, ProviderChoice};
use crate::retry_backoff;

const TITLE_MAX: usize = 200;
const SNIPPET_MAX: usize = 300;
const CACHE_TTL: Duration = Duration::from_secs(120);
const GOOGLE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
const DUCKDUCKGO_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

const BINARY_EXTENSIONS: [&str; 6] = [".pdf", ".zip", ".rar", ".7z", ".dmg", ".exe"];

/// Download links waste a scrape slot and never extract; drop them at the
/// search boundary.
fn skip_as_download(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let path = lower.split('?').next().unwrap_or(lower.as_str());
    BINARY_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) || lower.contains("/_/downloads/")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

fn normalize_row(
    url: &str,
    title: &str,
    snippet: &str,
    source: &str,
    metadata: BTreeMap<String, Value>,
) -> Option<SearchResult> {
    if !toolscout_core::is_http_url(url) || skip_as_download(url) {
        return None;
    }
    let title = truncate_chars(title.trim(), TITLE_MAX);
    if title.is_empty() {
        return None;
    }
    Some(SearchResult {
        url: crate::rank::normalize_url(url),
        title,
        snippet: truncate_chars(snippet.trim(), SNIPPET_MAX),
        source: source.to_string(),
        metadata,
    })
}

struct ResultCache {
    entries: Mutex<HashMap<(String, usize), (Instant, Vec<SearchResult>)>>,
}

impl ResultCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, usize), (Instant, Vec<SearchResult>)>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get(&self, query: &str, n: usize) -> Option<Vec<SearchResult>> {
        let mut g = self.lock();
        let key = (query.to_string(), n);
        match g.get(&key) {
            Some((at, rows)) if at.elapsed() < CACHE_TTL => Some(rows.clone()),
            Some(_) => {
                g.remove(&key);
                None
            }
            None => None,
        }
    }

    fn put(&self, query: &str, n: usize, rows: Vec<SearchResult>) {
        self.lock()
            .insert((query.to_string(), n), (Instant::now(), rows));
    }
}

pub struct GoogleSearchProvider {
    client: reqwest::Client,
    api_key: String,
    engine_id: String,
    endpoint: String,
    timeout_ms: u64,
    max_retries: u32,
    cache: ResultCache,
}

impl GoogleSearchProvider {
    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Result<Self> {
        let api_key = cfg.google_api_key.clone().ok_or_else(|| {
            Error::NotConfigured("missing TOOLSCOUT_GOOGLE_API_KEY".to_string())
        })?;
        let engine_id = cfg.google_engine_id.clone().ok_or_else(|| {
            Error::NotConfigured("missing TOOLSCOUT_GOOGLE_ENGINE_ID".to_string())
        })?;
        Ok(Self {
            client,
            api_key,
            engine_id,
            endpoint: GOOGLE_ENDPOINT.to_string(),
            timeout_ms: cfg.search_timeout_secs.max(1) * 1000,
            max_retries: cfg.max_retries.max(1),
            cache: ResultCache::new(),
        })
    }

    async fn search_once(&self, query: &str, n: usize) -> Result<Vec<SearchResult>> {
        let n_str = n.to_string();
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
                ("num", n_str.as_str()),
                ("safe", "active"),
                ("fields", "items(title,link,snippet,pagemap)"),
            ])
            .timeout(Duration::from_millis(self.timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let status = resp.status().as_u16();
        match status {
            429 => return Err(Error::RateLimited("google".to_string())),
            500 | 502 | 503 | 504 => return Err(Error::Transient(status)),
            s if !(200..300).contains(&s) => {
                return Err(Error::Search(format!("google search HTTP {s}")))
            }
            _ => {}
        }

        let parsed: GoogleSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut out = Vec::new();
        for item in parsed.items.unwrap_or_default() {
            let Some(link) = item.link else { continue };
            let mut metadata = BTreeMap::new();
            if let Some(pagemap) = item.pagemap {
                metadata.insert("pagemap".to_string(), pagemap);
            }
            if let Some(r) = normalize_row(
                &link,
                item.title.as_deref().unwrap_or(""),
                item.snippet.as_deref().unwrap_or(""),
                "google",
                metadata,
            ) {
                out.push(r);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct GoogleSearchResponse {
    items: Option<Vec<GoogleItem>>,
}

#[derive(Debug, Deserialize)]
struct GoogleItem {
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
    pagemap: Option<Value>,
}

#[async_trait::async_trait]
impl SearchProvider for GoogleSearchProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        // The Custom Search API caps `num` at 10.
        let n = max_results.clamp(1, 10);
        if let Some(hit) = self.cache.get(query, n) {
            return Ok(hit);
        }
        let mut attempt = 0u32;
        loop {
            match self.search_once(query, n).await {
                Ok(rows) => {
                    self.cache.put(query, n, rows.clone());
                    return Ok(rows);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_retries => {
                    let delay = retry_backoff(attempt);
                    tracing::debug!(provider = "google", attempt, delay_ms = delay.as_millis() as u64, error = %e, "search retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct DuckDuckGoSearchProvider {
    client: reqwest::Client,
    endpoint: String,
    timeout_ms: u64,
    max_retries: u32,
    cache: ResultCache,
}

impl DuckDuckGoSearchProvider {
    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Self {
        Self {
            client,
            endpoint: DUCKDUCKGO_ENDPOINT.to_string(),
            timeout_ms: cfg.search_timeout_secs.max(1) * 1000,
            max_retries: cfg.max_retries.max(1),
            cache: ResultCache::new(),
        }
    }

    async fn search_once(&self, query: &str, n: usize) -> Result<Vec<SearchResult>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/html")
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .form(&[("q", query), ("kl", "us-en")])
            .timeout(Duration::from_millis(self.timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let status = resp.status().as_u16();
        match status {
            429 => return Err(Error::RateLimited("duckduckgo".to_string())),
            500 | 502 | 503 | 504 => return Err(Error::Transient(status)),
            s if !(200..300).contains(&s) => {
                return Err(Error::Search(format!("duckduckgo search HTTP {s}")))
            }
            _ => {}
        }

        let html = resp.text().await.map_err(|e| Error::Search(e.to_string()))?;
        Ok(parse_duckduckgo_html(&html, n))
    }
}

/// Redirect links carry the target in the `uddg` parameter; ad rows point at
/// `/y.js` and are dropped.
fn resolve_ddg_href(href: &str) -> Option<String> {
    if href.contains("/y.js") || href.starts_with('#') || href.is_empty() {
        return None;
    }
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let Ok(u) = Url::parse(&absolute) else {
        return None;
    };
    if u.host_str()
        .map(|h| h.ends_with("duckduckgo.com"))
        .unwrap_or(false)
    {
        return u
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    Some(absolute)
}

fn parse_duckduckgo_html(html: &str, n: usize) -> Vec<SearchResult> {
    let (Ok(row_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse("div.result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for row in doc.select(&row_sel) {
        if out.len() >= n {
            break;
        }
        let Some(link) = row.select(&link_sel).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_ddg_href(href) else {
            continue;
        };
        let title = link.text().collect::<String>();
        let snippet = row
            .select(&snippet_sel)
            .next()
            .map(|s| s.text().collect::<String>())
            .unwrap_or_default();
        if let Some(r) = normalize_row(&url, &title, &snippet, "duckduckgo", BTreeMap::new()) {
            out.push(r);
        }
    }
    out
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoSearchProvider {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let n = max_results.max(1);
        if let Some(hit) = self.cache.get(query, n) {
            return Ok(hit);
        }
        let mut attempt = 0u32;
        loop {
            match self.search_once(query, n).await {
                Ok(rows) => {
                    self.cache.put(query, n, rows.clone());
                    return Ok(rows);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_retries => {
                    let delay = retry_backoff(attempt);
                    tracing::debug!(provider = "duckduckgo", attempt, delay_ms = delay.as_millis() as u64, error = %e, "search retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Ordered provider chain. The first provider that returns results wins;
/// failures and empty responses fall through to the next one.
pub struct SearchManager {
    providers: Vec<Arc<dyn SearchProvider>>,
}

impl SearchManager {
    pub fn new(providers: Vec<Arc<dyn SearchProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Self {
        let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
        match cfg.search_provider {
            ProviderChoice::Google => {
                if let Ok(g) = GoogleSearchProvider::from_config(client.clone(), cfg) {
                    providers.push(Arc::new(g));
                }
            }
            ProviderChoice::DuckDuckGo => {
                providers.push(Arc::new(DuckDuckGoSearchProvider::from_config(client, cfg)));
                return Self { providers };
            }
            ProviderChoice::Auto => {
                match GoogleSearchProvider::from_config(client.clone(), cfg) {
                    Ok(g) => providers.push(Arc::new(g)),
                    Err(e) => tracing::debug!(error = %e, "google provider unavailable"),
                }
                providers.push(Arc::new(DuckDuckGoSearchProvider::from_config(client, cfg)));
            }
        }
        Self { providers }
    }

    async fn try_search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        for p in &self.providers {
            if !p.is_available() {
                continue;
            }
            match p.search(query, max_results).await {
                Ok(rows) if !rows.is_empty() => {
                    tracing::debug!(provider = p.name(), hits = rows.len(), "search served");
                    return Ok(rows);
                }
                Ok(_) => {
                    tracing::debug!(provider = p.name(), "no results, trying next provider");
                }
                Err(e) => {
                    tracing::warn!(provider = p.name(), error = %e, "provider failed, trying next");
                }
            }
        }
        Err(Error::AllProvidersExhausted)
    }

    /// Never fails: when every provider errors or comes back empty, the
    /// caller gets an empty list.
    pub async fn search(&self, query: &str, max_results: usize) -> Vec<SearchResult> {
        self.try_search(query, max_results)
            .await
            .unwrap_or_default()
    }

    pub fn available_providers(&self) -> Vec<&'static str> {
        self.providers
            .iter()
            .filter(|p| p.is_available())
            .map(|p| p.name())
            .collect()
    }

    pub fn provider_status(&self) -> BTreeMap<String, bool> {
        self.providers
            .iter()
            .map(|p| (p.name().to_string(), p.is_available()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn google_provider(endpoint: String, max_retries: u32) -> GoogleSearchProvider {
        GoogleSearchProvider {
            client: reqwest::Client::new(),
            api_key: "k".to_string(),
            engine_id: "cx".to_string(),
            endpoint,
            timeout_ms: 5_000,
            max_retries,
            cache: ResultCache::new(),
        }
    }

    fn ddg_provider(endpoint: String) -> DuckDuckGoSearchProvider {
        DuckDuckGoSearchProvider {
            client: reqwest::Client::new(),
            endpoint,
            timeout_ms: 5_000,
            max_retries: 1,
            cache: ResultCache::new(),
        }
    }

    const DDG_FIXTURE: &str = r#"
    <html><body>
      <div class="result">
        <a class="result__a" href="https://example.com/docs?utm_source=ddg">Example Docs</a>
        <div class="result__snippet">Documentation for Example.</div>
      </div>
      <div class="result">
        <a class="result__a" href="https://duckduckgo.com/y.js?ad_provider=x">Sponsored</a>
      </div>
      <div class="result">
        <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fother.org%2Fguide">Other Guide</a>
      </div>
      <div class="result">
        <a class="result__a" href="https://example.com/manual.pdf">PDF Manual</a>
      </div>
    </body></html>
    "#;

    #[test]
    fn parses_duckduckgo_rows_and_skips_ads_and_downloads() {
        let rows = parse_duckduckgo_html(DDG_FIXTURE, 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].url, "https://example.com/docs");
        assert_eq!(rows[0].title, "Example Docs");
        assert_eq!(rows[0].snippet, "Documentation for Example.");
        assert_eq!(rows[1].url, "https://other.org/guide");
    }

    #[test]
    fn parses_minimal_google_shape() {
        let js = r#"
        {
          "items": [
            {"title":"Example","link":"https://example.com","snippet":"Hello","pagemap":{"cse_image":[]}}
          ]
        }
        "#;
        let parsed: GoogleSearchResponse = serde_json::from_str(js).unwrap();
        let items = parsed.items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link.as_deref(), Some("https://example.com"));
        assert!(items[0].pagemap.is_some());
    }

    #[test]
    fn resolve_ddg_href_handles_redirects_and_ads() {
        assert_eq!(
            resolve_ddg_href("https://example.com/a"),
            Some("https://example.com/a".to_string())
        );
        assert_eq!(
            resolve_ddg_href("//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fb"),
            Some("https://example.com/b".to_string())
        );
        assert_eq!(resolve_ddg_href("https://duckduckgo.com/y.js?ad=1"), None);
        assert_eq!(resolve_ddg_href("#"), None);
    }

    #[test]
    fn skips_binary_downloads() {
        assert!(skip_as_download("https://example.com/tool.ZIP"));
        assert!(skip_as_download("https://example.com/x.pdf?dl=1"));
        assert!(skip_as_download("https://pkg.dev/_/downloads/abc"));
        assert!(!skip_as_download("https://example.com/docs"));
    }

    #[test]
    fn normalize_row_caps_title_and_snippet() {
        let long_title = "t".repeat(400);
        let long_snippet = "s".repeat(600);
        let r = normalize_row(
            "https://example.com",
            &long_title,
            &long_snippet,
            "google",
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(r.title.chars().count(), 200);
        assert_eq!(r.snippet.chars().count(), 300);
    }

    #[tokio::test]
    async fn cache_hit_within_ttl_skips_network() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/",
            post(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
                async { axum::response::Html(DDG_FIXTURE.to_string()) }
            }),
        );
        let base = spawn(app).await;

        let p = ddg_provider(base);
        let first = p.search("example docs", 5).await.unwrap();
        let second = p.search("example docs", 5).await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Different effective n is a different cache key.
        let _ = p.search("example docs", 3).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn google_retries_rate_limit_then_succeeds() {
        use axum::response::IntoResponse;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        (
                            axum::http::StatusCode::TOO_MANY_REQUESTS,
                            "slow down".to_string(),
                        )
                            .into_response()
                    } else {
                        axum::Json(serde_json::json!({
                            "items": [{"title":"Example","link":"https://example.com","snippet":"hi"}]
                        }))
                        .into_response()
                    }
                }
            }),
        );
        let base = spawn(app).await;

        let p = google_provider(base, 3);
        let rows = p.search("anything", 5).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn google_does_not_retry_permanent_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { (axum::http::StatusCode::FORBIDDEN, "nope") }
            }),
        );
        let base = spawn(app).await;

        let p = google_provider(base, 3);
        assert!(p.search("anything", 5).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct StaticProvider {
        name: &'static str,
        rows: Vec<SearchResult>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SearchProvider for StaticProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, _query: &str, _max: usize) -> Result<Vec<SearchResult>> {
            if self.fail {
                return Err(Error::Search("boom".to_string()));
            }
            Ok(self.rows.clone())
        }
    }

    fn row(url: &str) -> SearchResult {
        SearchResult {
            url: url.to_string(),
            title: "t".to_string(),
            snippet: String::new(),
            source: "test".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn manager_falls_through_failing_and_empty_providers() {
        let m = SearchManager::new(vec![
            Arc::new(StaticProvider {
                name: "a",
                rows: vec![],
                fail: true,
            }),
            Arc::new(StaticProvider {
                name: "b",
                rows: vec![],
                fail: false,
            }),
            Arc::new(StaticProvider {
                name: "c",
                rows: vec![row("https://example.com")],
                fail: false,
            }),
        ]);
        let rows = m.search("q", 5).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url, "https://example.com");
    }

    #[tokio::test]
    async fn manager_returns_empty_when_all_providers_fail() {
        let m = SearchManager::new(vec![
            Arc::new(StaticProvider {
                name: "a",
                rows: vec![],
                fail: true,
            }),
            Arc::new(StaticProvider {
                name: "b",
                rows: vec![],
                fail: true,
            }),
        ]);
        assert!(m.search("q", 5).await.is_empty());
        assert!(matches!(
            m.try_search("q", 5).await,
            Err(Error::AllProvidersExhausted)
        ));
    }

    #[test]
    fn provider_status_lists_configured_chain() {
        let m = SearchManager::new(vec![Arc::new(StaticProvider {
            name: "duckduckgo",
            rows: vec![],
            fail: false,
        })]);
        assert_eq!(m.available_providers(), vec!["duckduckgo"]);
        assert_eq!(m.provider_status().get("duckduckgo"), Some(&true));
    }
}
