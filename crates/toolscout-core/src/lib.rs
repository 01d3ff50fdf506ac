use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("transient http failure: status {0}")]
    Transient(u16),
    #[error("permanent http failure: status {0}")]
    Permanent(u16),
    #[error("no usable content: {0}")]
    NoContent(String),
    #[error("circuit open")]
    CircuitOpen,
    #[error("all search providers exhausted")]
    AllProvidersExhausted,
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl Error {
    /// Transient failures are worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimited(_) | Error::Transient(_) | Error::Fetch(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn is_http_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Bare domains from LLM output become https URLs; existing schemes pass through.
pub fn ensure_https(website: &str) -> String {
    let w = website.trim();
    if w.starts_with("http://") || w.starts_with("https://") {
        w.to_string()
    } else {
        format!("https://{w}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub url: String,
    /// Extracted page text; `None` when the page yielded nothing usable.
    pub content: Option<String>,
    pub status: Option<u16>,
    pub elapsed_ms: u128,
    pub error: Option<String>,
}

impl ScrapeOutcome {
    pub fn failed(
        url: impl Into<String>,
        status: Option<u16>,
        elapsed_ms: u128,
        error: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            content: None,
            status,
            elapsed_ms,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricingModel {
    Free,
    Freemium,
    Paid,
    Enterprise,
    Unknown,
}

impl PricingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingModel::Free => "Free",
            PricingModel::Freemium => "Freemium",
            PricingModel::Paid => "Paid",
            PricingModel::Enterprise => "Enterprise",
            PricingModel::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PricingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured LLM output for a single tool page. Every field is optional so a
/// partially useful completion still parses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAnalysis {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub pricing_model: Option<PricingModel>,
    #[serde(default)]
    pub is_open_source: Option<bool>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub api_available: Option<bool>,
    #[serde(default)]
    pub language_support: Vec<String>,
    #[serde(default)]
    pub integration_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProfile {
    pub name: String,
    pub description: String,
    pub website: String,
    pub pricing_model: Option<PricingModel>,
    pub is_open_source: Option<bool>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    pub api_available: Option<bool>,
    #[serde(default)]
    pub language_support: Vec<String>,
    #[serde(default)]
    pub integration_capabilities: Vec<String>,
}

impl ToolProfile {
    pub fn from_analysis(fallback_name: &str, fallback_website: &str, a: ToolAnalysis) -> Self {
        let website = a
            .website
            .filter(|w| !w.trim().is_empty())
            .unwrap_or_else(|| fallback_website.to_string());
        Self {
            name: a
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| fallback_name.to_string()),
            description: a.description.unwrap_or_default(),
            website: ensure_https(&website),
            pricing_model: a.pricing_model,
            is_open_source: a.is_open_source,
            tech_stack: a.tech_stack,
            api_available: a.api_available,
            language_support: a.language_support,
            integration_capabilities: a.integration_capabilities,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub query: String,
    pub tools: Vec<ToolProfile>,
    pub analysis: Option<String>,
    /// Stage names in completion order ("extract", "research", "analyze").
    pub stages: Vec<String>,
    /// Non-fatal stage errors, in the order they occurred.
    pub errors: Vec<String>,
    pub timings_ms: BTreeMap<String, u128>,
}

impl ResearchOutcome {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tools: Vec::new(),
            analysis: None,
            stages: Vec::new(),
            errors: Vec::new(),
            timings_ms: BTreeMap::new(),
        }
    }
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether the provider has the configuration it needs to serve queries.
    fn is_available(&self) -> bool {
        true
    }
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

#[async_trait::async_trait]
pub trait LlmBackend: Send + Sync {
    async fn chat(&self, system: &str, user: &str, timeout_ms: u64) -> Result<String>;
}
