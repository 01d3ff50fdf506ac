//! Research pipeline: search providers, polite scraping, content extraction,
//! ranking, LLM calls, and the orchestrator tying the stages together.

use rand::Rng;
use std::time::Duration;
use toolscout_core::{Error, Result};

pub mod config;
pub mod extract;
pub mod llm;
pub mod rank;
pub mod scrape;
pub mod search;
pub mod workflow;

pub use config::{Config, ProviderChoice};
pub use extract::extract_content;
pub use llm::OpenAiChatClient;
pub use rank::{merge_and_rank, normalize_url, RankPolicy};
pub use scrape::Scraper;
pub use search::{DuckDuckGoSearchProvider, GoogleSearchProvider, SearchManager};
pub use workflow::{classify_pricing_intent, Orchestrator, PricingIntent, StageBudgets};

/// Shared client for providers that do not need per-request header control.
pub fn default_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("toolscout/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Fetch(e.to_string()))
}

/// Exponential backoff capped at 8s, with jitter so concurrent retries
/// against the same host spread out.
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.saturating_pow(attempt).min(8);
    let jitter_ms = rand::thread_rng().gen_range(200..800);
    Duration::from_millis(base_secs * 1000 + jitter_ms)
}
