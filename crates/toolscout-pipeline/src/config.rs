use toolscout_core::{Error, Result};

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(primary: &str, fallback: &str) -> Option<String> {
    env(primary).or_else(|| env(fallback))
}

fn env_usize(key: &str, default: usize) -> usize {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderChoice {
    /// Google when configured, DuckDuckGo as fallback.
    Auto,
    Google,
    DuckDuckGo,
}

impl ProviderChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderChoice::Auto => "auto",
            ProviderChoice::Google => "google",
            ProviderChoice::DuckDuckGo => "duckduckgo",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProviderChoice::Auto),
            "google" | "google_custom_search" => Ok(ProviderChoice::Google),
            "duckduckgo" | "ddg" => Ok(ProviderChoice::DuckDuckGo),
            other => Err(Error::NotConfigured(format!(
                "unknown search provider {other:?} (expected auto, google, or duckduckgo)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub google_api_key: Option<String>,
    pub google_engine_id: Option<String>,
    pub search_provider: ProviderChoice,
    pub max_search_results: usize,
    pub max_concurrent_scrapes: usize,
    pub scrape_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub max_content_length: usize,
    pub min_content_length: usize,
    pub max_retries: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            google_api_key: None,
            google_engine_id: None,
            search_provider: ProviderChoice::Auto,
            max_search_results: 6,
            max_concurrent_scrapes: 5,
            scrape_timeout_secs: 15,
            search_timeout_secs: 15,
            max_content_length: 8000,
            min_content_length: 100,
            max_retries: 3,
            failure_threshold: 3,
            recovery_timeout_secs: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let d = Config::default();
        let search_provider = match env("TOOLSCOUT_SEARCH_PROVIDER") {
            Some(v) => ProviderChoice::parse(&v)?,
            None => ProviderChoice::Auto,
        };
        let cfg = Self {
            openai_api_key: env_or("TOOLSCOUT_OPENAI_API_KEY", "OPENAI_API_KEY"),
            openai_base_url: env_or("TOOLSCOUT_OPENAI_BASE_URL", "OPENAI_BASE_URL")
                .unwrap_or(d.openai_base_url),
            openai_model: env("TOOLSCOUT_OPENAI_MODEL").unwrap_or(d.openai_model),
            google_api_key: env_or(
                "TOOLSCOUT_GOOGLE_API_KEY",
                "GOOGLE_CUSTOM_SEARCH_API_KEY",
            ),
            google_engine_id: env_or("TOOLSCOUT_GOOGLE_ENGINE_ID", "GOOGLE_SEARCH_ENGINE_ID"),
            search_provider,
            max_search_results: env_usize("TOOLSCOUT_MAX_SEARCH_RESULTS", d.max_search_results),
            max_concurrent_scrapes: env_usize(
                "TOOLSCOUT_MAX_CONCURRENT_SCRAPES",
                d.max_concurrent_scrapes,
            ),
            scrape_timeout_secs: env_u64("TOOLSCOUT_SCRAPE_TIMEOUT_SECS", d.scrape_timeout_secs),
            search_timeout_secs: env_u64("TOOLSCOUT_SEARCH_TIMEOUT_SECS", d.search_timeout_secs),
            max_content_length: env_usize("TOOLSCOUT_MAX_CONTENT_LENGTH", d.max_content_length),
            min_content_length: env_usize("TOOLSCOUT_MIN_CONTENT_LENGTH", d.min_content_length),
            max_retries: env_u32("TOOLSCOUT_MAX_RETRIES", d.max_retries),
            failure_threshold: env_u32("TOOLSCOUT_FAILURE_THRESHOLD", d.failure_threshold),
            recovery_timeout_secs: env_u64(
                "TOOLSCOUT_RECOVERY_TIMEOUT_SECS",
                d.recovery_timeout_secs,
            ),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.search_provider == ProviderChoice::Google
            && (self.google_api_key.is_none() || self.google_engine_id.is_none())
        {
            return Err(Error::NotConfigured(
                "search provider set to google but TOOLSCOUT_GOOGLE_API_KEY or \
                 TOOLSCOUT_GOOGLE_ENGINE_ID is missing"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn google_configured(&self) -> bool {
        self.google_api_key.is_some() && self.google_engine_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_choice_parses_aliases() {
        assert_eq!(ProviderChoice::parse("auto").unwrap(), ProviderChoice::Auto);
        assert_eq!(
            ProviderChoice::parse("google_custom_search").unwrap(),
            ProviderChoice::Google
        );
        assert_eq!(
            ProviderChoice::parse("DDG").unwrap(),
            ProviderChoice::DuckDuckGo
        );
        assert!(ProviderChoice::parse("bing").is_err());
    }

    #[test]
    fn google_requires_both_keys() {
        let cfg = Config {
            search_provider: ProviderChoice::Google,
            google_api_key: Some("k".to_string()),
            google_engine_id: None,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            search_provider: ProviderChoice::Google,
            google_api_key: Some("k".to_string()),
            google_engine_id: Some("cx".to_string()),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
        assert!(cfg.google_configured());
    }
}
