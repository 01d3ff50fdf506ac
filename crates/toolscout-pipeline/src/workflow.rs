use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use toolscout_core::{LlmBackend, PricingModel, ResearchOutcome, Result, ToolProfile};

use crate::config::Config;
use crate::llm::{
    self, OpenAiChatClient, ANALYSIS_SYSTEM, EXTRACTION_SYSTEM, RECOMMENDATION_SYSTEM,
};
use crate::rank::{merge_and_rank, RankPolicy};
use crate::scrape::Scraper;
use crate::search::SearchManager;

const RESEARCH_CONCURRENCY: usize = 3;
const MAX_TOOLS: usize = 4;
const ARTICLE_SCRAPE_COUNT: usize = 3;
const ANALYZE_ATTEMPTS: u32 = 3;
const COMBINED_CONTENT_MAX: usize = 12_000;

#[derive(Debug, Clone)]
pub struct StageBudgets {
    pub search_ms: u64,
    pub scrape_batch_ms: u64,
    pub extract_llm_ms: u64,
    pub analysis_llm_ms: u64,
    pub research_ms: u64,
    pub quick_llm_ms: u64,
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            search_ms: 10_000,
            scrape_batch_ms: 12_000,
            extract_llm_ms: 10_000,
            analysis_llm_ms: 12_000,
            research_ms: 40_000,
            quick_llm_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingIntent {
    Free,
    Paid,
    Freemium,
    Any,
}

pub fn classify_pricing_intent(query: &str) -> PricingIntent {
    let q = query.to_lowercase();
    if q.contains("freemium") {
        return PricingIntent::Freemium;
    }
    if q.contains("free") || q.contains("open source") || q.contains("open-source") {
        return PricingIntent::Free;
    }
    if q.contains("paid") || q.contains("enterprise") || q.contains("commercial") {
        return PricingIntent::Paid;
    }
    PricingIntent::Any
}

/// Rewrite the raw query into one that surfaces comparison articles rather
/// than the tools' own landing pages.
fn article_query(query: &str, intent: PricingIntent) -> String {
    match intent {
        PricingIntent::Free => format!("{query} open source alternatives"),
        PricingIntent::Paid => format!("{query} enterprise pricing comparison"),
        _ => format!("best {query} tools comparison"),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

fn parse_tool_names(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in raw.lines() {
        let name = line
            .trim()
            .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.')
            .trim();
        if name.len() < 2 || name.len() > 60 {
            continue;
        }
        if out.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}

/// When the LLM cannot help, capitalized query tokens stand in as candidate
/// tool names so the pipeline still produces something to research.
fn fallback_tools(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|t| t.len() > 2 && t.chars().all(|c| c.is_alphanumeric()))
        .take(3)
        .map(|t| {
            let mut chars = t.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn infer_pricing_from_content(content: &str) -> Option<PricingModel> {
    let c = content.to_lowercase();
    if c.contains("open source") || c.contains("open-source") {
        return Some(PricingModel::Free);
    }
    if c.contains("free tier") || c.contains("free plan") {
        return Some(PricingModel::Freemium);
    }
    if c.contains("contact sales") || c.contains("enterprise") {
        return Some(PricingModel::Enterprise);
    }
    if c.contains("per month") || c.contains("/mo") || c.contains("subscription") {
        return Some(PricingModel::Paid);
    }
    None
}

fn matches_intent(p: &ToolProfile, intent: PricingIntent) -> bool {
    match intent {
        PricingIntent::Any => true,
        PricingIntent::Free => matches!(
            p.pricing_model,
            Some(PricingModel::Free) | Some(PricingModel::Freemium)
        ) || p.is_open_source == Some(true),
        PricingIntent::Freemium => matches!(p.pricing_model, Some(PricingModel::Freemium)),
        PricingIntent::Paid => matches!(
            p.pricing_model,
            Some(PricingModel::Paid) | Some(PricingModel::Enterprise)
        ),
    }
}

fn filter_by_pricing(profiles: &[ToolProfile], intent: PricingIntent) -> Vec<ToolProfile> {
    let filtered: Vec<ToolProfile> = profiles
        .iter()
        .filter(|p| matches_intent(p, intent))
        .cloned()
        .collect();
    // An empty shortlist helps nobody; fall back to the full set.
    if filtered.is_empty() {
        profiles.to_vec()
    } else {
        filtered
    }
}

fn profile_fit_score(p: &ToolProfile, intent: PricingIntent) -> f64 {
    let mut score = 0.0;
    if matches_intent(p, intent) && intent != PricingIntent::Any {
        score += 4.0;
    }
    if p.api_available == Some(true) {
        score += 2.0;
    }
    if !p.integration_capabilities.is_empty() {
        score += 1.0;
    }
    if !p.language_support.is_empty() {
        score += 1.0;
    }
    if p.description.len() > 80 {
        score += 1.0;
    }
    score
}

fn deterministic_recommendation(intent: PricingIntent, profiles: &[ToolProfile]) -> String {
    if profiles.is_empty() {
        return "No tools could be analyzed in time. Try a narrower query.".to_string();
    }
    let mut indexed: Vec<(f64, &ToolProfile)> = profiles
        .iter()
        .map(|p| (profile_fit_score(p, intent), p))
        .collect();
    indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let best = indexed[0].1;
    let mut line = format!("Best fit: {}", best.name);
    if !best.description.is_empty() {
        let d = truncate_chars(&best.description, 160);
        line.push_str(&format!(" - {d}"));
    }
    let alternatives: Vec<&str> = indexed
        .iter()
        .skip(1)
        .take(2)
        .map(|(_, p)| p.name.as_str())
        .collect();
    if !alternatives.is_empty() {
        line.push_str(&format!(". Alternatives: {}.", alternatives.join(", ")));
    }
    line
}

fn profile_notes(profiles: &[ToolProfile]) -> String {
    profiles
        .iter()
        .map(|p| {
            let pricing = p
                .pricing_model
                .map(|m| m.as_str())
                .unwrap_or(PricingModel::Unknown.as_str());
            let api = match p.api_available {
                Some(true) => "api",
                Some(false) => "no api",
                None => "api unknown",
            };
            format!(
                "- {} ({pricing}, {api}): {}",
                p.name,
                truncate_chars(&p.description, 240)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the three research stages. Stage failures degrade the result instead
/// of aborting it; the caller always gets an outcome back.
pub struct Orchestrator {
    search: SearchManager,
    scraper: Scraper,
    llm: Arc<dyn LlmBackend>,
    policy: RankPolicy,
    budgets: StageBudgets,
    max_search_results: usize,
    partials: Mutex<HashMap<String, Vec<ToolProfile>>>,
}

impl Orchestrator {
    pub fn new(
        search: SearchManager,
        scraper: Scraper,
        llm: Arc<dyn LlmBackend>,
        policy: RankPolicy,
        cfg: &Config,
    ) -> Self {
        Self {
            search,
            scraper,
            llm,
            policy,
            budgets: StageBudgets::default(),
            max_search_results: cfg.max_search_results.max(1),
            partials: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let client = crate::default_client()?;
        let search = SearchManager::from_config(client.clone(), cfg);
        let scraper = Scraper::new(cfg)?;
        let llm = Arc::new(OpenAiChatClient::from_config(client, cfg)?);
        Ok(Self::new(search, scraper, llm, RankPolicy::default(), cfg))
    }

    pub fn with_budgets(mut self, budgets: StageBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn search_manager(&self) -> &SearchManager {
        &self.search
    }

    fn partials_lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ToolProfile>>> {
        match self.partials.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push_partial(&self, query: &str, profile: ToolProfile) {
        self.partials_lock()
            .entry(query.to_string())
            .or_default()
            .push(profile);
    }

    /// Snapshot of profiles finished so far for an in-flight query.
    pub fn partial_results(&self, query: &str) -> Vec<ToolProfile> {
        self.partials_lock().get(query).cloned().unwrap_or_default()
    }

    pub fn clear_partial_results(&self, query: &str) {
        self.partials_lock().remove(query);
    }

    pub async fn run(&self, query: &str) -> ResearchOutcome {
        let t0 = Instant::now();
        let mut outcome = ResearchOutcome::new(query);
        let intent = classify_pricing_intent(query);
        tracing::info!(query, intent = ?intent, "research started");

        let ts = Instant::now();
        let tools = self.extract_tools(query, intent, &mut outcome).await;
        outcome
            .timings_ms
            .insert("extract".to_string(), ts.elapsed().as_millis());
        outcome.stages.push("extract".to_string());

        let ts = Instant::now();
        let profiles = self.research(query, &tools, &mut outcome).await;
        outcome
            .timings_ms
            .insert("research".to_string(), ts.elapsed().as_millis());
        outcome.stages.push("research".to_string());
        outcome.tools = profiles;

        let ts = Instant::now();
        outcome.analysis = Some(self.analyze(query, intent, &mut outcome).await);
        outcome
            .timings_ms
            .insert("analyze".to_string(), ts.elapsed().as_millis());
        outcome.stages.push("analyze".to_string());

        outcome
            .timings_ms
            .insert("total".to_string(), t0.elapsed().as_millis());
        tracing::info!(
            query,
            tools = outcome.tools.len(),
            errors = outcome.errors.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "research finished"
        );
        outcome
    }

    async fn extract_tools(
        &self,
        query: &str,
        intent: PricingIntent,
        outcome: &mut ResearchOutcome,
    ) -> Vec<String> {
        let aq = article_query(query, intent);
        let rows = match tokio::time::timeout(
            Duration::from_millis(self.budgets.search_ms),
            self.search.search(&aq, self.max_search_results),
        )
        .await
        {
            Ok(rows) => rows,
            Err(_) => {
                outcome.errors.push("article search timed out".to_string());
                Vec::new()
            }
        };
        let ranked = merge_and_rank(rows, query, &self.policy, ARTICLE_SCRAPE_COUNT);
        let urls: Vec<String> = ranked.iter().map(|r| r.url.clone()).collect();

        let scraped = match tokio::time::timeout(
            Duration::from_millis(self.budgets.scrape_batch_ms),
            self.scraper.scrape_many(&urls),
        )
        .await
        {
            Ok(outcomes) => outcomes,
            Err(_) => {
                outcome
                    .errors
                    .push("article scraping timed out".to_string());
                Vec::new()
            }
        };

        let combined = scraped
            .iter()
            .filter_map(|o| o.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        if combined.trim().is_empty() {
            outcome
                .errors
                .push("no article content, falling back to query terms".to_string());
            return fallback_tools(query);
        }
        let combined = truncate_chars(&combined, COMBINED_CONTENT_MAX);

        match self
            .llm
            .chat(
                EXTRACTION_SYSTEM,
                &llm::extraction_user(query, &combined),
                self.budgets.extract_llm_ms,
            )
            .await
        {
            Ok(text) => {
                let names = parse_tool_names(&text);
                if names.is_empty() {
                    outcome
                        .errors
                        .push("tool extraction returned no names".to_string());
                    fallback_tools(query)
                } else {
                    names
                }
            }
            Err(e) => {
                outcome.errors.push(format!("tool extraction failed: {e}"));
                fallback_tools(query)
            }
        }
    }

    async fn research(
        &self,
        query: &str,
        tools: &[String],
        outcome: &mut ResearchOutcome,
    ) -> Vec<ToolProfile> {
        let mut selected: Vec<&String> = Vec::new();
        for t in tools {
            if selected.len() >= MAX_TOOLS {
                break;
            }
            if !selected.iter().any(|s| s.eq_ignore_ascii_case(t)) {
                selected.push(t);
            }
        }

        let sem = Semaphore::new(RESEARCH_CONCURRENCY);
        let mut futs: FuturesUnordered<_> = selected
            .iter()
            .map(|tool| {
                let sem = &sem;
                async move {
                    let _permit = sem.acquire().await;
                    self.research_one(tool).await
                }
            })
            .collect();

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.budgets.research_ms);
        let mut profiles = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, futs.next()).await {
                Ok(Some(profile)) => {
                    self.push_partial(query, profile.clone());
                    profiles.push(profile);
                }
                Ok(None) => break,
                Err(_) => {
                    // Dropping the stream cancels the stragglers.
                    outcome.errors.push(format!(
                        "research deadline reached with {} of {} tools done",
                        profiles.len(),
                        selected.len()
                    ));
                    break;
                }
            }
        }
        profiles
    }

    async fn research_one(&self, tool: &str) -> ToolProfile {
        let rows = self
            .search
            .search(&format!("{tool} official documentation"), 3)
            .await;
        let ranked = merge_and_rank(rows, tool, &self.policy, 3);
        let Some(best) = ranked.first() else {
            return ToolProfile {
                name: tool.to_string(),
                description: "No search results found.".to_string(),
                website: String::new(),
                pricing_model: None,
                is_open_source: None,
                tech_stack: Vec::new(),
                api_available: None,
                language_support: Vec::new(),
                integration_capabilities: Vec::new(),
            };
        };

        let scraped = self.scraper.scrape(&best.url).await;
        let Some(content) = scraped.content else {
            // Degrade to what the search result itself told us.
            return ToolProfile {
                name: tool.to_string(),
                description: best.snippet.clone(),
                website: best.url.clone(),
                pricing_model: None,
                is_open_source: None,
                tech_stack: Vec::new(),
                api_available: None,
                language_support: Vec::new(),
                integration_capabilities: Vec::new(),
            };
        };

        let analysis = match self
            .llm
            .chat(
                ANALYSIS_SYSTEM,
                &llm::analysis_user(tool, &content),
                self.budgets.analysis_llm_ms,
            )
            .await
            .and_then(|raw| llm::parse_tool_analysis(&raw))
        {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(tool, error = %e, "analysis degraded to snippet");
                Default::default()
            }
        };

        let mut profile = ToolProfile::from_analysis(tool, &best.url, analysis);
        if profile.description.is_empty() {
            profile.description = best.snippet.clone();
        }
        if profile.pricing_model.is_none() {
            profile.pricing_model = infer_pricing_from_content(&content);
        }
        profile
    }

    async fn analyze(
        &self,
        query: &str,
        intent: PricingIntent,
        outcome: &mut ResearchOutcome,
    ) -> String {
        let shortlist = filter_by_pricing(&outcome.tools, intent);
        let notes = profile_notes(&shortlist);
        let mut attempt = 0u32;
        loop {
            match self
                .llm
                .chat(
                    RECOMMENDATION_SYSTEM,
                    &llm::recommendation_user(query, &notes),
                    self.budgets.analysis_llm_ms,
                )
                .await
            {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                res => {
                    attempt += 1;
                    if attempt >= ANALYZE_ATTEMPTS {
                        if let Err(e) = res {
                            outcome.errors.push(format!("recommendation failed: {e}"));
                        } else {
                            outcome
                                .errors
                                .push("recommendation came back empty".to_string());
                        }
                        return deterministic_recommendation(intent, &shortlist);
                    }
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
            }
        }
    }

    /// Sub-second advisory for the timeout path: a short LLM call when it
    /// answers in time, a scored heuristic pick otherwise.
    pub async fn quick_recommendation(&self, query: &str, profiles: &[ToolProfile]) -> String {
        let intent = classify_pricing_intent(query);
        if !profiles.is_empty() {
            let notes = profile_notes(profiles);
            let user = llm::recommendation_user(query, &notes);
            let call = self
                .llm
                .chat(RECOMMENDATION_SYSTEM, &user, self.budgets.quick_llm_ms);
            if let Ok(Ok(text)) =
                tokio::time::timeout(Duration::from_millis(self.budgets.quick_llm_ms), call).await
            {
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
        }
        deterministic_recommendation(intent, profiles)
    }
}
