use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use toolscout_core::SearchResult;
use url::Url;

const TRACKING_KEYS: [&str; 4] = ["gclid", "fbclid", "mc_cid", "mc_eid"];

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_KEYS.contains(&key)
}

/// Canonical form used for dedup: fragment dropped, tracking parameters
/// removed. Idempotent, so already-normalized URLs pass through unchanged.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut u) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    u.set_fragment(None);
    if u.query().is_some() {
        let kept: Vec<(String, String)> = u
            .query_pairs()
            .filter(|(k, _)| !is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            u.set_query(None);
        } else {
            let mut qp = u.query_pairs_mut();
            qp.clear();
            for (k, v) in &kept {
                qp.append_pair(k, v);
            }
        }
    }
    u.to_string()
}

/// Last two dot-labels of the host ("docs.qt.io" -> "qt.io"). IP hosts and
/// single-label hosts come back verbatim.
pub fn second_level_domain(host: &str) -> String {
    let h = host.to_ascii_lowercase();
    if h.parse::<std::net::IpAddr>().is_ok() {
        return h;
    }
    let labels: Vec<&str> = h.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        labels.join(".")
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionRule {
    /// Applies only when the query mentions this token.
    pub query_token: String,
    pub domain_contains: String,
    pub adjustment: f64,
}

/// Additive scoring tables. Plain data so deployments can tune or replace the
/// heuristics without touching the ranking code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankPolicy {
    pub domain_prefix_bonuses: Vec<(String, f64)>,
    pub domain_contains_bonuses: Vec<(String, f64)>,
    pub tld_bonuses: Vec<(String, f64)>,
    pub aggregators: Vec<String>,
    pub aggregator_penalty: f64,
    pub path_bonuses: Vec<(String, f64)>,
    pub binary_path_markers: Vec<String>,
    pub binary_path_penalty: f64,
    pub text_keywords: Vec<String>,
    pub text_keyword_bonus: f64,
    pub query_token_in_domain_bonus: f64,
    pub context_keywords: Vec<String>,
    pub context_keyword_bonus: f64,
    pub no_context_penalty: f64,
    pub off_topic_domains: Vec<String>,
    pub off_topic_penalty: f64,
    pub collisions: Vec<CollisionRule>,
    pub per_domain_cap: usize,
}

fn pairs(src: &[(&str, f64)]) -> Vec<(String, f64)> {
    src.iter().map(|(s, b)| (s.to_string(), *b)).collect()
}

fn strings(src: &[&str]) -> Vec<String> {
    src.iter().map(|s| s.to_string()).collect()
}

impl Default for RankPolicy {
    fn default() -> Self {
        Self {
            domain_prefix_bonuses: pairs(&[("docs.", 8.0)]),
            domain_contains_bonuses: pairs(&[("readthedocs", 8.0), ("github.com", 6.0)]),
            tld_bonuses: pairs(&[
                (".dev", 3.0),
                (".org", 3.0),
                (".io", 1.0),
                (".ai", 1.0),
                (".com", 1.0),
            ]),
            aggregators: strings(&[
                "medium.com",
                "reddit.com",
                "quora.com",
                "top10",
                "guru99",
                "geeksforgeeks",
                "udemy.com",
                "coursera.org",
                "capterra.com",
                "g2.com",
                "slant.co",
                "alternativeto.net",
                "softwareadvice",
                "trustradius",
            ]),
            aggregator_penalty: -6.0,
            path_bonuses: pairs(&[
                ("/docs", 5.0),
                ("/documentation", 5.0),
                ("/guide", 5.0),
                ("/quickstart", 5.0),
                ("/getting-started", 5.0),
                ("/api", 5.0),
            ]),
            binary_path_markers: strings(&[
                ".pdf",
                ".zip",
                ".rar",
                ".7z",
                ".dmg",
                ".exe",
                "/_/downloads/",
            ]),
            binary_path_penalty: -8.0,
            text_keywords: strings(&[
                "official",
                "documentation",
                "docs",
                "api",
                "pricing",
                "features",
                "getting started",
                "quickstart",
            ]),
            text_keyword_bonus: 1.5,
            query_token_in_domain_bonus: 5.0,
            context_keywords: strings(&[
                "tool",
                "library",
                "framework",
                "platform",
                "sdk",
                "service",
                "open source",
            ]),
            context_keyword_bonus: 1.2,
            no_context_penalty: -1.5,
            off_topic_domains: strings(&[
                "aws.amazon.com",
                "cloud.google.com",
                "azure.microsoft.com",
            ]),
            off_topic_penalty: -20.0,
            collisions: vec![
                CollisionRule {
                    query_token: "chai".to_string(),
                    domain_contains: "chaibuilder.com".to_string(),
                    adjustment: -10.0,
                },
                CollisionRule {
                    query_token: "enzyme".to_string(),
                    domain_contains: "enzyme.finance".to_string(),
                    adjustment: -10.0,
                },
            ],
            per_domain_cap: 2,
        }
    }
}

impl RankPolicy {
    pub fn from_json(data: &str) -> toolscout_core::Result<Self> {
        serde_json::from_str(data).map_err(|e| {
            toolscout_core::Error::NotConfigured(format!("invalid rank policy: {e}"))
        })
    }
}

const QUERY_STOPWORDS: [&str; 8] = ["the", "for", "and", "with", "best", "top", "new", "most"];

fn query_tokens(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2 && !QUERY_STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

pub fn score_result(r: &SearchResult, query: &str, policy: &RankPolicy) -> f64 {
    let Ok(u) = Url::parse(&r.url) else { return 0.0 };
    let host = u.host_str().unwrap_or("").to_ascii_lowercase();
    let path = u.path().to_ascii_lowercase();
    let text = format!("{} {}", r.title, r.snippet).to_lowercase();
    let q = query.to_lowercase();
    let tokens = query_tokens(query);

    let mut score = 0.0;
    for (prefix, bonus) in &policy.domain_prefix_bonuses {
        if host.starts_with(prefix.as_str()) {
            score += bonus;
        }
    }
    for (needle, bonus) in &policy.domain_contains_bonuses {
        if host.contains(needle.as_str()) {
            score += bonus;
        }
    }
    for (tld, bonus) in &policy.tld_bonuses {
        if host.ends_with(tld.as_str()) {
            score += bonus;
            break;
        }
    }
    if policy.aggregators.iter().any(|a| host.contains(a.as_str())) {
        score += policy.aggregator_penalty;
    }
    for (marker, bonus) in &policy.path_bonuses {
        if path.contains(marker.as_str()) {
            score += bonus;
            break;
        }
    }
    if policy
        .binary_path_markers
        .iter()
        .any(|m| path.contains(m.as_str()))
    {
        score += policy.binary_path_penalty;
    }
    for kw in &policy.text_keywords {
        if text.contains(kw.as_str()) {
            score += policy.text_keyword_bonus;
        }
    }
    if tokens.iter().any(|t| host.contains(t.as_str())) {
        score += policy.query_token_in_domain_bonus;
    }
    let context_hits = policy
        .context_keywords
        .iter()
        .filter(|kw| text.contains(kw.as_str()))
        .count();
    if context_hits > 0 {
        score += policy.context_keyword_bonus * context_hits as f64;
    } else {
        score += policy.no_context_penalty;
    }
    if policy
        .off_topic_domains
        .iter()
        .any(|d| host.contains(d.as_str()))
        && !tokens.iter().any(|t| host.contains(t.as_str()))
    {
        score += policy.off_topic_penalty;
    }
    for rule in &policy.collisions {
        if q.contains(&rule.query_token) && host.contains(&rule.domain_contains) {
            score += rule.adjustment;
        }
    }
    score
}

/// Dedup by normalized URL, cap results per second-level domain, score, and
/// stable-sort by score descending. Ties keep input order, so identical input
/// always produces identical output.
pub fn merge_and_rank(
    results: Vec<SearchResult>,
    query: &str,
    policy: &RankPolicy,
    limit: usize,
) -> Vec<SearchResult> {
    let mut seen_urls: HashMap<String, ()> = HashMap::new();
    let mut domain_counts: HashMap<String, usize> = HashMap::new();
    let mut scored: Vec<(f64, SearchResult)> = Vec::new();

    for mut r in results {
        let normalized = normalize_url(&r.url);
        if seen_urls.contains_key(&normalized) {
            continue;
        }
        let domain = Url::parse(&normalized)
            .ok()
            .and_then(|u| u.host_str().map(second_level_domain))
            .unwrap_or_default();
        let count = domain_counts.entry(domain).or_insert(0);
        if *count >= policy.per_domain_cap {
            continue;
        }
        *count += 1;
        seen_urls.insert(normalized.clone(), ());
        r.url = normalized;
        let score = score_result(&r, query, policy);
        scored.push((score, r));
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(_, r)| r).collect()
}
