use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolscout_core::{Error, LlmBackend, PricingModel, Result, ToolAnalysis};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatClient {
    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Result<Self> {
        let api_key = cfg
            .openai_api_key
            .clone()
            .ok_or_else(|| Error::NotConfigured("missing TOOLSCOUT_OPENAI_API_KEY".to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.openai_base_url.clone(),
            api_key,
            model: cfg.openai_model.clone(),
        })
    }

    fn endpoint_chat_completions(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl LlmBackend for OpenAiChatClient {
    async fn chat(&self, system: &str, user: &str, timeout_ms: u64) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.1),
            stream: Some(false),
        };

        let resp = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("chat.completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: String,
}

pub const EXTRACTION_SYSTEM: &str = "You extract names of developer tools, libraries, \
and platforms from articles. Reply with one name per line, nothing else. At most 5 names.";

pub fn extraction_user(query: &str, content: &str) -> String {
    format!(
        "The user is researching: {query}\n\nArticle content:\n{content}\n\n\
List the specific tools, libraries, or platforms mentioned that are relevant \
to the query. One name per line."
    )
}

pub const ANALYSIS_SYSTEM: &str = "You analyze a developer tool's website content. \
Reply with a single JSON object and no other text. Fields: name, description, website, \
pricing_model (one of Free, Freemium, Paid, Enterprise, Unknown), is_open_source (boolean), \
tech_stack (array of strings), api_available (boolean), language_support (array of strings), \
integration_capabilities (array of strings). Omit fields you cannot determine.";

pub fn analysis_user(tool: &str, content: &str) -> String {
    format!("Tool: {tool}\n\nWebsite content:\n{content}")
}

pub const RECOMMENDATION_SYSTEM: &str = "You are a concise developer-tools advisor. \
Given research notes, recommend the best option for the user's need in at most three \
sentences. Mention one or two alternatives.";

pub fn recommendation_user(query: &str, notes: &str) -> String {
    format!("User need: {query}\n\nResearch notes:\n{notes}")
}

/// Pull the JSON object out of a completion that may wrap it in code fences or
/// prose, and parse it leniently.
pub fn parse_tool_analysis(raw: &str) -> Result<ToolAnalysis> {
    let start = raw
        .find('{')
        .ok_or_else(|| Error::Llm("completion contains no JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .filter(|e| *e > start)
        .ok_or_else(|| Error::Llm("completion contains no JSON object".to_string()))?;
    let mut value: Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| Error::Llm(format!("completion is not valid JSON: {e}")))?;

    // Models frequently lowercase the pricing enum; canonicalize before the
    // typed parse.
    if let Some(pm) = value.get("pricing_model").and_then(|v| v.as_str()) {
        let canonical = parse_pricing_loose(pm)
            .map(|p| Value::String(p.as_str().to_string()))
            .unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("pricing_model".to_string(), canonical);
        }
    }

    serde_json::from_value(value).map_err(|e| Error::Llm(format!("unexpected JSON shape: {e}")))
}

pub fn parse_pricing_loose(s: &str) -> Option<PricingModel> {
    match s.trim().to_ascii_lowercase().as_str() {
        "free" => Some(PricingModel::Free),
        "freemium" => Some(PricingModel::Freemium),
        "paid" => Some(PricingModel::Paid),
        "enterprise" => Some(PricingModel::Enterprise),
        "unknown" => Some(PricingModel::Unknown),
        _ => None,
    }
}
