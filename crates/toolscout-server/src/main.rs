//! HTTP front end for the research pipeline.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use toolscout_core::ToolProfile;
use toolscout_pipeline::{Config, Orchestrator};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const QUERY_MIN_LEN: usize = 2;
const QUERY_MAX_LEN: usize = 200;

#[derive(Parser, Debug)]
#[command(name = "toolscout-server")]
#[command(about = "Developer tool research API", long_about = None)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0:8000", env = "TOOLSCOUT_BIND")]
    bind: String,
    /// Overall deadline for one research request, in seconds. Past it the
    /// server answers with whatever partial results have accumulated.
    #[arg(long, default_value_t = 45, env = "TOOLSCOUT_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,
}

#[derive(Default)]
struct Metrics {
    total: AtomicU64,
    success: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
}

struct AppState {
    // None when required configuration is missing; endpoints then degrade
    // to 503 instead of refusing to start.
    orchestrator: Option<Arc<Orchestrator>>,
    cfg: Config,
    metrics: Metrics,
    started: Instant,
    request_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,toolscout_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env().context("failed to load configuration")?;

    let orchestrator = match Orchestrator::from_config(&cfg) {
        Ok(o) => Some(Arc::new(o)),
        Err(e) => {
            tracing::warn!(error = %e, "research workflow not available; serving degraded");
            None
        }
    };

    let state = Arc::new(AppState {
        orchestrator,
        cfg,
        metrics: Metrics::default(),
        started: Instant::now(),
        request_timeout: Duration::from_secs(cli.request_timeout_secs.max(1)),
    });
    let app = build_app(state);

    tracing::info!(bind = %cli.bind, "starting server");
    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/research", post(research))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics))
        .route("/examples", get(examples))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ResearchRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct ResearchResponse {
    status: &'static str,
    request_id: String,
    query: String,
    tools: Vec<ToolProfile>,
    analysis: Option<String>,
    stages: Vec<String>,
    errors: Vec<String>,
    timings_ms: BTreeMap<String, u128>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotReady,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "research workflow is not configured".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn sanitize_query(raw: &str) -> std::result::Result<String, ApiError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim().to_string();
    let len = cleaned.chars().count();
    if len < QUERY_MIN_LEN {
        return Err(ApiError::BadRequest(
            "query must be at least 2 characters".to_string(),
        ));
    }
    if len > QUERY_MAX_LEN {
        return Err(ApiError::BadRequest(
            "query must be at most 200 characters".to_string(),
        ));
    }
    Ok(cleaned)
}

async fn research(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResearchRequest>,
) -> std::result::Result<Json<ResearchResponse>, ApiError> {
    let query = sanitize_query(&req.query)?;
    let orchestrator = state.orchestrator.clone().ok_or(ApiError::NotReady)?;
    let request_id = uuid::Uuid::new_v4().to_string();
    state.metrics.total.fetch_add(1, Ordering::Relaxed);
    tracing::info!(request_id, query, "research request");

    let mut task = {
        let o = orchestrator.clone();
        let q = query.clone();
        tokio::spawn(async move { o.run(&q).await })
    };

    match tokio::time::timeout(state.request_timeout, &mut task).await {
        Ok(Ok(outcome)) => {
            orchestrator.clear_partial_results(&query);
            state.metrics.success.fetch_add(1, Ordering::Relaxed);
            Ok(Json(ResearchResponse {
                status: "success",
                request_id,
                query: outcome.query,
                tools: outcome.tools,
                analysis: outcome.analysis,
                stages: outcome.stages,
                errors: outcome.errors,
                timings_ms: outcome.timings_ms,
            }))
        }
        Ok(Err(join_err)) => {
            tracing::error!(request_id, error = %join_err, "research task failed");
            orchestrator.clear_partial_results(&query);
            state.metrics.failed.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::Internal)
        }
        Err(_) => {
            // Deadline passed: stop the task before touching the store, or a
            // still-running research stage repopulates it after the purge.
            task.abort();
            let _ = task.await;
            let tools = orchestrator.partial_results(&query);
            let analysis = orchestrator.quick_recommendation(&query, &tools).await;
            orchestrator.clear_partial_results(&query);
            state.metrics.partial.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(request_id, query, tools = tools.len(), "request timed out");
            Ok(Json(ResearchResponse {
                status: "partial",
                request_id,
                query,
                tools,
                analysis: Some(analysis),
                stages: Vec::new(),
                errors: vec!["request deadline reached before research finished".to_string()],
                timings_ms: BTreeMap::new(),
            }))
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "workflow_ready": state.orchestrator.is_some(),
        "uptime_secs": state.started.elapsed().as_secs(),
        "llm_configured": state.cfg.openai_api_key.is_some(),
        "search_provider": state.cfg.search_provider.as_str(),
    }))
}

async fn health_detailed(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers = state
        .orchestrator
        .as_ref()
        .map(|o| o.search_manager().provider_status())
        .unwrap_or_default();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "workflow_ready": state.orchestrator.is_some(),
        "uptime_secs": state.started.elapsed().as_secs(),
        "llm_configured": state.cfg.openai_api_key.is_some(),
        "providers": providers,
        "search_config": {
            "provider": state.cfg.search_provider.as_str(),
            "google_configured": state.cfg.google_configured(),
            "max_search_results": state.cfg.max_search_results,
            "search_timeout_secs": state.cfg.search_timeout_secs,
        },
        "scrape_config": {
            "max_concurrent_scrapes": state.cfg.max_concurrent_scrapes,
            "scrape_timeout_secs": state.cfg.scrape_timeout_secs,
            "max_content_length": state.cfg.max_content_length,
            "failure_threshold": state.cfg.failure_threshold,
            "recovery_timeout_secs": state.cfg.recovery_timeout_secs,
        },
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let total = state.metrics.total.load(Ordering::Relaxed);
    let success = state.metrics.success.load(Ordering::Relaxed);
    let partial = state.metrics.partial.load(Ordering::Relaxed);
    let failed = state.metrics.failed.load(Ordering::Relaxed);
    let success_rate = if total > 0 {
        success as f64 / total as f64
    } else {
        0.0
    };
    Json(serde_json::json!({
        "requests_total": total,
        "requests_success": success,
        "requests_partial": partial,
        "requests_failed": failed,
        "success_rate": success_rate,
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn examples() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "examples": [
            "free continuous integration tools",
            "open source vector databases",
            "paid error tracking platforms",
            "freemium api monitoring services",
        ]
    }))
}
