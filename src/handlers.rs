//! The HTTP boundary.
//!
//! Two ways in: a JSON API at `/bridge-state` for programmatic clients (most
//! importantly rdsys/BridgeDB, which asks in batches), and a rate-limited
//! HTML page at `/result` for people who want to check a single bridge in a
//! browser. Both consult the cache first and hand whatever remains to the
//! [`TorContext`] dispatcher, then cache the fresh verdicts.
//!
//! Prometheus metrics are exposed at `/metrics`, sanitised per-bridge lines
//! at `/bridge-metrics`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::TestCache;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::ratelimit::TokenBucket;
use crate::tor::{BridgeTest, TestResult, TorContext, MAX_BRIDGES_PER_REQ};

/// Everything the handlers need, explicitly constructed in main.
#[derive(Clone)]
pub struct AppState {
    /// Cache of recent test results.
    pub cache: Arc<TestCache>,
    /// The shared tor process and its dispatcher.
    pub tor: Arc<TorContext>,
    /// Prometheus instruments.
    pub metrics: Arc<Metrics>,
    /// Rate limiter for the web route.
    pub limiter: Arc<TokenBucket>,
    /// HTML templates; present when the web interface is enabled.
    pub templates: Option<Arc<Templates>>,
}

/// The web interface's HTML pages, loaded once at startup.
pub struct Templates {
    /// Landing page with the test form.
    pub index: String,
    /// Shown when a bridge tested functional.
    pub success: String,
    /// Shown when a bridge tested dysfunctional.
    pub failure: String,
}

impl Templates {
    /// Loads all templates from the given directory.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            index: std::fs::read_to_string(dir.join("index.html"))?,
            success: std::fs::read_to_string(dir.join("success.html"))?,
            failure: std::fs::read_to_string(dir.join("failure.html"))?,
        })
    }
}

/// A client's request to test a batch of bridges.
#[derive(Debug, Deserialize)]
struct TestRequest {
    bridge_lines: Vec<String>,
}

/// Builds the request router.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/bridge-state", get(bridge_state))
        .route("/result", get(bridge_state_web))
        .route("/metrics", get(prometheus_metrics))
        .route("/bridge-metrics", get(bridge_metrics));
    if state.templates.is_some() {
        router = router.route("/", get(index));
    }
    router.with_state(state)
}

/// Tests the given bridge lines, serving from the cache where possible.
///
/// Freshly produced results are written back to the cache. Fails only when
/// the dispatcher refuses the batch; everything else is per-bridge data.
pub async fn test_bridge_lines(state: &AppState, bridge_lines: &[String]) -> Result<TestResult> {
    let mut result = TestResult::default();
    let mut remaining = Vec::new();
    let mut num_cached = 0;
    for line in bridge_lines {
        match state.cache.is_cached(line) {
            Some(entry) => {
                num_cached += 1;
                result.bridges.insert(
                    line.clone(),
                    BridgeTest {
                        functional: entry.error.is_empty(),
                        last_tested: entry.time,
                        error: entry.error,
                    },
                );
            }
            None => remaining.push(line.clone()),
        }
    }

    if remaining.is_empty() {
        info!(
            "All {} bridge lines served from cache. No need for testing.",
            num_cached
        );
    } else {
        info!(
            "{} bridge lines served from cache; testing remaining {} bridge lines.",
            num_cached,
            remaining.len()
        );
        let start = Instant::now();
        let partial = state.tor.test_bridge_lines(remaining).await?;
        result.time = start.elapsed().as_secs_f64();
        result.error = partial.error;
        for (line, test) in partial.bridges {
            let error = if test.error.is_empty() {
                None
            } else {
                Some(test.error.clone())
            };
            state.cache.add_entry(&line, error, test.last_tested);
            result.bridges.insert(line, test);
        }
    }

    let num_functional = result.bridges.values().filter(|t| t.functional).count();
    let total = result.bridges.len();
    if total > 0 {
        info!(
            "Tested {} bridges: {} ({:.1}%) functional; {} ({:.1}%) dysfunctional.",
            total,
            num_functional,
            num_functional as f64 / total as f64 * 100.0,
            total - num_functional,
            (total - num_functional) as f64 / total as f64 * 100.0
        );
    }

    Ok(result)
}

/// `GET /bridge-state`: the JSON batch API.
async fn bridge_state(State(state): State<AppState>, body: Bytes) -> Response {
    let req: TestRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!("Failed to unmarshal request body: {}", e);
            state
                .metrics
                .requests
                .with_label_values(&["api", "invalid"])
                .inc();
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    if req.bridge_lines.is_empty() {
        warn!("Got request with no bridge lines.");
        state
            .metrics
            .requests
            .with_label_values(&["api", "invalid"])
            .inc();
        return (StatusCode::BAD_REQUEST, "no bridge lines given").into_response();
    }
    if req.bridge_lines.len() > MAX_BRIDGES_PER_REQ {
        warn!(
            "Got {} bridges in request but we only allow <= {}.",
            req.bridge_lines.len(),
            MAX_BRIDGES_PER_REQ
        );
        state
            .metrics
            .requests
            .with_label_values(&["api", "invalid"])
            .inc();
        return (
            StatusCode::BAD_REQUEST,
            format!("maximum of {} bridge lines allowed", MAX_BRIDGES_PER_REQ),
        )
            .into_response();
    }

    info!("Got {} bridge lines.", req.bridge_lines.len());
    match test_bridge_lines(&state, &req.bridge_lines).await {
        Ok(result) => match serde_json::to_string(&result) {
            Ok(json) => {
                state
                    .metrics
                    .requests
                    .with_label_values(&["api", "ok"])
                    .inc();
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    json,
                )
                    .into_response()
            }
            Err(e) => {
                warn!("Bug: Failed to marshal test result: {}", e);
                state
                    .metrics
                    .requests
                    .with_label_values(&["api", "error"])
                    .inc();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to marshal test result",
                )
                    .into_response()
            }
        },
        Err(e) => {
            state
                .metrics
                .requests
                .with_label_values(&["api", "error"])
                .inc();
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// A single-bridge result for web clients that ask for JSON.
#[derive(Debug, Serialize)]
struct JsonResult {
    functional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    time: f64,
}

/// Renders a single bridge test outcome as JSON.
pub fn create_json_result(error: Option<&str>, start: DateTime<Utc>) -> String {
    let result = JsonResult {
        functional: error.is_none(),
        error: error.map(str::to_string),
        time: (Utc::now() - start).num_milliseconds() as f64 / 1000.0,
    };
    serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string())
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

fn html_response(body: String) -> Response {
    Html(body).into_response()
}

/// `GET /result?bridge_line=...`: the web interface.
///
/// Rate limited so that nobody uses bridgestrap as a port scanner.
async fn bridge_state_web(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !state.limiter.allow() {
        state
            .metrics
            .requests
            .with_label_values(&["web", "throttled"])
            .inc();
        return html_response("Rate limit exceeded.".to_string());
    }

    let Some(bridge_line) = params.get("bridge_line").filter(|l| !l.is_empty()) else {
        state
            .metrics
            .requests
            .with_label_values(&["web", "invalid"])
            .inc();
        return html_response("No bridge line given.".to_string());
    };

    let start = Utc::now();
    let result = match test_bridge_lines(&state, std::slice::from_ref(bridge_line)).await {
        Ok(result) => result,
        Err(e) => {
            state
                .metrics
                .requests
                .with_label_values(&["web", "error"])
                .inc();
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let Some(test) = result.bridges.get(bridge_line) else {
        warn!("Bug: Test result not part of our result map.");
        return failure_page(&state);
    };
    state
        .metrics
        .requests
        .with_label_values(&["web", "ok"])
        .inc();

    if wants_json(&headers) {
        let error = if test.functional {
            None
        } else {
            Some(test.error.as_str())
        };
        return (
            [(header::CONTENT_TYPE, "application/json")],
            create_json_result(error, start),
        )
            .into_response();
    }

    if test.functional {
        success_page(&state)
    } else {
        failure_page(&state)
    }
}

fn success_page(state: &AppState) -> Response {
    match &state.templates {
        Some(templates) => html_response(templates.success.clone()),
        None => html_response("Bridge is functional.".to_string()),
    }
}

fn failure_page(state: &AppState) -> Response {
    match &state.templates {
        Some(templates) => html_response(templates.failure.clone()),
        None => html_response("Bridge is not functional.".to_string()),
    }
}

/// `GET /`: the web interface's landing page.
async fn index(State(state): State<AppState>) -> Response {
    match &state.templates {
        Some(templates) => html_response(templates.index.clone()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /metrics`: prometheus exposition.
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.gather_text() {
        Ok(text) => text.into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /bridge-metrics`: sanitised per-bridge result lines.
async fn bridge_metrics(State(state): State<AppState>) -> Response {
    state.cache.v1_metrics_lines().concat().into_response()
}
