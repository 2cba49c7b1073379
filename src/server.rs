//! HTTP and WebSocket transport.
//!
//! Thin axum plumbing over the engine: every handler resolves the tenant,
//! calls one component and maps its outcome to JSON.

mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use uuid::Uuid;

use crate::alert::{AlertDispatcher, AlertStats};
use crate::config::parse_duration;
use crate::fanout::FanoutBroadcaster;
use crate::ingest::{IngestError, IngestionPipeline, PipelineStats};
use crate::query::{
    ErrorSummary, QueryEngine, QueryError, QueryRequest, TimeseriesAggregator, TimeseriesMetric,
    TimeseriesRequest, TopFunctions, TraceListRequest,
};
use crate::rules::RuleStore;
use crate::storage::{AlertRule, NewAlertRule, NewRule, Rule, StorageError, StoragePort};
use crate::stream::EventStream;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

const DEFAULT_INTERVAL_SECONDS: i64 = 60;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StoragePort>,
    pub pipeline: Arc<IngestionPipeline>,
    pub rules: RuleStore,
    pub query: QueryEngine,
    pub timeseries: TimeseriesAggregator,
    pub fanout: FanoutBroadcaster,
    pub stream: EventStream,
    pub alerts: AlertDispatcher,
}

// =============================================================================
// Errors
// =============================================================================

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing tenant: set the x-tenant-id header or tenant_id query parameter")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error")]
    Internal(#[from] StorageError),
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(e) => {
                tracing::error!(error = %e, "Request failed on storage");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// =============================================================================
// Tenant resolution
// =============================================================================

/// Tenant of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub String);

#[derive(Deserialize)]
struct TenantParam {
    tenant_id: Option<String>,
}

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        if let Some(tenant) = from_header {
            return Ok(Self(tenant));
        }

        Query::<TenantParam>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(p)| p.tenant_id)
            .filter(|t| !t.is_empty())
            .map(Self)
            .ok_or(ApiError::Unauthorized)
    }
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/v1/ingest", post(ingest_handler))
        .route("/v1/query", post(query_handler))
        .route("/v1/metrics/timeseries", get(timeseries_handler))
        .route("/v1/traces", get(list_traces_handler))
        .route("/v1/traces/{id}", get(get_trace_handler))
        .route("/v1/rules", get(list_rules_handler).post(create_rule_handler))
        .route("/v1/rules/{id}", delete(delete_rule_handler))
        .route(
            "/v1/alert-rules",
            get(list_alert_rules_handler).post(create_alert_rule_handler),
        )
        .route("/v1/alert-rules/{id}", delete(delete_alert_rule_handler))
        .route("/v1/stats", get(stats_handler))
        .route("/v1/stats/top-functions", get(top_functions_handler))
        .route("/v1/stats/errors", get(error_summary_handler))
        .route("/v1/stream", get(ws::stream_handler))
        .route("/v1/live", get(ws::live_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        db: None,
    })
}

/// Readiness probe: the storage backend must answer a ping.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok",
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready",
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Ingestion and queries
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    #[serde(default)]
    pub events: Vec<Value>,
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(body): Json<IngestBody>,
) -> Result<Response, ApiError> {
    if body.events.is_empty() {
        return Ok(Json(json!({ "status": "ok", "ingested": 0 })).into_response());
    }

    let receipt = state.pipeline.enqueue(&tenant, body.events)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "ingested": receipt.accepted,
            "dropped": receipt.dropped,
        })),
    )
        .into_response())
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(mut request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    request.tenant_id = tenant;
    let result = state.query.search(&request).await?;
    Ok(Json(result).into_response())
}

/// Query parameters for the timeseries API.
#[derive(Debug, Deserialize)]
pub struct TimeseriesParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Trailing window ending now, e.g. `24h`.
    pub range: Option<String>,
    pub interval_seconds: Option<i64>,
    pub metric: Option<TimeseriesMetric>,
}

impl TimeseriesParams {
    fn into_request(self, tenant_id: String) -> Result<TimeseriesRequest, ApiError> {
        let (start, end) = match (self.range, self.start, self.end) {
            (Some(range), _, _) => {
                let window = parse_duration(&range)
                    .ok()
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid range '{range}'")))?;
                let end = Utc::now();
                let start = end
                    .checked_sub_signed(window)
                    .ok_or_else(|| ApiError::BadRequest(format!("range '{range}' out of bounds")))?;
                (start, end)
            }
            (None, Some(start), Some(end)) => (start, end),
            _ => {
                return Err(ApiError::BadRequest(
                    "either start and end, or range, is required".to_string(),
                ));
            }
        };

        Ok(TimeseriesRequest {
            tenant_id,
            start,
            end,
            interval_seconds: self.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS),
            metric: self.metric.unwrap_or_default(),
            filters: Default::default(),
        })
    }
}

async fn timeseries_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Query(params): Query<TimeseriesParams>,
) -> Result<Response, ApiError> {
    let request = params.into_request(tenant)?;
    let result = state.timeseries.aggregate(&request).await?;
    Ok(Json(result).into_response())
}

// =============================================================================
// Traces
// =============================================================================

async fn list_traces_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Query(request): Query<TraceListRequest>,
) -> Result<Response, ApiError> {
    let list = state.query.list_traces(&tenant, &request).await?;
    Ok(Json(list).into_response())
}

async fn get_trace_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let trace = state
        .query
        .get_trace(&tenant, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("trace {id} not found")))?;
    Ok(Json(json!({ "trace": trace })).into_response())
}

// =============================================================================
// Rules
// =============================================================================

async fn list_rules_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<Vec<Rule>>, ApiError> {
    let rules = state.rules.get_rules(&tenant).await?;
    Ok(Json(rules.to_vec()))
}

async fn create_rule_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(new_rule): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>), ApiError> {
    if new_rule.name.trim().is_empty() {
        return Err(ApiError::BadRequest("rule name must not be empty".to_string()));
    }
    let rule = new_rule.into_rule(tenant);
    state.rules.add_rule(&rule).await?;
    tracing::info!(tenant_id = %rule.tenant_id, rule_id = %rule.id, name = %rule.name, "Rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn delete_rule_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.rules.delete_rule(&tenant, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("rule {id} not found")))
    }
}

async fn list_alert_rules_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<Vec<AlertRule>>, ApiError> {
    Ok(Json(state.storage.read_alert_rules(&tenant).await?))
}

async fn create_alert_rule_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(new_rule): Json<NewAlertRule>,
) -> Result<(StatusCode, Json<AlertRule>), ApiError> {
    if let Some(url) = new_rule.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ApiError::BadRequest(format!("invalid webhook_url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::BadRequest(
                "webhook_url must be http or https".to_string(),
            ));
        }
    }
    let rule = new_rule.into_rule(tenant);
    state.storage.insert_alert_rule(&rule).await?;
    tracing::info!(
        tenant_id = %rule.tenant_id,
        rule_id = %rule.id,
        failure_type = %rule.failure_type,
        "Alert rule created"
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn delete_alert_rule_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.storage.delete_alert_rule(&tenant, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("alert rule {id} not found")))
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub ingestion: PipelineStats,
    pub alerts: AlertStats,
    pub live_subscribers: usize,
    pub stream_listeners: usize,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        ingestion: state.pipeline.stats(),
        alerts: state.alerts.stats(),
        live_subscribers: state.fanout.total_subscribers(),
        stream_listeners: state.stream.subscriber_count(),
    })
}

async fn top_functions_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Json<TopFunctions> {
    Json(state.timeseries.top_functions(&tenant).await)
}

async fn error_summary_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Json<ErrorSummary> {
    Json(state.timeseries.error_summary(&tenant).await)
}
