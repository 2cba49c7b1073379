//! API integration tests.
//!
//! Exercises the HTTP endpoints both in-process (`oneshot`) and against a
//! spawned server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use temporallayr::server::{AppState, TENANT_HEADER, create_router};
use temporallayr::storage::Event;
use temporallayr::{
    IngestionPipeline, PipelineConfig, QueryEngine, StorageBuilder, TimeseriesAggregator,
};
use tokio::net::TcpListener;
use tower::ServiceExt;

use common::{failing_event, healthy_event, pipeline_deps};

// =============================================================================
// Test Helpers
// =============================================================================

/// Create app state over an in-memory SQLite database.
async fn create_test_state() -> AppState {
    let storage = StorageBuilder::new("sqlite::memory:")
        .build()
        .await
        .expect("Failed to build storage");

    let deps = pipeline_deps(storage.clone());
    let config = PipelineConfig {
        flush_interval: Duration::from_millis(20),
        ..Default::default()
    };

    AppState {
        storage: storage.clone(),
        pipeline: Arc::new(IngestionPipeline::start(config, deps.clone())),
        rules: deps.rules.store().clone(),
        query: QueryEngine::new(storage.clone(), Default::default()),
        timeseries: TimeseriesAggregator::new(storage, Default::default()),
        fanout: deps.fanout,
        stream: deps.stream,
        alerts: deps.alerts,
    }
}

/// Start test server and return base URL.
async fn start_test_server() -> (String, AppState) {
    let state = create_test_state().await;
    let router = create_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn json_request(method: &str, uri: &str, tenant: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(tenant) = tenant {
        builder = builder.header(TENANT_HEADER, tenant);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, tenant: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header(TENANT_HEADER, tenant);
    }
    builder.body(Body::empty()).unwrap()
}

// =============================================================================
// Health Probe Tests
// =============================================================================

#[tokio::test]
async fn test_health_probes() {
    let (base_url, state) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/healthz", base_url))
        .send()
        .await
        .expect("Failed to send healthz request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("Failed to parse healthz response");
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(format!("{}/readyz", base_url))
        .send()
        .await
        .expect("Failed to send readyz request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("Failed to parse readyz response");
    assert_eq!(body["db"], "ready");

    state.storage.close().await;
    let resp = client
        .get(format!("{}/readyz", base_url))
        .send()
        .await
        .expect("Failed to send readyz request");
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "not_ready");

    state.pipeline.stop().await;
}

// =============================================================================
// Ingestion Tests
// =============================================================================

#[tokio::test]
async fn test_ingest_then_query_over_http() {
    let (base_url, state) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/ingest", base_url))
        .header(TENANT_HEADER, "acme")
        .json(&json!({"events": [healthy_event("e1"), failing_event("e2")]}))
        .send()
        .await
        .expect("Failed to ingest");
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["ingested"], 2);

    state.pipeline.stop().await;

    let resp = client
        .post(format!("{}/v1/query", base_url))
        .header(TENANT_HEADER, "acme")
        .json(&json!({"resource": "incidents"}))
        .send()
        .await
        .expect("Failed to query");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["partial"], false);
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["node_name"], "fetch");

    let resp = client
        .post(format!("{}/v1/query?tenant_id=acme", base_url))
        .json(&json!({"resource": "events", "filters": {"status": "OK"}}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["execution_id"], "e1");

    let resp = client
        .post(format!("{}/v1/query", base_url))
        .header(TENANT_HEADER, "other")
        .json(&json!({"resource": "events"}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total"], 0, "tenants never see each other's events");
}

#[tokio::test]
async fn test_ingest_edge_cases() {
    let state = create_test_state().await;
    let pipeline = state.pipeline.clone();
    let app = create_router(state);

    let (status, body) = send(
        &app,
        json_request("POST", "/v1/ingest", None, json!({"events": [{}]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("tenant"));

    let (status, body) = send(
        &app,
        json_request("POST", "/v1/ingest", Some("acme"), json!({"events": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "ingested": 0}));

    pipeline.stop().await;
    let (status, _) = send(
        &app,
        json_request("POST", "/v1/ingest", Some("acme"), json!({"events": [{}]})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// =============================================================================
// Query Tests
// =============================================================================

#[tokio::test]
async fn test_query_validation_errors() {
    let state = create_test_state().await;
    let app = create_router(state);

    let (status, body) = send(
        &app,
        json_request("POST", "/v1/query", Some("acme"), json!({"limit": 10_000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("limit exceeds maximum")
    );

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/query",
            Some("acme"),
            json!({"sort": {"field": "name"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/v1/query",
            Some("acme"),
            json!({"query": "status FAILED"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("invalid query"));
}

#[tokio::test]
async fn test_query_with_conditions() {
    let state = create_test_state().await;
    let pipeline = state.pipeline.clone();
    let app = create_router(state);

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/ingest",
            Some("acme"),
            json!({"events": [failing_event("e1"), failing_event("e2"), healthy_event("e3")]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    pipeline.stop().await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/v1/query",
            Some("acme"),
            json!({"resource": "events", "query": "status == FAILED AND execution_id != 'e1'"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["execution_id"], "e2");

    let (_, body) = send(
        &app,
        json_request(
            "POST",
            "/v1/query",
            Some("acme"),
            json!({"resource": "events", "query": "duration > 100"}),
        ),
    )
    .await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["execution_id"], "e3");
}

// =============================================================================
// Trace Tests
// =============================================================================

async fn seed_traces(state: &AppState) {
    let events: Vec<Event> = [("a", Some("OK"), 1), ("b", Some("FAILED"), 2), ("c", None, 3)]
        .into_iter()
        .map(|(id, status, sec)| {
            let mut body = json!({
                "execution_id": id,
                "timestamp": format!("2024-03-01T12:00:0{sec}Z"),
            });
            if let Some(status) = status {
                body["status"] = json!(status);
            }
            Event::new("acme", body, chrono::Utc::now())
        })
        .collect();
    state.storage.write_event_batch(&events).await.unwrap();
}

#[tokio::test]
async fn test_trace_listing() {
    let state = create_test_state().await;
    seed_traces(&state).await;
    let app = create_router(state);

    let (status, body) = send(&app, get("/v1/traces", Some("acme"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["partial"], false);
    let items = body["items"].as_array().unwrap();
    let ids: Vec<&str> = items.iter().map(|t| t["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["c", "b", "a"]);
    assert_eq!(items[0]["status"], "UNKNOWN");
    assert_eq!(items[0]["error"], false);
    assert_eq!(items[1]["error"], true);

    let (_, body) = send(&app, get("/v1/traces?status=FAILED", Some("acme"))).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["id"], "b");

    let (_, body) = send(&app, get("/v1/traces?limit=1&offset=1", Some("acme"))).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["id"], "b");

    let (status, _) = send(&app, get("/v1/traces?limit=101", Some("acme"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, get("/v1/traces?limit=0", Some("acme"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/v1/traces", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = send(&app, get("/v1/traces", Some("other"))).await;
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_trace_lookup() {
    let state = create_test_state().await;
    seed_traces(&state).await;
    let app = create_router(state);

    let (status, body) = send(&app, get("/v1/traces/b", Some("acme"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trace"]["id"], "b");
    assert_eq!(body["trace"]["tenant_id"], "acme");
    assert_eq!(body["trace"]["payload"]["status"], "FAILED");

    let (status, body) = send(&app, get("/v1/traces/missing", Some("acme"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let (status, _) = send(&app, get("/v1/traces/b", Some("other"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_timeseries_endpoint() {
    let state = create_test_state().await;
    let app = create_router(state);

    let (status, body) = send(
        &app,
        get(
            "/v1/metrics/timeseries?range=1h&interval_seconds=300&metric=latency_p95",
            Some("acme"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["partial"], false);
    assert!(body["buckets"].as_array().unwrap().is_empty());

    let (status, _) = send(&app, get("/v1/metrics/timeseries", Some("acme"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        get(
            "/v1/metrics/timeseries?range=1h&interval_seconds=0",
            Some("acme"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Rules CRUD Tests
// =============================================================================

#[tokio::test]
async fn test_rules_crud() {
    let state = create_test_state().await;
    let app = create_router(state);

    let (status, created) = send(
        &app,
        json_request(
            "POST",
            "/v1/rules",
            Some("acme"),
            json!({
                "name": "slow runs",
                "priority": 5,
                "condition": {"type": "execution_latency", "parameters": {"threshold": 1000}},
                "actions": {"severity": "high", "notify": true}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["tenant_id"], "acme");
    assert_eq!(created["actions"]["create_incident"], true);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, listed) = send(&app, get("/v1/rules", Some("acme"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "slow runs");

    let (_, other) = send(&app, get("/v1/rules", Some("globex"))).await;
    assert!(other.as_array().unwrap().is_empty());

    let delete = |tenant: &str| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/v1/rules/{id}"))
            .header(TENANT_HEADER, tenant)
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, delete("globex")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, delete("acme")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, delete("acme")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = send(&app, get("/v1/rules", Some("acme"))).await;
    assert!(listed.as_array().unwrap().is_empty());

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/rules",
            Some("acme"),
            json!({"name": "bad", "condition": {"type": "nonsense"}}),
        ),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_alert_rules_crud() {
    let state = create_test_state().await;
    let app = create_router(state);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/v1/alert-rules",
            Some("acme"),
            json!({"failure_type": "runtime_error", "webhook_url": "not a url"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("webhook_url"));

    let (status, created) = send(
        &app,
        json_request(
            "POST",
            "/v1/alert-rules",
            Some("acme"),
            json!({
                "name": "pager",
                "failure_type": "runtime_error",
                "node_name": "fetch",
                "webhook_url": "https://hooks.example.com/alert"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();

    let (_, listed) = send(&app, get("/v1/alert-rules", Some("acme"))).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["node_name"], "fetch");

    let (status, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v1/alert-rules/{id}"))
            .header(TENANT_HEADER, "acme")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

// =============================================================================
// Stats Tests
// =============================================================================

#[tokio::test]
async fn test_stats_reflect_ingestion() {
    let state = create_test_state().await;
    let pipeline = state.pipeline.clone();
    let app = create_router(state);

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/ingest",
            Some("acme"),
            json!({"events": [failing_event("e1"), failing_event("e2"), healthy_event("e3")]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    pipeline.stop().await;

    let (status, stats) = send(&app, get("/v1/stats", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["ingestion"]["enqueued"], 3);
    assert_eq!(stats["ingestion"]["written"], 3);
    assert_eq!(stats["ingestion"]["incidents_created"], 1);
    assert_eq!(stats["ingestion"]["incidents_deduplicated"], 1);
    assert_eq!(stats["alerts"]["dispatches"], 1);
    assert_eq!(stats["live_subscribers"], 0);
}

#[tokio::test]
async fn test_top_functions_and_error_rate() {
    let (base_url, state) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/ingest", base_url))
        .header(TENANT_HEADER, "acme")
        .json(&json!({"events": [failing_event("e1"), failing_event("e2"), healthy_event("e3")]}))
        .send()
        .await
        .expect("Failed to ingest");
    assert_eq!(resp.status(), 202);
    state.pipeline.stop().await;

    let resp = client
        .get(format!("{}/v1/stats/top-functions?tenant_id=acme", base_url))
        .send()
        .await
        .expect("Failed to fetch top functions");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["items"],
        json!([{"name": "load", "count": 3}, {"name": "fetch", "count": 2}])
    );

    let resp = client
        .get(format!("{}/v1/stats/errors", base_url))
        .header(TENANT_HEADER, "acme")
        .send()
        .await
        .expect("Failed to fetch error rate");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total_events"], 3);
    assert_eq!(body["error_events"], 2);
    assert_eq!(body["error_rate"], 0.667);
    assert_eq!(body["partial"], false);

    let resp = client
        .get(format!("{}/v1/stats/errors", base_url))
        .header(TENANT_HEADER, "nobody")
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total_events"], 0);
    assert_eq!(body["error_rate"], 0.0);
}
