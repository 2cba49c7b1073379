//! Ingestion pipeline integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use temporallayr::fanout::{FrameType, StreamFrame};
use temporallayr::storage::{IncidentFilter, NewRule};
use temporallayr::{
    FrameSink, IngestError, IngestionPipeline, MemoryStore, PipelineConfig, StorageBuilder,
    StoragePort, SubscriptionFilter,
};
use tokio::sync::mpsc;

use common::{FaultyStore, failing_event, healthy_event, pipeline_deps, wait_for};

fn memory() -> (Arc<MemoryStore>, Arc<dyn StoragePort>) {
    let store = Arc::new(MemoryStore::new());
    let storage: Arc<dyn StoragePort> = store.clone();
    (store, storage)
}

fn rule(body: serde_json::Value) -> NewRule {
    serde_json::from_value(body).unwrap()
}

async fn incidents(storage: &Arc<dyn StoragePort>, tenant: &str) -> Vec<temporallayr::storage::Incident> {
    storage
        .read_incidents(tenant, &IncidentFilter::default(), 100, 0)
        .await
        .unwrap()
}

// =============================================================================
// Batching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_flushes_when_batch_is_full() {
    let (store, storage) = memory();
    let config = PipelineConfig {
        max_batch_size: 2,
        flush_interval: Duration::from_secs(600),
        ..Default::default()
    };
    let pipeline = IngestionPipeline::start(config, pipeline_deps(storage));

    let receipt = pipeline
        .enqueue(
            "t1",
            vec![healthy_event("a"), healthy_event("b"), healthy_event("c")],
        )
        .unwrap();
    assert_eq!(receipt.accepted, 3);

    wait_for(Duration::from_secs(1), || store.event_count() == 2).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.event_count(), 2, "partial batch must wait for the interval");
    assert_eq!(pipeline.stats().batches, 1);

    pipeline.stop().await;
    assert_eq!(store.event_count(), 3, "stop flushes the remainder");
    assert_eq!(pipeline.stats().written, 3);
}

#[tokio::test(start_paused = true)]
async fn test_flushes_after_interval() {
    let (store, storage) = memory();
    let config = PipelineConfig {
        max_batch_size: 100,
        flush_interval: Duration::from_secs(2),
        ..Default::default()
    };
    let pipeline = IngestionPipeline::start(config, pipeline_deps(storage));

    pipeline.enqueue("t1", vec![healthy_event("a")]).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.event_count(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.event_count(), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_full_queue_drops_and_counts() {
    let (_store, storage) = memory();
    let config = PipelineConfig {
        queue_capacity: 2,
        ..Default::default()
    };
    let pipeline = IngestionPipeline::start(config, pipeline_deps(storage));

    // The worker has not been polled yet on this single-threaded runtime.
    let receipt = pipeline
        .enqueue("t1", (0..5).map(|i| healthy_event(&i.to_string())).collect())
        .unwrap();
    assert_eq!(receipt.accepted, 2);
    assert_eq!(receipt.dropped, 3);
    assert_eq!(pipeline.stats().dropped, 3);

    pipeline.stop().await;
    assert_eq!(pipeline.stats().written, 2);
}

#[tokio::test]
async fn test_enqueue_after_stop_is_rejected() {
    let (_store, storage) = memory();
    let pipeline = IngestionPipeline::start(PipelineConfig::default(), pipeline_deps(storage));
    pipeline.stop().await;
    pipeline.stop().await;

    assert!(!pipeline.is_accepting());
    assert_eq!(
        pipeline.enqueue("t1", vec![healthy_event("a")]),
        Err(IngestError::Stopped)
    );
}

// =============================================================================
// Detection, dedup and alerting
// =============================================================================

#[tokio::test]
async fn test_repeated_failure_is_deduplicated() {
    let (_store, storage) = memory();
    let deps = pipeline_deps(storage.clone());
    let alerts = deps.alerts.clone();
    let fanout = deps.fanout.clone();

    let (tx, mut rx) = mpsc::channel::<StreamFrame>(16);
    let _sub = fanout.subscribe(
        "t1",
        SubscriptionFilter::incidents(),
        Arc::new(tx) as Arc<dyn FrameSink>,
    );

    let pipeline = IngestionPipeline::start(PipelineConfig::default(), deps);
    pipeline
        .enqueue("t1", vec![failing_event("e1"), failing_event("e2")])
        .unwrap();
    pipeline.stop().await;

    let found = incidents(&storage, "t1").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].failure_type, "runtime_error");
    assert_eq!(found[0].node_name, "fetch");
    assert_eq!(found[0].occurrence_count, 2);

    let stats = pipeline.stats();
    assert_eq!(stats.incidents_created, 1);
    assert_eq!(stats.incidents_deduplicated, 1);
    assert_eq!(alerts.dispatch_count(), 1);

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.frame_type, FrameType::IncidentCreated);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "only the first occurrence is broadcast"
    );
}

async fn assert_repeat_in_later_batch_is_deduplicated(storage: Arc<dyn StoragePort>) {
    let deps = pipeline_deps(storage.clone());
    let alerts = deps.alerts.clone();
    let config = PipelineConfig {
        flush_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let pipeline = IngestionPipeline::start(config, deps);

    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let mut first = failing_event("e1");
    first["timestamp"] = json!(t0.to_rfc3339());
    pipeline.enqueue("T", vec![first.clone()]).unwrap();
    wait_for(Duration::from_secs(5), || pipeline.stats().incidents_created == 1).await;

    let opened = incidents(&storage, "T").await;
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].occurrence_count, 1);
    assert_eq!(opened[0].failure_type, "runtime_error");

    let mut repeat = first;
    repeat["timestamp"] = json!((t0 + chrono::Duration::seconds(1)).to_rfc3339());
    pipeline.enqueue("T", vec![repeat]).unwrap();
    wait_for(Duration::from_secs(5), || {
        pipeline.stats().incidents_deduplicated == 1
    })
    .await;
    pipeline.stop().await;

    let found = incidents(&storage, "T").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, opened[0].id);
    assert_eq!(found[0].occurrence_count, 2);
    assert_eq!(pipeline.stats().batches, 2);
    assert_eq!(alerts.dispatch_count(), 1);
}

#[tokio::test]
async fn test_repeat_in_later_batch_is_deduplicated_in_memory() {
    let (_store, storage) = memory();
    assert_repeat_in_later_batch_is_deduplicated(storage).await;
}

#[tokio::test]
async fn test_repeat_in_later_batch_is_deduplicated_in_sqlite() {
    let storage = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
    assert_repeat_in_later_batch_is_deduplicated(storage).await;
}

#[tokio::test]
async fn test_failure_outside_window_opens_new_incident() {
    let (_store, storage) = memory();
    let deps = pipeline_deps(storage.clone());
    let alerts = deps.alerts.clone();

    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let mut first = failing_event("e1");
    first["timestamp"] = json!(t0.to_rfc3339());
    let mut second = failing_event("e2");
    second["timestamp"] = json!((t0 + chrono::Duration::hours(25)).to_rfc3339());

    let pipeline = IngestionPipeline::start(PipelineConfig::default(), deps);
    pipeline.enqueue("t1", vec![first, second]).unwrap();
    pipeline.stop().await;

    let found = incidents(&storage, "t1").await;
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|i| i.occurrence_count == 1));
    assert_eq!(alerts.dispatch_count(), 2);
}

#[tokio::test]
async fn test_incidents_are_tenant_scoped() {
    let (_store, storage) = memory();
    let pipeline = IngestionPipeline::start(PipelineConfig::default(), pipeline_deps(storage.clone()));
    pipeline.enqueue("t1", vec![failing_event("e1")]).unwrap();
    pipeline.enqueue("t2", vec![failing_event("e2")]).unwrap();
    pipeline.stop().await;

    assert_eq!(incidents(&storage, "t1").await.len(), 1);
    assert_eq!(incidents(&storage, "t2").await.len(), 1);
    assert_eq!(pipeline.stats().incidents_created, 2);
}

#[tokio::test]
async fn test_highest_priority_rule_wins() {
    let (_store, storage) = memory();
    let low = rule(json!({
        "name": "low",
        "priority": 1,
        "condition": {"type": "execution_latency", "parameters": {"threshold": 10}}
    }))
    .into_rule("t1");
    let high = rule(json!({
        "name": "high",
        "priority": 10,
        "condition": {"type": "custom_expression",
                      "parameters": {"field": "duration", "operator": "gte", "value": 100}},
        "actions": {"notify": true}
    }))
    .into_rule("t1");
    storage.insert_rule(&low).await.unwrap();
    storage.insert_rule(&high).await.unwrap();

    let deps = pipeline_deps(storage.clone());
    let alerts = deps.alerts.clone();
    let (tx, mut rx) = mpsc::channel::<StreamFrame>(16);
    let _sub = deps.fanout.subscribe(
        "t1",
        SubscriptionFilter::default(),
        Arc::new(tx) as Arc<dyn FrameSink>,
    );

    let pipeline = IngestionPipeline::start(PipelineConfig::default(), deps);
    pipeline.enqueue("t1", vec![healthy_event("e1")]).unwrap();
    pipeline.stop().await;

    let found = incidents(&storage, "t1").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].failure_type, "custom_expression");
    assert_eq!(found[0].summary, "Rule 'high' triggered");
    assert_eq!(alerts.dispatch_count(), 1);

    let mut kinds = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        if frame.frame_type == FrameType::RuleTriggered {
            assert_eq!(frame.payload["rule_name"], "high");
        }
        kinds.push(frame.frame_type);
    }
    assert_eq!(
        kinds,
        vec![
            FrameType::RuleTriggered,
            FrameType::ExecutionGraph,
            FrameType::IncidentCreated
        ]
    );
}

#[tokio::test]
async fn test_matching_rule_without_incident_action_suppresses_detector() {
    let (_store, storage) = memory();
    let observe = rule(json!({
        "name": "observe-only",
        "condition": {"type": "node_error_rate"},
        "actions": {"create_incident": false}
    }))
    .into_rule("t1");
    storage.insert_rule(&observe).await.unwrap();

    let deps = pipeline_deps(storage.clone());
    let alerts = deps.alerts.clone();
    let pipeline = IngestionPipeline::start(PipelineConfig::default(), deps);
    pipeline.enqueue("t1", vec![failing_event("e1")]).unwrap();
    pipeline.stop().await;

    assert!(incidents(&storage, "t1").await.is_empty());
    assert_eq!(alerts.dispatch_count(), 0);
}

// =============================================================================
// Storage failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_retained_and_retried() {
    let store = FaultyStore::new();
    store.fail_writes(true);
    let storage: Arc<dyn StoragePort> = store.clone();

    let config = PipelineConfig {
        max_batch_size: 2,
        ..Default::default()
    };
    let pipeline = IngestionPipeline::start(config, pipeline_deps(storage.clone()));
    pipeline
        .enqueue("t1", vec![failing_event("e1"), healthy_event("e2")])
        .unwrap();

    wait_for(Duration::from_secs(1), || pipeline.stats().retained == 2).await;
    let stats = pipeline.stats();
    assert!(stats.write_failures >= 1);
    assert_eq!(stats.written, 0);
    // Detection does not wait for persistence.
    assert_eq!(stats.incidents_created, 1);

    store.fail_writes(false);
    wait_for(Duration::from_secs(60), || pipeline.stats().written == 2).await;

    let stats = pipeline.stats();
    assert_eq!(stats.retained, 0);
    assert_eq!(stats.incidents_created, 1, "retries never re-run detection");
    assert_eq!(store.inner.event_count(), 2);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_makes_final_retained_attempt() {
    let store = FaultyStore::new();
    store.fail_writes(true);
    let storage: Arc<dyn StoragePort> = store.clone();

    let config = PipelineConfig {
        max_batch_size: 1,
        retry_backoff: temporallayr::BackoffPolicy::fixed(u32::MAX, Duration::from_secs(3600)),
        ..Default::default()
    };
    let pipeline = IngestionPipeline::start(config, pipeline_deps(storage));
    pipeline.enqueue("t1", vec![healthy_event("e1")]).unwrap();
    wait_for(Duration::from_secs(1), || pipeline.stats().retained == 1).await;

    store.fail_writes(false);
    pipeline.stop().await;
    assert_eq!(store.inner.event_count(), 1);
    assert_eq!(pipeline.stats().retained, 0);
}
