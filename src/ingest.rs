//! Ingestion pipeline.
//!
//! Producers hand events to [`IngestionPipeline::enqueue`], which never
//! waits on storage. One background worker batches them by size or time,
//! writes each batch, and drives detection, incident dedup, alerting and
//! live broadcast for every event exactly once.
//!
//! A failed write keeps the batch's events in a bounded retained buffer and
//! retries them after the configured backoff. Detection and broadcast do
//! not wait for persistence.

mod batch;
mod worker;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::alert::AlertDispatcher;
use crate::backoff::BackoffPolicy;
use crate::detector::FailureDetector;
use crate::fanout::FanoutBroadcaster;
use crate::rules::RuleEngine;
use crate::storage::{Event, StoragePort};
use crate::stream::EventStream;

use worker::Worker;

// =============================================================================
// Configuration
// =============================================================================

fn default_max_batch_size() -> usize {
    500
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_backoff() -> BackoffPolicy {
    BackoffPolicy::fixed(u32::MAX, Duration::from_secs(1)).with_max_delay(Duration::from_secs(30))
}

fn default_rule_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_incident_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_retained_events() -> usize {
    50_000
}

fn default_failure_alert_threshold() -> u32 {
    5
}

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Flush once this many events are buffered.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Flush once the oldest buffered event has waited this long.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Bound of the producer-facing queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Delay schedule between retries of retained events.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: BackoffPolicy,
    #[serde(default = "default_rule_timeout", with = "humantime_serde")]
    pub rule_timeout: Duration,
    #[serde(default = "default_incident_timeout", with = "humantime_serde")]
    pub incident_timeout: Duration,
    /// Window in which a repeated fingerprint increments an incident.
    #[serde(default = "default_dedup_window", with = "humantime_serde")]
    pub dedup_window: Duration,
    /// Events kept for retry after failed writes; oldest dropped beyond it.
    #[serde(default = "default_max_retained_events")]
    pub max_retained_events: usize,
    /// Consecutive write failures after which every failure logs at error.
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval: default_flush_interval(),
            queue_capacity: default_queue_capacity(),
            write_timeout: default_write_timeout(),
            retry_backoff: default_retry_backoff(),
            rule_timeout: default_rule_timeout(),
            incident_timeout: default_incident_timeout(),
            dedup_window: default_dedup_window(),
            max_retained_events: default_max_retained_events(),
            failure_alert_threshold: default_failure_alert_threshold(),
        }
    }
}

/// Collaborators the worker drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub storage: Arc<dyn StoragePort>,
    pub rules: RuleEngine,
    pub detector: FailureDetector,
    pub alerts: AlertDispatcher,
    pub fanout: FanoutBroadcaster,
    pub stream: EventStream,
}

impl std::fmt::Debug for PipelineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDeps").finish_non_exhaustive()
    }
}

// =============================================================================
// Errors and counters
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("ingestion pipeline is stopped")]
    Stopped,
}

/// Outcome of one `enqueue` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub accepted: usize,
    /// Dropped because the queue was full.
    pub dropped: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) write_failures: AtomicU64,
    pub(crate) incidents_created: AtomicU64,
    pub(crate) incidents_deduplicated: AtomicU64,
    pub(crate) retained: AtomicU64,
}

impl Counters {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub batches: u64,
    pub written: u64,
    pub write_failures: u64,
    pub incidents_created: u64,
    pub incidents_deduplicated: u64,
    /// Events currently awaiting a retry.
    pub retained: u64,
    /// Events waiting in the queue.
    pub queue_depth: u64,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Handle to the running ingestion pipeline.
pub struct IngestionPipeline {
    tx: mpsc::Sender<Event>,
    capacity: usize,
    counters: Arc<Counters>,
    accepting: AtomicBool,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("accepting", &self.is_accepting())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    /// Spawn the worker and return the producer handle.
    pub fn start(config: PipelineConfig, deps: PipelineDeps) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());

        tracing::info!(
            max_batch_size = config.max_batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            queue_capacity = capacity,
            "Ingestion pipeline started"
        );

        let worker = Worker::new(config, deps, rx, Arc::clone(&counters));
        let handle = tokio::spawn(worker.run(shutdown_rx));

        Self {
            tx,
            capacity,
            counters,
            accepting: AtomicBool::new(true),
            shutdown: Mutex::new(Some(shutdown_tx)),
            worker: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queue raw event bodies for `tenant_id`. Never waits on I/O.
    ///
    /// Events that do not fit in the queue are dropped and logged.
    pub fn enqueue(&self, tenant_id: &str, bodies: Vec<Value>) -> Result<EnqueueReceipt, IngestError> {
        if !self.is_accepting() {
            return Err(IngestError::Stopped);
        }

        let ingested_at = Utc::now();
        let mut receipt = EnqueueReceipt::default();
        let total = bodies.len();
        for body in bodies {
            match self.tx.try_send(Event::new(tenant_id, body, ingested_at)) {
                Ok(()) => receipt.accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => receipt.dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    receipt.dropped = total - receipt.accepted;
                    Counters::add(&self.counters.enqueued, receipt.accepted);
                    Counters::add(&self.counters.dropped, receipt.dropped);
                    tracing::error!(
                        tenant_id,
                        dropped = receipt.dropped,
                        "Ingestion worker is gone, events dropped"
                    );
                    return Err(IngestError::Stopped);
                }
            }
        }

        Counters::add(&self.counters.enqueued, receipt.accepted);
        if receipt.dropped > 0 {
            Counters::add(&self.counters.dropped, receipt.dropped);
            tracing::warn!(
                tenant_id,
                dropped = receipt.dropped,
                accepted = receipt.accepted,
                "Ingestion queue full, events dropped"
            );
        }
        Ok(receipt)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            incidents_created: c.incidents_created.load(Ordering::Relaxed),
            incidents_deduplicated: c.incidents_deduplicated.load(Ordering::Relaxed),
            retained: c.retained.load(Ordering::Relaxed),
            queue_depth: self.capacity.saturating_sub(self.tx.capacity()) as u64,
        }
    }

    /// Refuse new events, drain and flush what is queued, then stop the
    /// worker. Safe to call more than once.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown.lock().ok().and_then(|mut s| s.take()) {
            let _ = tx.send(());
        }

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Ingestion worker terminated abnormally");
            }
            let stats = self.stats();
            tracing::info!(
                written = stats.written,
                retained = stats.retained,
                "Ingestion pipeline stopped"
            );
        }
    }
}
