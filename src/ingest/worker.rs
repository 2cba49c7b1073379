//! The ingestion worker loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};

use crate::detector::UNKNOWN_EXECUTION;
use crate::fanout::LiveEvent;
use crate::graph::{UNKNOWN_NODE, primary_node_name};
use crate::ingest::batch::BatchBuffer;
use crate::ingest::{Counters, PipelineConfig, PipelineDeps};
use crate::storage::{DetectedFailure, Event, Incident, Rule};
use crate::stream::IngestNotice;

/// Detection produced for one event, and whether it should alert.
struct Detection {
    failure: DetectedFailure,
    notify: bool,
}

/// Detection derived from a rule whose actions create an incident.
fn rule_detection(rule: &Rule, event: &Event) -> Detection {
    Detection {
        failure: DetectedFailure {
            tenant_id: event.tenant_id.clone(),
            execution_id: event
                .execution_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_EXECUTION.to_string()),
            timestamp: event.timestamp,
            failure_type: rule.condition.kind.to_string(),
            node_name: primary_node_name(&event.payload).unwrap_or_else(|| UNKNOWN_NODE.to_string()),
            summary: format!("Rule '{}' triggered", rule.name),
        },
        notify: rule.actions.notify,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Worker {
    config: PipelineConfig,
    deps: PipelineDeps,
    rx: mpsc::Receiver<Event>,
    counters: Arc<Counters>,
    buffer: BatchBuffer<Event>,
    retained: VecDeque<Event>,
    retry_at: Option<Instant>,
    consecutive_failures: u32,
    dedup_window: chrono::Duration,
}

impl Worker {
    pub(crate) fn new(
        config: PipelineConfig,
        deps: PipelineDeps,
        rx: mpsc::Receiver<Event>,
        counters: Arc<Counters>,
    ) -> Self {
        let dedup_window =
            chrono::Duration::from_std(config.dedup_window).unwrap_or(chrono::Duration::hours(24));
        Self {
            buffer: BatchBuffer::new(config.max_batch_size, config.flush_interval),
            config,
            deps,
            rx,
            counters,
            retained: VecDeque::new(),
            retry_at: None,
            consecutive_failures: 0,
            dedup_window,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let deadline = match (self.buffer.deadline(), self.retry_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                biased;

                _ = &mut shutdown => break,
                received = self.rx.recv() => match received {
                    Some(event) => {
                        self.buffer.push(event);
                        if self.buffer.is_full() {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = sleep_until_opt(deadline) => {
                    if self.buffer.should_flush() {
                        self.flush().await;
                    }
                    if self.retry_at.is_some_and(|at| at <= Instant::now()) {
                        self.retry_retained().await;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Final pass at shutdown: everything queued is flushed once and the
    /// retained buffer gets one last write attempt.
    async fn drain(&mut self) {
        self.rx.close();
        while let Some(event) = self.rx.recv().await {
            self.buffer.push(event);
            if self.buffer.is_full() {
                self.flush().await;
            }
        }
        self.flush().await;
        self.retry_retained().await;

        if !self.retained.is_empty() {
            tracing::error!(
                lost = self.retained.len(),
                "Retained events could not be written before shutdown"
            );
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = self.buffer.take();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        let written = self.write(&batch).await;

        // Live delivery and detection do not wait on persistence.
        for event in &batch {
            self.process(event).await;
        }

        if !written {
            self.retain(batch);
            self.schedule_retry();
        }
    }

    /// Re-write retained events. Detection already ran for them.
    async fn retry_retained(&mut self) {
        if self.retained.is_empty() {
            self.retry_at = None;
            return;
        }
        let events: Vec<Event> = self.retained.drain(..).collect();
        if self.write(&events).await {
            tracing::info!(count = events.len(), "Retained events written");
            self.retry_at = None;
        } else {
            self.retained = events.into();
            self.schedule_retry();
        }
        self.counters
            .retained
            .store(self.retained.len() as u64, Ordering::Relaxed);
    }

    async fn write(&mut self, events: &[Event]) -> bool {
        let result = timeout(
            self.config.write_timeout,
            self.deps.storage.write_event_batch(events),
        )
        .await;

        let error = match result {
            Ok(Ok(())) => {
                Counters::add(&self.counters.written, events.len());
                self.consecutive_failures = 0;
                tracing::debug!(count = events.len(), "Batch written");
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write timed out after {:?}", self.config.write_timeout),
        };

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
        if self.consecutive_failures >= self.config.failure_alert_threshold {
            tracing::error!(
                count = events.len(),
                consecutive_failures = self.consecutive_failures,
                error = %error,
                "Batch write keeps failing"
            );
        } else {
            tracing::warn!(
                count = events.len(),
                consecutive_failures = self.consecutive_failures,
                error = %error,
                "Batch write failed, retaining events for retry"
            );
        }
        false
    }

    fn retain(&mut self, batch: Vec<Event>) {
        self.retained.extend(batch);
        let excess = self
            .retained
            .len()
            .saturating_sub(self.config.max_retained_events);
        if excess > 0 {
            self.retained.drain(..excess);
            Counters::add(&self.counters.dropped, excess);
            tracing::error!(
                dropped = excess,
                cap = self.config.max_retained_events,
                "Retained buffer full, oldest events dropped"
            );
        }
        self.counters
            .retained
            .store(self.retained.len() as u64, Ordering::Relaxed);
    }

    fn schedule_retry(&mut self) {
        let delay = self
            .config
            .retry_backoff
            .delay_for(self.consecutive_failures.max(1));
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn process(&self, event: &Event) {
        let deps = &self.deps;
        deps.stream.publish(IngestNotice::ingested(
            event.tenant_id.clone(),
            event.execution_id.clone(),
            event.ingested_at,
        ));

        let detection = match self.matching_rule(event).await {
            Some(rule) => {
                deps.fanout
                    .publish(&event.tenant_id, &LiveEvent::rule_triggered(&rule, event));
                rule.actions
                    .create_incident
                    .then(|| rule_detection(&rule, event))
            }
            None => deps.detector.detect(event).map(|failure| Detection {
                failure,
                notify: true,
            }),
        };

        let created = match detection {
            Some(detection) => self.record_incident(detection).await,
            None => None,
        };

        deps.fanout
            .publish(&event.tenant_id, &LiveEvent::execution(event));
        if let Some(incident) = created {
            deps.fanout
                .publish(&event.tenant_id, &LiveEvent::incident(&incident));
        }
    }

    /// Winning rule, or `None` on no match, error or timeout.
    async fn matching_rule(&self, event: &Event) -> Option<Rule> {
        match timeout(self.config.rule_timeout, self.deps.rules.evaluate(event)).await {
            Ok(Ok(rule)) => rule,
            Ok(Err(e)) => {
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    error = %e,
                    "Rule evaluation failed, treating as no match"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    timeout_ms = self.config.rule_timeout.as_millis() as u64,
                    "Rule evaluation timed out, treating as no match"
                );
                None
            }
        }
    }

    /// Upsert the incident; dispatch alerts only for a newly created one.
    async fn record_incident(&self, detection: Detection) -> Option<Incident> {
        let Detection { failure, notify } = detection;
        let upsert = self
            .deps
            .storage
            .upsert_incident_by_fingerprint(&failure, self.dedup_window);

        match timeout(self.config.incident_timeout, upsert).await {
            Ok(Ok((incident, true))) => {
                self.counters
                    .incidents_created
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    tenant_id = %incident.tenant_id,
                    incident_id = %incident.id,
                    failure_type = %incident.failure_type,
                    node_name = %incident.node_name,
                    "Incident created"
                );
                if notify {
                    self.deps.alerts.dispatch(incident.clone());
                }
                Some(incident)
            }
            Ok(Ok((incident, false))) => {
                self.counters
                    .incidents_deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tenant_id = %incident.tenant_id,
                    incident_id = %incident.id,
                    occurrence_count = incident.occurrence_count,
                    "Incident occurrence recorded"
                );
                None
            }
            Ok(Err(e)) => {
                tracing::error!(
                    tenant_id = %failure.tenant_id,
                    fingerprint = %failure.fingerprint(),
                    error = %e,
                    "Incident upsert failed"
                );
                None
            }
            Err(_) => {
                tracing::error!(
                    tenant_id = %failure.tenant_id,
                    fingerprint = %failure.fingerprint(),
                    "Incident upsert timed out"
                );
                None
            }
        }
    }
}
