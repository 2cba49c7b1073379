//! Webhook alert dispatch for newly created incidents.
//!
//! Dispatch never blocks the caller: the alert-rule lookup and every
//! delivery run in a supervised task. Delivery is best-effort; once
//! retries are exhausted the alert is logged and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::storage::{AlertRule, Incident, StorageError, StoragePort};
use crate::task::TaskRegistry;

/// Per-attempt webhook timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for in-flight deliveries.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Timeout for reading the tenant's alert rules.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

fn default_attempt_timeout() -> Duration {
    DEFAULT_ATTEMPT_TIMEOUT
}

fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

fn default_lookup_timeout() -> Duration {
    DEFAULT_LOOKUP_TIMEOUT
}

/// Alert dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Retry schedule: 3 attempts, 1s base, doubling.
    #[serde(default)]
    pub retry: BackoffPolicy,
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(default = "default_lookup_timeout", with = "humantime_serde")]
    pub lookup_timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry: BackoffPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// Alert delivery errors. Logged, never returned to the ingestion path.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook timed out after {0:?}")]
    Timeout(Duration),

    #[error("alert rule lookup failed: {0}")]
    Storage(#[from] StorageError),
}

/// Body POSTed to webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub incident_id: Uuid,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
}

impl From<&Incident> for AlertPayload {
    fn from(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id,
            summary: incident.summary.clone(),
            timestamp: incident.timestamp,
            tenant_id: incident.tenant_id.clone(),
        }
    }
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub dispatches: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    dispatches: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    client: Client,
    storage: Arc<dyn StoragePort>,
    config: AlertConfig,
    counters: Counters,
}

/// Fire-and-forget webhook delivery.
#[derive(Clone)]
pub struct AlertDispatcher {
    inner: Arc<Inner>,
    tasks: TaskRegistry,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("config", &self.inner.config)
            .field("in_flight", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl AlertDispatcher {
    /// # Errors
    /// Returns `AlertError::Client` if the HTTP client cannot be built.
    pub fn new(storage: Arc<dyn StoragePort>, config: AlertConfig) -> Result<Self, AlertError> {
        let client = Client::builder()
            .timeout(config.attempt_timeout)
            .build()
            .map_err(|e| AlertError::Client(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                storage,
                config,
                counters: Counters::default(),
            }),
            tasks: TaskRegistry::new(),
        })
    }

    /// Queue notifications for a newly created incident. Returns immediately.
    pub fn dispatch(&self, incident: Incident) {
        self.inner.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let spawned = self.tasks.spawn("alert-dispatch", async move {
            inner.notify(incident).await;
        });
        if spawned.is_none() {
            tracing::warn!("Alert dispatcher is shut down, alert dropped");
        }
    }

    pub fn stats(&self) -> AlertStats {
        let c = &self.inner.counters;
        AlertStats {
            dispatches: c.dispatches.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Number of `dispatch` calls so far.
    pub fn dispatch_count(&self) -> u64 {
        self.stats().dispatches
    }

    /// Wait up to the configured grace period for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(self.inner.config.shutdown_grace)
            .await;
    }

    pub async fn shutdown_with_timeout(&self, grace: Duration) {
        let aborted = self.tasks.shutdown(grace).await;
        if aborted > 0 {
            tracing::warn!(aborted, "Alert deliveries abandoned at shutdown");
        } else {
            tracing::info!("Alert dispatcher shutdown complete");
        }
    }
}

impl Inner {
    async fn matching_rules(&self, incident: &Incident) -> Result<Vec<AlertRule>, AlertError> {
        let rules = timeout(
            self.config.lookup_timeout,
            self.storage.read_alert_rules(&incident.tenant_id),
        )
        .await
        .map_err(|_| AlertError::Timeout(self.config.lookup_timeout))??;

        Ok(rules
            .into_iter()
            .filter(|rule| rule.matches(incident) && rule.webhook().is_some())
            .collect())
    }

    async fn notify(&self, incident: Incident) {
        let rules = match self.matching_rules(&incident).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(
                    tenant_id = %incident.tenant_id,
                    incident_id = %incident.id,
                    error = %e,
                    "Alert rule lookup failed, alert dropped"
                );
                return;
            }
        };
        if rules.is_empty() {
            return;
        }

        let payload = AlertPayload::from(&incident);
        let deliveries = rules
            .iter()
            .filter_map(|rule| rule.webhook().map(|url| (rule, url)))
            .map(|(rule, url)| self.deliver(rule, url, &payload));
        futures::future::join_all(deliveries).await;
    }

    async fn deliver(&self, rule: &AlertRule, url: &str, payload: &AlertPayload) {
        let attempt_timeout = self.config.attempt_timeout;
        let result = self
            .config
            .retry
            .retry("webhook delivery", |_| async move {
                let response = timeout(
                    attempt_timeout,
                    self.client.post(url).json(payload).send(),
                )
                .await
                .map_err(|_| AlertError::Timeout(attempt_timeout))??;
                response.error_for_status()?;
                Ok::<_, AlertError>(())
            })
            .await;

        match result {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    tenant_id = %payload.tenant_id,
                    incident_id = %payload.incident_id,
                    alert_rule = %rule.id,
                    "Alert delivered"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    tenant_id = %payload.tenant_id,
                    incident_id = %payload.incident_id,
                    alert_rule = %rule.id,
                    url,
                    error = %e,
                    "Alert delivery failed after retries, dropping"
                );
            }
        }
    }
}
