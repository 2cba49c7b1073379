//! Time-bucketed aggregation over stored events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::time::timeout;

use crate::query::engine::{FAILED_WARNING, timeout_warning};
use crate::query::types::{QueryConfig, QueryError};
use crate::storage::{Event, EventFilter, SortOrder, StoragePort, stringify};

/// Which derived series becomes `value`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeseriesMetric {
    #[default]
    ExecutionCount,
    ErrorRate,
    LatencyAvg,
    LatencyP95,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesRequest {
    pub tenant_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_seconds: i64,
    #[serde(default)]
    pub metric: TimeseriesMetric,
    /// Equality on top-level payload fields.
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
}

impl TimeseriesRequest {
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.interval_seconds <= 0 {
            return Err(QueryError::InvalidInterval);
        }
        if self.start > self.end {
            return Err(QueryError::InvalidTimeRange);
        }
        Ok(())
    }

    fn page_filter(&self) -> EventFilter {
        EventFilter {
            start: Some(self.start),
            end: Some(self.end),
            attributes: self
                .filters
                .iter()
                .map(|(k, v)| (k.clone(), stringify(v)))
                .collect(),
            order: SortOrder::Asc,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start.
    pub timestamp: DateTime<Utc>,
    pub count: u64,
    pub errors: u64,
    /// Percentage of failed executions.
    pub error_rate: f64,
    pub avg_duration: f64,
    pub p95_duration: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesResult {
    pub buckets: Vec<Bucket>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Linear-interpolated percentile. `p` is in `0..=100`; empty input yields 0.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let k = (sorted.len() - 1) as f64 * (p.clamp(0.0, 100.0) / 100.0);
    let lo = k.floor() as usize;
    let hi = k.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (k - lo as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Start of the bucket containing `ts`, in epoch seconds.
fn bucket_start(ts: DateTime<Utc>, interval_seconds: i64) -> i64 {
    ts.timestamp().div_euclid(interval_seconds) * interval_seconds
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    errors: u64,
    latencies: Vec<f64>,
}

impl Accumulator {
    fn add(&mut self, event: &Event) {
        self.count += 1;
        if event.is_failed() {
            self.errors += 1;
        }
        self.latencies.push(event.duration.unwrap_or(0.0));
    }

    fn finish(self, start: i64, metric: TimeseriesMetric) -> Option<Bucket> {
        let timestamp = Utc.timestamp_opt(start, 0).single()?;
        let count = self.count as f64;
        let error_rate = round2(self.errors as f64 / count * 100.0);
        let avg_duration = round2(self.latencies.iter().sum::<f64>() / count);
        let p95_duration = round2(percentile(&self.latencies, 95.0));
        let value = match metric {
            TimeseriesMetric::ExecutionCount => count,
            TimeseriesMetric::ErrorRate => error_rate,
            TimeseriesMetric::LatencyAvg => avg_duration,
            TimeseriesMetric::LatencyP95 => p95_duration,
        };
        Some(Bucket {
            timestamp,
            count: self.count,
            errors: self.errors,
            error_rate,
            avg_duration,
            p95_duration,
            value,
        })
    }
}

/// Pages through a tenant's events and folds them into fixed-width buckets.
#[derive(Clone)]
pub struct TimeseriesAggregator {
    storage: Arc<dyn StoragePort>,
    config: QueryConfig,
}

impl std::fmt::Debug for TimeseriesAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeseriesAggregator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TimeseriesAggregator {
    pub fn new(storage: Arc<dyn StoragePort>, config: QueryConfig) -> Self {
        Self { storage, config }
    }

    /// Visit every event matching `filter` in ascending order, one page at
    /// a time. Returns how many events were visited and, if a page failed
    /// or timed out, the warning for the partial result.
    pub(super) async fn scan(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        mut visit: impl FnMut(&Event),
    ) -> (usize, Option<String>) {
        let page_size = self.config.page_size.max(1);
        let mut cursor = None;
        let mut scanned = 0usize;

        loop {
            let read = self
                .storage
                .scan_events(tenant_id, filter, page_size, cursor);
            let page = match timeout(self.config.timeout, read).await {
                Ok(Ok(page)) => page,
                Ok(Err(e)) => {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        scanned,
                        error = %e,
                        "Event page read failed"
                    );
                    return (scanned, Some(FAILED_WARNING.to_string()));
                }
                Err(_) => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        scanned,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "Event page read timed out"
                    );
                    return (scanned, Some(timeout_warning(&self.config)));
                }
            };

            page.events.iter().for_each(&mut visit);
            scanned += page.events.len();
            match page.next {
                Some(next) => cursor = Some(next),
                None => return (scanned, None),
            }
        }
    }

    /// Aggregate events in `[start, end]`.
    ///
    /// Only one page of events is held at a time. A page that fails or
    /// times out stops the scan and the buckets built so far are returned
    /// with `partial` set.
    pub async fn aggregate(
        &self,
        request: &TimeseriesRequest,
    ) -> Result<TimeseriesResult, QueryError> {
        request.validate()?;

        let filter = request.page_filter();
        let mut buckets: HashMap<i64, Accumulator> = HashMap::new();
        let (scanned, warning) = self
            .scan(&request.tenant_id, &filter, |event| {
                buckets
                    .entry(bucket_start(event.timestamp, request.interval_seconds))
                    .or_default()
                    .add(event);
            })
            .await;

        let mut starts: Vec<i64> = buckets.keys().copied().collect();
        starts.sort_unstable();
        let buckets: Vec<Bucket> = starts
            .into_iter()
            .filter_map(|start| {
                buckets
                    .remove(&start)
                    .and_then(|acc| acc.finish(start, request.metric))
            })
            .collect();

        tracing::debug!(
            tenant_id = %request.tenant_id,
            metric = %request.metric,
            events = scanned,
            buckets = buckets.len(),
            partial = warning.is_some(),
            "Timeseries aggregated"
        );

        Ok(TimeseriesResult {
            buckets,
            partial: warning.is_some(),
            warning,
        })
    }
}
