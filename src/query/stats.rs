//! Tenant-wide summaries: busiest node names and the failure rate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph;
use crate::query::timeseries::TimeseriesAggregator;
use crate::storage::{EventFilter, SortOrder};

/// How many node names [`TimeseriesAggregator::top_functions`] reports.
pub const TOP_FUNCTIONS_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopFunctions {
    pub items: Vec<FunctionCount>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total_events: u64,
    pub error_events: u64,
    /// Fraction of failed executions, rounded to three places.
    pub error_rate: f64,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn all_events() -> EventFilter {
    EventFilter {
        order: SortOrder::Asc,
        ..Default::default()
    }
}

impl TimeseriesAggregator {
    /// The most frequent node names across a tenant's events.
    ///
    /// Only the flat node list is counted; embedded children are not.
    /// Ties are broken by name.
    pub async fn top_functions(&self, tenant_id: &str) -> TopFunctions {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let (scanned, warning) = self
            .scan(tenant_id, &all_events(), |event| {
                let names = graph::node_list(&event.payload)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_object)
                    .filter_map(graph::node_name);
                for name in names {
                    *counts.entry(name.to_string()).or_default() += 1;
                }
            })
            .await;

        let mut items: Vec<FunctionCount> = counts
            .into_iter()
            .map(|(name, count)| FunctionCount { name, count })
            .collect();
        items.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        items.truncate(TOP_FUNCTIONS_LIMIT);

        tracing::debug!(
            tenant_id = %tenant_id,
            events = scanned,
            names = items.len(),
            "Top functions computed"
        );

        TopFunctions {
            items,
            partial: warning.is_some(),
            warning,
        }
    }

    /// Total executions, failed executions and their ratio.
    pub async fn error_summary(&self, tenant_id: &str) -> ErrorSummary {
        let mut total = 0u64;
        let mut errors = 0u64;
        let (_, warning) = self
            .scan(tenant_id, &all_events(), |event| {
                total += 1;
                if event.is_failed() {
                    errors += 1;
                }
            })
            .await;

        let error_rate = if total > 0 {
            round3(errors as f64 / total as f64)
        } else {
            0.0
        };

        ErrorSummary {
            total_events: total,
            error_events: errors,
            error_rate,
            partial: warning.is_some(),
            warning,
        }
    }
}
