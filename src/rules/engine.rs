//! Rule evaluation.

use std::str::FromStr;

use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::detector::contains_marker;
use crate::rules::store::RuleStore;
use crate::storage::{ConditionType, Event, Rule, StorageError};

/// Markers that count as an error for `node_error_rate`.
const ERROR_MARKERS: [&str; 2] = ["error", "exception"];

/// Errors raised while evaluating one rule condition.
#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("missing parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("parameter '{name}' is not numeric: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("field '{field}' is not numeric: {value}")]
    NotNumeric { field: String, value: String },

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}

/// Comparison operator for `custom_expression`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Operator {
    #[default]
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Operator {
    pub fn evaluate(&self, value: f64, target: f64) -> bool {
        match self {
            Self::Gt => value > target,
            Self::Gte => value >= target,
            Self::Lt => value < target,
            Self::Lte => value <= target,
            Self::Eq => (value - target).abs() < f64::EPSILON,
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numeric parameter, or `default` when absent.
fn param_f64(
    params: &Map<String, Value>,
    name: &'static str,
    default: f64,
) -> Result<f64, ConditionError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => as_number(value).ok_or_else(|| ConditionError::InvalidParameter {
            name,
            value: value.to_string(),
        }),
    }
}

/// Whether a single rule's condition holds for `event`.
pub fn condition_matches(rule: &Rule, event: &Event) -> Result<bool, ConditionError> {
    let params = &rule.condition.parameters;
    match rule.condition.kind {
        ConditionType::ExecutionLatency => {
            let threshold = param_f64(params, "threshold", 0.0)?;
            Ok(event.duration.is_some_and(|d| d > threshold))
        }
        ConditionType::DivergenceDetected => Ok(event
            .metadata()
            .and_then(|m| m.get("diverged"))
            .and_then(Value::as_bool)
            .unwrap_or(false)),
        ConditionType::NodeErrorRate => {
            let threshold = param_f64(params, "threshold", 1.0)?;
            if threshold > 1.0 {
                return Ok(false);
            }
            let top_level = event
                .payload
                .get("metadata")
                .is_some_and(|m| contains_marker(m, &ERROR_MARKERS));
            Ok(top_level
                || event.nodes().iter().any(|node| {
                    node.get("metadata")
                        .is_some_and(|m| contains_marker(m, &ERROR_MARKERS))
                }))
        }
        ConditionType::ClusterAnomaly => {
            let threshold = param_f64(params, "threshold", 100.0)?;
            let size = event
                .payload
                .get("cluster_size")
                .or_else(|| event.metadata().and_then(|m| m.get("cluster_size")))
                .and_then(as_number);
            Ok(size.is_some_and(|s| s > threshold))
        }
        ConditionType::CustomExpression => {
            let field = params
                .get("field")
                .and_then(Value::as_str)
                .filter(|f| !f.is_empty())
                .ok_or(ConditionError::MissingParameter("field"))?;
            let target = match params.get("value") {
                Some(value) => as_number(value).ok_or_else(|| ConditionError::InvalidParameter {
                    name: "value",
                    value: value.to_string(),
                })?,
                None => return Err(ConditionError::MissingParameter("value")),
            };
            let operator = match params.get("operator").and_then(Value::as_str) {
                Some(op) => Operator::from_str(op)
                    .map_err(|_| ConditionError::UnknownOperator(op.to_string()))?,
                None => Operator::default(),
            };

            let Some(raw) = event.field(field) else {
                return Ok(false);
            };
            let value = as_number(raw).ok_or_else(|| ConditionError::NotNumeric {
                field: field.to_string(),
                value: raw.to_string(),
            })?;
            Ok(operator.evaluate(value, target))
        }
    }
}

/// First enabled rule, by priority descending, whose condition matches.
///
/// Rules below the winner are never evaluated. A failing condition counts
/// as a non-match for that rule only.
pub fn evaluate_rules<'a>(rules: &'a [Rule], event: &Event) -> Option<&'a Rule> {
    let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut evaluated = 0usize;
    for rule in ordered {
        evaluated += 1;
        match condition_matches(rule, event) {
            Ok(true) => {
                tracing::debug!(
                    tenant_id = %event.tenant_id,
                    rule_id = %rule.id,
                    name = %rule.name,
                    evaluated,
                    "Rule triggered"
                );
                return Some(rule);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    rule_id = %rule.id,
                    condition = %rule.condition.kind,
                    error = %e,
                    "Rule condition failed, treating as no match"
                );
            }
        }
    }
    None
}

/// Evaluates tenant rules against events.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    store: RuleStore,
}

impl RuleEngine {
    pub fn new(store: RuleStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// The winning rule for `event`, if any.
    pub async fn evaluate(&self, event: &Event) -> Result<Option<Rule>, StorageError> {
        let rules = self.store.get_rules(&event.tenant_id).await?;
        Ok(evaluate_rules(&rules, event).cloned())
    }
}
