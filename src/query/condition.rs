//! Text query conditions: `field op value [AND field op value ...]`.
//!
//! Fields are dotted payload paths (`metadata.region`). Operators are
//! `==`, `!=`, `>` and `<`. Values may be wrapped in single or double
//! quotes. All conditions must hold for a record to match.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::query::types::QueryError;
use crate::storage::{lookup, stringify};

const CONJUNCTION: &str = " AND ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, IntoStaticStr)]
pub enum Operator {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "<")]
    Lt,
}

impl Operator {
    /// Two-character operators first so `!=` is not read as a bare `=`.
    const SEARCH_ORDER: [Operator; 4] = [Self::Eq, Self::Ne, Self::Gt, Self::Lt];

    pub fn symbol(&self) -> &'static str {
        (*self).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: String,
}

impl Condition {
    /// Evaluate against a JSON record. A missing field never matches.
    ///
    /// `>` and `<` compare numerically when both sides are numbers and
    /// lexically otherwise, so RFC 3339 timestamps order correctly.
    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        let Some(actual) = lookup(record, &self.field).filter(|v| !v.is_null()) else {
            return false;
        };
        let actual = stringify(actual);

        match self.operator {
            Operator::Eq => actual == self.value,
            Operator::Ne => actual != self.value,
            Operator::Gt => compare(&actual, &self.value) == Ordering::Greater,
            Operator::Lt => compare(&actual, &self.value) == Ordering::Less,
        }
    }
}

fn compare(actual: &str, expected: &str) -> Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.total_cmp(&b),
        _ => actual.cmp(expected),
    }
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| {
            value
                .strip_prefix(*q)
                .and_then(|rest| rest.strip_suffix(*q))
        })
        .unwrap_or(value)
}

fn parse_condition(part: &str) -> Result<Condition, QueryError> {
    let (operator, idx) = Operator::SEARCH_ORDER
        .iter()
        .find_map(|op| part.find(op.symbol()).map(|idx| (*op, idx)))
        .ok_or_else(|| QueryError::InvalidQuery(format!("no valid operator found in '{part}'")))?;

    let field = part[..idx].trim();
    let value = part[idx + operator.symbol().len()..].trim();
    if field.is_empty() {
        return Err(QueryError::InvalidQuery(format!("missing field in '{part}'")));
    }
    if value.is_empty() {
        return Err(QueryError::InvalidQuery(format!("missing value in '{part}'")));
    }

    Ok(Condition {
        field: field.to_string(),
        operator,
        value: unquote(value).to_string(),
    })
}

/// Parse a query string. Blank input yields no conditions.
pub fn parse_query(query: &str) -> Result<Vec<Condition>, QueryError> {
    query
        .split(CONJUNCTION)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_condition)
        .collect()
}

/// Whether every condition holds.
pub fn matches_all(conditions: &[Condition], record: &Map<String, Value>) -> bool {
    conditions.iter().all(|c| c.matches(record))
}
