//! Tenant anomaly rules.
//!
//! - [`RuleStore`]: TTL cache over the Storage Port, write-through on changes
//! - [`RuleEngine`]: priority-ordered, first-match evaluation

mod engine;
mod store;

pub use engine::{ConditionError, Operator, RuleEngine, condition_matches, evaluate_rules};
pub use store::{DEFAULT_CACHE_TTL, RuleStore};
