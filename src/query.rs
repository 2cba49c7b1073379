//! Read side: ad-hoc search, trace listing, time-bucketed aggregation and
//! tenant-wide summaries.
//!
//! Every storage read runs under a hard timeout. Expiry or a storage
//! failure produces a partial result with a warning instead of an error;
//! only malformed requests are rejected.

mod condition;
mod engine;
mod stats;
mod timeseries;
mod traces;
mod types;

pub use condition::{Condition, Operator, parse_query};
pub use engine::{FAILED_WARNING, QueryEngine};
pub use stats::{ErrorSummary, FunctionCount, TOP_FUNCTIONS_LIMIT, TopFunctions};
pub use timeseries::{
    Bucket, TimeseriesAggregator, TimeseriesMetric, TimeseriesRequest, TimeseriesResult,
    percentile,
};
pub use traces::{
    DEFAULT_TRACE_LIMIT, MAX_TRACE_LIMIT, TraceDetail, TraceList, TraceListRequest, TraceSummary,
    UNKNOWN_STATUS,
};
pub use types::{
    QueryConfig, QueryError, QueryFilters, QueryRequest, QueryResult, ResourceKind,
    SORT_FIELD_TIMESTAMP, SortSpec, TimeRange,
};
