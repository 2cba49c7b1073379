//! TemporalLayr - execution-trace ingestion and live distribution engine.
//!
//! Accepts batches of arbitrary execution-trace events per tenant, persists
//! them, detects failures against built-in heuristics and tenant rules,
//! deduplicates recurring failures into incidents, fires webhook alerts and
//! streams live frames to subscribed viewers. The producer never waits on
//! storage and no partial failure takes the process down.
//!
//! # Architecture
//!
//! - **Ingestion**: bounded queue, size/time batching, retained-batch retry
//! - **Detection**: [`FailureDetector`] heuristics and the tenant [`RuleEngine`]
//! - **Incidents**: fingerprint dedup in the Storage Port
//! - **Alerts**: supervised webhook delivery with backoff
//! - **Fanout**: per-subscriber bounded queues, drop-oldest backpressure
//! - **Query**: timeout-guarded search and time-bucketed aggregation
//!
//! # Example
//!
//! ```rust,ignore
//! use temporallayr::{
//!     AlertDispatcher, EventStream, FailureDetector, FanoutBroadcaster, IngestionPipeline,
//!     PipelineConfig, PipelineDeps, RuleEngine, RuleStore, StorageBuilder,
//! };
//!
//! let storage = StorageBuilder::new("memory:").build().await?;
//! let deps = PipelineDeps {
//!     storage: storage.clone(),
//!     rules: RuleEngine::new(RuleStore::new(storage.clone())),
//!     detector: FailureDetector::new(),
//!     alerts: AlertDispatcher::new(storage.clone(), Default::default())?,
//!     fanout: FanoutBroadcaster::default(),
//!     stream: EventStream::default(),
//! };
//! let pipeline = IngestionPipeline::start(PipelineConfig::default(), deps);
//! pipeline.enqueue("acme", vec![serde_json::json!({"execution_id": "e1", "status": "OK"})])?;
//! pipeline.stop().await;
//! ```

pub mod alert;
pub mod backoff;
pub mod config;
pub mod detector;
pub mod fanout;
pub mod graph;
pub mod ingest;
pub mod query;
pub mod rules;
pub mod server;
pub mod storage;
pub mod stream;
pub mod task;

pub use alert::{AlertConfig, AlertDispatcher, AlertError, AlertStats};
pub use backoff::BackoffPolicy;
pub use config::{AppConfig, ConfigError};
pub use detector::FailureDetector;
pub use fanout::{FanoutBroadcaster, FanoutConfig, FrameSink, StreamFrame, SubscriptionFilter};
pub use ingest::{IngestError, IngestionPipeline, PipelineConfig, PipelineDeps, PipelineStats};
pub use query::{QueryEngine, QueryRequest, QueryResult, TimeseriesAggregator};
pub use rules::{RuleEngine, RuleStore};
pub use storage::{MemoryStore, StorageBuilder, StorageError, StoragePort};
pub use stream::EventStream;
pub use task::TaskRegistry;
