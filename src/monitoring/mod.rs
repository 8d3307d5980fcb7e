//! Monitoring events emitted by shard workers and their aggregation
//!
//! Events are delivered over an optional bounded channel; a full channel
//! applies backpressure to the worker that produced the event.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, ShardMetrics};
pub use types::{
    CheckpointStatus, IteratorEventType, MonitoringConfig, ProcessingEvent, ProcessingEventType,
    ShardEventType,
};
