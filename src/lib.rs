//! Kinesis Shard Runtime - shard-parallel consume/produce for Kinesis-style streams
//!
//! The consumer runs one worker per shard, fans each batch out to every
//! attached handler, and checkpoints progress so a restart resumes where the
//! previous run stopped. The producer writes records in batches and resubmits
//! only the entries that failed.
//!
//! All remote access goes through the [`StreamGateway`] trait; the
//! aws-sdk-kinesis implementation is [`KinesisGateway`].

pub mod admin;
pub mod catalog;
pub mod client;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod model;
pub mod monitoring;
pub mod producer;
pub mod retry;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use error::{CheckpointError, ErrorKind, GatewayError, HandlerError, Result, StreamError};
pub use model::{
    IteratorPosition, PutOutcome, PutRecordsEntry, Record, RecordBatch, SequenceNumber,
    ShardDescription, StartingPosition, StreamDescription, StreamPage, StreamStatus,
};

// Re-export main traits
pub use crate::client::StreamGateway;
pub use crate::handler::RecordHandler;
pub use crate::store::CheckpointStore;

pub use admin::StreamAdmin;
pub use catalog::{ShardCatalog, ShardLineage};
pub use client::{ClientKey, GatewayRegistry, KinesisGateway};
pub use consumer::{
    ConsumeEngine, ConsumeReport, ConsumerConfig, ConsumerHandle, ShardOutcome, ShardState,
};
pub use handler::{
    BatchContext, DebugLogHandler, DispatchSummary, FileAppendHandler, HandlerSet, HandlerSpec,
    StdoutHandler,
};
pub use monitoring::{MetricsAggregator, MonitoringConfig, ProcessingEvent};
pub use producer::{
    FailedRecord, ProduceEngine, ProduceRecord, ProduceReport, ProducerConfig,
    MAX_PUT_RECORDS_BATCH,
};
pub use retry::{Backoff, ExponentialBackoff, RetryConfig};
pub use store::{CheckpointOutcome, InMemoryCheckpointStore, RegressionPolicy};

#[cfg(feature = "dynamodb-store")]
pub use crate::store::DynamoDbCheckpointStore;
