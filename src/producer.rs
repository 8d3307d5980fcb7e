//! Batched writes with partial-failure retry
//!
//! [`ProduceEngine::produce`] splits records into batches no larger than the
//! service limit and submits several batches concurrently. Each batch result
//! is aligned by index with its request; only the entries that failed are
//! resubmitted, after an exponential backoff, until they succeed or the retry
//! attempts run out. Residual failures are reported in the [`ProduceReport`]
//! rather than raised.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admin::StreamAdmin;
use crate::client::StreamGateway;
use crate::error::{Result, StreamError};
use crate::model::{PutOutcome, PutRecordsEntry};
use crate::retry::{Backoff, RetryConfig};

/// Maximum number of entries the service accepts in one PutRecords call
pub const MAX_PUT_RECORDS_BATCH: usize = 500;

/// Configuration for the producer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub stream_name: String,
    /// Entries per remote call, at most [`MAX_PUT_RECORDS_BATCH`]
    pub max_batch_size: usize,
    pub retry: RetryConfig,
    /// Batches submitted concurrently by one `produce` call
    pub max_in_flight_batches: usize,
    /// Check the stream is ACTIVE before writing
    pub verify_stream_active: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            max_batch_size: MAX_PUT_RECORDS_BATCH,
            retry: RetryConfig::default(),
            max_in_flight_batches: 4,
            verify_stream_active: true,
        }
    }
}

impl ProducerConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(StreamError::ConfigError("stream_name must not be empty".into()));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_PUT_RECORDS_BATCH {
            return Err(StreamError::ConfigError(format!(
                "max_batch_size must be within 1..={}, got {}",
                MAX_PUT_RECORDS_BATCH, self.max_batch_size
            )));
        }
        if self.max_in_flight_batches == 0 {
            return Err(StreamError::ConfigError(
                "max_in_flight_batches must be positive".into(),
            ));
        }
        self.retry.validate().map_err(StreamError::ConfigError)
    }
}

/// Record to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub partition_key: String,
    pub data: Bytes,
    pub explicit_hash_key: Option<String>,
}

impl ProduceRecord {
    pub fn new(partition_key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            partition_key: partition_key.into(),
            data: data.into(),
            explicit_hash_key: None,
        }
    }

    pub fn with_explicit_hash_key(mut self, hash_key: impl Into<String>) -> Self {
        self.explicit_hash_key = Some(hash_key.into());
        self
    }

    /// `n` records with partition keys `pk-i` and payloads `data-i`
    pub fn examples(n: usize) -> Vec<Self> {
        (0..n)
            .map(|i| Self::new(format!("pk-{}", i), format!("data-{}", i)))
            .collect()
    }

    fn to_entry(&self) -> PutRecordsEntry {
        PutRecordsEntry {
            partition_key: self.partition_key.clone(),
            data: self.data.clone(),
            explicit_hash_key: self.explicit_hash_key.clone(),
        }
    }
}

/// Record that could not be written before retries ran out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub record: ProduceRecord,
    pub error_code: String,
    pub error_message: Option<String>,
}

/// Outcome of a produce call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Number of PutRecords calls made, including resubmissions
    pub remote_calls: usize,
    pub failures: Vec<FailedRecord>,
}

impl ProduceReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    fn merge(mut self, other: ProduceReport) -> Self {
        self.submitted += other.submitted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.remote_calls += other.remote_calls;
        self.failures.extend(other.failures);
        self
    }
}

/// Writes records to one stream
pub struct ProduceEngine<G: StreamGateway + ?Sized + 'static> {
    gateway: Arc<G>,
    config: Arc<ProducerConfig>,
}

impl<G: StreamGateway + ?Sized + 'static> Clone for ProduceEngine<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            config: self.config.clone(),
        }
    }
}

impl<G: StreamGateway + ?Sized + 'static> ProduceEngine<G> {
    pub fn new(config: ProducerConfig, gateway: Arc<G>) -> Self {
        Self {
            gateway,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Write every record, waiting until each has succeeded or exhausted its retries
    ///
    /// Only configuration errors and an inactive stream fail the call. Records
    /// that could not be written are counted in the report.
    pub async fn produce(&self, records: Vec<ProduceRecord>) -> Result<ProduceReport> {
        self.config.validate()?;
        if records.is_empty() {
            return Ok(ProduceReport::default());
        }

        if self.config.verify_stream_active {
            StreamAdmin::new(self.gateway.clone(), self.config.retry.clone())
                .ensure_active(&self.config.stream_name)
                .await?;
        }

        let total = records.len();
        let batches = into_batches(records, self.config.max_batch_size);
        debug!(
            stream = %self.config.stream_name,
            records = total,
            batches = batches.len(),
            "Producing records"
        );

        let report = stream::iter(batches)
            .map(|batch| self.produce_batch(batch))
            .buffer_unordered(self.config.max_in_flight_batches)
            .fold(ProduceReport::default(), |acc, report| async move { acc.merge(report) })
            .await;

        if report.all_succeeded() {
            info!(
                stream = %self.config.stream_name,
                records = report.succeeded,
                remote_calls = report.remote_calls,
                "Produced records"
            );
        } else {
            warn!(
                stream = %self.config.stream_name,
                succeeded = report.succeeded,
                failed = report.failed,
                remote_calls = report.remote_calls,
                "Produced records with residual failures"
            );
        }
        Ok(report)
    }

    /// Run [`produce`](Self::produce) on a background task
    pub fn spawn_produce(&self, records: Vec<ProduceRecord>) -> JoinHandle<Result<ProduceReport>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.produce(records).await })
    }

    /// Submit one batch, resubmitting failed entries until success or retry exhaustion
    pub async fn produce_batch(&self, batch: Vec<ProduceRecord>) -> ProduceReport {
        let stream = self.config.stream_name.as_str();
        let backoff = self.config.retry.backoff();
        let mut report = ProduceReport {
            submitted: batch.len(),
            ..Default::default()
        };
        let mut pending = batch;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            let entries: Vec<PutRecordsEntry> = pending.iter().map(ProduceRecord::to_entry).collect();
            report.remote_calls += 1;

            let residual = match self.gateway.put_records(stream, &entries).await {
                Ok(outcomes) => {
                    if outcomes.len() != pending.len() {
                        warn!(
                            stream = %stream,
                            requested = pending.len(),
                            returned = outcomes.len(),
                            "PutRecords result not aligned with request"
                        );
                    }
                    let mut outcomes = outcomes.into_iter();
                    let mut failed = Vec::new();
                    for record in pending.drain(..) {
                        match outcomes.next() {
                            Some(PutOutcome::Success { .. }) => report.succeeded += 1,
                            Some(PutOutcome::Failure {
                                error_code,
                                error_message,
                            }) => failed.push(FailedRecord {
                                record,
                                error_code,
                                error_message,
                            }),
                            None => failed.push(FailedRecord {
                                record,
                                error_code: "Unknown".to_string(),
                                error_message: Some("no result for entry".to_string()),
                            }),
                        }
                    }
                    failed
                }
                Err(e) if e.is_retryable() => {
                    warn!(stream = %stream, error = %e, "PutRecords throttled");
                    let code = format!("{:?}", e.kind());
                    pending
                        .drain(..)
                        .map(|record| FailedRecord {
                            record,
                            error_code: code.clone(),
                            error_message: Some(e.to_string()),
                        })
                        .collect()
                }
                Err(e) => {
                    error!(
                        stream = %stream,
                        operation = "PutRecords",
                        records = pending.len(),
                        error = %e,
                        "PutRecords failed"
                    );
                    let code = format!("{:?}", e.kind());
                    report.failed += pending.len();
                    report.failures.extend(pending.drain(..).map(|record| FailedRecord {
                        record,
                        error_code: code.clone(),
                        error_message: Some(e.to_string()),
                    }));
                    return report;
                }
            };

            if residual.is_empty() {
                break;
            }

            if attempt >= self.config.retry.max_retries {
                warn!(
                    stream = %stream,
                    attempts = attempt + 1,
                    failed = residual.len(),
                    "Retry attempts exhausted with failed records"
                );
                report.failed += residual.len();
                report.failures.extend(residual);
                break;
            }
            attempt += 1;

            let delay = backoff.next_delay(attempt);
            warn!(
                stream = %stream,
                attempt,
                failed = residual.len(),
                delay_ms = delay.as_millis() as u64,
                "Resubmitting failed records after delay"
            );
            tokio::time::sleep(delay).await;
            pending = residual.into_iter().map(|f| f.record).collect();
        }

        report
    }
}

fn into_batches(records: Vec<ProduceRecord>, size: usize) -> Vec<Vec<ProduceRecord>> {
    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        batches.push(records.by_ref().take(size).collect());
    }
    batches
}
