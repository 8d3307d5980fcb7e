//! Test utilities: scripted mocks and a simulated stream service

pub mod stream;

pub use mocks::{MockCheckpointStore, MockRecordHandler, MockStreamGateway};
pub use stream::InMemoryStreamGateway;

use crate::model::{Record, RecordBatch, ShardDescription, StreamDescription, StreamStatus};
use crate::retry::RetryConfig;
use std::time::Duration;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with given sequence number and data
    pub fn create_test_record(sequence_number: &str, data: &str) -> Record {
        Record::new("test-partition-key", data.to_string()).with_sequence_number(sequence_number)
    }

    /// Records with sequence numbers `start..start + count` and payloads `data-<seq>`
    pub fn create_test_records(start: u64, count: usize) -> Vec<Record> {
        (start..start + count as u64)
            .map(|seq| Self::create_test_record(&seq.to_string(), &format!("data-{}", seq)))
            .collect()
    }

    pub fn create_test_batch(records: Vec<Record>, next_iterator: Option<&str>) -> RecordBatch {
        RecordBatch {
            records,
            next_iterator: next_iterator.map(String::from),
            millis_behind_latest: Some(0),
        }
    }

    pub fn create_stream_description(
        stream_name: &str,
        shards: Vec<ShardDescription>,
    ) -> StreamDescription {
        StreamDescription {
            stream_name: stream_name.to_string(),
            status: StreamStatus::Active,
            shards,
            has_more_shards: false,
        }
    }

    /// Retry settings with millisecond delays and no jitter
    pub fn fast_retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter_factor: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_records() {
        let records = TestUtils::create_test_records(1, 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence_number.as_ref().map(|s| s.as_str()), Some("1"));
        assert_eq!(records[2].data_as_str(), Some("data-3"));
        assert_eq!(records[0].partition_key, "test-partition-key");
    }
}
