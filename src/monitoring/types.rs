use serde::Deserialize;
use std::time::{Duration, SystemTime};

/// Configuration for the monitoring channel
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often the aggregator logs metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// A monitoring event emitted by a shard worker
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Shard the event relates to
    pub shard_id: String,
    pub event_type: ProcessingEventType,
}

#[derive(Debug, Clone)]
pub enum ProcessingEventType {
    ShardEvent {
        event_type: ShardEventType,
        details: Option<String>,
    },
    Iterator {
        event_type: IteratorEventType,
        error: Option<String>,
    },
    BatchDispatched {
        record_count: usize,
        handler_failures: usize,
        duration: Duration,
        millis_behind_latest: Option<i64>,
    },
    Checkpoint {
        sequence_number: String,
        status: CheckpointStatus,
        error: Option<String>,
    },
}

/// Shard worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEventType {
    Started,
    /// Shard was sealed and read to the end
    Exhausted,
    /// Stopped on request
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorEventType {
    /// First iterator for the worker
    Initial,
    /// Iterator re-acquired after expiry
    Renewed,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Advanced,
    /// Store already held this or a later position
    Skipped,
    Failed,
}

impl ProcessingEvent {
    fn now(shard_id: impl Into<String>, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id: shard_id.into(),
            event_type,
        }
    }

    pub fn shard_event(
        shard_id: impl Into<String>,
        event_type: ShardEventType,
        details: Option<String>,
    ) -> Self {
        Self::now(shard_id, ProcessingEventType::ShardEvent { event_type, details })
    }

    pub fn iterator(
        shard_id: impl Into<String>,
        event_type: IteratorEventType,
        error: Option<String>,
    ) -> Self {
        Self::now(shard_id, ProcessingEventType::Iterator { event_type, error })
    }

    pub fn batch_dispatched(
        shard_id: impl Into<String>,
        record_count: usize,
        handler_failures: usize,
        duration: Duration,
        millis_behind_latest: Option<i64>,
    ) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::BatchDispatched {
                record_count,
                handler_failures,
                duration,
                millis_behind_latest,
            },
        )
    }

    pub fn checkpoint(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
        status: CheckpointStatus,
        error: Option<String>,
    ) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::Checkpoint {
                sequence_number: sequence_number.into(),
                status,
                error,
            },
        )
    }
}
