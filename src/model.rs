//! Stream, shard and record types shared by every component

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;

/// Lifecycle status of a stream
///
/// `NotExist` is synthetic: the service reports absence as an error, which
/// [`StreamAdmin::stream_status`](crate::admin::StreamAdmin::stream_status) folds into a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    NotExist,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Creating => "CREATING",
            StreamStatus::Active => "ACTIVE",
            StreamStatus::Updating => "UPDATING",
            StreamStatus::Deleting => "DELETING",
            StreamStatus::NotExist => "NOT_EXIST",
        }
    }

    /// Parse a status string as reported by the service
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATING" => Some(StreamStatus::Creating),
            "ACTIVE" => Some(StreamStatus::Active),
            "UPDATING" => Some(StreamStatus::Updating),
            "DELETING" => Some(StreamStatus::Deleting),
            "NOT_EXIST" => Some(StreamStatus::NotExist),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, StreamStatus::Active)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a record within its shard
///
/// Sequence numbers are decimal strings of varying length. Ordering is
/// numeric, so `"10"` sorts after `"9"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    /// Width of [`sortable_key`](Self::sortable_key); the service caps sequence numbers at 128 digits
    pub const SORTABLE_WIDTH: usize = 128;

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digits(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }

    /// Fixed-width, zero-padded form whose lexicographic order matches numeric order
    pub fn sortable_key(&self) -> String {
        format!("{:0>width$}", self.digits(), width = Self::SORTABLE_WIDTH)
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.digits(), other.digits());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceNumber {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SequenceNumber {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Point-in-time description of one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    /// Second parent when the shard was produced by a merge
    pub adjacent_parent_shard_id: Option<String>,
    pub starting_sequence_number: Option<SequenceNumber>,
    /// Present once the shard is sealed by a split or merge
    pub ending_sequence_number: Option<SequenceNumber>,
}

impl ShardDescription {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            adjacent_parent_shard_id: None,
            starting_sequence_number: None,
            ending_sequence_number: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_shard_id = Some(parent.into());
        self
    }

    pub fn with_adjacent_parent(mut self, parent: impl Into<String>) -> Self {
        self.adjacent_parent_shard_id = Some(parent.into());
        self
    }

    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.parent_shard_id
            .as_deref()
            .into_iter()
            .chain(self.adjacent_parent_shard_id.as_deref())
    }

    pub fn is_closed(&self) -> bool {
        self.ending_sequence_number.is_some()
    }
}

/// One page of a stream description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub stream_name: String,
    pub status: StreamStatus,
    pub shards: Vec<ShardDescription>,
    pub has_more_shards: bool,
}

/// One page of stream names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPage {
    pub stream_names: Vec<String>,
    pub has_more: bool,
}

/// A record read from, or destined for, a stream
#[derive(Debug, Clone)]
pub struct Record {
    pub partition_key: String,
    pub data: Bytes,
    pub sequence_number: Option<SequenceNumber>,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(partition_key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            partition_key: partition_key.into(),
            data: data.into(),
            sequence_number: None,
            approximate_arrival: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence: impl Into<SequenceNumber>) -> Self {
        self.sequence_number = Some(sequence.into());
        self
    }

    /// Payload decoded as UTF-8, if it is valid
    pub fn data_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

// Arrival time is assigned by the service and does not identify a record.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.partition_key == other.partition_key
            && self.data == other.data
            && self.sequence_number == other.sequence_number
    }
}

impl Eq for Record {}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record{{partition_key='{}'", self.partition_key)?;
        if let Some(seq) = &self.sequence_number {
            write!(f, ", sequence_number='{}'", seq)?;
        }
        match self.data_as_str() {
            Some(text) => write!(f, ", data='{}'}}", text),
            None => write!(f, ", data=<{} bytes>}}", self.data.len()),
        }
    }
}

/// Result of one read against a shard iterator
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// `None` once the shard is sealed and fully read
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

/// Where a new shard iterator starts reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    TrimHorizon,
    Latest,
    AtSequenceNumber(SequenceNumber),
    AfterSequenceNumber(SequenceNumber),
}

impl IteratorPosition {
    pub fn type_name(&self) -> &'static str {
        match self {
            IteratorPosition::TrimHorizon => "TRIM_HORIZON",
            IteratorPosition::Latest => "LATEST",
            IteratorPosition::AtSequenceNumber(_) => "AT_SEQUENCE_NUMBER",
            IteratorPosition::AfterSequenceNumber(_) => "AFTER_SEQUENCE_NUMBER",
        }
    }

    pub fn sequence_number(&self) -> Option<&SequenceNumber> {
        match self {
            IteratorPosition::AtSequenceNumber(seq) | IteratorPosition::AfterSequenceNumber(seq) => {
                Some(seq)
            }
            _ => None,
        }
    }
}

/// Configured starting point for shards with no checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingPosition {
    /// Oldest record still retained
    #[default]
    TrimHorizon,
    /// Only records written after the iterator is created
    Latest,
}

impl From<StartingPosition> for IteratorPosition {
    fn from(position: StartingPosition) -> Self {
        match position {
            StartingPosition::TrimHorizon => IteratorPosition::TrimHorizon,
            StartingPosition::Latest => IteratorPosition::Latest,
        }
    }
}

/// Entry of a batched write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordsEntry {
    pub partition_key: String,
    pub data: Bytes,
    pub explicit_hash_key: Option<String>,
}

/// Per-entry result of a batched write, aligned by index with the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Success {
        shard_id: String,
        sequence_number: SequenceNumber,
    },
    Failure {
        error_code: String,
        error_message: Option<String>,
    },
}

impl PutOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PutOutcome::Success { .. })
    }
}
