//! In-process simulation of a sharded stream service

use crate::client::StreamGateway;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{
    IteratorPosition, PutOutcome, PutRecordsEntry, Record, RecordBatch, SequenceNumber,
    ShardDescription, StreamDescription, StreamPage, StreamStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use tracing::trace;

const LIST_STREAMS_PAGE: usize = 10;

#[derive(Debug)]
struct SimShard {
    description: ShardDescription,
    records: Vec<Record>,
}

impl SimShard {
    fn is_open(&self) -> bool {
        !self.description.is_closed()
    }
}

#[derive(Debug)]
struct SimStream {
    status: StreamStatus,
    shards: Vec<SimShard>,
}

#[derive(Debug, Clone)]
struct IteratorState {
    stream: String,
    shard_index: usize,
    position: usize,
}

#[derive(Debug, Default)]
struct State {
    streams: BTreeMap<String, SimStream>,
    iterators: HashMap<String, IteratorState>,
    next_iterator: u64,
    next_sequence: u64,
    next_shard: u64,
    put_failures: VecDeque<Vec<usize>>,
    get_records_throttles: usize,
}

impl State {
    fn sequence(&mut self) -> SequenceNumber {
        self.next_sequence += 1;
        SequenceNumber::from(format!("{:020}", self.next_sequence))
    }

    fn shard_id(&mut self) -> String {
        let id = format!("shardId-{:012}", self.next_shard);
        self.next_shard += 1;
        id
    }

    fn issue_iterator(&mut self, stream: &str, shard_index: usize, position: usize) -> String {
        self.next_iterator += 1;
        let token = format!("sim-iterator-{}", self.next_iterator);
        self.iterators.insert(
            token.clone(),
            IteratorState {
                stream: stream.to_string(),
                shard_index,
                position,
            },
        );
        token
    }

    fn stream(&self, name: &str) -> GatewayResult<&SimStream> {
        self.streams
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("Stream {} not found", name)))
    }

    fn stream_mut(&mut self, name: &str) -> GatewayResult<&mut SimStream> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| GatewayError::NotFound(format!("Stream {} not found", name)))
    }
}

/// Simulated stream service
///
/// Streams become ACTIVE immediately. Iterators are single use: every read
/// consumes its token and returns a fresh one, or none once a closed shard
/// has been read to the end. Records are routed to open shards by a hash of
/// their partition key.
#[derive(Debug, Default)]
pub struct InMemoryStreamGateway {
    state: Mutex<State>,
    describe_page_size: Option<usize>,
}

impl InMemoryStreamGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of shards per `describe_stream` page
    pub fn with_describe_page_size(mut self, size: usize) -> Self {
        self.describe_page_size = Some(size.max(1));
        self
    }

    /// Create a stream directly, returning its shard ids
    pub fn create_stream_with_shards(&self, stream_name: &str, shard_count: u32) -> Vec<String> {
        let mut state = self.state.lock();
        let shards: Vec<SimShard> = (0..shard_count)
            .map(|_| {
                let seq = state.sequence();
                let mut description = ShardDescription::new(state.shard_id());
                description.starting_sequence_number = Some(seq);
                SimShard {
                    description,
                    records: Vec::new(),
                }
            })
            .collect();
        let ids = shards.iter().map(|s| s.description.shard_id.clone()).collect();
        state.streams.insert(
            stream_name.to_string(),
            SimStream {
                status: StreamStatus::Active,
                shards,
            },
        );
        ids
    }

    pub fn set_status(&self, stream_name: &str, status: StreamStatus) -> GatewayResult<()> {
        self.state.lock().stream_mut(stream_name)?.status = status;
        Ok(())
    }

    /// Seal a shard and open two children splitting its key space
    pub fn split_shard(&self, stream_name: &str, shard_id: &str) -> GatewayResult<(String, String)> {
        let mut state = self.state.lock();
        let ending = state.sequence();
        let left = state.shard_id();
        let right = state.shard_id();
        let start_left = state.sequence();
        let start_right = state.sequence();

        let stream = state.stream_mut(stream_name)?;
        let parent = Self::open_shard_mut(stream, shard_id)?;
        parent.description.ending_sequence_number = Some(ending);

        for (id, start) in [(left.clone(), start_left), (right.clone(), start_right)] {
            let mut description = ShardDescription::new(id).with_parent(shard_id);
            description.starting_sequence_number = Some(start);
            stream.shards.push(SimShard {
                description,
                records: Vec::new(),
            });
        }
        trace!(stream = %stream_name, parent = %shard_id, "Split shard");
        Ok((left, right))
    }

    /// Seal two shards and open one child covering both
    pub fn merge_shards(
        &self,
        stream_name: &str,
        shard_id: &str,
        adjacent_shard_id: &str,
    ) -> GatewayResult<String> {
        let mut state = self.state.lock();
        let ending = state.sequence();
        let child = state.shard_id();
        let start = state.sequence();

        let stream = state.stream_mut(stream_name)?;
        Self::open_shard_mut(stream, shard_id)?.description.ending_sequence_number =
            Some(ending.clone());
        Self::open_shard_mut(stream, adjacent_shard_id)?
            .description
            .ending_sequence_number = Some(ending);

        let mut description = ShardDescription::new(child.clone())
            .with_parent(shard_id)
            .with_adjacent_parent(adjacent_shard_id);
        description.starting_sequence_number = Some(start);
        stream.shards.push(SimShard {
            description,
            records: Vec::new(),
        });
        Ok(child)
    }

    /// Append a record to a specific shard, bypassing routing
    pub fn append_to_shard(
        &self,
        stream_name: &str,
        shard_id: &str,
        partition_key: &str,
        data: &str,
    ) -> GatewayResult<SequenceNumber> {
        let mut state = self.state.lock();
        let seq = state.sequence();
        let stream = state.stream_mut(stream_name)?;
        let shard = Self::open_shard_mut(stream, shard_id)?;
        shard.records.push(Self::stored_record(partition_key, data.as_bytes().to_vec().into(), &seq));
        Ok(seq)
    }

    /// Records stored in a shard, oldest first
    pub fn shard_records(&self, stream_name: &str, shard_id: &str) -> Vec<Record> {
        let state = self.state.lock();
        state
            .streams
            .get(stream_name)
            .and_then(|s| s.shards.iter().find(|sh| sh.description.shard_id == shard_id))
            .map(|sh| sh.records.clone())
            .unwrap_or_default()
    }

    /// Fail the listed entry indices of the next `put_records` call with throttling
    pub fn fail_next_put(&self, indices: Vec<usize>) {
        self.state.lock().put_failures.push_back(indices);
    }

    /// Throttle the next `count` reads
    pub fn throttle_next_reads(&self, count: usize) {
        self.state.lock().get_records_throttles += count;
    }

    fn open_shard_mut<'a>(stream: &'a mut SimStream, shard_id: &str) -> GatewayResult<&'a mut SimShard> {
        let shard = stream
            .shards
            .iter_mut()
            .find(|s| s.description.shard_id == shard_id)
            .ok_or_else(|| GatewayError::NotFound(format!("Shard {} not found", shard_id)))?;
        if !shard.is_open() {
            return Err(GatewayError::InvalidArgument(format!("Shard {} is closed", shard_id)));
        }
        Ok(shard)
    }

    fn stored_record(partition_key: &str, data: bytes::Bytes, seq: &SequenceNumber) -> Record {
        Record {
            partition_key: partition_key.to_string(),
            data,
            sequence_number: Some(seq.clone()),
            approximate_arrival: Some(Utc::now()),
        }
    }

    fn route(partition_key: &str, open_shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % open_shards as u64) as usize
    }
}

#[async_trait]
impl StreamGateway for InMemoryStreamGateway {
    async fn create_stream(&self, stream_name: &str, shard_count: u32) -> GatewayResult<()> {
        if shard_count == 0 {
            return Err(GatewayError::InvalidArgument("shard count must be positive".into()));
        }
        if self.state.lock().streams.contains_key(stream_name) {
            return Err(GatewayError::ResourceInUse(format!(
                "Stream {} already exists",
                stream_name
            )));
        }
        self.create_stream_with_shards(stream_name, shard_count);
        Ok(())
    }

    async fn delete_stream(&self, stream_name: &str) -> GatewayResult<()> {
        let mut state = self.state.lock();
        state
            .streams
            .remove(stream_name)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("Stream {} not found", stream_name)))?;
        state.iterators.retain(|_, it| it.stream != stream_name);
        Ok(())
    }

    async fn list_streams(
        &self,
        exclusive_start_stream_name: Option<&str>,
    ) -> GatewayResult<StreamPage> {
        let state = self.state.lock();
        let remaining: Vec<String> = state
            .streams
            .keys()
            .filter(|name| exclusive_start_stream_name.map_or(true, |start| name.as_str() > start))
            .cloned()
            .collect();
        let has_more = remaining.len() > LIST_STREAMS_PAGE;
        Ok(StreamPage {
            stream_names: remaining.into_iter().take(LIST_STREAMS_PAGE).collect(),
            has_more,
        })
    }

    async fn describe_stream(
        &self,
        stream_name: &str,
        exclusive_start_shard_id: Option<&str>,
    ) -> GatewayResult<StreamDescription> {
        let state = self.state.lock();
        let stream = state.stream(stream_name)?;

        let start = match exclusive_start_shard_id {
            Some(id) => stream
                .shards
                .iter()
                .position(|s| s.description.shard_id == id)
                .map(|i| i + 1)
                .ok_or_else(|| GatewayError::InvalidArgument(format!("Unknown shard {}", id)))?,
            None => 0,
        };
        let page_size = self.describe_page_size.unwrap_or(usize::MAX);
        let shards: Vec<ShardDescription> = stream.shards[start..]
            .iter()
            .take(page_size)
            .map(|s| s.description.clone())
            .collect();
        let has_more_shards = start + shards.len() < stream.shards.len();

        Ok(StreamDescription {
            stream_name: stream_name.to_string(),
            status: stream.status,
            shards,
            has_more_shards,
        })
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> GatewayResult<String> {
        let mut state = self.state.lock();
        let stream = state.stream(stream_name)?;
        let shard_index = stream
            .shards
            .iter()
            .position(|s| s.description.shard_id == shard_id)
            .ok_or_else(|| GatewayError::NotFound(format!("Shard {} not found", shard_id)))?;
        let records = &stream.shards[shard_index].records;

        let offset = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => records.len(),
            IteratorPosition::AtSequenceNumber(seq) => records
                .iter()
                .position(|r| r.sequence_number.as_ref().is_some_and(|s| s >= seq))
                .unwrap_or(records.len()),
            IteratorPosition::AfterSequenceNumber(seq) => records
                .iter()
                .position(|r| r.sequence_number.as_ref().is_some_and(|s| s > seq))
                .unwrap_or(records.len()),
        };

        Ok(state.issue_iterator(stream_name, shard_index, offset))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> GatewayResult<RecordBatch> {
        let mut state = self.state.lock();
        if state.get_records_throttles > 0 {
            state.get_records_throttles -= 1;
            return Err(GatewayError::Throttled("Rate exceeded for shard".into()));
        }

        let it = state
            .iterators
            .remove(iterator)
            .ok_or_else(|| GatewayError::ExpiredIterator(format!("Iterator {} is no longer valid", iterator)))?;
        let stream = state.stream(&it.stream)?;
        let shard = stream
            .shards
            .get(it.shard_index)
            .ok_or_else(|| GatewayError::NotFound("Shard no longer exists".into()))?;

        let limit = usize::try_from(limit.max(1)).unwrap_or(1);
        let end = (it.position + limit).min(shard.records.len());
        let records = shard.records[it.position..end].to_vec();
        let exhausted = !shard.is_open() && end >= shard.records.len();

        let next_iterator = if exhausted {
            None
        } else {
            Some(state.issue_iterator(&it.stream, it.shard_index, end))
        };

        Ok(RecordBatch {
            records,
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: &[PutRecordsEntry],
    ) -> GatewayResult<Vec<PutOutcome>> {
        let mut state = self.state.lock();
        let failing = state.put_failures.pop_front().unwrap_or_default();
        if !state.stream(stream_name)?.status.is_active() {
            return Err(GatewayError::ResourceInUse(format!("Stream {} is not active", stream_name)));
        }

        let mut outcomes = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if failing.contains(&index) {
                outcomes.push(PutOutcome::Failure {
                    error_code: "ProvisionedThroughputExceededException".to_string(),
                    error_message: Some("Rate exceeded for shard".to_string()),
                });
                continue;
            }

            let seq = state.sequence();
            let stream = state.stream_mut(stream_name)?;
            let open: Vec<usize> = (0..stream.shards.len())
                .filter(|&i| stream.shards[i].is_open())
                .collect();
            if open.is_empty() {
                return Err(GatewayError::Unknown(format!("Stream {} has no open shards", stream_name)));
            }
            let shard = &mut stream.shards[open[Self::route(&entry.partition_key, open.len())]];
            shard
                .records
                .push(Self::stored_record(&entry.partition_key, entry.data.clone(), &seq));
            outcomes.push(PutOutcome::Success {
                shard_id: shard.description.shard_id.clone(),
                sequence_number: seq,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iterators_are_single_use_and_end_on_closed_shards() -> anyhow::Result<()> {
        let gateway = InMemoryStreamGateway::new();
        let shards = gateway.create_stream_with_shards("orders", 1);
        gateway.append_to_shard("orders", &shards[0], "pk-0", "data-0")?;

        let iterator = gateway
            .get_shard_iterator("orders", &shards[0], &IteratorPosition::TrimHorizon)
            .await?;
        let batch = gateway.get_records(&iterator, 10).await?;
        assert_eq!(batch.records.len(), 1);
        assert!(matches!(
            gateway.get_records(&iterator, 10).await,
            Err(GatewayError::ExpiredIterator(_))
        ));

        let (left, right) = gateway.split_shard("orders", &shards[0])?;
        let next = batch.next_iterator.expect("open shard keeps iterating");
        let last = gateway.get_records(&next, 10).await?;
        assert!(last.records.is_empty());
        assert!(last.next_iterator.is_none());

        let description = gateway.describe_stream("orders", None).await?;
        assert_eq!(description.shards.len(), 3);
        assert_eq!(description.shards[1].shard_id, left);
        assert_eq!(description.shards[2].parent_shard_id.as_deref(), Some(shards[0].as_str()));
        assert_ne!(left, right);
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_and_after_sequence_positions() -> anyhow::Result<()> {
        let gateway = InMemoryStreamGateway::new();
        let shards = gateway.create_stream_with_shards("orders", 1);
        let first = gateway.append_to_shard("orders", &shards[0], "pk", "a")?;
        gateway.append_to_shard("orders", &shards[0], "pk", "b")?;

        let latest = gateway
            .get_shard_iterator("orders", &shards[0], &IteratorPosition::Latest)
            .await?;
        gateway.append_to_shard("orders", &shards[0], "pk", "c")?;
        let batch = gateway.get_records(&latest, 10).await?;
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].data_as_str(), Some("c"));

        let after = gateway
            .get_shard_iterator("orders", &shards[0], &IteratorPosition::AfterSequenceNumber(first))
            .await?;
        let batch = gateway.get_records(&after, 10).await?;
        let data: Vec<_> = batch.records.iter().filter_map(|r| r.data_as_str()).collect();
        assert_eq!(data, vec!["b", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_routes_and_injects_failures() -> anyhow::Result<()> {
        let gateway = InMemoryStreamGateway::new();
        gateway.create_stream_with_shards("orders", 2);
        gateway.fail_next_put(vec![1]);

        let entries: Vec<_> = (0..3)
            .map(|i| PutRecordsEntry {
                partition_key: format!("pk-{}", i),
                data: format!("data-{}", i).into(),
                explicit_hash_key: None,
            })
            .collect();
        let outcomes = gateway.put_records("orders", &entries).await?;
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());

        let again = gateway.put_records("orders", &entries).await?;
        assert!(again.iter().all(PutOutcome::is_success));
        assert!(matches!(
            gateway.create_stream("orders", 1).await,
            Err(GatewayError::ResourceInUse(_))
        ));
        Ok(())
    }
}
