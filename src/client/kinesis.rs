//! [`StreamGateway`] backed by the AWS Kinesis SDK

use async_trait::async_trait;
use aws_sdk_kinesis::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_smithy_types::Blob;
use aws_sdk_kinesis::types::{PutRecordsRequestEntry, ShardIteratorType};
use aws_sdk_kinesis::Client;
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::StreamGateway;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{
    IteratorPosition, PutOutcome, PutRecordsEntry, Record, RecordBatch, SequenceNumber,
    ShardDescription, StreamDescription, StreamPage, StreamStatus,
};

#[derive(Debug, Clone)]
pub struct KinesisGateway {
    client: Client,
}

impl KinesisGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the shared AWS configuration chain
    pub async fn from_profile(profile: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;
        debug!(profile = ?profile, region = ?region, "Created Kinesis client");
        Self::new(Client::new(&config))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Map an SDK failure onto the gateway taxonomy by its service error code
fn classify<E, R>(err: SdkError<E, R>) -> GatewayError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.code() {
        Some("ResourceNotFoundException") => GatewayError::NotFound(message),
        Some("InvalidArgumentException") | Some("ValidationException") => {
            GatewayError::InvalidArgument(message)
        }
        Some("ProvisionedThroughputExceededException")
        | Some("LimitExceededException")
        | Some("KMSThrottlingException")
        | Some("ThrottlingException") => GatewayError::Throttled(message),
        Some("ResourceInUseException") => GatewayError::ResourceInUse(message),
        Some("ExpiredIteratorException") => GatewayError::ExpiredIterator(message),
        _ => GatewayError::Unknown(message),
    }
}

fn shard_from_sdk(shard: &aws_sdk_kinesis::types::Shard) -> ShardDescription {
    let range = shard.sequence_number_range();
    ShardDescription {
        shard_id: shard.shard_id().to_string(),
        parent_shard_id: shard.parent_shard_id().map(String::from),
        adjacent_parent_shard_id: shard.adjacent_parent_shard_id().map(String::from),
        starting_sequence_number: range.map(|r| SequenceNumber::from(r.starting_sequence_number())),
        ending_sequence_number: range
            .and_then(|r| r.ending_sequence_number())
            .map(SequenceNumber::from),
    }
}

fn record_from_sdk(record: &aws_sdk_kinesis::types::Record) -> Record {
    let approximate_arrival = record
        .approximate_arrival_timestamp()
        .and_then(|ts| ts.to_chrono_utc().ok());

    Record {
        partition_key: record.partition_key().to_string(),
        data: Bytes::copy_from_slice(record.data().as_ref()),
        sequence_number: Some(SequenceNumber::from(record.sequence_number())),
        approximate_arrival,
    }
}

#[async_trait]
impl StreamGateway for KinesisGateway {
    async fn create_stream(&self, stream_name: &str, shard_count: u32) -> GatewayResult<()> {
        let shard_count = i32::try_from(shard_count)
            .map_err(|_| GatewayError::InvalidArgument(format!("shard count {}", shard_count)))?;

        self.client
            .create_stream()
            .stream_name(stream_name)
            .shard_count(shard_count)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_stream(&self, stream_name: &str) -> GatewayResult<()> {
        self.client
            .delete_stream()
            .stream_name(stream_name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_streams(
        &self,
        exclusive_start_stream_name: Option<&str>,
    ) -> GatewayResult<StreamPage> {
        let response = self
            .client
            .list_streams()
            .set_exclusive_start_stream_name(exclusive_start_stream_name.map(String::from))
            .send()
            .await
            .map_err(classify)?;

        Ok(StreamPage {
            stream_names: response.stream_names().to_vec(),
            has_more: response.has_more_streams(),
        })
    }

    async fn describe_stream(
        &self,
        stream_name: &str,
        exclusive_start_shard_id: Option<&str>,
    ) -> GatewayResult<StreamDescription> {
        let response = self
            .client
            .describe_stream()
            .stream_name(stream_name)
            .set_exclusive_start_shard_id(exclusive_start_shard_id.map(String::from))
            .send()
            .await
            .map_err(classify)?;

        let description = response.stream_description().ok_or_else(|| {
            GatewayError::Unknown(format!("empty description for stream {}", stream_name))
        })?;

        let raw_status = description.stream_status().as_str();
        let status = StreamStatus::parse(raw_status).ok_or_else(|| {
            GatewayError::Unknown(format!("unrecognized stream status {}", raw_status))
        })?;

        Ok(StreamDescription {
            stream_name: description.stream_name().to_string(),
            status,
            shards: description.shards().iter().map(shard_from_sdk).collect(),
            has_more_shards: description.has_more_shards(),
        })
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> GatewayResult<String> {
        let iterator_type = match position {
            IteratorPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
            IteratorPosition::Latest => ShardIteratorType::Latest,
            IteratorPosition::AtSequenceNumber(_) => ShardIteratorType::AtSequenceNumber,
            IteratorPosition::AfterSequenceNumber(_) => ShardIteratorType::AfterSequenceNumber,
        };

        let mut request = self
            .client
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type);

        if let Some(seq) = position.sequence_number() {
            request = request.starting_sequence_number(seq.as_str());
        }

        let response = request.send().await.map_err(classify)?;
        trace!(shard_id = %shard_id, position = position.type_name(), "Acquired shard iterator");

        response.shard_iterator.ok_or_else(|| {
            GatewayError::Unknown(format!("no iterator returned for shard {}", shard_id))
        })
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> GatewayResult<RecordBatch> {
        let response = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify)?;

        Ok(RecordBatch {
            records: response.records().iter().map(record_from_sdk).collect(),
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: &[PutRecordsEntry],
    ) -> GatewayResult<Vec<PutOutcome>> {
        let request_entries = entries
            .iter()
            .map(|entry| {
                PutRecordsRequestEntry::builder()
                    .data(Blob::new(entry.data.to_vec()))
                    .partition_key(entry.partition_key.clone())
                    .set_explicit_hash_key(entry.explicit_hash_key.clone())
                    .build()
                    .map_err(|e| GatewayError::InvalidArgument(e.to_string()))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let response = self
            .client
            .put_records()
            .stream_name(stream_name)
            .set_records(Some(request_entries))
            .send()
            .await
            .map_err(classify)?;

        let outcomes: Vec<PutOutcome> = response
            .records()
            .iter()
            .map(|entry| match (entry.error_code(), entry.sequence_number()) {
                (None, Some(seq)) => PutOutcome::Success {
                    shard_id: entry.shard_id().unwrap_or_default().to_string(),
                    sequence_number: SequenceNumber::from(seq),
                },
                (code, _) => PutOutcome::Failure {
                    error_code: code.unwrap_or("Unknown").to_string(),
                    error_message: entry.error_message().map(String::from),
                },
            })
            .collect();

        if outcomes.len() != entries.len() {
            warn!(
                stream = %stream_name,
                requested = entries.len(),
                returned = outcomes.len(),
                "PutRecords result is not aligned with request"
            );
        }

        Ok(outcomes)
    }
}
