//! Remote stream service capability
//!
//! Every other component talks to the service through [`StreamGateway`]. The
//! production implementation wraps `aws_sdk_kinesis::Client`; tests use the
//! fakes in [`crate::test`].

pub mod kinesis;
pub mod registry;

use async_trait::async_trait;

use crate::error::GatewayResult;
use crate::model::{
    IteratorPosition, PutOutcome, PutRecordsEntry, RecordBatch, StreamDescription, StreamPage,
};

pub use kinesis::KinesisGateway;
pub use registry::{ClientKey, GatewayRegistry};

#[async_trait]
pub trait StreamGateway: Send + Sync {
    async fn create_stream(&self, stream_name: &str, shard_count: u32) -> GatewayResult<()>;

    async fn delete_stream(&self, stream_name: &str) -> GatewayResult<()>;

    /// One page of stream names, starting after `exclusive_start_stream_name`
    async fn list_streams(
        &self,
        exclusive_start_stream_name: Option<&str>,
    ) -> GatewayResult<StreamPage>;

    /// One page of the stream description, with shards after `exclusive_start_shard_id`
    async fn describe_stream(
        &self,
        stream_name: &str,
        exclusive_start_shard_id: Option<&str>,
    ) -> GatewayResult<StreamDescription>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> GatewayResult<String>;

    async fn get_records(&self, iterator: &str, limit: i32) -> GatewayResult<RecordBatch>;

    /// Results are aligned by index with `entries`
    async fn put_records(
        &self,
        stream_name: &str,
        entries: &[PutRecordsEntry],
    ) -> GatewayResult<Vec<PutOutcome>>;
}
