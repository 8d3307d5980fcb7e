use crate::error::CheckpointError;
use crate::model::SequenceNumber;
use crate::retry::{never_shutdown, ExponentialBackoff, RetryConfig, RetryError, RetryHandle, Retryable};
use crate::store::{CheckpointOutcome, CheckpointStore, RegressionPolicy};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use chrono::Utc;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, trace};

const KEY_ATTRIBUTE: &str = "shard_id";
const SEQUENCE_ATTRIBUTE: &str = "sequence_number";
const SORT_KEY_ATTRIBUTE: &str = "sort_key";
const UPDATED_AT_ATTRIBUTE: &str = "updated_at";

/// Checkpoint store backed by a DynamoDB table keyed on a string `shard_id`
///
/// Saves are conditional puts on a zero-padded copy of the sequence number,
/// so concurrent writers cannot move a checkpoint backwards.
#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
    policy: RegressionPolicy,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

/// Failure of a single DynamoDB call
#[derive(Debug)]
enum TableError {
    Throttled(String),
    ConditionFailed,
    Other(String),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::Throttled(msg) => write!(f, "throttled: {}", msg),
            TableError::ConditionFailed => f.write_str("condition check failed"),
            TableError::Other(msg) => f.write_str(msg),
        }
    }
}

impl Retryable for TableError {
    fn is_retryable(&self) -> bool {
        matches!(self, TableError::Throttled(_))
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> TableError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    match err.code() {
        Some("ConditionalCheckFailedException") => TableError::ConditionFailed,
        Some("ProvisionedThroughputExceededException")
        | Some("ThrottlingException")
        | Some("RequestLimitExceeded") => TableError::Throttled(DisplayErrorContext(&err).to_string()),
        _ => TableError::Other(DisplayErrorContext(&err).to_string()),
    }
}

fn describe(err: RetryError<TableError>) -> String {
    match err {
        RetryError::MaxRetriesExceeded { attempts, last } => {
            format!("{} (after {} attempts)", last, attempts)
        }
        RetryError::Fatal(e) => e.to_string(),
        RetryError::Interrupted => "interrupted".to_string(),
    }
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::new()
    }

    pub fn new(client: DynamoClient, table_name: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        let retry_config = RetryConfig::default();
        Self {
            client,
            table_name: table_name.into(),
            key_prefix: key_prefix.into(),
            policy: RegressionPolicy::default(),
            backoff: retry_config.backoff(),
            retry_config,
        }
    }

    fn item_key(&self, stream_name: &str, shard_id: &str) -> String {
        format!("{}{}#{}", self.key_prefix, stream_name, shard_id)
    }

    fn retry_handle(&self) -> RetryHandle<ExponentialBackoff> {
        RetryHandle::new(self.retry_config.clone(), self.backoff.clone())
    }

    async fn read(&self, key: &str) -> Result<Option<SequenceNumber>, TableError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;

        Ok(response
            .item
            .and_then(|item| item.get(SEQUENCE_ATTRIBUTE).cloned())
            .and_then(|attr| attr.as_s().ok().map(|s| SequenceNumber::from(s.as_str()))))
    }

    async fn conditional_put(&self, key: &str, sequence: &SequenceNumber) -> Result<(), TableError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .item(SEQUENCE_ATTRIBUTE, AttributeValue::S(sequence.to_string()))
            .item(SORT_KEY_ATTRIBUTE, AttributeValue::S(sequence.sortable_key()))
            .item(UPDATED_AT_ATTRIBUTE, AttributeValue::S(Utc::now().to_rfc3339()))
            .condition_expression("attribute_not_exists(#key) OR #sort < :sort_key")
            .expression_attribute_names("#key", KEY_ATTRIBUTE)
            .expression_attribute_names("#sort", SORT_KEY_ATTRIBUTE)
            .expression_attribute_values(":sort_key", AttributeValue::S(sequence.sortable_key()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn get_checkpoint(
        &self,
        stream_name: &str,
        shard_id: &str,
    ) -> Result<Option<SequenceNumber>, CheckpointError> {
        let key = self.item_key(stream_name, shard_id);
        trace!(key = %key, "Getting checkpoint from DynamoDB");

        let checkpoint = self
            .retry_handle()
            .retry(|| self.read(&key), &mut never_shutdown())
            .await
            .map_err(|e| CheckpointError::RetrieveFailed(describe(e)))?;

        debug!(key = %key, checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name, sequence = %sequence))]
    async fn save_checkpoint(
        &self,
        stream_name: &str,
        shard_id: &str,
        sequence: &SequenceNumber,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        let key = self.item_key(stream_name, shard_id);

        let result = self
            .retry_handle()
            .retry(|| self.conditional_put(&key, sequence), &mut never_shutdown())
            .await;

        match result {
            Ok(()) => {
                debug!(key = %key, "Checkpoint advanced in DynamoDB");
                Ok(CheckpointOutcome::Advanced)
            }
            Err(RetryError::Fatal(TableError::ConditionFailed)) => {
                // Someone already stored an equal or later position.
                let stored = self
                    .retry_handle()
                    .retry(|| self.read(&key), &mut never_shutdown())
                    .await
                    .map_err(|e| CheckpointError::RetrieveFailed(describe(e)))?;
                let outcome = match stored {
                    Some(stored) => self.policy.resolve(Some(&stored), sequence)?,
                    None => CheckpointOutcome::Stale,
                };
                trace!(key = %key, outcome = ?outcome, "Conditional checkpoint write skipped");
                Ok(outcome)
            }
            Err(e) => Err(CheckpointError::SaveFailed(describe(e))),
        }
    }
}

#[derive(Debug, Default)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
    policy: RegressionPolicy,
    retry_config: Option<RetryConfig>,
    backoff: Option<ExponentialBackoff>,
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn with_regression_policy(mut self, policy: RegressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbCheckpointStore> {
        let retry_config = self.retry_config.unwrap_or_else(|| RetryConfig {
            max_backoff: Duration::from_secs(5),
            ..RetryConfig::default()
        });
        Ok(DynamoDbCheckpointStore {
            client: self.client.ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self.table_name.ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            key_prefix: self.key_prefix.unwrap_or_default(),
            policy: self.policy,
            backoff: self.backoff.unwrap_or_else(|| retry_config.backoff()),
            retry_config,
        })
    }
}
