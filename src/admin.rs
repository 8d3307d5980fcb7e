//! Stream lifecycle operations and the ACTIVE-only guard

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::StreamGateway;
use crate::error::{GatewayError, Result, StreamError};
use crate::model::StreamStatus;
use crate::retry::{never_shutdown, RetryConfig, RetryError, RetryHandle};

/// Create, delete, list and inspect streams
pub struct StreamAdmin<G: StreamGateway + ?Sized> {
    gateway: Arc<G>,
    retry: RetryConfig,
}

impl<G: StreamGateway + ?Sized> Clone for StreamAdmin<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            retry: self.retry.clone(),
        }
    }
}

/// Turn an exhausted or fatal retry into a contextual error
pub(crate) fn gateway_failure(
    operation: &'static str,
    stream: &str,
    shard_id: Option<&str>,
    err: RetryError<GatewayError>,
) -> StreamError {
    match err {
        RetryError::MaxRetriesExceeded { attempts, last } => StreamError::MaxRetriesExceeded(format!(
            "{} on stream {} after {} attempts: {}",
            operation, stream, attempts, last
        )),
        RetryError::Fatal(source) => match shard_id {
            Some(shard) => StreamError::shard_gateway(operation, stream, shard, source),
            None => StreamError::gateway(operation, stream, source),
        },
        RetryError::Interrupted => StreamError::Shutdown,
    }
}

impl<G: StreamGateway + ?Sized> StreamAdmin<G> {
    pub fn new(gateway: Arc<G>, retry: RetryConfig) -> Self {
        Self { gateway, retry }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, stream: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, GatewayError>>,
    {
        RetryHandle::from_config(&self.retry)
            .retry(f, &mut never_shutdown())
            .await
            .map_err(|e| gateway_failure(operation, stream, None, e))
    }

    /// Create a stream; an existing stream counts as success
    pub async fn create_stream(&self, stream_name: &str, shard_count: u32) -> Result<()> {
        if shard_count == 0 {
            return Err(StreamError::ConfigError("shard count must be positive".to_string()));
        }
        let result = RetryHandle::from_config(&self.retry)
            .retry(
                || self.gateway.create_stream(stream_name, shard_count),
                &mut never_shutdown(),
            )
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream_name, shard_count, "Created stream");
                Ok(())
            }
            Err(RetryError::Fatal(GatewayError::ResourceInUse(msg))) => {
                debug!(stream = %stream_name, reason = %msg, "Stream already exists");
                Ok(())
            }
            Err(e) => Err(gateway_failure("CreateStream", stream_name, None, e)),
        }
    }

    /// Delete a stream; a missing stream counts as success
    pub async fn delete_stream(&self, stream_name: &str) -> Result<()> {
        let result = RetryHandle::from_config(&self.retry)
            .retry(|| self.gateway.delete_stream(stream_name), &mut never_shutdown())
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream_name, "Deleted stream");
                Ok(())
            }
            Err(RetryError::Fatal(GatewayError::NotFound(_))) => {
                debug!(stream = %stream_name, "Stream already absent");
                Ok(())
            }
            Err(e) => Err(gateway_failure("DeleteStream", stream_name, None, e)),
        }
    }

    /// Every stream name, following pagination to the end
    pub async fn list_streams(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        loop {
            let start = names.last().cloned();
            let page = self
                .call("ListStreams", "*", || self.gateway.list_streams(start.as_deref()))
                .await?;

            let added = page.stream_names.len();
            names.extend(page.stream_names);
            if !page.has_more || added == 0 {
                break;
            }
        }
        debug!(count = names.len(), "Listed streams");
        Ok(names)
    }

    /// Current status, with absence reported as [`StreamStatus::NotExist`]
    pub async fn stream_status(&self, stream_name: &str) -> Result<StreamStatus> {
        let result = RetryHandle::from_config(&self.retry)
            .retry(
                || self.gateway.describe_stream(stream_name, None),
                &mut never_shutdown(),
            )
            .await;

        match result {
            Ok(description) => Ok(description.status),
            Err(RetryError::Fatal(GatewayError::NotFound(_))) => Ok(StreamStatus::NotExist),
            Err(e) => Err(gateway_failure("DescribeStream", stream_name, None, e)),
        }
    }

    pub async fn is_active(&self, stream_name: &str) -> Result<bool> {
        Ok(self.stream_status(stream_name).await?.is_active())
    }

    /// Fail unless the stream is ACTIVE
    pub async fn ensure_active(&self, stream_name: &str) -> Result<()> {
        match self.stream_status(stream_name).await? {
            StreamStatus::Active => Ok(()),
            status => Err(StreamError::StreamNotActive {
                stream: stream_name.to_string(),
                status,
            }),
        }
    }

    /// Poll until the stream is ACTIVE
    ///
    /// Keeps waiting through CREATING and UPDATING. A stream that is being
    /// deleted or does not exist will never become active, so those fail fast.
    pub async fn wait_until_active(
        &self,
        stream_name: &str,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let status = self.stream_status(stream_name).await?;
            match status {
                StreamStatus::Active => {
                    info!(stream = %stream_name, "Stream is active");
                    return Ok(());
                }
                StreamStatus::Creating | StreamStatus::Updating => {
                    debug!(stream = %stream_name, status = %status, "Waiting for stream to become active");
                }
                StreamStatus::Deleting | StreamStatus::NotExist => {
                    warn!(stream = %stream_name, status = %status, "Stream cannot become active");
                    return Err(StreamError::StreamNotActive {
                        stream: stream_name.to_string(),
                        status,
                    });
                }
            }
            Self::sleep_within(started, poll_interval, timeout).await?;
        }
    }

    /// Poll until the stream no longer exists
    pub async fn wait_until_deleted(
        &self,
        stream_name: &str,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.stream_status(stream_name).await? {
                StreamStatus::NotExist => {
                    info!(stream = %stream_name, "Stream deleted");
                    return Ok(());
                }
                status => {
                    debug!(stream = %stream_name, status = %status, "Waiting for stream deletion");
                }
            }
            Self::sleep_within(started, poll_interval, timeout).await?;
        }
    }

    async fn sleep_within(
        started: Instant,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if let Some(limit) = timeout {
            if started.elapsed() + poll_interval > limit {
                return Err(StreamError::Timeout(limit));
            }
        }
        tokio::time::sleep(poll_interval).await;
        Ok(())
    }
}
