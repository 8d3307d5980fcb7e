//! Error types for the stream runtime

use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tokio::task::JoinError;

use crate::model::{SequenceNumber, StreamStatus};

/// Coarse classification of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Throttled,
    ResourceInUse,
    ExpiredIterator,
    Unknown,
}

/// Failure reported by a [`StreamGateway`](crate::client::StreamGateway) call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    #[error("Iterator expired: {0}")]
    ExpiredIterator(String),

    #[error("Remote error: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            GatewayError::Throttled(_) => ErrorKind::Throttled,
            GatewayError::ResourceInUse(_) => ErrorKind::ResourceInUse,
            GatewayError::ExpiredIterator(_) => ErrorKind::ExpiredIterator,
            GatewayError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Only rate limiting is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Throttled(_))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Main error type for runtime operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{operation} failed for stream {stream}{}: {source}", shard_suffix(.shard_id))]
    Gateway {
        operation: &'static str,
        stream: String,
        shard_id: Option<String>,
        #[source]
        source: GatewayError,
    },

    #[error("Stream {stream} is not active (status: {status})")]
    StreamNotActive { stream: String, status: StreamStatus },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Maximum retry attempts reached: {0}")]
    MaxRetriesExceeded(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn shard_suffix(shard_id: &Option<String>) -> String {
    shard_id
        .as_deref()
        .map(|id| format!(" (shard {})", id))
        .unwrap_or_default()
}

impl StreamError {
    pub fn gateway(operation: &'static str, stream: &str, source: GatewayError) -> Self {
        StreamError::Gateway {
            operation,
            stream: stream.to_string(),
            shard_id: None,
            source,
        }
    }

    pub fn shard_gateway(
        operation: &'static str,
        stream: &str,
        shard_id: &str,
        source: GatewayError,
    ) -> Self {
        StreamError::Gateway {
            operation,
            stream: stream.to_string(),
            shard_id: Some(shard_id.to_string()),
            source,
        }
    }

    /// Remote error kind, if this error came from the gateway
    pub fn gateway_kind(&self) -> Option<ErrorKind> {
        match self {
            StreamError::Gateway { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Error type for checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to save checkpoint: {0}")]
    SaveFailed(String),

    #[error("Failed to retrieve checkpoint: {0}")]
    RetrieveFailed(String),

    #[error("Invalid checkpoint data: {0}")]
    InvalidData(String),

    #[error("Checkpoint regression rejected: stored {stored}, attempted {attempted}")]
    Regression {
        stored: SequenceNumber,
        attempted: SequenceNumber,
    },
}

impl CheckpointError {
    /// Regressions come from duplicate or late checkpoint attempts and are harmless
    pub fn is_benign(&self) -> bool {
        matches!(self, CheckpointError::Regression { .. })
    }
}

/// Failure raised by a record handler for one batch
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler {handler} failed: {source}")]
    Failed {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Handler {handler} panicked")]
    Panicked { handler: String },
}

impl From<AcquireError> for StreamError {
    fn from(err: AcquireError) -> Self {
        StreamError::Other(err.into())
    }
}

impl From<JoinError> for StreamError {
    fn from(err: JoinError) -> Self {
        StreamError::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_kinds() {
        assert_eq!(GatewayError::NotFound("s".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            GatewayError::Throttled("slow down".into()).kind(),
            ErrorKind::Throttled
        );
        assert!(GatewayError::Throttled("x".into()).is_retryable());
        assert!(!GatewayError::InvalidArgument("x".into()).is_retryable());
        assert!(!GatewayError::Unknown("x".into()).is_retryable());
        assert!(!GatewayError::ExpiredIterator("x".into()).is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = StreamError::shard_gateway(
            "GetRecords",
            "orders",
            "shardId-000000000001",
            GatewayError::NotFound("gone".into()),
        );
        let msg = err.to_string();
        assert!(msg.contains("GetRecords"));
        assert!(msg.contains("orders"));
        assert!(msg.contains("shardId-000000000001"));
        assert_eq!(err.gateway_kind(), Some(ErrorKind::NotFound));

        let err = StreamError::gateway("ListStreams", "orders", GatewayError::Unknown("boom".into()));
        assert!(!err.to_string().contains("shard"));

        let err = StreamError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_checkpoint_error_conversion() {
        let checkpoint_err = CheckpointError::SaveFailed("test".to_string());
        let err: StreamError = checkpoint_err.into();
        assert!(matches!(err, StreamError::Checkpoint(_)));

        let regression = CheckpointError::Regression {
            stored: SequenceNumber::from("5"),
            attempted: SequenceNumber::from("3"),
        };
        assert!(regression.is_benign());
        assert!(!CheckpointError::SaveFailed("x".into()).is_benign());
    }
}
