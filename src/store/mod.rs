//! Checkpoint storage implementations
//!
//! A checkpoint maps (stream, shard) to the last processed sequence number.
//! Stores only ever move a checkpoint forward: a save that would move it back
//! is either ignored or rejected according to [`RegressionPolicy`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CheckpointError;
use crate::model::SequenceNumber;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

/// What a save did to the stored position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Stored position moved forward (or was created)
    Advanced,
    /// Stored position already equals the saved one
    Unchanged,
    /// Saved position is behind the stored one and was ignored
    Stale,
}

/// How a store treats an attempt to move a checkpoint backwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionPolicy {
    /// Report [`CheckpointOutcome::Stale`]
    #[default]
    Ignore,
    /// Fail with [`CheckpointError::Regression`]
    Reject,
}

impl RegressionPolicy {
    /// Resolve a save against the currently stored value
    pub fn resolve(
        &self,
        stored: Option<&SequenceNumber>,
        attempted: &SequenceNumber,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        match stored {
            None => Ok(CheckpointOutcome::Advanced),
            Some(current) if attempted > current => Ok(CheckpointOutcome::Advanced),
            Some(current) if attempted == current => Ok(CheckpointOutcome::Unchanged),
            Some(current) => match self {
                RegressionPolicy::Ignore => Ok(CheckpointOutcome::Stale),
                RegressionPolicy::Reject => Err(CheckpointError::Regression {
                    stored: current.clone(),
                    attempted: attempted.clone(),
                }),
            },
        }
    }
}

/// Durable (stream, shard) -> position mapping
///
/// Implementations must tolerate concurrent saves for disjoint keys and must
/// never let a stored position regress.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieve the checkpoint for a shard
    async fn get_checkpoint(
        &self,
        stream_name: &str,
        shard_id: &str,
    ) -> Result<Option<SequenceNumber>, CheckpointError>;

    /// Advance the checkpoint for a shard
    async fn save_checkpoint(
        &self,
        stream_name: &str,
        shard_id: &str,
        sequence: &SequenceNumber,
    ) -> Result<CheckpointOutcome, CheckpointError>;
}

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use memory::InMemoryCheckpointStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_policy_resolution() {
        let five = SequenceNumber::from("5");
        let three = SequenceNumber::from("3");

        let ignore = RegressionPolicy::Ignore;
        assert_eq!(ignore.resolve(None, &three).unwrap(), CheckpointOutcome::Advanced);
        assert_eq!(ignore.resolve(Some(&three), &five).unwrap(), CheckpointOutcome::Advanced);
        assert_eq!(ignore.resolve(Some(&five), &five).unwrap(), CheckpointOutcome::Unchanged);
        assert_eq!(ignore.resolve(Some(&five), &three).unwrap(), CheckpointOutcome::Stale);

        let reject = RegressionPolicy::Reject;
        let err = reject.resolve(Some(&five), &three).unwrap_err();
        assert!(err.is_benign());
    }
}
