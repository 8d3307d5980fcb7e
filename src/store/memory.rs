use crate::error::CheckpointError;
use crate::model::SequenceNumber;
use crate::store::{CheckpointOutcome, CheckpointStore, RegressionPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

/// A stored checkpoint and when it last moved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub sequence: SequenceNumber,
    pub updated_at: DateTime<Utc>,
}

type CheckpointKey = (String, String);

/// In-memory implementation of checkpoint storage
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<CheckpointKey, StoredCheckpoint>>>,
    policy: RegressionPolicy,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory checkpoint store");
        Self::default()
    }

    pub fn with_policy(policy: RegressionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Snapshot of every checkpoint, keyed by (stream, shard)
    pub async fn all_checkpoints(&self) -> HashMap<CheckpointKey, StoredCheckpoint> {
        self.checkpoints.read().await.clone()
    }

    pub async fn clear(&self) {
        self.checkpoints.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    #[instrument(skip(self))]
    async fn get_checkpoint(
        &self,
        stream_name: &str,
        shard_id: &str,
    ) -> Result<Option<SequenceNumber>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        let checkpoint = checkpoints
            .get(&(stream_name.to_string(), shard_id.to_string()))
            .map(|stored| stored.sequence.clone());

        trace!(checkpoint = ?checkpoint, "Retrieved checkpoint from memory");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(sequence = %sequence))]
    async fn save_checkpoint(
        &self,
        stream_name: &str,
        shard_id: &str,
        sequence: &SequenceNumber,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        // Compare and set under one write lock.
        let mut checkpoints = self.checkpoints.write().await;
        let key = (stream_name.to_string(), shard_id.to_string());

        let outcome = self
            .policy
            .resolve(checkpoints.get(&key).map(|stored| &stored.sequence), sequence)?;

        if outcome == CheckpointOutcome::Advanced {
            checkpoints.insert(
                key,
                StoredCheckpoint {
                    sequence: sequence.clone(),
                    updated_at: Utc::now(),
                },
            );
        }

        trace!(outcome = ?outcome, "Checkpoint saved to memory");
        Ok(outcome)
    }
}
