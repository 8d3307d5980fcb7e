//! Shard discovery and re-shard lineage
//!
//! [`ShardCatalog`] pages through a stream description and returns a
//! point-in-time snapshot of its shards. [`ShardLineage`] indexes that
//! snapshot by parent/child relationship so consumers can hold back child
//! shards until their parents have been read to the end.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::admin::gateway_failure;
use crate::client::StreamGateway;
use crate::error::Result;
use crate::model::ShardDescription;
use crate::retry::{never_shutdown, RetryConfig, RetryHandle};

/// Paginated shard listing for streams behind one gateway
pub struct ShardCatalog<G: StreamGateway + ?Sized> {
    gateway: Arc<G>,
    retry: RetryConfig,
}

impl<G: StreamGateway + ?Sized> Clone for ShardCatalog<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<G: StreamGateway + ?Sized> ShardCatalog<G> {
    pub fn new(gateway: Arc<G>, retry: RetryConfig) -> Self {
        Self { gateway, retry }
    }

    /// All shards of a stream, in listing order and without duplicates
    ///
    /// Throttled pages are retried with backoff. Any other remote failure
    /// (missing stream, bad argument) is returned to the caller.
    pub async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardDescription>> {
        self.list_shards_until(stream_name, &mut never_shutdown()).await
    }

    /// [`list_shards`](Self::list_shards), abandoning throttle retries once
    /// `shutdown` is set
    ///
    /// Returns [`StreamError::Shutdown`](crate::StreamError::Shutdown) when interrupted.
    pub async fn list_shards_until(
        &self,
        stream_name: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<ShardDescription>> {
        let mut shards: Vec<ShardDescription> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            pages += 1;
            let description = RetryHandle::from_config(&self.retry)
                .retry(
                    || self.gateway.describe_stream(stream_name, cursor.as_deref()),
                    shutdown,
                )
                .await
                .map_err(|e| gateway_failure("DescribeStream", stream_name, None, e))?;

            let before = shards.len();
            for shard in description.shards {
                if seen.insert(shard.shard_id.clone()) {
                    shards.push(shard);
                } else {
                    trace!(stream = %stream_name, shard_id = %shard.shard_id, "Skipping duplicate shard");
                }
            }

            if !description.has_more_shards {
                break;
            }
            if shards.len() == before {
                // A page with nothing new would repeat forever.
                warn!(
                    stream = %stream_name,
                    pages,
                    "Shard listing made no progress, stopping pagination"
                );
                break;
            }
            cursor = shards.last().map(|s| s.shard_id.clone());
        }

        debug!(stream = %stream_name, shards = shards.len(), pages, "Listed shards");
        Ok(shards)
    }

    /// List shards and index them by lineage
    pub async fn snapshot(&self, stream_name: &str) -> Result<ShardLineage> {
        Ok(ShardLineage::new(self.list_shards(stream_name).await?))
    }

    pub async fn snapshot_until(
        &self,
        stream_name: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ShardLineage> {
        Ok(ShardLineage::new(
            self.list_shards_until(stream_name, shutdown).await?,
        ))
    }
}

/// Parent/child index over one shard listing
#[derive(Debug, Clone, Default)]
pub struct ShardLineage {
    shards: Vec<ShardDescription>,
    children: HashMap<String, Vec<String>>,
    listed: HashSet<String>,
}

impl ShardLineage {
    pub fn new(shards: Vec<ShardDescription>) -> Self {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for shard in &shards {
            for parent in shard.parents() {
                children
                    .entry(parent.to_string())
                    .or_default()
                    .push(shard.shard_id.clone());
            }
        }
        let listed = shards.iter().map(|s| s.shard_id.clone()).collect();
        Self {
            shards,
            children,
            listed,
        }
    }

    pub fn shards(&self) -> &[ShardDescription] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.listed.contains(shard_id)
    }

    pub fn get(&self, shard_id: &str) -> Option<&ShardDescription> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }

    pub fn parents_of(&self, shard_id: &str) -> Vec<&str> {
        self.get(shard_id)
            .map(|shard| shard.parents().collect())
            .unwrap_or_default()
    }

    pub fn children_of(&self, shard_id: &str) -> &[String] {
        self.children
            .get(shard_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Shards that may be read now
    ///
    /// A shard is ready when it is not in `finished` and each of its parents
    /// is either in `finished` or has aged out of the listing.
    pub fn ready_shards(&self, finished: &HashSet<String>) -> Vec<&ShardDescription> {
        self.shards
            .iter()
            .filter(|shard| !finished.contains(&shard.shard_id))
            .filter(|shard| {
                shard
                    .parents()
                    .all(|parent| finished.contains(parent) || !self.listed.contains(parent))
            })
            .collect()
    }
}
