//! Record handlers and concurrent fan-out
//!
//! A [`RecordHandler`] receives every non-empty batch read from a shard.
//! Handlers attached to one consumer are grouped in a [`HandlerSet`], which
//! runs them concurrently for each batch and waits for all of them. A failing
//! or panicking handler is logged and reported in the [`DispatchSummary`]; it
//! never affects its siblings or the poll loop.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::model::Record;

/// Where a batch came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub stream_name: String,
    pub shard_id: String,
    pub millis_behind_latest: Option<i64>,
}

impl BatchContext {
    pub fn new(stream_name: impl Into<String>, shard_id: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            shard_id: shard_id.into(),
            millis_behind_latest: None,
        }
    }
}

/// Consumer of record batches
///
/// Implementations should swallow conditions they expect and can recover
/// from. Anything returned as an error is logged by the dispatcher.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn process(&self, ctx: &BatchContext, records: &[Record]) -> anyhow::Result<()>;
}

/// Prints each record to standard output
#[derive(Debug, Default, Clone)]
pub struct StdoutHandler;

#[async_trait]
impl RecordHandler for StdoutHandler {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn process(&self, ctx: &BatchContext, records: &[Record]) -> anyhow::Result<()> {
        debug!(shard_id = %ctx.shard_id, count = records.len(), "Printing records");
        for record in records {
            println!("{}", record);
        }
        Ok(())
    }
}

/// Logs each record at debug level
#[derive(Debug, Default, Clone)]
pub struct DebugLogHandler;

#[async_trait]
impl RecordHandler for DebugLogHandler {
    fn name(&self) -> &str {
        "debug"
    }

    async fn process(&self, ctx: &BatchContext, records: &[Record]) -> anyhow::Result<()> {
        debug!(shard_id = %ctx.shard_id, count = records.len(), "Processing records");
        for record in records {
            debug!(shard_id = %ctx.shard_id, record = %record);
        }
        Ok(())
    }
}

/// Appends each record payload, followed by a newline, to a file
#[derive(Debug)]
pub struct FileAppendHandler {
    path: PathBuf,
    // Batches from different shards must not interleave within a write.
    lock: Mutex<()>,
}

impl FileAppendHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordHandler for FileAppendHandler {
    fn name(&self) -> &str {
        "file"
    }

    async fn process(&self, ctx: &BatchContext, records: &[Record]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buffer = Vec::with_capacity(records.iter().map(|r| r.data.len() + 1).sum());
        for record in records {
            buffer.extend_from_slice(&record.data);
            buffer.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;

        debug!(
            shard_id = %ctx.shard_id,
            path = %self.path.display(),
            count = records.len(),
            "Appended records to file"
        );
        Ok(())
    }
}

/// Handler selection as it appears in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerSpec {
    Stdout,
    Debug,
    File { path: PathBuf },
}

impl HandlerSpec {
    pub fn build(&self) -> Arc<dyn RecordHandler> {
        match self {
            HandlerSpec::Stdout => Arc::new(StdoutHandler),
            HandlerSpec::Debug => Arc::new(DebugLogHandler),
            HandlerSpec::File { path } => Arc::new(FileAppendHandler::new(path.clone())),
        }
    }
}

/// Result of dispatching one batch to every handler
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub handlers: usize,
    pub failures: Vec<HandlerError>,
}

impl DispatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Handlers attached to one consumer
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<Arc<dyn RecordHandler>>,
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl RecordHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_arc(mut self, handler: Arc<dyn RecordHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Append another set's handlers after this one's
    pub fn merge(mut self, other: HandlerSet) -> Self {
        self.handlers.extend(other.handlers);
        debug!(count = self.handlers.len(), "Merged handler sets");
        self
    }

    pub fn from_specs(specs: &[HandlerSpec]) -> Self {
        Self {
            handlers: specs.iter().map(HandlerSpec::build).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run every handler on the batch concurrently and wait for all of them
    pub async fn dispatch(&self, ctx: &BatchContext, records: Arc<Vec<Record>>) -> DispatchSummary {
        if self.handlers.is_empty() {
            warn!(shard_id = %ctx.shard_id, "No handlers attached, batch dropped");
            return DispatchSummary::default();
        }

        let tasks = self.handlers.iter().map(|handler| {
            let handler = handler.clone();
            let ctx = ctx.clone();
            let records = records.clone();
            let name = handler.name().to_string();
            let task = tokio::spawn(async move { handler.process(&ctx, &records).await });
            async move { (name, task.await) }
        });

        let mut summary = DispatchSummary {
            handlers: self.handlers.len(),
            failures: Vec::new(),
        };

        for (name, joined) in join_all(tasks).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    error!(
                        stream = %ctx.stream_name,
                        shard_id = %ctx.shard_id,
                        handler = %name,
                        error = %source,
                        "Handler failed"
                    );
                    summary.failures.push(HandlerError::Failed {
                        handler: name,
                        source,
                    });
                }
                Err(join_error) => {
                    error!(
                        stream = %ctx.stream_name,
                        shard_id = %ctx.shard_id,
                        handler = %name,
                        error = %join_error,
                        "Handler panicked"
                    );
                    summary.failures.push(HandlerError::Panicked { handler: name });
                }
            }
        }

        if !summary.all_succeeded() {
            info!(
                shard_id = %ctx.shard_id,
                failed = summary.failures.len(),
                handlers = summary.handlers,
                "Batch dispatched with handler failures"
            );
        }
        summary
    }
}
