//! Shard-parallel consumer
//!
//! [`ConsumeEngine`] runs one worker task per shard. Each worker:
//!
//! - resolves an iterator from the stored checkpoint, else from the
//!   configured starting position (root shards) or the trim horizon (shards
//!   created by a re-shard)
//! - reads batches, dispatching non-empty ones to every attached handler
//! - checkpoints its high-water mark on an interval
//! - terminates as `Exhausted` when its shard is sealed and fully read,
//!   `Stopped` on shutdown, or `Failed` on an unrecoverable remote error
//!
//! Workers are isolated: one shard failing never cancels its siblings. When a
//! shard is exhausted the engine refreshes the shard listing and starts the
//! children that have become ready.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::admin::{gateway_failure, StreamAdmin};
use crate::catalog::{ShardCatalog, ShardLineage};
use crate::client::StreamGateway;
use crate::error::{GatewayError, Result, StreamError};
use crate::handler::{BatchContext, HandlerSet};
use crate::model::{IteratorPosition, Record, RecordBatch, SequenceNumber, StartingPosition};
use crate::monitoring::{
    CheckpointStatus, IteratorEventType, MonitoringConfig, ProcessingEvent, ShardEventType,
};
use crate::retry::{pause, shutdown_requested, RetryConfig, RetryError, RetryHandle};
use crate::store::{CheckpointOutcome, CheckpointStore};

/// Largest GetRecords limit the service accepts
pub const MAX_GET_RECORDS_LIMIT: i32 = 10_000;

/// Configuration for the consumer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Name of the stream to consume
    pub stream_name: String,
    /// Where shards without a checkpoint start reading
    pub starting_position: StartingPosition,
    /// Pause between reads of one shard
    pub poll_interval: Duration,
    /// Minimum time between checkpoint writes for one shard
    pub checkpoint_interval: Duration,
    /// Maximum number of records per read
    pub batch_size: i32,
    pub retry: RetryConfig,
    /// How long shutdown waits for workers before aborting them
    pub shutdown_timeout: Duration,
    /// Maximum number of shards read concurrently
    pub max_concurrent_shards: Option<usize>,
    /// Resume from stored checkpoints instead of the starting position
    pub prefer_stored_checkpoint: bool,
    /// Start child shards once their parents are exhausted
    pub follow_reshards: bool,
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            starting_position: StartingPosition::default(),
            poll_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(60),
            batch_size: 1000,
            retry: RetryConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            max_concurrent_shards: None,
            prefer_stored_checkpoint: true,
            follow_reshards: true,
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(StreamError::ConfigError("stream_name must not be empty".into()));
        }
        if !(1..=MAX_GET_RECORDS_LIMIT).contains(&self.batch_size) {
            return Err(StreamError::ConfigError(format!(
                "batch_size must be within 1..={}, got {}",
                MAX_GET_RECORDS_LIMIT, self.batch_size
            )));
        }
        if self.max_concurrent_shards == Some(0) {
            return Err(StreamError::ConfigError(
                "max_concurrent_shards must be positive".into(),
            ));
        }
        if self.monitoring.enabled && self.monitoring.channel_size == 0 {
            return Err(StreamError::ConfigError(
                "monitoring channel_size must be positive".into(),
            ));
        }
        self.retry.validate().map_err(StreamError::ConfigError)
    }
}

/// Lifecycle of one shard worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardState {
    Starting,
    Polling,
    /// Shard sealed and read to the end
    Exhausted,
    /// Stopped on request
    Stopped,
    /// Unrecoverable error
    Failed(String),
}

impl ShardState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShardState::Exhausted | ShardState::Stopped | ShardState::Failed(_)
        )
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Starting => f.write_str("starting"),
            ShardState::Polling => f.write_str("polling"),
            ShardState::Exhausted => f.write_str("exhausted"),
            ShardState::Stopped => f.write_str("stopped"),
            ShardState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Final report of one shard worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOutcome {
    pub shard_id: String,
    pub state: ShardState,
    pub batches: u64,
    pub records: u64,
    /// Highest sequence number handed to the handlers
    pub last_sequence: Option<SequenceNumber>,
    /// Last position known to be stored
    pub checkpoint: Option<SequenceNumber>,
}

impl ShardOutcome {
    fn aborted(shard_id: &str) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            state: ShardState::Failed("worker aborted".to_string()),
            batches: 0,
            records: 0,
            last_sequence: None,
            checkpoint: None,
        }
    }
}

/// Result of a consume run
#[derive(Debug, Clone, Default)]
pub struct ConsumeReport {
    pub shards: BTreeMap<String, ShardOutcome>,
    /// Shutdown hit its timeout and remaining workers were aborted
    pub timed_out: bool,
}

impl ConsumeReport {
    pub fn outcome(&self, shard_id: &str) -> Option<&ShardOutcome> {
        self.shards.get(shard_id)
    }

    pub fn all_terminal(&self) -> bool {
        self.shards.values().all(|o| o.state.is_terminal())
    }

    pub fn total_records(&self) -> u64 {
        self.shards.values().map(|o| o.records).sum()
    }
}

/// Internal context shared by the engine and its workers
struct ConsumeContext<G: ?Sized, S: ?Sized> {
    gateway: Arc<G>,
    store: Arc<S>,
    handlers: HandlerSet,
    config: Arc<ConsumerConfig>,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<G: ?Sized, S: ?Sized> Clone for ConsumeContext<G, S> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            config: self.config.clone(),
            monitoring_tx: self.monitoring_tx.clone(),
        }
    }
}

impl<G: ?Sized, S: ?Sized> ConsumeContext<G, S> {
    /// Never waits for channel capacity; events are dropped while the receiver lags
    async fn send_monitoring_event(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.monitoring_tx {
            match tx.try_send(event) {
                Ok(()) => trace!("Sent monitoring event"),
                Err(TrySendError::Full(_)) => {
                    debug!("Monitoring channel full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Failed to send monitoring event, receiver dropped");
                }
            }
        }
    }
}

/// Shard-parallel consumer for one stream
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kinesis_shard_runtime::{
///     ConsumeEngine, ConsumerConfig, HandlerSet, InMemoryCheckpointStore, KinesisGateway,
///     StdoutHandler,
/// };
///
/// # async fn example() -> kinesis_shard_runtime::Result<()> {
/// let gateway = Arc::new(KinesisGateway::from_profile(None, Some("us-east-1")).await);
/// let store = Arc::new(InMemoryCheckpointStore::new());
/// let (engine, _events) = ConsumeEngine::new(
///     ConsumerConfig::new("orders"),
///     gateway,
///     store,
///     HandlerSet::new().with(StdoutHandler),
/// );
///
/// let handle = engine.start();
/// tokio::signal::ctrl_c().await.ok();
/// let report = handle.stop().await?;
/// println!("consumed {} records", report.total_records());
/// # Ok(())
/// # }
/// ```
pub struct ConsumeEngine<G, S>
where
    G: StreamGateway + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
{
    context: ConsumeContext<G, S>,
}

impl<G, S> ConsumeEngine<G, S>
where
    G: StreamGateway + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
{
    /// Creates a new engine
    ///
    /// Returns the engine and, when monitoring is enabled, the receiving end
    /// of its event channel.
    pub fn new(
        config: ConsumerConfig,
        gateway: Arc<G>,
        store: Arc<S>,
        handlers: HandlerSet,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        let (monitoring_tx, monitoring_rx) = if config.monitoring.enabled {
            let (tx, rx) = mpsc::channel(config.monitoring.channel_size.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let context = ConsumeContext {
            gateway,
            store,
            handlers,
            config: Arc::new(config),
            monitoring_tx,
        };
        (Self { context }, monitoring_rx)
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.context.config
    }

    /// Run in the background, returning a handle that can stop the run
    pub fn start(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_timeout = self.context.config.shutdown_timeout;
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        ConsumerHandle {
            shutdown_tx,
            task,
            shutdown_timeout,
        }
    }

    /// Consume until every worker is terminal or shutdown completes
    ///
    /// Fails only if the configuration is invalid, the stream is not ACTIVE,
    /// or the initial shard listing fails. Per-shard failures are reported in
    /// the returned [`ConsumeReport`].
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<ConsumeReport> {
        let config = self.context.config.clone();
        config.validate()?;
        info!(
            stream = %config.stream_name,
            starting_position = ?config.starting_position,
            handlers = ?self.context.handlers,
            "Starting consumer"
        );

        StreamAdmin::new(self.context.gateway.clone(), config.retry.clone())
            .ensure_active(&config.stream_name)
            .await?;

        let catalog = ShardCatalog::new(self.context.gateway.clone(), config.retry.clone());
        let mut lineage = catalog.snapshot(&config.stream_name).await?;
        info!(stream = %config.stream_name, shards = lineage.len(), "Discovered shards");

        let semaphore = config
            .max_concurrent_shards
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let mut workers: JoinSet<ShardOutcome> = JoinSet::new();
        let mut known: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut finished: HashSet<String> = HashSet::new();
        let mut report = ConsumeReport::default();

        known.extend(lineage.shards().iter().map(|s| s.shard_id.clone()));
        self.spawn_ready(&lineage, &known, &finished, &mut started, &mut workers, &semaphore, &shutdown);

        let mut shutdown_rx = shutdown.clone();
        let mut refresh_rx = shutdown.clone();
        let mut deadline: Option<Instant> = None;

        loop {
            if workers.is_empty() {
                break;
            }

            let joined = match deadline {
                None => tokio::select! {
                    joined = workers.join_next() => joined,
                    _ = shutdown_requested(&mut shutdown_rx) => {
                        info!(
                            stream = %config.stream_name,
                            active = workers.len(),
                            timeout = ?config.shutdown_timeout,
                            "Shutdown requested, waiting for shard workers"
                        );
                        deadline = Some(Instant::now() + config.shutdown_timeout);
                        continue;
                    }
                },
                Some(at) => match tokio::time::timeout_at(at, workers.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            stream = %config.stream_name,
                            remaining = workers.len(),
                            "Shutdown timed out, aborting remaining workers"
                        );
                        report.timed_out = true;
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                        break;
                    }
                },
            };

            let Some(joined) = joined else { break };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stream = %config.stream_name, error = %e, "Shard worker task failed");
                    continue;
                }
            };

            debug!(shard_id = %outcome.shard_id, state = %outcome.state, "Shard worker finished");
            let exhausted = outcome.state == ShardState::Exhausted;
            if exhausted {
                finished.insert(outcome.shard_id.clone());
            }
            report.shards.insert(outcome.shard_id.clone(), outcome);

            let stopping = deadline.is_some() || *shutdown.borrow();
            if exhausted && config.follow_reshards && !stopping {
                match catalog.snapshot_until(&config.stream_name, &mut refresh_rx).await {
                    Ok(refreshed) => {
                        lineage = refreshed;
                        known.extend(lineage.shards().iter().map(|s| s.shard_id.clone()));
                        self.spawn_ready(
                            &lineage,
                            &known,
                            &finished,
                            &mut started,
                            &mut workers,
                            &semaphore,
                            &shutdown,
                        );
                    }
                    Err(StreamError::Shutdown) => {
                        debug!(stream = %config.stream_name, "Shard listing refresh interrupted by shutdown");
                    }
                    Err(e) => {
                        warn!(stream = %config.stream_name, error = %e, "Failed to refresh shard listing");
                        self.spawn_ready(
                            &lineage,
                            &known,
                            &finished,
                            &mut started,
                            &mut workers,
                            &semaphore,
                            &shutdown,
                        );
                    }
                }
            }
        }

        for shard_id in started {
            report
                .shards
                .entry(shard_id.clone())
                .or_insert_with(|| ShardOutcome::aborted(&shard_id));
        }

        info!(
            stream = %config.stream_name,
            shards = report.shards.len(),
            records = report.total_records(),
            timed_out = report.timed_out,
            "Consumer finished"
        );
        Ok(report)
    }

    /// Start a worker for every ready shard not started yet
    ///
    /// Shards descending from a shard this run has listed start from the trim
    /// horizon when they have no checkpoint, so records written to them after
    /// the re-shard are not skipped. Only root shards use the configured
    /// starting position.
    #[allow(clippy::too_many_arguments)]
    fn spawn_ready(
        &self,
        lineage: &ShardLineage,
        known: &HashSet<String>,
        finished: &HashSet<String>,
        started: &mut HashSet<String>,
        workers: &mut JoinSet<ShardOutcome>,
        semaphore: &Option<Arc<Semaphore>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        for shard in lineage.ready_shards(finished) {
            if !started.insert(shard.shard_id.clone()) {
                continue;
            }
            let descendant = shard
                .parents()
                .any(|parent| known.contains(parent) || finished.contains(parent));
            let fallback = if descendant {
                IteratorPosition::TrimHorizon
            } else {
                IteratorPosition::from(self.context.config.starting_position)
            };
            let worker = ShardWorker::new(
                self.context.clone(),
                &shard.shard_id,
                fallback,
                shutdown.clone(),
            );
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                worker.run().await
            });
        }
    }
}

/// Handle to a consumer started with [`ConsumeEngine::start`]
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<ConsumeReport>>,
    shutdown_timeout: Duration,
}

impl ConsumerHandle {
    /// Ask every worker to stop at its next loop boundary
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("Consumer already finished");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait for the run to finish
    pub async fn stop(mut self) -> Result<ConsumeReport> {
        self.shutdown();
        // The run enforces shutdown_timeout itself; this bound only guards a stuck run.
        let limit = self.shutdown_timeout + Duration::from_secs(1);
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(joined) => joined?,
            Err(_) => {
                self.task.abort();
                Err(StreamError::Timeout(limit))
            }
        }
    }

    /// Wait for the run to finish on its own
    pub async fn join(self) -> Result<ConsumeReport> {
        self.task.await?
    }
}

/// Reads one shard until it reaches a terminal state
struct ShardWorker<G: ?Sized, S: ?Sized> {
    ctx: ConsumeContext<G, S>,
    shard_id: String,
    /// Position used when no checkpoint exists
    fallback: IteratorPosition,
    shutdown: watch::Receiver<bool>,
    high_water: Option<SequenceNumber>,
    persisted: Option<SequenceNumber>,
    last_checkpoint_at: Instant,
    batches: u64,
    records: u64,
}

impl<G, S> ShardWorker<G, S>
where
    G: StreamGateway + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
{
    fn new(
        ctx: ConsumeContext<G, S>,
        shard_id: &str,
        fallback: IteratorPosition,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            shard_id: shard_id.to_string(),
            fallback,
            shutdown,
            high_water: None,
            persisted: None,
            last_checkpoint_at: Instant::now(),
            batches: 0,
            records: 0,
        }
    }

    fn stream(&self) -> &str {
        &self.ctx.config.stream_name
    }

    async fn run(mut self) -> ShardOutcome {
        info!(stream = %self.stream(), shard_id = %self.shard_id, "Starting shard processing");
        self.ctx
            .send_monitoring_event(ProcessingEvent::shard_event(
                self.shard_id.clone(),
                ShardEventType::Started,
                None,
            ))
            .await;

        let state = self.poll().await;

        if matches!(state, ShardState::Exhausted | ShardState::Stopped) {
            self.checkpoint().await;
        }

        let (event_type, details) = match &state {
            ShardState::Exhausted => (ShardEventType::Exhausted, None),
            ShardState::Failed(reason) => (ShardEventType::Failed, Some(reason.clone())),
            _ => (ShardEventType::Stopped, None),
        };
        self.ctx
            .send_monitoring_event(ProcessingEvent::shard_event(
                self.shard_id.clone(),
                event_type,
                details,
            ))
            .await;

        info!(
            stream = %self.stream(),
            shard_id = %self.shard_id,
            state = %state,
            batches = self.batches,
            records = self.records,
            "Shard processing finished"
        );

        ShardOutcome {
            shard_id: self.shard_id,
            state,
            batches: self.batches,
            records: self.records,
            last_sequence: self.high_water,
            checkpoint: self.persisted,
        }
    }

    /// Main loop; returns the terminal state
    async fn poll(&mut self) -> ShardState {
        if *self.shutdown.borrow() {
            info!(shard_id = %self.shard_id, "Shutdown signal received before processing started");
            return ShardState::Stopped;
        }

        let position = match self.initial_position().await {
            Ok(position) => position,
            Err(e) => return self.fail(e),
        };

        let mut iterator = match self.resolve_iterator(&position).await {
            Ok(iterator) => {
                self.iterator_event(IteratorEventType::Initial, None).await;
                iterator
            }
            Err(StreamError::Shutdown) => return ShardState::Stopped,
            Err(e) => {
                self.iterator_event(IteratorEventType::Failed, Some(e.to_string())).await;
                return self.fail(e);
            }
        };

        trace!(shard_id = %self.shard_id, state = %ShardState::Polling, "Entering poll loop");
        loop {
            if *self.shutdown.borrow() {
                info!(shard_id = %self.shard_id, "Shutdown received in poll loop");
                return ShardState::Stopped;
            }

            let batch = match self.read(&iterator).await {
                Ok(batch) => batch,
                Err(RetryError::Fatal(GatewayError::ExpiredIterator(msg))) => {
                    warn!(shard_id = %self.shard_id, reason = %msg, "Iterator expired, re-resolving");
                    self.iterator_event(IteratorEventType::Expired, Some(msg)).await;
                    let position = self.resume_position();
                    match self.resolve_iterator(&position).await {
                        Ok(renewed) => {
                            iterator = renewed;
                            self.iterator_event(IteratorEventType::Renewed, None).await;
                            continue;
                        }
                        Err(StreamError::Shutdown) => return ShardState::Stopped,
                        Err(e) => {
                            self.iterator_event(IteratorEventType::Failed, Some(e.to_string()))
                                .await;
                            return self.fail(e);
                        }
                    }
                }
                Err(RetryError::Interrupted) => return ShardState::Stopped,
                Err(e) => {
                    let err = gateway_failure("GetRecords", self.stream(), Some(&self.shard_id), e);
                    return self.fail(err);
                }
            };

            let RecordBatch {
                records,
                next_iterator,
                millis_behind_latest,
            } = batch;

            if !records.is_empty() {
                self.dispatch(records, millis_behind_latest).await;
            }

            if self.last_checkpoint_at.elapsed() >= self.ctx.config.checkpoint_interval {
                self.checkpoint().await;
            }

            match next_iterator {
                Some(next) => iterator = next,
                None => {
                    info!(shard_id = %self.shard_id, "Shard exhausted");
                    return ShardState::Exhausted;
                }
            }

            if !pause(self.ctx.config.poll_interval, &mut self.shutdown).await {
                info!(shard_id = %self.shard_id, "Shutdown received while pausing");
                return ShardState::Stopped;
            }
        }
    }

    fn fail(&self, err: StreamError) -> ShardState {
        error!(
            stream = %self.stream(),
            shard_id = %self.shard_id,
            error = %err,
            "Shard worker failed"
        );
        ShardState::Failed(err.to_string())
    }

    async fn initial_position(&mut self) -> Result<IteratorPosition> {
        let configured = self.fallback.clone();
        if !self.ctx.config.prefer_stored_checkpoint {
            return Ok(configured);
        }

        match self
            .ctx
            .store
            .get_checkpoint(self.stream(), &self.shard_id)
            .await?
        {
            Some(sequence) => {
                info!(shard_id = %self.shard_id, checkpoint = %sequence, "Retrieved existing checkpoint");
                self.persisted = Some(sequence.clone());
                Ok(IteratorPosition::AfterSequenceNumber(sequence))
            }
            None => {
                info!(shard_id = %self.shard_id, position = configured.type_name(), "No existing checkpoint found");
                Ok(configured)
            }
        }
    }

    /// Position after everything already handed to handlers
    fn resume_position(&self) -> IteratorPosition {
        match self.high_water.as_ref().or(self.persisted.as_ref()) {
            Some(sequence) => IteratorPosition::AfterSequenceNumber(sequence.clone()),
            None => self.fallback.clone(),
        }
    }

    async fn resolve_iterator(&mut self, position: &IteratorPosition) -> Result<String> {
        let gateway = self.ctx.gateway.clone();
        let stream = self.ctx.config.stream_name.clone();
        let shard_id = self.shard_id.clone();

        let iterator = RetryHandle::from_config(&self.ctx.config.retry)
            .retry(
                || gateway.get_shard_iterator(&stream, &shard_id, position),
                &mut self.shutdown,
            )
            .await
            .map_err(|e| gateway_failure("GetShardIterator", &stream, Some(&shard_id), e))?;

        debug!(shard_id = %self.shard_id, position = position.type_name(), "Acquired shard iterator");
        Ok(iterator)
    }

    async fn read(&mut self, iterator: &str) -> std::result::Result<RecordBatch, RetryError<GatewayError>> {
        let gateway = self.ctx.gateway.clone();
        let limit = self.ctx.config.batch_size;
        RetryHandle::from_config(&self.ctx.config.retry)
            .retry(|| gateway.get_records(iterator, limit), &mut self.shutdown)
            .await
    }

    async fn dispatch(&mut self, records: Vec<Record>, millis_behind_latest: Option<i64>) {
        let started = Instant::now();
        let count = records.len();
        let last_sequence = records
            .iter()
            .filter_map(|r| r.sequence_number.as_ref())
            .max()
            .cloned();

        let ctx = BatchContext {
            stream_name: self.ctx.config.stream_name.clone(),
            shard_id: self.shard_id.clone(),
            millis_behind_latest,
        };
        let summary = self.ctx.handlers.dispatch(&ctx, Arc::new(records)).await;

        self.batches += 1;
        self.records += count as u64;
        if let Some(sequence) = last_sequence {
            if self.high_water.as_ref().map_or(true, |hw| sequence > *hw) {
                self.high_water = Some(sequence);
            }
        }

        debug!(
            shard_id = %self.shard_id,
            count,
            high_water = ?self.high_water,
            handler_failures = summary.failures.len(),
            "Dispatched batch"
        );
        self.ctx
            .send_monitoring_event(ProcessingEvent::batch_dispatched(
                self.shard_id.clone(),
                count,
                summary.failures.len(),
                started.elapsed(),
                millis_behind_latest,
            ))
            .await;
    }

    /// Persist the high-water mark if it is ahead of the stored position
    async fn checkpoint(&mut self) {
        self.last_checkpoint_at = Instant::now();

        let Some(sequence) = self.high_water.clone() else {
            return;
        };
        if self.persisted.as_ref().is_some_and(|p| *p >= sequence) {
            return;
        }

        let result = self
            .ctx
            .store
            .save_checkpoint(&self.ctx.config.stream_name, &self.shard_id, &sequence)
            .await;

        let status = match result {
            Ok(CheckpointOutcome::Advanced) => {
                debug!(shard_id = %self.shard_id, sequence = %sequence, "Checkpoint saved");
                self.persisted = Some(sequence.clone());
                CheckpointStatus::Advanced
            }
            Ok(outcome) => {
                debug!(shard_id = %self.shard_id, sequence = %sequence, outcome = ?outcome, "Checkpoint already at or past position");
                self.persisted = Some(sequence.clone());
                CheckpointStatus::Skipped
            }
            Err(e) if e.is_benign() => {
                debug!(shard_id = %self.shard_id, sequence = %sequence, error = %e, "Ignoring checkpoint regression");
                self.persisted = Some(sequence.clone());
                CheckpointStatus::Skipped
            }
            Err(e) => {
                warn!(
                    stream = %self.ctx.config.stream_name,
                    shard_id = %self.shard_id,
                    sequence = %sequence,
                    error = %e,
                    "Failed to save checkpoint"
                );
                self.ctx
                    .send_monitoring_event(ProcessingEvent::checkpoint(
                        self.shard_id.clone(),
                        sequence.to_string(),
                        CheckpointStatus::Failed,
                        Some(e.to_string()),
                    ))
                    .await;
                return;
            }
        };

        self.ctx
            .send_monitoring_event(ProcessingEvent::checkpoint(
                self.shard_id.clone(),
                sequence.to_string(),
                status,
                None,
            ))
            .await;
    }

    async fn iterator_event(&self, event_type: IteratorEventType, error: Option<String>) {
        self.ctx
            .send_monitoring_event(ProcessingEvent::iterator(self.shard_id.clone(), event_type, error))
            .await;
    }
}
