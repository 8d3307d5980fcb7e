use super::types::{
    CheckpointStatus, IteratorEventType, ProcessingEvent, ProcessingEventType, ShardEventType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Aggregated metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub batches_dispatched: u64,
    pub records_dispatched: u64,
    pub handler_failures: u64,
    pub dispatch_time: Duration,
    pub max_dispatch_time: Duration,
    pub millis_behind_latest: Option<i64>,

    pub checkpoints_advanced: u64,
    pub checkpoints_skipped: u64,
    pub checkpoints_failed: u64,
    pub last_checkpoint: Option<String>,

    pub iterator_renewals: u64,
    pub iterator_expirations: u64,
    pub iterator_failures: u64,

    /// Last lifecycle event seen for the shard
    pub state: Option<ShardEventType>,
    pub last_updated: Instant,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self {
            batches_dispatched: 0,
            records_dispatched: 0,
            handler_failures: 0,
            dispatch_time: Duration::default(),
            max_dispatch_time: Duration::default(),
            millis_behind_latest: None,
            checkpoints_advanced: 0,
            checkpoints_skipped: 0,
            checkpoints_failed: 0,
            last_checkpoint: None,
            iterator_renewals: 0,
            iterator_expirations: 0,
            iterator_failures: 0,
            state: None,
            last_updated: Instant::now(),
        }
    }
}

impl ShardMetrics {
    pub fn avg_dispatch_time(&self) -> Duration {
        if self.batches_dispatched == 0 {
            Duration::ZERO
        } else {
            self.dispatch_time.div_f64(self.batches_dispatched as f64)
        }
    }
}

/// Folds monitoring events into per-shard metrics and logs them periodically
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ShardMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Shared view of the metrics, readable while [`run`](Self::run) owns the aggregator
    pub fn metrics_handle(&self) -> Arc<RwLock<HashMap<String, ShardMetrics>>> {
        self.metrics.clone()
    }

    /// Consume events until every sender is dropped, then log a final summary
    pub async fn run(mut self) -> HashMap<String, ShardMetrics> {
        let mut ticker = interval(self.window_duration);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.emit_metrics().await;
                }
            }
        }

        self.emit_metrics().await;
        self.get_metrics().await
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let mut metrics = self.metrics.write().await;
        let shard_metrics = metrics.entry(event.shard_id.clone()).or_default();

        match event.event_type {
            ProcessingEventType::BatchDispatched {
                record_count,
                handler_failures,
                duration,
                millis_behind_latest,
            } => {
                shard_metrics.batches_dispatched += 1;
                shard_metrics.records_dispatched += record_count as u64;
                shard_metrics.handler_failures += handler_failures as u64;
                shard_metrics.dispatch_time += duration;
                shard_metrics.max_dispatch_time = shard_metrics.max_dispatch_time.max(duration);
                if millis_behind_latest.is_some() {
                    shard_metrics.millis_behind_latest = millis_behind_latest;
                }
                trace!(
                    shard_id = %event.shard_id,
                    records = record_count,
                    handler_failures,
                    duration_ms = duration.as_millis() as u64,
                    "Batch dispatched"
                );
            }
            ProcessingEventType::Checkpoint {
                sequence_number,
                status,
                error,
            } => match status {
                CheckpointStatus::Advanced => {
                    shard_metrics.checkpoints_advanced += 1;
                    shard_metrics.last_checkpoint = Some(sequence_number);
                }
                CheckpointStatus::Skipped => {
                    shard_metrics.checkpoints_skipped += 1;
                }
                CheckpointStatus::Failed => {
                    shard_metrics.checkpoints_failed += 1;
                    warn!(
                        shard_id = %event.shard_id,
                        sequence = %sequence_number,
                        error = ?error,
                        "Checkpoint failed"
                    );
                }
            },
            ProcessingEventType::Iterator { event_type, error } => match event_type {
                IteratorEventType::Initial => {
                    trace!(shard_id = %event.shard_id, "Initial iterator acquired");
                }
                IteratorEventType::Renewed => shard_metrics.iterator_renewals += 1,
                IteratorEventType::Expired => {
                    shard_metrics.iterator_expirations += 1;
                    debug!(shard_id = %event.shard_id, "Iterator expired");
                }
                IteratorEventType::Failed => {
                    shard_metrics.iterator_failures += 1;
                    warn!(shard_id = %event.shard_id, error = ?error, "Iterator operation failed");
                }
            },
            ProcessingEventType::ShardEvent {
                event_type,
                details,
            } => {
                shard_metrics.state = Some(event_type);
                match event_type {
                    ShardEventType::Failed => {
                        warn!(shard_id = %event.shard_id, details = ?details, "Shard worker failed");
                    }
                    _ => {
                        debug!(shard_id = %event.shard_id, state = ?event_type, "Shard state changed");
                    }
                }
            }
        }

        shard_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (shard_id, metrics) in metrics.iter() {
            info!(
                shard_id = %shard_id,
                state = ?metrics.state,
                batches = metrics.batches_dispatched,
                records = metrics.records_dispatched,
                avg_dispatch_ms = metrics.avg_dispatch_time().as_millis() as u64,
                max_dispatch_ms = metrics.max_dispatch_time.as_millis() as u64,
                millis_behind_latest = ?metrics.millis_behind_latest,
                checkpoints_advanced = metrics.checkpoints_advanced,
                checkpoints_failed = metrics.checkpoints_failed,
                last_checkpoint = ?metrics.last_checkpoint,
                "Shard metrics"
            );

            if metrics.handler_failures > 0 {
                warn!(
                    shard_id = %shard_id,
                    failures = metrics.handler_failures,
                    "Handler failures detected"
                );
            }
            if metrics.iterator_failures > 0 {
                warn!(
                    shard_id = %shard_id,
                    failures = metrics.iterator_failures,
                    "Iterator failures detected"
                );
            }
        }
    }

    /// Current metrics for all shards
    pub async fn get_metrics(&self) -> HashMap<String, ShardMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_shard_metrics(&self, shard_id: &str) -> Option<ShardMetrics> {
        self.metrics.read().await.get(shard_id).cloned()
    }
}
